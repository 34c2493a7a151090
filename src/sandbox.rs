mod demux;
mod docker_runner;

pub use demux::{Channel, OutputBuffers};
pub use docker_runner::{DockerRunner, SandboxPolicy};

use std::time::Duration;

use async_trait::async_trait;

use crate::language::LanguageProfile;
use crate::workspace::Workspace;

/// Result of the compile phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOutcome {
    pub success: bool,
    /// Compiler diagnostics: stderr, or stdout when the compiler wrote nothing to stderr
    pub output: String,
    pub timed_out: bool,
}

/// Result of the run phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Exit status reported by the sandbox; `None` when the program was killed on timeout
    pub exit_code: Option<i64>,
    /// Terminating signal decoded from the exit status
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub oom_killed: bool,
    /// At least one stream exceeded the output cap
    pub truncated: bool,
}

/// Failures of the sandbox host itself, unrelated to the submitted program
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),
    #[error("image {image} is not available: {reason}")]
    Image { image: String, reason: String },
    #[error("workspace path {0} is not valid UTF-8")]
    InvalidPath(String),
    #[error("container {0} exited without reporting a status")]
    MissingStatus(String),
}

/// Compiles and runs programs inside an isolation boundary
///
/// Implementations own the whole lifecycle of their sandbox instances: whatever
/// happens, no instance may outlive the call that created it.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Runs the profile's compile step against the workspace, writing artifacts to its build directory
    async fn compile(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        limit: Duration,
    ) -> Result<CompileOutcome, SandboxError>;

    /// Runs the program with the workspace's stdin file as standard input
    async fn run(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        limit: Duration,
    ) -> Result<RunOutcome, SandboxError>;
}

/// Decodes the conventional `128 + n` exit status of a process killed by signal `n`
pub fn signal_from_exit_code(code: i64) -> Option<i32> {
    match code {
        129..=192 => i32::try_from(code - 128).ok(),
        _ => None,
    }
}

pub fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        _ => return format!("SIG{signal}"),
    };
    name.to_string()
}
