#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use codexec::database::{self as db, SqliteTemplateStore, StoreError, Template, TemplateStore};
use codexec::executor::{ExecutionLimits, Executor};
use codexec::language::{LanguageProfile, LanguageRegistry};
use codexec::sandbox::{
    CompileOutcome, RunOutcome, SandboxError, SandboxRunner, signal_from_exit_code,
};
use codexec::workspace::{Workspace, WorkspaceManager};

/// Sandbox stand-in whose behaviour is picked by markers in the submitted source
///
/// * `COMPILE_ERROR` fails compilation with the source as diagnostics
/// * `COMPILE_HANG` times out compilation
/// * `HANG` times out the run with some partial output
/// * `EXIT <n>` exits with status `n`
/// * `HOST_FAILURE` fails the run with a sandbox error
///
/// Anything else succeeds, echoing the source's first line and then stdin.
#[derive(Default)]
pub struct ScriptedRunner {
    pub compiles: AtomicUsize,
    pub runs: AtomicUsize,
    /// Runs that got past the delay with their workspace still on disk
    pub finished: AtomicUsize,
    pub delay: Option<Duration>,
}

impl ScriptedRunner {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

async fn read(path: &Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap()
}

#[async_trait]
impl SandboxRunner for ScriptedRunner {
    async fn compile(
        &self,
        workspace: &Workspace,
        _profile: &LanguageProfile,
        _limit: Duration,
    ) -> Result<CompileOutcome, SandboxError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let source = read(workspace.source_path()).await;

        if source.contains("COMPILE_HANG") {
            return Ok(CompileOutcome {
                timed_out: true,
                ..Default::default()
            });
        }
        if source.contains("COMPILE_ERROR") {
            return Ok(CompileOutcome {
                success: false,
                output: format!("{}: error: expected ';'\n", workspace.source_name()),
                timed_out: false,
            });
        }

        let build_dir = workspace.build_dir().expect("compiled languages get a build dir");
        tokio::fs::write(build_dir.join("artifact"), b"bin").await.unwrap();
        Ok(CompileOutcome {
            success: true,
            ..Default::default()
        })
    }

    async fn run(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        _limit: Duration,
    ) -> Result<RunOutcome, SandboxError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if workspace.dir().exists() {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        if profile.is_compiled() {
            let artifact = workspace.build_dir().unwrap().join("artifact");
            assert!(artifact.exists(), "run must follow a successful compile");
        }

        let source = read(workspace.source_path()).await;
        let stdin = read(workspace.stdin_path()).await;

        if source.contains("HOST_FAILURE") {
            return Err(SandboxError::MissingStatus("codexec-fake-run".to_string()));
        }
        if source.contains("HANG") {
            return Ok(RunOutcome {
                stdout: "tick\n".to_string(),
                timed_out: true,
                ..Default::default()
            });
        }
        if let Some(code) = source
            .split_whitespace()
            .skip_while(|w| *w != "EXIT")
            .nth(1)
            .and_then(|n| n.parse::<i64>().ok())
        {
            return Ok(RunOutcome {
                stderr: if code == 1 { "boom\n".to_string() } else { String::new() },
                exit_code: Some(code),
                signal: signal_from_exit_code(code),
                ..Default::default()
            });
        }

        let first_line = source.lines().next().unwrap_or_default();
        Ok(RunOutcome {
            stdout: format!("{first_line}|{stdin}"),
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

/// Template store that is always down
pub struct BrokenStore;

#[async_trait]
impl TemplateStore for BrokenStore {
    async fn find_template(&self, _id: i64) -> Result<Option<Template>, StoreError> {
        Err(StoreError::from(sqlx::Error::PoolClosed))
    }
}

pub fn test_limits() -> ExecutionLimits {
    ExecutionLimits {
        run_timeout: Duration::from_millis(500),
        compile_timeout: Duration::from_secs(5),
        keep_partial_output: false,
    }
}

pub struct Harness {
    pub executor: Arc<Executor>,
    pub runner: Arc<ScriptedRunner>,
    pub pool: sqlx::SqlitePool,
    pub root: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_runner(ScriptedRunner::default()).await
    }

    pub async fn with_runner(runner: ScriptedRunner) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspaces");
        let pool = db::init_memory_db().await.unwrap();
        let runner = Arc::new(runner);

        let executor = Arc::new(Executor::new(
            Arc::new(LanguageRegistry::default()),
            WorkspaceManager::new(&root),
            runner.clone(),
            Arc::new(SqliteTemplateStore::new(pool.clone())),
            test_limits(),
        ));

        Self {
            executor,
            runner,
            pool,
            root,
            _dir: dir,
        }
    }

    /// Number of workspaces left on disk
    pub fn leftover_workspaces(&self) -> usize {
        match std::fs::read_dir(&self.root) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}
