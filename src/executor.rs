use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ExecutorConfig;
use crate::database::TemplateStore;
use crate::language::{LanguageProfile, LanguageRegistry};
use crate::sandbox::{RunOutcome, SandboxError, SandboxRunner, signal_name};
use crate::workspace::{Workspace, WorkspaceManager};

const TIMEOUT_MESSAGE: &str = "execution timed out";
const COMPILE_TIMEOUT_MESSAGE: &str = "compilation timed out";
const INFRASTRUCTURE_MESSAGE: &str = "sandbox failure, please try again later";

/// One execution request, either inline code or a stored template
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub code: Option<String>,
    pub language: Option<String>,
    pub stdin: Option<String>,
    /// When present, the template's code and language replace the inline ones
    pub template_id: Option<i64>,
}

/// Rejections caused by the request itself or by local storage
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("code is required")]
    MissingCode,
    #[error("language is required")]
    MissingLanguage,
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("template not found")]
    TemplateNotFound(i64),
    #[error("failed to prepare the execution workspace")]
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionKind {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ConfigurationError(ConfigurationError),
    InfrastructureError,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Success => "success",
            ExecutionKind::CompileError => "compile_error",
            ExecutionKind::RuntimeError => "runtime_error",
            ExecutionKind::Timeout => "timeout",
            ExecutionKind::ConfigurationError(_) => "configuration_error",
            ExecutionKind::InfrastructureError => "infrastructure_error",
        }
    }
}

/// Normalized outcome of [`Executor::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub kind: ExecutionKind,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    /// Name of the terminating signal, e.g. `SIGSEGV`
    pub signal: Option<String>,
    /// Synthesized description for outcomes without useful stderr
    pub message: Option<String>,
}

impl ExecutionResult {
    fn failure(kind: ExecutionKind, message: Option<String>) -> Self {
        Self {
            kind,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            message,
        }
    }

    fn rejected(error: ConfigurationError) -> Self {
        let message = error.to_string();
        Self::failure(ExecutionKind::ConfigurationError(error), Some(message))
    }

    fn infrastructure(phase: &str, error: SandboxError) -> Self {
        log::error!("Sandbox failure during {phase}: {error}");
        Self::failure(
            ExecutionKind::InfrastructureError,
            Some(INFRASTRUCTURE_MESSAGE.to_string()),
        )
    }

    pub fn is_success(&self) -> bool {
        self.kind == ExecutionKind::Success
    }

    /// HTTP status the front door reports for this outcome
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            ExecutionKind::Success => 200,
            ExecutionKind::CompileError | ExecutionKind::RuntimeError => 400,
            ExecutionKind::Timeout => 408,
            ExecutionKind::ConfigurationError(ConfigurationError::TemplateNotFound(_)) => 404,
            ExecutionKind::ConfigurationError(ConfigurationError::Storage) => 500,
            ExecutionKind::ConfigurationError(_) => 400,
            ExecutionKind::InfrastructureError => 500,
        }
    }

    /// Human-readable description of a failed execution
    pub fn error_message(&self) -> String {
        let fallback = || match (&self.kind, self.exit_code) {
            (ExecutionKind::CompileError, _) => "compilation failed".to_string(),
            (ExecutionKind::RuntimeError, Some(code)) => format!("process exited with code {code}"),
            (ExecutionKind::RuntimeError, None) => "process terminated abnormally".to_string(),
            (ExecutionKind::Timeout, _) => TIMEOUT_MESSAGE.to_string(),
            _ => String::new(),
        };

        match &self.kind {
            ExecutionKind::Success => String::new(),
            ExecutionKind::CompileError => non_empty(&self.stderr).unwrap_or_else(fallback),
            ExecutionKind::RuntimeError => self
                .message
                .clone()
                .or_else(|| non_empty(&self.stderr))
                .unwrap_or_else(fallback),
            _ => self.message.clone().unwrap_or_else(fallback),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.trim().is_empty()).then(|| s.to_string())
}

/// Time limits and output policy for every execution
#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub run_timeout: Duration,
    pub compile_timeout: Duration,
    /// Return output captured before a timeout instead of discarding it
    pub keep_partial_output: bool,
}

impl From<&ExecutorConfig> for ExecutionLimits {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            run_timeout: config.run_timeout_ms.into(),
            compile_timeout: config.compile_timeout_ms.into(),
            keep_partial_output: config.keep_partial_output,
        }
    }
}

/// Entry point of the subsystem: resolves, compiles, runs and classifies one request
pub struct Executor {
    registry: Arc<LanguageRegistry>,
    workspaces: WorkspaceManager,
    runner: Arc<dyn SandboxRunner>,
    templates: Arc<dyn TemplateStore>,
    limits: ExecutionLimits,
}

impl Executor {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        workspaces: WorkspaceManager,
        runner: Arc<dyn SandboxRunner>,
        templates: Arc<dyn TemplateStore>,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            registry,
            workspaces,
            runner,
            templates,
            limits,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// Executes one request; every failure is reported in the returned result
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let result = self.execute_inner(request).await;

        log::info!(
            "Execution finished as {} in {:?}",
            result.kind.as_str(),
            started.elapsed()
        );
        result
    }

    async fn execute_inner(&self, request: ExecutionRequest) -> ExecutionResult {
        let ExecutionRequest {
            code,
            language,
            stdin,
            template_id,
        } = request;

        // Step 1: Resolve the effective source
        let (code, language) = match self.resolve_source(code, language, template_id).await {
            Ok(source) => source,
            Err(result) => return result,
        };

        // Step 2: Resolve the language profile
        let profile = match self.registry.resolve(&language) {
            Ok(profile) => profile,
            Err(e) => return ExecutionResult::rejected(ConfigurationError::UnsupportedLanguage(e.0)),
        };

        // Step 3: Materialize the workspace
        let mut workspace = match self
            .workspaces
            .acquire(profile, &code, stdin.as_deref())
            .await
        {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Failed to acquire workspace: {e}");
                return ExecutionResult::rejected(ConfigurationError::Storage);
            }
        };

        // Step 4: Compile and run on a detached task, so a dropped request still
        // tears the sandbox down before the workspace is released
        let runner = self.runner.clone();
        let limits = self.limits;
        let profile = profile.clone();
        let task = tokio::spawn(async move {
            let result = compile_and_run(runner.as_ref(), limits, &workspace, &profile).await;
            workspace.release().await;
            result
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Execution task failed: {e}");
                ExecutionResult::failure(
                    ExecutionKind::InfrastructureError,
                    Some(INFRASTRUCTURE_MESSAGE.to_string()),
                )
            }
        }
    }

    async fn resolve_source(
        &self,
        code: Option<String>,
        language: Option<String>,
        template_id: Option<i64>,
    ) -> Result<(String, String), ExecutionResult> {
        let (code, language) = match template_id {
            Some(id) => match self.templates.find_template(id).await {
                Ok(Some(template)) => (Some(template.code), Some(template.language)),
                Ok(None) => {
                    log::info!("Template {id} not found");
                    return Err(ExecutionResult::rejected(
                        ConfigurationError::TemplateNotFound(id),
                    ));
                }
                Err(e) => {
                    log::error!("Failed to look up template {id}: {e}");
                    return Err(ExecutionResult::failure(
                        ExecutionKind::InfrastructureError,
                        Some("template store unavailable".to_string()),
                    ));
                }
            },
            None => (code, language),
        };

        let code = code
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ExecutionResult::rejected(ConfigurationError::MissingCode))?;
        let language = language
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| ExecutionResult::rejected(ConfigurationError::MissingLanguage))?;

        Ok((code, language))
    }
}

async fn compile_and_run(
    runner: &dyn SandboxRunner,
    limits: ExecutionLimits,
    workspace: &Workspace,
    profile: &LanguageProfile,
) -> ExecutionResult {
    if profile.is_compiled() {
        match runner
            .compile(workspace, profile, limits.compile_timeout)
            .await
        {
            Err(e) => return ExecutionResult::infrastructure("compilation", e),
            Ok(outcome) if outcome.timed_out => {
                return ExecutionResult::failure(
                    ExecutionKind::Timeout,
                    Some(COMPILE_TIMEOUT_MESSAGE.to_string()),
                );
            }
            Ok(outcome) if !outcome.success => {
                log::debug!("Compilation failed for workspace {}", workspace.token());
                return ExecutionResult {
                    stderr: outcome.output,
                    ..ExecutionResult::failure(ExecutionKind::CompileError, None)
                };
            }
            Ok(_) => {}
        }
    }

    match runner.run(workspace, profile, limits.run_timeout).await {
        Ok(outcome) => classify(outcome, limits.keep_partial_output),
        Err(e) => ExecutionResult::infrastructure("execution", e),
    }
}

/// Maps the raw outcome of the run phase to a final result
pub fn classify(outcome: RunOutcome, keep_partial_output: bool) -> ExecutionResult {
    let RunOutcome {
        stdout,
        stderr,
        exit_code,
        signal,
        timed_out,
        oom_killed,
        ..
    } = outcome;

    if timed_out {
        let (stdout, stderr) = if keep_partial_output {
            (stdout, stderr)
        } else {
            Default::default()
        };
        return ExecutionResult {
            stdout,
            stderr,
            ..ExecutionResult::failure(
                ExecutionKind::Timeout,
                Some(TIMEOUT_MESSAGE.to_string()),
            )
        };
    }

    if exit_code == Some(0) {
        return ExecutionResult {
            kind: ExecutionKind::Success,
            stdout,
            stderr,
            exit_code,
            signal: None,
            message: None,
        };
    }

    let message = if oom_killed {
        Some("memory limit exceeded")
    } else {
        match signal {
            Some(libc::SIGFPE) => Some("floating point exception"),
            Some(libc::SIGSEGV) => Some("segmentation fault"),
            _ => None,
        }
    };

    ExecutionResult {
        kind: ExecutionKind::RuntimeError,
        stdout,
        stderr,
        exit_code,
        signal: signal.map(signal_name),
        message: message.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn exited(code: i64, stderr: &str) -> RunOutcome {
        RunOutcome {
            stdout: "partial".to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(code),
            signal: crate::sandbox::signal_from_exit_code(code),
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_exit_is_success() {
        let result = classify(exited(0, ""), false);
        assert_eq!(result.kind, ExecutionKind::Success);
        assert_eq!(result.stdout, "partial");
        assert_eq!(result.status_code(), 200);
    }

    #[test]
    fn test_floating_point_exception() {
        let result = classify(exited(136, ""), false);
        assert_eq!(result.kind, ExecutionKind::RuntimeError);
        assert_eq!(result.signal.as_deref(), Some("SIGFPE"));
        assert_eq!(result.error_message(), "floating point exception");
        assert_eq!(result.status_code(), 400);
    }

    #[test]
    fn test_segmentation_fault() {
        let result = classify(exited(139, ""), false);
        assert_eq!(result.kind, ExecutionKind::RuntimeError);
        assert_eq!(result.signal.as_deref(), Some("SIGSEGV"));
        assert_eq!(result.error_message(), "segmentation fault");
    }

    #[test]
    fn test_other_failures_carry_stderr() {
        let result = classify(exited(1, "Traceback: boom\n"), false);
        assert_eq!(result.kind, ExecutionKind::RuntimeError);
        assert_eq!(result.signal, None);
        assert_eq!(result.message, None);
        assert_eq!(result.error_message(), "Traceback: boom\n");

        let aborted = classify(exited(134, ""), false);
        assert_eq!(aborted.signal.as_deref(), Some("SIGABRT"));
        assert_eq!(aborted.error_message(), "process exited with code 134");
    }

    #[test]
    fn test_oom_kill() {
        let mut outcome = exited(137, "");
        outcome.oom_killed = true;
        let result = classify(outcome, false);
        assert_eq!(result.kind, ExecutionKind::RuntimeError);
        assert_eq!(result.error_message(), "memory limit exceeded");
    }

    #[test]
    fn test_timeout_discards_partial_output() {
        let outcome = RunOutcome {
            stdout: "tick\ntick\n".to_string(),
            stderr: "warn".to_string(),
            timed_out: true,
            ..Default::default()
        };

        let discarded = classify(outcome.clone(), false);
        assert_eq!(discarded.kind, ExecutionKind::Timeout);
        assert_eq!(discarded.stdout, "");
        assert_eq!(discarded.stderr, "");
        assert_eq!(discarded.status_code(), 408);
        assert_eq!(discarded.error_message(), "execution timed out");

        let kept = classify(outcome, true);
        assert_eq!(kept.kind, ExecutionKind::Timeout);
        assert_eq!(kept.stdout, "tick\ntick\n");
    }

    #[test]
    fn test_status_codes_for_rejections() {
        let not_found = ExecutionResult::rejected(ConfigurationError::TemplateNotFound(7));
        assert_eq!(not_found.status_code(), 404);
        assert_eq!(not_found.error_message(), "template not found");

        let unsupported =
            ExecutionResult::rejected(ConfigurationError::UnsupportedLanguage("cobol".into()));
        assert_eq!(unsupported.status_code(), 400);
        assert_eq!(unsupported.error_message(), "unsupported language: cobol");

        assert_eq!(
            ExecutionResult::rejected(ConfigurationError::Storage).status_code(),
            500
        );
    }
}
