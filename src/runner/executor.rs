//! Step invocation and result validation

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{ParameterSet, Quoting};
use crate::error::StepExecutionError;

/// Marker of a failed state in a salt results log
pub const FAILURE_MARKER: &str = r#""result": false"#;

/// Marker of a successful state in a salt results log
pub const SUCCESS_MARKER: &str = r#""result": true"#;

/// A fully resolved step command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub interpreter: Option<String>,
    pub script: PathBuf,
    /// `key='value'` tokens
    pub arguments: Vec<String>,
}

impl Invocation {
    pub fn new(
        interpreter: Option<&str>,
        script: &Path,
        parameters: &ParameterSet,
        quoting: Quoting,
    ) -> Self {
        Self {
            interpreter: interpreter.map(str::to_string),
            script: script.to_path_buf(),
            arguments: parameters.to_tokens(quoting),
        }
    }

    /// The command line as handed to the shell
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.arguments.len() + 2);
        if let Some(interpreter) = &self.interpreter {
            parts.push(interpreter.clone());
        }
        parts.push(self.script.display().to_string());
        parts.extend(self.arguments.iter().cloned());
        parts.join(" ")
    }
}

/// Outcome of running a step process
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Exit code; `None` if the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs step invocations
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, invocation: &Invocation)
    -> Result<ExecutionResult, StepExecutionError>;
}

/// Runs invocations through the platform shell
pub struct ShellExecutor {
    shell: Vec<String>,
}

impl ShellExecutor {
    /// `shell` is the program plus its leading args, e.g. `["sh", "-c"]`
    pub fn new(shell: Vec<String>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
    ) -> Result<ExecutionResult, StepExecutionError> {
        let command = invocation.command_line();
        let (program, leading) =
            self.shell
                .split_first()
                .ok_or_else(|| StepExecutionError::Spawn {
                    command: command.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "no shell configured",
                    ),
                })?;

        let mut args = leading.to_vec();
        args.push(command);
        run_program(program, &args).await
    }
}

/// Run `program` with `args` directly, capturing its output.
///
/// A non-zero exit is not an error here; callers decide what it means.
pub async fn run_program(
    program: &str,
    args: &[String],
) -> Result<ExecutionResult, StepExecutionError> {
    let command = display_command(program, args);
    info!("Running: {}", command);

    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| StepExecutionError::Spawn { command, source })?;

    let result = ExecutionResult {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    for line in result.stdout.lines() {
        debug!("stdout: {}", line);
    }
    if !result.success() {
        for line in result.stderr.lines() {
            warn!("stderr: {}", line);
        }
    }
    Ok(result)
}

pub(crate) fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// What a results log says about a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogVerdict {
    Succeeded,
    /// At least one failure marker
    Failed,
    /// No failure, but nothing succeeded either
    NoSuccess,
}

/// Scan raw results log text for failure and success markers
pub fn judge_results_log(text: &str) -> LogVerdict {
    if text.contains(FAILURE_MARKER) {
        LogVerdict::Failed
    } else if text.contains(SUCCESS_MARKER) {
        LogVerdict::Succeeded
    } else {
        LogVerdict::NoSuccess
    }
}

/// Read and judge the results log at `log`
pub async fn check_results_log(log: &Path, command: &str) -> Result<(), StepExecutionError> {
    let text = tokio::fs::read_to_string(log)
        .await
        .map_err(|source| StepExecutionError::LogUnreadable {
            log: log.to_path_buf(),
            source,
        })?;

    match judge_results_log(&text) {
        LogVerdict::Succeeded => {
            info!("States applied successfully, details in {}", log.display());
            Ok(())
        }
        LogVerdict::Failed => Err(StepExecutionError::FailureMarkerInLog {
            command: command.to_string(),
            log: log.to_path_buf(),
        }),
        LogVerdict::NoSuccess => Err(StepExecutionError::NoSuccessMarker {
            command: command.to_string(),
            log: log.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_judge_success() {
        let log = r#"{"local": {"pkg_|-vim": {"result": true, "comment": "ok"}}}"#;
        assert_eq!(judge_results_log(log), LogVerdict::Succeeded);
    }

    #[test]
    fn test_judge_failure_wins() {
        let log = "{\"a\": {\"result\": true}}\n{\"b\": {\"result\": false}}\n";
        assert_eq!(judge_results_log(log), LogVerdict::Failed);
    }

    #[test]
    fn test_judge_empty() {
        assert_eq!(judge_results_log(""), LogVerdict::NoSuccess);
        // markers are literal; other spacing does not count
        assert_eq!(judge_results_log(r#"{"result":true}"#), LogVerdict::NoSuccess);
    }

    #[test]
    fn test_command_line() {
        let params = ParameterSet::new().with("saltstates", "none");
        let invocation = Invocation::new(
            Some("python"),
            Path::new("/var/systemprep/workingfiles/run-abc/install.py"),
            &params,
            Quoting::Posix,
        );
        assert_eq!(
            invocation.command_line(),
            "python /var/systemprep/workingfiles/run-abc/install.py saltstates='none'"
        );

        let bare = Invocation::new(
            None,
            Path::new("/tmp/step.sh"),
            &ParameterSet::new(),
            Quoting::Posix,
        );
        assert_eq!(bare.command_line(), "/tmp/step.sh");
    }

    #[test]
    fn test_command_line_for_powershell() {
        let params = ParameterSet::new().with("ashrole", "Bob's Server");
        let invocation = Invocation::new(
            Some("powershell.exe"),
            Path::new("install.ps1"),
            &params,
            Quoting::PowerShell,
        );
        assert_eq!(
            invocation.command_line(),
            "powershell.exe install.ps1 ashrole='Bob''s Server'"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_exit_codes() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("step.sh");
        std::fs::write(&script, "echo \"got $1\"\nexit 3\n").unwrap();

        let executor = ShellExecutor::new(vec!["sh".into(), "-c".into()]);
        let params = ParameterSet::new().with("name", "it's here");
        let result = executor
            .execute(&Invocation::new(Some("sh"), &script, &params, Quoting::Posix))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success());
        assert_eq!(result.stdout.trim(), "got name=it's here");
    }

    #[tokio::test]
    async fn test_check_results_log_missing_file() {
        let err = check_results_log(Path::new("/nonexistent/results.log"), "cmd")
            .await
            .unwrap_err();
        assert!(matches!(err, StepExecutionError::LogUnreadable { .. }));
    }
}
