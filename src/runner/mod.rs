//! Step runner
//!
//! Runs a static, ordered list of steps:
//!
//! ```text
//! Idle -> Preparing -> Executing(0) -> ... -> Executing(n-1) -> Completed
//!             \               \                    \
//!              `---------------`--------------------`--> Aborted
//! ```
//!
//! Every step is fetched into a fresh working directory, run as a
//! subprocess and validated. The first failure aborts the run; the working
//! directory is removed exactly once either way, and a cleanup failure after
//! an abort never replaces the abort cause.

pub mod executor;

pub use executor::{
    ExecutionResult, Invocation, LogVerdict, ShellExecutor, StepExecutor, check_results_log,
    judge_results_log, run_program,
};

use std::fmt;
use std::path::Path;
use tracing::{error, info, warn};

use crate::PrepError;
use crate::config::{PlatformContext, Step, WORKDIR_PREFIX};
use crate::error::{CleanupError, StepExecutionError};
use crate::fetch::{Fetch, FetchTarget};
use crate::workdir::WorkingDirectory;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Preparing,
    /// Running the step at this index
    Executing(usize),
    Completed,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Preparing => write!(f, "preparing"),
            RunState::Executing(i) => write!(f, "executing step {}", i),
            RunState::Completed => write!(f, "completed"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

/// How a run ended
#[derive(Debug)]
pub struct RunReport {
    /// Terminal state
    pub state: RunState,
    /// Number of steps that ran to success
    pub steps_completed: usize,
    /// Primary cause of an abort
    pub error: Option<PrepError>,
    /// Cleanup failure that followed an abort
    pub cleanup_error: Option<CleanupError>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Turn an aborted run into its primary error
    pub fn into_result(self) -> Result<usize, PrepError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.steps_completed),
        }
    }
}

/// Drives the step list
pub struct StepRunner<'a> {
    ctx: &'a PlatformContext,
    fetcher: &'a dyn Fetch,
    executor: &'a dyn StepExecutor,
    use_blob_store: bool,
    state: RunState,
    history: Vec<RunState>,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        ctx: &'a PlatformContext,
        fetcher: &'a dyn Fetch,
        executor: &'a dyn StepExecutor,
    ) -> Self {
        Self {
            ctx,
            fetcher,
            executor,
            use_blob_store: false,
            state: RunState::Idle,
            history: vec![RunState::Idle],
        }
    }

    /// Fetch step sources from the blob store
    pub fn use_blob_store(mut self, enabled: bool) -> Self {
        self.use_blob_store = enabled;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    fn transition(&mut self, next: RunState) {
        info!("Pipeline {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Run every step in order
    pub async fn run(&mut self, steps: &[Step]) -> RunReport {
        self.transition(RunState::Preparing);
        let workdir = match self.prepare() {
            Ok(dir) => dir,
            Err(e) => {
                error!("Preparation failed: {}", e);
                self.transition(RunState::Aborted);
                return RunReport {
                    state: RunState::Aborted,
                    steps_completed: 0,
                    error: Some(e),
                    cleanup_error: None,
                };
            }
        };

        let mut completed = 0;
        let mut outcome = Ok(());
        for (index, step) in steps.iter().enumerate() {
            self.transition(RunState::Executing(index));
            if let Err(e) = self.execute(index, step, workdir.path()).await {
                outcome = Err(e);
                break;
            }
            completed += 1;
        }

        info!("Cleaning up working directory");
        let cleanup = workdir.destroy();

        let (error, cleanup_error) = match (outcome, cleanup) {
            (Ok(()), Ok(())) => (None, None),
            (Ok(()), Err(c)) => (Some(PrepError::from(c)), None),
            (Err(e), Ok(())) => (Some(e), None),
            (Err(e), Err(c)) => {
                warn!("Cleanup after abort also failed: {}", c);
                (Some(e), Some(c))
            }
        };

        let state = match &error {
            None => RunState::Completed,
            Some(e) => {
                error!("{}", e);
                RunState::Aborted
            }
        };
        self.transition(state);

        RunReport {
            state,
            steps_completed: completed,
            error,
            cleanup_error,
        }
    }

    fn prepare(&self) -> Result<WorkingDirectory, PrepError> {
        for dir in [self.ctx.log_dir(), self.ctx.working_base()] {
            std::fs::create_dir_all(&dir).map_err(|source| crate::error::SetupError::Create {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(WorkingDirectory::create(
            &self.ctx.working_base(),
            WORKDIR_PREFIX,
        )?)
    }

    async fn execute(&self, index: usize, step: &Step, workdir: &Path) -> Result<(), PrepError> {
        let fail = |cause: PrepError| PrepError::step(index, step.source(), cause);

        info!("Step {}: {}", index, step.source());
        for (key, value) in step.parameters().iter() {
            info!("    {} = {}", key, value);
        }

        let target = FetchTarget::new(step.source(), workdir.join(step.file_name()))
            .from_blob_store(self.use_blob_store);
        let fetched = self
            .fetcher
            .fetch(&target)
            .await
            .map_err(|e| fail(e.into()))?;

        // A stale log from an earlier run must not count as this run's result
        if let Some(log) = step.results_log() {
            if log.exists() {
                tokio::fs::remove_file(log)
                    .await
                    .map_err(|e| fail(e.into()))?;
            }
        }

        let invocation = Invocation::new(
            self.ctx.interpreter.as_deref(),
            &fetched.local_path,
            step.parameters(),
            self.ctx.platform.quoting(),
        );
        let command = invocation.command_line();
        let result = self
            .executor
            .execute(&invocation)
            .await
            .map_err(|e| fail(e.into()))?;

        if !result.success() {
            return Err(fail(
                StepExecutionError::NonZeroExit {
                    command,
                    code: result.exit_code,
                }
                .into(),
            ));
        }

        if let Some(log) = step.results_log() {
            check_results_log(log, &command)
                .await
                .map_err(|e| fail(e.into()))?;
        }

        info!("Step {} complete", index);
        Ok(())
    }
}
