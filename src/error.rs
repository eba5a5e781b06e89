//! Error types for systemprep

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for systemprep operations
#[derive(Error, Debug)]
pub enum PrepError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Blob store error: {0}")]
    Blob(#[from] crate::fetch::BlobError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    ConfigPatch(#[from] ConfigPatchError),

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error(transparent)]
    StepExecution(#[from] StepExecutionError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Step {index} ({url}) failed: {cause}")]
    Step {
        index: usize,
        url: String,
        #[source]
        cause: Box<PrepError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Command execution failed: {0}")]
    Command(String),

    #[error("Template error: {0}")]
    Template(String),
}

impl PrepError {
    /// Wrap an error with the step that produced it
    pub fn step(index: usize, url: impl Into<String>, cause: impl Into<PrepError>) -> Self {
        Self::Step {
            index,
            url: url.into(),
            cause: Box::new(cause.into()),
        }
    }
}

/// Resource retrieval failures
#[derive(Error, Debug)]
pub enum FetchError {
    #[error(
        "Unable to download file from blob store (url = {url}, bucket = {bucket}, key = {key}): {cause}"
    )]
    BlobStoreUnavailable {
        url: String,
        bucket: String,
        key: String,
        cause: String,
    },

    #[error("Unable to download file from web server (url = {url}): {cause}")]
    WebUnavailable { url: String, cause: String },
}

/// Archive extraction failures
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Could not extract {path:?}: no extractor for this file suffix")]
    UnsupportedFormat { path: PathBuf },

    #[error("Extraction target {path:?} exists and is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("Failed to extract {path:?}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration region patch failures
#[derive(Error, Debug)]
pub enum ConfigPatchError {
    #[error("No line matching {pattern:?} found in {path:?}")]
    RegionNotFound { path: PathBuf, pattern: String },

    #[error("Invalid region marker {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Could not back up {path:?}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not write config file {path:?}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Working directory creation failures
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Base directory {0:?} does not exist")]
    BaseMissing(PathBuf),

    #[error("Could not create directory in {path:?}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Working directory removal failure
#[derive(Error, Debug)]
#[error("Cleanup of {path:?} failed: {source}")]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Step execution failures
#[derive(Error, Debug)]
pub enum StepExecutionError {
    #[error("Could not launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Encountered an unrecoverable error executing a content step (exit code {code:?}). Command executed: {command}"
    )]
    NonZeroExit { command: String, code: Option<i32> },

    #[error("Failed states reported in results log {log:?}. Command executed: {command}")]
    FailureMarkerInLog { command: String, log: PathBuf },

    #[error("No successful states reported in results log {log:?}. Command executed: {command}")]
    NoSuccessMarker { command: String, log: PathBuf },

    #[error("Could not open results log {log:?}: {source}")]
    LogUnreadable {
        log: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parameter parsing and schema decoding failures
#[derive(Error, Debug)]
pub enum ParameterError {
    #[error("Encountered an invalid parameter: {0}")]
    InvalidToken(String),

    #[error("Invalid value for `{key}`: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Parameters do not match step schema: {0}")]
    Schema(#[from] serde_json::Error),
}

/// Unrecognized operating system or distribution
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("System, {0}, is not recognized")]
    UnsupportedSystem(String),

    #[error("Unsupported OS distribution: {0}")]
    UnsupportedDistribution(String),

    #[error("Required environment variable {0} is not set")]
    MissingEnv(&'static str),
}
