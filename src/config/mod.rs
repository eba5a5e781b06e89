//! Static configuration: platform paths, parameters and the step list
//!
//! Everything here is built once at startup and passed by reference to the
//! components that need it.

pub mod params;
pub mod steps;

pub use params::{ParameterSet, Quoting, Value};
pub use steps::Step;

use crate::error::PlatformError;
use std::fmt;
use std::path::{Path, PathBuf};

/// Linux base directory for systemprep state
pub const LINUX_PREP_DIR: &str = "/var/systemprep";

/// Prefix for per-run working directories
pub const WORKDIR_PREFIX: &str = "systemprep-";

/// Operating system family the orchestrator runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    /// How step arguments are quoted on this platform's command line
    pub fn quoting(&self) -> Quoting {
        match self {
            Platform::Linux => Quoting::Posix,
            Platform::Windows => Quoting::PowerShell,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "Linux"),
            Platform::Windows => write!(f, "Windows"),
        }
    }
}

/// OS-specific paths and commands
#[derive(Debug, Clone)]
pub struct PlatformContext {
    pub platform: Platform,
    /// Root of systemprep state (default: /var/systemprep)
    pub prep_dir: PathBuf,
    /// Shell command that schedules the reboot
    pub restart_command: String,
    /// Program used to run a content step, if the step is not executable itself
    pub interpreter: Option<String>,
    /// Shell used to run step command lines (program plus leading args)
    pub shell: Vec<String>,
}

impl PlatformContext {
    /// Detect the running platform
    pub fn detect() -> Result<Self, PlatformError> {
        match std::env::consts::OS {
            "linux" => Ok(Self::linux()),
            "windows" => Self::windows(),
            other => Err(PlatformError::UnsupportedSystem(other.to_string())),
        }
    }

    /// Linux defaults
    pub fn linux() -> Self {
        Self::linux_with_base(LINUX_PREP_DIR)
    }

    /// Linux layout rooted elsewhere (useful for testing)
    pub fn linux_with_base(prep_dir: impl AsRef<Path>) -> Self {
        Self {
            platform: Platform::Linux,
            prep_dir: prep_dir.as_ref().to_path_buf(),
            restart_command: "shutdown -r +1 &".to_string(),
            interpreter: Some("python".to_string()),
            shell: vec!["sh".to_string(), "-c".to_string()],
        }
    }

    fn windows() -> Result<Self, PlatformError> {
        let system_drive =
            std::env::var("SYSTEMDRIVE").map_err(|_| PlatformError::MissingEnv("SYSTEMDRIVE"))?;
        let system_root =
            std::env::var("SYSTEMROOT").map_err(|_| PlatformError::MissingEnv("SYSTEMROOT"))?;
        Ok(Self::windows_with_roots(&system_drive, &system_root))
    }

    /// Windows layout for the given `%SYSTEMDRIVE%` and `%SYSTEMROOT%`
    pub fn windows_with_roots(system_drive: &str, system_root: &str) -> Self {
        Self {
            platform: Platform::Windows,
            prep_dir: PathBuf::from(format!("{}\\SystemPrep", system_drive)),
            restart_command: format!(
                "{}\\system32\\shutdown.exe /r /t 30 /d p:2:4 /c \"SystemPrep complete. Rebooting computer.\"",
                system_root
            ),
            interpreter: Some(
                "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe".to_string(),
            ),
            shell: vec!["cmd".to_string(), "/C".to_string()],
        }
    }

    /// Log directory
    pub fn log_dir(&self) -> PathBuf {
        self.prep_subdir("logs", "Logs")
    }

    /// Directory under which per-run working directories are created
    pub fn working_base(&self) -> PathBuf {
        self.prep_subdir("workingfiles", "WorkingFiles")
    }

    fn prep_subdir(&self, linux: &str, windows: &str) -> PathBuf {
        match self.platform {
            Platform::Linux => self.prep_dir.join(linux),
            Platform::Windows => PathBuf::from(format!("{}\\{}", self.prep_dir.display(), windows)),
        }
    }
}
