//! Package installation
//!
//! Installs packages with the system's yum-family package manager.

use tracing::{debug, info, warn};

use crate::PrepError;

/// Detected package manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Dnf,
    Yum,
}

impl PackageManager {
    /// Detect the system's package manager
    pub async fn detect() -> Option<Self> {
        if command_exists("dnf").await {
            return Some(Self::Dnf);
        }
        if command_exists("yum").await {
            return Some(Self::Yum);
        }
        None
    }

    fn program(&self) -> &'static str {
        match self {
            Self::Dnf => "dnf",
            Self::Yum => "yum",
        }
    }

    /// Arguments installing `packages` non-interactively
    pub fn install_args(&self, packages: &[String]) -> Vec<String> {
        let mut args = vec!["-y".to_string(), "install".to_string()];
        args.extend(packages.iter().cloned());
        args
    }
}

async fn command_exists(cmd: &str) -> bool {
    tokio::process::Command::new("which")
        .arg(cmd)
        .output()
        .await
        .is_ok_and(|o| o.status.success())
}

/// Install packages
pub async fn install_packages(packages: &[String]) -> Result<(), PrepError> {
    if packages.is_empty() {
        return Ok(());
    }

    let pm = PackageManager::detect()
        .await
        .ok_or_else(|| PrepError::Command("No supported package manager found".to_string()))?;

    info!("Installing {} packages using {:?}", packages.len(), pm);
    debug!("Packages: {:?}", packages);

    super::run_command(pm.program(), &pm.install_args(packages)).await?;

    info!("Successfully installed {} packages", packages.len());
    Ok(())
}

/// Install packages, logging instead of failing
pub async fn install_optional(packages: &[String]) {
    if let Err(e) = install_packages(packages).await {
        warn!("Optional packages {:?} not installed: {}", packages, e);
    }
}
