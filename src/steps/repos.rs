//! Package repository definitions
//!
//! Installs the yum repo files that apply to the running distribution. The
//! distribution and version come from the first line of the system release
//! file; each entry of `yumrepomap` names a repo file and the dist (and
//! optionally the EPEL major version) it belongs to.

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::PrepError;
use crate::config::params::de;
use crate::error::PlatformError;
use crate::fetch::{Fetch, FetchTarget};

/// Matches everything in the map
const ALL: &str = "all";

static SUPPORTED_RELEASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(amazon|centos|red hat)(?:[^0-9]+)(\d+\.\d+)").expect("release pattern is valid")
});

/// Amazon Linux releases and the EPEL major version they track
const AMAZON_EPEL_VERSIONS: &[(&str, &str)] = &[
    ("2014.03", "6"),
    ("2014.09", "6"),
    ("2015.03", "6"),
    ("2015.09", "6"),
];

/// One entry of `yumrepomap`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoEntry {
    pub url: String,
    /// `amazon`, `centos`, `redhat` or `all`
    pub dist: String,
    /// `6`, `7` or `all`; absent means all
    #[serde(default)]
    pub epel_version: Option<String>,
}

impl RepoEntry {
    fn applies_to(&self, release: &Release) -> bool {
        let dist_matches = self.dist == release.dist || self.dist == ALL;
        let epel_matches = match self.epel_version.as_deref() {
            None | Some(ALL) => true,
            Some(wanted) => release.epel_version.as_deref() == Some(wanted),
        };
        dist_matches && epel_matches
    }

    fn file_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }
}

/// Parameters of the repo step
#[derive(Debug, Clone, Deserialize)]
pub struct YumRepoParams {
    #[serde(default, deserialize_with = "de::records")]
    pub yumrepomap: Vec<RepoEntry>,
    /// Parameters meant for other steps
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Distribution facts read from the release file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// `amazon`, `centos` or `redhat`
    pub dist: String,
    pub version: String,
    pub epel_version: Option<String>,
}

impl Release {
    /// Parse the first line of a release file, e.g.
    /// `Amazon Linux AMI release 2015.03`
    pub fn parse(line: &str) -> Result<Self, PlatformError> {
        let lowered = line.trim().to_lowercase();
        let caps = SUPPORTED_RELEASE
            .captures(&lowered)
            .ok_or_else(|| PlatformError::UnsupportedDistribution(line.trim().to_string()))?;

        let dist = caps[1].replace(' ', "");
        let version = caps[2].to_string();
        let epel_version = if dist == "amazon" {
            AMAZON_EPEL_VERSIONS
                .iter()
                .find(|(release, _)| *release == version)
                .map(|(_, epel)| epel.to_string())
        } else {
            version.split('.').next().map(str::to_string)
        };

        Ok(Self {
            dist,
            version,
            epel_version,
        })
    }
}

/// Entries of `map` that apply to `release`, in map order
pub fn select_repos<'a>(map: &'a [RepoEntry], release: &Release) -> Vec<&'a RepoEntry> {
    map.iter().filter(|entry| entry.applies_to(release)).collect()
}

/// Filesystem locations used by the repo step
#[derive(Debug, Clone)]
pub struct RepoPaths {
    pub release_file: PathBuf,
    pub repo_dir: PathBuf,
}

impl Default for RepoPaths {
    fn default() -> Self {
        Self {
            release_file: PathBuf::from("/etc/system-release"),
            repo_dir: PathBuf::from("/etc/yum.repos.d"),
        }
    }
}

/// Download every applicable repo definition into the repo directory.
///
/// Returns the files written.
pub async fn install_repos(
    params: &YumRepoParams,
    paths: &RepoPaths,
    fetcher: &dyn Fetch,
) -> Result<Vec<PathBuf>, PrepError> {
    if params.yumrepomap.is_empty() {
        info!("`yumrepomap` is empty. Nothing to do!");
        return Ok(Vec::new());
    }

    let release = read_release(&paths.release_file).await?;
    info!(
        "Detected {} {} (EPEL {})",
        release.dist,
        release.version,
        release.epel_version.as_deref().unwrap_or("unknown")
    );

    let mut installed = Vec::new();
    for entry in select_repos(&params.yumrepomap, &release) {
        let dest = paths.repo_dir.join(entry.file_name());
        let fetched = fetcher.fetch(&FetchTarget::new(&entry.url, dest)).await?;
        installed.push(fetched.local_path);
    }

    info!("Installed {} repo definitions", installed.len());
    Ok(installed)
}

async fn read_release(path: &Path) -> Result<Release, PrepError> {
    let content = tokio::fs::read_to_string(path).await?;
    let first = content.lines().next().unwrap_or_default();
    debug!("Release: {}", first);
    Ok(Release::parse(first)?)
}
