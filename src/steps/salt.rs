//! Salt agent installation and state application
//!
//! Installs the salt minion, stages salt content and formulas under the
//! salt root, points the minion's `file_roots` at them and optionally runs
//! `salt-call` locally. Scratch files live in a working directory that is
//! removed whether or not the step succeeds.

use minijinja::{Environment, context};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::PrepError;
use crate::archive;
use crate::config::params::de;
use crate::error::ParameterError;
use crate::fetch::{Fetch, FetchTarget};
use crate::patch::{self, BLANK_LINE, FILE_ROOTS_BEGIN};
use crate::runner::check_results_log;
use crate::runner::executor::{display_command, run_program};
use crate::workdir::WorkingDirectory;

use super::packages;

const WORKDIR_PREFIX: &str = "saltinstall-";

const FILE_ROOTS_TEMPLATE: &str = "file_roots:
  base:
    - {{ base_env }}
{% for dir in formula_dirs %}    - {{ dir }}
{% endfor %}";

/// How the salt minion gets installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMethod {
    /// From an already configured yum repo
    Yum,
    /// From source, via the salt bootstrap script
    Git,
}

/// Which states to apply after configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateSelection {
    None,
    Highstate,
    /// Comma-separated state names passed to `state.sls`
    Sls(String),
}

impl StateSelection {
    pub fn parse(states: &str) -> Self {
        let trimmed = states.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            Self::None
        } else if trimmed.eq_ignore_ascii_case("highstate") {
            Self::Highstate
        } else {
            Self::Sls(trimmed.to_string())
        }
    }
}

fn default_install_method() -> String {
    "git".to_string()
}

fn default_bootstrap_source() -> String {
    "https://raw.githubusercontent.com/saltstack/salt-bootstrap/develop/bootstrap-salt.sh"
        .to_string()
}

fn default_git_repo() -> String {
    "git://github.com/saltstack/salt.git".to_string()
}

fn default_states() -> String {
    "none".to_string()
}

/// Parameters of the salt step
#[derive(Debug, Clone, Deserialize)]
pub struct SaltInstallParams {
    #[serde(default = "default_install_method")]
    pub saltinstallmethod: String,
    #[serde(default = "default_bootstrap_source")]
    pub saltbootstrapsource: String,
    #[serde(default = "default_git_repo")]
    pub saltgitrepo: String,
    /// Tag or branch to install with the git method
    #[serde(default)]
    pub saltversion: Option<String>,
    /// Archive unpacked into the salt root
    #[serde(default)]
    pub saltcontentsource: Option<String>,
    /// Formula archives unpacked into the formula root
    #[serde(default, deserialize_with = "de::list")]
    pub formulastoinclude: Vec<String>,
    /// Suffixes stripped from formula directory names
    #[serde(default, deserialize_with = "de::list")]
    pub formulaterminationstrings: Vec<String>,
    #[serde(default = "default_states")]
    pub saltstates: String,
    #[serde(default)]
    pub salt_results_log: Option<PathBuf>,
    #[serde(default)]
    pub salt_debug_log: Option<PathBuf>,
    /// Fetch the content archive from the blob store
    #[serde(default, deserialize_with = "de::flag")]
    pub sourceiss3bucket: bool,
    /// Parameters meant for other steps
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SaltInstallParams {
    pub fn install_method(&self) -> Result<InstallMethod, ParameterError> {
        match self.saltinstallmethod.to_lowercase().as_str() {
            "yum" => Ok(InstallMethod::Yum),
            "git" => Ok(InstallMethod::Git),
            other => Err(ParameterError::InvalidValue {
                key: "saltinstallmethod".to_string(),
                message: format!("{:?} is neither \"git\" nor \"yum\"", other),
            }),
        }
    }

    pub fn states(&self) -> StateSelection {
        StateSelection::parse(&self.saltstates)
    }
}

/// Salt filesystem layout
#[derive(Debug, Clone)]
pub struct SaltPaths {
    pub minion_conf: PathBuf,
    pub salt_call: PathBuf,
    /// Salt root; content archives unpack here
    pub srv_root: PathBuf,
    /// Where the step's working directory is created
    pub working_base: PathBuf,
}

impl Default for SaltPaths {
    fn default() -> Self {
        Self {
            minion_conf: PathBuf::from("/etc/salt/minion"),
            salt_call: PathBuf::from("/usr/bin/salt-call"),
            srv_root: PathBuf::from("/srv/salt"),
            working_base: PathBuf::from("/usr/tmp"),
        }
    }
}

impl SaltPaths {
    /// Layout with every path under `root`
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            minion_conf: root.join("etc/salt/minion"),
            salt_call: root.join("usr/bin/salt-call"),
            srv_root: root.join("srv/salt"),
            working_base: root.join("usr/tmp"),
        }
    }

    pub fn states_root(&self) -> PathBuf {
        self.srv_root.join("states")
    }

    pub fn base_env(&self) -> PathBuf {
        self.states_root().join("base")
    }

    pub fn formula_root(&self) -> PathBuf {
        self.srv_root.join("formulas")
    }
}

/// The salt install step
pub struct SaltInstall<'a> {
    params: SaltInstallParams,
    paths: SaltPaths,
    fetcher: &'a dyn Fetch,
}

impl<'a> SaltInstall<'a> {
    pub fn new(params: SaltInstallParams, paths: SaltPaths, fetcher: &'a dyn Fetch) -> Self {
        Self {
            params,
            paths,
            fetcher,
        }
    }

    /// Run the whole step in a fresh working directory
    pub async fn run(&self) -> Result<(), PrepError> {
        let method = self.params.install_method()?;
        for (key, value) in &self.params.extra {
            debug!("Ignoring parameter {} = {}", key, value);
        }

        tokio::fs::create_dir_all(&self.paths.working_base).await?;
        let workdir = WorkingDirectory::create(&self.paths.working_base, WORKDIR_PREFIX)?;

        let outcome = self.run_in(method, workdir.path()).await;
        match (outcome, workdir.destroy()) {
            (Ok(()), cleanup) => cleanup.map_err(PrepError::from),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!("Cleanup after failure also failed: {}", cleanup);
                Err(e)
            }
        }
    }

    async fn run_in(&self, method: InstallMethod, workdir: &Path) -> Result<(), PrepError> {
        self.install_agent(method, workdir).await?;
        let formula_dirs = self.stage_content(workdir).await?;
        self.configure(&formula_dirs)?;
        self.apply_states(workdir).await
    }

    /// Install the salt minion
    pub async fn install_agent(
        &self,
        method: InstallMethod,
        workdir: &Path,
    ) -> Result<(), PrepError> {
        match method {
            InstallMethod::Yum => {
                // selinux python bindings; missing on some releases
                packages::install_optional(&["policycoreutils-python".to_string()]).await;
                packages::install_packages(&["salt-minion".to_string()]).await
            }
            InstallMethod::Git => {
                let bootstrap = workdir.join(file_name(&self.params.saltbootstrapsource));
                let fetched = self
                    .fetcher
                    .fetch(&FetchTarget::new(&self.params.saltbootstrapsource, bootstrap))
                    .await?;

                let mut args = vec![
                    fetched.local_path.display().to_string(),
                    "-g".to_string(),
                    self.params.saltgitrepo.clone(),
                ];
                if let Some(version) = self.params.saltversion.as_deref().filter(|v| !v.is_empty()) {
                    args.push("git".to_string());
                    args.push(version.to_string());
                }
                super::run_command("sh", &args).await?;
                Ok(())
            }
        }
    }

    /// Create the salt directories, unpack content and formulas.
    ///
    /// Returns the final formula directories, in parameter order.
    pub async fn stage_content(&self, workdir: &Path) -> Result<Vec<PathBuf>, PrepError> {
        let formula_root = self.paths.formula_root();
        for dir in [self.paths.states_root(), self.paths.base_env(), formula_root.clone()] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        if let Some(source) = self.params.saltcontentsource.as_deref() {
            let target = FetchTarget::new(source, workdir.join(file_name(source)))
                .from_blob_store(self.params.sourceiss3bucket);
            let fetched = self.fetcher.fetch(&target).await?;
            archive::extract(&fetched.local_path, &self.paths.srv_root, false)?;
        }

        let mut formula_dirs = Vec::with_capacity(self.params.formulastoinclude.len());
        for source in &self.params.formulastoinclude {
            let name = file_name(source);
            let fetched = self
                .fetcher
                .fetch(&FetchTarget::new(source, workdir.join(name)))
                .await?;
            archive::extract(&fetched.local_path, &formula_root, false)?;

            let unpacked = match Path::new(name).file_stem() {
                Some(stem) => formula_root.join(stem),
                None => formula_root.join(name),
            };
            let dir = strip_terminations(&unpacked, &self.params.formulaterminationstrings)?;
            info!("Staged formula {}", dir.display());
            formula_dirs.push(dir);
        }
        Ok(formula_dirs)
    }

    /// Point the minion's `file_roots` at the base env and `formula_dirs`
    pub fn configure(&self, formula_dirs: &[PathBuf]) -> Result<(), PrepError> {
        let region = render_file_roots(&self.paths.base_env(), formula_dirs)?;
        patch::patch_region(&self.paths.minion_conf, FILE_ROOTS_BEGIN, BLANK_LINE, &region)?;
        info!("Saved the new minion configuration successfully");
        Ok(())
    }

    /// Run `salt-call` for the requested states and validate its results log
    pub async fn apply_states(&self, workdir: &Path) -> Result<(), PrepError> {
        let Some(args) = self.salt_call_args(workdir) else {
            info!("No states were specified. Will not apply any salt states.");
            return Ok(());
        };

        let results_log = self.results_log(workdir);
        if results_log.exists() {
            tokio::fs::remove_file(&results_log).await?;
        }

        let salt_call = self.paths.salt_call.display().to_string();
        let result = run_program(&salt_call, &args).await?;
        info!("Return code of salt-call: {:?}", result.exit_code);

        // salt-call exits 0 even when states fail; only the log tells
        check_results_log(&results_log, &display_command(&salt_call, &args)).await?;
        Ok(())
    }

    /// Arguments to `salt-call`, or `None` when no states are requested
    pub fn salt_call_args(&self, workdir: &Path) -> Option<Vec<String>> {
        let mut args = vec!["--local".to_string()];
        match self.params.states() {
            StateSelection::None => return None,
            StateSelection::Highstate => args.push("state.highstate".to_string()),
            StateSelection::Sls(states) => {
                args.push("state.sls".to_string());
                args.push(states);
            }
        }

        args.extend([
            "--out".to_string(),
            "json".to_string(),
            "--out-file".to_string(),
            self.results_log(workdir).display().to_string(),
            "--return".to_string(),
            "local".to_string(),
            "--log-file".to_string(),
            self.debug_log(workdir).display().to_string(),
            "--log-file-level".to_string(),
            "debug".to_string(),
        ]);
        Some(args)
    }

    fn results_log(&self, workdir: &Path) -> PathBuf {
        self.params
            .salt_results_log
            .clone()
            .unwrap_or_else(|| workdir.join("saltcall.results.log"))
    }

    fn debug_log(&self, workdir: &Path) -> PathBuf {
        self.params
            .salt_debug_log
            .clone()
            .unwrap_or_else(|| workdir.join("saltcall.debug.log"))
    }
}

/// Render the `file_roots` region, blank terminator included
pub fn render_file_roots(
    base_env: &Path,
    formula_dirs: &[PathBuf],
) -> Result<Vec<String>, PrepError> {
    let mut env = Environment::new();
    env.add_template("file_roots", FILE_ROOTS_TEMPLATE)
        .map_err(|e| PrepError::Template(e.to_string()))?;
    let rendered = env
        .get_template("file_roots")
        .and_then(|tmpl| {
            tmpl.render(context! {
                base_env => base_env.display().to_string(),
                formula_dirs => formula_dirs
                    .iter()
                    .map(|d| d.display().to_string())
                    .collect::<Vec<_>>(),
            })
        })
        .map_err(|e| PrepError::Template(e.to_string()))?;

    let mut lines: Vec<String> = rendered.lines().map(str::to_string).collect();
    lines.push(String::new());
    Ok(lines)
}

/// Strip each matching suffix from the directory name, renaming on disk.
///
/// An existing directory at the new name is replaced.
fn strip_terminations(dir: &Path, terminations: &[String]) -> Result<PathBuf, PrepError> {
    let mut current = dir.to_path_buf();
    for suffix in terminations.iter().filter(|s| !s.is_empty()) {
        let Some(name) = current.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            break;
        };
        let Some(stripped) = name.strip_suffix(suffix.as_str()) else {
            continue;
        };
        if stripped.is_empty() {
            continue;
        }

        let renamed = current.with_file_name(stripped);
        if renamed.exists() {
            debug!("Replacing existing {}", renamed.display());
            std::fs::remove_dir_all(&renamed)?;
        }
        std::fs::rename(&current, &renamed)?;
        debug!("Renamed {} -> {}", current.display(), renamed.display());
        current = renamed;
    }
    Ok(current)
}

fn file_name(url: &str) -> &str {
    url.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or("download")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterSet;

    fn params(set: ParameterSet) -> SaltInstallParams {
        set.decode().unwrap()
    }

    #[test]
    fn test_defaults() {
        let p = params(ParameterSet::new());
        assert_eq!(p.install_method().unwrap(), InstallMethod::Git);
        assert_eq!(p.states(), StateSelection::None);
        assert!(p.formulastoinclude.is_empty());
        assert!(!p.sourceiss3bucket);
    }

    #[test]
    fn test_command_line_parameters() {
        let set = ParameterSet::from_args([
            "SaltInstallMethod=YUM",
            "formulastoinclude=[https://x/a-master.zip,https://x/b.zip]",
            "formulaterminationstrings=(-master)",
            "sourceiss3bucket=True",
            "saltstates=Highstate",
            "entenv=False",
        ])
        .unwrap();
        let p = params(set);
        assert_eq!(p.install_method().unwrap(), InstallMethod::Yum);
        assert_eq!(p.formulastoinclude, vec!["https://x/a-master.zip", "https://x/b.zip"]);
        assert_eq!(p.formulaterminationstrings, vec!["-master"]);
        assert!(p.sourceiss3bucket);
        assert_eq!(p.states(), StateSelection::Highstate);
        assert!(p.extra.contains_key("entenv"));
    }

    #[test]
    fn test_unknown_install_method() {
        let p = params(ParameterSet::new().with("saltinstallmethod", "pip"));
        assert!(matches!(
            p.install_method(),
            Err(ParameterError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_state_selection() {
        assert_eq!(StateSelection::parse("None"), StateSelection::None);
        assert_eq!(StateSelection::parse("HIGHSTATE"), StateSelection::Highstate);
        assert_eq!(
            StateSelection::parse("ash-linux.stig,join-domain"),
            StateSelection::Sls("ash-linux.stig,join-domain".to_string())
        );
    }

    #[test]
    fn test_render_file_roots() {
        let lines = render_file_roots(
            Path::new("/srv/salt/states/base"),
            &[
                PathBuf::from("/srv/salt/formulas/ash-linux-formula"),
                PathBuf::from("/srv/salt/formulas/scc-formula"),
            ],
        )
        .unwrap();
        assert_eq!(
            lines,
            vec![
                "file_roots:",
                "  base:",
                "    - /srv/salt/states/base",
                "    - /srv/salt/formulas/ash-linux-formula",
                "    - /srv/salt/formulas/scc-formula",
                "",
            ]
        );
    }

    #[test]
    fn test_render_file_roots_without_formulas() {
        let lines = render_file_roots(Path::new("/srv/salt/states/base"), &[]).unwrap();
        assert_eq!(lines, vec!["file_roots:", "  base:", "    - /srv/salt/states/base", ""]);
    }

    #[test]
    fn test_strip_terminations() {
        let root = tempfile::TempDir::new().unwrap();
        let dir = root.path().join("scc-formula-master");
        std::fs::create_dir(&dir).unwrap();
        std::fs::create_dir(root.path().join("scc-formula")).unwrap();

        let terminations = vec!["-latest".to_string(), "-master".to_string()];
        let result = strip_terminations(&dir, &terminations).unwrap();

        assert_eq!(result, root.path().join("scc-formula"));
        assert!(result.is_dir());
        assert!(!dir.exists());
    }

    #[test]
    fn test_salt_call_args() {
        let fetcher = crate::fetch::ResourceFetcher::new().unwrap();
        let p = params(
            ParameterSet::new()
                .with("saltstates", "ash-linux.stig")
                .with("salt_results_log", "/var/log/results.log"),
        );
        let step = SaltInstall::new(p, SaltPaths::default(), &fetcher);
        let args = step.salt_call_args(Path::new("/usr/tmp/saltinstall-abc")).unwrap();
        assert_eq!(
            args,
            vec![
                "--local",
                "state.sls",
                "ash-linux.stig",
                "--out",
                "json",
                "--out-file",
                "/var/log/results.log",
                "--return",
                "local",
                "--log-file",
                "/usr/tmp/saltinstall-abc/saltcall.debug.log",
                "--log-file-level",
                "debug",
            ]
        );

        let none = SaltInstall::new(params(ParameterSet::new()), SaltPaths::default(), &fetcher);
        assert!(none.salt_call_args(Path::new("/tmp")).is_none());
    }
}
