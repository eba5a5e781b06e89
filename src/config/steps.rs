//! Step list
//!
//! The steps to run are static configuration: either the built-in list for
//! the detected platform or a YAML file supplied by the caller. Every step's
//! parameters are merged with the caller's overrides before the run starts.

use super::params::{ParameterSet, Value};
use super::{Platform, PlatformContext};
use crate::PrepError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Parameter naming the results log of the salt step
const SALT_RESULTS_LOG: &str = "salt_results_log";

/// One unit of the provisioning pipeline: a fetchable script plus its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    source: String,
    #[serde(default)]
    parameters: ParameterSet,
    /// Structured results log the step writes, validated after it exits
    #[serde(default)]
    results_log: Option<PathBuf>,
}

impl Step {
    pub fn new(source: impl Into<String>, parameters: ParameterSet) -> Self {
        Self {
            source: source.into(),
            parameters,
            results_log: None,
        }
    }

    pub fn with_results_log(mut self, log: impl Into<PathBuf>) -> Self {
        self.results_log = Some(log.into());
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn results_log(&self) -> Option<&Path> {
        self.results_log.as_deref()
    }

    /// File name the source is saved under
    pub fn file_name(&self) -> &str {
        self.source
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("step")
    }

    /// Merge the caller's overrides into this step's parameters
    fn with_overrides(self, overrides: &ParameterSet) -> Self {
        Self {
            parameters: ParameterSet::merge(self.parameters, overrides),
            ..self
        }
    }
}

/// Built-in step list for the platform, merged with `overrides`
pub fn default_steps(ctx: &PlatformContext, overrides: &ParameterSet) -> Vec<Step> {
    let steps = match ctx.platform {
        Platform::Linux => vec![
            Step::new(
                "https://systemprep.s3.amazonaws.com/ContentScripts/systemprep-linuxyumrepoinstall.py",
                ParameterSet::new().with("yumrepomap", Value::Records(linux_repo_map())),
            ),
            Step::new(
                "https://systemprep.s3.amazonaws.com/ContentScripts/SystemPrep-LinuxSaltInstall.py",
                ParameterSet::new()
                    .with("saltinstallmethod", "yum")
                    .with(
                        "saltcontentsource",
                        "https://systemprep-content.s3.amazonaws.com/linux/salt/salt-content.zip",
                    )
                    .with(
                        "formulastoinclude",
                        strings(&[
                            "https://salt-formulas.s3.amazonaws.com/systemprep-formula-master.zip",
                            "https://salt-formulas.s3.amazonaws.com/ash-linux-formula-master.zip",
                            "https://salt-formulas.s3.amazonaws.com/join-domain-formula-master.zip",
                            "https://salt-formulas.s3.amazonaws.com/scc-formula-master.zip",
                        ]),
                    )
                    .with("formulaterminationstrings", strings(&["-master", "-latest"]))
                    .with("saltstates", "Highstate")
                    .with("entenv", "False")
                    .with(SALT_RESULTS_LOG, "/var/log/saltcall.results.log")
                    .with("salt_debug_log", "/var/log/saltcall.debug.log")
                    .with("sourceiss3bucket", true),
            ),
        ],
        Platform::Windows => vec![Step::new(
            "https://systemprep.s3.amazonaws.com/SystemContent/Windows/Salt/SystemPrep-WindowsSaltInstall.ps1",
            ParameterSet::new()
                .with(
                    "saltworkingdir",
                    format!(
                        "{}\\SystemContent\\Windows\\Salt",
                        ctx.working_base().display()
                    ),
                )
                .with(
                    "saltcontentsource",
                    "https://systemprep.s3.amazonaws.com/SystemContent/Windows/Salt/salt-content.zip",
                )
                .with(
                    "formulastoinclude",
                    strings(&[
                        "https://salt-formulas.s3.amazonaws.com/systemprep-formula-master.zip",
                        "https://salt-formulas.s3.amazonaws.com/ash-windows-formula-master.zip",
                    ]),
                )
                .with("formulaterminationstrings", strings(&["-latest"]))
                .with("ashrole", "MemberServer")
                .with("entenv", "False")
                .with("saltstates", "Highstate"),
        )],
    };

    steps
        .into_iter()
        .map(|step| attach_results_log(step.with_overrides(overrides)))
        .collect()
}

/// Load a step list from a YAML file, merged with `overrides`
pub async fn load_steps(
    path: impl AsRef<Path>,
    overrides: &ParameterSet,
) -> Result<Vec<Step>, PrepError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).await?;
    let steps: Vec<Step> = serde_yaml::from_str(&content)?;
    info!("Loaded {} steps from {}", steps.len(), path.display());

    Ok(steps
        .into_iter()
        .map(|step| attach_results_log(step.with_overrides(overrides)))
        .collect())
}

/// Steps that apply salt states leave a results log to validate.
///
/// Only attached when the step has none configured and states will run.
fn attach_results_log(step: Step) -> Step {
    if step.results_log.is_some() {
        return step;
    }

    let applies_states = step
        .parameters
        .get("saltstates")
        .and_then(Value::as_str)
        .is_some_and(|states| !states.eq_ignore_ascii_case("none"));
    let log = step
        .parameters
        .get(SALT_RESULTS_LOG)
        .and_then(Value::as_str)
        .map(PathBuf::from);

    match log {
        Some(log) if applies_states => {
            debug!("Step {} reports to {}", step.source, log.display());
            step.with_results_log(log)
        }
        _ => step,
    }
}

fn linux_repo_map() -> Vec<BTreeMap<String, String>> {
    const BASE: &str = "https://s3.amazonaws.com/systemprep-repo/linux/yum.repos";
    [
        ("systemprep-repo-amzn.repo", "amazon", None),
        ("systemprep-repo-centos.repo", "centos", None),
        ("systemprep-repo-rhel.repo", "redhat", None),
        ("systemprep-repo-salt-el6.repo", "all", Some("6")),
        ("systemprep-repo-salt-el7.repo", "all", Some("7")),
    ]
    .into_iter()
    .map(|(file, dist, epel)| {
        let mut record = BTreeMap::new();
        record.insert("url".to_string(), format!("{}/{}", BASE, file));
        record.insert("dist".to_string(), dist.to_string());
        if let Some(epel) = epel {
            record.insert("epel_version".to_string(), epel.to_string());
        }
        record
    })
    .collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_defaults_order() {
        let steps = default_steps(&PlatformContext::linux(), &ParameterSet::new());
        assert_eq!(steps.len(), 2);
        assert!(steps[0].source().ends_with("systemprep-linuxyumrepoinstall.py"));
        assert!(steps[1].source().ends_with("SystemPrep-LinuxSaltInstall.py"));
        assert_eq!(steps[1].file_name(), "SystemPrep-LinuxSaltInstall.py");
    }

    #[test]
    fn test_overrides_applied_to_every_step() {
        let overrides = ParameterSet::new().with("saltstates", "none").with("extra", "x");
        let steps = default_steps(&PlatformContext::linux(), &overrides);

        for step in &steps {
            assert_eq!(step.parameters().get("extra"), Some(&Value::from("x")));
        }
        assert_eq!(
            steps[1].parameters().get("saltstates"),
            Some(&Value::from("none"))
        );
    }

    #[test]
    fn test_results_log_follows_saltstates() {
        let steps = default_steps(&PlatformContext::linux(), &ParameterSet::new());
        assert!(steps[0].results_log().is_none());
        assert_eq!(
            steps[1].results_log(),
            Some(Path::new("/var/log/saltcall.results.log"))
        );

        let overrides = ParameterSet::new().with("saltstates", "None");
        let steps = default_steps(&PlatformContext::linux(), &overrides);
        assert!(steps[1].results_log().is_none());
    }

    #[test]
    fn test_windows_defaults() {
        let ctx = PlatformContext::windows_with_roots("C:", "C:\\Windows");
        let steps = default_steps(&ctx, &ParameterSet::new());
        assert_eq!(steps.len(), 1);
        assert!(steps[0].source().ends_with(".ps1"));
        assert_eq!(
            steps[0].parameters().get("saltworkingdir"),
            Some(&Value::from(
                "C:\\SystemPrep\\WorkingFiles\\SystemContent\\Windows\\Salt"
            ))
        );
    }

    #[tokio::test]
    async fn test_load_steps_yaml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("steps.yaml");
        std::fs::write(
            &path,
            r#"
- source: https://example.com/one.sh
  parameters:
    greeting: hello
- source: https://example.com/two.sh
  results_log: /tmp/two.log
"#,
        )
        .unwrap();

        let overrides = ParameterSet::new().with("greeting", "hi");
        let steps = load_steps(&path, &overrides).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].parameters().get("greeting"), Some(&Value::from("hi")));
        assert_eq!(steps[1].results_log(), Some(Path::new("/tmp/two.log")));
        assert_eq!(steps[1].file_name(), "two.sh");
    }
}
