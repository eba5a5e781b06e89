//! systemprep library
//!
//! Bootstrap provisioning for freshly launched hosts: fetch a fixed list of
//! content steps, run each one with its parameters, stop at the first
//! failure, clean up, and reboot.
//!
//! # Components
//!
//! - [`fetch`]: retrieves a URL into a local file, from a blob store or the web
//! - [`archive`]: unpacks `.zip`, `.tar.gz`/`.tgz` and `.tar.bz2`/`.tbz` files
//! - [`patch`]: replaces one marker-delimited region of a config file
//! - [`workdir`]: uniquely named scratch directories
//! - [`runner`]: the step state machine
//! - [`steps`]: native implementations of the built-in content steps

pub mod archive;
pub mod config;
pub mod error;
pub mod fetch;
pub mod patch;
pub mod reboot;
pub mod runner;
pub mod steps;
pub mod workdir;

pub use error::PrepError;

use config::{ParameterSet, PlatformContext, Step};
use fetch::Fetch;
use runner::{StepExecutor, StepRunner};
use tracing::info;

/// Parameter selecting the blob store for step sources
pub const SOURCE_IS_BLOB: &str = "sourceiss3bucket";

/// Run `steps` in order, returning how many completed.
///
/// Step sources come from the blob store when `overrides` sets
/// `sourceiss3bucket`.
pub async fn provision(
    ctx: &PlatformContext,
    steps: &[Step],
    fetcher: &dyn Fetch,
    executor: &dyn StepExecutor,
    overrides: &ParameterSet,
) -> Result<usize, PrepError> {
    info!("Provisioning {} with {} steps", ctx.platform, steps.len());

    let mut runner =
        StepRunner::new(ctx, fetcher, executor).use_blob_store(overrides.flag(SOURCE_IS_BLOB));
    let completed = runner.run(steps).await.into_result()?;

    info!("All {} steps completed", completed);
    Ok(completed)
}
