//! systemprep - bootstrap provisioning for freshly launched hosts
//!
//! Runs the built-in (or a supplied) list of content steps, then reboots.
//! The content steps themselves are available as subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use systemprep::config::steps::{default_steps, load_steps};
use systemprep::config::{ParameterSet, PlatformContext};
use systemprep::fetch::{ResourceFetcher, S3Store, blob};
use systemprep::reboot::reboot_unless_suppressed;
use systemprep::runner::ShellExecutor;
use systemprep::steps::{
    RepoPaths, SaltInstall, SaltInstallParams, SaltPaths, YumRepoParams, install_repos,
};
use systemprep::{PrepError, provision};

#[derive(Parser)]
#[command(name = "systemprep")]
#[command(author, version, about = "Bootstrap provisioning for freshly launched hosts", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// YAML step list to run instead of the built-in one
    #[arg(long, value_name = "FILE")]
    steps: Option<PathBuf>,

    /// Blob store endpoint
    #[arg(long, env = "SYSTEMPREP_BLOB_ENDPOINT", default_value = blob::DEFAULT_ENDPOINT, global = true)]
    blob_endpoint: String,

    /// Parameters passed to every step (e.g. saltstates=highstate noreboot=true)
    #[arg(value_name = "KEY=VALUE")]
    params: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install salt, stage content and formulas, apply states
    SaltInstall {
        #[arg(value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Install the yum repo definitions matching this distribution
    YumRepos {
        #[arg(value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

fn build_fetcher(endpoint: &str) -> Result<ResourceFetcher, PrepError> {
    let store = S3Store::new(endpoint)?;
    Ok(ResourceFetcher::new()?.with_blob_store(Arc::new(store)))
}

#[tokio::main]
async fn main() -> Result<(), PrepError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let fetcher = build_fetcher(&cli.blob_endpoint)?;

    match cli.command {
        Some(Commands::SaltInstall { params }) => {
            let params: SaltInstallParams = ParameterSet::from_args(&params)?.decode()?;
            SaltInstall::new(params, SaltPaths::default(), &fetcher)
                .run()
                .await?;
        }
        Some(Commands::YumRepos { params }) => {
            let params: YumRepoParams = ParameterSet::from_args(&params)?.decode()?;
            install_repos(&params, &RepoPaths::default(), &fetcher).await?;
        }
        None => {
            let ctx = PlatformContext::detect()?;
            let overrides = ParameterSet::from_args(&cli.params)?;
            let steps = match &cli.steps {
                Some(path) => load_steps(path, &overrides).await?,
                None => default_steps(&ctx, &overrides),
            };

            let executor = ShellExecutor::new(ctx.shell.clone());
            provision(&ctx, &steps, &fetcher, &executor, &overrides).await?;
            reboot_unless_suppressed(&ctx, &overrides).await?;
            info!("systemprep complete");
        }
    }

    Ok(())
}
