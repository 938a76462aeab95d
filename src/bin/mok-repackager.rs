use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mok_repackager::config::{BuildConfig, ConfigFile, RunInputs, ValidationPolicy};
use mok_repackager::discovery::{discover, DiscoveredSet};
use mok_repackager::pipeline;
use mok_repackager::preflight;
use mok_repackager::process::HostRunner;

/// Exit status for invalid arguments or configuration.
const EXIT_CONFIG: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "mok-repackager",
    version,
    about = "Derive MOK-signed bootloader, kernel and shim packages for a release"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover, synthesize, build, validate, sign and publish
    Run(RunArgs),
    /// Print the packages a run would derive from
    Discover(CommonArgs),
    /// Check host tools and the work directory
    Preflight(CommonArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Release directory containing RPMS/ and SPECS/
    #[arg(long)]
    release_dir: PathBuf,

    /// Extracted ISO / repository root the derived packages are published into
    #[arg(long)]
    iso_dir: PathBuf,

    /// MOK private key (PEM)
    #[arg(long)]
    key: PathBuf,

    /// MOK certificate (PEM)
    #[arg(long)]
    cert: PathBuf,

    /// Work directory (default: <release-dir>/mok-work)
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// TOML file with extended settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Embed the removable-token boot gate in the bootloader package
    #[arg(long)]
    require_token: bool,

    /// Treat signature validation failures as fatal
    #[arg(long)]
    strict_validation: bool,
}

fn main() {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Run(args) => args.common.verbose,
        Command::Discover(args) | Command::Preflight(args) => args.verbose,
    };
    init_logging(verbose);

    let code = match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Discover(args) => handle_discover(args),
        Command::Preflight(args) => handle_preflight(args),
    };
    process::exit(code);
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mok_repackager={level},warn")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn load_config(common: CommonArgs, require_token: bool) -> Result<BuildConfig> {
    let overrides = common
        .config
        .as_deref()
        .map(ConfigFile::load)
        .transpose()?;
    let inputs = RunInputs {
        release_dir: common.release_dir,
        iso_dir: common.iso_dir,
        signing_key: common.key,
        signing_cert: common.cert,
        verbose: common.verbose,
        require_hardware_token: require_token,
        work_dir: common.work_dir,
    };
    BuildConfig::from_inputs(inputs, overrides)
}

fn config_or_exit(common: CommonArgs, require_token: bool) -> Result<BuildConfig, i32> {
    load_config(common, require_token).map_err(|e| {
        error!("configuration error: {e:#}");
        EXIT_CONFIG
    })
}

fn handle_run(args: RunArgs) -> i32 {
    let mut config = match config_or_exit(args.common, args.require_token) {
        Ok(c) => c,
        Err(code) => return code,
    };
    if args.strict_validation {
        config.validation_policy = ValidationPolicy::Fatal;
    }

    match pipeline::run(&config, &HostRunner) {
        Ok(report) => {
            println!(
                "{} package(s) built, {} validation failure(s), {} signed, {} published",
                report.built.len(),
                report.validation_failures(),
                report.signed,
                report
                    .integration
                    .as_ref()
                    .map(|i| i.copied.len())
                    .unwrap_or(0)
            );
            0
        }
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

fn handle_discover(args: CommonArgs) -> i32 {
    let config = match config_or_exit(args, false) {
        Ok(c) => c,
        Err(code) => return code,
    };
    match discover(&config, &HostRunner) {
        Ok(set) => {
            print_set(&set);
            0
        }
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

fn handle_preflight(args: CommonArgs) -> i32 {
    let config = match config_or_exit(args, false) {
        Ok(c) => c,
        Err(code) => return code,
    };
    match preflight::check(&config, &HostRunner) {
        Ok(()) => {
            info!(work_dir = %config.work_dir.display(), "preflight passed");
            0
        }
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

fn print_set(set: &DiscoveredSet) {
    println!("release   {} ({})", set.release, set.dist_tag);
    for (role, desc) in set.descriptors() {
        println!(
            "{:<18} {:<24} {}-{}.{}  {}",
            role.to_string(),
            desc.name,
            desc.version,
            desc.release,
            desc.architecture,
            desc.spec_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(no template)".to_string())
        );
    }
}
