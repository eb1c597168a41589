//! capsuled - on-device capsule activation daemon.
//!
//! On a normal boot the daemon runs the full activation pipeline: commit
//! staged sessions, scan pre-installed and data capsules, pick a version
//! of each, mount the winners under the capsule root and publish the
//! activation manifest. With `--ota-chroot-bootstrap` it instead runs the
//! reduced pipeline used inside an OTA chroot and exits with its status.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use capsuled::bootstrap;
use capsuled::config::CapsuledConfig;
use capsuled::context::{
    EngineContext, LogStatusSink, NoCheckpoint, NullMetrics, PermissiveVintf, Sha256Verifier,
};
use capsuled::engine::ActivationEngine;
use capsuled::kernel::linux::{LinuxLoop, LinuxMount, LinuxMountScanner, LinuxVerity};
use capsuled::sidecar::SidecarSource;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// capsuled - capsule activation daemon
#[derive(Parser, Debug)]
#[command(name = "capsuled")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/capsuled.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run the reduced OTA chroot pipeline against this data directory,
    /// then exit with its status
    #[arg(long, value_name = "DATA_DIR")]
    ota_chroot_bootstrap: Option<PathBuf>,

    /// Override the pre-installed capsule directories (repeatable)
    #[arg(long = "builtin-dir", value_name = "DIR")]
    builtin_dirs: Vec<PathBuf>,

    /// Recovery boot: do not scan data capsules
    #[arg(long)]
    in_recovery: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    let mut config = if args.config.exists() {
        CapsuledConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        CapsuledConfig::default()
    };
    if args.in_recovery {
        config.in_recovery = true;
    }

    let source = SidecarSource::new();
    let verifier = Sha256Verifier;
    let loops = LinuxLoop;
    let verity = LinuxVerity;
    let mounts = LinuxMount;
    let scanner = LinuxMountScanner::new(&config.capsule_root);
    let checkpoint = NoCheckpoint;
    let metrics = NullMetrics;
    let vintf = PermissiveVintf;
    let status = LogStatusSink {
        property: config.status_property.clone(),
    };

    let ctx = EngineContext {
        source: &source,
        verifier: &verifier,
        verity_metadata: &source,
        loops: &loops,
        verity: &verity,
        mounts: &mounts,
        scanner: &scanner,
        checkpoint: &checkpoint,
        metrics: &metrics,
        vintf: &vintf,
        status: &status,
    };

    if let Some(data_dir) = args.ota_chroot_bootstrap {
        let code = bootstrap::run(&ctx, config, args.builtin_dirs, data_dir);
        return Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)));
    }

    if !args.builtin_dirs.is_empty() {
        config.builtin_dirs = args.builtin_dirs;
    }

    let mut engine = ActivationEngine::new(&ctx, config);
    engine.on_start().context("boot activation failed")?;
    Ok(ExitCode::SUCCESS)
}
