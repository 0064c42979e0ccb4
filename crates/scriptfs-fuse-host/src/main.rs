// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! scriptfs FUSE Host
//!
//! Mounts a scriptfs bridge on Linux through fuser and serves it with the
//! built-in demo handlers until SIGINT/SIGTERM or an external unmount.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod adapter;
#[cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]
mod hello;
#[cfg(all(feature = "fuse", target_os = "linux"))]
mod mount;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use scriptfs_core::BridgeConfig;
use scriptfs_logging::{CliLogLevel, CliLoggingArgs};
use tracing::{info, warn};

const COMPONENT: &str = "scriptfs-fuse-host";
const DEBUG_ENV: &str = "SCRIPTFS_FUSE_DEBUG";

#[derive(Parser)]
#[command(name = COMPONENT, version, about = "Serve a scriptfs bridge over FUSE")]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    /// Verbose FUSE tracing
    #[arg(short, long)]
    debug: bool,

    /// Serve requests from a single transport thread
    #[arg(short, long)]
    single_threaded: bool,

    /// Largest read the kernel may issue, in bytes
    #[arg(long)]
    max_read: Option<u32>,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

fn load_config(config_path: Option<&Path>) -> Result<BridgeConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: BridgeConfig = serde_json::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        }
        None => Ok(BridgeConfig::default()),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Command-line flags only ever switch options on; the file sets the base.
fn apply_overrides(config: &mut BridgeConfig, args: &Args) {
    let session = &mut config.session;
    session.allow_other |= args.allow_other;
    session.allow_root |= args.allow_root;
    session.auto_unmount |= args.auto_unmount;
    session.single_threaded |= args.single_threaded;
    session.debug |= args.debug || env_flag(DEBUG_ENV);
    session.foreground = true;
    if let Some(max_read) = args.max_read {
        session.max_read = max_read;
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);

    let default_level = if config.session.debug {
        CliLogLevel::Debug
    } else {
        CliLogLevel::Info
    };
    args.logging.clone().init_with_default_level(COMPONENT, default_level)?;

    info!("Starting scriptfs FUSE Host");
    info!("Mount point: {}", args.mount_point.display());
    info!("Configuration loaded: {:?}", config);

    run(&args.mount_point, config)
}

#[cfg(all(feature = "fuse", target_os = "linux"))]
fn run(mount_point: &Path, config: BridgeConfig) -> Result<()> {
    use std::sync::Arc;

    use scriptfs_core::Runtime;

    let runtime = Runtime::global();
    runtime.initialize(config.clone(), Arc::new(mount::FuserMounter))?;
    let served = serve(runtime, mount_point, config);
    if let Err(err) = runtime.shutdown() {
        warn!(error = %err, "runtime teardown failed");
    }
    served
}

#[cfg(all(feature = "fuse", target_os = "linux"))]
fn serve(runtime: &scriptfs_core::Runtime, mount_point: &Path, config: BridgeConfig) -> Result<()> {
    use std::time::Duration;

    hello::install(runtime)?;
    runtime.initialize_dispatcher(Some(config.dispatcher))?;
    let manager = runtime.initialize_shutdown_manager()?;

    let handle = runtime.create_session(mount_point, config.session)?;
    info!("Mounting filesystem...");
    runtime.mount(&handle)?;
    info!("scriptfs FUSE host mounted; blocking until unmount or signal");

    while !manager.wait_closed(Duration::from_secs(1)) {
        if !runtime.is_ready(&handle) {
            info!("mount went away; shutting down");
            let stats = runtime.initiate_graceful_shutdown(Some("unmounted"), None)?;
            info!(graceful = stats.graceful, "shutdown complete");
            break;
        }
    }
    if let Some(stats) = runtime.get_shutdown_stats() {
        info!(
            graceful = stats.graceful,
            reason = ?stats.failure_reason,
            "scriptfs FUSE host stopped"
        );
    }
    Ok(())
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
fn run(_mount_point: &Path, config: BridgeConfig) -> Result<()> {
    warn!("FUSE support not compiled in. This binary is for testing only.");
    info!("scriptfs config validated: {:?}", config);
    info!("To enable FUSE support, compile with: cargo build --features fuse");
    Ok(())
}
