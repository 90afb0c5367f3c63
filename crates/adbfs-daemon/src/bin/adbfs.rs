//! adbfs - mount an adb device's filesystem
//!
//! Usage:
//!   adbfs --serial <serial> --mountpoint <dir>
//!
//! Example:
//!   adbfs -s emulator-5554 --mountpoint ~/phone --device-root /sdcard

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use adbfs_core::Config;

#[derive(Parser)]
#[command(name = "adbfs")]
#[command(about = "Mount an Android device's filesystem over adb")]
#[command(version)]
struct Cli {
    /// Device serial (as listed by `adb devices`)
    #[arg(short, long, env = "ANDROID_SERIAL")]
    serial: Option<String>,

    /// Directory to mount on
    #[arg(short, long)]
    mountpoint: Option<PathBuf>,

    /// Device directory exposed as the mount root
    #[arg(long)]
    device_root: Option<String>,

    /// Directory-entry cache TTL in milliseconds (0 disables caching)
    #[arg(long)]
    cache_ttl_ms: Option<u64>,

    /// Number of concurrent device sessions
    #[arg(long)]
    pool_size: Option<usize>,

    /// Path to the adb executable
    #[arg(long)]
    adb: Option<PathBuf>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Mount read-only
    #[arg(long)]
    read_only: bool,

    /// Log every call made on an open file
    #[arg(long)]
    log_file_ops: bool,

    /// Emit JSON log records
    #[arg(long)]
    log_json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Apply flags on top of file values
    fn merge_into(self, config: &mut Config) {
        if let Some(serial) = self.serial {
            config.mount.serial = Some(serial);
        }
        if let Some(mountpoint) = self.mountpoint {
            config.mount.mountpoint = Some(mountpoint);
        }
        if let Some(root) = self.device_root {
            config.mount.device_root = root;
        }
        if let Some(ttl) = self.cache_ttl_ms {
            config.cache.ttl_ms = ttl;
        }
        if let Some(size) = self.pool_size {
            config.pool.size = size;
        }
        if let Some(adb) = self.adb {
            config.adb.program = adb;
        }
        config.mount.allow_other |= self.allow_other;
        config.mount.read_only |= self.read_only;
        config.logging.file_ops |= self.log_file_ops;
        config.logging.json |= self.log_json;
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "adbfs=debug,adbfs_daemon=debug,adbfs_core=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    cli.merge_into(&mut config);
    init_logging(verbose, config.logging.json);

    if let Err(e) = config.validate() {
        error!("{}", e);
        return Err(e).context("invalid configuration");
    }

    run(config)
}

#[cfg(unix)]
fn run(config: Config) -> anyhow::Result<()> {
    use std::sync::Arc;

    use crossbeam_channel::bounded;
    use tokio::runtime::Runtime;
    use tracing::warn;

    use adbfs_core::check_mountpoint;
    use adbfs_daemon::adb::{watch_devices, AdbShellOpener};
    use adbfs_daemon::fuse::{mount_options, FuserMount};
    use adbfs_daemon::{
        AdbFileSystem, CacheSweeper, CachingClientFactory, ClientFactory, DeviceWatchdog,
        DirEntryCache, FsOptions, MountController, PooledClientFactory,
    };

    let serial = config.mount.serial.clone().unwrap_or_default();
    let requested = config.mount.mountpoint.clone().unwrap_or_default();
    let mountpoint = check_mountpoint(&requested).context("invalid mountpoint")?;

    info!("Mounting {} at {:?}", serial, mountpoint);
    info!(
        "Device root {}, cache TTL {:?}, {} sessions",
        config.mount.device_root,
        config.cache_ttl(),
        config.pool.size
    );

    // Start tokio runtime for device I/O; fuser runs on its own thread
    let rt = Runtime::new()?;

    let program = config.adb.program.clone();
    let timeout = config.command_timeout();
    let pooled = Arc::new(PooledClientFactory::new(config.pool.size, move |serial| {
        AdbShellOpener::new(program.clone(), serial, timeout)
    }));

    let cache = Arc::new(DirEntryCache::new(config.cache.max_entries));
    let factory: Arc<dyn ClientFactory> = Arc::new(CachingClientFactory::new(
        Arc::clone(&cache),
        config.cache_ttl(),
        Arc::clone(&pooled) as Arc<dyn ClientFactory>,
    ));

    if config.cache.sweep_interval_secs > 0 {
        let sweeper = CacheSweeper::with_interval(
            Arc::clone(&cache),
            std::time::Duration::from_secs(config.cache.sweep_interval_secs),
        );
        rt.spawn(sweeper.run_loop());
    }

    let fs = Arc::new(AdbFileSystem::new(
        serial.clone(),
        factory,
        FsOptions {
            device_root: config.mount.device_root.clone(),
            read_only: config.mount.read_only,
            log_file_ops: config.logging.file_ops,
        },
    ));

    let bridge = Arc::new(FuserMount::new(
        fs,
        rt.handle().clone(),
        &mountpoint,
        mount_options(&serial, config.mount.allow_other, config.mount.read_only),
    ));
    let controller = Arc::new(MountController::new(bridge, config.startup_timeout()));

    let server_done = match controller.start() {
        Ok(done) => done,
        Err(e) => {
            error!("Failed to mount: {}", e);
            error!("Common causes:");
            error!("  1. FUSE not available - check /dev/fuse or install macFUSE");
            error!("  2. Mount point busy - unmount first: fusermount -u {:?}", mountpoint);
            error!("  3. Device not reachable - check `adb devices`");
            pooled.close();
            return Err(e.into());
        }
    };

    // Device watchdog
    let watched = Arc::clone(&controller);
    let watchdog = DeviceWatchdog::new(serial.clone(), move || {
        let controller = Arc::clone(&watched);
        // Unmounting shells out and waits; keep it off the async workers
        tokio::task::spawn_blocking(move || controller.handle_device_disconnected());
    });
    rt.spawn(watchdog.run(watch_devices(config.adb.program.clone(), config.poll_interval())));

    // Ctrl+C and SIGTERM
    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    rt.spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(());
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
            _ = term.recv() => info!("Received SIGTERM"),
        }
        let _ = shutdown_tx.send(());
    });

    info!("Mounted. Press Ctrl+C to unmount.");
    let result = controller.run(server_done, shutdown_rx);

    pooled.close();
    rt.shutdown_timeout(std::time::Duration::from_secs(1));
    info!("Filesystem unmounted");

    result.context("filesystem server failed")
}

#[cfg(not(unix))]
fn run(_config: Config) -> anyhow::Result<()> {
    anyhow::bail!("adbfs requires FUSE, which is only available on Linux and macOS")
}
