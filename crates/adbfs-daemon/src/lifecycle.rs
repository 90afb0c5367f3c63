//! Mount lifecycle controller
//!
//! Starts the kernel-facing server, waits for it to report ready, and
//! performs exactly one unmount no matter how many triggers (signal, server
//! exit, device disconnect) race for it.
//!
//! ```text
//! Idle -> Mounting -> Mounted -> Unmounting -> Unmounted
//!            |
//!            +-> Unmounted   (startup failed; nothing to unmount)
//! ```
//!
//! Two monotonic flags guard the transitions: `mounted` is set once the
//! server reports ready, `unmounted` is claimed by compare-and-swap by the
//! first unmount trigger.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How long `run` waits for the server to exit after unmounting
const SERVER_EXIT_GRACE: Duration = Duration::from_secs(5);

/// The kernel-facing mount bridge
pub trait MountBridge: Send + Sync + 'static {
    /// Serve filesystem calls; blocks until the filesystem is unmounted
    fn serve(&self) -> io::Result<()>;

    /// Block until the mount is live
    fn wait_until_ready(&self) -> io::Result<()>;

    fn unmount(&self) -> io::Result<()>;
}

/// Mount errors
#[derive(Error, Debug)]
pub enum MountError {
    #[error("mount did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("filesystem server exited before the mount was ready")]
    ServerExited,

    #[error("mount failed: {0}")]
    Io(#[from] io::Error),
}

/// Lifecycle phase, for reporting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MountPhase {
    Idle = 0,
    Mounting = 1,
    Mounted = 2,
    Unmounting = 3,
    Unmounted = 4,
}

impl MountPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MountPhase::Mounting,
            2 => MountPhase::Mounted,
            3 => MountPhase::Unmounting,
            4 => MountPhase::Unmounted,
            _ => MountPhase::Idle,
        }
    }
}

/// Monotonic mount flags; each goes false -> true at most once
#[derive(Debug, Default)]
pub struct MountState {
    mounted: AtomicBool,
    unmounted: AtomicBool,
}

impl MountState {
    /// Record a successful mount. Returns false if already recorded.
    pub fn mark_mounted(&self) -> bool {
        self.mounted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the unmount. Only the first caller after a successful mount wins.
    pub fn begin_unmount(&self) -> bool {
        if !self.mounted.load(Ordering::Acquire) {
            return false;
        }
        self.unmounted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    pub fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::Acquire)
    }
}

/// Completion signal of the serving thread, carrying its result
pub type ServerDone = Receiver<io::Result<()>>;

/// Owns the mount state machine for one bridge
pub struct MountController<B: MountBridge> {
    bridge: Arc<B>,
    state: MountState,
    phase: AtomicU8,
    startup_timeout: Duration,
}

impl<B: MountBridge> MountController<B> {
    pub fn new(bridge: Arc<B>, startup_timeout: Duration) -> Self {
        Self {
            bridge,
            state: MountState::default(),
            phase: AtomicU8::new(MountPhase::Idle as u8),
            startup_timeout,
        }
    }

    pub fn phase(&self) -> MountPhase {
        MountPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn state(&self) -> &MountState {
        &self.state
    }

    fn set_phase(&self, phase: MountPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Start serving and wait for readiness, server exit or the startup
    /// timeout, whichever comes first.
    ///
    /// On success returns the server's completion signal for [`run`](Self::run).
    pub fn start(&self) -> Result<ServerDone, MountError> {
        self.set_phase(MountPhase::Mounting);
        info!("Mounting (timeout {:?})", self.startup_timeout);

        let (done_tx, done_rx) = bounded::<io::Result<()>>(1);
        let (ready_tx, ready_rx) = bounded::<io::Result<()>>(1);

        let bridge = Arc::clone(&self.bridge);
        thread::Builder::new()
            .name("adbfs-serve".into())
            .spawn(move || {
                let result = bridge.serve();
                if let Err(e) = &result {
                    error!("Filesystem server error: {}", e);
                }
                let _ = done_tx.send(result);
            })
            .map_err(|e| self.fail(e.into()))?;

        let bridge = Arc::clone(&self.bridge);
        thread::Builder::new()
            .name("adbfs-ready".into())
            .spawn(move || {
                let _ = ready_tx.send(bridge.wait_until_ready());
            })
            .map_err(|e| self.fail(e.into()))?;

        select! {
            recv(ready_rx) -> msg => match msg {
                Ok(Ok(())) => {
                    self.state.mark_mounted();
                    self.set_phase(MountPhase::Mounted);
                    info!("Mounted");
                    Ok(done_rx.clone())
                }
                Ok(Err(e)) => Err(self.fail(MountError::Io(e))),
                Err(_) => Err(self.fail(MountError::ServerExited)),
            },
            recv(done_rx) -> msg => match msg {
                Ok(Err(e)) => Err(self.fail(MountError::Io(e))),
                _ => Err(self.fail(MountError::ServerExited)),
            },
            default(self.startup_timeout) => {
                Err(self.fail(MountError::StartupTimeout(self.startup_timeout)))
            }
        }
    }

    fn fail(&self, err: MountError) -> MountError {
        error!("Mount failed: {}", err);
        self.set_phase(MountPhase::Unmounted);
        err
    }

    /// Unmount once. Returns true if this call performed the unmount.
    ///
    /// A no-op before the mount succeeded or after another caller already
    /// claimed the unmount.
    pub fn unmount(&self) -> bool {
        if !self.state.begin_unmount() {
            debug!(
                "Unmount skipped (mounted={}, unmounted={})",
                self.state.is_mounted(),
                self.state.is_unmounted()
            );
            return false;
        }

        self.set_phase(MountPhase::Unmounting);
        info!("Unmounting");
        if let Err(e) = self.bridge.unmount() {
            // The server may already be gone, e.g. after an external umount
            warn!("Unmount failed: {}", e);
        }
        self.set_phase(MountPhase::Unmounted);
        true
    }

    /// Watchdog callback target
    pub fn handle_device_disconnected(&self) {
        if !self.state.is_mounted() || self.state.is_unmounted() {
            debug!("Device disconnect ignored in phase {:?}", self.phase());
            return;
        }
        warn!("Device disconnected, unmounting");
        self.unmount();
    }

    /// Block until the server exits or a shutdown is requested, then make sure
    /// the filesystem is unmounted. Returns the server's own result.
    pub fn run(&self, server_done: ServerDone, shutdown: Receiver<()>) -> io::Result<()> {
        select! {
            recv(server_done) -> msg => {
                info!("Filesystem server exited");
                self.unmount();
                msg.unwrap_or(Ok(()))
            }
            recv(shutdown) -> _ => {
                info!("Shutdown requested");
                self.unmount();
                match server_done.recv_timeout(SERVER_EXIT_GRACE) {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Filesystem server did not exit within {:?}", SERVER_EXIT_GRACE);
                        Ok(())
                    }
                }
            }
        }
    }
}
