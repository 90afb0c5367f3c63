//! Device watchdog
//!
//! Consumes device-set change events and fires the disconnect callback once
//! per disconnection episode. The callback runs inline on the watchdog task;
//! it is expected to be cheap and idempotent (the lifecycle controller's
//! unmount path is both).

use std::collections::HashSet;

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use adbfs_core::ClientError;

/// Callback invoked when the watched device disappears
pub type DisconnectFn = Box<dyn Fn() + Send + Sync>;

/// Watches one serial in a stream of device sets
pub struct DeviceWatchdog {
    serial: String,
    on_disconnect: DisconnectFn,
    present: bool,
}

impl DeviceWatchdog {
    /// The device is assumed present when watching starts
    pub fn new(serial: impl Into<String>, on_disconnect: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            serial: serial.into(),
            on_disconnect: Box::new(on_disconnect),
            present: true,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Process one device-set event. Returns true if the callback fired.
    pub fn observe(&mut self, devices: &HashSet<String>) -> bool {
        let now_present = devices.contains(&self.serial);

        match (self.present, now_present) {
            (true, false) => {
                info!("Device {} disconnected", self.serial);
                self.present = false;
                (self.on_disconnect)();
                true
            }
            (false, true) => {
                info!("Device {} reconnected", self.serial);
                self.present = true;
                false
            }
            _ => false,
        }
    }

    /// Consume events until the stream ends
    pub async fn run<S>(mut self, events: S)
    where
        S: Stream<Item = Result<HashSet<String>, ClientError>>,
    {
        futures::pin_mut!(events);

        while let Some(event) = events.next().await {
            match event {
                Ok(devices) => {
                    self.observe(&devices);
                }
                Err(e) => warn!("Device watch error: {}", e),
            }
        }

        debug!("Device event stream for {} ended", self.serial);
    }
}
