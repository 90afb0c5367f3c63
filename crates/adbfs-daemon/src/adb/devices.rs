//! Device presence polling

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::Stream;
use tokio::process::Command;
use tracing::{debug, trace};

use adbfs_core::ClientError;

/// Parse `adb devices` output into the set of serials in the `device` state.
///
/// Devices that are `offline` or `unauthorized` cannot serve commands and
/// are treated as absent.
pub fn parse_devices(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            match fields.next() {
                Some("device") => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Run `adb devices` once
pub async fn list_devices(program: &Path) -> Result<HashSet<String>, ClientError> {
    let output = Command::new(program)
        .arg("devices")
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ClientError::Connection(format!("{}: {}", program.display(), e)))?;

    if !output.status.success() {
        return Err(ClientError::Connection(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
}

struct Poll {
    program: PathBuf,
    interval: Duration,
    last: Option<HashSet<String>>,
    failing: bool,
    first: bool,
}

/// Poll the device list, yielding the serial set whenever it changes.
///
/// The first successful poll is always yielded. A failing poll is yielded
/// once per failure streak. The stream never ends on its own.
pub fn watch_devices(
    program: PathBuf,
    interval: Duration,
) -> impl Stream<Item = Result<HashSet<String>, ClientError>> {
    let state = Poll {
        program,
        interval,
        last: None,
        failing: false,
        first: true,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if !state.first {
                tokio::time::sleep(state.interval).await;
            }
            state.first = false;

            match list_devices(&state.program).await {
                Ok(devices) => {
                    state.failing = false;
                    if state.last.as_ref() == Some(&devices) {
                        trace!("Device set unchanged");
                        continue;
                    }
                    debug!("Device set changed: {:?}", devices);
                    state.last = Some(devices.clone());
                    return Some((Ok(devices), state));
                }
                Err(e) => {
                    if state.failing {
                        continue;
                    }
                    state.failing = true;
                    return Some((Err(e), state));
                }
            }
        }
    })
}
