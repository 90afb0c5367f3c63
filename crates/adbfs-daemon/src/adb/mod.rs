//! adb command-line backend
//!
//! Sessions are long-lived `adb -s <serial> shell -T` processes. Each command
//! is a small shell script whose output is framed by a marker line carrying
//! the exit status, so one process serves any number of commands in turn.
//! Device presence comes from polling `adb devices`.

mod devices;
mod shell;

pub use devices::{list_devices, parse_devices, watch_devices};
pub use shell::{classify_error, quote, AdbShellOpener, AdbShellSession};
