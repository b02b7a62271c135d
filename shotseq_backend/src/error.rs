//! Error types for table construction, channel validation, shot storage and
//! acquisition slicing.
//!
//! All of them are plain `thiserror` enums so that the control crate can wrap
//! them with `#[from]` and propagate with `?`.

use thiserror::Error;

/// Problems found while building or validating channel sets, channel values
/// and instruction tables.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("Expecting channel name of format 'ao(number)', 'port(number)/line(number)' or 'dds(number)/freq|amp|phase', received {0}")]
    BadChannelName(String),

    #[error("Device {device} does not have channel {chan}")]
    UnknownChannel { device: String, chan: String },

    #[error("Channel {0} registered twice")]
    DuplicateChannel(String),

    #[error("Channel {chan}: invalid range [{min}, {max}] or resolution {resolution}")]
    BadChannelSpec {
        chan: String,
        min: f64,
        max: f64,
        resolution: f64,
    },

    #[error("Row {row} carries {found} fields while the table has {expected} columns")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Row {row} starts at t={start} which is before the previous row ended at t={prev}")]
    NonMonotonicTime { row: usize, start: f64, prev: f64 },

    #[error("Row {row} has invalid timing: {msg}")]
    BadTiming { row: usize, msg: String },

    #[error("Table for device {device} holds {len} rows, exceeding the device maximum of {max}")]
    Capacity {
        device: String,
        len: usize,
        max: usize,
    },
}

/// Failures reported by a [`crate::ShotStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Shot {0} is not known to the store")]
    UnknownShot(String),

    #[error("Results for shot {0} were already saved")]
    AlreadySaved(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Failures while reconstructing acquisition windows.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimelineError {
    #[error("Acquisition rate must be positive and finite, got {0}")]
    BadRate(f64),

    #[error("Window {label}: sample range {start}..={end} exceeds acquired buffer of {len} samples")]
    OutOfBuffer {
        label: String,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("Wait {0} has not been resolved yet")]
    UnresolvedWait(String),
}
