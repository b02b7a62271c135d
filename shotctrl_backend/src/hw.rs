//! Hardware-facing traits of the sequencing core.
//!
//! ## Overview
//!
//! The sequencing core never talks to a vendor SDK or a serial port directly. Each hardware
//! family implements a handful of narrow traits instead:
//!
//! - [`Channel`]: the output side of a device. Manual writes, instruction-table writes
//!   (bulk and per row), starting a buffered run, reporting its [`RunStatus`] and aborting.
//!   A [`crate::SequenceController`] is generic over it and owns it exclusively.
//! - [`CounterInput`]: a counter configured for semi-period measurement, wired to the
//!   device's wait/retrigger line. Owned exclusively by the wait-monitor thread.
//! - [`RetriggerOutput`]: an optional line that can force the hardware past a wait.
//! - [`AnalogInput`]: a continuously sampling input drained by the acquisition stream.
//!
//! ## Error Handling
//!
//! Every call that reaches hardware returns `Result<_, ProtocolError>`. A protocol error is
//! a malformed or NACKed response (wrong checksum, wrong length, driver error code) and
//! is always fatal to the current shot: the controller aborts and propagates it.
//!
//! ## Resource Management
//!
//! A `Channel` is owned by exactly one controller and closed through [`Channel::close`]
//! when the controller is dropped; there are no process-wide connection caches.

use std::fmt;
use std::time::Duration;

use shotseq_backend::*;
use thiserror::Error;

/// Malformed or NACKed hardware response
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Device {device} protocol error: {msg}")]
pub struct ProtocolError {
    pub device: String,
    pub msg: String,
}
impl ProtocolError {
    pub fn new(device: &str, msg: impl Into<String>) -> Self {
        Self {
            device: device.to_string(),
            msg: msg.into(),
        }
    }
}

/// Run status as reported by the hardware
#[derive(Clone, Debug, PartialEq)]
pub enum RunStatus {
    Idle,
    Armed,
    Running,
    Done,
    Fault(String),
}
impl RunStatus {
    /// Status reached once `start()` took effect
    pub fn is_armed(&self) -> bool {
        matches!(self, RunStatus::Armed | RunStatus::Running | RunStatus::Done)
    }
}
impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Armed => write!(f, "armed"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Done => write!(f, "done"),
            RunStatus::Fault(msg) => write!(f, "fault ({msg})"),
        }
    }
}

/// Output side of a device. One implementation per hardware family.
pub trait Channel: Send {
    fn device_name(&self) -> &str;
    fn channel_set(&self) -> &ChannelSet;

    /// Immediately applies already-coerced manual values
    fn write_manual(&mut self, values: &ChannelValues) -> Result<(), ProtocolError>;
    /// Replaces the whole instruction table in one transfer
    fn write_table(&mut self, rows: &[InstructionRow]) -> Result<(), ProtocolError>;
    /// Overwrites a single row of the instruction table
    fn write_row(&mut self, index: usize, row: &InstructionRow) -> Result<(), ProtocolError>;
    fn start(&mut self) -> Result<(), ProtocolError>;
    fn status(&mut self) -> RunStatus;
    fn abort_hw(&mut self) -> Result<(), ProtocolError>;

    /// Whether `write_table` is a real bulk transfer. Devices without one are programmed
    /// row by row even on full rewrites.
    fn supports_bulk(&self) -> bool {
        true
    }
    /// Informs the device that the table now ends at `len` rows. Devices that terminate
    /// tables with a stop instruction write it here.
    fn set_length(&mut self, _len: usize) -> Result<(), ProtocolError> {
        Ok(())
    }
    /// Releases the hardware handle
    fn close(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Counter configured for semi-period measurement
pub trait CounterInput: Send {
    fn name(&self) -> &str;
    /// Blocks up to `poll` for the next semi-period.
    /// Returns `Ok(None)` if no edge arrived in time.
    fn read_semi_period(&mut self, poll: Duration) -> Result<Option<u64>, ProtocolError>;
    /// Counter timebase; semi-periods are reported in ticks of it
    fn timebase_hz(&self) -> f64;
}

/// Line that forces the hardware past a wait
pub trait RetriggerOutput: Send {
    fn pulse(&mut self) -> Result<(), ProtocolError>;
}

/// Continuously sampling analog input
pub trait AnalogInput: Send {
    fn name(&self) -> &str;
    /// Blocks up to `poll` and returns at most `max` samples (possibly none)
    fn read_chunk(&mut self, max: usize, poll: Duration) -> Result<Vec<f64>, ProtocolError>;
    fn start(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }
    fn stop(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }
}
