//! Error type of the control crate.
//!
//! [`SeqError`] consolidates everything that can go wrong while driving a shot. Errors from
//! the data model (`TableError`, `StoreError`, `TimelineError`) and hardware
//! (`ProtocolError`) convert with `#[from]`, so the controller propagates them with `?`.
//!
//! Only the controller decides what to do with an error. Nothing is retried automatically;
//! every fatal error aborts the shot and leaves the device in manual mode.

use std::time::Duration;

use shotseq_backend::{StoreError, TableError, TimelineError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::controller::RunState;
use crate::hw::ProtocolError;

/// Convenience alias for results using the control error type.
pub type SeqResult<T> = std::result::Result<T, SeqError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SeqError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Operation {op} is not allowed in state {state}")]
    State { op: &'static str, state: RunState },

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Program cache inconsistency: {0}")]
    CacheInconsistency(String),

    #[error("Shot aborted")]
    Aborted,

    #[error("Wait monitor error: {0}")]
    Monitor(String),

    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error("Shot store error: {0}")]
    Store(#[from] StoreError),

    #[error("Acquisition error: {0}")]
    Timeline(#[from] TimelineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SeqError {
    /// Whether the error ends the current shot. State errors are programming errors that
    /// leave the device untouched.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SeqError::State { .. } | SeqError::Config(_))
    }
}
