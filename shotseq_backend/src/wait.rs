//! Scripted waits and their measured outcome.
//!
//! A [`WaitSpec`] is one row of a shot's wait table: the label given in the script,
//! the nominal (pre-wait) time at which the experiment pauses and the timeout after
//! which it is retriggered. A [`WaitRecord`] starts out pending and is resolved exactly
//! once by the wait monitor.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaitSpec {
    pub label: String,
    pub scripted_time: f64,
    pub timeout: f64,
}
impl WaitSpec {
    pub fn new(label: &str, scripted_time: f64, timeout: f64) -> Self {
        Self {
            label: label.to_string(),
            scripted_time,
            timeout,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaitRecord {
    pub label: String,
    pub scripted_time: f64,
    pub timeout: f64,
    measured_duration: Option<f64>,
    timed_out: bool,
}

impl WaitRecord {
    /// Pending record for a scripted wait
    pub fn pending(spec: &WaitSpec) -> Self {
        Self {
            label: spec.label.clone(),
            scripted_time: spec.scripted_time,
            timeout: spec.timeout,
            measured_duration: None,
            timed_out: false,
        }
    }

    /// Resolves the record. A record is only ever resolved once; later calls are ignored
    /// and return `false`.
    pub fn resolve(&mut self, duration: f64, timed_out: bool) -> bool {
        if self.measured_duration.is_some() {
            return false;
        }
        self.measured_duration = Some(duration);
        self.timed_out = timed_out;
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.measured_duration.is_some()
    }
    pub fn measured_duration(&self) -> Option<f64> {
        self.measured_duration
    }
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

/// Total measured pause time of a set of resolved waits
pub fn total_wait_time(records: &[WaitRecord]) -> f64 {
    records.iter().filter_map(|w| w.measured_duration).sum()
}
