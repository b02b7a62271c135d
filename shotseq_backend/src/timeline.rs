//! Reconstruction of acquisition windows in the presence of waits.
//!
//! Acquisition windows are compiled with nominal timestamps, i.e. as if the experiment
//! never paused. An analog input that samples continuously, however, keeps running
//! through every wait. To find the samples belonging to a window we shift its start and
//! end by the measured duration of every wait that happened before them, then convert
//! the shifted times into sample indices of the raw buffer.
//!
//! ## Algorithm
//!
//! For a window `(t_start, t_end)`:
//!
//! 1. `t' = t + sum(d_w for every wait w with scripted_time < t)`. The comparison is strict,
//!    so a window that ends exactly where a wait starts is not stretched by it, and a
//!    window may end inside a wait.
//! 2. `i_start = ceil(rate * (t_start' - start_delay))`,
//!    `i_end = floor(rate * (t_end' - start_delay))`.
//! 3. `ceil`/`floor` of a float product can land one sample off in either direction. Both
//!    boundaries are corrected the same way, with a tolerance of `epsilon` relative to the
//!    boundary time: a sample lying on the boundary within tolerance belongs to the window,
//!    a sample beyond it does not.
//! 4. The trace holds samples `i_start..=i_end` with their true times
//!    `i / rate + start_delay`.
//!
//! The [`Timeline`] here is pure arithmetic; blocking until the waits are resolved is the
//! job of the control crate.

use ndarray::{s, Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::TimelineError;
use crate::wait::WaitRecord;

/// Default float correction for index boundaries
pub const DEFAULT_EPSILON: f64 = 2e-16;

/// Requested measurement window with nominal (pre-wait) timestamps
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionWindow {
    pub connection: String,
    pub label: String,
    pub start_time: f64,
    pub end_time: f64,
}
impl AcquisitionWindow {
    pub fn new(connection: &str, label: &str, start_time: f64, end_time: f64) -> Self {
        Self {
            connection: connection.to_string(),
            label: label.to_string(),
            start_time,
            end_time,
        }
    }
}

/// Named slice of the raw acquisition buffer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub connection: String,
    pub label: String,
    pub times: Array1<f64>,
    pub values: Array1<f64>,
}
impl Trace {
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Sample clock of a continuously acquiring input. See the [module docs](self).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timeline {
    rate: f64,
    start_delay: f64,
    epsilon: f64,
}

impl Timeline {
    /// # Errors
    /// [`TimelineError::BadRate`] unless `rate` is positive and finite.
    pub fn new(rate: f64, start_delay: f64, epsilon: f64) -> Result<Self, TimelineError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(TimelineError::BadRate(rate));
        }
        Ok(Self {
            rate,
            start_delay,
            epsilon,
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
    pub fn start_delay(&self) -> f64 {
        self.start_delay
    }

    /// Shifts a nominal time by the measured duration of every earlier wait.
    ///
    /// Waits scheduled at or after `t` are ignored and may still be pending.
    ///
    /// ```
    /// use shotseq_backend::timeline::Timeline;
    /// use shotseq_backend::wait::*;
    ///
    /// let mut wait = WaitRecord::pending(&WaitSpec::new("w0", 0.5, 10.0));
    /// wait.resolve(0.5, false);
    /// let waits = [wait];
    /// assert_eq!(Timeline::shifted_time(&waits, 1.0).unwrap(), 1.5);
    /// assert_eq!(Timeline::shifted_time(&waits, 0.5).unwrap(), 0.5);
    /// ```
    pub fn shifted_time(waits: &[WaitRecord], t: f64) -> Result<f64, TimelineError> {
        let mut shifted = t;
        for wait in waits.iter().filter(|w| w.scripted_time < t) {
            shifted += wait
                .measured_duration()
                .ok_or_else(|| TimelineError::UnresolvedWait(wait.label.clone()))?;
        }
        Ok(shifted)
    }

    /// Inclusive sample index range for shifted times, `None` if no sample falls inside.
    pub fn sample_range(&self, t_start: f64, t_end: f64) -> Option<(usize, usize)> {
        let mut i_start = (self.rate * (t_start - self.start_delay)).ceil();
        let mut i_end = (self.rate * (t_end - self.start_delay)).floor();

        let tol_start = self.epsilon * t_start.abs().max(1.0);
        if i_start >= 1.0 && self.sample_time(i_start - 1.0) >= t_start - tol_start {
            i_start -= 1.0;
        } else if self.sample_time(i_start) < t_start - tol_start {
            i_start += 1.0;
        }
        let tol_end = self.epsilon * t_end.abs().max(1.0);
        if self.sample_time(i_end + 1.0) <= t_end + tol_end {
            i_end += 1.0;
        } else if self.sample_time(i_end) > t_end + tol_end {
            i_end -= 1.0;
        }

        let i_start = i_start.max(0.0);
        if i_end < i_start {
            return None;
        }
        Some((i_start as usize, i_end as usize))
    }

    fn sample_time(&self, idx: f64) -> f64 {
        idx / self.rate + self.start_delay
    }

    /// Cuts one window out of the raw buffer.
    ///
    /// # Errors
    /// - [`TimelineError::UnresolvedWait`] if a wait before the window end is still pending.
    /// - [`TimelineError::OutOfBuffer`] if the window reaches past the acquired samples.
    pub fn slice(
        &self,
        window: &AcquisitionWindow,
        waits: &[WaitRecord],
        buffer: ArrayView1<f64>,
    ) -> Result<Trace, TimelineError> {
        let t_start = Self::shifted_time(waits, window.start_time)?;
        let t_end = Self::shifted_time(waits, window.end_time)?;

        let (times, values) = match self.sample_range(t_start, t_end) {
            None => (Array1::zeros(0), Array1::zeros(0)),
            Some((i_start, i_end)) => {
                if i_end >= buffer.len() {
                    return Err(TimelineError::OutOfBuffer {
                        label: window.label.clone(),
                        start: i_start,
                        end: i_end,
                        len: buffer.len(),
                    });
                }
                let times =
                    Array1::from_iter((i_start..=i_end).map(|i| self.sample_time(i as f64)));
                (times, buffer.slice(s![i_start..=i_end]).to_owned())
            }
        };
        Ok(Trace {
            connection: window.connection.clone(),
            label: window.label.clone(),
            times,
            values,
        })
    }

    pub fn slice_all(
        &self,
        windows: &[AcquisitionWindow],
        waits: &[WaitRecord],
        buffer: ArrayView1<f64>,
    ) -> Result<Vec<Trace>, TimelineError> {
        windows
            .iter()
            .map(|window| self.slice(window, waits, buffer))
            .collect()
    }

    /// Windows that can already be sliced while later waits are still pending: those
    /// ending no later than the scripted time of the first unresolved wait.
    pub fn ready_windows<'a>(
        windows: &'a [AcquisitionWindow],
        waits: &[WaitRecord],
    ) -> Vec<&'a AcquisitionWindow> {
        let horizon = waits
            .iter()
            .find(|w| !w.is_resolved())
            .map_or(f64::INFINITY, |w| w.scripted_time);
        windows.iter().filter(|w| w.end_time <= horizon).collect()
    }
}
