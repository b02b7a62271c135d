//! # Running a shot on several devices
//!
//! An [`Experiment`] groups the controllers of every device taking part in a shot. Each one
//! is held as a boxed [`BufferedDevice`], the object-safe view of a
//! [`SequenceController`], so devices of different hardware families (different
//! [`Channel`] implementations) sit side by side.
//!
//! [`Experiment::run_shot`] begins the shot on every device concurrently, then ends it on
//! every device concurrently, using [`rayon`]. If any device fails in either phase, every
//! device is aborted and the first error is returned, so the whole experiment is back in
//! manual mode.

use std::time::Duration;

use indexmap::IndexMap;
use log::{error, info};
use rayon::prelude::*;
use shotseq_backend::*;

use crate::cache::ProgramReport;
use crate::controller::*;
use crate::error::*;
use crate::hw::Channel;

/// Lifecycle of a device as seen by the experiment
pub trait BufferedDevice: Send {
    fn device_name(&self) -> &str;
    fn state(&self) -> RunState;
    fn abort_handle(&self) -> AbortHandle;
    fn begin_buffered(&mut self, shot_id: &ShotId, fresh: bool) -> SeqResult<ProgramReport>;
    fn end_buffered(&mut self, timeout: Duration) -> SeqResult<ShotOutcome>;
    fn abort(&mut self) -> SeqResult<()>;
}

impl<C: Channel, S: ShotStore + ?Sized> BufferedDevice for SequenceController<C, S> {
    fn device_name(&self) -> &str {
        SequenceController::device_name(self)
    }
    fn state(&self) -> RunState {
        SequenceController::state(self)
    }
    fn abort_handle(&self) -> AbortHandle {
        SequenceController::abort_handle(self)
    }
    fn begin_buffered(&mut self, shot_id: &ShotId, fresh: bool) -> SeqResult<ProgramReport> {
        SequenceController::begin_buffered(self, shot_id, fresh)
    }
    fn end_buffered(&mut self, timeout: Duration) -> SeqResult<ShotOutcome> {
        SequenceController::end_buffered(self, timeout)
    }
    fn abort(&mut self) -> SeqResult<()> {
        SequenceController::abort(self)
    }
}

#[derive(Default)]
pub struct Experiment {
    devices: IndexMap<String, Box<dyn BufferedDevice>>,
}

impl Experiment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device. Panics if a device with the same name was already added.
    pub fn add_device(&mut self, dev: Box<dyn BufferedDevice>) {
        let name = dev.device_name().to_string();
        assert!(
            !self.devices.contains_key(&name),
            "Device {name} already registered"
        );
        self.devices.insert(name, dev);
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }
    pub fn device(&self, name: &str) -> Option<&dyn BufferedDevice> {
        self.devices.get(name).map(|dev| dev.as_ref())
    }
    pub fn abort_handles(&self) -> Vec<AbortHandle> {
        self.devices.values().map(|dev| dev.abort_handle()).collect()
    }

    /// Runs `shot_id` on every device and returns the outcome of each, keyed by device name
    pub fn run_shot(
        &mut self,
        shot_id: &ShotId,
        fresh: bool,
        timeout: Duration,
    ) -> SeqResult<IndexMap<String, ShotOutcome>> {
        let mut timer = TickTimer::new();

        let begun: Vec<SeqResult<ProgramReport>> = self
            .devices
            .values_mut()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|dev| dev.begin_buffered(shot_id, fresh))
            .collect();
        if let Some(err) = begun.into_iter().find_map(|res| res.err()) {
            // Failures are logged by abort_all
            let _ = self.abort_all();
            return Err(err);
        }
        timer.tick_log(&format!("Shot {shot_id} begin"));

        let ended: Vec<SeqResult<ShotOutcome>> = self
            .devices
            .values_mut()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|dev| dev.end_buffered(timeout))
            .collect();
        let mut outcomes = IndexMap::with_capacity(ended.len());
        let mut first_err = None;
        for (name, res) in self.devices.keys().zip(ended) {
            match res {
                Ok(outcome) => {
                    outcomes.insert(name.clone(), outcome);
                }
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_err {
            // Failures are logged by abort_all
            let _ = self.abort_all();
            return Err(err);
        }
        timer.tick_log(&format!("Shot {shot_id} end"));
        info!("Shot {shot_id} done on {} devices", outcomes.len());
        Ok(outcomes)
    }

    /// Aborts every device. Returns the first error, after every device was attempted.
    pub fn abort_all(&mut self) -> SeqResult<()> {
        let results: Vec<(String, SeqResult<()>)> = self
            .devices
            .iter_mut()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|(name, dev)| (name.clone(), dev.abort()))
            .collect();
        let mut first = None;
        for (name, res) in results {
            if let Err(err) = res {
                error!("Abort of {name} failed: {err}");
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
