//! Per-device sequencing state machine.
//!
//! ## Overview
//!
//! A [`SequenceController`] owns one device [`Channel`] and moves it between manual mode,
//! where outputs follow the front panel, and buffered mode, where the device plays a
//! compiled instruction table:
//!
//! ```text
//! Manual -> TransitioningToBuffered -> Buffered -> TransitioningToManual -> Manual
//!                    |                    |                  |
//!                    +------------------> Aborting <---------+
//!                                            |
//!                                            v
//!                                          Manual
//! ```
//!
//! Lifecycle calls made in the wrong state fail with [`SeqError::State`] and leave the device
//! untouched. Every other error on the buffered path aborts the shot before it is returned,
//! so an unrecovered error always leaves the device in `Manual` with its pre-shot values.
//!
//! ## Shot flow
//!
//! `begin_buffered` loads the device's table from the [`ShotStore`], programs it through the
//! [`ProgramCache`], arms the [`WaitMonitor`] and the [`AcquisitionStream`] when they are
//! attached, starts the device and polls until it reports armed.
//!
//! A device acquiring data without a wait monitor of its own takes the measured waits from
//! the [`WaitSource`] of the device that owns one. A shot with waits and acquisition windows
//! on such a device fails to start when no source is attached.
//!
//! `end_buffered` polls until the device reports done, collects the measured waits, slices
//! the acquisition windows, saves the [`ShotResults`] and merges the values of the last table
//! row into the manual values.
//!
//! ## Aborting from another thread
//!
//! The controller is driven from a single thread. Other threads request an abort through an
//! [`AbortHandle`]; the blocking loops of `begin_buffered`/`end_buffered` observe the
//! request within one poll interval and run [`SequenceController::abort`] themselves.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use ndarray::Array1;
use shotseq_backend::*;

use crate::acquisition::*;
use crate::cache::*;
use crate::config::*;
use crate::error::*;
use crate::hw::*;
use crate::monitor::*;
use crate::notify::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunState {
    Manual,
    TransitioningToBuffered,
    Buffered,
    TransitioningToManual,
    Aborting,
}
impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Cloneable abort request flag of one controller
#[derive(Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}
impl AbortHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
    fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// What a device reports at the end of a shot
#[derive(Clone, Debug, PartialEq)]
pub struct ShotOutcome {
    pub final_values: ChannelValues,
    pub waits: Vec<WaitRecord>,
    pub traces: Vec<Trace>,
    pub failed_shot: bool,
    pub total_wait_time: f64,
}

/// Resources of the shot currently in flight
struct ShotInFlight {
    shot_id: ShotId,
    table: Option<InstructionTable>,
    run: Option<WaitRun>,
    stream: Option<AcquisitionStream>,
    windows: Vec<AcquisitionWindow>,
    /// Waits are measured by the device behind `upstream`
    upstream_waits: bool,
}
impl ShotInFlight {
    fn idle(shot_id: &ShotId) -> Self {
        Self {
            shot_id: shot_id.clone(),
            table: None,
            run: None,
            stream: None,
            windows: Vec::new(),
            upstream_waits: false,
        }
    }
}

fn keep_first(first: &mut Option<SeqError>, res: SeqResult<()>) {
    if let Err(err) = res {
        error!("Abort step failed: {err}");
        first.get_or_insert(err);
    }
}

pub struct SequenceController<C: Channel, S: ShotStore + ?Sized> {
    chan: C,
    store: Arc<S>,
    cache: ProgramCache,
    state: RunState,
    manual_values: ChannelValues,
    pre_shot: Option<ChannelValues>,
    shot: Option<ShotInFlight>,
    monitor: Option<WaitMonitor>,
    wait_source: WaitSource,
    upstream: Option<WaitSource>,
    analog_in: Option<SharedInput>,
    notify: Arc<dyn Notify>,
    cfg: ControllerConfig,
    abort_handle: AbortHandle,
    closed: bool,
}

impl<C: Channel, S: ShotStore + ?Sized> SequenceController<C, S> {
    pub fn new(chan: C, store: Arc<S>, cfg: ControllerConfig) -> SeqResult<Self> {
        cfg.validate()?;
        info!(
            "{}: controller created with {} channels",
            chan.device_name(),
            chan.channel_set().len()
        );
        Ok(Self {
            chan,
            store,
            cache: ProgramCache::new(cfg.cache.clone()),
            state: RunState::Manual,
            manual_values: ChannelValues::default(),
            pre_shot: None,
            shot: None,
            monitor: None,
            wait_source: WaitSource::new(),
            upstream: None,
            analog_in: None,
            notify: Arc::new(NullNotify),
            cfg,
            abort_handle: AbortHandle::default(),
            closed: false,
        })
    }

    /// Replaces the notification listener. Attach it before the wait monitor, which
    /// reports to the listener that was set when it was attached.
    pub fn with_notify(mut self, notify: Arc<dyn Notify>) -> Self {
        self.notify = notify;
        self
    }

    /// Starts a wait monitor thread owning `counter` and the optional `retrigger` line
    pub fn with_wait_monitor(
        mut self,
        counter: Box<dyn CounterInput>,
        retrigger: Option<Box<dyn RetriggerOutput>>,
    ) -> SeqResult<Self> {
        let monitor = WaitMonitor::new(
            self.chan.device_name(),
            counter,
            retrigger,
            self.notify.clone(),
            self.cfg.monitor.clone(),
        )?;
        self.monitor = Some(monitor);
        Ok(self)
    }

    /// Takes the measured waits of every shot from another device's wait monitor
    pub fn with_wait_source(mut self, source: WaitSource) -> Self {
        self.upstream = Some(source);
        self
    }

    pub fn with_analog_input(mut self, input: SharedInput) -> Self {
        self.analog_in = Some(input);
        self
    }

    pub fn device_name(&self) -> &str {
        self.chan.device_name()
    }
    pub fn state(&self) -> RunState {
        self.state
    }
    pub fn manual_values(&self) -> &ChannelValues {
        &self.manual_values
    }
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }
    pub fn cache(&self) -> &ProgramCache {
        &self.cache
    }
    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }
    /// Runs of this device's wait monitor, for devices sharing its waits. `None` without
    /// a monitor.
    pub fn wait_source(&self) -> Option<WaitSource> {
        self.monitor.as_ref().map(|_| self.wait_source.clone())
    }
    /// Wait run of the shot in flight, for listeners that want waits as they resolve
    pub fn wait_run(&self) -> Option<WaitRun> {
        self.shot.as_ref().and_then(|shot| shot.run.clone())
    }

    fn set_state(&mut self, state: RunState) {
        debug!("{}: {} -> {}", self.device_name(), self.state, state);
        self.state = state;
        self.notify.run_status_changed(self.chan.device_name(), state);
    }

    fn require(&self, expected: RunState, op: &'static str) -> SeqResult<()> {
        if self.state != expected {
            return Err(SeqError::State {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Applies front-panel values right away. Returns the values as the hardware applies
    /// them, after clamping and quantization.
    pub fn program_manual(&mut self, values: &ChannelValues) -> SeqResult<ChannelValues> {
        self.require(RunState::Manual, "program_manual")?;
        let coerced = self.chan.channel_set().coerce(values)?;
        self.chan.write_manual(&coerced)?;
        self.manual_values.merge(&coerced);
        Ok(coerced)
    }

    /// Programs and arms the device for `shot_id`. With `fresh` the cache is bypassed and
    /// the whole table is rewritten.
    pub fn begin_buffered(&mut self, shot_id: &ShotId, fresh: bool) -> SeqResult<ProgramReport> {
        self.require(RunState::Manual, "begin_buffered")?;
        self.abort_handle.clear();
        self.set_state(RunState::TransitioningToBuffered);
        self.pre_shot = Some(self.manual_values.clone());

        match self.begin_inner(shot_id, fresh) {
            Ok(report) => {
                self.set_state(RunState::Buffered);
                Ok(report)
            }
            Err(err) => {
                warn!("{}: shot {shot_id} failed to start: {err}", self.device_name());
                if let Err(abort_err) = self.abort() {
                    error!("{}: abort after failed start: {abort_err}", self.device_name());
                }
                Err(err)
            }
        }
    }

    fn begin_inner(&mut self, shot_id: &ShotId, fresh: bool) -> SeqResult<ProgramReport> {
        let mut timer = TickTimer::new();
        let table = match self.store.load_instructions(shot_id, self.chan.device_name()) {
            Some(table) if !table.is_empty() => table,
            _ => {
                info!("{}: no instructions in shot {shot_id}", self.device_name());
                self.shot = Some(ShotInFlight::idle(shot_id));
                return Ok(ProgramReport::Unchanged);
            }
        };
        for id in table.columns() {
            self.chan.channel_set().spec(id)?;
        }

        let report = self.cache.program(&mut self.chan, &table, fresh)?;
        timer.tick_log(&format!("{} programming", self.device_name()));

        let mut windows = self
            .store
            .load_acquisition_windows(shot_id, self.chan.device_name());
        if !windows.is_empty() && self.analog_in.is_none() {
            warn!(
                "{}: {} acquisition windows requested but no analog input attached",
                self.device_name(),
                windows.len()
            );
            windows.clear();
        }

        let specs = self.store.load_wait_table(shot_id);
        let mut upstream_waits = false;
        let run = match self.monitor.as_mut() {
            Some(monitor) if !specs.is_empty() => {
                let run = monitor.arm(specs)?;
                self.wait_source.publish(shot_id, run.clone());
                Some(run)
            }
            Some(_) => None,
            None if specs.is_empty() || windows.is_empty() => None,
            None if self.upstream.is_some() => {
                upstream_waits = true;
                None
            }
            None => {
                return Err(SeqError::Monitor(format!(
                    "{}: shot {shot_id} has {} waits but no wait monitor or wait source to place its acquisition windows",
                    self.chan.device_name(),
                    specs.len()
                )))
            }
        };

        self.shot = Some(ShotInFlight {
            shot_id: shot_id.clone(),
            table: Some(table),
            run,
            stream: None,
            windows,
            upstream_waits,
        });

        if let Some(input) = &self.analog_in {
            let stream = AcquisitionStream::start(input.clone(), &self.cfg.acquisition)?;
            if let Some(shot) = self.shot.as_mut() {
                shot.stream = Some(stream);
            }
        }

        self.chan.start()?;
        self.poll_status("armed", self.cfg.arm_timeout(), RunStatus::is_armed)?;
        timer.tick_log(&format!("{} arm", self.device_name()));
        info!("{}: armed for shot {shot_id}", self.device_name());
        Ok(report)
    }

    /// Polls `status()` until `reached` holds, the device faults, an abort is requested or
    /// `timeout` elapses. Drains the acquisition queue between polls.
    fn poll_status(
        &mut self,
        what: &str,
        timeout: Duration,
        reached: impl Fn(&RunStatus) -> bool,
    ) -> SeqResult<()> {
        let start = Instant::now();
        loop {
            if self.abort_handle.is_requested() {
                return Err(SeqError::Aborted);
            }
            let status = self.chan.status();
            if let RunStatus::Fault(msg) = &status {
                return Err(ProtocolError::new(self.chan.device_name(), format!("device fault: {msg}")).into());
            }
            if reached(&status) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(SeqError::Timeout {
                    what: format!("{} to become {what} (last status {status})", self.device_name()),
                    after: timeout,
                });
            }
            if let Some(stream) = self.shot.as_mut().and_then(|shot| shot.stream.as_mut()) {
                stream.drain();
            }
            thread::sleep(self.cfg.status_poll());
        }
    }

    /// Waits for every wait record of the run, observing abort requests
    fn await_waits(&mut self, run: &WaitRun, timeout: Duration) -> SeqResult<()> {
        let start = Instant::now();
        while !run.is_finished() {
            if self.abort_handle.is_requested() {
                return Err(SeqError::Aborted);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(SeqError::Timeout {
                    what: format!("{} of {} waits to resolve", run.len() - run.resolved().len(), run.len()),
                    after: timeout,
                });
            }
            let slice = self.cfg.status_poll().min(timeout - elapsed);
            // Either outcome is handled on the next iteration or by the caller
            let _ = run.wait_all(slice);
        }
        Ok(())
    }

    /// Waits for the shot to complete and returns to manual mode
    pub fn end_buffered(&mut self, timeout: Duration) -> SeqResult<ShotOutcome> {
        self.require(RunState::Buffered, "end_buffered")?;
        self.set_state(RunState::TransitioningToManual);

        match self.end_inner(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(err @ SeqError::Timeout { .. })
                if self.cfg.timeout_policy == TimeoutPolicy::LogAndContinue =>
            {
                self.fail_shot(err)
            }
            Err(err) => {
                warn!("{}: shot failed: {err}", self.device_name());
                if let Err(abort_err) = self.abort() {
                    error!("{}: abort after failed shot: {abort_err}", self.device_name());
                }
                Err(err)
            }
        }
    }

    fn end_inner(&mut self, timeout: Duration) -> SeqResult<ShotOutcome> {
        let mut timer = TickTimer::new();
        let deadline = Instant::now() + timeout;
        let (has_table, mut run) = match &self.shot {
            Some(shot) => (shot.table.is_some(), shot.run.clone()),
            None => (false, None),
        };

        if has_table {
            self.poll_status("done", timeout, |status| *status == RunStatus::Done)?;
            timer.tick_log(&format!("{} run", self.device_name()));
        }
        // Kept out of the shot so an abort here leaves the owner's run alone
        if let Some(shot) = self.shot.as_ref().filter(|shot| shot.upstream_waits) {
            let upstream = self
                .upstream
                .as_ref()
                .and_then(|source| source.run_for(&shot.shot_id))
                .ok_or_else(|| {
                    SeqError::Monitor(format!(
                        "{}: no wait run published for shot {}",
                        self.chan.device_name(),
                        shot.shot_id
                    ))
                })?;
            run = Some(upstream);
        }
        if let Some(run) = &run {
            self.await_waits(run, deadline.saturating_duration_since(Instant::now()))?;
        }

        let shot = self.shot.take().ok_or_else(|| SeqError::State {
            op: "end_buffered",
            state: self.state,
        })?;
        let ShotInFlight {
            shot_id,
            table,
            stream,
            windows,
            ..
        } = shot;

        let buffer = match stream {
            Some(stream) => stream.stop()?,
            None => Array1::zeros(0),
        };
        let timeline = AcquisitionTimeline::new(&self.cfg.acquisition, windows)?;
        let (waits, traces) = timeline.assemble_blocking(
            run.as_ref(),
            buffer.view(),
            deadline.saturating_duration_since(Instant::now()),
        )?;

        let final_values = match &table {
            Some(table) => table.final_values(self.chan.channel_set())?,
            None => ChannelValues::default(),
        };
        let total_wait_time = total_wait_time(&waits);

        self.store.save_results(
            &shot_id,
            ShotResults {
                device: self.device_name().to_string(),
                waits: waits.clone(),
                traces: traces.clone(),
                final_values: final_values.clone(),
                failed_shot: false,
            },
        )?;
        timer.tick_log(&format!("{} results", self.device_name()));

        self.manual_values.merge(&final_values);
        self.pre_shot = None;
        self.set_state(RunState::Manual);
        info!(
            "{}: shot {shot_id} done, {} waits ({total_wait_time:.6} s), {} traces",
            self.device_name(),
            waits.len(),
            traces.len()
        );
        Ok(ShotOutcome {
            final_values,
            waits,
            traces,
            failed_shot: false,
            total_wait_time,
        })
    }

    /// Timeout under `TimeoutPolicy::LogAndContinue`: abort, keep what was measured and save
    /// the shot flagged as failed.
    fn fail_shot(&mut self, err: SeqError) -> SeqResult<ShotOutcome> {
        warn!("{}: {err}, shot marked as failed", self.device_name());
        let shot_id = self.shot.as_ref().map(|shot| shot.shot_id.clone());
        let waits = self.wait_run().map(|run| run.resolved()).unwrap_or_default();
        let abort_res = self.abort();

        let total_wait_time = total_wait_time(&waits);
        if let Some(shot_id) = shot_id {
            self.store.save_results(
                &shot_id,
                ShotResults {
                    device: self.device_name().to_string(),
                    waits: waits.clone(),
                    traces: Vec::new(),
                    final_values: ChannelValues::default(),
                    failed_shot: true,
                },
            )?;
        }
        abort_res?;
        Ok(ShotOutcome {
            final_values: ChannelValues::default(),
            waits,
            traces: Vec::new(),
            failed_shot: true,
            total_wait_time,
        })
    }

    /// Stops the shot in flight and returns to manual mode with the pre-shot values.
    /// A no-op in manual mode. Every step is attempted even if an earlier one failed;
    /// the first error is returned.
    pub fn abort(&mut self) -> SeqResult<()> {
        if self.state == RunState::Manual {
            return Ok(());
        }
        warn!("{}: aborting from {}", self.device_name(), self.state);
        self.set_state(RunState::Aborting);
        let mut first = None;

        keep_first(&mut first, self.chan.abort_hw().map_err(SeqError::from));
        if let Some(shot) = self.shot.take() {
            if let Some(run) = &shot.run {
                run.cancel();
            }
            if let Some(stream) = shot.stream {
                stream.discard();
            }
        }
        if let Some(monitor) = self.monitor.as_mut() {
            keep_first(&mut first, monitor.abort(self.cfg.monitor.abort_grace()));
        }
        self.cache.invalidate();
        if let Some(values) = self.pre_shot.take() {
            if !values.is_empty() {
                keep_first(&mut first, self.chan.write_manual(&values).map_err(SeqError::from));
            }
            self.manual_values = values;
        }

        self.abort_handle.clear();
        self.set_state(RunState::Manual);
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Aborts any shot in flight and releases the channel
    pub fn close(&mut self) -> SeqResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let abort_res = self.abort();
        self.chan.close()?;
        info!("{}: closed", self.device_name());
        abort_res
    }
}

impl<C: Channel, S: ShotStore + ?Sized> Drop for SequenceController<C, S> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("{}: error while closing: {err}", self.device_name());
        }
    }
}
