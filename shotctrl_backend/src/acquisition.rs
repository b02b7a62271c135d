//! Analog acquisition of a shot.
//!
//! [`AcquisitionStream`] drains an [`AnalogInput`] on a short-lived thread while the shot
//! runs. [`AcquisitionTimeline`] cuts the requested windows out of the acquired buffer once
//! the measured wait durations are known.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use ndarray::{Array1, ArrayView1};
use parking_lot::Mutex;
use shotseq_backend::*;

use crate::config::AcquisitionConfig;
use crate::error::*;
use crate::hw::*;
use crate::monitor::WaitRun;

/// Analog input shared between the controller and the stream thread of the current shot
pub type SharedInput = Arc<Mutex<Box<dyn AnalogInput>>>;

pub fn shared_input(input: impl AnalogInput + 'static) -> SharedInput {
    Arc::new(Mutex::new(Box::new(input)))
}

pub struct AcquisitionTimeline {
    timeline: Timeline,
    windows: Vec<AcquisitionWindow>,
}

impl AcquisitionTimeline {
    pub fn new(cfg: &AcquisitionConfig, windows: Vec<AcquisitionWindow>) -> SeqResult<Self> {
        Ok(Self {
            timeline: Timeline::new(cfg.rate, cfg.start_delay_s, cfg.epsilon)?,
            windows,
        })
    }

    pub fn windows(&self) -> &[AcquisitionWindow] {
        &self.windows
    }

    /// Windows that can be sliced with the waits resolved so far
    pub fn ready(&self, run: Option<&WaitRun>) -> Vec<AcquisitionWindow> {
        let waits = run.map(|run| run.snapshot()).unwrap_or_default();
        Timeline::ready_windows(&self.windows, &waits)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Slices every window with the given wait records
    pub fn assemble(&self, waits: &[WaitRecord], buffer: ArrayView1<f64>) -> SeqResult<Vec<Trace>> {
        Ok(self.timeline.slice_all(&self.windows, waits, buffer)?)
    }

    /// Blocks until every wait of `run` resolved, then slices every window. Without a run
    /// the nominal timestamps are used right away.
    pub fn assemble_blocking(
        &self,
        run: Option<&WaitRun>,
        buffer: ArrayView1<f64>,
        timeout: Duration,
    ) -> SeqResult<(Vec<WaitRecord>, Vec<Trace>)> {
        let waits = match run {
            Some(run) if !run.is_empty() => run.wait_all(timeout)?,
            _ => Vec::new(),
        };
        let traces = self.assemble(&waits, buffer)?;
        Ok((waits, traces))
    }
}

/// Background reader of an analog input for the duration of one shot
pub struct AcquisitionStream {
    name: String,
    stop: Arc<AtomicBool>,
    chunk_recvr: Receiver<Vec<f64>>,
    handle: Option<JoinHandle<Result<(), ProtocolError>>>,
    samples: Vec<f64>,
}

impl AcquisitionStream {
    pub fn start(input: SharedInput, cfg: &AcquisitionConfig) -> SeqResult<Self> {
        let name = {
            let mut guard = input.lock();
            guard.start()?;
            guard.name().to_string()
        };
        let (chunk_sendr, chunk_recvr) = bounded(cfg.queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let chunk_len = cfg.chunk_len;
        let poll = Duration::from_millis(cfg.poll_interval_ms);
        let drain_grace = Duration::from_millis(cfg.drain_grace_ms);

        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("{name}-acquisition"))
            .spawn(move || {
                Self::read_loop(input, chunk_sendr, thread_stop, chunk_len, poll, drain_grace)
            })
            .map_err(|err| SeqError::Monitor(format!("could not spawn acquisition thread: {err}")))?;
        debug!("{name}: acquisition started");

        Ok(Self {
            name,
            stop,
            chunk_recvr,
            handle: Some(handle),
            samples: Vec::new(),
        })
    }

    fn read_loop(
        input: SharedInput,
        chunk_sendr: Sender<Vec<f64>>,
        stop: Arc<AtomicBool>,
        chunk_len: usize,
        poll: Duration,
        drain_grace: Duration,
    ) -> Result<(), ProtocolError> {
        let mut input = input.lock();
        while !stop.load(Ordering::SeqCst) {
            let chunk = match input.read_chunk(chunk_len, poll) {
                Ok(chunk) => chunk,
                Err(err) => {
                    // The read error is the one reported
                    let _ = input.stop();
                    return Err(err);
                }
            };
            if !chunk.is_empty() && chunk_sendr.send(chunk).is_err() {
                return input.stop();
            }
        }
        input.stop()?;

        // Samples buffered before the stop, bounded for inputs that never run dry
        let deadline = Instant::now() + drain_grace;
        while Instant::now() < deadline {
            let chunk = input.read_chunk(chunk_len, poll)?;
            if chunk.is_empty() || chunk_sendr.send(chunk).is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Moves queued chunks into the local buffer. Called while the shot runs so the
    /// reader thread never blocks on a full queue.
    pub fn drain(&mut self) {
        for chunk in self.chunk_recvr.try_iter() {
            self.samples.extend(chunk);
        }
    }

    pub fn samples_so_far(&self) -> usize {
        self.samples.len()
    }

    /// Stops the reader and returns everything acquired
    pub fn stop(mut self) -> SeqResult<Array1<f64>> {
        self.stop.store(true, Ordering::SeqCst);
        // Drain until the reader drops its sender
        for chunk in self.chunk_recvr.iter() {
            self.samples.extend(chunk);
        }
        let res = match self.handle.take().map(|handle| handle.join()) {
            Some(Ok(res)) => res.map_err(SeqError::from),
            Some(Err(_)) => Err(SeqError::Monitor(format!(
                "{} acquisition thread panicked",
                self.name
            ))),
            None => Ok(()),
        };
        res?;
        debug!("{}: acquired {} samples", self.name, self.samples.len());
        Ok(Array1::from_vec(std::mem::take(&mut self.samples)))
    }

    /// Stops the reader and drops the data
    pub fn discard(self) {
        let name = self.name.clone();
        if let Err(err) = self.stop() {
            warn!("{name}: acquisition error while discarding: {err}");
        }
    }
}

impl Drop for AcquisitionStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            for _ in self.chunk_recvr.iter() {}
            let _ = handle.join();
        }
    }
}
