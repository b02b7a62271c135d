//! Wait monitor.
//!
//! A long-lived thread per device that owns the counter wired to the device's wait line
//! and, optionally, the retrigger output. [`WaitMonitor::arm`] hands it the wait table of
//! a shot and returns a [`WaitRun`] through which the controller (or anyone holding a clone)
//! observes the measured waits.
//!
//! ## Measurement
//!
//! The counter measures semi-periods of the wait line in ticks of its timebase. Every wait
//! produces two of them: the first ends when the hardware pauses, the second when it
//! resumes. The second one is the wait duration.
//!
//! If the second edge does not arrive within `timeout + software_margin_s` after the first,
//! the monitor pulses the retrigger output once and keeps reading. Such a wait is reported
//! as timed out with its scripted timeout as duration. Without a retrigger output the
//! monitor can only warn and keep waiting.
//!
//! ## Publication
//!
//! Waits resolve strictly in table order. Each one is posted to its own [`OneShot`] event
//! and announced with [`Notify::wait_completed`]; after the last one
//! [`Notify::all_waits_finished`] is called and the complete record list is posted.
//!
//! ## Cancellation
//!
//! The read loop checks the run's cancel flag after every counter poll, so a cancel takes
//! effect within `poll_interval_ms`. A cancelled run posts an error and its unresolved
//! records are dropped.
//!
//! ## Sharing
//!
//! Only one device of an experiment is wired to the wait line. Its controller publishes
//! every run it arms on a [`WaitSource`], which devices acquiring data without a counter
//! of their own use to shift their windows by the same measured waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shotseq_backend::*;

use crate::config::MonitorConfig;
use crate::error::*;
use crate::event::OneShot;
use crate::hw::*;
use crate::notify::Notify;

const CANCELLED: &str = "wait run cancelled";

/// Handle of one armed shot. Cheap to clone.
#[derive(Clone)]
pub struct WaitRun {
    specs: Arc<Vec<WaitSpec>>,
    events: Arc<Vec<OneShot<WaitRecord>>>,
    finished: OneShot<Result<Vec<WaitRecord>, String>>,
    stopped: OneShot<()>,
    cancel: Arc<AtomicBool>,
}

impl WaitRun {
    fn new(specs: Vec<WaitSpec>) -> Self {
        let events = specs.iter().map(|_| OneShot::new()).collect();
        Self {
            specs: Arc::new(specs),
            events: Arc::new(events),
            finished: OneShot::new(),
            stopped: OneShot::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
    pub fn specs(&self) -> &[WaitSpec] {
        &self.specs
    }

    /// Records resolved so far, in table order
    pub fn resolved(&self) -> Vec<WaitRecord> {
        self.events.iter().map_while(|ev| ev.peek()).collect()
    }

    /// Resolved records followed by pending ones for the rest of the table
    pub fn snapshot(&self) -> Vec<WaitRecord> {
        self.specs
            .iter()
            .zip(self.events.iter())
            .map(|(spec, ev)| ev.peek().unwrap_or_else(|| WaitRecord::pending(spec)))
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_posted()
    }

    /// Blocks until every wait resolved
    pub fn wait_all(&self, timeout: Duration) -> SeqResult<Vec<WaitRecord>> {
        match self.finished.wait_timeout(timeout) {
            Some(Ok(records)) => Ok(records),
            Some(Err(msg)) => Err(SeqError::Monitor(msg)),
            None => Err(SeqError::Timeout {
                what: format!("{} wait records", self.specs.len()),
                after: timeout,
            }),
        }
    }

    /// Blocks until wait `index` resolved
    pub fn wait_for(&self, index: usize, timeout: Duration) -> SeqResult<WaitRecord> {
        let ev = self.events.get(index).ok_or_else(|| {
            SeqError::Monitor(format!(
                "wait index {index} out of range, the shot has {} waits",
                self.specs.len()
            ))
        })?;
        match ev.wait_timeout(timeout) {
            Some(record) => Ok(record),
            None => match self.finished.peek() {
                Some(Err(msg)) => Err(SeqError::Monitor(msg)),
                _ => Err(SeqError::Timeout {
                    what: format!("wait {}", self.specs[index].label),
                    after: timeout,
                }),
            },
        }
    }

    /// Asks the monitor thread to drop this run
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Latest wait run of one monitor, tagged with its shot
#[derive(Clone, Default)]
pub struct WaitSource {
    latest: Arc<Mutex<Option<(ShotId, WaitRun)>>>,
}

impl WaitSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, shot_id: &ShotId, run: WaitRun) {
        *self.latest.lock() = Some((shot_id.clone(), run));
    }

    /// Run armed for `shot_id`, `None` if the owner has not armed one for it
    pub fn run_for(&self, shot_id: &ShotId) -> Option<WaitRun> {
        match &*self.latest.lock() {
            Some((id, run)) if id == shot_id => Some(run.clone()),
            _ => None,
        }
    }
}

enum MonitorCmd {
    Run(WaitRun),
    Close,
}

/// State owned by the monitor thread
struct MonitorWorker {
    device: String,
    counter: Box<dyn CounterInput>,
    retrigger: Option<Box<dyn RetriggerOutput>>,
    notify: Arc<dyn Notify>,
    cfg: MonitorConfig,
}


impl MonitorWorker {
    fn event_loop(mut self, cmd_recvr: Receiver<MonitorCmd>) {
        debug!("{}: wait monitor started", self.device);
        loop {
            match cmd_recvr.recv() {
                Ok(MonitorCmd::Run(run)) => {
                    let outcome = self.run(&run);
                    if let Err(msg) = &outcome {
                        if msg != CANCELLED {
                            error!("{}: wait monitor run failed: {msg}", self.device);
                        }
                    }
                    let _ = run.stopped.post(());
                    let _ = run.finished.post(outcome);
                }
                Ok(MonitorCmd::Close) | Err(_) => break,
            }
        }
        debug!("{}: wait monitor stopped", self.device);
    }

    fn run(&mut self, run: &WaitRun) -> Result<Vec<WaitRecord>, String> {
        let mut records = Vec::with_capacity(run.len());
        for (spec, ev) in run.specs.iter().zip(run.events.iter()) {
            let record = match self.measure(run, spec)? {
                Some(record) => record,
                None => return Err(CANCELLED.to_string()),
            };
            info!(
                "{}: wait {} lasted {:.6} s{}",
                self.device,
                spec.label,
                record.measured_duration().unwrap_or(spec.timeout),
                if record.timed_out() { " (timed out)" } else { "" }
            );
            let _ = ev.post(record.clone());
            self.notify.wait_completed(&spec.label);
            records.push(record);
        }
        self.notify.all_waits_finished();
        Ok(records)
    }

    /// Measures one wait. `None` if the run was cancelled.
    fn measure(&mut self, run: &WaitRun, spec: &WaitSpec) -> Result<Option<WaitRecord>, String> {
        let poll = self.cfg.poll_interval();

        // Semi-period ending when the hardware pauses
        loop {
            if run.is_cancelled() {
                return Ok(None);
            }
            if self.read(poll)?.is_some() {
                break;
            }
        }

        // An infinite timeout never retriggers
        let deadline = Duration::try_from_secs_f64(spec.timeout + self.cfg.software_margin_s)
            .ok()
            .and_then(|limit| Instant::now().checked_add(limit));
        let mut retriggered = false;
        let mut warned = false;
        loop {
            if run.is_cancelled() {
                return Ok(None);
            }
            if let Some(ticks) = self.read(poll)? {
                let mut record = WaitRecord::pending(spec);
                if retriggered {
                    record.resolve(spec.timeout, true);
                } else {
                    record.resolve(ticks as f64 / self.counter.timebase_hz(), false);
                }
                return Ok(Some(record));
            }
            match deadline {
                Some(deadline) if !retriggered && Instant::now() >= deadline => {}
                _ => continue,
            }
            match self.retrigger.as_mut() {
                Some(retrigger) => {
                    warn!(
                        "{}: wait {} exceeded its {} s timeout, retriggering",
                        self.device, spec.label, spec.timeout
                    );
                    retrigger.pulse().map_err(|err| err.to_string())?;
                    retriggered = true;
                }
                None if !warned => {
                    warn!(
                        "{}: wait {} exceeded its {} s timeout and there is no retrigger output, waiting indefinitely",
                        self.device, spec.label, spec.timeout
                    );
                    warned = true;
                }
                None => {}
            }
        }
    }

    fn read(&mut self, poll: Duration) -> Result<Option<u64>, String> {
        self.counter
            .read_semi_period(poll)
            .map_err(|err| err.to_string())
    }
}

/// Owner of the monitor thread. Dropping it cancels the current run and joins the thread.
pub struct WaitMonitor {
    device: String,
    cmd_sendr: Sender<MonitorCmd>,
    handle: Option<JoinHandle<()>>,
    current: Option<WaitRun>,
    has_retrigger: bool,
}

impl WaitMonitor {
    pub fn new(
        device: &str,
        counter: Box<dyn CounterInput>,
        retrigger: Option<Box<dyn RetriggerOutput>>,
        notify: Arc<dyn Notify>,
        cfg: MonitorConfig,
    ) -> SeqResult<Self> {
        let (cmd_sendr, cmd_recvr) = bounded(cfg.command_capacity.max(1));
        let has_retrigger = retrigger.is_some();
        if !has_retrigger {
            warn!("{device}: wait monitor has no retrigger output, timed-out waits cannot be forced");
        }
        let worker = MonitorWorker {
            device: device.to_string(),
            counter,
            retrigger,
            notify,
            cfg,
        };
        let handle = thread::Builder::new()
            .name(format!("{device}-wait-monitor"))
            .spawn(move || worker.event_loop(cmd_recvr))
            .map_err(|err| SeqError::Monitor(format!("could not spawn monitor thread: {err}")))?;
        Ok(Self {
            device: device.to_string(),
            cmd_sendr,
            handle: Some(handle),
            current: None,
            has_retrigger,
        })
    }

    pub fn has_retrigger(&self) -> bool {
        self.has_retrigger
    }
    pub fn current(&self) -> Option<&WaitRun> {
        self.current.as_ref()
    }

    /// Starts measuring the waits of a new shot from wait index 0.
    ///
    /// # Errors
    /// [`SeqError::Monitor`] if a wait timeout is negative or NaN, or if the previous run
    /// has not stopped.
    pub fn arm(&mut self, specs: Vec<WaitSpec>) -> SeqResult<WaitRun> {
        if let Some(spec) = specs
            .iter()
            .find(|spec| spec.timeout.is_nan() || spec.timeout < 0.0)
        {
            return Err(SeqError::Monitor(format!(
                "{}: wait {} has invalid timeout {}",
                self.device, spec.label, spec.timeout
            )));
        }
        if let Some(run) = &self.current {
            if !run.stopped.is_posted() {
                return Err(SeqError::Monitor(format!(
                    "{}: previous wait run still in progress",
                    self.device
                )));
            }
        }
        debug!("{}: arming wait monitor with {} waits", self.device, specs.len());
        let run = WaitRun::new(specs);
        self.cmd_sendr
            .send(MonitorCmd::Run(run.clone()))
            .map_err(|_| SeqError::Monitor(format!("{}: monitor thread exited", self.device)))?;
        self.current = Some(run.clone());
        Ok(run)
    }

    /// Cancels the current run and waits up to `grace` for the thread to go idle
    pub fn abort(&mut self, grace: Duration) -> SeqResult<()> {
        let run = match self.current.take() {
            Some(run) => run,
            None => return Ok(()),
        };
        run.cancel();
        match run.stopped.wait_timeout(grace) {
            Some(()) => Ok(()),
            None => {
                self.current = Some(run);
                Err(SeqError::Timeout {
                    what: format!("{} wait monitor to stop", self.device),
                    after: grace,
                })
            }
        }
    }
}

impl Drop for WaitMonitor {
    fn drop(&mut self) {
        if let Some(run) = &self.current {
            run.cancel();
        }
        let _ = self.cmd_sendr.send(MonitorCmd::Close);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{}: wait monitor thread panicked", self.device);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::*;
    use crate::notify::{ChannelNotify, Notification, NullNotify};

    fn cfg() -> MonitorConfig {
        MonitorConfig {
            software_margin_s: 0.05,
            poll_interval_ms: 5,
            ..Default::default()
        }
    }

    #[test]
    fn second_semi_period_is_the_duration() {
        let counter = MockCounter::new("ctr0", 1e6, vec![
            MockEdge::Ticks(100_000),
            MockEdge::Ticks(2_300_000),
        ]);
        let mut monitor =
            WaitMonitor::new("PB0", Box::new(counter), None, Arc::new(NullNotify), cfg()).unwrap();
        let run = monitor.arm(vec![WaitSpec::new("w0", 1.0, 10.0)]).unwrap();
        let records = run.wait_all(Duration::from_secs(2)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].measured_duration(), Some(2.3));
        assert!(!records[0].timed_out());
    }

    #[test]
    fn timeout_pulses_retrigger_once() {
        let retrigger = MockRetrigger::new();
        let counter = MockCounter::new("ctr0", 1e6, vec![
            MockEdge::Ticks(1_000),
            MockEdge::OnRetrigger(5_000_000),
        ])
        .linked_to(&retrigger);
        let mut monitor = WaitMonitor::new(
            "PB0",
            Box::new(counter),
            Some(Box::new(retrigger.clone())),
            Arc::new(NullNotify),
            cfg(),
        )
        .unwrap();
        let run = monitor.arm(vec![WaitSpec::new("w0", 1.0, 0.05)]).unwrap();
        let records = run.wait_all(Duration::from_secs(2)).unwrap();
        assert_eq!(retrigger.pulses(), 1);
        assert!(records[0].timed_out());
        assert_eq!(records[0].measured_duration(), Some(0.05));
    }

    #[test]
    fn waits_resolve_in_order_with_notifications() {
        let counter = MockCounter::new("ctr0", 1e3, vec![
            MockEdge::Ticks(10),
            MockEdge::Ticks(500),
            MockEdge::After(Duration::from_millis(20), 10),
            MockEdge::Ticks(250),
        ]);
        let (notify, notes) = ChannelNotify::new();
        let mut monitor =
            WaitMonitor::new("PB0", Box::new(counter), None, Arc::new(notify), cfg()).unwrap();
        let run = monitor
            .arm(vec![WaitSpec::new("first", 1.0, 10.0), WaitSpec::new("second", 2.0, 10.0)])
            .unwrap();

        let first = run.wait_for(0, Duration::from_secs(2)).unwrap();
        assert_eq!(first.label, "first");
        assert_eq!(first.measured_duration(), Some(0.5));
        let second = run.wait_for(1, Duration::from_secs(2)).unwrap();
        assert_eq!(second.measured_duration(), Some(0.25));
        assert!(run.wait_for(2, Duration::from_millis(1)).is_err());

        run.wait_all(Duration::from_secs(2)).unwrap();
        assert_eq!(run.resolved().len(), 2);
        let received: Vec<_> = notes.try_iter().collect();
        assert_eq!(
            received,
            vec![
                Notification::WaitCompleted("first".to_string()),
                Notification::WaitCompleted("second".to_string()),
                Notification::AllWaitsFinished,
            ]
        );
    }

    #[test]
    fn cancel_drops_pending_waits() {
        let counter = MockCounter::new("ctr0", 1e6, vec![MockEdge::Ticks(1_000)]);
        let mut monitor =
            WaitMonitor::new("PB0", Box::new(counter), None, Arc::new(NullNotify), cfg()).unwrap();
        let run = monitor.arm(vec![WaitSpec::new("w0", 1.0, 10.0)]).unwrap();
        assert!(matches!(
            run.wait_all(Duration::from_millis(30)),
            Err(SeqError::Timeout { .. })
        ));

        monitor.abort(Duration::from_millis(500)).unwrap();
        assert!(run.resolved().is_empty());
        assert!(matches!(
            run.wait_all(Duration::from_millis(10)),
            Err(SeqError::Monitor(_))
        ));

        // The thread is idle again and accepts a new run
        let run = monitor.arm(vec![]).unwrap();
        assert_eq!(run.wait_all(Duration::from_secs(1)).unwrap(), vec![]);
    }

    #[test]
    fn infinite_timeout_never_retriggers() {
        let retrigger = MockRetrigger::new();
        let counter = MockCounter::new("ctr0", 1e6, vec![
            MockEdge::Ticks(1_000),
            MockEdge::After(Duration::from_millis(80), 400_000),
        ]);
        let mut monitor = WaitMonitor::new(
            "PB0",
            Box::new(counter),
            Some(Box::new(retrigger.clone())),
            Arc::new(NullNotify),
            cfg(),
        )
        .unwrap();
        let run = monitor.arm(vec![WaitSpec::new("w0", 1.0, f64::INFINITY)]).unwrap();
        let records = run.wait_all(Duration::from_secs(2)).unwrap();
        assert_eq!(records[0].measured_duration(), Some(0.4));
        assert!(!records[0].timed_out());
        assert_eq!(retrigger.pulses(), 0);

        // The thread survived and takes the next run
        let run = monitor.arm(vec![]).unwrap();
        assert_eq!(run.wait_all(Duration::from_secs(1)).unwrap(), vec![]);
    }

    #[test]
    fn invalid_timeout_rejected() {
        let counter = MockCounter::new("ctr0", 1e6, vec![]);
        let mut monitor =
            WaitMonitor::new("PB0", Box::new(counter), None, Arc::new(NullNotify), cfg()).unwrap();
        for timeout in [f64::NAN, -1.0] {
            assert!(matches!(
                monitor.arm(vec![WaitSpec::new("w0", 1.0, timeout)]),
                Err(SeqError::Monitor(_))
            ));
        }
        assert!(monitor.current().is_none());
        monitor.arm(vec![WaitSpec::new("w0", 1.0, 1.0)]).unwrap();
    }

    #[test]
    fn rearm_right_after_finish() {
        let counter = MockCounter::new("ctr0", 1e6, vec![]);
        let mut monitor =
            WaitMonitor::new("PB0", Box::new(counter), None, Arc::new(NullNotify), cfg()).unwrap();
        for _ in 0..50 {
            let run = monitor.arm(vec![]).unwrap();
            run.wait_all(Duration::from_secs(1)).unwrap();
        }
    }

    #[test]
    fn source_hands_out_run_of_matching_shot() {
        let source = WaitSource::new();
        let shot: ShotId = "shot_0".into();
        assert!(source.run_for(&shot).is_none());
        source.publish(&shot, WaitRun::new(vec![WaitSpec::new("w0", 1.0, 1.0)]));
        assert_eq!(source.run_for(&shot).unwrap().len(), 1);
        assert!(source.run_for(&"shot_1".into()).is_none());
    }

    #[test]
    fn counter_error_ends_run() {
        let counter = MockCounter::new("ctr0", 1e6, vec![
            MockEdge::Ticks(1_000),
            MockEdge::Fail("buffer overflow".to_string()),
        ]);
        let mut monitor =
            WaitMonitor::new("PB0", Box::new(counter), None, Arc::new(NullNotify), cfg()).unwrap();
        let run = monitor.arm(vec![WaitSpec::new("w0", 1.0, 10.0)]).unwrap();
        match run.wait_all(Duration::from_secs(2)) {
            Err(SeqError::Monitor(msg)) => assert!(msg.contains("buffer overflow")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
