//! In-memory stand-ins for the hardware traits.
//!
//! Used by the unit and integration tests and by the demo binary. Every mock shares its
//! state with a cloneable probe, so a test can hand the mock to a controller (which owns it
//! exclusively) and still inspect what was written and change the behavior mid-shot.
//!
//! - [`MockChannel`] records every call, mirrors the programmed table in `memory` (row writes
//!   past the end append, `set_length` truncates) and walks through
//!   `Idle -> Armed -> Running -> Done` as `status()` is polled.
//! - [`MockCounter`] replays a script of semi-periods, optionally gated on retrigger pulses.
//! - [`MockRetrigger`] counts pulses.
//! - [`MockAnalogInput`] hands out canned samples in chunks, from the start on every shot.
//!   A free-running one keeps producing zeros afterwards and ignores `stop()`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use shotseq_backend::*;

use crate::hw::*;

#[derive(Clone, Debug, PartialEq)]
pub enum MockCall {
    WriteManual(ChannelValues),
    WriteTable(usize),
    WriteRow(usize),
    SetLength(usize),
    Start,
    AbortHw,
    Close,
}

#[derive(Clone, Debug)]
pub struct MockBehavior {
    pub bulk: bool,
    /// Whether `start()` takes the device out of `Idle`
    pub arms: bool,
    /// Number of `Running` polls before `Done`; `None` never completes
    pub done_after_polls: Option<usize>,
    /// Reported once the device left `Idle`
    pub fault: Option<String>,
    pub nack_writes: bool,
    pub nack_abort: bool,
}
impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            bulk: true,
            arms: true,
            done_after_polls: Some(0),
            fault: None,
            nack_writes: false,
            nack_abort: false,
        }
    }
}

struct MockState {
    calls: Vec<MockCall>,
    memory: Vec<InstructionRow>,
    outputs: Option<ChannelValues>,
    run: RunStatus,
    polls: usize,
    behavior: MockBehavior,
}

/// Inspection handle of a [`MockChannel`]
#[derive(Clone)]
pub struct MockProbe {
    state: Arc<Mutex<MockState>>,
}

impl MockProbe {
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
    pub fn row_writes(&self) -> usize {
        self.count(|call| matches!(call, MockCall::WriteRow(_)))
    }
    pub fn table_writes(&self) -> usize {
        self.count(|call| matches!(call, MockCall::WriteTable(_)))
    }
    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| pred(call)).count()
    }
    /// Table currently held by the simulated device
    pub fn memory(&self) -> Vec<InstructionRow> {
        self.state.lock().memory.clone()
    }
    /// Last manual values written
    pub fn outputs(&self) -> Option<ChannelValues> {
        self.state.lock().outputs.clone()
    }
    pub fn run_status(&self) -> RunStatus {
        self.state.lock().run.clone()
    }
    pub fn set_behavior(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.state.lock().behavior);
    }
}

pub struct MockChannel {
    name: String,
    set: ChannelSet,
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    pub fn new(set: ChannelSet) -> (Self, MockProbe) {
        Self::with_behavior(set, MockBehavior::default())
    }

    pub fn with_behavior(set: ChannelSet, behavior: MockBehavior) -> (Self, MockProbe) {
        let state = Arc::new(Mutex::new(MockState {
            calls: Vec::new(),
            memory: Vec::new(),
            outputs: None,
            run: RunStatus::Idle,
            polls: 0,
            behavior,
        }));
        let probe = MockProbe {
            state: state.clone(),
        };
        let chan = Self {
            name: set.device().to_string(),
            set,
            state,
        };
        (chan, probe)
    }

    fn nack(&self, what: &str) -> ProtocolError {
        ProtocolError::new(&self.name, format!("{what} NACKed"))
    }
}

impl Channel for MockChannel {
    fn device_name(&self) -> &str {
        &self.name
    }
    fn channel_set(&self) -> &ChannelSet {
        &self.set
    }

    fn write_manual(&mut self, values: &ChannelValues) -> Result<(), ProtocolError> {
        let mut st = self.state.lock();
        st.calls.push(MockCall::WriteManual(values.clone()));
        if st.behavior.nack_writes {
            return Err(self.nack("manual write"));
        }
        st.outputs = Some(values.clone());
        Ok(())
    }

    fn write_table(&mut self, rows: &[InstructionRow]) -> Result<(), ProtocolError> {
        let mut st = self.state.lock();
        st.calls.push(MockCall::WriteTable(rows.len()));
        if st.behavior.nack_writes {
            return Err(self.nack("table write"));
        }
        st.memory = rows.to_vec();
        Ok(())
    }

    fn write_row(&mut self, index: usize, row: &InstructionRow) -> Result<(), ProtocolError> {
        let mut st = self.state.lock();
        st.calls.push(MockCall::WriteRow(index));
        if st.behavior.nack_writes {
            return Err(self.nack("row write"));
        }
        if index < st.memory.len() {
            st.memory[index] = row.clone();
        } else if index == st.memory.len() {
            st.memory.push(row.clone());
        } else {
            return Err(ProtocolError::new(
                &self.name,
                format!("row {index} leaves a gap after {} rows", st.memory.len()),
            ));
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), ProtocolError> {
        let mut st = self.state.lock();
        st.calls.push(MockCall::Start);
        st.polls = 0;
        if st.behavior.arms {
            st.run = RunStatus::Armed;
        }
        Ok(())
    }

    fn status(&mut self) -> RunStatus {
        let mut st = self.state.lock();
        if st.run == RunStatus::Idle {
            return RunStatus::Idle;
        }
        if let Some(msg) = st.behavior.fault.clone() {
            return RunStatus::Fault(msg);
        }
        if st.run != RunStatus::Done {
            st.polls += 1;
            st.run = match st.behavior.done_after_polls {
                Some(n) if st.polls > n => RunStatus::Done,
                _ => RunStatus::Running,
            };
        }
        st.run.clone()
    }

    fn abort_hw(&mut self) -> Result<(), ProtocolError> {
        let mut st = self.state.lock();
        st.calls.push(MockCall::AbortHw);
        if st.behavior.nack_abort {
            return Err(self.nack("abort"));
        }
        st.run = RunStatus::Idle;
        Ok(())
    }

    fn supports_bulk(&self) -> bool {
        self.state.lock().behavior.bulk
    }

    fn set_length(&mut self, len: usize) -> Result<(), ProtocolError> {
        let mut st = self.state.lock();
        st.calls.push(MockCall::SetLength(len));
        if st.behavior.nack_writes {
            return Err(self.nack("length update"));
        }
        st.memory.truncate(len);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        self.state.lock().calls.push(MockCall::Close);
        Ok(())
    }
}

/// One scripted counter reading
#[derive(Clone, Debug)]
pub enum MockEdge {
    /// Reported on the next read
    Ticks(u64),
    /// Reported once the delay elapsed
    After(Duration, u64),
    /// Reported only after the retrigger line was pulsed
    OnRetrigger(u64),
    Fail(String),
}

/// Retrigger line counting its pulses
#[derive(Clone, Default)]
pub struct MockRetrigger {
    pulses: Arc<AtomicUsize>,
}
impl MockRetrigger {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn pulses(&self) -> usize {
        self.pulses.load(Ordering::SeqCst)
    }
}
impl RetriggerOutput for MockRetrigger {
    fn pulse(&mut self) -> Result<(), ProtocolError> {
        self.pulses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockCounter {
    name: String,
    timebase_hz: f64,
    script: VecDeque<MockEdge>,
    pulses: Arc<AtomicUsize>,
    pulses_seen: usize,
    reads: Arc<AtomicUsize>,
}

impl MockCounter {
    pub fn new(name: &str, timebase_hz: f64, script: Vec<MockEdge>) -> Self {
        Self {
            name: name.to_string(),
            timebase_hz,
            script: script.into(),
            pulses: Arc::new(AtomicUsize::new(0)),
            pulses_seen: 0,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Gates [`MockEdge::OnRetrigger`] readings on the pulses of `retrigger`
    pub fn linked_to(mut self, retrigger: &MockRetrigger) -> Self {
        self.pulses = retrigger.pulses.clone();
        self
    }

    /// Counter of delivered semi-periods
    pub fn reads(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }

    fn deliver(&mut self, ticks: u64) -> Result<Option<u64>, ProtocolError> {
        self.script.pop_front();
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Some(ticks))
    }
}

impl CounterInput for MockCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_semi_period(&mut self, poll: Duration) -> Result<Option<u64>, ProtocolError> {
        match self.script.front().cloned() {
            Some(MockEdge::Ticks(ticks)) => self.deliver(ticks),
            Some(MockEdge::After(delay, ticks)) => {
                if delay > poll {
                    thread::sleep(poll);
                    self.script[0] = MockEdge::After(delay - poll, ticks);
                    Ok(None)
                } else {
                    thread::sleep(delay);
                    self.deliver(ticks)
                }
            }
            Some(MockEdge::OnRetrigger(ticks)) => {
                let pulses = self.pulses.load(Ordering::SeqCst);
                if pulses > self.pulses_seen {
                    self.pulses_seen = pulses;
                    self.deliver(ticks)
                } else {
                    thread::sleep(poll);
                    Ok(None)
                }
            }
            Some(MockEdge::Fail(msg)) => {
                self.script.pop_front();
                Err(ProtocolError::new(&self.name, msg))
            }
            None => {
                thread::sleep(poll);
                Ok(None)
            }
        }
    }

    fn timebase_hz(&self) -> f64 {
        self.timebase_hz
    }
}

/// Replays the same canned samples on every `start()`
pub struct MockAnalogInput {
    name: String,
    canned: Vec<f64>,
    samples: VecDeque<f64>,
    fail: Option<String>,
    free_running: bool,
}

impl MockAnalogInput {
    pub fn new(name: &str, samples: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            canned: samples,
            samples: VecDeque::new(),
            fail: None,
            free_running: false,
        }
    }

    /// Input that never runs dry: zeros follow the canned samples, stopped or not
    pub fn free_running(mut self) -> Self {
        self.free_running = true;
        self
    }

    /// Input whose reads fail once the canned samples are used up
    pub fn failing(mut self, msg: &str) -> Self {
        self.fail = Some(msg.to_string());
        self
    }
}

impl AnalogInput for MockAnalogInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_chunk(&mut self, max: usize, poll: Duration) -> Result<Vec<f64>, ProtocolError> {
        if self.samples.is_empty() {
            if let Some(msg) = &self.fail {
                return Err(ProtocolError::new(&self.name, msg.clone()));
            }
            thread::sleep(poll);
            if self.free_running {
                return Ok(vec![0.0; max]);
            }
            return Ok(Vec::new());
        }
        let n = max.min(self.samples.len());
        Ok(self.samples.drain(..n).collect())
    }

    fn start(&mut self) -> Result<(), ProtocolError> {
        self.samples = self.canned.iter().copied().collect();
        Ok(())
    }
}
