use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use maplit::hashmap;
use shotctrl_backend::mock::*;
use shotctrl_backend::*;
use shotseq_backend::*;

type MockController = SequenceController<MockChannel, MemoryShotStore>;

fn cfg() -> ControllerConfig {
    ControllerConfig::from_toml_str(
        r#"
        arm_timeout_ms = 200
        status_poll_ms = 2

        [monitor]
        software_margin_s = 0.05
        poll_interval_ms = 5
        abort_grace_ms = 500

        [acquisition]
        rate = 10.0
        chunk_len = 8
        poll_interval_ms = 2
        "#,
    )
    .unwrap()
}

fn chan_set(device: &str) -> ChannelSet {
    let mut set = ChannelSet::new(device, true);
    set.add_channel("ao0", -10.0, 10.0, 0.0).unwrap();
    set
}

/// Twenty-row ramp; rows listed in `bumped` are raised by one volt
fn ramp(device: &str, bumped: &[usize]) -> InstructionTable {
    let rows = (0..20)
        .map(|i| {
            let v = i as f64 * 0.25 + if bumped.contains(&i) { 1.0 } else { 0.0 };
            InstructionRow::at(i as f64 * 0.01, &[v])
        })
        .collect();
    InstructionTable::new(device, vec![ChannelId::Analog(0)], rows).unwrap()
}

fn add_shot(store: &MemoryShotStore, name: &str, table: InstructionTable) -> ShotId {
    let shot: ShotId = name.into();
    store.add_shot(&shot);
    store.set_table(&shot, table);
    shot
}

fn controller(device: &str, store: &Arc<MemoryShotStore>) -> (MockController, MockProbe) {
    let (chan, probe) = MockChannel::new(chan_set(device));
    let ctrl = SequenceController::new(chan, store.clone(), cfg()).unwrap();
    (ctrl, probe)
}

fn run(ctrl: &mut MockController, shot: &ShotId) -> (ProgramReport, ShotOutcome) {
    let report = ctrl.begin_buffered(shot, false).unwrap();
    assert_eq!(ctrl.state(), RunState::Buffered);
    let outcome = ctrl.end_buffered(Duration::from_secs(2)).unwrap();
    assert_eq!(ctrl.state(), RunState::Manual);
    (report, outcome)
}

#[test]
fn same_table_twice_is_not_rewritten() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, probe) = controller("PB0", &store);
    let first = add_shot(&store, "shot_0", ramp("PB0", &[]));
    let second = add_shot(&store, "shot_1", ramp("PB0", &[]));

    let (report, _) = run(&mut ctrl, &first);
    assert!(report.is_full());
    probe.clear_calls();

    let (report, _) = run(&mut ctrl, &second);
    assert_eq!(report, ProgramReport::Unchanged);
    assert_eq!(probe.row_writes(), 0);
    assert_eq!(probe.table_writes(), 0);
}

#[test]
fn small_changes_are_written_row_by_row() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, probe) = controller("PB0", &store);
    run(&mut ctrl, &add_shot(&store, "shot_0", ramp("PB0", &[])));

    probe.clear_calls();
    let (report, _) = run(&mut ctrl, &add_shot(&store, "shot_1", ramp("PB0", &[2, 9])));
    assert_eq!(report, ProgramReport::Incremental { rows: vec![2, 9] });
    assert_eq!(probe.row_writes(), 2);
    assert_eq!(probe.table_writes(), 0);

    probe.clear_calls();
    let (report, _) = run(&mut ctrl, &add_shot(&store, "shot_2", ramp("PB0", &[2, 9, 10, 11, 12])));
    assert!(report.is_full());
    assert_eq!(probe.table_writes(), 1);
    assert_eq!(probe.row_writes(), 0);
    assert_eq!(probe.memory(), ramp("PB0", &[2, 9, 10, 11, 12]).rows());
}

#[test]
fn final_row_becomes_manual_values() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, _probe) = controller("PB0", &store);
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[19]));
    let (_, outcome) = run(&mut ctrl, &shot);

    assert_eq!(outcome.final_values.get(&ChannelId::Analog(0)), Some(5.75));
    assert_eq!(ctrl.manual_values().get(&ChannelId::Analog(0)), Some(5.75));
    let saved = store.results(&shot, "PB0").unwrap();
    assert_eq!(saved.final_values, outcome.final_values);
    assert!(!saved.failed_shot);
}

#[test]
fn shot_without_instructions() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, probe) = controller("PB0", &store);
    let shot: ShotId = "empty".into();
    store.add_shot(&shot);
    store.set_table(&shot, InstructionTable::empty("PB0", vec![ChannelId::Analog(0)]));

    let (report, outcome) = run(&mut ctrl, &shot);
    assert_eq!(report, ProgramReport::Unchanged);
    assert!(probe.calls().is_empty());
    assert_eq!(outcome.total_wait_time, 0.0);
    assert!(outcome.waits.is_empty());
    assert!(store.results(&shot, "PB0").is_some());
}

#[test]
fn measured_wait_is_second_semi_period() {
    let store = Arc::new(MemoryShotStore::new());
    let (chan, _probe) = MockChannel::new(chan_set("PB0"));
    let counter = MockCounter::new(
        "ctr0",
        1e6,
        vec![MockEdge::Ticks(100_000), MockEdge::Ticks(2_300_000)],
    );
    let mut ctrl = SequenceController::new(chan, store.clone(), cfg())
        .unwrap()
        .with_wait_monitor(Box::new(counter), None)
        .unwrap();
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    store.set_waits(&shot, vec![WaitSpec::new("w0", 0.1, 5.0)]);

    let (_, outcome) = run(&mut ctrl, &shot);
    assert_eq!(outcome.waits.len(), 1);
    assert_eq!(outcome.waits[0].measured_duration(), Some(2.3));
    assert_eq!(outcome.total_wait_time, 2.3);
}

#[test]
fn timed_out_wait_is_retriggered_once() {
    let store = Arc::new(MemoryShotStore::new());
    let (chan, _probe) = MockChannel::new(chan_set("PB0"));
    let retrigger = MockRetrigger::new();
    let counter = MockCounter::new(
        "ctr0",
        1e6,
        vec![MockEdge::Ticks(1_000), MockEdge::OnRetrigger(9_000_000)],
    )
    .linked_to(&retrigger);
    let mut ctrl = SequenceController::new(chan, store.clone(), cfg())
        .unwrap()
        .with_wait_monitor(Box::new(counter), Some(Box::new(retrigger.clone())))
        .unwrap();
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    store.set_waits(&shot, vec![WaitSpec::new("w0", 0.1, 0.05)]);

    let (_, outcome) = run(&mut ctrl, &shot);
    assert_eq!(retrigger.pulses(), 1);
    assert!(outcome.waits[0].timed_out());
    assert_eq!(outcome.waits[0].measured_duration(), Some(0.05));
}

#[test]
fn acquisition_window_shifted_by_wait() {
    let store = Arc::new(MemoryShotStore::new());
    let (chan, _probe) = MockChannel::new(chan_set("PB0"));
    let counter = MockCounter::new(
        "ctr0",
        1e6,
        vec![MockEdge::Ticks(10_000), MockEdge::Ticks(500_000)],
    );
    let samples: Vec<f64> = (0..40).map(|i| i as f64).collect();
    let mut ctrl = SequenceController::new(chan, store.clone(), cfg())
        .unwrap()
        .with_wait_monitor(Box::new(counter), None)
        .unwrap()
        .with_analog_input(shared_input(MockAnalogInput::new("ai0", samples)));
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    store.set_waits(&shot, vec![WaitSpec::new("w0", 0.5, 5.0)]);
    store.set_windows(
        &shot,
        "PB0",
        vec![AcquisitionWindow::new("ai0", "probe", 1.0, 2.0)],
    );

    let (_, outcome) = run(&mut ctrl, &shot);
    let trace = &outcome.traces[0];
    assert_eq!(trace.label, "probe");
    assert_eq!(trace.times[0], 1.5);
    assert_eq!(trace.times[trace.len() - 1], 2.5);
    assert_eq!(trace.values.to_vec(), (15..=25).map(|i| i as f64).collect::<Vec<_>>());
    assert_eq!(store.results(&shot, "PB0").unwrap().traces, outcome.traces);
}

#[test]
fn abort_restores_manual_mode_and_clears_cache() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, probe) = controller("PB0", &store);
    let set = chan_set("PB0");
    let front_panel = ChannelValues::from_names(&set, [("ao0", 1.25)]).unwrap();
    ctrl.program_manual(&front_panel).unwrap();

    run(&mut ctrl, &add_shot(&store, "shot_0", ramp("PB0", &[])));
    assert!(ctrl.cache().is_primed());

    ctrl.program_manual(&front_panel).unwrap();
    ctrl.begin_buffered(&add_shot(&store, "shot_1", ramp("PB0", &[])), false)
        .unwrap();
    probe.clear_calls();
    ctrl.abort().unwrap();
    assert_eq!(ctrl.state(), RunState::Manual);
    assert!(!ctrl.cache().is_primed());
    assert_eq!(
        probe.calls(),
        vec![MockCall::AbortHw, MockCall::WriteManual(front_panel.clone())]
    );
    assert_eq!(ctrl.manual_values(), &front_panel);

    // Idempotent
    ctrl.abort().unwrap();

    probe.clear_calls();
    let (report, _) = run(&mut ctrl, &add_shot(&store, "shot_2", ramp("PB0", &[])));
    assert_eq!(
        report,
        ProgramReport::Full {
            reason: FullReason::Cold,
            rows: 20
        }
    );
    assert_eq!(probe.table_writes(), 1);
}

#[test]
fn lifecycle_calls_in_wrong_state() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, _probe) = controller("PB0", &store);
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    ctrl.begin_buffered(&shot, false).unwrap();

    let set = chan_set("PB0");
    let vals = ChannelValues::from_names(&set, [("ao0", 0.0)]).unwrap();
    assert_eq!(
        ctrl.begin_buffered(&shot, false).unwrap_err(),
        SeqError::State {
            op: "begin_buffered",
            state: RunState::Buffered
        }
    );
    assert!(matches!(
        ctrl.program_manual(&vals),
        Err(SeqError::State { op: "program_manual", .. })
    ));
    // State errors leave the shot running
    assert_eq!(ctrl.state(), RunState::Buffered);
    ctrl.end_buffered(Duration::from_secs(1)).unwrap();
}

#[test]
fn arm_timeout_aborts() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, probe) = controller("PB0", &store);
    probe.set_behavior(|b| b.arms = false);
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));

    let err = ctrl.begin_buffered(&shot, false).unwrap_err();
    assert!(matches!(err, SeqError::Timeout { .. }));
    assert!(err.is_fatal());
    assert_eq!(ctrl.state(), RunState::Manual);
    assert!(!ctrl.cache().is_primed());
    assert_eq!(probe.count(|call| *call == MockCall::AbortHw), 1);
}

#[test]
fn nack_while_programming_aborts() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, probe) = controller("PB0", &store);
    probe.set_behavior(|b| b.nack_writes = true);
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));

    assert!(matches!(
        ctrl.begin_buffered(&shot, false),
        Err(SeqError::Protocol(_))
    ));
    assert_eq!(ctrl.state(), RunState::Manual);
    assert!(!ctrl.cache().is_primed());
    assert!(!probe.calls().contains(&MockCall::Start));
}

#[test]
fn device_fault_during_run() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, probe) = controller("PB0", &store);
    probe.set_behavior(|b| b.done_after_polls = None);
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    ctrl.begin_buffered(&shot, false).unwrap();

    probe.set_behavior(|b| b.fault = Some("overtemperature".to_string()));
    match ctrl.end_buffered(Duration::from_secs(1)) {
        Err(SeqError::Protocol(err)) => assert!(err.msg.contains("overtemperature")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(ctrl.state(), RunState::Manual);
    assert!(store.results(&shot, "PB0").is_none());
}

#[test]
fn completion_timeout_policies() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, probe) = controller("PB0", &store);
    probe.set_behavior(|b| b.done_after_polls = None);

    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    ctrl.begin_buffered(&shot, false).unwrap();
    let err = ctrl.end_buffered(Duration::from_millis(30)).unwrap_err();
    assert!(matches!(err, SeqError::Timeout { .. }));
    assert_eq!(ctrl.state(), RunState::Manual);
    assert!(store.results(&shot, "PB0").is_none());

    let mut cfg = cfg();
    cfg.timeout_policy = TimeoutPolicy::LogAndContinue;
    let (chan, probe) = MockChannel::new(chan_set("PB0"));
    probe.set_behavior(|b| b.done_after_polls = None);
    let mut ctrl = SequenceController::new(chan, store.clone(), cfg).unwrap();
    let shot = add_shot(&store, "shot_1", ramp("PB0", &[]));
    ctrl.begin_buffered(&shot, false).unwrap();
    let outcome = ctrl.end_buffered(Duration::from_millis(30)).unwrap();
    assert!(outcome.failed_shot);
    assert_eq!(ctrl.state(), RunState::Manual);
    assert!(store.results(&shot, "PB0").unwrap().failed_shot);
    assert!(!ctrl.cache().is_primed());
}

#[test]
fn abort_requested_from_another_thread() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, probe) = controller("PB0", &store);
    probe.set_behavior(|b| b.done_after_polls = None);
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    ctrl.begin_buffered(&shot, false).unwrap();

    let handle = ctrl.abort_handle();
    let requester = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.request();
    });
    let start = Instant::now();
    let err = ctrl.end_buffered(Duration::from_secs(10)).unwrap_err();
    requester.join().unwrap();

    assert_eq!(err, SeqError::Aborted);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(ctrl.state(), RunState::Manual);
    assert!(probe.calls().contains(&MockCall::AbortHw));
}

#[test]
fn abort_cancels_pending_waits() {
    let store = Arc::new(MemoryShotStore::new());
    let (chan, probe) = MockChannel::new(chan_set("PB0"));
    // The hardware pauses but never resumes
    let counter = MockCounter::new("ctr0", 1e6, vec![MockEdge::Ticks(1_000)]);
    let mut ctrl = SequenceController::new(chan, store.clone(), cfg())
        .unwrap()
        .with_wait_monitor(Box::new(counter), None)
        .unwrap();
    probe.set_behavior(|b| b.done_after_polls = None);
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    store.set_waits(&shot, vec![WaitSpec::new("w0", 0.1, 60.0)]);

    ctrl.begin_buffered(&shot, false).unwrap();
    let run = ctrl.wait_run().unwrap();
    thread::sleep(Duration::from_millis(20));
    let start = Instant::now();
    ctrl.abort().unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert!(run.resolved().is_empty());
    assert!(run.is_finished());

    // The monitor accepts the next shot
    let shot = add_shot(&store, "shot_1", ramp("PB0", &[]));
    ctrl.begin_buffered(&shot, false).unwrap();
    ctrl.abort().unwrap();
}

#[test]
fn state_changes_are_notified() {
    let store = Arc::new(MemoryShotStore::new());
    let (chan, _probe) = MockChannel::new(chan_set("PB0"));
    let (notify, notes) = ChannelNotify::new();
    let mut ctrl = SequenceController::new(chan, store.clone(), cfg())
        .unwrap()
        .with_notify(Arc::new(notify));
    run(&mut ctrl, &add_shot(&store, "shot_0", ramp("PB0", &[])));

    let states: Vec<RunState> = notes
        .try_iter()
        .filter_map(|note| match note {
            Notification::RunStatusChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            RunState::TransitioningToBuffered,
            RunState::Buffered,
            RunState::TransitioningToManual,
            RunState::Manual,
        ]
    );
}

#[test]
fn drop_closes_the_channel() {
    let store = Arc::new(MemoryShotStore::new());
    let (mut ctrl, probe) = controller("PB0", &store);
    ctrl.begin_buffered(&add_shot(&store, "shot_0", ramp("PB0", &[])), false)
        .unwrap();
    drop(ctrl);
    let calls = probe.calls();
    assert_eq!(calls[calls.len() - 2..], [MockCall::AbortHw, MockCall::Close]);
}

#[test]
fn experiment_runs_every_device() {
    let store = Arc::new(MemoryShotStore::new());
    let (pb, _) = controller("PB0", &store);
    let (ni, _) = controller("NI0", &store);
    let mut exp = Experiment::new();
    exp.add_device(Box::new(pb));
    exp.add_device(Box::new(ni));

    let shot = add_shot(&store, "shot_0", ramp("PB0", &[19]));
    store.set_table(&shot, ramp("NI0", &[]));
    let outcomes = exp.run_shot(&shot, false, Duration::from_secs(2)).unwrap();

    let finals: std::collections::HashMap<&str, f64> = outcomes
        .iter()
        .map(|(name, outcome)| {
            (name.as_str(), outcome.final_values.get(&ChannelId::Analog(0)).unwrap())
        })
        .collect();
    assert_eq!(finals, hashmap! { "PB0" => 5.75, "NI0" => 4.75 });
    assert_eq!(exp.device_names(), vec!["PB0", "NI0"]);
    assert!(store.results(&shot, "NI0").is_some());
}

#[test]
fn experiment_aborts_all_on_failure() {
    let store = Arc::new(MemoryShotStore::new());
    let (pb, pb_probe) = controller("PB0", &store);
    let (ni, ni_probe) = controller("NI0", &store);
    ni_probe.set_behavior(|b| b.fault = Some("sync lost".to_string()));
    let mut exp = Experiment::new();
    exp.add_device(Box::new(pb));
    exp.add_device(Box::new(ni));

    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    store.set_table(&shot, ramp("NI0", &[]));
    let err = exp.run_shot(&shot, false, Duration::from_secs(2)).unwrap_err();
    assert!(matches!(err, SeqError::Protocol(_)));

    for name in ["PB0", "NI0"] {
        assert_eq!(exp.device(name).unwrap().state(), RunState::Manual);
    }
    assert!(pb_probe.calls().contains(&MockCall::AbortHw));
    assert!(store.results(&shot, "PB0").is_none());
}

#[test]
fn free_running_input_does_not_block_end_or_abort() {
    let store = Arc::new(MemoryShotStore::new());
    let (chan, probe) = MockChannel::new(chan_set("PB0"));
    let samples: Vec<f64> = (0..40).map(|i| i as f64).collect();
    let input = shared_input(MockAnalogInput::new("ai0", samples).free_running());
    let mut ctrl = SequenceController::new(chan, store.clone(), cfg())
        .unwrap()
        .with_analog_input(input);
    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    store.set_windows(
        &shot,
        "PB0",
        vec![AcquisitionWindow::new("ai0", "probe", 1.0, 2.0)],
    );

    let start = Instant::now();
    let (_, outcome) = run(&mut ctrl, &shot);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(outcome.traces[0].values[0], 10.0);

    probe.set_behavior(|b| b.done_after_polls = None);
    ctrl.begin_buffered(&add_shot(&store, "shot_1", ramp("PB0", &[])), false)
        .unwrap();
    let (done_sendr, done_recvr) = crossbeam::channel::bounded(1);
    let aborter = thread::spawn(move || {
        let res = ctrl.abort();
        let _ = done_sendr.send(res);
        ctrl
    });
    let res = done_recvr
        .recv_timeout(Duration::from_secs(3))
        .expect("abort did not return");
    assert!(res.is_ok());
    assert_eq!(aborter.join().unwrap().state(), RunState::Manual);
}

/// PB0 measures the waits, NI0 only acquires
fn shared_wait_devices(store: &Arc<MemoryShotStore>) -> (MockController, MockController) {
    let (pb_chan, _) = MockChannel::new(chan_set("PB0"));
    let counter = MockCounter::new(
        "ctr0",
        1e6,
        vec![MockEdge::Ticks(10_000), MockEdge::Ticks(500_000)],
    );
    let pb = SequenceController::new(pb_chan, store.clone(), cfg())
        .unwrap()
        .with_wait_monitor(Box::new(counter), None)
        .unwrap();
    let (ni_chan, _) = MockChannel::new(chan_set("NI0"));
    let samples: Vec<f64> = (0..40).map(|i| i as f64).collect();
    let ni = SequenceController::new(ni_chan, store.clone(), cfg())
        .unwrap()
        .with_wait_source(pb.wait_source().unwrap())
        .with_analog_input(shared_input(MockAnalogInput::new("ai0", samples)));
    (pb, ni)
}

#[test]
fn windows_use_waits_measured_by_another_device() {
    let store = Arc::new(MemoryShotStore::new());
    let (pb, ni) = shared_wait_devices(&store);
    let mut exp = Experiment::new();
    exp.add_device(Box::new(pb));
    exp.add_device(Box::new(ni));

    let shot = add_shot(&store, "shot_0", ramp("PB0", &[]));
    store.set_table(&shot, ramp("NI0", &[]));
    store.set_waits(&shot, vec![WaitSpec::new("w0", 0.5, 5.0)]);
    store.set_windows(
        &shot,
        "NI0",
        vec![AcquisitionWindow::new("ai0", "probe", 1.0, 2.0)],
    );

    let outcomes = exp.run_shot(&shot, false, Duration::from_secs(2)).unwrap();
    let ni = &outcomes["NI0"];
    assert_eq!(ni.waits[0].measured_duration(), Some(0.5));
    assert_eq!(ni.traces[0].times[0], 1.5);
    assert_eq!(ni.traces[0].values[0], 15.0);
    assert_eq!(ni.traces[0].values[ni.traces[0].len() - 1], 25.0);
}

#[test]
fn windows_and_waits_without_wait_source_fail() {
    let store = Arc::new(MemoryShotStore::new());
    let (chan, probe) = MockChannel::new(chan_set("NI0"));
    let samples: Vec<f64> = (0..40).map(|i| i as f64).collect();
    let mut ctrl = SequenceController::new(chan, store.clone(), cfg())
        .unwrap()
        .with_analog_input(shared_input(MockAnalogInput::new("ai0", samples)));
    let shot = add_shot(&store, "shot_0", ramp("NI0", &[]));
    store.set_waits(&shot, vec![WaitSpec::new("w0", 0.5, 5.0)]);
    store.set_windows(
        &shot,
        "NI0",
        vec![AcquisitionWindow::new("ai0", "probe", 1.0, 2.0)],
    );

    assert!(matches!(
        ctrl.begin_buffered(&shot, false),
        Err(SeqError::Monitor(_))
    ));
    assert_eq!(ctrl.state(), RunState::Manual);
    assert!(!probe.calls().contains(&MockCall::Start));

    // Without windows the waits do not matter to this device
    let shot = add_shot(&store, "shot_1", ramp("NI0", &[]));
    store.set_waits(&shot, vec![WaitSpec::new("w0", 0.5, 5.0)]);
    let (_, outcome) = run(&mut ctrl, &shot);
    assert!(outcome.waits.is_empty());
}
