use std::sync::Arc;
use std::time::Duration;

use shotctrl_backend::mock::*;
use shotctrl_backend::*;
use shotseq_backend::*;

fn shot_table(amp: f64) -> Result<InstructionTable, TableError> {
    let rows = (0..50)
        .map(|i| {
            let t = i as f64 * 0.002;
            InstructionRow::at(t, &[amp * (t * 40.0).sin(), (i % 2) as f64])
        })
        .collect();
    InstructionTable::new(
        "PB0",
        vec![ChannelId::Analog(0), "port0/line0".parse()?],
        rows,
    )
}

fn main() -> SeqResult<()> {
    env_logger::init();

    // Optional TOML configuration as first argument
    let cfg = match std::env::args().nth(1) {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig {
            acquisition: AcquisitionConfig {
                rate: 1e3,
                ..Default::default()
            },
            ..Default::default()
        },
    };

    let mut set = ChannelSet::new("PB0", true);
    set.add_channel("ao0", -10.0, 10.0, 20.0 / 65536.0)?;
    set.add_channel("port0/line0", 0.0, 1.0, 1.0)?;
    let (chan, probe) = MockChannel::new(set.clone());

    let store = Arc::new(MemoryShotStore::new());
    let waits = vec![WaitSpec::new("settle", 0.05, 1.0)];
    for (i, amp) in [1.0, 1.0, 2.0].iter().enumerate() {
        let shot_id = ShotId(format!("shot_{i:04}"));
        store.add_shot(&shot_id);
        store.set_table(&shot_id, shot_table(*amp)?);
        store.set_waits(&shot_id, waits.clone());
        store.set_windows(
            &shot_id,
            "PB0",
            vec![AcquisitionWindow::new("ai0", "probe", 0.02, 0.08)],
        );
    }

    let (notify, notes) = ChannelNotify::new();
    let retrigger = MockRetrigger::new();
    // One pause of 120 ms per shot
    let edges = (0..3)
        .flat_map(|_| [MockEdge::Ticks(50_000), MockEdge::Ticks(120_000)])
        .collect();
    let counter = MockCounter::new("ctr0", 1e6, edges).linked_to(&retrigger);
    let samples: Vec<f64> = (0..500).map(|i| i as f64 * 1e-3).collect();
    let input = shared_input(MockAnalogInput::new("ai0", samples));

    let mut ctrl = SequenceController::new(chan, store.clone(), cfg)?
        .with_notify(Arc::new(notify))
        .with_wait_monitor(Box::new(counter), Some(Box::new(retrigger)))?
        .with_analog_input(input);

    ctrl.program_manual(&ChannelValues::from_names(&set, [("ao0", 0.5), ("port0/line0", 1.0)])?)?;

    for i in 0..3 {
        let shot_id = ShotId(format!("shot_{i:04}"));
        probe.clear_calls();
        let report = ctrl.begin_buffered(&shot_id, false)?;
        let outcome = ctrl.end_buffered(Duration::from_secs(5))?;
        println!(
            "{shot_id}: {report:?}, {} hardware calls, waited {:.3} s, {} samples in probe trace",
            probe.calls().len(),
            outcome.total_wait_time,
            outcome.traces.first().map_or(0, |trace| trace.len()),
        );
    }

    for note in notes.try_iter() {
        println!("{note:?}");
    }
    ctrl.close()
}
