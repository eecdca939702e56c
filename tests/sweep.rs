//! Spatial sweeps driven through the simulated rig.

use anyhow::anyhow;
use nearfield_rig::adapters::{DummyRig, SimLayout};
use nearfield_rig::config::{RigConfig, TimingConfig, TransportKind};
use nearfield_rig::controller::{MotionController, Status};
use nearfield_rig::sweep::{run_sweep, SpatialSweep, SweepError, SweepRange};
use std::time::{Duration, Instant};

const MOVE_TIMEOUT: Duration = Duration::from_secs(10);

fn homed_rig() -> (MotionController, DummyRig) {
    let mut config = RigConfig::default();
    config.connection.transport = TransportKind::Dummy;
    config.timing = TimingConfig {
        poll_interval: Duration::from_millis(2),
        retry_sleep: Duration::from_millis(1),
        settle_time: Duration::from_millis(1),
        fault_clear_wait: Duration::from_millis(5),
        homing_timeout: Duration::from_secs(20),
        blocking_poll_interval: Duration::from_millis(2),
    };
    let sim = DummyRig::new(SimLayout::default());
    let rig = MotionController::spawn(&config, Box::new(sim.transport())).unwrap();

    rig.connect("COM4").unwrap();
    rig.home().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !(rig.status() == Status::Stopped && rig.snapshot().position_known) {
        assert!(Instant::now() < deadline, "homing timed out: {:?}", rig.snapshot());
        std::thread::sleep(Duration::from_millis(2));
    }
    (rig, sim)
}

fn small_grid() -> SpatialSweep {
    SpatialSweep::new([
        SweepRange::new(0.0, 2.0, 3),
        SweepRange::new(0.0, 1.0, 2),
        SweepRange::fixed(0.0),
    ])
    .unwrap()
}

#[test]
fn sweep_visits_every_point_in_order() {
    let (rig, sim) = homed_rig();
    let sweep = small_grid();

    let mut visited = Vec::new();
    let count = run_sweep(&rig, &sweep, MOVE_TIMEOUT, |index, target| {
        let position = rig.position_cm().ok_or_else(|| anyhow!("position unknown"))?;
        visited.push((index, target, position));
        Ok(())
    })
    .unwrap();

    assert_eq!(count, 6);
    assert_eq!(visited.len(), 6);
    for (i, (index, target, position)) in visited.iter().enumerate() {
        assert_eq!(*index, i);
        for axis in 0..3 {
            assert!(
                (position[axis] - target[axis]).abs() < 1e-3,
                "point {} measured at {:?}, expected {:?}",
                i,
                position,
                target
            );
        }
    }
    assert_eq!(visited[3].1, [2.0, 1.0, 0.0]);
    assert!(sim.physical_position_cm(nearfield_rig::Axis::Lateral).abs() < 1e-3);
}

#[test]
fn measurement_error_stops_the_sweep() {
    let (rig, _sim) = homed_rig();
    let sweep = small_grid();

    let mut calls = 0;
    let err = run_sweep(&rig, &sweep, MOVE_TIMEOUT, |index, _| {
        calls += 1;
        if index == 2 {
            Err(anyhow!("analyzer timeout"))
        } else {
            Ok(())
        }
    })
    .unwrap_err();

    assert_eq!(calls, 3);
    match err {
        SweepError::Measurement { index, reason } => {
            assert_eq!(index, 2);
            assert_eq!(reason.to_string(), "analyzer timeout");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(rig.status(), Status::Stopped);
}

#[test]
fn unreachable_point_disables_motors() {
    let (rig, sim) = homed_rig();
    // The vertical axis homes onto its forward switch, so any point above it is refused
    let sweep = SpatialSweep::new([
        SweepRange::fixed(1.0),
        SweepRange::fixed(1.0),
        SweepRange::fixed(1.0),
    ])
    .unwrap();

    let err = run_sweep(&rig, &sweep, MOVE_TIMEOUT, |_, _| Ok(())).unwrap_err();
    assert!(matches!(err, SweepError::MoveFailed { index: 0, .. }));

    let deadline = Instant::now() + Duration::from_secs(5);
    while rig.status() != Status::MotorsDisabled {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(!sim.motors_on());
    assert_eq!(rig.position_cm(), None);
}
