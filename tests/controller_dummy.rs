//! Motion controller behaviour against the simulated rig.

use nearfield_rig::adapters::{DummyRig, Endpoint, SimLayout};
use nearfield_rig::axis::Axis;
use nearfield_rig::config::{RigConfig, TimingConfig, TransportKind};
use nearfield_rig::controller::{ErrorKind, LimitState, MotionController, RigSnapshot, Status};
use nearfield_rig::error::RigError;
use nearfield_rig::protocol::Command;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> RigConfig {
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
    config
}

fn start_with(config: &RigConfig, layout: SimLayout) -> (MotionController, DummyRig) {
    let sim = DummyRig::new(layout);
    let rig = MotionController::spawn(config, Box::new(sim.transport())).unwrap();
    (rig, sim)
}

fn wait_for(rig: &MotionController, done: impl Fn(&RigSnapshot) -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done(&rig.snapshot()) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Wait until the motion thread has handled everything queued so far.
fn settle_queue(rig: &MotionController, seq: u64) {
    assert!(
        wait_for(rig, |s| s.processed_seq >= seq),
        "request {} never processed",
        seq
    );
}

fn connected_with(config: &RigConfig, layout: SimLayout) -> (MotionController, DummyRig) {
    let (rig, sim) = start_with(config, layout);
    rig.connect("COM4").unwrap();
    assert!(
        wait_for(&rig, |s| s.status == Status::MotorsDisabled),
        "connect did not complete: {:?}",
        rig.snapshot()
    );
    (rig, sim)
}

fn homed_with(config: &RigConfig, layout: SimLayout) -> (MotionController, DummyRig) {
    let (rig, sim) = connected_with(config, layout);
    rig.home().unwrap();
    assert!(
        wait_for(&rig, |s| s.position_known && s.status == Status::Stopped),
        "homing did not complete: {:?}",
        rig.snapshot()
    );
    (rig, sim)
}

fn homed() -> (MotionController, DummyRig) {
    homed_with(&fast_config(), SimLayout::default())
}

fn motion_commands(commands: &[String]) -> Vec<String> {
    commands
        .iter()
        .filter(|c| c.parse::<Command>().is_ok_and(|c| c.is_motion()))
        .cloned()
        .collect()
}

#[test]
fn connect_brings_controller_up() {
    let (rig, sim) = connected_with(&fast_config(), SimLayout::default());

    let commands = sim.commands();
    let expected = [
        "RS",
        "EO0",
        "MG_TA0",
        "MG_TA1",
        "MG_TA2",
        "MG_TA3",
        "MT -2.5,-2.5,-2.5,-2.5",
        "AG 2,2,2,2",
        "GAC=CB",
        "GRC=-1",
        "GMC=1",
    ];
    assert_eq!(&commands[..expected.len()], &expected[..]);

    let snapshot = rig.snapshot();
    assert_eq!(snapshot.endpoint.as_deref(), Some("COM4"));
    assert_eq!(snapshot.position_counts(), None);
    assert!(snapshot.errors.is_empty());
    assert_eq!(snapshot.speed_cm_s, 0.2);
}

#[test]
fn tcp_connect_skips_echo_off() {
    let (rig, sim) = start_with(&fast_config(), SimLayout::default());
    rig.connect("10.1.2.3:5000").unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::MotorsDisabled));
    assert_eq!(
        sim.endpoint(),
        Some(Endpoint::Tcp {
            host: "10.1.2.3".to_string(),
            port: 5000
        })
    );
    assert!(!sim.commands().iter().any(|c| c == "EO0"));
}

#[test]
fn invalid_endpoint_rejected_synchronously() {
    let (rig, _sim) = start_with(&fast_config(), SimLayout::default());
    assert!(matches!(
        rig.connect("   "),
        Err(RigError::InvalidEndpoint(_))
    ));
    assert!(matches!(
        rig.connect("host:notaport"),
        Err(RigError::InvalidEndpoint(_))
    ));
}

#[test]
fn failed_open_reports_error_and_stays_disconnected() {
    let (rig, sim) = start_with(&fast_config(), SimLayout::default());
    sim.fail_next_open("connection refused");
    rig.connect("10.0.0.2").unwrap();

    assert!(wait_for(&rig, |s| s.connect_error.is_some()));
    let snapshot = rig.snapshot();
    assert_eq!(snapshot.status, Status::Disconnected);
    assert!(snapshot.errors.contains(ErrorKind::CommunicationFault));
    assert!(snapshot
        .connect_error
        .unwrap()
        .contains("connection refused"));

    // A later attempt starts clean
    rig.connect("10.0.0.2").unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::MotorsDisabled));
    let snapshot = rig.snapshot();
    assert!(snapshot.errors.is_empty());
    assert_eq!(snapshot.connect_error, None);
}

#[test]
fn connect_clears_transient_fault() {
    let (rig, sim) = start_with(&fast_config(), SimLayout::default());
    sim.inject_fault(ErrorKind::OverVoltageOrCurrent);
    rig.connect("COM4").unwrap();

    assert!(wait_for(&rig, |s| s.status == Status::MotorsDisabled));
    assert!(rig.errors().is_empty());
    let commands = sim.commands();
    assert!(commands.iter().any(|c| c == "SH"));
    assert!(!sim.motors_on());
}

#[test]
fn connect_fails_when_fault_does_not_clear() {
    let (rig, sim) = start_with(&fast_config(), SimLayout::default());
    sim.inject_sticky_fault(ErrorKind::EmergencyStopLatched);
    rig.connect("COM4").unwrap();

    assert!(wait_for(&rig, |s| s.connect_error.is_some()));
    let snapshot = rig.snapshot();
    assert_eq!(snapshot.status, Status::Disconnected);
    assert!(snapshot.errors.contains(ErrorKind::EmergencyStopLatched));
    assert!(!sim.is_open());
}

#[test]
fn homing_resolves_shared_sensor_as_forward_limit() {
    let layout = SimLayout::default()
        .with_start(Axis::Lateral, 2.5)
        .with_switches(Axis::Lateral, Some(0.0), Some(2.0))
        .with_step(Axis::Lateral, 0.25)
        .with_start(Axis::Transverse, 1.0)
        .with_switches(Axis::Transverse, Some(0.0), Some(10.0))
        .with_start(Axis::Vertical, -1.0)
        .with_switches(Axis::Vertical, Some(-10.0), Some(0.0));
    let (rig, sim) = homed_with(&fast_config(), layout);

    let snapshot = rig.snapshot();
    assert_eq!(snapshot.status, Status::Stopped);
    assert_eq!(snapshot.position_counts(), Some([0, 0, 0]));
    assert_eq!(snapshot.limit_state(Axis::Lateral), LimitState::AtNegative);
    assert_eq!(snapshot.limit_state(Axis::Transverse), LimitState::AtNegative);
    assert_eq!(snapshot.limit_state(Axis::Vertical), LimitState::AtPositive);
    assert!(snapshot.errors.is_empty());

    // Probe ran with both lateral inputs disabled and the lateral axis skipped back-off
    let commands = sim.commands();
    let probe = commands.iter().position(|c| c == "PRA=6577").unwrap();
    assert!(commands[..probe].iter().any(|c| c == "LDA=3"));
    assert!(!commands.iter().any(|c| c == "PRA=4385"));

    assert_eq!(sim.physical_position_cm(Axis::Lateral), 0.0);
    assert_eq!(sim.physical_position_cm(Axis::Transverse), 0.0);
    assert_eq!(sim.physical_position_cm(Axis::Vertical), 0.0);
}

#[test]
fn homing_with_clear_sensor_skips_probe_and_restores_speed() {
    let (rig, sim) = homed();
    let commands = sim.commands();
    assert!(!commands.iter().any(|c| c == "PRA=6577"));
    assert!(commands.iter().any(|c| c == "SPA=21925"));
    assert!(commands.iter().any(|c| c == "DPA=0"));

    rig.jog(Axis::Transverse, true).unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::Jogging));
    assert!(sim.commands().iter().any(|c| c == "JGB=877"));
    rig.stop().unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::Stopped));
}

#[test]
fn jog_into_active_limit_is_refused() {
    let (rig, sim) = homed();
    assert_eq!(rig.snapshot().limit_state(Axis::Lateral), LimitState::AtNegative);

    let start = sim.log_len();
    let seq = rig.snapshot().processed_seq + 1;
    rig.jog(Axis::Lateral, false).unwrap();
    settle_queue(&rig, seq);

    assert_eq!(rig.status(), Status::Stopped);
    assert!(motion_commands(&sim.commands_since(start)).is_empty());
}

#[test]
fn move_abandoned_when_any_axis_is_blocked() {
    let (rig, sim) = homed();
    assert_eq!(rig.snapshot().limit_state(Axis::Vertical), LimitState::AtPositive);

    let start = sim.log_len();
    let seq = rig.snapshot().processed_seq + 1;
    rig.move_relative([1.0, 1.0, 1.0]).unwrap();
    settle_queue(&rig, seq);

    assert_eq!(rig.status(), Status::Stopped);
    assert!(motion_commands(&sim.commands_since(start)).is_empty());
    assert!(!rig.move_absolute_blocking([1.0, 1.0, 1.0], WAIT));
    assert!(motion_commands(&sim.commands_since(start)).is_empty());
}

#[test]
fn blocking_move_reaches_target() {
    let (rig, sim) = homed();
    let target = [2.0, 3.0, -1.5];
    let start = sim.log_len();

    assert!(rig.move_absolute_blocking(target, WAIT));
    assert_eq!(rig.status(), Status::Stopped);
    assert_eq!(
        rig.position_counts(),
        Some(rig.model().to_counts_all(target))
    );
    let position = rig.position_cm().unwrap();
    for axis in Axis::ALL {
        assert!((position[axis.index()] - target[axis.index()]).abs() < 1e-3);
    }

    // All three axes start together
    let motion = motion_commands(&sim.commands_since(start));
    assert_eq!(motion.iter().filter(|c| c.starts_with("BG")).count(), 1);
    assert!(motion.contains(&"BGABD".to_string()));
    assert!(motion.contains(&"PAA=8770".to_string()));
}

#[test]
fn zero_length_move_settles_without_motion() {
    let (rig, sim) = homed();
    let start = sim.log_len();
    assert!(rig.move_absolute_blocking([0.0, 0.0, 0.0], WAIT));
    assert!(motion_commands(&sim.commands_since(start)).is_empty());
}

#[test]
fn relative_move_only_commands_moving_axes() {
    let (rig, sim) = homed();
    let start = sim.log_len();
    let seq = rig.snapshot().processed_seq + 1;
    rig.move_relative([0.0, 2.0, 0.0]).unwrap();
    settle_queue(&rig, seq);
    assert!(wait_for(&rig, |s| {
        s.status == Status::Stopped && s.settled_seq >= seq
    }));

    let motion = motion_commands(&sim.commands_since(start));
    assert_eq!(motion, vec!["PRB=8770".to_string(), "BGB".to_string()]);
    assert!((sim.physical_position_cm(Axis::Transverse) - 2.0).abs() < 1e-3);
}

#[test]
fn blocking_move_fails_while_jogging() {
    let (rig, _sim) = homed();
    rig.jog(Axis::Transverse, true).unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::Jogging));
    assert!(!rig.move_absolute_blocking([1.0, 1.0, -1.0], WAIT));
    rig.stop().unwrap();
}

#[test]
fn stop_is_idempotent() {
    let (rig, sim) = homed();
    let start = sim.log_len();
    let seq = rig.snapshot().processed_seq + 2;
    rig.stop().unwrap();
    rig.stop().unwrap();
    settle_queue(&rig, seq);
    assert_eq!(rig.status(), Status::Stopped);
    assert!(!sim.commands_since(start).iter().any(|c| c == "ST"));

    rig.jog(Axis::Lateral, true).unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::Jogging));
    let start = sim.log_len();
    rig.stop().unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::Stopped));
    let seq = rig.snapshot().processed_seq + 1;
    rig.stop().unwrap();
    settle_queue(&rig, seq);

    let stops = sim
        .commands_since(start)
        .iter()
        .filter(|c| *c == "ST")
        .count();
    assert_eq!(stops, 1);
    assert!(!sim.is_moving(Axis::Lateral));
    assert!(rig.position_counts().is_some());
}

#[test]
fn hardware_fault_during_motion_disconnects() {
    let (rig, sim) = homed();
    rig.jog(Axis::Lateral, true).unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::Jogging));

    sim.inject_fault(ErrorKind::OverVoltageOrCurrent);
    assert!(wait_for(&rig, |s| s.status == Status::Disconnected));

    let snapshot = rig.snapshot();
    assert!(snapshot.errors.contains(ErrorKind::OverVoltageOrCurrent));
    assert_eq!(snapshot.position_counts(), None);
    assert!(!sim.motors_on());
    assert!(!sim.is_open());
}

#[test]
fn link_loss_disconnects() {
    let (rig, sim) = connected_with(&fast_config(), SimLayout::default());
    sim.drop_link();
    assert!(wait_for(&rig, |s| s.status == Status::Disconnected));
    assert!(rig.errors().contains(ErrorKind::CommunicationFault));

    rig.clear_errors();
    assert!(rig.errors().is_empty());
}

#[test]
fn speed_is_validated_and_applied_in_order() {
    let (rig, sim) = homed();
    assert!(matches!(rig.set_speed(7.5), Err(RigError::OutOfRange(_))));
    assert!(matches!(rig.set_speed(0.0), Err(RigError::OutOfRange(_))));

    rig.set_speed(2.0).unwrap();
    rig.jog(Axis::Vertical, false).unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::Jogging));
    assert!(sim.commands().iter().any(|c| c == "JGD=-8388"));
    assert_eq!(rig.snapshot().speed_cm_s, 2.0);
    rig.stop().unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::Stopped));
}

#[test]
fn software_floor_blocks_further_descent() {
    let mut config = fast_config();
    config.motion.vertical_floor = -2.0;
    let (rig, sim) = homed_with(&config, SimLayout::default());
    assert_eq!(sim.software_limits(Axis::Vertical).0, Some(-25420));
    assert_eq!(
        sim.software_limits(Axis::Transverse).1,
        Some(120 * 4385)
    );

    assert!(rig.move_absolute_blocking([0.0, 0.0, -3.0], WAIT));
    assert!(wait_for(&rig, |s| {
        s.limit_state(Axis::Vertical) == LimitState::AtNegative
    }));

    let start = sim.log_len();
    assert!(!rig.move_absolute_blocking([0.0, 0.0, -4.0], WAIT));
    assert!(motion_commands(&sim.commands_since(start)).is_empty());

    // Climbing back above the floor is allowed
    assert!(rig.move_absolute_blocking([0.0, 0.0, -1.0], WAIT));
}

#[test]
fn disable_motors_forgets_position() {
    let (rig, sim) = homed();
    rig.disable_motors().unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::MotorsDisabled));
    assert_eq!(rig.position_cm(), None);
    assert!(!sim.motors_on());

    let start = sim.log_len();
    let seq = rig.snapshot().processed_seq + 1;
    rig.jog(Axis::Transverse, true).unwrap();
    settle_queue(&rig, seq);
    assert!(motion_commands(&sim.commands_since(start)).is_empty());
}

#[test]
fn disconnect_powers_down_and_closes() {
    let (rig, sim) = homed();
    rig.disconnect().unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::Disconnected));
    assert!(!sim.is_open());
    assert!(!sim.motors_on());
    assert_eq!(rig.snapshot().endpoint, None);
    assert!(rig.errors().is_empty());
}

#[test]
fn requests_ignored_while_disconnected() {
    let (rig, sim) = start_with(&fast_config(), SimLayout::default());
    rig.home().unwrap();
    rig.jog(Axis::Lateral, true).unwrap();
    assert!(!rig.move_absolute_blocking([1.0, 1.0, -1.0], WAIT));
    assert_eq!(rig.status(), Status::Disconnected);
    assert!(sim.commands().is_empty());
}

#[test]
fn dropping_the_handle_shuts_the_rig_down() {
    let (rig, sim) = homed();
    rig.jog(Axis::Lateral, true).unwrap();
    assert!(wait_for(&rig, |s| s.status == Status::Jogging));

    drop(rig);
    assert!(!sim.is_open());
    assert!(!sim.motors_on());
    assert!(!sim.is_moving(Axis::Lateral));
}

#[test]
fn unrepresentable_targets_rejected_before_queueing() {
    let (rig, sim) = homed();
    assert!(rig.move_absolute_blocking([2.0, 3.0, -1.5], WAIT));
    let start = sim.log_len();
    let seq = rig.snapshot().processed_seq;

    assert!(matches!(
        rig.move_absolute([f64::NAN, 3.0, -1.5]),
        Err(RigError::OutOfRange(_))
    ));
    assert!(matches!(
        rig.move_relative([0.0, f64::INFINITY, 0.0]),
        Err(RigError::OutOfRange(_))
    ));
    assert!(!rig.move_absolute_blocking([-1e300, 3.0, -1.5], WAIT));
    assert!(!rig.move_absolute_blocking([f64::NAN, 3.0, -1.5], WAIT));
    assert_eq!(rig.snapshot().processed_seq, seq);
    assert!(motion_commands(&sim.commands_since(start)).is_empty());
    assert!((sim.physical_position_cm(Axis::Lateral) - 2.0).abs() < 1e-3);

    // The motion thread is still serving requests
    rig.stop().unwrap();
    assert!(rig.move_absolute_blocking([1.0, 1.0, -1.0], WAIT));
}

#[test]
fn blocking_move_reports_its_own_outcome() {
    let mut config = fast_config();
    config.timing.blocking_poll_interval = Duration::from_millis(200);
    let (rig, _sim) = homed_with(&config, SimLayout::default());
    assert_eq!(rig.snapshot().limit_state(Axis::Vertical), LimitState::AtPositive);
    let refused_seq = rig.snapshot().processed_seq + 1;

    let refused = std::thread::scope(|scope| {
        let waiter = scope.spawn(|| rig.move_absolute_blocking([0.0, 0.0, 1.0], WAIT));
        // A later request settles before the waiter polls again
        std::thread::sleep(Duration::from_millis(20));
        rig.move_absolute([0.0, 0.0, 0.0]).unwrap();
        waiter.join().unwrap()
    });

    assert!(!refused);
    assert!(rig.snapshot().settled_seq > refused_seq);
}

#[test]
fn homing_stop_code_mismatch_disconnects() {
    let (rig, sim) = connected_with(&fast_config(), SimLayout::default());
    // The vertical axis homes forward; report the reverse limit instead
    sim.inject_stop_code(Axis::Vertical, 3);
    rig.home().unwrap();

    assert!(wait_for(&rig, |s| s.status == Status::Disconnected));
    let snapshot = rig.snapshot();
    assert!(!snapshot.position_known);
    assert!(snapshot.errors.contains(ErrorKind::Other));
    assert!(snapshot
        .errors
        .iter()
        .any(|(_, message)| message.contains("Homing failed")));
    assert!(!sim.motors_on());
    assert!(!sim.is_open());
}

#[test]
fn unexpected_stop_code_during_motion_disconnects() {
    let layout = SimLayout::default()
        .with_start(Axis::Vertical, -1.0)
        .with_switches(Axis::Vertical, Some(-3.0), Some(0.0));
    let (rig, sim) = homed_with(&fast_config(), layout);

    sim.inject_stop_code(Axis::Vertical, 99);
    rig.jog(Axis::Vertical, false).unwrap();

    assert!(wait_for(&rig, |s| s.status == Status::Disconnected));
    let errors = rig.errors();
    assert!(errors.contains(ErrorKind::Other));
    assert!(errors
        .iter()
        .any(|(_, message)| message.contains("Unexpected stop code")));
    assert!(!sim.motors_on());
}

#[test]
fn homing_times_out() {
    let mut config = fast_config();
    config.timing.homing_timeout = Duration::from_millis(300);
    // One count per poll: the lateral back-off cannot finish in time
    let layout = SimLayout::default().with_step(Axis::Lateral, 0.0001);
    let (rig, sim) = connected_with(&config, layout);
    rig.home().unwrap();

    assert!(wait_for(&rig, |s| s.status == Status::Disconnected));
    let errors = rig.errors();
    assert!(errors.contains(ErrorKind::Other));
    assert!(errors
        .iter()
        .any(|(_, message)| message.contains("did not complete")));
    assert!(sim.commands().iter().any(|c| c == "ST"));
    assert!(!sim.is_moving(Axis::Lateral));
    assert!(!sim.motors_on());
}

#[test]
fn move_refused_at_lateral_forward_limit() {
    let layout = SimLayout::default()
        .with_start(Axis::Lateral, 0.5)
        .with_switches(Axis::Lateral, Some(0.0), Some(2.0));
    let (rig, sim) = homed_with(&fast_config(), layout);

    rig.jog(Axis::Lateral, true).unwrap();
    assert!(
        wait_for(&rig, |s| {
            s.status == Status::Stopped && s.limit_state(Axis::Lateral) == LimitState::AtPositive
        }),
        "lateral jog did not end on the forward limit: {:?}",
        rig.snapshot()
    );
    assert!((sim.physical_position_cm(Axis::Lateral) - 2.0).abs() < 1e-3);

    let start = sim.log_len();
    let seq = rig.snapshot().processed_seq + 1;
    rig.move_absolute([3.0, 0.0, 0.0]).unwrap();
    settle_queue(&rig, seq);
    assert_eq!(rig.status(), Status::Stopped);
    assert!(motion_commands(&sim.commands_since(start)).is_empty());

    // Leaving the limit is still possible
    assert!(rig.move_absolute_blocking([1.0, 0.0, 0.0], WAIT));
    assert_eq!(rig.snapshot().limit_state(Axis::Lateral), LimitState::Clear);
}

#[test]
fn stop_queued_behind_homing_keeps_motors_powered() {
    let (rig, sim) = connected_with(&fast_config(), SimLayout::default());
    let stop_seq = rig.snapshot().processed_seq + 2;
    rig.home().unwrap();
    rig.stop().unwrap();
    settle_queue(&rig, stop_seq);

    let snapshot = rig.snapshot();
    assert_eq!(snapshot.status, Status::Stopped);
    assert!(snapshot.position_known);
    assert!(sim.motors_on());
}
