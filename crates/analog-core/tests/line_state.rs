//! Analog line state machine and lifecycle tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rsig_analog_core::{
    AnalogLine, AnalogLineConfig, AnalogLineGroup, LineError, LineKind, LineState,
    TimerKind,
};
use rsig_circuit_core::{Circuit, CircuitDriver, CircuitEventKind, CircuitStatus, CircuitType};

fn group_with_circuits(kind: LineKind, name: &str, count: u32) -> Arc<AnalogLineGroup> {
    let group = AnalogLineGroup::new(kind, name, false);
    for code in 0..count {
        group.circuits().insert(Circuit::with_status(
            CircuitType::Tdm,
            code,
            CircuitStatus::Idle,
            group.circuits(),
            None,
        ));
    }
    group
}

fn line(group: &Arc<AnalogLineGroup>, code: u32) -> Arc<AnalogLine> {
    let line = AnalogLine::new(Some(group), code, &AnalogLineConfig::default()).unwrap();
    assert!(group.append_line(&line));
    line
}

#[test]
fn construction_reserves_and_connects_the_circuit() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let line = line(&group, 0);
    assert_eq!(line.kind(), LineKind::Fxs);
    assert_eq!(line.state(), LineState::Idle);
    assert_eq!(line.address(), "fxs/0");
    assert_eq!(line.circuit().status(), CircuitStatus::Connected);
}

#[test]
fn construction_without_connect_stays_reserved() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let config = AnalogLineConfig {
        connect: false,
        ..AnalogLineConfig::default()
    };
    let line = AnalogLine::new(Some(&group), 0, &config).unwrap();
    assert_eq!(line.circuit().status(), CircuitStatus::Reserved);
}

#[test]
fn construction_out_of_service_disables_the_circuit() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let config = AnalogLineConfig {
        out_of_service: true,
        ..AnalogLineConfig::default()
    };
    let line = AnalogLine::new(Some(&group), 0, &config).unwrap();
    assert_eq!(line.state(), LineState::OutOfService);
    assert_eq!(line.circuit().status(), CircuitStatus::Disabled);
}

#[test]
fn construction_errors_name_the_reason() {
    assert_eq!(
        AnalogLine::new(None, 0, &AnalogLineConfig::default()).unwrap_err(),
        LineError::MissingGroup
    );
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let _first = line(&group, 0);
    assert_eq!(
        AnalogLine::new(Some(&group), 0, &AnalogLineConfig::default()).unwrap_err(),
        LineError::CircuitAllocated { code: 0 }
    );
    assert_eq!(
        AnalogLine::new(Some(&group), 9, &AnalogLineConfig::default()).unwrap_err(),
        LineError::MissingCircuit { code: 9 }
    );
}

#[test]
fn peers_stay_symmetric() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 2);
    let a = line(&group, 0);
    let b = line(&group, 1);

    a.set_peer(Some(&b), true);
    assert!(Arc::ptr_eq(&a.peer().unwrap(), &b));
    assert!(Arc::ptr_eq(&b.peer().unwrap(), &a));

    a.set_peer(None, true);
    assert!(a.peer().is_none());
    assert!(b.peer().is_none());
}

#[test]
fn replacing_a_peer_unlinks_the_old_one() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 3);
    let a = line(&group, 0);
    let b = line(&group, 1);
    let c = line(&group, 2);

    a.set_peer(Some(&b), true);
    a.set_peer(Some(&c), true);
    assert!(Arc::ptr_eq(&a.peer().unwrap(), &c));
    assert!(Arc::ptr_eq(&c.peer().unwrap(), &a));
    assert!(b.peer().is_none());
}

#[test]
fn peering_a_line_with_itself_is_refused() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let a = line(&group, 0);
    let a2 = Arc::clone(&a);
    a.set_peer(Some(&a2), true);
    assert!(a.peer().is_none());
}

#[test]
fn state_machine_is_forward_only() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let a = line(&group, 0);

    assert!(a.change_state(LineState::Dialing, false));
    // Same state is a no-op that succeeds.
    assert!(a.change_state(LineState::Dialing, false));
    // Forward moves may skip states.
    assert!(a.change_state(LineState::Ringing, false));
    // Backward moves are rejected without side effects.
    assert!(!a.change_state(LineState::Dialing, false));
    assert_eq!(a.state(), LineState::Ringing);
    // Idle is the reset escape hatch.
    assert!(a.change_state(LineState::Idle, false));
    assert_eq!(a.state(), LineState::Idle);
    // OutOfService is only reachable through enable().
    assert!(!a.change_state(LineState::OutOfService, false));
}

#[test]
fn state_changes_cascade_to_the_peer_when_synced() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 2);
    let a = line(&group, 0);
    let b = line(&group, 1);
    a.set_peer(Some(&b), true);

    assert!(a.change_state(LineState::Ringing, true));
    assert_eq!(b.state(), LineState::Ringing);

    assert!(a.change_state(LineState::Answered, false));
    assert_eq!(b.state(), LineState::Ringing);
}

#[test]
fn enable_controls_the_out_of_service_boundary() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let a = line(&group, 0);

    assert!(a.enable(false, false, false));
    assert_eq!(a.state(), LineState::OutOfService);
    assert_eq!(a.circuit().status(), CircuitStatus::Disabled);
    // No ordinary transition leaves OutOfService.
    assert!(!a.change_state(LineState::Idle, false));

    assert!(a.enable(true, false, true));
    assert_eq!(a.state(), LineState::Idle);
    assert_eq!(a.circuit().status(), CircuitStatus::Connected);
}

#[test]
fn enable_mirrors_the_peer_when_synced() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 2);
    let a = line(&group, 0);
    let b = line(&group, 1);
    a.set_peer(Some(&b), true);

    a.enable(false, true, false);
    assert_eq!(a.state(), LineState::OutOfService);
    assert_eq!(b.state(), LineState::OutOfService);

    a.enable(true, true, false);
    assert_eq!(a.state(), LineState::Idle);
    assert_eq!(b.state(), LineState::Idle);
}

struct AcceptingDriver;

impl CircuitDriver for AcceptingDriver {
    fn send_event(
        &self,
        _code: u32,
        _kind: CircuitEventKind,
        _params: &HashMap<String, String>,
    ) -> bool {
        true
    }
}

#[test]
fn send_event_is_gated_by_state_and_inband_dtmf() {
    let group = AnalogLineGroup::new(LineKind::Fxs, "fxs", false);
    group.circuits().insert(Circuit::with_driver(
        CircuitType::Tdm,
        0,
        CircuitStatus::Idle,
        Arc::new(AcceptingDriver),
        group.circuits(),
        None,
    ));
    let config = AnalogLineConfig {
        inband_dtmf: true,
        ..AnalogLineConfig::default()
    };
    let a = AnalogLine::new(Some(&group), 0, &config).unwrap();
    group.append_line(&a);

    let params = HashMap::new();
    // Inband audio carries the digits, tone events are refused.
    assert!(!a.send_event(CircuitEventKind::Dtmf, &params));
    assert!(!a.send_event(CircuitEventKind::PulseDigit, &params));
    // Other events reach the driver.
    assert!(a.send_event(CircuitEventKind::OffHook, &params));

    a.enable(false, false, false);
    assert!(!a.send_event(CircuitEventKind::OffHook, &params));
}

#[test]
fn pulse_events_are_dropped_when_not_accepted() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let a = line(&group, 0);
    let now = Instant::now();

    a.circuit()
        .enqueue_event(CircuitEventKind::PulseDigit, HashMap::new());
    a.circuit()
        .enqueue_event(CircuitEventKind::OffHook, HashMap::new());

    // Accepted by default.
    let event = a.get_event(now).expect("pulse accepted");
    assert_eq!(event.event().kind(), CircuitEventKind::PulseDigit);
    drop(event);

    a.set_accept_pulse(false);
    a.circuit()
        .enqueue_event(CircuitEventKind::PulseStart, HashMap::new());
    // OffHook is next in the queue and passes through.
    let event = a.get_event(now).expect("offhook");
    assert_eq!(event.event().kind(), CircuitEventKind::OffHook);
    drop(event);
    // The pulse event is silently discarded.
    assert!(a.get_event(now).is_none());
    assert!(a.get_event(now).is_none());
}

#[test]
fn out_of_service_lines_produce_no_events() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let a = line(&group, 0);
    a.circuit()
        .enqueue_event(CircuitEventKind::OffHook, HashMap::new());
    a.enable(false, false, false);
    assert!(a.get_event(Instant::now()).is_none());
}

#[test]
fn expired_timers_surface_as_timeout_events() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let config = AnalogLineConfig {
        delay_dial: 50,
        ..AnalogLineConfig::default()
    };
    let a = AnalogLine::new(Some(&group), 0, &config).unwrap();
    group.append_line(&a);

    let start = Instant::now();
    a.set_timer(TimerKind::DelayDial, start);
    // Before the deadline nothing fires.
    assert!(a.get_event(start).is_none());
    assert!(a.get_event(start + Duration::from_millis(10)).is_none());

    // Past the deadline the tick queues a Timeout on the circuit...
    assert!(a.get_event(start + Duration::from_millis(60)).is_none());
    // ...delivered on the next poll.
    let event = a
        .get_event(start + Duration::from_millis(60))
        .expect("timeout event");
    assert_eq!(event.event().kind(), CircuitEventKind::Timeout);
    assert_eq!(event.event().param("timer"), Some("delaydial"));
}

#[test]
fn echo_canceller_follows_the_line_configuration() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 2);
    let config = AnalogLineConfig {
        echo_cancel: Some(true),
        ..AnalogLineConfig::default()
    };
    let a = AnalogLine::new(Some(&group), 0, &config).unwrap();
    assert_eq!(a.circuit().get_param("echocancel").as_deref(), Some("true"));
    // Connecting retrains the canceller.
    assert_eq!(a.circuit().get_param("echotrain").as_deref(), Some(""));

    // The default tri-state leaves the driver alone.
    let b = AnalogLine::new(Some(&group), 1, &AnalogLineConfig::default()).unwrap();
    assert_eq!(b.circuit().get_param("echocancel"), None);
}

#[test]
fn dropping_a_line_idles_its_circuit_and_unlinks_the_peer() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 2);
    let a = line(&group, 0);
    let b = line(&group, 1);
    a.set_peer(Some(&b), true);

    let circuit = Arc::clone(a.circuit());
    group.remove_line_ref(&a);
    drop(a);
    assert_eq!(circuit.status(), CircuitStatus::Idle);
    assert!(b.peer().is_none());
}

#[test]
fn group_teardown_detaches_lines() {
    let group = group_with_circuits(LineKind::Fxs, "fxs", 1);
    let a = line(&group, 0);
    drop(group);
    assert!(a.group().is_none());
    assert_eq!(a.circuit().status(), CircuitStatus::Missing);
}
