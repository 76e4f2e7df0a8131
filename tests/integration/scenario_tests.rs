//! End-to-end fill cycles through the `ControllerService`.
//!
//! Messages go in as raw topic/payload pairs, exactly as the bus delivers
//! them, and time is stepped by hand with `poll_deadline`.

use embassy_time::Instant;

use fillctl::app::events::AppEvent;
use fillctl::app::service::ControllerService;
use fillctl::config::SystemConfig;
use fillctl::fsm::CycleState;
use fillctl::fsm::context::{
    CanId, CloseReason, FaultCode, IgnoreReason, QualityVerdict, SensorStatus, ValveState,
};
use fillctl::router::codec::{RecordKind, ValveAction};

use crate::mock_bus::{MockBus, MockEvents, MockRecords};

struct Line {
    svc: ControllerService,
    bus: MockBus,
    rows: MockRecords,
    events: MockEvents,
}

impl Line {
    fn new() -> Self {
        let mut events = MockEvents::new();
        let mut svc = ControllerService::new(&SystemConfig::default(), at(0));
        svc.start(&mut events);
        Self {
            svc,
            bus: MockBus::new(),
            rows: MockRecords::new(),
            events,
        }
    }

    fn send(&mut self, topic: &str, payload: &str, ms: u64) {
        self.svc.on_message(
            topic,
            payload.as_bytes(),
            at(ms),
            &mut self.bus,
            &mut self.rows,
            &mut self.events,
        );
    }

    fn tick(&mut self, ms: u64) {
        self.svc
            .poll_deadline(at(ms), &mut self.bus, &mut self.rows, &mut self.events);
    }

    fn detect(&mut self, can: u64, ms: u64) {
        self.send("sensor/can_detected", &format!(r#"{{"can_id": {can}}}"#), ms);
    }

    fn position(&mut self, can: u64, mm: f32, valid: bool, ms: u64) {
        self.send(
            "sensor/position",
            &format!(r#"{{"can_id": {can}, "position_mm": {mm}, "valid": {valid}}}"#),
            ms,
        );
    }

    fn level(&mut self, can: u64, ml: f32, ms: u64) {
        self.send(
            "sensor/level",
            &format!(r#"{{"can_id": {can}, "level_ml": {ml}, "target": 330.0}}"#),
            ms,
        );
    }

    fn state(&self) -> CycleState {
        self.svc.state()
    }
}

fn at(ms: u64) -> Instant {
    Instant::from_millis(ms)
}

// ── Scenario A: nominal fill ─────────────────────────────────

#[test]
fn nominal_fill_completes_and_resets_after_settle() {
    let mut line = Line::new();

    line.detect(1, 0);
    assert_eq!(line.state(), CycleState::WaitingPosition);

    line.position(1, 0.5, true, 50);
    assert_eq!(line.state(), CycleState::Filling);
    assert_eq!(line.bus.actions(), vec![ValveAction::Open]);
    assert!(line.bus.valve_open());

    line.level(1, 120.0, 400);
    line.level(1, 326.0, 1000);
    assert_eq!(line.state(), CycleState::Complete);

    let close = line.bus.last_command().unwrap();
    assert_eq!(close.action, ValveAction::Close);
    assert_eq!(close.reason, Some(CloseReason::Normal));
    assert_eq!(close.final_level, Some(326.0));
    assert_eq!(close.can_id, CanId::Number(1));
    assert_eq!(line.bus.published.len(), 2);
    assert!(line.bus.published.iter().all(|(t, _)| t == "valve/command"));

    assert_eq!(
        line.rows.kinds(),
        vec![
            RecordKind::CanDetected,
            RecordKind::FillStart,
            RecordKind::FillComplete
        ]
    );
    let row = line.rows.last().unwrap();
    assert_eq!(row.fill_level_ml, Some(326.0));
    assert_eq!(row.cycle_time_ms, Some(1000));
    assert_eq!(row.fill_duration_ms, Some(950));
    assert_eq!(row.valve_state, Some(ValveState::Closed));
    assert_eq!(row.sensor_status, Some(SensorStatus::Normal));
    assert_eq!(row.system_state, CycleState::Complete);

    let outcome = line
        .events
        .events
        .iter()
        .find_map(|e| match e {
            AppEvent::CycleCompleted(rec) => Some(rec.clone()),
            _ => None,
        })
        .expect("cycle completed event");
    assert_eq!(outcome.verdict, QualityVerdict::Pass);
    assert_eq!(outcome.position_mm, Some(0.5));

    // Settle delay is 500ms from entering COMPLETE.
    line.tick(1499);
    assert_eq!(line.state(), CycleState::Complete);
    line.tick(1500);
    assert_eq!(line.state(), CycleState::Idle);
    assert!(line.svc.controller().active_cycle().is_none());
    assert!(line.svc.armed_deadline().is_none());
}

#[test]
fn consecutive_cans_each_get_a_full_cycle() {
    let mut line = Line::new();
    let mut t = 0;
    for can in 1..=3 {
        line.detect(can, t);
        line.position(can, 0.1, true, t + 20);
        line.level(can, 330.0, t + 800);
        line.tick(t + 1300);
        assert_eq!(line.state(), CycleState::Idle, "can {can}");
        t += 2000;
    }

    let stats = line.svc.cycle_stats();
    assert_eq!(stats.cycles_started, 3);
    assert_eq!(stats.cycles_completed, 3);
    assert_eq!(stats.total_faults(), 0);
    assert_eq!(stats.yield_ratio(), Some(1.0));
    assert_eq!(
        line.bus.actions(),
        vec![
            ValveAction::Open,
            ValveAction::Close,
            ValveAction::Open,
            ValveAction::Close,
            ValveAction::Open,
            ValveAction::Close
        ]
    );
}

// ── Scenario B: invalid position ─────────────────────────────

#[test]
fn invalid_position_faults_without_opening_the_valve() {
    let mut line = Line::new();
    line.detect(2, 0);
    line.position(2, 3.5, false, 30);

    assert_eq!(line.state(), CycleState::Fault);
    assert_eq!(line.bus.actions(), vec![ValveAction::Close]);
    let close = line.bus.last_command().unwrap();
    assert_eq!(close.reason, Some(CloseReason::Fault));
    assert_eq!(close.can_id, CanId::Number(2));

    let fault_row = line.rows.last().unwrap();
    assert_eq!(fault_row.event_type, RecordKind::FaultDetected);
    assert_eq!(fault_row.fault_code, Some(FaultCode::InvalidPosition));
    assert_eq!(fault_row.position_mm, Some(3.5));
    assert_eq!(fault_row.sensor_status, Some(SensorStatus::Invalid));
    assert!(
        fault_row
            .fault_description
            .as_deref()
            .unwrap()
            .contains("3.50mm")
    );

    // Recovery delay is 2000ms from entering FAULT.
    line.tick(2029);
    assert_eq!(line.state(), CycleState::Fault);
    line.tick(2030);
    assert_eq!(line.state(), CycleState::Idle);
}

// ── Scenario C: no position report ───────────────────────────

#[test]
fn missing_position_report_times_out() {
    let mut line = Line::new();
    line.detect(3, 0);

    line.tick(199);
    assert_eq!(line.state(), CycleState::WaitingPosition);
    line.tick(250);
    assert_eq!(line.state(), CycleState::Fault);

    let fault = line
        .events
        .events
        .iter()
        .find_map(|e| match e {
            AppEvent::FaultDetected(f) => Some(f.clone()),
            _ => None,
        })
        .expect("fault event");
    assert_eq!(fault.code, FaultCode::PositionTimeout);
    assert_eq!(fault.detected_in, CycleState::WaitingPosition);
    assert_eq!(fault.position_mm, None);
    assert_eq!(line.rows.last().unwrap().sensor_status, Some(SensorStatus::Timeout));

    // A position report that straggles in afterwards changes nothing.
    line.position(3, 0.2, true, 260);
    assert_eq!(line.state(), CycleState::Fault);
    assert!(!line.bus.valve_open());
}

#[test]
fn late_position_report_faults_on_receipt() {
    let mut line = Line::new();
    line.detect(4, 0);
    // Arrives after the timeout but before the timer was polled.
    line.position(4, 0.2, true, 260);
    assert_eq!(line.state(), CycleState::Fault);
    assert_eq!(
        line.rows.last().unwrap().fault_code,
        Some(FaultCode::PositionTimeout)
    );
    assert!(!line.bus.valve_open());
}

// ── Scenario D: fill never reaches the threshold ─────────────

#[test]
fn slow_fill_times_out_and_closes_the_valve() {
    let mut line = Line::new();
    line.detect(5, 0);
    line.position(5, 0.3, true, 40);
    assert_eq!(line.state(), CycleState::Filling);

    for (i, ml) in [50.0, 120.0, 200.0, 280.0].into_iter().enumerate() {
        line.level(5, ml, 500 + 500 * i as u64);
    }
    assert_eq!(line.state(), CycleState::Filling);

    line.tick(3039);
    assert_eq!(line.state(), CycleState::Filling);
    line.tick(3040);
    assert_eq!(line.state(), CycleState::Fault);

    let close = line.bus.last_command().unwrap();
    assert_eq!(close.action, ValveAction::Close);
    assert_eq!(close.reason, Some(CloseReason::Fault));

    let fault_row = line.rows.last().unwrap();
    assert_eq!(fault_row.fault_code, Some(FaultCode::FillTimeout));
    assert_eq!(fault_row.fill_level_ml, Some(280.0));
    assert_eq!(fault_row.valve_state, Some(ValveState::EmergencyClose));
    assert_eq!(line.svc.cycle_stats().faults_for(FaultCode::FillTimeout), 1);
}

// ── Overshoot ────────────────────────────────────────────────

#[test]
fn overshoot_closes_once_and_faults() {
    let mut line = Line::new();
    line.detect(6, 0);
    line.position(6, 0.1, true, 10);
    line.level(6, 340.0, 900);

    assert_eq!(line.state(), CycleState::Fault);
    assert_eq!(line.bus.actions(), vec![ValveAction::Open, ValveAction::Close]);
    let close = line.bus.last_command().unwrap();
    assert_eq!(close.final_level, Some(340.0));
    assert_eq!(line.rows.last().unwrap().fault_code, Some(FaultCode::OutOfTolerance));
    assert!(
        !line.rows.kinds().contains(&RecordKind::FillComplete),
        "an out-of-tolerance cycle has no outcome row"
    );
}

// ── Robustness ───────────────────────────────────────────────

#[test]
fn readings_for_other_cans_are_ignored() {
    let mut line = Line::new();
    line.detect(7, 0);
    line.position(8, 0.1, true, 10);
    assert_eq!(line.state(), CycleState::WaitingPosition);

    line.position(7, 0.1, true, 20);
    line.level(8, 330.0, 100);
    assert_eq!(line.state(), CycleState::Filling);
    assert!(line.bus.valve_open());

    // A second can arriving mid-cycle does not restart anything.
    line.detect(9, 150);
    assert_eq!(
        line.svc.controller().active_cycle().unwrap().can_id,
        CanId::Number(7)
    );
    let stats = line.svc.cycle_stats();
    assert_eq!(stats.ignored_for(IgnoreReason::CanIdMismatch), 2);
    assert_eq!(stats.ignored_for(IgnoreReason::CycleActive), 1);
    assert_eq!(stats.events_ignored, 3);
}

#[test]
fn malformed_payloads_are_dropped_and_counted() {
    let mut line = Line::new();
    line.send("sensor/can_detected", "not json", 0);
    line.send("sensor/level", r#"{"level_ml": 10.0}"#, 0);
    line.send("plant/unrelated", r#"{"can_id": 1}"#, 0);
    assert_eq!(line.state(), CycleState::Idle);

    let stats = line.svc.router_stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.parse_errors, 2);
    assert_eq!(stats.unknown_topic, 1);

    // The controller keeps working afterwards.
    line.detect(1, 10);
    assert_eq!(line.state(), CycleState::WaitingPosition);
}

#[test]
fn string_can_ids_are_echoed_verbatim() {
    let mut line = Line::new();
    line.send("sensor/can_detected", r#"{"can_id": "LOT7-0042"}"#, 0);
    line.send(
        "sensor/position",
        r#"{"can_id": "LOT7-0042", "position_mm": 0.4, "valid": true}"#,
        20,
    );
    assert_eq!(line.state(), CycleState::Filling);

    let (_, payload) = &line.bus.published[0];
    let v: serde_json::Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(v["can_id"], "LOT7-0042");
    assert_eq!(v["action"], "open");
}

#[test]
fn quality_verdicts_are_observed_only() {
    let mut line = Line::new();
    line.detect(1, 0);
    line.position(1, 0.1, true, 10);
    line.level(1, 330.0, 500);
    assert_eq!(line.state(), CycleState::Complete);

    let rows_before = line.rows.rows.len();
    line.send("status/quality", r#"{"can_id": 1, "result": "FAIL"}"#, 600);
    assert_eq!(line.state(), CycleState::Complete);
    assert_eq!(line.rows.rows.len(), rows_before);

    line.tick(1000);
    assert_eq!(line.state(), CycleState::Idle);
}

#[test]
fn store_outage_does_not_stop_the_line() {
    let mut line = Line::new();
    line.rows.broken = true;

    line.detect(1, 0);
    line.position(1, 0.1, true, 10);
    line.level(1, 330.0, 500);
    assert_eq!(line.state(), CycleState::Complete);
    assert_eq!(line.bus.actions(), vec![ValveAction::Open, ValveAction::Close]);
    assert_eq!(line.svc.router_stats().persist_failures, 3);
}

#[test]
fn transient_publish_failure_is_retried() {
    let mut line = Line::new();
    line.bus.fail_next = 2;

    line.detect(1, 0);
    line.position(1, 0.1, true, 10);
    assert!(line.bus.valve_open());
    let stats = line.svc.router_stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.publish_retries, 2);
    assert_eq!(stats.publish_failures, 0);
}

#[test]
fn app_events_trace_resting_states() {
    let mut line = Line::new();
    line.detect(1, 0);
    line.position(1, 0.1, true, 10);
    line.level(1, 330.0, 500);
    line.tick(1000);

    let path: Vec<(CycleState, CycleState)> = line
        .events
        .events
        .iter()
        .filter_map(|e| match e {
            AppEvent::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        path,
        vec![
            (CycleState::Idle, CycleState::WaitingPosition),
            (CycleState::WaitingPosition, CycleState::Filling),
            (CycleState::Filling, CycleState::Complete),
            (CycleState::Complete, CycleState::Idle),
        ]
    );
    assert!(matches!(line.events.events[0], AppEvent::Started(CycleState::Idle)));
}
