//! Runtime driven from real threads with real timers.
//!
//! Delays are shortened so each test finishes well inside a second.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration as StdDuration;

use embassy_time::Instant;
use serde_json::Value;

use fillctl::adapters::line_bus::LineBusBridge;
use fillctl::app::events::AppEvent;
use fillctl::app::service::ControllerService;
use fillctl::config::{BusConfig, SystemConfig};
use fillctl::error::BusError;
use fillctl::events::{ControlMsg, OutboundMsg};
use fillctl::fsm::CycleState;
use fillctl::fsm::context::FaultCode;
use fillctl::router::codec::RecordKind;
use fillctl::runtime::Runtime;

use crate::mock_bus::{MockEvents, MockRecords};

fn fast_config() -> SystemConfig {
    let mut cfg = SystemConfig::default();
    cfg.controller.position_timeout_ms = 30;
    cfg.controller.max_fill_time_ms = 200;
    cfg.controller.settle_delay_ms = 20;
    cfg.controller.fault_recovery_delay_ms = 40;
    cfg
}

fn inbound(topic: &str, payload: &str) -> ControlMsg {
    ControlMsg::Inbound {
        topic: topic.into(),
        payload: payload.as_bytes().to_vec(),
    }
}

fn drain(runtime: &Runtime) -> Vec<OutboundMsg> {
    let mut out = Vec::new();
    while let Ok(msg) = runtime.outbound().try_receive() {
        out.push(msg);
    }
    out
}

fn publication(action: &str, can_id: u32) -> OutboundMsg {
    OutboundMsg::Publish {
        topic: "valve/command".into(),
        payload: format!(r#"{{"action":"{action}","can_id":{can_id}}}"#).into_bytes(),
    }
}

fn is_fault_close(msg: &OutboundMsg) -> bool {
    match msg {
        OutboundMsg::Publish { payload, .. } => {
            let v: Value = serde_json::from_slice(payload).unwrap();
            v["action"] == "close" && v["reason"] == "fault"
        }
        OutboundMsg::Close => false,
    }
}

fn actions(out: &[OutboundMsg]) -> Vec<String> {
    out.iter()
        .filter_map(|m| match m {
            OutboundMsg::Publish { payload, .. } => {
                let v: Value = serde_json::from_slice(payload).unwrap();
                Some(v["action"].as_str().unwrap().to_string())
            }
            OutboundMsg::Close => None,
        })
        .collect()
}

#[test]
fn full_cycle_through_the_queues() {
    let cfg = fast_config();
    let runtime = Runtime::new();
    let mut svc = ControllerService::new(&cfg, Instant::now());
    let mut rows = MockRecords::new();
    let mut events = MockEvents::new();

    let result = thread::scope(|s| {
        s.spawn(|| {
            runtime.post(inbound("sensor/can_detected", r#"{"can_id": 1}"#));
            runtime.post(inbound(
                "sensor/position",
                r#"{"can_id": 1, "position_mm": 0.2, "valid": true}"#,
            ));
            runtime.post(inbound("sensor/level", r#"{"can_id": 1, "level_ml": 329.5}"#));
            // Long enough for the settle timer to fire.
            thread::sleep(StdDuration::from_millis(150));
            runtime.post(ControlMsg::Shutdown);
        });
        runtime.run(&mut svc, &mut rows, &mut events, None)
    });

    assert!(result.is_ok());
    assert_eq!(svc.state(), CycleState::Idle);
    assert_eq!(
        rows.kinds(),
        vec![
            RecordKind::CanDetected,
            RecordKind::FillStart,
            RecordKind::FillComplete
        ]
    );

    let out = drain(&runtime);
    assert_eq!(actions(&out), vec!["open", "close"]);
    assert_eq!(out.last(), Some(&OutboundMsg::Close));
    assert!(matches!(events.events[0], AppEvent::Started(CycleState::Idle)));
    assert!(matches!(events.events.last(), Some(AppEvent::Stats(_))));
}

#[test]
fn position_deadline_fires_from_the_timer_task() {
    let mut cfg = fast_config();
    cfg.controller.fault_recovery_delay_ms = 2000;
    let runtime = Runtime::new();
    let mut svc = ControllerService::new(&cfg, Instant::now());
    let mut rows = MockRecords::new();
    let mut events = MockEvents::new();

    thread::scope(|s| {
        s.spawn(|| {
            runtime.post(inbound("sensor/can_detected", r#"{"can_id": 5}"#));
            // Past the position timeout, well short of the recovery delay.
            thread::sleep(StdDuration::from_millis(120));
            runtime.post(ControlMsg::Shutdown);
        });
        runtime.run(&mut svc, &mut rows, &mut events, None)
    })
    .unwrap();

    assert_eq!(svc.state(), CycleState::Fault);
    assert_eq!(rows.last().unwrap().fault_code, Some(FaultCode::PositionTimeout));
    assert_eq!(actions(&drain(&runtime)), vec!["close"]);
    assert_eq!(svc.snapshot().deadlines_fired, 1);
}

#[test]
fn stats_ticks_reach_the_event_sink() {
    let runtime = Runtime::new();
    let mut svc = ControllerService::new(&fast_config(), Instant::now());
    let mut rows = MockRecords::new();
    let mut events = MockEvents::new();

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(StdDuration::from_millis(120));
            runtime.post(ControlMsg::Shutdown);
        });
        runtime.run(
            &mut svc,
            &mut rows,
            &mut events,
            Some(embassy_time::Duration::from_millis(25)),
        )
    })
    .unwrap();

    // Ticks plus the final report on shutdown.
    assert!(events.count(|e| matches!(e, AppEvent::Stats(_))) >= 3);
}

#[test]
fn bus_loss_stops_the_runtime_with_an_error() {
    let runtime = Runtime::new();
    let mut svc = ControllerService::new(&fast_config(), Instant::now());
    let mut rows = MockRecords::new();
    let mut events = MockEvents::new();

    runtime.post(ControlMsg::BusLost);
    let result = runtime.run(&mut svc, &mut rows, &mut events, None);
    assert_eq!(result, Err(BusError::Disconnected));
}

#[test]
fn line_bridge_round_trip_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let cfg = SystemConfig {
        bus: BusConfig {
            host: "127.0.0.1".into(),
            port,
            ..BusConfig::default()
        },
        ..fast_config()
    };

    let runtime = Runtime::new();
    let mut svc = ControllerService::new(&cfg, Instant::now());
    let mut rows = MockRecords::new();
    let mut events = MockEvents::new();

    // The listener's backlog accepts the connection before the broker
    // thread gets to it.
    let bridge = LineBusBridge::connect(&cfg.bus).unwrap();
    bridge
        .subscribe(&cfg.bus.client_id, &svc.subscriptions())
        .unwrap();

    let (result, hello, publication) = thread::scope(|s| {
        let broker = s.spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;

            let mut hello = String::new();
            reader.read_line(&mut hello).unwrap();

            writeln!(
                writer,
                r#"{{"topic":"sensor/can_detected","payload":{{"can_id":"A-1"}}}}"#
            )
            .unwrap();
            // Payload sent as a JSON string rather than an object.
            let position = r#"{"can_id":"A-1","position_mm":0.1,"valid":true}"#;
            let envelope = serde_json::json!({"topic": "sensor/position", "payload": position});
            writeln!(writer, "{envelope}").unwrap();

            let mut publication = String::new();
            reader.read_line(&mut publication).unwrap();
            // Dropping the socket ends the session.
            (hello, publication)
        });

        s.spawn(|| bridge.run_reader(&runtime));
        let writer = s.spawn(|| bridge.run_writer(&runtime));

        let result = runtime.run(&mut svc, &mut rows, &mut events, None);
        writer.join().unwrap();
        bridge.shutdown();
        let (hello, publication) = broker.join().unwrap();
        (result, hello, publication)
    });

    assert_eq!(result, Err(BusError::Disconnected));

    let hello: Value = serde_json::from_str(&hello).unwrap();
    assert_eq!(hello["client_id"], "fill_controller");
    assert_eq!(hello["subscribe"].as_array().unwrap().len(), 4);

    let publication: Value = serde_json::from_str(&publication).unwrap();
    assert_eq!(publication["topic"], "valve/command");
    assert_eq!(publication["qos"], 1);
    assert_eq!(publication["payload"]["action"], "open");
    assert_eq!(publication["payload"]["can_id"], "A-1");

    assert_eq!(svc.state(), CycleState::Filling);
}

#[test]
fn fault_close_waits_for_room_in_a_full_outbound_queue() {
    let mut cfg = fast_config();
    cfg.controller.fault_recovery_delay_ms = 2000;
    let runtime = Runtime::new();
    let mut svc = ControllerService::new(&cfg, Instant::now());
    let mut rows = MockRecords::new();
    let mut events = MockEvents::new();

    // A writer that has fallen behind: every outbound slot is taken.
    for n in 0..16 {
        runtime.outbound().try_send(publication("open", 100 + n)).unwrap();
    }

    let (result, mut delivered) = thread::scope(|s| {
        let writer = s.spawn(|| {
            thread::sleep(StdDuration::from_millis(50));
            let mut seen = Vec::new();
            for _ in 0..200 {
                while let Ok(msg) = runtime.outbound().try_receive() {
                    seen.push(msg);
                }
                if seen.iter().any(is_fault_close) {
                    break;
                }
                thread::sleep(StdDuration::from_millis(5));
            }
            runtime.post(ControlMsg::Shutdown);
            seen
        });
        runtime.post(inbound("sensor/can_detected", r#"{"can_id": 2}"#));
        runtime.post(inbound(
            "sensor/position",
            r#"{"can_id": 2, "position_mm": 0.2, "valid": false}"#,
        ));
        let result = runtime.run(&mut svc, &mut rows, &mut events, None);
        (result, writer.join().unwrap())
    });
    delivered.extend(drain(&runtime));

    assert!(result.is_ok());
    assert_eq!(svc.state(), CycleState::Fault);
    assert_eq!(rows.last().unwrap().fault_code, Some(FaultCode::InvalidPosition));
    assert_eq!(svc.router_stats().publish_failures, 0);
    assert_eq!(delivered.len(), 18);
    assert!(is_fault_close(&delivered[16]));
    assert_eq!(delivered.last(), Some(&OutboundMsg::Close));
}

#[test]
fn bus_loss_is_delivered_through_a_full_control_queue() {
    let runtime = Runtime::new();
    let mut svc = ControllerService::new(&fast_config(), Instant::now());
    let mut rows = MockRecords::new();
    let mut events = MockEvents::new();

    for _ in 0..32 {
        runtime.control().try_send(ControlMsg::StatsTick).unwrap();
    }

    let (result, posted) = thread::scope(|s| {
        let poster = s.spawn(|| runtime.post(ControlMsg::BusLost));
        let result = runtime.run(&mut svc, &mut rows, &mut events, None);
        (result, poster.join().unwrap())
    });

    assert!(posted);
    assert_eq!(result, Err(BusError::Disconnected));
    assert!(runtime.is_stopped());
    assert_eq!(drain(&runtime), vec![OutboundMsg::Close]);
}

#[test]
fn post_gives_up_once_the_dispatcher_has_stopped() {
    let runtime = Runtime::new();
    let mut svc = ControllerService::new(&fast_config(), Instant::now());
    let mut rows = MockRecords::new();
    let mut events = MockEvents::new();

    runtime.post(ControlMsg::Shutdown);
    runtime.run(&mut svc, &mut rows, &mut events, None).unwrap();

    for _ in 0..32 {
        runtime.control().try_send(ControlMsg::StatsTick).unwrap();
    }
    assert!(!runtime.post(ControlMsg::BusLost));
}

#[test]
fn writer_reports_a_broken_socket_and_drains_until_close() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let bus = BusConfig {
        host: "127.0.0.1".into(),
        port,
        ..BusConfig::default()
    };
    let bridge = LineBusBridge::connect(&bus).unwrap();
    let (_peer, _) = listener.accept().unwrap();
    bridge.shutdown();

    let runtime = Runtime::new();
    runtime.outbound().try_send(publication("open", 1)).unwrap();
    runtime.outbound().try_send(publication("close", 1)).unwrap();
    runtime.outbound().try_send(OutboundMsg::Close).unwrap();

    bridge.run_writer(&runtime);

    assert!(drain(&runtime).is_empty());
    assert_eq!(runtime.control().try_receive(), Ok(ControlMsg::BusLost));
    assert!(runtime.control().try_receive().is_err());
}
