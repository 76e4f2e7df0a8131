//! Fuzz target: `ControllerService::on_message`
//!
//! Splits the input into (topic selector, time step, payload) chunks and
//! drives them through a controller.  The controller must never panic,
//! never rest in CLOSING_VALVE, and hold an active cycle exactly when it
//! is not IDLE.
//!
//! cargo fuzz run fuzz_message_stream

#![no_main]

use embassy_time::Instant;
use fillctl::app::events::AppEvent;
use fillctl::app::ports::{BusPort, EventSink, RecordSink};
use fillctl::app::service::ControllerService;
use fillctl::config::SystemConfig;
use fillctl::error::{BusError, PersistError};
use fillctl::fsm::CycleState;
use fillctl::router::codec::EventRecord;
use libfuzzer_sys::fuzz_target;

struct Null;

impl BusPort for Null {
    fn publish(&mut self, _topic: &str, _payload: &[u8]) -> Result<(), BusError> {
        Ok(())
    }
}

impl RecordSink for Null {
    fn write(&mut self, _record: &EventRecord) -> Result<(), PersistError> {
        Ok(())
    }
}

impl EventSink for Null {
    fn emit(&mut self, _event: &AppEvent) {}
}

fuzz_target!(|data: &[u8]| {
    let config = SystemConfig::default();
    let mut svc = ControllerService::new(&config, Instant::from_millis(0));
    let topics = svc.subscriptions().map(str::to_string);
    let (mut bus, mut rows, mut events) = (Null, Null, Null);
    let mut now = 0u64;

    // Each chunk: [topic, step_lo, step_hi, len, payload..len]
    let mut rest = data;
    while rest.len() >= 4 {
        let topic = &topics[usize::from(rest[0]) % topics.len()];
        now += u64::from(u16::from_le_bytes([rest[1], rest[2]]));
        let len = usize::from(rest[3]).min(rest.len() - 4);
        let payload = &rest[4..4 + len];
        rest = &rest[4 + len..];

        let at = Instant::from_millis(now);
        svc.poll_deadline(at, &mut bus, &mut rows, &mut events);
        svc.on_message(topic, payload, at, &mut bus, &mut rows, &mut events);

        assert_ne!(svc.state(), CycleState::ClosingValve);
        assert_eq!(
            svc.state() == CycleState::Idle,
            svc.controller().active_cycle().is_none()
        );
    }
});
