//! Controller service: the hexagonal core.
//!
//! [`ControllerService`] owns the state machine, the timing supervisor and
//! the event router.  It exposes a clock-free, I/O-free API: callers pass
//! `now` and the port adapters on every call, which makes the whole
//! service drivable from tests with plain mocks.
//!
//! ```text
//!  bus message ──▶ ┌──────────────────────────────┐ ──▶ BusPort (valve commands)
//!                  │      ControllerService        │
//!  deadline ─────▶ │  Router · FSM · Supervisor    │ ──▶ RecordSink (rows)
//!                  └──────────────────────────────┘ ──▶ EventSink (app events)
//! ```

use embassy_time::Instant;
use log::info;

use crate::config::SystemConfig;
use crate::diagnostics::{CycleStats, StatsSnapshot};
use crate::fsm::context::{Event, LogRecord, Outcome};
use crate::fsm::{CycleState, FillController};
use crate::router::codec::EventRecord;
use crate::router::{EventRouter, RouterStats};
use crate::timing::{ArmedDeadline, TimingSupervisor};

use super::events::AppEvent;
use super::ports::{BusPort, EventSink, RecordSink};

// ───────────────────────────────────────────────────────────────
// ControllerService
// ───────────────────────────────────────────────────────────────

/// The application service orchestrates all domain logic.
pub struct ControllerService {
    controller: FillController,
    supervisor: TimingSupervisor,
    router: EventRouter,
    stats: CycleStats,
}

impl ControllerService {
    /// Construct the service from configuration.  The controller rests in
    /// IDLE with nothing armed.
    pub fn new(config: &SystemConfig, now: Instant) -> Self {
        Self::with_router(
            config,
            EventRouter::new(config.topics.clone(), &config.bus),
            now,
        )
    }

    /// As [`new`](Self::new), with a pre-built router.
    pub fn with_router(config: &SystemConfig, router: EventRouter, now: Instant) -> Self {
        Self {
            controller: FillController::new(config.controller.clone(), now),
            supervisor: TimingSupervisor::new(config.controller.clone()),
            router,
            stats: CycleStats::new(),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn start(&mut self, sink: &mut impl EventSink) {
        let state = self.controller.current_state();
        sink.emit(&AppEvent::Started(state));
        info!("ControllerService started in {}", state);
    }

    // ── Inputs ────────────────────────────────────────────────

    /// Decode and apply one bus message.  Returns `None` if the payload
    /// never became an event.
    pub fn on_message(
        &mut self,
        topic: &str,
        payload: &[u8],
        now: Instant,
        bus: &mut impl BusPort,
        records: &mut impl RecordSink,
        sink: &mut impl EventSink,
    ) -> Option<Outcome> {
        let event = self.router.route(topic, payload)?;
        Some(self.dispatch(&event, now, bus, records, sink))
    }

    /// A timer armed for `token` elapsed.  Stale tokens are dropped.
    pub fn on_deadline(
        &mut self,
        token: u32,
        now: Instant,
        bus: &mut impl BusPort,
        records: &mut impl RecordSink,
        sink: &mut impl EventSink,
    ) -> Option<Outcome> {
        let event = self.supervisor.fire(token)?;
        Some(self.dispatch(&event, now, bus, records, sink))
    }

    /// Fire the armed deadline if `now` has reached it.  For drivers that
    /// step time themselves instead of running timer tasks.
    pub fn poll_deadline(
        &mut self,
        now: Instant,
        bus: &mut impl BusPort,
        records: &mut impl RecordSink,
        sink: &mut impl EventSink,
    ) -> Option<Outcome> {
        let event = self.supervisor.poll(now)?;
        Some(self.dispatch(&event, now, bus, records, sink))
    }

    /// Apply one event and carry out its artifacts.
    ///
    /// Order within a step: re-arm the deadline, publish the valve command,
    /// persist the record, persist the fault, then emit app events.
    pub fn dispatch(
        &mut self,
        event: &Event,
        now: Instant,
        bus: &mut impl BusPort,
        records: &mut impl RecordSink,
        sink: &mut impl EventSink,
    ) -> Outcome {
        let outcome = self.controller.handle(event, now);
        self.stats.observe(&outcome);

        if outcome.transition.is_some() {
            self.supervisor
                .on_state_entered(self.controller.deadline_kind(), now);
        }

        if let Some(command) = &outcome.command {
            self.router.publish_command(command, bus);
        }
        if let Some(record) = &outcome.record {
            self.router.persist(&EventRecord::from_log(record), records);
        }
        if let Some(fault) = &outcome.fault {
            self.router.persist(&EventRecord::from_fault(fault), records);
        }

        if let Some(t) = outcome.transition {
            sink.emit(&AppEvent::StateChanged {
                from: t.from,
                to: t.to,
            });
        }
        if let Some(LogRecord::FillComplete(rec)) = &outcome.record {
            sink.emit(&AppEvent::CycleCompleted(rec.clone()));
        }
        if let Some(fault) = &outcome.fault {
            sink.emit(&AppEvent::FaultDetected(fault.clone()));
        }

        outcome
    }

    // ── Reporting ─────────────────────────────────────────────

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            state: self.controller.current_state(),
            cycle: self.stats,
            router: *self.router.stats(),
            deadlines_fired: self.supervisor.fired_count(),
            transitions: self.controller.transition_count(),
        }
    }

    pub fn report_stats(&self, sink: &mut impl EventSink) {
        sink.emit(&AppEvent::Stats(self.snapshot()));
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn state(&self) -> CycleState {
        self.controller.current_state()
    }

    pub fn controller(&self) -> &FillController {
        &self.controller
    }

    /// The deadline the runtime's timer task should be sleeping on.
    pub fn armed_deadline(&self) -> Option<ArmedDeadline> {
        self.supervisor.armed()
    }

    pub fn cycle_stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn router_stats(&self) -> &RouterStats {
        self.router.stats()
    }

    pub fn subscriptions(&self) -> [&str; 4] {
        self.router.subscriptions()
    }
}
