//! Log-based sink adapters.
//!
//! [`LogEventSink`] writes structured application events through the `log`
//! facade.  [`LogRecordSink`] is the persistence sink of last resort: it
//! writes every row to the log when no journal can be opened.

use log::{info, warn};

use crate::app::events::AppEvent;
use crate::app::ports::{EventSink, RecordSink};
use crate::error::PersistError;
use crate::router::codec::EventRecord;

/// Adapter that logs every [`AppEvent`].
#[derive(Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Started(state) => {
                info!("START | initial_state={}", state);
            }
            AppEvent::StateChanged { from, to } => {
                info!("STATE | {} -> {}", from, to);
            }
            AppEvent::FaultDetected(f) => {
                warn!(
                    "FAULT | code={} | can={} | in={} | {}",
                    f.code,
                    f.can_id.as_ref().map_or_else(|| "-".to_string(), ToString::to_string),
                    f.detected_in,
                    f.description
                );
            }
            AppEvent::CycleCompleted(o) => {
                info!(
                    "CYCLE | can={} | level={:.1}mL | cycle={}ms | fill={}ms | {:?}",
                    o.can_id, o.final_level_ml, o.cycle_time_ms, o.fill_duration_ms, o.verdict
                );
            }
            AppEvent::Stats(s) => {
                let yield_pct = s
                    .cycle
                    .yield_ratio()
                    .map_or_else(|| "-".to_string(), |r| format!("{:.1}%", r * 100.0));
                info!(
                    "STATS | state={} | started={} completed={} faults={} yield={} | \
                     rx={} parse_err={} tx={} tx_fail={} | rows={} row_fail={} | \
                     deadlines={} transitions={}",
                    s.state,
                    s.cycle.cycles_started,
                    s.cycle.cycles_completed,
                    s.cycle.total_faults(),
                    yield_pct,
                    s.router.received,
                    s.router.parse_errors,
                    s.router.published,
                    s.router.publish_failures,
                    s.router.persisted,
                    s.router.persist_failures,
                    s.deadlines_fired,
                    s.transitions,
                );
            }
        }
    }
}

/// Persistence sink that writes rows to the log.  Never fails.
#[derive(Default)]
pub struct LogRecordSink;

impl RecordSink for LogRecordSink {
    fn write(&mut self, record: &EventRecord) -> Result<(), PersistError> {
        let json = serde_json::to_string(record).map_err(|e| PersistError::Encode(e.to_string()))?;
        info!("RECORD | {}", json);
        Ok(())
    }
}
