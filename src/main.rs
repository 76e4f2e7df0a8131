//! Fill controller: main entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  LineBusBridge        JsonlRecordSink      LogEventSink        │
//! │  (reader + writer)    (RecordSink)         (EventSink)         │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │           ControllerService (pure logic)               │    │
//! │  │  Router · FillController · TimingSupervisor            │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Runtime (LocalExecutor: dispatcher · deadline · stats)        │
//! └────────────────────────────────────────────────────────────────┘
//! ```

#![deny(unused_must_use)]

use anyhow::{Context, Result};
use embassy_time::{Duration, Instant};
use log::{info, warn};
use tracing_subscriber::EnvFilter;

use fillctl::adapters::file_sink::JsonlRecordSink;
use fillctl::adapters::line_bus::LineBusBridge;
use fillctl::adapters::log_sink::{LogEventSink, LogRecordSink};
use fillctl::app::ports::RecordSink;
use fillctl::app::service::ControllerService;
use fillctl::config::SystemConfig;
use fillctl::error::{Error, PersistError};
use fillctl::router::codec::EventRecord;
use fillctl::runtime::Runtime;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

// ── Journal selection ─────────────────────────────────────────
//
// Rows go to the JSON-lines journal when it can be opened, otherwise to
// the log so the line keeps running without a store.
enum Journal {
    File(JsonlRecordSink),
    Log(LogRecordSink),
}

impl RecordSink for Journal {
    fn write(&mut self, record: &EventRecord) -> Result<(), PersistError> {
        match self {
            Self::File(sink) => sink.write(record),
            Self::Log(sink) => sink.write(record),
        }
    }
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    // ── 1. Logging ────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("fillctl v{} starting", env!("CARGO_PKG_VERSION"));

    // ── 2. Configuration ──────────────────────────────────────
    let config = SystemConfig::from_env().context("loading configuration from environment")?;
    let c = &config.controller;
    info!(
        "Config: target={}±{}mL position_timeout={}ms max_fill={}ms settle={}ms recovery={}ms",
        c.target_level_ml,
        c.tolerance_ml,
        c.position_timeout_ms,
        c.max_fill_time_ms,
        c.settle_delay_ms,
        c.fault_recovery_delay_ms
    );

    // ── 3. Persistence ────────────────────────────────────────
    let mut journal = match JsonlRecordSink::open(&config.persistence.journal_path) {
        Ok(sink) => {
            info!("Journal: rows appended to {}", sink.path().display());
            Journal::File(sink)
        }
        Err(e) => {
            warn!("Journal unavailable ({}), writing rows to the log only", e);
            Journal::Log(LogRecordSink)
        }
    };

    // ── 4. Service ────────────────────────────────────────────
    let mut service = ControllerService::new(&config, Instant::now());

    // ── 5. Bus + run ──────────────────────────────────────────
    serve(&config, &mut service, &mut journal).context("controller stopped")?;
    info!("fillctl stopped");
    Ok(())
}

/// Connect to the broker and run the dispatcher until the bus drops or a
/// shutdown is posted.
fn serve(
    config: &SystemConfig,
    service: &mut ControllerService,
    journal: &mut Journal,
) -> Result<(), Error> {
    let bridge =
        LineBusBridge::connect_with_retry(&config.bus, CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY)?;
    bridge.subscribe(&config.bus.client_id, &service.subscriptions())?;

    let runtime = Runtime::new();
    let mut events = LogEventSink::new();
    let stats_interval = (config.controller.stats_interval_secs > 0)
        .then(|| Duration::from_secs(u64::from(config.controller.stats_interval_secs)));

    info!("System ready. Entering event loop.");
    let result = std::thread::scope(|s| {
        s.spawn(|| bridge.run_reader(&runtime));
        s.spawn(|| bridge.run_writer(&runtime));
        let result = runtime.run(service, journal, &mut events, stats_interval);
        bridge.shutdown();
        result
    });
    Ok(result?)
}
