//! Event router: translation between the bus and the state machine.
//!
//! ```text
//!  topic + bytes ──▶ route() ──▶ Event ──▶ FillController
//!                       │
//!                       └─ malformed: dropped, counted, warning (rate-limited)
//!
//!  ValveCommand ──▶ publish_command() ──▶ BusPort (with retries)
//!  LogRecord / FaultRecord ──▶ persist() ──▶ RecordSink (log fallback)
//! ```
//!
//! The router is the only place that knows topic names or JSON shapes.

pub mod codec;

use core::time::Duration;

use burster::Limiter;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{BusPort, RecordSink};
use crate::config::{BusConfig, TopicConfig};
use crate::error::DecodeError;
use crate::fsm::context::{Event, ValveCommand};

use codec::{EventRecord, InboundKind, ValveCommandMsg};

/// I/O-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub received: u64,
    pub parse_errors: u64,
    pub unknown_topic: u64,
    pub published: u64,
    pub publish_retries: u64,
    pub publish_failures: u64,
    pub persisted: u64,
    pub persist_failures: u64,
}

/// Decodes inbound traffic and encodes outbound commands and rows.
pub struct EventRouter {
    topics: TopicConfig,
    publish_retries: u8,
    stats: RouterStats,
    /// Throttles malformed-payload warnings; drops are always counted.
    warn_limiter: burster::TokenBucket<fn() -> Duration>,
    wall_clock_ms: fn() -> u64,
}

impl EventRouter {
    pub fn new(topics: TopicConfig, bus: &BusConfig) -> Self {
        Self {
            topics,
            publish_retries: bus.publish_retries,
            stats: RouterStats::default(),
            warn_limiter: burster::TokenBucket::new_with_time_provider(
                10,
                10, // 10 warnings per second, 10 burst capacity
                platform_now as fn() -> Duration,
            ),
            wall_clock_ms: epoch_millis,
        }
    }

    /// Replace the wall clock used to stamp outbound commands.
    pub fn with_wall_clock(mut self, clock: fn() -> u64) -> Self {
        self.wall_clock_ms = clock;
        self
    }

    /// Topics the bus adapter must subscribe to.
    pub fn subscriptions(&self) -> [&str; 4] {
        [
            self.topics.can_detected.as_str(),
            self.topics.position.as_str(),
            self.topics.level.as_str(),
            self.topics.quality.as_str(),
        ]
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    // ── Inbound ───────────────────────────────────────────────

    /// Classify `topic`, or `None` if it is not one we consume.
    pub fn inbound_kind(&self, topic: &str) -> Option<InboundKind> {
        let t = &self.topics;
        if topic == t.can_detected {
            Some(InboundKind::CanDetected)
        } else if topic == t.position {
            Some(InboundKind::Position)
        } else if topic == t.level {
            Some(InboundKind::Level)
        } else if topic == t.quality {
            Some(InboundKind::Quality)
        } else {
            None
        }
    }

    /// Decode one inbound message without touching the counters.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<Event, DecodeError> {
        let kind = self.inbound_kind(topic).ok_or(DecodeError::UnknownTopic)?;
        codec::decode(kind, payload)
    }

    /// Decode one inbound message.  Failures are counted and logged,
    /// never propagated.
    pub fn route(&mut self, topic: &str, payload: &[u8]) -> Option<Event> {
        self.stats.received += 1;
        match self.decode(topic, payload) {
            Ok(event) => {
                debug!("ROUTER: {} -> {}", topic, event.name());
                Some(event)
            }
            Err(DecodeError::UnknownTopic) => {
                self.stats.unknown_topic += 1;
                debug!("ROUTER: ignoring message on unsubscribed topic '{}'", topic);
                None
            }
            Err(e) => {
                self.stats.parse_errors += 1;
                if self.warn_limiter.try_consume(1).is_ok() {
                    warn!(
                        "ROUTER: dropped payload on '{}': {} ({} dropped so far)",
                        topic, e, self.stats.parse_errors
                    );
                }
                None
            }
        }
    }

    // ── Outbound ──────────────────────────────────────────────

    /// Publish a valve command, retrying up to the configured count.
    /// Returns `false` if every attempt failed.
    pub fn publish_command(&mut self, command: &ValveCommand, bus: &mut impl BusPort) -> bool {
        let msg = ValveCommandMsg::from_command(command, (self.wall_clock_ms)());
        let payload = match serde_json::to_vec(&msg) {
            Ok(p) => p,
            Err(e) => {
                error!("ROUTER: could not encode valve command: {}", e);
                self.stats.publish_failures += 1;
                return false;
            }
        };

        for attempt in 0..=self.publish_retries {
            if attempt > 0 {
                self.stats.publish_retries += 1;
            }
            match bus.publish(&self.topics.valve_command, &payload) {
                Ok(()) => {
                    self.stats.published += 1;
                    info!(
                        "VALVE | {:?} can={} reason={:?}",
                        msg.action, msg.can_id, msg.reason
                    );
                    return true;
                }
                Err(e) => warn!(
                    "ROUTER: publish attempt {} of {} failed: {}",
                    attempt + 1,
                    u32::from(self.publish_retries) + 1,
                    e
                ),
            }
        }

        self.stats.publish_failures += 1;
        error!(
            "ROUTER: valve command for can {} dropped after {} attempts",
            msg.can_id,
            u32::from(self.publish_retries) + 1
        );
        false
    }

    /// Write a row to the sink.  On failure the row goes to the log
    /// instead and the controller carries on.
    pub fn persist(&mut self, row: &EventRecord, sink: &mut impl RecordSink) {
        match sink.write(row) {
            Ok(()) => self.stats.persisted += 1,
            Err(e) => {
                self.stats.persist_failures += 1;
                let json = serde_json::to_string(row).unwrap_or_else(|_| format!("{row:?}"));
                warn!("PERSIST | {} | row kept in log: {}", e, json);
            }
        }
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn platform_now() -> Duration {
    use std::time::Instant;
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}
