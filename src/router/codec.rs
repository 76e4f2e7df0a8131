//! Wire formats.
//!
//! Inbound sensor payloads and the outbound valve command are UTF-8 JSON
//! objects.  Every inbound object carries an optional `timestamp` and a
//! required `can_id`:
//!
//! ```text
//! sensor/can_detected  {"timestamp": .., "can_id": 17}
//! sensor/position      {"timestamp": .., "can_id": 17, "position_mm": 0.12, "valid": true}
//! sensor/level         {"timestamp": .., "can_id": 17, "level_ml": 301.4}
//! status/quality       {"timestamp": .., "can_id": 17, "result": "PASS"}
//! valve/command        {"timestamp": 1718000000123, "action": "close", "can_id": 17,
//!                       "reason": "normal", "final_level": 329.0}
//! ```
//!
//! A missing `valid` reads as `false`; a missing `level_ml` reads as `0`.
//! Persisted rows are [`EventRecord`]s, one JSON object per row.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::fsm::CycleState;
use crate::fsm::context::{
    CanId, CloseReason, Event, FaultCode, FaultRecord, LogRecord, SensorStatus, ValveCommand,
    ValveState,
};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Sensor timestamps arrive as epoch milliseconds, epoch seconds, or an
/// ISO-8601 string.  They are informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(u64),
    Seconds(f64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanDetectedMsg {
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    pub can_id: CanId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionMsg {
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    pub can_id: CanId,
    pub position_mm: f32,
    #[serde(default)]
    pub valid: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LevelMsg {
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    pub can_id: CanId,
    #[serde(default)]
    pub level_ml: f32,
    /// Target the sensor believes in.  The controller uses its own.
    #[serde(default)]
    pub target: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QualityMsg {
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    pub can_id: CanId,
    pub result: String,
}

/// Which inbound topic a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    CanDetected,
    Position,
    Level,
    Quality,
}

/// Parse `payload` as the message type for `kind`.
pub fn decode(kind: InboundKind, payload: &[u8]) -> Result<Event, DecodeError> {
    match kind {
        InboundKind::CanDetected => {
            let m: CanDetectedMsg = parse(payload)?;
            Ok(Event::CanDetected { can_id: m.can_id })
        }
        InboundKind::Position => {
            let m: PositionMsg = parse(payload)?;
            finite("position_mm", m.position_mm)?;
            Ok(Event::PositionReport {
                can_id: m.can_id,
                position_mm: m.position_mm,
                valid: m.valid,
            })
        }
        InboundKind::Level => {
            let m: LevelMsg = parse(payload)?;
            finite("level_ml", m.level_ml)?;
            Ok(Event::LevelReport {
                can_id: m.can_id,
                level_ml: m.level_ml,
            })
        }
        InboundKind::Quality => {
            let m: QualityMsg = parse(payload)?;
            Ok(Event::QualityReport {
                can_id: m.can_id,
                passed: m.result.eq_ignore_ascii_case("pass"),
            })
        }
    }
}

fn parse<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn finite(field: &'static str, v: f32) -> Result<(), DecodeError> {
    if v.is_finite() { Ok(()) } else { Err(DecodeError::NonFinite(field)) }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveAction {
    Open,
    Close,
}

/// Payload published on the valve command topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveCommandMsg {
    /// Wall-clock epoch milliseconds at publish time.
    pub timestamp: u64,
    pub action: ValveAction,
    pub can_id: CanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CloseReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_level: Option<f32>,
}

impl ValveCommandMsg {
    pub fn from_command(command: &ValveCommand, timestamp: u64) -> Self {
        match command {
            ValveCommand::Open { can_id } => Self {
                timestamp,
                action: ValveAction::Open,
                can_id: can_id.clone(),
                reason: None,
                final_level: None,
            },
            ValveCommand::Close {
                can_id,
                reason,
                final_level_ml,
            } => Self {
                timestamp,
                action: ValveAction::Close,
                can_id: can_id.clone(),
                reason: Some(*reason),
                final_level: *final_level_ml,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    CanDetected,
    FillStart,
    FillComplete,
    FaultDetected,
}

/// One row in the `filling_events` store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_type: RecordKind,
    pub can_id: Option<CanId>,
    pub position_mm: Option<f32>,
    pub fill_level_ml: Option<f32>,
    pub cycle_time_ms: Option<u64>,
    pub fill_duration_ms: Option<u64>,
    pub valve_state: Option<ValveState>,
    pub sensor_status: Option<SensorStatus>,
    pub fault_code: Option<FaultCode>,
    pub fault_description: Option<String>,
    /// Controller state the row was written in.
    pub system_state: CycleState,
}

impl EventRecord {
    fn empty(event_type: RecordKind, system_state: CycleState) -> Self {
        Self {
            event_type,
            can_id: None,
            position_mm: None,
            fill_level_ml: None,
            cycle_time_ms: None,
            fill_duration_ms: None,
            valve_state: None,
            sensor_status: None,
            fault_code: None,
            fault_description: None,
            system_state,
        }
    }

    pub fn from_log(record: &LogRecord) -> Self {
        match record {
            LogRecord::CanDetected { can_id } => Self {
                can_id: Some(can_id.clone()),
                ..Self::empty(RecordKind::CanDetected, CycleState::WaitingPosition)
            },
            LogRecord::FillStart {
                can_id,
                position_mm,
            } => Self {
                can_id: Some(can_id.clone()),
                position_mm: Some(*position_mm),
                valve_state: Some(ValveState::Opening),
                ..Self::empty(RecordKind::FillStart, CycleState::Filling)
            },
            LogRecord::FillComplete(o) => Self {
                can_id: Some(o.can_id.clone()),
                position_mm: o.position_mm,
                fill_level_ml: Some(o.final_level_ml),
                cycle_time_ms: Some(o.cycle_time_ms),
                fill_duration_ms: Some(o.fill_duration_ms),
                valve_state: Some(o.valve_state),
                sensor_status: Some(o.sensor_status),
                ..Self::empty(RecordKind::FillComplete, CycleState::Complete)
            },
        }
    }

    pub fn from_fault(fault: &FaultRecord) -> Self {
        Self {
            can_id: fault.can_id.clone(),
            position_mm: fault.position_mm,
            fill_level_ml: fault.level_ml,
            valve_state: Some(ValveState::EmergencyClose),
            sensor_status: Some(fault.sensor_status()),
            fault_code: Some(fault.code),
            fault_description: Some(fault.description.clone()),
            ..Self::empty(RecordKind::FaultDetected, CycleState::Fault)
        }
    }
}
