//! Cycle context threaded through every FSM handler, plus the domain
//! vocabulary the handlers speak.
//!
//! `CycleContext` is the single struct that state handlers read from and
//! write to.  It holds the fixed configuration, the current can's
//! [`ActiveCycle`] (absent while idle), the evaluation timestamp, and the
//! [`Outcome`] being assembled for the current step.  Handlers never do
//! I/O; they only leave artifacts in the pending outcome.

use core::fmt;

use embassy_time::{Duration, Instant};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::CycleState;
use crate::config::ControllerConfig;

// ---------------------------------------------------------------------------
// Can identity
// ---------------------------------------------------------------------------

/// Opaque can identifier as announced on the `can-detected` topic.
///
/// Sensors publish either a bare number (`1`) or a tag (`"CAN00001"`);
/// the original form is kept so commands echo it back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanId {
    Number(u64),
    Tag(heapless::String<32>),
}

impl CanId {
    /// Build a tag id.  `None` if `tag` exceeds 32 bytes.
    pub fn tag(tag: &str) -> Option<Self> {
        let mut s = heapless::String::new();
        s.push_str(tag).ok()?;
        Some(Self::Tag(s))
    }
}

impl From<u64> for CanId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "#{n}"),
            Self::Tag(t) => f.write_str(t),
        }
    }
}

impl Serialize for CanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.serialize_u64(*n),
            Self::Tag(t) => serializer.serialize_str(t),
        }
    }
}

impl<'de> Deserialize<'de> for CanId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self::Number(n)),
            Raw::Text(t) if t.is_empty() => Err(serde::de::Error::custom("empty can_id")),
            Raw::Text(t) => {
                Self::tag(&t).ok_or_else(|| serde::de::Error::custom("can_id longer than 32 bytes"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Events (inputs to the state machine)
// ---------------------------------------------------------------------------

/// Which deadline produced a synthetic timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Position,
    Fill,
}

/// Typed input to [`FillController::handle`](super::FillController::handle).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CanDetected { can_id: CanId },
    PositionReport { can_id: CanId, position_mm: f32, valid: bool },
    LevelReport { can_id: CanId, level_ml: f32 },
    /// Downstream seal/quality verdict.  Observed for logging only.
    QualityReport { can_id: CanId, passed: bool },
    /// Synthesised by the timing supervisor when a state deadline elapses.
    Timeout(TimeoutKind),
    /// Synthesised when the settle or recovery delay elapses.
    ResetDue,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CanDetected { .. } => "CanDetected",
            Self::PositionReport { .. } => "PositionReport",
            Self::LevelReport { .. } => "LevelReport",
            Self::QualityReport { .. } => "QualityReport",
            Self::Timeout(TimeoutKind::Position) => "Timeout(position)",
            Self::Timeout(TimeoutKind::Fill) => "Timeout(fill)",
            Self::ResetDue => "ResetDue",
        }
    }

    /// The can this event claims to be about, if it names one.
    pub fn can_id(&self) -> Option<&CanId> {
        match self {
            Self::CanDetected { can_id }
            | Self::PositionReport { can_id, .. }
            | Self::LevelReport { can_id, .. }
            | Self::QualityReport { can_id, .. } => Some(can_id),
            Self::Timeout(_) | Self::ResetDue => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    Normal,
    Fault,
}

/// Valve command produced by a step.  At most one per step.
#[derive(Debug, Clone, PartialEq)]
pub enum ValveCommand {
    Open {
        can_id: CanId,
    },
    Close {
        can_id: CanId,
        reason: CloseReason,
        final_level_ml: Option<f32>,
    },
}

impl ValveCommand {
    pub fn can_id(&self) -> &CanId {
        match self {
            Self::Open { can_id } | Self::Close { can_id, .. } => can_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Enumerated reason tag attached to a FAULT transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    PositionTimeout,
    InvalidPosition,
    FillTimeout,
    OutOfTolerance,
}

impl FaultCode {
    pub const ALL: [Self; 4] = [
        Self::PositionTimeout,
        Self::InvalidPosition,
        Self::FillTimeout,
        Self::OutOfTolerance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PositionTimeout => "position_timeout",
            Self::InvalidPosition => "invalid_position",
            Self::FillTimeout => "fill_timeout",
            Self::OutOfTolerance => "out_of_tolerance",
        }
    }

    /// Timing faults are synthesised from deadlines; the rest come from
    /// a received value failing its guard.
    pub fn is_timing(self) -> bool {
        matches!(self, Self::PositionTimeout | Self::FillTimeout)
    }

    /// Dense index for per-code counters.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveState {
    Opening,
    Closed,
    EmergencyClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Normal,
    /// The awaited reading never arrived in time.
    Timeout,
    /// A reading arrived but failed validation.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityVerdict {
    Pass,
    Fail,
}

impl From<bool> for QualityVerdict {
    fn from(passed: bool) -> Self {
        if passed { Self::Pass } else { Self::Fail }
    }
}

/// Produced once per fault; consumed by the persistence sink.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRecord {
    pub code: FaultCode,
    pub description: String,
    /// State in which the fault was detected.
    pub detected_in: CycleState,
    pub can_id: Option<CanId>,
    pub position_mm: Option<f32>,
    pub level_ml: Option<f32>,
}

impl FaultRecord {
    pub fn sensor_status(&self) -> SensorStatus {
        match self.code {
            FaultCode::PositionTimeout | FaultCode::FillTimeout => SensorStatus::Timeout,
            FaultCode::InvalidPosition => SensorStatus::Invalid,
            FaultCode::OutOfTolerance => SensorStatus::Normal,
        }
    }
}

/// Produced once per completed cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub can_id: CanId,
    pub position_mm: Option<f32>,
    pub final_level_ml: f32,
    pub cycle_time_ms: u64,
    pub fill_duration_ms: u64,
    pub valve_state: ValveState,
    pub sensor_status: SensorStatus,
    pub verdict: QualityVerdict,
}

/// Non-fault records, one per significant transition.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    CanDetected { can_id: CanId },
    FillStart { can_id: CanId, position_mm: f32 },
    FillComplete(OutcomeRecord),
}

// ---------------------------------------------------------------------------
// Step outcome
// ---------------------------------------------------------------------------

/// Why an event was dropped without effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The event type has no guard in the current state.
    NotExpectedInState,
    /// The event names a different can than the active cycle.
    CanIdMismatch,
    /// A new can was announced before the controller returned to IDLE.
    CycleActive,
    /// A level reading lower than one already applied.
    StaleReading,
}

impl IgnoreReason {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    Applied,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CycleState,
    /// Final state after any immediate follow-on transitions.
    pub to: CycleState,
}

/// Artifacts of one `handle` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub disposition: Disposition,
    pub command: Option<ValveCommand>,
    pub record: Option<LogRecord>,
    pub fault: Option<FaultRecord>,
    pub transition: Option<Transition>,
}

impl Outcome {
    pub fn is_ignored(&self) -> bool {
        matches!(self.disposition, Disposition::Ignored(_))
    }
}

// ---------------------------------------------------------------------------
// Active cycle
// ---------------------------------------------------------------------------

/// Per-can state.  Exists only while the controller is not IDLE.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveCycle {
    pub can_id: CanId,
    /// Set once, while WAITING_POSITION.
    pub position_mm: Option<f32>,
    /// Non-decreasing while FILLING.
    pub current_level_ml: f32,
    /// Frozen copy of `current_level_ml` taken on entering CLOSING_VALVE.
    pub final_level_ml: Option<f32>,
    pub cycle_start: Instant,
    pub fill_start: Option<Instant>,
}

impl ActiveCycle {
    pub fn start(can_id: CanId, now: Instant) -> Self {
        Self {
            can_id,
            position_mm: None,
            current_level_ml: 0.0,
            final_level_ml: None,
            cycle_start: now,
            fill_start: None,
        }
    }

    pub fn cycle_elapsed(&self, now: Instant) -> Duration {
        now.checked_duration_since(self.cycle_start).unwrap_or_default()
    }

    pub fn fill_elapsed(&self, now: Instant) -> Duration {
        self.fill_start
            .and_then(|t| now.checked_duration_since(t))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// CycleContext
// ---------------------------------------------------------------------------

/// The shared context passed to every state handler function.
pub struct CycleContext {
    // -- Configuration --
    pub config: ControllerConfig,

    // -- Per-can state --
    pub cycle: Option<ActiveCycle>,

    // -- Timing --
    /// Evaluation time of the current step.
    pub now: Instant,

    // -- Output --
    /// Outcome being assembled for the current step.
    pending: Outcome,
}

impl CycleContext {
    pub fn new(config: ControllerConfig, now: Instant) -> Self {
        Self {
            config,
            cycle: None,
            now,
            pending: Outcome::default(),
        }
    }

    /// Reset the pending outcome and stamp the evaluation time.
    pub(crate) fn begin_step(&mut self, now: Instant) {
        self.now = now;
        self.pending = Outcome::default();
    }

    pub(crate) fn take_outcome(&mut self) -> Outcome {
        core::mem::take(&mut self.pending)
    }

    pub(crate) fn set_disposition(&mut self, disposition: Disposition) {
        self.pending.disposition = disposition;
    }

    pub(crate) fn set_transition(&mut self, transition: Transition) {
        self.pending.transition = Some(transition);
    }

    /// Queue a valve command.  A later command in the same step replaces
    /// an earlier one, so a step never emits more than one.
    pub fn emit_command(&mut self, command: ValveCommand) {
        self.pending.command = Some(command);
    }

    pub fn emit_record(&mut self, record: LogRecord) {
        self.pending.record = Some(record);
    }

    /// Record a fault for the FAULT state's `on_enter` to act on.
    pub fn raise_fault(&mut self, code: FaultCode, description: String, detected_in: CycleState) {
        let (can_id, position_mm, level_ml) = match &self.cycle {
            Some(c) => (
                Some(c.can_id.clone()),
                c.position_mm,
                c.final_level_ml.or((c.fill_start.is_some()).then_some(c.current_level_ml)),
            ),
            None => (None, None, None),
        };
        self.pending.fault = Some(FaultRecord {
            code,
            description,
            detected_in,
            can_id,
            position_mm,
            level_ml,
        });
    }

    pub fn pending_fault(&self) -> Option<&FaultRecord> {
        self.pending.fault.as_ref()
    }

    /// True if the event names the active cycle's can.
    pub fn is_current_can(&self, can_id: &CanId) -> bool {
        self.cycle.as_ref().is_some_and(|c| &c.can_id == can_id)
    }
}
