//! Outbound application events.
//!
//! The [`ControllerService`](super::service::ControllerService) emits these
//! through the [`EventSink`](super::ports::EventSink) port.  Adapters on the
//! other side decide what to do with them.

use crate::diagnostics::StatsSnapshot;
use crate::fsm::CycleState;
use crate::fsm::context::{FaultRecord, OutcomeRecord};

/// Structured events emitted by the application core.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// The service has started (carries initial state).
    Started(CycleState),

    /// The controller moved between resting states.
    StateChanged { from: CycleState, to: CycleState },

    /// A cycle ended in FAULT.
    FaultDetected(FaultRecord),

    /// A cycle ended in COMPLETE.
    CycleCompleted(OutcomeRecord),

    /// Periodic counters.
    Stats(StatsSnapshot),
}
