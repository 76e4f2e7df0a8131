//! Control-queue messages.
//!
//! Every input to the controller is serialised through one bounded queue
//! so the state machine sees a single ordered stream:
//!
//! ```text
//! ┌──────────────┐     ┌───────────────┐     ┌──────────────┐
//! │ Bus reader   │────▶│               │     │              │
//! │ Deadline task│────▶│ Control Queue │────▶│  Dispatcher  │──▶ Outbound Queue ──▶ Bus writer
//! │ Stats ticker │────▶│  (Channel)    │     │  (consumer)  │
//! └──────────────┘     └───────────────┘     └──────────────┘
//! ```
//!
//! Producers never touch controller state.  The deadline task only enqueues
//! [`ControlMsg::DeadlineFired`]; the dispatcher decides whether the token
//! still matters.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use crate::timing::ArmedDeadline;

/// Maximum number of pending control messages.
pub const CONTROL_QUEUE_DEPTH: usize = 32;

/// Maximum number of pending outbound publications.
pub const OUTBOUND_QUEUE_DEPTH: usize = 16;

/// Inputs to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    /// Raw message received on a subscribed topic.
    Inbound { topic: String, payload: Vec<u8> },
    /// The timer for `token` elapsed.
    DeadlineFired { token: u32 },
    /// Periodic statistics report is due.
    StatsTick,
    /// The bus connection was lost.
    BusLost,
    /// Orderly stop.
    Shutdown,
}

/// Outputs from the dispatcher to the bus writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMsg {
    Publish { topic: String, payload: Vec<u8> },
    /// The dispatcher has stopped; the writer should exit.
    Close,
}

pub type ControlQueue = Channel<CriticalSectionRawMutex, ControlMsg, CONTROL_QUEUE_DEPTH>;

pub type OutboundQueue = Channel<CriticalSectionRawMutex, OutboundMsg, OUTBOUND_QUEUE_DEPTH>;

/// Latest armed deadline, handed from the dispatcher to the deadline task.
/// `None` means nothing is armed.
pub type DeadlineSignal = Signal<CriticalSectionRawMutex, Option<ArmedDeadline>>;
