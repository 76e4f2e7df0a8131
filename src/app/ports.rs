//! Port traits: the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ ControllerService (domain)
//! ```
//!
//! Driven adapters (message bus, persistence sink, event sink) implement
//! these traits.  The [`ControllerService`](super::service::ControllerService)
//! consumes them via generics, so the state machine never touches a socket
//! or a file.
//!
//! All port errors are typed; see [`crate::error`].

use crate::error::{BusError, PersistError};
use crate::router::codec::EventRecord;

// ───────────────────────────────────────────────────────────────
// Bus port (driven adapter: domain → message bus)
// ───────────────────────────────────────────────────────────────

/// Outbound half of the publish/subscribe bus.
///
/// Implementations deliver at least once.  Inbound messages do not flow
/// through this trait; the runtime pushes them onto the control queue.
pub trait BusPort {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BusError>;
}

// ───────────────────────────────────────────────────────────────
// Record sink port (driven adapter: domain → persistence)
// ───────────────────────────────────────────────────────────────

/// Append-only store for [`EventRecord`] rows.
///
/// A failed write must not stop the controller; the caller degrades to
/// the log.
pub trait RecordSink {
    fn write(&mut self, record: &EventRecord) -> Result<(), PersistError>;
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`AppEvent`](super::events::AppEvent)s
/// through this port.  Adapters decide where they go.
pub trait EventSink {
    fn emit(&mut self, event: &super::events::AppEvent);
}
