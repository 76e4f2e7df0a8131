//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter      | Implements   | Connects to                      |
//! |--------------|--------------|----------------------------------|
//! | `line_bus`   | (threads)    | Broker gateway over TCP, JSONL   |
//! | `log_sink`   | EventSink    | `log` facade                     |
//! |              | RecordSink   | `log` facade (fallback store)    |
//! | `file_sink`  | RecordSink   | Append-only JSON-lines journal   |
//!
//! The bus [`BusPort`](crate::app::ports::BusPort) used in production is
//! the runtime's queue adapter; `line_bus` drains that queue.

pub mod file_sink;
pub mod line_bus;
pub mod log_sink;
