//! Application core: domain orchestration, zero I/O.
//!
//! The fill-cycle state machine, its timing supervisor and the event router
//! are composed by [`service::ControllerService`].  All interaction with the
//! bus and the persistence store happens through the **port traits** in
//! [`ports`], keeping this layer testable without a broker or database.

pub mod events;
pub mod ports;
pub mod service;
