//! Fill-cycle controller library.
//!
//! Exposes the state machine, timing supervisor, router and runtime for
//! the binary and for integration testing.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod fsm;
pub mod router;
pub mod runtime;
pub mod timing;
