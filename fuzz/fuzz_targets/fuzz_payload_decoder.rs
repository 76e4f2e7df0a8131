//! Fuzz target: `router::codec::decode`
//!
//! Feeds arbitrary bytes to every inbound payload decoder and asserts that
//! decoding never panics and never yields a non-finite reading.
//!
//! cargo fuzz run fuzz_payload_decoder

#![no_main]

use fillctl::fsm::context::Event;
use fillctl::router::codec::{InboundKind, decode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for kind in [
        InboundKind::CanDetected,
        InboundKind::Position,
        InboundKind::Level,
        InboundKind::Quality,
    ] {
        match decode(kind, data) {
            Ok(Event::PositionReport { position_mm, .. }) => assert!(position_mm.is_finite()),
            Ok(Event::LevelReport { level_ml, .. }) => assert!(level_ml.is_finite()),
            _ => {}
        }
    }
});
