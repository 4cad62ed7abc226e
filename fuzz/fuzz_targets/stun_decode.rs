//! Fuzz target for STUN message decoding
//!
//! The decoder and the binding response parser must reject malformed
//! datagrams without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pierce_nat::stun::{StunMessage, parse_binding_response};

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = StunMessage::decode(data) {
        let _ = message.reflexive_address();
        let _ = message.change_request();
        // Anything we accept must survive a re-encode
        let _ = StunMessage::decode(&message.encode());
    }

    if data.len() >= 12 {
        let mut tid = [0u8; 12];
        tid.copy_from_slice(&data[..12]);
        let _ = parse_binding_response(&data[12..], &tid);
    }
});
