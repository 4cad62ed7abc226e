//! Fuzz target for signaling envelope parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use pierce_signal::SignalEnvelope;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(envelope) = SignalEnvelope::from_json(text) {
        let _ = envelope.kind();
        let _ = envelope.to_json();
    }
});
