//! Fuzz target for the relay handshake request parser

#![no_main]

use libfuzzer_sys::fuzz_target;
use pierce_relay::handshake::parse_request;

fuzz_target!(|data: &[u8]| {
    let _ = parse_request(data);
});
