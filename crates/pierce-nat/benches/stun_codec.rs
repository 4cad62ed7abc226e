//! STUN codec benchmarks
//!
//! Run with: `cargo bench -p pierce-nat --bench stun_codec`

use criterion::{Criterion, criterion_group, criterion_main};
use pierce_nat::stun::{StunAttribute, StunMessage, parse_binding_response};
use std::hint::black_box;
use std::net::SocketAddr;

fn bench_encode_request(c: &mut Criterion) {
    let request = StunMessage::binding_request();
    c.bench_function("stun_encode_binding_request", |b| {
        b.iter(|| black_box(request.encode()));
    });
}

fn bench_decode_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("stun_decode_response");

    let tid = [0x5Au8; 12];
    let v4: SocketAddr = "203.0.113.5:54321".parse().unwrap();
    let v6: SocketAddr = "[2001:db8::5]:54321".parse().unwrap();

    for (name, addr) in [("ipv4", v4), ("ipv6", v6)] {
        let mut response = StunMessage::binding_response(tid, addr);
        response.add_attribute(StunAttribute::Software("bench".into()));
        let bytes = response.encode();
        group.bench_function(name, |b| {
            b.iter(|| parse_binding_response(black_box(&bytes), &tid).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode_request, bench_decode_response);
criterion_main!(benches);
