//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths in the daemon:
//! - Signaling fragmentation and fragment header encoding
//! - Out-of-order reassembly
//! - Frame serialization, whole and chunked

use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protocol::{
    encode_signal, FrameUnit, Fragmenter, Inbound, MessageId, Reassembler, SignalKind,
};

/// Typical session description sizes: short, ICE-heavy, very large.
const PAYLOAD_SIZES: [usize; 3] = [1024, 8 * 1024, 64 * 1024];

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Benchmark splitting a signaling message into encoded datagrams.
fn bench_fragmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragmentation");
    let fragmenter = Fragmenter::default();
    let id = MessageId::new("4242");

    for size in PAYLOAD_SIZES {
        let message = encode_signal(SignalKind::Offer, &payload(size));
        group.throughput(Throughput::Bytes(message.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| {
                let datagrams: Vec<Vec<u8>> = fragmenter
                    .split(&id, black_box(message))
                    .iter()
                    .map(|f| f.encode())
                    .collect();
                datagrams
            });
        });
    }

    group.finish();
}

/// Benchmark classifying and reassembling datagrams delivered in reverse.
fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    let fragmenter = Fragmenter::default();
    let id = MessageId::new("4242");

    for size in PAYLOAD_SIZES {
        let message = encode_signal(SignalKind::Answer, &payload(size));
        let mut datagrams: Vec<Vec<u8>> = fragmenter
            .split(&id, &message)
            .iter()
            .map(|f| f.encode())
            .collect();
        datagrams.reverse();

        group.throughput(Throughput::Bytes(message.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(size),
            &datagrams,
            |b, datagrams| {
                b.iter(|| {
                    let mut reassembler = Reassembler::default();
                    let now = Instant::now();
                    let mut restored = None;
                    for datagram in datagrams {
                        if let Ok(Inbound::Fragment(fragment)) =
                            Inbound::classify(black_box(datagram))
                        {
                            if let Ok(Some(message)) = reassembler.add(fragment, now) {
                                restored = Some(message);
                            }
                        }
                    }
                    restored
                });
            },
        );
    }

    group.finish();
}

/// Benchmark serializing one captured frame for stream clients.
fn bench_frame_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_serialization");

    // Roughly a compressed 1080p JPEG
    let frame = FrameUnit::new(payload(200 * 1024), 960, 540);
    group.throughput(Throughput::Bytes(200 * 1024));

    group.bench_function("whole", |b| {
        b.iter(|| black_box(&frame).to_message());
    });

    group.bench_function("chunked_16KB", |b| {
        b.iter(|| black_box(&frame).to_chunked_messages(1, 16 * 1024));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fragmentation,
    bench_reassembly,
    bench_frame_serialization,
);
criterion_main!(benches);
