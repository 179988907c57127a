//! Performance benchmarks for frame processing.
//!
//! These benchmarks measure the hot paths of a bridge:
//! - Output chunk to text frame (UTF-8 decoding plus encoding)
//! - Input frame decoding
//! - Replay buffer appends
//! - Output routing to a sink

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use daemon::session::{OutputRouter, PtyEvent, ReplayBuffer};
use protocol::{Frame, FrameCodec, Utf8StreamDecoder};

/// Typical terminal output: colored text with some multi-byte characters.
fn sample_output(len: usize) -> Vec<u8> {
    let line = "\u{1b}[32muser@host\u{1b}[0m:~/src ✓ ls -la │ drwxr-xr-x 2 user user 4096 \r\n";
    line.as_bytes().iter().copied().cycle().take(len).collect()
}

/// Benchmark turning pty output into encoded frames.
fn bench_output_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_frames");
    let codec = FrameCodec::new();

    for (name, size) in [("small_64B", 64), ("medium_4KB", 4096), ("large_64KB", 65536)] {
        let chunk = sample_output(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            let mut decoder = Utf8StreamDecoder::new();
            b.iter(|| {
                let text = decoder.decode(black_box(&chunk));
                codec.encode(&Frame::output(text)).unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark decoding client frames.
fn bench_input_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("input_decoding");
    let codec = FrameCodec::new();

    // Single keystroke
    let keystroke = codec.encode(&Frame::input("a")).unwrap();
    group.bench_function("keystroke", |b| {
        b.iter(|| codec.decode(black_box(&keystroke)).unwrap());
    });

    // Pasted block
    let paste = codec
        .encode(&Frame::input("echo 'pasted line'\n".repeat(200)))
        .unwrap();
    group.throughput(Throughput::Bytes(paste.len() as u64));
    group.bench_function("paste_4KB", |b| {
        b.iter(|| codec.decode(black_box(&paste)).unwrap());
    });

    // Unknown kind falls back to the kind-only parse
    let unknown = r#"{"kind":"ping","nonce":1}"#;
    group.bench_function("unknown_kind", |b| {
        b.iter(|| codec.decode(black_box(unknown)).unwrap());
    });

    group.finish();
}

/// Benchmark the replay ring.
fn bench_replay_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_buffer");
    let chunk = sample_output(4096);
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    group.bench_function("push_4KB_into_64KB", |b| {
        let mut replay = ReplayBuffer::new(64 * 1024);
        b.iter(|| replay.push(black_box(&chunk)));
    });

    group.bench_function("snapshot_64KB", |b| {
        let mut replay = ReplayBuffer::new(64 * 1024);
        for _ in 0..16 {
            replay.push(&chunk);
        }
        b.iter(|| black_box(replay.snapshot()));
    });

    group.finish();
}

/// Benchmark routing output through a registered sink.
fn bench_output_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_routing");
    let chunk = sample_output(4096);
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    group.bench_function("push_and_receive_4KB", |b| {
        let router = OutputRouter::new(64 * 1024);
        let (tx, mut rx) = tokio::sync::mpsc::channel::<PtyEvent>(256);
        router.register(tx);

        b.iter(|| {
            router.push_output(black_box(chunk.clone()));
            black_box(rx.try_recv().unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_output_frames,
    bench_input_decoding,
    bench_replay_buffer,
    bench_output_routing,
);

criterion_main!(benches);
