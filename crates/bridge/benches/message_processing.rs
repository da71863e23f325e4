//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths in the bridge:
//! - Event frame encoding for terminal output
//! - Command frame decoding
//! - Build output classification

use bridge::build::output::{strip_ansi, OutputClassifier};
use bridge::config::BuildConfig;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::messages::{PtyData, PtyWrite};
use protocol::{ClientFrame, Command, Event, ServerFrame, SessionId};

/// Benchmark encoding of terminal output events.
fn bench_event_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_encoding");
    let session_id = SessionId::from("bench-session");

    for (name, size) in [("small_1B", 1usize), ("medium_4KB", 4096), ("large_64KB", 65536)] {
        let frame = ServerFrame::Event {
            event: Event::PtyData(PtyData {
                session_id: session_id.clone(),
                data: Bytes::from(vec![b'x'; size]),
            }),
        };
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| black_box(&frame).to_json_line().unwrap());
        });
    }

    group.finish();
}

/// Benchmark decoding of keystroke commands.
fn bench_command_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_decoding");

    let keystroke = ClientFrame::new(
        42,
        Command::PtyWrite(PtyWrite {
            session_id: SessionId::from("bench-session"),
            data: Bytes::from_static(b"l"),
        }),
    )
    .to_json_line()
    .unwrap();
    group.bench_function("keystroke", |b| {
        b.iter(|| ClientFrame::from_json_line(black_box(&keystroke)).unwrap());
    });

    let ping = ClientFrame::new(1, Command::Ping).to_json_line().unwrap();
    group.bench_function("ping", |b| {
        b.iter(|| ClientFrame::from_json_line(black_box(&ping)).unwrap());
    });

    group.finish();
}

/// Benchmark build output classification.
fn bench_output_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_classification");
    let classifier = OutputClassifier::from_config(&BuildConfig::default());

    let lines = [
        ("serving", "[sphinx-autobuild] Serving on http://127.0.0.1:8000"),
        ("rebuilt", "build succeeded, 2 warnings."),
        ("error", "/docs/index.rst:12: ERROR: Unknown directive type \"foo\"."),
        ("other", "reading sources... [ 50%] api/index"),
        (
            "colored",
            "\x1b[32m[sphinx-autobuild]\x1b[0m \x1b[1mServing on\x1b[0m http://127.0.0.1:8000",
        ),
    ];
    for (name, line) in lines {
        group.bench_function(name, |b| {
            b.iter(|| classifier.classify(black_box(line)));
        });
    }

    let noisy = "\x1b[01;32mwriting output...\x1b[39;49;00m [100%] index\r".repeat(16);
    group.throughput(Throughput::Bytes(noisy.len() as u64));
    group.bench_function("strip_ansi_1KB", |b| {
        b.iter(|| strip_ansi(black_box(&noisy)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_event_encoding,
    bench_command_decoding,
    bench_output_classification,
);
criterion_main!(benches);
