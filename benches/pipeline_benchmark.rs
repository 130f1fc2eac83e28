use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::path::Path;
use tailship::logs::{content_hash, BatchBuffer, Deduplicator, LineParser, LogRecord, SourceIdentity};

const LINE: &str = "2024-01-01 10:00:00 ERROR connection to db-01 refused after 3 retries";

fn source() -> SourceIdentity {
    SourceIdentity::Machine {
        machine_id: "bench".to_string(),
        hostname: "bench-host".to_string(),
    }
}

fn record(offset: u64) -> LogRecord {
    LogRecord::from_parsed(
        LineParser::new().parse(LINE),
        Path::new("/var/log/app.log"),
        offset,
        source(),
    )
}

/// Benchmark line parsing
fn bench_line_parsing(c: &mut Criterion) {
    let parser = LineParser::new();

    c.bench_function("parse_structured_line", |b| {
        b.iter(|| black_box(parser.parse(black_box(LINE))));
    });

    c.bench_function("parse_unstructured_line", |b| {
        b.iter(|| black_box(parser.parse(black_box("plain text without a timestamp"))));
    });
}

/// Benchmark content hashing and the dedup window
fn bench_dedup(c: &mut Criterion) {
    let path = Path::new("/var/log/app.log");

    c.bench_function("content_hash", |b| {
        b.iter(|| black_box(content_hash(path, black_box(4096), LINE)));
    });

    c.bench_function("dedup_admit_unique", |b| {
        let dedup = Deduplicator::new(10_000);
        let mut offset = 0u64;
        b.iter(|| {
            offset += 1;
            black_box(dedup.admit(path, offset, record(offset)));
        });
    });
}

/// Benchmark buffer append and drain
fn bench_buffer(c: &mut Criterion) {
    c.bench_function("buffer_append_drain_100", |b| {
        let buffer = BatchBuffer::new(100);
        let records: Vec<LogRecord> = (0..100).map(record).collect();
        b.iter(|| {
            for r in &records {
                black_box(buffer.append(r.clone()));
            }
            black_box(buffer.drain());
        });
    });
}

criterion_group!(benches, bench_line_parsing, bench_dedup, bench_buffer);
criterion_main!(benches);
