//! Storage backend benchmarks shaped like segment I/O.
//!
//! Frames here are an opaque entry-header-sized prefix plus payload, so the
//! numbers isolate the backend from entry encoding.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pbd_bench::utils::random_data;
use pbd_core::segment::entry::ENTRY_HEADER_SIZE;
use pbd_core::segment::header::{HeaderFlags, SegmentHeader, SEGMENT_HEADER_SIZE};
use pbd_storage::{FileBackend, InMemoryBackend, StorageBackend};
use tempfile::TempDir;

const SEGMENT_BYTES: usize = 256 * 1024;

fn frame(payload_len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; ENTRY_HEADER_SIZE];
    frame[..4].copy_from_slice(&(payload_len as i32).to_le_bytes());
    frame.extend_from_slice(&random_data(payload_len));
    frame
}

/// Writes a header, appends frames up to the segment size, then seals the
/// header in place.
fn fill_segment<B: StorageBackend>(backend: &mut B, frame: &[u8]) -> u32 {
    let mut header = SegmentHeader::new(&[], 0, 0);
    backend.append(&header.encode()).unwrap();
    let mut entries = 0u32;
    while backend.size().unwrap() as usize + frame.len() <= SEGMENT_BYTES {
        backend.append(frame).unwrap();
        entries += 1;
    }
    header.entry_count = entries;
    header.flags = header.flags.with(HeaderFlags::FINALIZED);
    backend.write_at(0, &header.encode()).unwrap();
    entries
}

fn bench_segment_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_fill");
    group.throughput(Throughput::Bytes(SEGMENT_BYTES as u64));
    group.sample_size(20);

    for size in [64usize, 1024, 8192] {
        let frame = frame(size);
        group.bench_with_input(BenchmarkId::new("memory", size), &frame, |b, frame| {
            b.iter(|| {
                let mut backend = InMemoryBackend::new();
                black_box(fill_segment(&mut backend, frame));
            });
        });
        group.bench_with_input(BenchmarkId::new("file", size), &frame, |b, frame| {
            let temp_dir = TempDir::new().unwrap();
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                let path = temp_dir.path().join(format!("bench_{n}.pbd"));
                let mut backend = FileBackend::create_new(&path).unwrap();
                black_box(fill_segment(&mut backend, frame));
            });
        });
    }

    group.finish();
}

/// Reads frames the way a cursor does: header first, then the payload.
fn bench_frame_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_walk");
    group.sample_size(30);

    for size in [64usize, 1024, 8192] {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("walk.pbd");
        let mut backend = FileBackend::create_new(&path).unwrap();
        let entries = fill_segment(&mut backend, &frame(size));
        backend.sync().unwrap();

        group.throughput(Throughput::Bytes(u64::from(entries) * size as u64));
        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| {
                let mut offset = SEGMENT_HEADER_SIZE as u64;
                for _ in 0..entries {
                    let header = backend.read_at(offset, ENTRY_HEADER_SIZE).unwrap();
                    let len = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
                    offset += ENTRY_HEADER_SIZE as u64;
                    let payload = backend.read_at(offset, len as usize).unwrap();
                    offset += len as u64;
                    black_box(payload);
                }
            });
        });
    }

    group.finish();
}

/// Cost of `sync_on_write`: one fsync per appended frame.
fn bench_synced_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("synced_append");
    group.sample_size(20);

    let frame = frame(256);
    group.bench_function("256", |b| {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("synced.pbd");
        let mut backend = FileBackend::create_new(&path).unwrap();
        backend.append(&SegmentHeader::new(&[], 0, 0).encode()).unwrap();

        b.iter(|| {
            backend.append(black_box(&frame)).unwrap();
            backend.sync().unwrap();
        });
    });

    group.finish();
}

/// Cutting a torn tail back to the last whole frame, as recovery does.
fn bench_tail_truncate(c: &mut Criterion) {
    let frame = frame(1024);
    c.bench_function("tail_truncate", |b| {
        let mut backend = InMemoryBackend::new();
        let entries = fill_segment(&mut backend, &frame);
        let whole = SEGMENT_HEADER_SIZE as u64 + u64::from(entries) * frame.len() as u64;

        b.iter(|| {
            backend.append(&frame[..frame.len() / 2]).unwrap();
            backend.truncate(black_box(whole)).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_segment_fill,
    bench_frame_walk,
    bench_synced_append,
    bench_tail_truncate,
);

criterion_main!(benches);
