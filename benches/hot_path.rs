//! Criterion benchmarks for the per-record hot path.
//!
//! Online processing has to keep up with the detector's event rate, so the pieces run
//! for every event are measured on their own and together:
//! - clock reconstruction
//! - burst buffer admission and ageing
//! - the full `Processor::process` call, with output discarded
//!
//! Run with: cargo bench --bench hot_path

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zdab_l2::clock::{ClockConfig, ClockModel};
use zdab_l2::config::{FilterConfig, RunSettings};
use zdab_l2::error::AppResult;
use zdab_l2::notify::{LogOnlySink, RateLimitedNotifier};
use zdab_l2::pipeline::Processor;
use zdab_l2::ring_buffer::BurstBuffer;
use zdab_l2::zdab::{BankIndex, BankSink, Record, SinkFactory, TriggerCard};

const CONFIG: &str = "\
nhithi 30
nhitlo 20
lothresh 1000
lowindow 50000
nhitretrig 5
retrigwindow 23
nhitburst 100
burstwindow 1
burstsize 30
endrate 10
bitmask 0x4000
";

/// Stream that counts bytes and throws them away.
struct DiscardSink {
    path: PathBuf,
    bytes: usize,
}

impl BankSink for DiscardSink {
    fn write_bank(&mut self, payload: &[u8], _index: BankIndex) -> AppResult<()> {
        self.bytes += black_box(payload.len());
        Ok(())
    }

    fn close(self) -> AppResult<PathBuf> {
        Ok(self.path)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Clone, Copy)]
struct DiscardFactory;

impl SinkFactory for DiscardFactory {
    type Sink = DiscardSink;

    fn create(&self, path: &Path) -> AppResult<DiscardSink> {
        Ok(DiscardSink {
            path: path.to_path_buf(),
            bytes: 0,
        })
    }
}

fn clock_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("clock");
    group.throughput(Throughput::Elements(1));
    group.bench_function("update", |b| {
        let mut clock = ClockModel::new(ClockConfig {
            max_jump: 500_000_000,
            max_drift: 5_000,
            retrig_window: 23,
        });
        let mut c50 = 1_000u64;
        b.iter(|| {
            c50 += 5_000;
            black_box(clock.update(black_box(c50), c50 / 5));
        });
    });
    group.finish();
}

fn burst_buffer_admit(c: &mut Criterion) {
    let mut group = c.benchmark_group("burst_buffer");
    let payload = Bytes::from(vec![0u8; 512]);

    for capacity in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("admit_expire", capacity), &capacity, |b, &capacity| {
            let mut buffer = BurstBuffer::new(capacity);
            let mut t = 0u64;
            b.iter(|| {
                t += 1_000;
                black_box(buffer.admit(payload.clone(), t));
                black_box(buffer.expire(t, 50_000_000));
            });
        });
    }
    group.finish();
}

fn processor_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("processor");
    let dir = tempfile::tempdir().unwrap();
    let mut settings = RunSettings::default();
    settings.archive.run_log = dir.path().join("bench.run.log");

    // Mostly quiet data with a candidate every tenth event.
    let events: Vec<Record> = (1..=10_000u64)
        .map(|i| {
            let t = i * 20_000;
            let nhit = if i % 10 == 0 { 150 } else { 25 + (i % 20) as u32 };
            Record::event(nhit, TriggerCard::from_parts(t, t / 5, 0), &[0u32; 40])
        })
        .collect();

    group.throughput(Throughput::Elements(events.len() as u64));
    group.bench_function("process_10k_events", |b| {
        b.iter(|| {
            let filter = FilterConfig::parse(CONFIG).unwrap();
            let notifier = Arc::new(RateLimitedNotifier::new(LogOnlySink, 10));
            let mut processor = Processor::new(DiscardFactory, dir.path().join("bench"), filter, &settings, notifier);
            for event in &events {
                black_box(processor.process(event).unwrap());
            }
        });
    });
    group.finish();
}

criterion_group!(benches, clock_update, burst_buffer_admit, processor_throughput);
criterion_main!(benches);
