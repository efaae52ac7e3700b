//! # Overview Benchmarks
//!
//! Measures the two hot paths of a news server's overview store: appending
//! records as articles arrive, and range scans for XOVER-style requests.
//!
//! ## Benchmark Parameters
//!
//! - Append: 10,000 articles into one group
//! - Scan: full and windowed ranges over a 10,000 article group
//! - Lookup: point `get_art_info` across the group
//!
//! ## Running Benchmarks
//!
//! ```bash
//! cargo bench --bench overview
//! cargo bench --bench overview -- scan
//! ```

use std::path::Path;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use tempfile::tempdir;
use tradindexed::{OpenMode, Token, Tradindexed};

const GROUP: &str = "bench.overview";
const ARTICLES: u64 = 10_000;

fn token(n: u64) -> Token {
    let mut bytes = [0u8; 18];
    bytes[..8].copy_from_slice(&n.to_le_bytes());
    Token::new(bytes)
}

fn line(n: u64) -> Vec<u8> {
    format!(
        "{}\tSubject: benchmark article {}\tFrom: bench@example.com\t\
         Sat, 01 Jan 2022 00:00:00 GMT\t<{}@example.com>\t\t2048\t42\r\n",
        n, n, n
    )
    .into_bytes()
}

fn populated(path: &Path) -> Tradindexed {
    let overview = Tradindexed::builder()
        .path(path)
        .open(OpenMode::ReadWrite)
        .unwrap();
    overview.group_add(GROUP, 0, 0, b'y').unwrap();
    for n in 1..=ARTICLES {
        overview
            .add(GROUP, n, token(n), &line(n), n as i64, 0)
            .unwrap();
    }
    overview
}

fn bench_append(c: &mut Criterion) {
    let lines: Vec<Vec<u8>> = (1..=ARTICLES).map(line).collect();
    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(ARTICLES));
    group.sample_size(10);

    group.bench_function("sequential", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let overview = Tradindexed::builder()
                    .path(dir.path())
                    .open(OpenMode::ReadWrite)
                    .unwrap();
                overview.group_add(GROUP, 0, 0, b'y').unwrap();
                (dir, overview)
            },
            |(_dir, overview)| {
                for (i, bytes) in lines.iter().enumerate() {
                    let n = i as u64 + 1;
                    overview
                        .add(GROUP, n, token(n), bytes, n as i64, 0)
                        .unwrap();
                }
            },
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    drop(populated(dir.path()));
    let reader = Tradindexed::builder()
        .path(dir.path())
        .open(OpenMode::Read)
        .unwrap();

    let mut group = c.benchmark_group("scan");
    for window in [100u64, 1_000, ARTICLES] {
        group.throughput(Throughput::Elements(window));
        group.bench_with_input(BenchmarkId::from_parameter(window), &window, |b, &window| {
            b.iter(|| {
                let low = ARTICLES - window + 1;
                let search = reader.open_search(GROUP, low, ARTICLES).unwrap().unwrap();
                let bytes: usize = search.map(|a| a.overview.len()).sum();
                black_box(bytes)
            });
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let overview = populated(dir.path());

    c.bench_function("get_art_info", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n = n % ARTICLES + 1;
            black_box(overview.get_art_info(GROUP, n).unwrap())
        });
    });
}

criterion_group!(benches, bench_append, bench_scan, bench_lookup);
criterion_main!(benches);
