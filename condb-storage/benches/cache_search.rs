use chrono::Duration;
use condb_core::{
    parse_datetime, DetectorMask, SimFlagAssociation, SimMask, ValidityRange, ValidityRecord,
    DATABASE_SOURCE,
};
use condb_storage::{QueryResult, ResultCache, ResultHandle, SimpleResult};
use condb_test_utils::fixtures::data_context;
use condb_test_utils::GainRow;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

/// A cache holding `n` consecutive one-day results, all released.
fn bench_cache(n: i64) -> ResultCache<GainRow> {
    let mut cache = ResultCache::new("CALIB");
    let base = parse_datetime("2020-01-01 00:00:00").expect("base date");
    for day in 0..n {
        let start = base + Duration::days(day);
        let range = ValidityRange::new(
            DetectorMask::MCAPTAIN,
            SimMask::DATA,
            start,
            start + Duration::days(1),
            DATABASE_SOURCE,
        );
        let vrec = ValidityRecord::new(day as u32 + 1, -1, range, 0, start, start, 0, 0);
        let rows = (0..16)
            .map(|channel| GainRow { channel, gain: 1.0 })
            .collect();
        let result = QueryResult::Simple(SimpleResult::from_rows("CALIB", rows, vrec, "", true));
        drop(cache.adopt(result, false));
    }
    cache
}

fn bench_search(c: &mut Criterion) {
    let cache = bench_cache(365);
    let associations = SimFlagAssociation::new();
    let hit = data_context("2020-12-15 12:00:00");
    let miss = data_context("2022-01-01 00:00:00");

    c.bench_function("cache/search_hit", |b| {
        b.iter(|| {
            let found: Option<ResultHandle<GainRow>> = cache.search(black_box(&hit), 0, &associations);
            black_box(found.map(|r| r.num_rows()));
        });
    });

    c.bench_function("cache/search_miss", |b| {
        b.iter(|| black_box(cache.search(black_box(&miss), 0, &associations).is_none()));
    });
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
