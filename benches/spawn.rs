use std::hint::black_box;

use apparatus::{Flagmark, SubjectRecord, Traitmark};
use criterion::*;

mod common;
use common::*;

fn spawn_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn");
    group.sample_size(10);

    group.bench_function("spawn_with_100k_subjects", |b| {
        b.iter_batched(
            || make_mechanism(4_096).unwrap(),
            |mechanism| {
                for _ in 0..SUBJECTS_SMALL {
                    mechanism
                        .spawn_with((Position { x: 0.0, y: 0.0 }, Wealth { value: 1.0 }))
                        .unwrap();
                }
                black_box(mechanism);
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("spawn_default_traitmark_100k", |b| {
        let traitmark = Traitmark::of::<(Position, Wealth, Productivity)>();
        b.iter_batched(
            || make_mechanism(4_096).unwrap(),
            |mechanism| {
                for _ in 0..SUBJECTS_SMALL {
                    mechanism.spawn_subject(&traitmark, Flagmark::BOOTED).unwrap();
                }
                black_box(mechanism);
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("spawn_deferred_records_100k", |b| {
        let record = SubjectRecord::of((Position { x: 1.0, y: 2.0 }, Wealth { value: 3.0 })).unwrap();
        b.iter_batched(
            || make_mechanism(4_096).unwrap(),
            |mechanism| {
                let applicator = mechanism.create_deferreds_applicator(apparatus::DeferredKinds::SPAWN);
                for _ in 0..SUBJECTS_SMALL {
                    mechanism.spawn_subject_deferred(record.clone()).unwrap();
                }
                applicator.apply().unwrap();
                drop(applicator);
                black_box(mechanism);
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("despawn_all_100k", |b| {
        b.iter_batched(
            || setup_mechanism(SUBJECTS_SMALL).unwrap(),
            |mechanism| {
                mechanism.despawn_all().unwrap();
                black_box(mechanism);
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, spawn_benchmark);
criterion_main!(benches);
