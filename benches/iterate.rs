use criterion::*;
use std::hint::black_box;

use apparatus::{ApparatusResult, Filter};

mod common;
use common::*;

fn iterate_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate");
    group.sample_size(10);

    group.bench_function("liquid_write_wealth_1M", |b| {
        b.iter_batched(
            || setup_mechanism(SUBJECTS_MED).unwrap(),
            |mechanism| {
                let chain = mechanism.enchain(Filter::of::<(Wealth,)>()).unwrap();
                chain
                    .operate(|row| -> ApparatusResult<()> {
                        row.get_mut::<Wealth>()?.value *= 1.0001;
                        Ok(())
                    })
                    .unwrap();
                drop(chain);
                black_box(mechanism);
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("solid_read_productivity_1M", |b| {
        b.iter_batched(
            || setup_mechanism(SUBJECTS_MED).unwrap(),
            |mechanism| {
                let chain = mechanism.enchain_solid(Filter::of::<(Productivity,)>()).unwrap();
                let mut total = 0.0f32;
                chain
                    .operate(|row| -> ApparatusResult<()> {
                        total += row.get::<Productivity>()?.rate;
                        Ok(())
                    })
                    .unwrap();
                black_box(total);
                drop(chain);
                black_box(mechanism);
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("handles_1M", |b| {
        b.iter_batched(
            || setup_mechanism(SUBJECTS_MED).unwrap(),
            |mechanism| {
                let chain = mechanism.enchain_solid(Filter::of::<(Position,)>()).unwrap();
                black_box(chain.iter().count());
                drop(chain);
                black_box(mechanism);
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, iterate_benchmark);
criterion_main!(benches);
