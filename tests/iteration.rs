use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apparatus::engine::reduce::{Count, MinMax, Sum, Welford};
use apparatus::{
    ApparatusError, ApparatusResult, Filter, Flagmark, Mechanism, MechanismConfig, Status, SubjectHandle,
};

#[derive(Clone, Copy, Default, Debug, PartialEq)]
struct Wealth(pub f64);

#[derive(Clone, Copy, Default, Debug, PartialEq)]
struct Age(pub u32);

#[derive(Clone, Copy, Default, Debug, PartialEq)]
struct Tagged;

fn population(n: usize) -> ApparatusResult<(Arc<Mechanism>, Vec<SubjectHandle>)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mechanism = Mechanism::with_config(MechanismConfig {
        min_rows_per_thread: 64,
        ..MechanismConfig::default()
    })?;
    let handles = (0..n)
        .map(|i| mechanism.spawn_with((Wealth(i as f64), Age(i as u32 % 90))))
        .collect::<ApparatusResult<Vec<_>>>()?;
    Ok((mechanism, handles))
}

#[test]
fn liquid_chains_skip_rows_added_or_removed_mid_walk() -> ApparatusResult<()> {
    let (mechanism, handles) = population(6)?;
    let chain = mechanism.enchain(Filter::of::<(Wealth,)>())?;
    assert!(mechanism.is_liquid());

    let mut visited = Vec::new();
    chain.operate(|row| -> ApparatusResult<()> {
        visited.push(row.handle());
        if row.handle() == handles[1] {
            mechanism.despawn(handles[4])?;
            mechanism.spawn_with((Wealth(100.0), Age(1)))?;
        }
        row.get_mut::<Wealth>()?.0 += 0.5;
        Ok(())
    })?;
    assert_eq!(visited, vec![handles[0], handles[1], handles[2], handles[3], handles[5]]);
    assert_eq!(mechanism.chunk_population(handles[0])?, 6);
    drop(chain);

    assert!(!mechanism.is_locked());
    assert!(!mechanism.is_valid(handles[4]));
    assert_eq!(mechanism.get_trait::<Wealth>(handles[5])?, Wealth(5.5));
    assert_eq!(mechanism.count(&Filter::of::<(Wealth,)>())?, 6);
    Ok(())
}

#[test]
fn liquid_rows_can_migrate_themselves() -> ApparatusResult<()> {
    let (mechanism, handles) = population(4)?;
    let chain = mechanism.enchain(Filter::of::<(Wealth,)>().exclude::<Tagged>())?;
    let status = chain.operate(|row| {
        if row.get::<Age>().map_or(false, |age| age.0 % 2 == 1) {
            row.set(Tagged)
        } else {
            Ok(Status::Noop)
        }
    })?;
    assert_eq!(status, Status::Success);
    drop(chain);

    assert_eq!(mechanism.count(&Filter::of::<(Tagged,)>())?, 2);
    assert_eq!(mechanism.get_trait::<Wealth>(handles[3])?, Wealth(3.0));
    assert!(mechanism.has_trait::<Tagged>(handles[1])?);
    Ok(())
}

#[test]
fn chains_conflict_with_the_opposite_lock() -> ApparatusResult<()> {
    let (mechanism, _) = population(2)?;
    let liquid = mechanism.enchain(Filter::new())?;
    assert!(matches!(mechanism.enchain_solid(Filter::new()), Err(ApparatusError::Conflict(_))));
    let nested = mechanism.enchain(Filter::of::<(Age,)>())?;
    drop(liquid);
    assert!(mechanism.is_liquid());
    drop(nested);

    let mut solid = mechanism.enchain_solid(Filter::new())?;
    let _second = mechanism.enchain_solid(Filter::of::<(Wealth,)>())?;
    assert!(matches!(mechanism.enchain(Filter::new()), Err(ApparatusError::Conflict(_))));
    assert!(matches!(mechanism.reset(), Err(ApparatusError::InvalidState(_))));
    assert_eq!(solid.enchain(Filter::of::<(Age,)>())?, Status::Success);
    assert_eq!(solid.iterable_count(), 2);
    Ok(())
}

#[test]
fn concurrent_operation_visits_every_row_once() -> ApparatusResult<()> {
    let (mechanism, handles) = population(5_000)?;
    let chain = mechanism.enchain_solid(Filter::of::<(Wealth,)>())?;

    let visits = AtomicUsize::new(0);
    let total = AtomicU64::new(0);
    let status = chain.operate_concurrently(
        |row| -> ApparatusResult<()> {
            visits.fetch_add(1, Ordering::Relaxed);
            total.fetch_add(row.get::<Wealth>()?.0 as u64, Ordering::Relaxed);
            row.set_flag(Flagmark::A, true)?;
            Ok(())
        },
        4,
        64,
    )?;
    assert_eq!(status, Status::Success);
    assert_eq!(visits.load(Ordering::Relaxed), handles.len());
    assert_eq!(total.load(Ordering::Relaxed), (0..5_000u64).sum::<u64>());
    drop(chain);

    assert_eq!(mechanism.count(&Filter::new().include_flags(Flagmark::A))?, 5_000);
    Ok(())
}

#[test]
fn concurrent_failures_surface_after_every_range_finished() -> ApparatusResult<()> {
    let (mechanism, _) = population(1_000)?;
    let chain = mechanism.enchain_solid(Filter::new())?;
    let visits = AtomicUsize::new(0);
    let outcome = chain.operate_concurrently(
        |row| {
            visits.fetch_add(1, Ordering::Relaxed);
            if row.get::<Age>().map_or(true, |age| age.0 == 42) {
                Status::InvalidArgument
            } else {
                Status::Success
            }
        },
        8,
        16,
    );
    assert!(matches!(outcome, Err(ApparatusError::Reported { status: Status::InvalidArgument, .. })));
    assert!(visits.load(Ordering::Relaxed) < 1_000);
    Ok(())
}

#[test]
fn reductions_merge_partials_in_order() -> ApparatusResult<()> {
    let (mechanism, _) = population(10_000)?;
    let chain = mechanism.enchain_solid(Filter::of::<(Wealth, Age)>())?;

    let count = chain.reduce(Count::default, |acc, _| acc.bump(), Count::merge)?;
    assert_eq!(count, Count(10_000));

    let sum = chain.reduce(
        Sum::default,
        |acc, row| acc.add(row.get::<Wealth>().map_or(0.0, |w| w.0)),
        Sum::merge,
    )?;
    assert_eq!(sum.0, (0..10_000).map(|i| i as f64).sum::<f64>());

    let ages = chain.reduce(
        MinMax::default,
        |acc, row| acc.push(row.get::<Age>().map_or(0.0, |a| a.0 as f64)),
        MinMax::merge,
    )?;
    assert_eq!((ages.min, ages.max), (0.0, 89.0));

    let wealth = chain.reduce(
        Welford::default,
        |mut acc, row| {
            acc.push(row.get::<Wealth>().map_or(0.0, |w| w.0));
            acc
        },
        Welford::merge,
    )?;
    assert_eq!(wealth.n, 10_000);
    assert!((wealth.mean - 4_999.5).abs() < 1e-6);

    let empty = mechanism.enchain_solid(Filter::of::<(Tagged,)>())?;
    assert_eq!(empty.reduce(Count::default, |acc, _| acc.bump(), Count::merge)?, Count(0));
    Ok(())
}

#[test]
fn asynchronous_operation_holds_the_lock_until_joined() -> ApparatusResult<()> {
    let (mechanism, _) = population(2_000)?;
    let chain = Arc::new(mechanism.enchain_solid(Filter::of::<(Wealth,)>())?);

    let visits = Arc::new(AtomicUsize::new(0));
    let counter = visits.clone();
    let status = chain.operate_concurrently_async(
        move |row| {
            counter.fetch_add(1, Ordering::Relaxed);
            row.set_flag(Flagmark::B, true).map(|_| ())
        },
        4,
        100,
    )?;
    assert_eq!(status, Status::Deferred);

    assert!(mechanism.wait_for_operatings_completion(Some(Duration::from_secs(30))));
    assert_eq!(visits.load(Ordering::Relaxed), 2_000);
    assert!(!mechanism.is_locked());
    assert_eq!(mechanism.count(&Filter::new().include_flags(Flagmark::B))?, 2_000);

    let idle = Arc::new(mechanism.enchain_solid(Filter::of::<(Tagged,)>())?);
    assert_eq!(idle.operate_concurrently_async(|_| (), 0, 1)?, Status::NoItems);
    Ok(())
}

#[test]
fn adjectives_run_on_matching_spawns_only() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let before = mechanism.spawn_with((Wealth(1.0),))?;

    let runs = Arc::new(AtomicUsize::new(0));
    let seen = runs.clone();
    mechanism.add_adjective(Filter::of::<(Wealth,)>().include_flags(Flagmark::C), move |row| -> ApparatusResult<()> {
        seen.fetch_add(1, Ordering::Relaxed);
        row.get_mut::<Wealth>()?.0 = 1_000.0;
        row.set(Tagged)?;
        Ok(())
    })?;
    assert_eq!(mechanism.get_trait::<Wealth>(before)?, Wealth(1.0));

    let plain = mechanism.spawn_with((Wealth(2.0),))?;
    let flagged = mechanism.spawn_subject(&apparatus::Traitmark::of::<(Wealth, Age)>(), Flagmark::C)?;
    let unrelated = mechanism.spawn_subject(&apparatus::Traitmark::of::<(Age,)>(), Flagmark::C)?;

    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert_eq!(mechanism.get_trait::<Wealth>(plain)?, Wealth(2.0));
    assert_eq!(mechanism.get_trait::<Wealth>(flagged)?, Wealth(1_000.0));
    assert!(mechanism.has_trait::<Tagged>(flagged)?);
    assert!(!mechanism.has_trait::<Tagged>(unrelated)?);
    assert!(!mechanism.is_locked());
    Ok(())
}

#[test]
fn mechanics_run_over_their_filter() -> ApparatusResult<()> {
    let (mechanism, _) = population(300)?;
    let total = Arc::new(AtomicU64::new(0));
    let sink = total.clone();
    let id = mechanism.add_mechanic(Filter::of::<(Age,)>(), move |row| -> ApparatusResult<()> {
        sink.fetch_add(u64::from(row.get::<Age>()?.0), Ordering::Relaxed);
        Ok(())
    })?;

    mechanism.spawn_with((Age(1_000),))?;
    assert_eq!(mechanism.run_mechanic(id)?, Status::Success);
    let expected: u64 = (0..300u64).map(|i| i % 90).sum::<u64>() + 1_000;
    assert_eq!(total.load(Ordering::Relaxed), expected);
    assert!(matches!(mechanism.run_mechanic(id + 1), Err(ApparatusError::Missing(_))));
    Ok(())
}
