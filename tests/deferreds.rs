use apparatus::{
    ApparatusError, ApparatusResult, DeferredKinds, Filter, Flagmark, Mechanism, MechanismConfig,
    MissingTargetPolicy, Status, SubjectHandle, SubjectRecord,
};

#[derive(Clone, Copy, Default, Debug, PartialEq)]
struct Cash(pub f32);

#[derive(Clone, Copy, Default, Debug, PartialEq)]
struct Debt(pub f32);

#[derive(Clone, Copy, Default, Debug, PartialEq)]
struct Marker(pub u8);

#[derive(Clone, Copy, Debug)]
enum Step {
    SetCash(f32),
    SetDebt(f32),
    ObtainCash,
    ObtainDebt,
    RemoveCash,
    RemoveDebt,
    RemoveAll,
}

fn run(mechanism: &Mechanism, subject: SubjectHandle, step: Step) -> ApparatusResult<Status> {
    match step {
        Step::SetCash(v) => mechanism.set_trait(subject, Cash(v)),
        Step::SetDebt(v) => mechanism.set_trait(subject, Debt(v)),
        Step::ObtainCash => mechanism.obtain_trait::<Cash>(subject),
        Step::ObtainDebt => mechanism.obtain_trait::<Debt>(subject),
        Step::RemoveCash => mechanism.remove_trait::<Cash>(subject),
        Step::RemoveDebt => mechanism.remove_trait::<Debt>(subject),
        Step::RemoveAll => mechanism.remove_all_traits(subject),
    }
}

type Observed = (Option<Cash>, Option<Debt>);

fn observe(mechanism: &Mechanism, subject: SubjectHandle) -> ApparatusResult<Observed> {
    let cash = mechanism.has_trait::<Cash>(subject)?.then(|| mechanism.get_trait::<Cash>(subject)).transpose()?;
    let debt = mechanism.has_trait::<Debt>(subject)?.then(|| mechanism.get_trait::<Debt>(subject)).transpose()?;
    Ok((cash, debt))
}

/// Runs `steps` once directly and once under a solid lock.
fn both_ways(steps: &[Step]) -> ApparatusResult<(Observed, Observed)> {
    let direct = Mechanism::new()?;
    let subject = direct.spawn_with((Cash(1.0),))?;
    for &step in steps {
        run(&direct, subject, step)?;
    }

    let deferred = Mechanism::new()?;
    let queued = deferred.spawn_with((Cash(1.0),))?;
    {
        let _chain = deferred.enchain_solid(Filter::new())?;
        for &step in steps {
            assert_eq!(run(&deferred, queued, step)?, Status::Deferred, "{step:?} was not queued");
        }
        assert_eq!(observe(&deferred, queued)?, (Some(Cash(1.0)), None));
    }
    assert_eq!(deferred.pending_deferreds(), 0);
    Ok((observe(&direct, subject)?, observe(&deferred, queued)?))
}

#[test]
fn structural_changes_under_a_solid_lock_are_queued_in_order() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let subject = mechanism.spawn_with((Cash(1.0),))?;

    {
        let _chain = mechanism.enchain_solid(Filter::of::<(Cash,)>())?;
        assert_eq!(mechanism.set_trait(subject, Cash(2.0))?, Status::Deferred);
        assert_eq!(mechanism.obtain_trait::<Debt>(subject)?, Status::Deferred);
        assert_eq!(mechanism.set_trait(subject, Debt(5.0))?, Status::Deferred);
        assert_eq!(mechanism.remove_trait::<Cash>(subject)?, Status::Deferred);
        assert_eq!(mechanism.pending_deferreds(), 4);

        assert_eq!(mechanism.get_trait::<Cash>(subject)?, Cash(1.0));
        assert!(!mechanism.has_trait::<Debt>(subject)?);
    }

    assert_eq!(mechanism.pending_deferreds(), 0);
    assert!(!mechanism.has_trait::<Cash>(subject)?);
    assert_eq!(mechanism.get_trait::<Debt>(subject)?, Debt(5.0));
    Ok(())
}

#[test]
fn spawns_under_a_solid_lock_are_placed_at_the_drain() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let first = mechanism.spawn_with((Cash(1.0),))?;
    let second = mechanism.spawn_with((Debt(2.0),))?;

    let (typed, recorded) = {
        let _chain = mechanism.enchain_solid(Filter::new())?;
        let typed = mechanism.spawn_with((Cash(3.0), Debt(1.0)))?;
        assert_ne!(typed, first);
        assert!(!mechanism.is_valid(typed));
        assert!(matches!(mechanism.get_trait::<Cash>(typed), Err(ApparatusError::StaleSubject(_))));

        let swapped = mechanism.swap_traits(first, second, true);
        assert!(matches!(swapped, Err(ApparatusError::InvalidState(_))));

        let record = SubjectRecord::of((Cash(3.0), Marker(7)))?;
        assert_eq!(mechanism.spawn_subject_deferred(record)?, Status::Deferred);
        let recorded = mechanism.spawn_subject_record(&SubjectRecord::of((Marker(9),))?)?;
        assert_eq!(mechanism.subjects_count(), 2);
        assert_eq!(mechanism.pending_deferreds(), 3);
        (typed, recorded)
    };

    assert_eq!(mechanism.subjects_count(), 5);
    assert_eq!(mechanism.get_trait::<Cash>(typed)?, Cash(3.0));
    assert_eq!(mechanism.get_trait::<Debt>(typed)?, Debt(1.0));
    assert_eq!(mechanism.get_trait::<Marker>(recorded)?, Marker(9));
    assert_eq!(mechanism.count(&Filter::of::<(Cash, Marker)>())?, 1);
    Ok(())
}

#[test]
fn reset_drops_queued_spawns_for_good() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let pending = {
        let chain = mechanism.enchain_solid(Filter::new())?;
        let pending = mechanism.spawn_with((Cash(1.0),))?;
        let applicator = mechanism.create_deferreds_applicator(DeferredKinds::ALL);
        drop(chain);
        assert_eq!(mechanism.pending_deferreds(), 1);
        assert_eq!(mechanism.reset()?, Status::Success);
        drop(applicator);
        pending
    };

    let fresh = mechanism.spawn_with((Cash(2.0),))?;
    assert_eq!(fresh.slot(), pending.slot());
    assert!(!mechanism.is_valid(pending));
    assert!(mechanism.is_valid(fresh));
    Ok(())
}

#[test]
fn queued_removal_and_addition_of_one_trait_keep_their_order() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let subject = mechanism.spawn_with((Cash(1.0),))?;
    {
        let _chain = mechanism.enchain_solid(Filter::new())?;
        assert_eq!(mechanism.remove_trait::<Cash>(subject)?, Status::Deferred);
        assert_eq!(mechanism.obtain_trait::<Cash>(subject)?, Status::Deferred);
        assert_eq!(mechanism.obtain_trait::<Debt>(subject)?, Status::Deferred);
        assert_eq!(mechanism.remove_trait::<Debt>(subject)?, Status::Deferred);
    }
    assert_eq!(observe(&mechanism, subject)?, (Some(Cash::default()), None));
    Ok(())
}

#[test]
fn queued_sequences_match_direct_application() -> ApparatusResult<()> {
    use Step::*;
    let sequences: &[&[Step]] = &[
        &[RemoveCash, ObtainCash],
        &[ObtainDebt, RemoveDebt],
        &[RemoveCash, SetCash(4.0), RemoveCash, ObtainCash],
        &[ObtainCash, SetCash(2.5), ObtainCash],
        &[RemoveAll, ObtainDebt, SetDebt(3.0)],
        &[SetDebt(1.5), RemoveAll, RemoveAll, ObtainCash],
        &[ObtainDebt, RemoveCash, RemoveDebt, RemoveDebt, SetCash(9.0)],
        &[RemoveDebt, SetDebt(2.0), ObtainDebt, RemoveCash, RemoveAll, SetCash(0.5), ObtainDebt],
    ];
    for steps in sequences {
        let (direct, queued) = both_ways(steps)?;
        assert_eq!(direct, queued, "{steps:?}");
    }
    Ok(())
}

#[test]
fn unlocked_deferred_requests_apply_immediately() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let subject = mechanism.spawn_with((Cash(1.0),))?;

    assert_eq!(mechanism.set_trait_deferred(subject, Cash(4.0))?, Status::Deferred);
    assert_eq!(mechanism.pending_deferreds(), 0);
    assert_eq!(mechanism.get_trait::<Cash>(subject)?, Cash(4.0));

    assert_eq!(mechanism.despawn_deferred(subject)?, Status::Deferred);
    assert!(!mechanism.is_valid(subject));
    Ok(())
}

#[test]
fn applicators_hold_back_the_drain_until_applied() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let subject = mechanism.spawn_with((Cash(1.0),))?;
    let other = mechanism.spawn_with((Cash(2.0),))?;

    let applicator = mechanism.create_deferreds_applicator(DeferredKinds::SET_TRAIT);
    assert_eq!(applicator.kinds(), DeferredKinds::SET_TRAIT);

    assert_eq!(mechanism.set_trait_deferred(subject, Cash(10.0))?, Status::Deferred);
    assert_eq!(mechanism.despawn_deferred(other)?, Status::Deferred);
    assert_eq!(mechanism.pending_deferreds(), 2);
    assert!(mechanism.has_flag(other, Flagmark::DEFERRED_DESPAWN)?);

    {
        let _chain = mechanism.enchain_solid(Filter::new())?;
        assert!(matches!(applicator.apply(), Err(ApparatusError::InvalidState(_))));
    }
    assert_eq!(mechanism.pending_deferreds(), 2);

    assert_eq!(applicator.apply()?, Status::Success);
    assert_eq!(mechanism.get_trait::<Cash>(subject)?, Cash(10.0));
    assert_eq!(mechanism.pending_deferreds(), 1);
    assert!(mechanism.is_valid(other));

    drop(applicator);
    assert_eq!(mechanism.pending_deferreds(), 1);
    assert_eq!(mechanism.apply_deferreds()?, Status::Success);
    assert!(!mechanism.is_valid(other));
    Ok(())
}

#[test]
fn missing_targets_follow_the_configured_policy() -> ApparatusResult<()> {
    for policy in [MissingTargetPolicy::Ignore, MissingTargetPolicy::Report] {
        let mechanism = Mechanism::with_config(MechanismConfig {
            missing_target_policy: policy,
            ..MechanismConfig::default()
        })?;
        let subject = mechanism.spawn_with((Cash(1.0),))?;
        let survivor = mechanism.spawn_with((Cash(2.0),))?;

        let applicator = mechanism.create_deferreds_applicator(DeferredKinds::ALL);
        mechanism.set_trait_deferred(subject, Cash(3.0))?;
        mechanism.set_trait_deferred(survivor, Cash(4.0))?;
        assert_eq!(mechanism.despawn(subject)?, Status::Success);

        let outcome = applicator.apply();
        match policy {
            MissingTargetPolicy::Ignore => assert_eq!(outcome?, Status::Success),
            MissingTargetPolicy::Report => assert!(matches!(outcome, Err(ApparatusError::StaleSubject(_)))),
        }
        assert_eq!(mechanism.get_trait::<Cash>(survivor)?, Cash(4.0));
        assert_eq!(mechanism.pending_deferreds(), 0);
    }
    Ok(())
}

#[test]
fn deferred_despawns_protect_the_subject_from_other_requests() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let subject = mechanism.spawn_with((Cash(1.0),))?;

    {
        let _chain = mechanism.enchain_solid(Filter::new())?;
        assert_eq!(mechanism.despawn(subject)?, Status::Deferred);
        assert_eq!(mechanism.despawn(subject)?, Status::Noop);
        let cleared = mechanism.set_flag(subject, Flagmark::DEFERRED_DESPAWN, false);
        assert!(matches!(cleared, Err(ApparatusError::NoPermission(_))));
        assert_eq!(mechanism.count(&Filter::new())?, 0);
        assert_eq!(mechanism.subjects_count(), 1);
    }

    assert!(!mechanism.is_valid(subject));
    assert_eq!(mechanism.subjects_count(), 0);
    Ok(())
}
