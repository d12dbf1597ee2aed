use std::collections::HashSet;

use apparatus::{
    detail_info, ApparatusError, ApparatusResult, BitMask, Detail, DetailInfo, Filter, Fingerprint, Flagmark,
    Mechanism, Status, Traitmark,
};

#[derive(Clone, Copy, Default)]
struct Fuel(pub f32);

#[derive(Clone, Copy, Default)]
struct Cargo(pub u32);

#[derive(Clone, Copy, Default)]
struct Crew(pub u8);

struct Vehicle;
impl Detail for Vehicle {}

struct Truck;
impl Detail for Truck {
    fn base() -> Option<&'static DetailInfo> {
        Some(detail_info::<Vehicle>())
    }
}

struct Boat;
impl Detail for Boat {
    fn base() -> Option<&'static DetailInfo> {
        Some(detail_info::<Vehicle>())
    }
}

#[test]
fn bitmask_inclusion_agrees_with_set_semantics() {
    let samples = [
        vec![],
        vec![0],
        vec![3, 64],
        vec![0, 3, 64, 130],
        vec![130],
        vec![1, 2, 3, 4, 5, 200],
    ];
    for a in &samples {
        for b in &samples {
            let ma = BitMask::from_indices(a.iter().copied());
            let mb = BitMask::from_indices(b.iter().copied());
            let sa: HashSet<usize> = a.iter().copied().collect();
            let sb: HashSet<usize> = b.iter().copied().collect();

            assert_eq!(ma.includes(&mb), sb.is_subset(&sa));
            assert_eq!(ma.excludes(&mb), sa.is_disjoint(&sb));
            assert_eq!(ma.includes_partially(&mb), !sa.is_disjoint(&sb));
            assert_eq!(ma.differences_count(&mb), sa.symmetric_difference(&sb).count());
            assert_eq!(ma == mb, sa == sb);
            if ma == mb {
                assert_eq!(ma.calc_hash(), mb.calc_hash());
            }
        }
    }
}

#[test]
fn traitmarks_ignore_declaration_order() {
    let forward = Traitmark::of::<(Fuel, Cargo, Crew)>();
    let backward = Traitmark::new().with::<Crew>().with::<Cargo>().with::<Fuel>();
    assert_eq!(forward, backward);
    assert_eq!(forward.len(), 3);
    assert!(forward.includes(&Traitmark::of::<(Cargo,)>()));
    assert_eq!(forward.difference(&Traitmark::of::<(Cargo,)>()), Traitmark::of::<(Crew, Fuel)>());

    let mut shrinking = forward.clone();
    assert_eq!(shrinking.remove::<Cargo>(), Status::Success);
    assert_eq!(shrinking.remove::<Cargo>(), Status::Noop);
    assert_eq!(shrinking.union(&Traitmark::of::<(Cargo,)>()), forward);
    assert_eq!(&shrinking | &Traitmark::of::<(Cargo,)>(), forward);
    assert_eq!(&forward - &shrinking, Traitmark::of::<(Cargo,)>());
}

#[test]
fn filters_combine_traits_details_and_flags() {
    let truck = Fingerprint::of::<(Fuel, Cargo)>()
        .with_detail::<Truck>()
        .with_flags(Flagmark::BOOTED);
    let boat = Fingerprint::of::<(Fuel, Crew)>().with_detail::<Boat>();

    let vehicles = Filter::of::<(Fuel,)>().include_detail::<Vehicle>();
    assert!(vehicles.matches(&truck));
    assert!(vehicles.matches(&boat));

    let land = vehicles.clone().exclude_detail::<Boat>();
    assert!(land.matches(&truck));
    assert!(!land.matches(&boat));

    let hauling = Filter::of::<(Cargo,)>().exclude::<Crew>().include_flags(Flagmark::BOOTED);
    assert!(hauling.matches(&truck));
    assert!(!hauling.matches(&boat));
    assert!(!hauling.matches(&truck.clone().with_flags(Flagmark::NONE)));

    let stale = truck.clone().with_flags(Flagmark::STALE | Flagmark::BOOTED);
    assert!(!Filter::new().matches(&stale));
    assert!(Filter::new().matches(&truck));
}

#[test]
fn contradictory_filters_are_unsatisfiable() {
    assert!(Filter::of::<(Fuel,)>().is_satisfiable());
    assert!(!Filter::of::<(Fuel,)>().exclude::<Fuel>().is_satisfiable());
    assert!(!Filter::new().include_flags(Flagmark::STALE).is_satisfiable());
    assert_eq!(Filter::of::<(Fuel, Cargo)>(), Filter::new().include::<Cargo>().include::<Fuel>());
}

#[test]
fn despawned_handles_never_validate_again() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let first = mechanism.spawn_with((Fuel(1.0),))?;
    assert_eq!(first.mechanism_id(), mechanism.id());
    assert!(first.is_valid());

    assert_eq!(mechanism.despawn(first)?, Status::Success);
    let second = mechanism.spawn_with((Fuel(2.0),))?;
    assert_eq!(second.slot(), first.slot());
    assert_ne!(second.generation(), first.generation());
    assert!(!mechanism.is_valid(first));
    assert!(matches!(mechanism.get_trait::<Fuel>(first), Err(ApparatusError::StaleSubject(_))));
    assert!(matches!(mechanism.despawn(first), Err(ApparatusError::StaleSubject(_))));

    let other = Mechanism::new()?;
    assert!(!other.is_valid(second));
    assert!(second.get_trait::<Fuel>().is_ok());

    mechanism.despawn_all()?;
    assert!(!second.is_valid());
    assert_eq!(mechanism.despawn_all()?, Status::Noop);
    Ok(())
}

#[test]
fn handles_of_a_dropped_mechanism_stay_invalid_when_its_id_returns() -> ApparatusResult<()> {
    let retired = Mechanism::new()?;
    let id = retired.id();
    let despawned = retired.spawn_with((Fuel(1.0),))?;
    retired.despawn(despawned)?;
    let abandoned = retired.spawn_with((Fuel(2.0),))?;
    let untouched = retired.spawn_with((Cargo(3),))?;
    drop(retired);
    assert!(!abandoned.is_valid());

    let mut successor = None;
    for _ in 0..4 * 255 {
        let candidate = Mechanism::new()?;
        if candidate.id() == id {
            successor = Some(candidate);
            break;
        }
    }
    let successor = successor.ok_or_else(|| ApparatusError::Missing(format!("mechanism id {id} never came back")))?;

    let fresh: Vec<_> = (0..3).map(|i| successor.spawn_with((Fuel(i as f32),))).collect::<ApparatusResult<_>>()?;
    for old in [despawned, abandoned, untouched] {
        assert!(!successor.is_valid(old), "{old:?} validated again");
        assert!(!old.is_valid());
        assert!(fresh.iter().all(|&new| new != old));
    }
    assert!(fresh.iter().all(|&new| successor.is_valid(new)));
    Ok(())
}

#[test]
fn swapping_exchanges_shared_values_only() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let truck = mechanism.spawn_with((Fuel(10.0), Cargo(4)))?;
    let boat = mechanism.spawn_with((Fuel(80.0), Crew(3)))?;

    assert_eq!(mechanism.swap_traits(truck, boat, false)?, Status::Success);
    assert_eq!(mechanism.get_trait::<Fuel>(truck)?.0, 80.0);
    assert_eq!(mechanism.get_trait::<Fuel>(boat)?.0, 10.0);
    assert_eq!(mechanism.get_trait::<Cargo>(truck)?.0, 4);
    assert_eq!(mechanism.get_trait::<Crew>(boat)?.0, 3);
    assert!(!mechanism.has_trait::<Crew>(truck)?);

    mechanism.swap_traits(truck, boat, true)?;
    assert_eq!(mechanism.get_trait::<Fuel>(truck)?.0, 10.0);
    assert_eq!(mechanism.get_trait::<Cargo>(truck)?.0, 0);
    assert_eq!(mechanism.get_trait::<Crew>(boat)?.0, 0);
    assert_eq!(mechanism.swap_traits(boat, boat, true)?, Status::Noop);

    assert_eq!(mechanism.remove_all_traits(boat)?, Status::Success);
    assert!(mechanism.fingerprint(boat)?.traitmark().is_empty());
    assert!(mechanism.is_valid(boat));
    Ok(())
}
