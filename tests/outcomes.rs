use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use apparatus::{
    set_error_sink, ApparatusError, ApparatusResult, ErrorSink, Filter, Flagmark, Harsh, HarshResult, Mechanism,
    Polite, Status, Traitmark,
};

#[derive(Clone, Copy, Default, Debug, PartialEq)]
struct Charge(pub i64);

struct Recorder(Arc<Mutex<Vec<(Status, String)>>>);

impl ErrorSink for Recorder {
    fn report(&self, status: Status, message: &str) {
        if let Ok(mut reports) = self.0.lock() {
            reports.push((status, message.to_owned()));
        }
    }
}

#[test]
fn polite_and_harsh_styles_share_one_outcome() -> ApparatusResult<()> {
    let mechanism = Mechanism::new()?;
    let traitmark = Traitmark::of::<(Charge,)>();

    let polite = mechanism.spawn_subject_as::<Polite>(&traitmark, Flagmark::NONE)?;
    let harsh = mechanism.spawn_subject_as::<Harsh>(&traitmark, Flagmark::NONE);
    assert_ne!(polite, harsh);
    harsh.set_trait(Charge(-3))?;
    assert_eq!(harsh.get_trait_as::<Harsh, Charge>(), Charge(-3));
    assert_eq!(polite.get_trait_as::<Polite, Charge>()?, Charge(0));

    mechanism.despawn(harsh).harsh();
    let missing = panic::catch_unwind(AssertUnwindSafe(|| harsh.get_trait_as::<Harsh, Charge>()));
    assert!(missing.is_err());

    let chain = mechanism.enchain_solid(Filter::new())?;
    let queued = mechanism.spawn_subject_as::<Harsh>(&traitmark, Flagmark::NONE);
    let early = panic::catch_unwind(AssertUnwindSafe(|| queued.get_trait_as::<Harsh, Charge>()));
    assert!(early.is_err());
    drop(chain);
    assert!(!mechanism.is_locked());
    assert_eq!(queued.get_trait_as::<Harsh, Charge>(), Charge(0));
    Ok(())
}

#[test]
fn reportable_failures_reach_the_sink() -> ApparatusResult<()> {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let previous = set_error_sink(Box::new(Recorder(reports.clone())));

    let mechanism = Mechanism::new()?;
    let subject = mechanism.spawn_with((Charge(1),))?;
    let other = mechanism.spawn_with((Charge(2),))?;
    {
        let _chain = mechanism.enchain_solid(Filter::new())?;
        let refused = mechanism.swap_traits(subject, other, false);
        assert!(matches!(refused, Err(ApparatusError::InvalidState(_))));
    }
    mechanism.despawn(subject)?;
    assert!(matches!(mechanism.despawn(subject), Err(ApparatusError::StaleSubject(_))));

    mechanism.add_adjective(Filter::of::<(Charge,)>().include_flags(Flagmark::Z), |_row| Status::InvalidArgument)?;
    let spawned = mechanism.spawn_subject(&Traitmark::of::<(Charge,)>(), Flagmark::Z)?;
    assert!(mechanism.is_valid(spawned));

    set_error_sink(previous);
    let reports = reports.lock().map(|r| r.clone()).unwrap_or_default();
    assert!(reports.iter().any(|(status, message)| *status == Status::InvalidState && message.contains("swap")));
    assert!(reports
        .iter()
        .any(|(status, message)| *status == Status::InvalidArgument && message.contains("adjectives failed")));
    assert!(reports.iter().all(|(status, _)| status.is_reportable()));
    Ok(())
}

#[test]
fn statuses_keep_their_codes_and_precedence() {
    for status in Status::ALL {
        assert_eq!(Status::from_code(status.code()), Some(status));
        assert_eq!(status.is_success(), status.code() >= 0);
    }
    assert_eq!(Status::Noop.combine(Status::Deferred), Status::Deferred);
    assert_eq!(Status::Success.combine(Status::Noop), Status::Success);
    assert_eq!(Status::Success.combine(Status::Conflict), Status::Conflict);
    assert_eq!(ApparatusError::StaleSubject(7).status(), Status::Missing);
    assert_eq!(
        ApparatusError::from_status(Status::Success, "not a failure").status(),
        Status::SanityCheckFailed
    );
}
