//! Fingerprints: the complete "what a subject looks like" for matching.

use crate::engine::filter::Filter;
use crate::engine::flagmark::Flagmark;
use crate::engine::registry::{Detail, Trait};
use crate::engine::traitmark::{Detailmark, TraitSet, Traitmark};


/// Traitmark, detailmark and flagmark of a subject.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    traitmark: Traitmark,
    detailmark: Detailmark,
    flagmark: Flagmark,
}

impl Fingerprint {
    /// Creates an empty fingerprint.
    #[inline]
    pub const fn new() -> Self {
        Self { traitmark: Traitmark::new(), detailmark: Detailmark::new(), flagmark: Flagmark::NONE }
    }

    /// Fingerprint carrying the traits of a tuple type.
    pub fn of<S: TraitSet>() -> Self {
        Self::from_parts(Traitmark::of::<S>(), Detailmark::new(), Flagmark::NONE)
    }

    /// Assembles a fingerprint from its parts.
    #[inline]
    pub fn from_parts(traitmark: Traitmark, detailmark: Detailmark, flagmark: Flagmark) -> Self {
        Self { traitmark, detailmark, flagmark }
    }

    /// Builder: adds a trait type.
    pub fn with_trait<T: Trait>(mut self) -> Self {
        self.traitmark.add::<T>();
        self
    }

    /// Builder: adds a detail class.
    pub fn with_detail<D: Detail>(mut self) -> Self {
        self.detailmark.add::<D>();
        self
    }

    /// Builder: sets flags.
    pub fn with_flags(mut self, flags: Flagmark) -> Self {
        self.flagmark |= flags;
        self
    }

    /// Trait part.
    #[inline]
    pub fn traitmark(&self) -> &Traitmark {
        &self.traitmark
    }

    /// Mutable trait part.
    #[inline]
    pub fn traitmark_mut(&mut self) -> &mut Traitmark {
        &mut self.traitmark
    }

    /// Detail part.
    #[inline]
    pub fn detailmark(&self) -> &Detailmark {
        &self.detailmark
    }

    /// Mutable detail part.
    #[inline]
    pub fn detailmark_mut(&mut self) -> &mut Detailmark {
        &mut self.detailmark
    }

    /// Flag part.
    #[inline]
    pub fn flagmark(&self) -> Flagmark {
        self.flagmark
    }

    /// Replaces the flag part.
    #[inline]
    pub fn set_flagmark(&mut self, flagmark: Flagmark) {
        self.flagmark = flagmark;
    }

    /// `true` if this fingerprint satisfies `filter`.
    #[inline]
    pub fn matches(&self, filter: &Filter) -> bool {
        filter.matches(self)
    }
}
