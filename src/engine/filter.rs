//! # Filters
//!
//! The single matching predicate of the engine.
//!
//! ## Semantics
//! A subject with fingerprint `F` matches a filter iff
//!
//! * `F.traits ⊇ include.traits` and `F.traits ∩ exclude.traits = ∅`,
//! * `F.details ⊇ include.details` and `F.details ∩ exclude.details = ∅`,
//!   where the subject side uses inclusive detail masks (own class plus
//!   ancestors), so requiring a base class accepts every subclass,
//! * `F.flags ⊇ include.flags` and `F.flags ∩ exclude.flags = ∅`.
//!
//! Matching is split into a chunk-level part (traits and details, decided once
//! per chunk) and a row-level part (flags, decided per row), because every row
//! of a chunk shares one traitmark but carries its own flagmark.
//!
//! ## Value semantics
//! Filters compare and hash by content and are used directly as cache keys.

use crate::engine::fingerprint::Fingerprint;
use crate::engine::flagmark::Flagmark;
use crate::engine::registry::{Detail, Trait};
use crate::engine::traitmark::{Detailmark, TraitSet, Traitmark};


/// Include/exclude predicate over fingerprints.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Filter {
    include: Fingerprint,
    exclude_traitmark: Traitmark,
    exclude_detailmark: Detailmark,
    exclude_flagmark: Flagmark,
}

impl Default for Filter {
    /// Matches everything except stale rows.
    fn default() -> Self {
        Self {
            include: Fingerprint::new(),
            exclude_traitmark: Traitmark::new(),
            exclude_detailmark: Detailmark::new(),
            exclude_flagmark: Self::DEFAULT_EXCLUDED_FLAGMARK,
        }
    }
}

impl Filter {
    /// Flags excluded by a freshly built filter.
    pub const DEFAULT_EXCLUDED_FLAGMARK: Flagmark = Flagmark::STALE;

    /// Same as [`Filter::default`].
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter requiring every trait of a tuple type.
    pub fn of<S: TraitSet>() -> Self {
        Self::including(Traitmark::of::<S>())
    }

    /// Filter requiring every trait of `traitmark`.
    pub fn including(traitmark: Traitmark) -> Self {
        let mut filter = Self::default();
        *filter.include.traitmark_mut() = traitmark;
        filter
    }

    /// Builder: requires `T`.
    pub fn include<T: Trait>(mut self) -> Self {
        self.include.traitmark_mut().add::<T>();
        self
    }

    /// Builder: rejects subjects carrying `T`.
    pub fn exclude<T: Trait>(mut self) -> Self {
        self.exclude_traitmark.add::<T>();
        self
    }

    /// Builder: requires detail `D` or a subclass.
    pub fn include_detail<D: Detail>(mut self) -> Self {
        self.include.detailmark_mut().add::<D>();
        self
    }

    /// Builder: rejects subjects carrying detail `D` or a subclass.
    pub fn exclude_detail<D: Detail>(mut self) -> Self {
        self.exclude_detailmark.add::<D>();
        self
    }

    /// Builder: requires every flag in `flags`.
    pub fn include_flags(mut self, flags: Flagmark) -> Self {
        let merged = self.include.flagmark() | flags;
        self.include.set_flagmark(merged);
        self
    }

    /// Builder: rejects subjects carrying any flag in `flags`.
    pub fn exclude_flags(mut self, flags: Flagmark) -> Self {
        self.exclude_flagmark |= flags;
        self
    }

    /// Required fingerprint.
    #[inline]
    pub fn include_fingerprint(&self) -> &Fingerprint {
        &self.include
    }

    /// Required traits.
    #[inline]
    pub fn include_traitmark(&self) -> &Traitmark {
        self.include.traitmark()
    }

    /// Required details.
    #[inline]
    pub fn include_detailmark(&self) -> &Detailmark {
        self.include.detailmark()
    }

    /// Required flags.
    #[inline]
    pub fn include_flagmark(&self) -> Flagmark {
        self.include.flagmark()
    }

    /// Rejected traits.
    #[inline]
    pub fn exclude_traitmark(&self) -> &Traitmark {
        &self.exclude_traitmark
    }

    /// Rejected details.
    #[inline]
    pub fn exclude_detailmark(&self) -> &Detailmark {
        &self.exclude_detailmark
    }

    /// Rejected flags.
    #[inline]
    pub fn exclude_flagmark(&self) -> Flagmark {
        self.exclude_flagmark
    }

    /// `false` when the include and exclude sides overlap, so nothing can match.
    pub fn is_satisfiable(&self) -> bool {
        self.include_traitmark().mask().excludes(self.exclude_traitmark.mask())
            && self.include_detailmark().mask().excludes(self.exclude_detailmark.excluded_mask())
            && !self.include_flagmark().intersects(self.exclude_flagmark)
    }

    /// Trait-level test for a chunk's traitmark (no details, no flags).
    #[inline]
    pub fn matches_traitmark(&self, traitmark: &Traitmark) -> bool {
        traitmark.mask().includes(self.include_traitmark().mask())
            && traitmark.mask().excludes(self.exclude_traitmark.mask())
    }

    /// Detail-level test for an inclusive detail set.
    #[inline]
    pub fn matches_detailmark(&self, detailmark: &Detailmark) -> bool {
        detailmark.mask().includes(self.include_detailmark().excluded_mask())
            && detailmark.mask().excludes(self.exclude_detailmark.excluded_mask())
    }

    /// Chunk-level test: traits plus an empty detail set.
    #[inline]
    pub fn matches_chunk(&self, traitmark: &Traitmark) -> bool {
        self.matches_traitmark(traitmark) && self.include_detailmark().is_empty()
    }

    /// Row-level test on a flagmark.
    #[inline]
    pub fn matches_flagmark(&self, flagmark: Flagmark) -> bool {
        flagmark.contains(self.include_flagmark()) && !flagmark.intersects(self.exclude_flagmark)
    }

    /// Full test against a fingerprint.
    #[inline]
    pub fn matches(&self, fingerprint: &Fingerprint) -> bool {
        self.matches_traitmark(fingerprint.traitmark())
            && self.matches_detailmark(fingerprint.detailmark())
            && self.matches_flagmark(fingerprint.flagmark())
    }
}
