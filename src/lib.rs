//! # Apparatus
//!
//! Entity-trait data engine. Subjects carry typed traits stored in columnar
//! chunks, one chunk per exact trait set, and are visited through chains
//! built from bitmask filters.
//!
//! ## Design Goals
//! - Columnar chunk storage with stable cell addresses
//! - Generation-checked handles that never validate again after despawn
//! - Liquid (mutable) and solid (read-only, parallel) iteration
//! - Structural changes during solid iteration queued and applied in order
//!
//! ```no_run
//! use apparatus::prelude::*;
//!
//! #[derive(Clone, Default)]
//! struct Position(f32);
//!
//! let mechanism = Mechanism::new()?;
//! mechanism.spawn_with((Position(1.0),))?;
//! let chain = mechanism.enchain(Filter::of::<(Position,)>())?;
//! chain.operate(|row| -> ApparatusResult<()> {
//!     row.get_mut::<Position>()?.0 += 1.0;
//!     Ok(())
//! })?;
//! # Ok::<(), apparatus::ApparatusError>(())
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![allow(clippy::module_inception)]
#![deny(dead_code)]

pub mod engine;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (Public API)
// ─────────────────────────────────────────────────────────────────────────────

// Mechanisms and subjects

pub use engine::mechanism::Mechanism;

pub use engine::config::{
    MechanismConfig,
    MissingTargetPolicy,
};

pub use engine::subject::{
    SubjectHandle,
    SolidSubjectHandle,
    SubjectInfo,
};

// Type sets and matching

pub use engine::bitmask::BitMask;

pub use engine::registry::{
    Trait,
    TraitInfo,
    Detail,
    DetailInfo,
    trait_info,
    register_serializable_trait,
    detail_info,
};

pub use engine::traitmark::{
    Traitmark,
    Detailmark,
    TraitSet,
    TraitBundle,
};

pub use engine::flagmark::Flagmark;
pub use engine::fingerprint::Fingerprint;
pub use engine::filter::Filter;

// Iteration

pub use engine::chain::{
    Chain,
    SolidChain,
    ChainRow,
    SolidChainRow,
};

pub use engine::lock::LockMode;

pub use engine::commands::{
    DeferredEntry,
    DeferredKinds,
    DeferredsApplicator,
};

pub use engine::record::{
    SubjectRecord,
    SubjectRecordCollection,
    TraitRecord,
};

pub use engine::storage::TraitValue;

pub use engine::error::{
    Status,
    Outcome,
    ApparatusResult,
    ApparatusError,
    HarshResult,
    Paradigm,
    Polite,
    Harsh,
    ErrorSink,
    set_error_sink,
};

pub use engine::types::{
    SubjectID,
    MechanismID,
    TraitID,
    DetailID,
};

// ─────────────────────────────────────────────────────────────────────────────
// Prelude
// ─────────────────────────────────────────────────────────────────────────────

/// Commonly used engine types.
///
/// Import with:
/// ```rust
/// use apparatus::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Mechanism,
        MechanismConfig,
        SubjectHandle,
        SolidSubjectHandle,
        Traitmark,
        Flagmark,
        Filter,
        Chain,
        SolidChain,
        ChainRow,
        SolidChainRow,
        DeferredKinds,
        SubjectRecord,
        Status,
        Outcome,
        ApparatusResult,
        HarshResult,
    };
}
