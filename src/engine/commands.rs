//! # Deferred Structural Changes
//!
//! Structural requests that arrive while a mechanism is solid-locked cannot
//! run immediately. They are recorded as [`DeferredEntry`] values and applied
//! later, in enqueue order, once the mechanism is writable again.
//!
//! ## Design
//! - Entries are plain data describing *what* should change; the mechanism
//!   applies each one through its ordinary mutating API.
//! - The queue is multi-producer (any thread may enqueue under the queue
//!   mutex) and single-consumer (only the thread draining it under the
//!   mechanism writer guard removes entries).
//! - [`DeferredsApplicator`] lets a caller take over draining: while any
//!   applicator is alive, releasing the last lock does not drain
//!   automatically, and [`DeferredsApplicator::apply`] drains only the entry
//!   kinds it was created for.
//!
//! ## Invariants
//! - Matching entries are applied in the order they were recorded; entries
//!   of other kinds keep their relative order in the queue.
//! - An entry whose target handle became invalid is resolved according to
//!   the mechanism's missing-target policy.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use parking_lot::Mutex;

use crate::engine::error::Outcome;
use crate::engine::flagmark::Flagmark;
use crate::engine::mechanism::Mechanism;
use crate::engine::record::SubjectRecord;
use crate::engine::registry::TraitInfo;
use crate::engine::storage::TraitValue;
use crate::engine::subject::SubjectHandle;
use crate::engine::traitmark::Traitmark;


/// A recorded structural change.
pub enum DeferredEntry {
    /// Spawns a subject from a record.
    SpawnSubject(SubjectRecord),

    /// Places a subject whose handle was issued at request time.
    SpawnReserved(SubjectHandle, Traitmark, Flagmark, Vec<TraitValue>),

    /// Despawns a subject.
    DespawnSubject(SubjectHandle),

    /// Writes a trait value, adding the trait if absent.
    SetTrait(SubjectHandle, TraitValue),

    /// Adds a default-initialised trait if absent.
    ObtainTrait(SubjectHandle, &'static TraitInfo),

    /// Removes a trait.
    RemoveTrait(SubjectHandle, &'static TraitInfo),

    /// Removes every trait.
    RemoveAllTraits(SubjectHandle),
}

impl DeferredEntry {
    /// Kind bit of the entry.
    pub fn kind(&self) -> DeferredKinds {
        match self {
            DeferredEntry::SpawnSubject(_) | DeferredEntry::SpawnReserved(..) => DeferredKinds::SPAWN,
            DeferredEntry::DespawnSubject(_) => DeferredKinds::DESPAWN,
            DeferredEntry::SetTrait(..) => DeferredKinds::SET_TRAIT,
            DeferredEntry::ObtainTrait(..) => DeferredKinds::OBTAIN_TRAIT,
            DeferredEntry::RemoveTrait(..) => DeferredKinds::REMOVE_TRAIT,
            DeferredEntry::RemoveAllTraits(_) => DeferredKinds::REMOVE_ALL_TRAITS,
        }
    }

    /// Live subject the entry targets; `None` for spawns.
    pub fn target(&self) -> Option<SubjectHandle> {
        match self {
            DeferredEntry::SpawnSubject(_) | DeferredEntry::SpawnReserved(..) => None,
            DeferredEntry::DespawnSubject(h)
            | DeferredEntry::SetTrait(h, _)
            | DeferredEntry::ObtainTrait(h, _)
            | DeferredEntry::RemoveTrait(h, _)
            | DeferredEntry::RemoveAllTraits(h) => Some(*h),
        }
    }
}

impl fmt::Debug for DeferredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredEntry::SpawnSubject(record) => f.debug_tuple("SpawnSubject").field(record).finish(),
            DeferredEntry::SpawnReserved(h, traitmark, flagmark, _) => {
                f.debug_tuple("SpawnReserved").field(h).field(traitmark).field(flagmark).finish()
            }
            DeferredEntry::DespawnSubject(h) => f.debug_tuple("DespawnSubject").field(h).finish(),
            DeferredEntry::SetTrait(h, value) => f.debug_tuple("SetTrait").field(h).field(value).finish(),
            DeferredEntry::ObtainTrait(h, info) => f.debug_tuple("ObtainTrait").field(h).field(&info.name()).finish(),
            DeferredEntry::RemoveTrait(h, info) => f.debug_tuple("RemoveTrait").field(h).field(&info.name()).finish(),
            DeferredEntry::RemoveAllTraits(h) => f.debug_tuple("RemoveAllTraits").field(h).finish(),
        }
    }
}


/// Set of deferred entry kinds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeferredKinds(u8);

impl DeferredKinds {
    /// No kinds.
    pub const NONE: DeferredKinds = DeferredKinds(0);
    /// Spawns.
    pub const SPAWN: DeferredKinds = DeferredKinds(1 << 0);
    /// Despawns.
    pub const DESPAWN: DeferredKinds = DeferredKinds(1 << 1);
    /// Trait writes.
    pub const SET_TRAIT: DeferredKinds = DeferredKinds(1 << 2);
    /// Trait additions.
    pub const OBTAIN_TRAIT: DeferredKinds = DeferredKinds(1 << 3);
    /// Trait removals.
    pub const REMOVE_TRAIT: DeferredKinds = DeferredKinds(1 << 4);
    /// Removal of every trait.
    pub const REMOVE_ALL_TRAITS: DeferredKinds = DeferredKinds(1 << 5);
    /// Every kind.
    pub const ALL: DeferredKinds = DeferredKinds(0b11_1111);

    /// `true` if every kind of `other` is in `self`.
    #[inline]
    pub const fn contains(self, other: DeferredKinds) -> bool {
        self.0 & other.0 == other.0
    }

    /// `true` if no kind is selected.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DeferredKinds {
    type Output = DeferredKinds;
    fn bitor(self, rhs: DeferredKinds) -> DeferredKinds {
        DeferredKinds(self.0 | rhs.0)
    }
}

impl BitOrAssign for DeferredKinds {
    fn bitor_assign(&mut self, rhs: DeferredKinds) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DeferredKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 6] = ["Spawn", "Despawn", "SetTrait", "ObtainTrait", "RemoveTrait", "RemoveAllTraits"];
        f.debug_set()
            .entries(NAMES.iter().enumerate().filter(|(bit, _)| self.0 & (1 << bit) != 0).map(|(_, name)| name))
            .finish()
    }
}


/// FIFO of deferred entries shared by every producer thread.
#[derive(Default)]
pub struct DeferredQueue {
    entries: Mutex<VecDeque<DeferredEntry>>,
}

impl DeferredQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: DeferredEntry) {
        log::trace!(target: "apparatus", "deferred {entry:?}");
        self.entries.lock().push_back(entry);
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Removes the first pending entry of one of `kinds`, preserving the
    /// order of everything left behind.
    pub(crate) fn pop_matching(&self, kinds: DeferredKinds) -> Option<DeferredEntry> {
        let mut entries = self.entries.lock();
        if kinds == DeferredKinds::ALL {
            return entries.pop_front();
        }
        let position = entries.iter().position(|entry| kinds.contains(entry.kind()))?;
        entries.remove(position)
    }

    /// Drops every pending entry, returning how many there were.
    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        dropped
    }
}

impl fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredQueue").field("pending", &self.len()).finish()
    }
}


/// Explicit drain scope over a mechanism's deferred queue.
///
/// While at least one applicator is alive, the mechanism does not drain its
/// queue when its last lock is released. Entries left in the queue when the
/// applicator is dropped are drained at the end of the next outermost lock
/// scope, or by [`Mechanism::apply_deferreds`].
pub struct DeferredsApplicator<'a> {
    mechanism: &'a Mechanism,
    kinds: DeferredKinds,
}

impl<'a> DeferredsApplicator<'a> {
    pub(crate) fn new(mechanism: &'a Mechanism, kinds: DeferredKinds) -> Self {
        mechanism.enter_applicator();
        Self { mechanism, kinds }
    }

    /// Kinds this applicator drains.
    #[inline]
    pub fn kinds(&self) -> DeferredKinds {
        self.kinds
    }

    /// Applies every pending entry of the selected kinds, in order.
    ///
    /// ## Errors
    /// `InvalidState` while the mechanism is solid-locked. A failing entry
    /// does not stop the drain; the first failure is returned once the queue
    /// holds no more matching entries.
    pub fn apply(&self) -> Outcome {
        self.mechanism.drain_deferreds(self.kinds)
    }
}

impl Drop for DeferredsApplicator<'_> {
    fn drop(&mut self) {
        self.mechanism.leave_applicator();
    }
}

impl fmt::Debug for DeferredsApplicator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredsApplicator").field("kinds", &self.kinds).finish()
    }
}
