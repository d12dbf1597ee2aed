//! Subject handles and the per-mechanism subject registry.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use crate::engine::error::{ApparatusError, ApparatusResult, Outcome, Paradigm};
use crate::engine::fingerprint::Fingerprint;
use crate::engine::flagmark::Flagmark;
use crate::engine::mechanism::Mechanism;
use crate::engine::registry::Trait;
use crate::engine::types::{
    make_subject_id, next_generation, split_subject_id, ChunkID, Generation, MechanismID, SlotIndex,
    SubjectID, INVALID_SUBJECT_ID, MECHANISMS_MAX,
};


/// Opaque handle to a subject.
///
/// Equality and hashing use all 64 bits. A handle stays invalid forever once
/// its subject is despawned.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SubjectHandle(SubjectID);

impl SubjectHandle {
    /// Handle that never refers to a subject.
    pub const INVALID: SubjectHandle = SubjectHandle(INVALID_SUBJECT_ID);

    #[inline]
    pub(crate) const fn new(mechanism: MechanismID, generation: Generation, slot: SlotIndex) -> Self {
        SubjectHandle(make_subject_id(mechanism, generation, slot))
    }

    /// Rebuilds a handle from its raw bits.
    #[inline]
    pub const fn from_raw(raw: SubjectID) -> Self {
        SubjectHandle(raw)
    }

    /// Raw 64-bit value.
    #[inline]
    pub const fn raw(self) -> SubjectID {
        self.0
    }

    /// Issuing mechanism.
    #[inline]
    pub const fn mechanism_id(self) -> MechanismID {
        split_subject_id(self.0).0
    }

    /// Generation at issue time.
    #[inline]
    pub const fn generation(self) -> Generation {
        split_subject_id(self.0).1
    }

    /// Registry slot.
    #[inline]
    pub const fn slot(self) -> SlotIndex {
        split_subject_id(self.0).2
    }

    /// `true` for the all-zero handle.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == INVALID_SUBJECT_ID
    }

    /// Read-only view of the same subject.
    #[inline]
    pub const fn solid(self) -> SolidSubjectHandle {
        SolidSubjectHandle(self)
    }

    #[inline]
    fn mechanism(self) -> ApparatusResult<std::sync::Arc<Mechanism>> {
        Mechanism::resolve(self.mechanism_id()).ok_or(ApparatusError::StaleSubject(self.0))
    }

    /// `true` while the subject is alive.
    pub fn is_valid(self) -> bool {
        !self.is_null() && self.mechanism().is_ok_and(|m| m.is_valid(self))
    }

    /// Despawns the subject (deferred while the mechanism is solid).
    pub fn despawn(self) -> Outcome {
        self.mechanism()?.despawn(self)
    }

    /// Writes trait `T`, adding it if absent.
    pub fn set_trait<T: Trait>(self, value: T) -> Outcome {
        self.mechanism()?.set_trait(self, value)
    }

    /// Clones trait `T` out of the subject.
    pub fn get_trait<T: Trait>(self) -> ApparatusResult<T> {
        self.mechanism()?.get_trait::<T>(self)
    }

    /// [`SubjectHandle::get_trait`] under a compile-time selected call style.
    pub fn get_trait_as<P: Paradigm, T: Trait>(self) -> P::Output<T> {
        P::deliver(self.get_trait::<T>())
    }

    /// `true` if the subject carries `T`.
    pub fn has_trait<T: Trait>(self) -> ApparatusResult<bool> {
        self.mechanism()?.has_trait::<T>(self)
    }

    /// Adds a default `T` if absent; `Noop` otherwise.
    pub fn obtain_trait<T: Trait>(self) -> Outcome {
        self.mechanism()?.obtain_trait::<T>(self)
    }

    /// Removes `T`; `Noop` if absent.
    pub fn remove_trait<T: Trait>(self) -> Outcome {
        self.mechanism()?.remove_trait::<T>(self)
    }

    /// Removes every trait.
    pub fn remove_all_traits(self) -> Outcome {
        self.mechanism()?.remove_all_traits(self)
    }

    /// Current fingerprint.
    pub fn fingerprint(self) -> ApparatusResult<Fingerprint> {
        self.mechanism()?.fingerprint(self)
    }

    /// Current flagmark.
    pub fn flagmark(self) -> ApparatusResult<Flagmark> {
        self.mechanism()?.flagmark(self)
    }

    /// Replaces the user-settable flags; returns the previous flagmark.
    pub fn set_flagmark(self, flagmark: Flagmark) -> ApparatusResult<Flagmark> {
        self.mechanism()?.set_flagmark(self, flagmark)
    }

    /// Overwrites the flags in `mask`; returns the previous flagmark.
    pub fn set_flagmark_masked(self, flagmark: Flagmark, mask: Flagmark) -> ApparatusResult<Flagmark> {
        self.mechanism()?.set_flagmark_masked(self, flagmark, mask)
    }

    /// `true` if every flag in `flag` is set.
    pub fn has_flag(self, flag: Flagmark) -> ApparatusResult<bool> {
        self.mechanism()?.has_flag(self, flag)
    }

    /// Sets or clears `flag`; returns its previous state.
    pub fn set_flag(self, flag: Flagmark, state: bool) -> ApparatusResult<bool> {
        self.mechanism()?.set_flag(self, flag, state)
    }

    /// Flips `flag`; returns its previous state.
    pub fn toggle_flag(self, flag: Flagmark) -> ApparatusResult<bool> {
        self.mechanism()?.toggle_flag(self, flag)
    }
}

impl fmt::Debug for SubjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (mechanism, generation, slot) = split_subject_id(self.0);
        write!(f, "Subject(m{mechanism}:{slot}@{generation})")
    }
}


/// Read-only view of a subject, handed out by solid iteration.
///
/// Trait content can only be read; flags may still be changed atomically,
/// and structural requests are queued.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SolidSubjectHandle(SubjectHandle);

impl SolidSubjectHandle {
    /// The underlying handle value.
    #[inline]
    pub const fn handle(self) -> SubjectHandle {
        self.0
    }

    /// `true` while the subject is alive.
    pub fn is_valid(self) -> bool {
        self.0.is_valid()
    }

    /// Clones trait `T` out of the subject.
    pub fn get_trait<T: Trait>(self) -> ApparatusResult<T> {
        self.0.get_trait::<T>()
    }

    /// `true` if the subject carries `T`.
    pub fn has_trait<T: Trait>(self) -> ApparatusResult<bool> {
        self.0.has_trait::<T>()
    }

    /// Current flagmark.
    pub fn flagmark(self) -> ApparatusResult<Flagmark> {
        self.0.flagmark()
    }

    /// `true` if every flag in `flag` is set.
    pub fn has_flag(self, flag: Flagmark) -> ApparatusResult<bool> {
        self.0.has_flag(flag)
    }

    /// Sets or clears `flag` atomically; returns its previous state.
    pub fn set_flag(self, flag: Flagmark, state: bool) -> ApparatusResult<bool> {
        self.0.set_flag(flag, state)
    }

    /// Flips `flag` atomically; returns its previous state.
    pub fn toggle_flag(self, flag: Flagmark) -> ApparatusResult<bool> {
        self.0.toggle_flag(flag)
    }

    /// Overwrites the flags in `mask` atomically.
    pub fn set_flagmark_masked(self, flagmark: Flagmark, mask: Flagmark) -> ApparatusResult<Flagmark> {
        self.0.set_flagmark_masked(flagmark, mask)
    }

    /// Queues a despawn.
    pub fn despawn_deferred(self) -> Outcome {
        self.0.mechanism()?.despawn_deferred(self.0)
    }

    /// Queues a trait write.
    pub fn set_trait_deferred<T: Trait>(self, value: T) -> Outcome {
        self.0.mechanism()?.set_trait_deferred(self.0, value)
    }

    /// Queues adding a default `T`.
    pub fn obtain_trait_deferred<T: Trait>(self) -> Outcome {
        self.0.mechanism()?.obtain_trait_deferred::<T>(self.0)
    }

    /// Queues removing `T`.
    pub fn remove_trait_deferred<T: Trait>(self) -> Outcome {
        self.0.mechanism()?.remove_trait_deferred::<T>(self.0)
    }
}

impl From<SubjectHandle> for SolidSubjectHandle {
    fn from(handle: SubjectHandle) -> Self {
        SolidSubjectHandle(handle)
    }
}

impl fmt::Debug for SolidSubjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Solid{:?}", self.0)
    }
}


/// Lowest generation a new registry for `mechanism` may issue.
///
/// Raised past every generation handed out under that id, so handles of a
/// dropped mechanism stay invalid when its id is reused.
fn generation_floor(mechanism: MechanismID) -> &'static AtomicU32 {
    static FLOORS: OnceLock<Vec<AtomicU32>> = OnceLock::new();
    let floors = FLOORS.get_or_init(|| (0..=MECHANISMS_MAX).map(|_| AtomicU32::new(0)).collect());
    &floors[mechanism as usize]
}

/// Registry entry for one slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubjectInfo {
    generation: Generation,
    chunk: Option<ChunkID>,
    row: u32,
    reserved: bool,
}

impl SubjectInfo {
    /// Current generation of the slot.
    #[inline]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Chunk holding the subject, `None` for a free slot.
    #[inline]
    pub fn chunk(&self) -> Option<ChunkID> {
        self.chunk
    }

    /// Row within the chunk.
    #[inline]
    pub fn row(&self) -> usize {
        self.row as usize
    }

    #[inline]
    fn is_alive(&self) -> bool {
        self.chunk.is_some()
    }
}

/// Dense slot array with free-list reuse.
///
/// A slot is free, reserved (handle issued, subject not placed yet) or live.
#[derive(Debug)]
pub struct SubjectRegistry {
    mechanism: MechanismID,
    base_generation: Generation,
    infos: Vec<SubjectInfo>,
    free: Vec<SlotIndex>,
    live: usize,
    limit: usize,
}

impl SubjectRegistry {
    pub(crate) fn new(mechanism: MechanismID, limit: usize) -> Self {
        let base_generation = generation_floor(mechanism).load(Ordering::Acquire);
        Self { mechanism, base_generation, infos: Vec::new(), free: Vec::new(), live: 0, limit }
    }

    fn ensure_capacity(&mut self) -> ApparatusResult<()> {
        if self.infos.len() < self.infos.capacity() {
            return Ok(());
        }
        if self.infos.len() >= self.limit {
            return Err(ApparatusError::OutOfLimit { what: "subjects", limit: self.limit }.surfaced());
        }
        let additional = 1024.min(self.limit - self.infos.len());
        self.infos.try_reserve(additional).map_err(|_| {
            ApparatusError::NoMemory { bytes: additional * std::mem::size_of::<SubjectInfo>() }.surfaced()
        })
    }

    /// Issues a handle for a subject that is placed later with
    /// [`SubjectRegistry::occupy`]. The handle does not validate until then.
    pub(crate) fn reserve(&mut self) -> ApparatusResult<SubjectHandle> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.ensure_capacity()?;
                self.infos.push(SubjectInfo { generation: self.base_generation, ..SubjectInfo::default() });
                (self.infos.len() - 1) as SlotIndex
            }
        };
        let info = &mut self.infos[slot as usize];
        info.reserved = true;
        generation_floor(self.mechanism).fetch_max(next_generation(info.generation), Ordering::AcqRel);
        Ok(SubjectHandle::new(self.mechanism, info.generation, slot))
    }

    /// Places a reserved handle at `(chunk, row)`, making it live.
    pub(crate) fn occupy(&mut self, handle: SubjectHandle, chunk: ChunkID, row: usize) -> ApparatusResult<()> {
        let info = self.reserved_mut(handle).ok_or(ApparatusError::StaleSubject(handle.raw()))?;
        info.reserved = false;
        info.chunk = Some(chunk);
        info.row = row as u32;
        self.live += 1;
        Ok(())
    }

    /// `true` while `handle` is reserved and not yet placed.
    #[inline]
    pub(crate) fn is_reserved(&self, handle: SubjectHandle) -> bool {
        handle.mechanism_id() == self.mechanism
            && self
                .infos
                .get(handle.slot() as usize)
                .is_some_and(|info| info.reserved && info.generation == handle.generation())
    }

    fn reserved_mut(&mut self, handle: SubjectHandle) -> Option<&mut SubjectInfo> {
        if handle.mechanism_id() != self.mechanism {
            return None;
        }
        self.infos
            .get_mut(handle.slot() as usize)
            .filter(|info| info.reserved && info.generation == handle.generation())
    }

    /// Frees the slot of a live or reserved handle, bumping its generation.
    pub(crate) fn release(&mut self, handle: SubjectHandle) -> bool {
        let was_live = self.resolve(handle).is_some();
        if !was_live && self.reserved_mut(handle).is_none() {
            return false;
        }
        let info = &mut self.infos[handle.slot() as usize];
        info.generation = next_generation(info.generation);
        info.chunk = None;
        info.row = 0;
        info.reserved = false;
        self.free.push(handle.slot());
        if was_live {
            self.live -= 1;
        }
        true
    }

    /// Entry of a live handle.
    #[inline]
    pub fn resolve(&self, handle: SubjectHandle) -> Option<&SubjectInfo> {
        if handle.mechanism_id() != self.mechanism {
            return None;
        }
        self.infos
            .get(handle.slot() as usize)
            .filter(|info| info.is_alive() && info.generation == handle.generation())
    }

    #[inline]
    pub(crate) fn resolve_mut(&mut self, handle: SubjectHandle) -> Option<&mut SubjectInfo> {
        if handle.mechanism_id() != self.mechanism {
            return None;
        }
        self.infos
            .get_mut(handle.slot() as usize)
            .filter(|info| info.is_alive() && info.generation == handle.generation())
    }

    /// Live entry or `StaleSubject`.
    #[inline]
    pub fn expect(&self, handle: SubjectHandle) -> ApparatusResult<&SubjectInfo> {
        self.resolve(handle).ok_or(ApparatusError::StaleSubject(handle.raw()))
    }

    /// Repoints a live subject at a new location.
    pub(crate) fn relocate(&mut self, handle: SubjectHandle, chunk: ChunkID, row: usize) -> ApparatusResult<()> {
        let info = self.resolve_mut(handle).ok_or(ApparatusError::StaleSubject(handle.raw()))?;
        info.chunk = Some(chunk);
        info.row = row as u32;
        Ok(())
    }

    /// Number of live subjects.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of slots ever allocated.
    #[inline]
    pub fn slots(&self) -> usize {
        self.infos.len()
    }

    /// Invalidates every live handle and returns all slots to the free list.
    pub(crate) fn release_all(&mut self) {
        self.free.clear();
        for (slot, info) in self.infos.iter_mut().enumerate().rev() {
            if info.is_alive() || info.reserved {
                info.generation = next_generation(info.generation);
                info.chunk = None;
                info.row = 0;
                info.reserved = false;
            }
            self.free.push(slot as SlotIndex);
        }
        self.live = 0;
    }

    /// Handles of every live subject, in slot order.
    pub fn live_handles(&self) -> impl Iterator<Item = SubjectHandle> + '_ {
        self.infos
            .iter()
            .enumerate()
            .filter(|(_, info)| info.is_alive())
            .map(|(slot, info)| SubjectHandle::new(self.mechanism, info.generation, slot as SlotIndex))
    }
}
