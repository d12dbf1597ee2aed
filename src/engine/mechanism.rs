//! # Mechanisms
//!
//! A mechanism owns a population of subjects: the chunks storing them, the
//! subject registry, the filter match cache, the deferred queue, and the
//! adjectives and mechanics bound to it.
//!
//! ## Structure
//!
//! ```text
//! Mechanism
//! ├── state (AccessGuard)
//! │   ├── chunks              Vec<Arc<Chunk>>, indexed by ChunkID
//! │   ├── chunks_by_traitmark Traitmark -> ChunkID
//! │   ├── subjects            SubjectRegistry
//! │   └── adjectives, mechanics
//! ├── filter_cache            Filter -> [Weak<Chunk>]
//! ├── deferreds               DeferredQueue
//! └── lock                    signed depth of live chains
//! ```
//!
//! ## Lock discipline
//!
//! * Every structural change runs under the writer side of the state guard.
//! * Chains take their locks under the reader side, so a writer always sees a
//!   consistent lock depth.
//! * While the mechanism is **solid**, structural requests are queued as
//!   deferred entries; despawns additionally flag the subject
//!   `DEFERRED_DESPAWN` so chains skip it. Spawns reserve their handle
//!   right away and are placed at the drain.
//! * While it is **liquid**, changes run immediately; rows that leave a locked
//!   chunk turn stale instead of being swap-removed.
//! * When the outermost lock is released, stale rows are compacted and the
//!   deferred queue is drained, unless a [`DeferredsApplicator`] is alive.
//!
//! ## Multiple mechanisms
//!
//! Each mechanism takes a process-unique 8-bit id (id `0` is never issued).
//! Handles carry that id and find their mechanism through a process-wide
//! table of weak references.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::engine::adjective::{self, Adjective, Mechanic};
use crate::engine::chain::{Chain, ChainRow, SolidChain, SolidChainRow};
use crate::engine::chunk::{AttachmentKey, Chunk};
use crate::engine::commands::{DeferredEntry, DeferredKinds, DeferredQueue, DeferredsApplicator};
use crate::engine::config::{MechanismConfig, MissingTargetPolicy};
use crate::engine::error::{
    combine_outcomes, report_error, ApparatusError, ApparatusResult, IntoOutcome, Outcome, Paradigm, Status,
};
use crate::engine::filter::Filter;
use crate::engine::fingerprint::Fingerprint;
use crate::engine::flagmark::{AtomicFlagmark, Flagmark};
use crate::engine::lock::{AccessGuard, LockCounter, LockMode, OperatingsCounter};
use crate::engine::record::SubjectRecord;
use crate::engine::registry::{trait_info, Trait, TraitInfo};
use crate::engine::storage::TraitValue;
use crate::engine::subject::{SubjectHandle, SubjectRegistry};
use crate::engine::traitmark::{TraitBundle, Traitmark};
use crate::engine::types::{AdjectiveID, MechanismID, MECHANISMS_MAX};


struct MechanismTable {
    slots: Vec<Weak<Mechanism>>,
    next: usize,
}

fn mechanism_table() -> &'static RwLock<MechanismTable> {
    static MECHANISMS: OnceLock<RwLock<MechanismTable>> = OnceLock::new();
    MECHANISMS.get_or_init(|| RwLock::new(MechanismTable { slots: vec![Weak::new(); MECHANISMS_MAX + 1], next: 1 }))
}

/// Structural state guarded by the mechanism's access guard.
pub(crate) struct MechanismState {
    pub(crate) chunks: Vec<Arc<Chunk>>,
    chunks_by_traitmark: HashMap<Traitmark, usize>,
    pub(crate) subjects: SubjectRegistry,
    pub(crate) adjectives: Vec<Arc<Adjective>>,
    pub(crate) mechanics: Vec<Arc<Mechanic>>,
}

impl MechanismState {
    /// Chunk and row of a live subject.
    pub(crate) fn locate(&self, handle: SubjectHandle) -> ApparatusResult<(&Arc<Chunk>, usize)> {
        let info = self.subjects.expect(handle)?;
        let chunk = info
            .chunk()
            .and_then(|id| self.chunks.get(id as usize))
            .ok_or_else(|| ApparatusError::SanityCheckFailed(format!("{handle:?} has no chunk")).surfaced())?;
        Ok((chunk, info.row()))
    }

    fn flags_of(&self, handle: SubjectHandle) -> ApparatusResult<&AtomicFlagmark> {
        let (chunk, row) = self.locate(handle)?;
        Ok(chunk.slot(row)?.flagmark())
    }
}

/// Owner of subjects, chunks, caches and the deferred queue.
///
/// Created behind an `Arc`; chains and handles keep it alive or find it
/// through the process-wide table.

pub struct Mechanism {
    id: MechanismID,
    config: MechanismConfig,
    state: AccessGuard<MechanismState>,
    filter_cache: Mutex<HashMap<Filter, Vec<Weak<Chunk>>>>,
    deferreds: DeferredQueue,
    lock: LockCounter,
    applicators: AtomicUsize,
    draining: Mutex<()>,
    operatings: OperatingsCounter,
}

impl Mechanism {
    /// Creates a mechanism with the default configuration.
    pub fn new() -> ApparatusResult<Arc<Self>> {
        Self::with_config(MechanismConfig::default())
    }

    /// Creates a mechanism with `config`.
    ///
    /// ## Errors
    /// `InvalidArgument` for an invalid configuration, `OutOfLimit` when every
    /// mechanism id is taken.

    pub fn with_config(config: MechanismConfig) -> ApparatusResult<Arc<Self>> {
        config.validate()?;
        let mut table = mechanism_table().write();
        let id = (0..MECHANISMS_MAX)
            .map(|offset| 1 + (table.next - 1 + offset) % MECHANISMS_MAX)
            .find(|&id| table.slots[id].strong_count() == 0)
            .ok_or_else(|| ApparatusError::OutOfLimit { what: "mechanisms", limit: MECHANISMS_MAX }.surfaced())?;
        let mechanism_id = id as MechanismID;
        let mechanism = Arc::new(Self {
            id: mechanism_id,
            state: AccessGuard::new(
                mechanism_id,
                MechanismState {
                    chunks: Vec::new(),
                    chunks_by_traitmark: HashMap::new(),
                    subjects: SubjectRegistry::new(mechanism_id, config.max_subjects),
                    adjectives: Vec::new(),
                    mechanics: Vec::new(),
                },
            ),
            config,
            filter_cache: Mutex::new(HashMap::new()),
            deferreds: DeferredQueue::new(),
            lock: LockCounter::new(),
            applicators: AtomicUsize::new(0),
            draining: Mutex::new(()),
            operatings: OperatingsCounter::new(),
        });
        table.slots[id] = Arc::downgrade(&mechanism);
        table.next = id % MECHANISMS_MAX + 1;
        log::debug!(target: "apparatus", "created mechanism #{id}");
        Ok(mechanism)
    }

    /// Finds a live mechanism by id.
    pub fn resolve(id: MechanismID) -> Option<Arc<Mechanism>> {
        mechanism_table().read().slots.get(id as usize).and_then(Weak::upgrade)
    }

    /// Process-unique id.
    #[inline]
    pub fn id(&self) -> MechanismID {
        self.id
    }

    /// Configuration the mechanism was created with.
    #[inline]
    pub fn config(&self) -> &MechanismConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn read_state(&self) -> ApparatusResult<RwLockReadGuard<'_, MechanismState>> {
        self.state.read()
    }

    // ----- locks -----

    /// `true` while any chain holds the mechanism.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// `true` while solid chains hold the mechanism.
    #[inline]
    pub fn is_solid(&self) -> bool {
        self.lock.is_solid()
    }

    /// `true` while liquid chains hold the mechanism.
    #[inline]
    pub fn is_liquid(&self) -> bool {
        self.lock.is_liquid()
    }

    /// Takes one mechanism lock of `mode`; the caller holds the reader guard.
    pub(crate) fn acquire_lock(&self, mode: LockMode) -> ApparatusResult<i32> {
        self.lock.acquire(mode)
    }

    /// Releases one mechanism lock; the outermost release compacts and drains.
    pub(crate) fn release_lock(&self, mode: LockMode) {
        if self.lock.release(mode) == 0 {
            if let Err(error) = self.settle() {
                log::warn!(target: "apparatus", "mechanism #{} failed to settle: {error}", self.id);
            }
        }
    }

    fn settle(&self) -> Outcome {
        self.compact()?;
        if self.applicators.load(Ordering::Acquire) > 0 {
            return Ok(Status::Noop);
        }
        self.drain_deferreds(DeferredKinds::ALL)
    }

    fn compact(&self) -> ApparatusResult<usize> {
        let mut state = self.state.write()?;
        if self.lock.is_locked() {
            return Ok(0);
        }
        let MechanismState { chunks, subjects, .. } = &mut *state;
        let mut removed = 0;
        for chunk in chunks.iter().filter(|c| c.stale_count() > 0) {
            let chunk_id = chunk.id();
            // SAFETY: writer guard held, mechanism unlocked.
            removed += unsafe {
                chunk.compact(|handle, row| {
                    if let Err(error) = subjects.relocate(handle, chunk_id, row) {
                        log::warn!(target: "apparatus", "compaction lost track of {handle:?}: {error}");
                    }
                })
            }?;
        }
        Ok(removed)
    }

    /// Blocks until every asynchronous concurrent operation finished.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_for_operatings_completion(&self, timeout: Option<Duration>) -> bool {
        self.operatings.wait(timeout)
    }

    #[inline]
    pub(crate) fn operatings(&self) -> &OperatingsCounter {
        &self.operatings
    }

    // ----- chunks and caches -----

    fn obtain_chunk(&self, state: &mut MechanismState, traitmark: &Traitmark) -> ApparatusResult<Arc<Chunk>> {
        if let Some(&index) = state.chunks_by_traitmark.get(traitmark) {
            return Ok(state.chunks[index].clone());
        }
        let index = state.chunks.len();
        let chunk = Arc::new(Chunk::new(index as u32, self.id, traitmark.clone(), &self.config)?);
        for adjective in &state.adjectives {
            if let Some(lines) = adjective.lines_in(&chunk) {
                chunk.attach(AttachmentKey::Adjective(adjective.id()), lines);
            }
        }
        for mechanic in &state.mechanics {
            if let Some(lines) = mechanic.lines_in(&chunk) {
                chunk.attach(AttachmentKey::Mechanic(mechanic.id()), lines);
            }
        }
        for (filter, matching) in self.filter_cache.lock().iter_mut() {
            if filter.matches_chunk(traitmark) {
                matching.push(Arc::downgrade(&chunk));
            }
        }
        state.chunks.push(chunk.clone());
        state.chunks_by_traitmark.insert(traitmark.clone(), index);
        log::debug!(target: "apparatus", "mechanism #{} created chunk #{index} for {traitmark:?}", self.id);
        Ok(chunk)
    }

    /// Chunks whose traitmark satisfies `filter`, from the match cache.
    pub(crate) fn matching_chunks(&self, state: &MechanismState, filter: &Filter) -> Vec<Arc<Chunk>> {
        let mut cache = self.filter_cache.lock();
        if let Some(matching) = cache.get(filter) {
            return matching.iter().filter_map(Weak::upgrade).collect();
        }
        let matching: Vec<Arc<Chunk>> =
            state.chunks.iter().filter(|c| filter.matches_chunk(c.traitmark())).cloned().collect();
        log::debug!(target: "apparatus", "filter cache filled with {} chunks for {filter:?}", matching.len());
        cache.insert(filter.clone(), matching.iter().map(Arc::downgrade).collect());
        matching
    }

    /// Number of chunks.
    pub fn chunks_count(&self) -> usize {
        self.state.read().map(|s| s.chunks.len()).unwrap_or(0)
    }

    /// Number of live subjects, including those pending a deferred despawn.
    pub fn subjects_count(&self) -> usize {
        self.state.read().map(|s| s.subjects.live()).unwrap_or(0)
    }

    /// Handles of every live subject, in slot order.
    pub fn subjects(&self) -> ApparatusResult<Vec<SubjectHandle>> {
        Ok(self.state.read()?.subjects.live_handles().collect())
    }

    /// Number of subjects a chain over `filter` would visit right now.
    pub fn count(&self, filter: &Filter) -> ApparatusResult<usize> {
        let state = self.state.read()?;
        Ok(self.matching_chunks(&state, filter).iter().map(|chunk| chunk.begin(filter, 0).count()).sum())
    }

    /// Rows of the chunk holding `handle`, stale rows excluded.
    pub fn chunk_population(&self, handle: SubjectHandle) -> ApparatusResult<usize> {
        let state = self.state.read()?;
        Ok(state.locate(handle)?.0.live_len())
    }

    /// Number of deferred entries waiting for a drain.
    pub fn pending_deferreds(&self) -> usize {
        self.deferreds.len()
    }

    // ----- spawning -----

    fn place(
        &self,
        state: &mut MechanismState,
        traitmark: &Traitmark,
        flagmark: Flagmark,
        values: &[TraitValue],
    ) -> ApparatusResult<SubjectHandle> {
        let handle = state.subjects.reserve()?;
        self.place_reserved(state, handle, traitmark, flagmark, values)?;
        Ok(handle)
    }

    /// Places the subject of a reserved handle; the reservation is dropped
    /// on failure.
    fn place_reserved(
        &self,
        state: &mut MechanismState,
        handle: SubjectHandle,
        traitmark: &Traitmark,
        flagmark: Flagmark,
        values: &[TraitValue],
    ) -> ApparatusResult<()> {
        if !state.subjects.is_reserved(handle) {
            return Err(ApparatusError::StaleSubject(handle.raw()));
        }
        let placed = self.obtain_chunk(state, traitmark).and_then(|chunk| {
            // SAFETY: writer guard held; callers rejected solid mechanisms.
            let row = unsafe { chunk.reserve_row(handle, flagmark & Flagmark::USER_SETTABLE) }?;
            unsafe { chunk.write_values(row, values) }?;
            Ok((chunk, row))
        });
        match placed {
            Ok((chunk, row)) => {
                state.subjects.occupy(handle, chunk.id(), row)?;
                log::trace!(target: "apparatus", "spawned {handle:?} in chunk #{}", chunk.id());
                Ok(())
            }
            Err(error) => {
                state.subjects.release(handle);
                Err(error)
            }
        }
    }

    fn spawn_values(&self, traitmark: &Traitmark, flagmark: Flagmark, values: &[TraitValue]) -> ApparatusResult<SubjectHandle> {
        let handle = {
            let mut state = self.state.write()?;
            if self.lock.is_solid() {
                let handle = state.subjects.reserve()?;
                drop(state);
                self.deferreds.push(DeferredEntry::SpawnReserved(handle, traitmark.clone(), flagmark, values.to_vec()));
                log::trace!(target: "apparatus", "queued spawn of {handle:?}");
                return Ok(handle);
            }
            self.place(&mut state, traitmark, flagmark, values)?
        };
        self.run_adjectives(handle);
        Ok(handle)
    }

    fn run_adjectives(&self, handle: SubjectHandle) {
        if let Err(error) = adjective::evaluate(self, handle) {
            report_error(error.status(), &format!("adjectives failed on {handle:?}: {error}"));
        }
    }

    /// Spawns a subject with default-initialised traits of `traitmark`.
    ///
    /// Protected flags in `flagmark` are dropped. While the mechanism is
    /// solid the spawn is queued: the handle is issued right away and
    /// validates once the drain places the subject.
    ///
    /// Adjective failures go to the error sink; the spawn itself stands.
    ///
    /// ## Errors
    /// `OutOfLimit` when the registry is full.

    pub fn spawn_subject(&self, traitmark: &Traitmark, flagmark: Flagmark) -> ApparatusResult<SubjectHandle> {
        self.spawn_values(traitmark, flagmark, &[])
    }

    /// [`Mechanism::spawn_subject`] under a compile-time selected call style.
    pub fn spawn_subject_as<P: Paradigm>(&self, traitmark: &Traitmark, flagmark: Flagmark) -> P::Output<SubjectHandle> {
        P::deliver(self.spawn_subject(traitmark, flagmark))
    }

    /// Spawns a subject carrying the values of a trait tuple.
    pub fn spawn_with<B: TraitBundle>(&self, bundle: B) -> ApparatusResult<SubjectHandle> {
        let values = bundle.into_trait_values();
        let traitmark = Traitmark::from_infos(values.iter().map(TraitValue::info));
        if traitmark.len() != values.len() {
            return Err(ApparatusError::InvalidArgument("bundle repeats a trait type".into()).surfaced());
        }
        self.spawn_values(&traitmark, Flagmark::NONE, &values)
    }

    /// Spawns a subject from a record.
    pub fn spawn_subject_record(&self, record: &SubjectRecord) -> ApparatusResult<SubjectHandle> {
        self.spawn_values(record.traitmark(), record.flagmark(), record.values())
    }

    /// Queues a spawn from a record.
    ///
    /// Returns `Deferred`; the subject appears at the next drain, which runs
    /// right away if the mechanism is unlocked.
    pub fn spawn_subject_deferred(&self, record: SubjectRecord) -> Outcome {
        self.enqueue(DeferredEntry::SpawnSubject(record))
    }

    fn enqueue(&self, entry: DeferredEntry) -> Outcome {
        self.deferreds.push(entry);
        if !self.lock.is_locked() && self.applicators.load(Ordering::Acquire) == 0 {
            self.drain_deferreds(DeferredKinds::ALL)?;
        }
        Ok(Status::Deferred)
    }

    // ----- despawning -----

    /// `true` while `handle` refers to a live subject of this mechanism.
    pub fn is_valid(&self, handle: SubjectHandle) -> bool {
        self.state.read().is_ok_and(|state| state.subjects.resolve(handle).is_some())
    }

    /// Despawns a subject.
    ///
    /// ## Behavior
    /// - Solid: flags the subject `DEFERRED_DESPAWN` and queues the despawn
    ///   (`Deferred`); a second request is a `Noop`.
    /// - Otherwise the subject's row is released and its handle invalidated.

    pub fn despawn(&self, handle: SubjectHandle) -> Outcome {
        let mut state = self.state.write()?;
        if self.lock.is_solid() {
            if state.flags_of(handle)?.set_flag(Flagmark::DEFERRED_DESPAWN, true) {
                return Ok(Status::Noop);
            }
            drop(state);
            self.deferreds.push(DeferredEntry::DespawnSubject(handle));
            return Ok(Status::Deferred);
        }
        let (chunk, row) = state.locate(handle).map(|(c, r)| (c.clone(), r))?;
        // SAFETY: writer guard held, mechanism not solid.
        if let Some((moved, moved_row)) = unsafe { chunk.release_row(row, true) }? {
            state.subjects.relocate(moved, chunk.id(), moved_row)?;
        }
        state.subjects.release(handle);
        log::trace!(target: "apparatus", "despawned {handle:?}");
        Ok(Status::Success)
    }

    /// Queues a despawn regardless of the lock state.
    pub fn despawn_deferred(&self, handle: SubjectHandle) -> Outcome {
        {
            let state = self.state.read()?;
            if state.flags_of(handle)?.set_flag(Flagmark::DEFERRED_DESPAWN, true) {
                return Ok(Status::Noop);
            }
        }
        self.enqueue(DeferredEntry::DespawnSubject(handle))
    }

    /// Despawns every subject and invalidates every handle.
    ///
    /// Chunks, caches and pending deferred entries are kept.
    ///
    /// ## Errors
    /// `InvalidState` while any lock is held.

    pub fn despawn_all(&self) -> Outcome {
        let mut state = self.state.write()?;
        self.ensure_unlocked("despawn_all")?;
        if state.subjects.live() == 0 {
            return Ok(Status::Noop);
        }
        for chunk in &state.chunks {
            // SAFETY: writer guard held, mechanism unlocked.
            unsafe { chunk.clear(self.config.chunk_initial_capacity) }?;
        }
        state.subjects.release_all();
        log::debug!(target: "apparatus", "mechanism #{} despawned every subject", self.id);
        Ok(Status::Success)
    }

    /// Returns the mechanism to its freshly created state.
    ///
    /// Subjects, chunks, caches and pending deferred entries are dropped;
    /// every handle becomes invalid. Adjectives and mechanics stay bound.
    ///
    /// ## Errors
    /// `InvalidState` while any lock is held.

    pub fn reset(&self) -> Outcome {
        let mut state = self.state.write()?;
        self.ensure_unlocked("reset")?;
        state.chunks.clear();
        state.chunks_by_traitmark.clear();
        state.subjects.release_all();
        self.filter_cache.lock().clear();
        let dropped = self.deferreds.clear();
        log::debug!(
            target: "apparatus",
            "mechanism #{} reset ({} slots kept, {dropped} deferred entries dropped)",
            self.id,
            state.subjects.slots()
        );
        Ok(Status::Success)
    }

    fn ensure_unlocked(&self, operation: &str) -> ApparatusResult<()> {
        match self.lock.depth() {
            0 => Ok(()),
            depth => Err(ApparatusError::InvalidState(format!("{operation} while locked (depth {depth})")).surfaced()),
        }
    }

    // ----- traits -----

    fn migrate(&self, state: &mut MechanismState, handle: SubjectHandle, traitmark: &Traitmark) -> ApparatusResult<(Arc<Chunk>, usize)> {
        let (source, source_row) = state.locate(handle).map(|(c, r)| (c.clone(), r))?;
        if source.traitmark() == traitmark {
            return Ok((source, source_row));
        }
        let target = self.obtain_chunk(state, traitmark)?;
        let flagmark = source.slot(source_row)?.flagmark().get();
        // SAFETY: writer guard held, mechanism not solid, chunks are distinct.
        let row = unsafe { target.reserve_row(handle, flagmark) }?;
        unsafe { target.copy_shared_from(row, &source, source_row) }?;
        if let Some((moved, moved_row)) = unsafe { source.release_row(source_row, false) }? {
            state.subjects.relocate(moved, source.id(), moved_row)?;
        }
        state.subjects.relocate(handle, target.id(), row)?;
        log::trace!(target: "apparatus", "migrated {handle:?} from chunk #{} to #{}", source.id(), target.id());
        Ok((target, row))
    }

    /// Writes trait `T`, adding it (and migrating the subject) if absent.
    ///
    /// Returns `Deferred` while the mechanism is solid.
    pub fn set_trait<T: Trait>(&self, handle: SubjectHandle, value: T) -> Outcome {
        let info = trait_info::<T>();
        let mut state = self.state.write()?;
        if self.lock.is_solid() {
            state.subjects.expect(handle)?;
            drop(state);
            self.deferreds.push(DeferredEntry::SetTrait(handle, TraitValue::new(value)));
            return Ok(Status::Deferred);
        }
        let (chunk, row) = state.locate(handle).map(|(c, r)| (c.clone(), r))?;
        let (chunk, row) = if chunk.traitmark().contains_id(info.id()) {
            (chunk, row)
        } else {
            let traitmark = chunk.traitmark().clone().with::<T>();
            self.migrate(&mut state, handle, &traitmark)?
        };
        let at = chunk.trait_ptr(row, info)?;
        // SAFETY: `at` is an initialised `T` cell; the writer guard is held.
        unsafe { *at.cast::<T>() = value };
        Ok(Status::Success)
    }

    /// Type-erased [`Mechanism::set_trait`].
    pub fn set_trait_value(&self, handle: SubjectHandle, value: TraitValue) -> Outcome {
        let mut state = self.state.write()?;
        if self.lock.is_solid() {
            state.subjects.expect(handle)?;
            drop(state);
            self.deferreds.push(DeferredEntry::SetTrait(handle, value));
            return Ok(Status::Deferred);
        }
        let (chunk, _) = state.locate(handle)?;
        let traitmark = chunk.traitmark().union(&Traitmark::from_infos([value.info()]));
        let (chunk, row) = self.migrate(&mut state, handle, &traitmark)?;
        // SAFETY: writer guard held.
        unsafe { chunk.write_values(row, std::slice::from_ref(&value)) }?;
        Ok(Status::Success)
    }

    /// Queues a trait write regardless of the lock state.
    pub fn set_trait_deferred<T: Trait>(&self, handle: SubjectHandle, value: T) -> Outcome {
        self.state.read()?.subjects.expect(handle)?;
        self.enqueue(DeferredEntry::SetTrait(handle, TraitValue::new(value)))
    }

    /// Clone of trait `T`.
    ///
    /// ## Errors
    /// `Missing` if the subject is gone or lacks `T`.
    pub fn get_trait<T: Trait>(&self, handle: SubjectHandle) -> ApparatusResult<T> {
        let state = self.state.read()?;
        let (chunk, row) = state.locate(handle)?;
        chunk.read::<T>(row)
    }

    /// `true` if the subject carries `T`.
    pub fn has_trait<T: Trait>(&self, handle: SubjectHandle) -> ApparatusResult<bool> {
        let state = self.state.read()?;
        Ok(state.locate(handle)?.0.traitmark().contains::<T>())
    }

    /// Adds a default `T` if absent.
    ///
    /// While the mechanism is solid the request is queued unconditionally
    /// and the `Noop` check happens at the drain.
    pub fn obtain_trait<T: Trait>(&self, handle: SubjectHandle) -> Outcome {
        self.obtain_trait_info(handle, trait_info::<T>())
    }

    /// Type-erased [`Mechanism::obtain_trait`].
    pub fn obtain_trait_info(&self, handle: SubjectHandle, info: &'static TraitInfo) -> Outcome {
        let mut state = self.state.write()?;
        let traitmark = state.locate(handle)?.0.traitmark().clone();
        if self.lock.is_solid() {
            drop(state);
            self.deferreds.push(DeferredEntry::ObtainTrait(handle, info));
            return Ok(Status::Deferred);
        }
        if traitmark.contains_id(info.id()) {
            return Ok(Status::Noop);
        }
        self.migrate(&mut state, handle, &traitmark.union(&Traitmark::from_infos([info])))?;
        Ok(Status::Success)
    }

    /// Queues adding a default `T`.
    pub fn obtain_trait_deferred<T: Trait>(&self, handle: SubjectHandle) -> Outcome {
        self.state.read()?.subjects.expect(handle)?;
        self.enqueue(DeferredEntry::ObtainTrait(handle, trait_info::<T>()))
    }

    /// Removes `T`; `Noop` if absent.
    pub fn remove_trait<T: Trait>(&self, handle: SubjectHandle) -> Outcome {
        self.remove_trait_info(handle, trait_info::<T>())
    }

    /// Type-erased [`Mechanism::remove_trait`].
    pub fn remove_trait_info(&self, handle: SubjectHandle, info: &'static TraitInfo) -> Outcome {
        let mut state = self.state.write()?;
        let mut traitmark = state.locate(handle)?.0.traitmark().clone();
        if self.lock.is_solid() {
            drop(state);
            self.deferreds.push(DeferredEntry::RemoveTrait(handle, info));
            return Ok(Status::Deferred);
        }
        if traitmark.remove_info(info) == Status::Noop {
            return Ok(Status::Noop);
        }
        self.migrate(&mut state, handle, &traitmark)?;
        Ok(Status::Success)
    }

    /// Queues removing `T`.
    pub fn remove_trait_deferred<T: Trait>(&self, handle: SubjectHandle) -> Outcome {
        self.state.read()?.subjects.expect(handle)?;
        self.enqueue(DeferredEntry::RemoveTrait(handle, trait_info::<T>()))
    }

    /// Removes every trait; the subject stays alive with an empty traitmark.
    pub fn remove_all_traits(&self, handle: SubjectHandle) -> Outcome {
        let mut state = self.state.write()?;
        let empty = state.locate(handle)?.0.traitmark().is_empty();
        if self.lock.is_solid() {
            drop(state);
            self.deferreds.push(DeferredEntry::RemoveAllTraits(handle));
            return Ok(Status::Deferred);
        }
        if empty {
            return Ok(Status::Noop);
        }
        self.migrate(&mut state, handle, &Traitmark::new())?;
        Ok(Status::Success)
    }

    /// Exchanges the trait values two subjects share.
    ///
    /// With `clear_missing`, traits only one of them carries are reset to
    /// their defaults. Traitmarks do not change.
    ///
    /// ## Errors
    /// `InvalidState` while the mechanism is solid.

    pub fn swap_traits(&self, first: SubjectHandle, second: SubjectHandle, clear_missing: bool) -> Outcome {
        let state = self.state.write()?;
        if self.lock.is_solid() {
            return Err(ApparatusError::InvalidState("swap_traits on a solid mechanism".into()).surfaced());
        }
        let (a, a_row) = state.locate(first)?;
        let (b, b_row) = state.locate(second)?;
        if first == second {
            return Ok(Status::Noop);
        }
        // SAFETY: writer guard held.
        unsafe { a.swap_traits(a_row, b, b_row, clear_missing) }?;
        Ok(Status::Success)
    }

    /// Current fingerprint of a subject.
    pub fn fingerprint(&self, handle: SubjectHandle) -> ApparatusResult<Fingerprint> {
        let state = self.state.read()?;
        let (chunk, row) = state.locate(handle)?;
        let mut fingerprint = Fingerprint::new();
        *fingerprint.traitmark_mut() = chunk.traitmark().clone();
        fingerprint.set_flagmark(chunk.slot(row)?.flagmark().get());
        Ok(fingerprint)
    }

    /// Snapshot of a subject as a record.
    ///
    /// Only user-settable flags are captured.
    pub fn record_of(&self, handle: SubjectHandle) -> ApparatusResult<SubjectRecord> {
        let state = self.state.read()?;
        let (chunk, row) = state.locate(handle)?;
        let flagmark = chunk.slot(row)?.flagmark().get() & Flagmark::USER_SETTABLE;
        SubjectRecord::from_values(chunk.snapshot_row(row)?, flagmark)
    }

    // ----- flags -----

    /// Current flagmark.
    pub fn flagmark(&self, handle: SubjectHandle) -> ApparatusResult<Flagmark> {
        Ok(self.state.read()?.flags_of(handle)?.get())
    }

    /// Replaces the user-settable flags; returns the previous flagmark.
    ///
    /// ## Errors
    /// `NoPermission` if `flagmark` contains a protected or undefined flag.
    pub fn set_flagmark(&self, handle: SubjectHandle, flagmark: Flagmark) -> ApparatusResult<Flagmark> {
        flagmark.ensure_user_settable()?;
        Ok(self.state.read()?.flags_of(handle)?.set_masked(flagmark, Flagmark::USER_SETTABLE))
    }

    /// Overwrites the flags selected by `mask`; returns the previous flagmark.
    pub fn set_flagmark_masked(&self, handle: SubjectHandle, flagmark: Flagmark, mask: Flagmark) -> ApparatusResult<Flagmark> {
        mask.ensure_user_settable()?;
        Ok(self.state.read()?.flags_of(handle)?.set_masked(flagmark, mask))
    }

    /// `true` if every flag in `flag` is set.
    pub fn has_flag(&self, handle: SubjectHandle, flag: Flagmark) -> ApparatusResult<bool> {
        Ok(self.state.read()?.flags_of(handle)?.has(flag))
    }

    /// Sets or clears `flag`; returns its previous state.
    pub fn set_flag(&self, handle: SubjectHandle, flag: Flagmark, state: bool) -> ApparatusResult<bool> {
        flag.ensure_user_settable()?;
        Ok(self.state.read()?.flags_of(handle)?.set_flag(flag, state))
    }

    /// Flips `flag`; returns its previous state.
    pub fn toggle_flag(&self, handle: SubjectHandle, flag: Flagmark) -> ApparatusResult<bool> {
        flag.ensure_user_settable()?;
        Ok(self.state.read()?.flags_of(handle)?.toggle_flag(flag))
    }

    // ----- chains -----

    /// Liquid chain over the subjects matching `filter`.
    pub fn enchain(self: &Arc<Self>, filter: Filter) -> ApparatusResult<Chain> {
        Chain::new(self.clone(), filter)
    }

    /// Solid chain over the subjects matching `filter`.
    pub fn enchain_solid(self: &Arc<Self>, filter: Filter) -> ApparatusResult<SolidChain> {
        SolidChain::new(self.clone(), filter)
    }

    // ----- deferred queue -----

    /// Opens an explicit drain scope for `kinds`.
    pub fn create_deferreds_applicator(&self, kinds: DeferredKinds) -> DeferredsApplicator<'_> {
        DeferredsApplicator::new(self, kinds)
    }

    pub(crate) fn enter_applicator(&self) {
        self.applicators.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave_applicator(&self) {
        self.applicators.fetch_sub(1, Ordering::AcqRel);
    }

    /// Applies every pending deferred entry.
    pub fn apply_deferreds(&self) -> Outcome {
        self.drain_deferreds(DeferredKinds::ALL)
    }

    /// Applies pending entries of `kinds` in FIFO order.
    ///
    /// Stops early if the mechanism turns solid. A nested call on a thread
    /// that is already draining returns `Noop`.
    pub(crate) fn drain_deferreds(&self, kinds: DeferredKinds) -> Outcome {
        if self.lock.is_solid() {
            return Err(ApparatusError::InvalidState("draining deferreds of a solid mechanism".into()).surfaced());
        }
        let Some(_draining) = self.draining.try_lock() else {
            return Ok(Status::Noop);
        };
        let mut outcome = Ok(Status::Noop);
        let mut applied = 0usize;
        while !self.lock.is_solid() {
            let Some(entry) = self.deferreds.pop_matching(kinds) else { break };
            outcome = combine_outcomes(outcome, self.apply_entry(entry));
            applied += 1;
        }
        if applied > 0 {
            log::debug!(target: "apparatus", "mechanism #{} applied {applied} deferred entries", self.id);
        }
        outcome
    }

    fn lost_target(&self, entry: &DeferredEntry, target: SubjectHandle) -> Outcome {
        match self.config.missing_target_policy {
            MissingTargetPolicy::Ignore => Ok(Status::Noop),
            MissingTargetPolicy::Report => {
                log::warn!(target: "apparatus", "deferred {entry:?} lost its target");
                Err(ApparatusError::StaleSubject(target.raw()))
            }
        }
    }

    fn apply_entry(&self, entry: DeferredEntry) -> Outcome {
        if let Some(target) = entry.target() {
            if !self.is_valid(target) {
                return self.lost_target(&entry, target);
            }
        }
        match entry {
            DeferredEntry::SpawnSubject(record) => self.spawn_subject_record(&record).map(|_| Status::Success),
            DeferredEntry::SpawnReserved(handle, traitmark, flagmark, values) => {
                let mut state = self.state.write()?;
                if !state.subjects.is_reserved(handle) {
                    drop(state);
                    let entry = DeferredEntry::SpawnReserved(handle, traitmark, flagmark, values);
                    return self.lost_target(&entry, handle);
                }
                if self.lock.is_solid() {
                    drop(state);
                    self.deferreds.push(DeferredEntry::SpawnReserved(handle, traitmark, flagmark, values));
                    return Ok(Status::Deferred);
                }
                self.place_reserved(&mut state, handle, &traitmark, flagmark, &values)?;
                drop(state);
                self.run_adjectives(handle);
                Ok(Status::Success)
            }
            DeferredEntry::DespawnSubject(handle) => self.despawn(handle),
            DeferredEntry::SetTrait(handle, value) => self.set_trait_value(handle, value),
            DeferredEntry::ObtainTrait(handle, info) => self.obtain_trait_info(handle, info),
            DeferredEntry::RemoveTrait(handle, info) => self.remove_trait_info(handle, info),
            DeferredEntry::RemoveAllTraits(handle) => self.remove_all_traits(handle),
        }
    }

    // ----- adjectives and mechanics -----

    /// Binds an adjective: `handler` runs on every subject spawned into a
    /// chunk matching `filter` whose flags also match.
    ///
    /// Existing subjects are not visited.
    pub fn add_adjective<F, R>(&self, filter: Filter, handler: F) -> ApparatusResult<AdjectiveID>
    where
        F: Fn(&mut ChainRow<'_>) -> R + Send + Sync + 'static,
        R: IntoOutcome,
    {
        let mut state = self.state.write()?;
        let id = state.adjectives.len() as AdjectiveID;
        let adjective = Arc::new(Adjective::new(id, filter, move |row: &mut ChainRow<'_>| handler(row).into_outcome()));
        for chunk in &state.chunks {
            if let Some(lines) = adjective.lines_in(chunk) {
                chunk.attach(AttachmentKey::Adjective(id), lines);
            }
        }
        state.adjectives.push(adjective);
        Ok(id)
    }

    /// Binds a mechanic: a solid handler run concurrently over the subjects
    /// matching `filter` by [`Mechanism::run_mechanic`].
    pub fn add_mechanic<F, R>(&self, filter: Filter, handler: F) -> ApparatusResult<AdjectiveID>
    where
        F: Fn(&SolidChainRow<'_>) -> R + Send + Sync + 'static,
        R: IntoOutcome,
    {
        let mut state = self.state.write()?;
        let id = state.mechanics.len() as AdjectiveID;
        let mechanic = Arc::new(Mechanic::new(id, filter, move |row: &SolidChainRow<'_>| handler(row).into_outcome()));
        for chunk in &state.chunks {
            if let Some(lines) = mechanic.lines_in(chunk) {
                chunk.attach(AttachmentKey::Mechanic(id), lines);
            }
        }
        state.mechanics.push(mechanic);
        Ok(id)
    }

    /// Runs mechanic `id` over its matching subjects.
    pub fn run_mechanic(self: &Arc<Self>, id: AdjectiveID) -> Outcome {
        adjective::run_mechanic(self, id)
    }
}

impl fmt::Debug for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mechanism")
            .field("id", &self.id)
            .field("lock", &self.lock.depth())
            .field("deferreds", &self.deferreds)
            .finish()
    }
}

impl Drop for Mechanism {
    fn drop(&mut self) {
        log::debug!(target: "apparatus", "dropped mechanism #{}", self.id);
    }
}
