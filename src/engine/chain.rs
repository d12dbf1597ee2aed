//! # Chains
//!
//! A chain is an iteration plan over the chunks matching a filter: for each
//! chunk, a lock, the row count at lock time and the column lines of the
//! filter's include traitmark.
//!
//! ## Modes
//!
//! * [`Chain`] locks **liquid**. Functors get a [`ChainRow`] with mutable
//!   trait access and may change structure; removals leave stale rows, and
//!   appended rows are not visited in the same pass. Each row is fetched under
//!   a brief reader guard; the functor runs with no guard held.
//! * [`SolidChain`] locks **solid**. Structure is frozen, so rows are fetched
//!   without any guard, and the chain may be operated on many threads at once.
//!   Functors get a [`SolidChainRow`] with read-only trait access; flags stay
//!   atomically writable and structural requests are queued.
//!
//! ## Disposal
//!
//! Dropping a chain unlocks its chunks in reverse order and then the
//! mechanism. The outermost unlock compacts stale rows and drains the
//! deferred queue.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;

use crate::engine::chunk::{AttachmentKey, Chunk};
use crate::engine::error::{combine_outcomes, report_error, ApparatusError, ApparatusResult, IntoOutcome, Outcome, Status};
use crate::engine::filter::Filter;
use crate::engine::flagmark::{AtomicFlagmark, Flagmark};
use crate::engine::lock::LockMode;
use crate::engine::mechanism::{Mechanism, MechanismState};
use crate::engine::registry::{trait_info, Trait};
use crate::engine::subject::{SolidSubjectHandle, SubjectHandle};
use crate::engine::traitmark::Traitmark;
use crate::engine::types::AdjectiveID;


struct Segment {
    chunk: Arc<Chunk>,
    end: usize,
    lines: Arc<[usize]>,
}

/// Locked snapshot shared by both chain kinds.
struct ChainCore {
    mechanism: Arc<Mechanism>,
    filter: Filter,
    mode: LockMode,
    segments: Vec<Segment>,
}

impl ChainCore {
    fn new(
        mechanism: Arc<Mechanism>,
        filter: Filter,
        mode: LockMode,
        lines: impl Fn(&Chunk, &Filter) -> Option<Arc<[usize]>>,
    ) -> ApparatusResult<Self> {
        let state = mechanism.read_state()?;
        mechanism.acquire_lock(mode)?;
        let mut core = ChainCore { mechanism: mechanism.clone(), filter, mode, segments: Vec::new() };
        let locked = core.lock_chunks(&state, lines);
        // The reader guard must go before `core` can unlock on failure.
        drop(state);
        locked.map(|()| core)
    }

    fn lock_chunks(
        &mut self,
        state: &MechanismState,
        lines: impl Fn(&Chunk, &Filter) -> Option<Arc<[usize]>>,
    ) -> ApparatusResult<()> {
        for chunk in self.mechanism.matching_chunks(state, &self.filter) {
            let Some(chunk_lines) = lines(&chunk, &self.filter) else {
                continue;
            };
            chunk.acquire(self.mode)?;
            self.segments.push(Segment { end: chunk.len(), chunk, lines: chunk_lines });
        }
        Ok(())
    }

    fn iterable_count(&self) -> usize {
        self.segments.iter().map(|s| s.end).sum()
    }

    fn guarded(&self) -> bool {
        self.mode == LockMode::Liquid
    }

    /// Next visitable row at or after `(segment, row)`.
    fn advance(&self, mut segment: usize, mut row: usize) -> Option<(usize, usize)> {
        while let Some(current) = self.segments.get(segment) {
            if let Some(found) = current.chunk.next_row(&self.filter, row, current.end) {
                return Some((segment, found));
            }
            segment += 1;
            row = 0;
        }
        None
    }

    /// Runs `visit` over every visitable row in order.
    ///
    /// `visit` receives the segment, the row, its handle and cell pointers.
    /// Stops at the first failure.
    fn walk(&self, mut visit: impl FnMut(&Segment, usize, SubjectHandle, &[*mut u8]) -> Outcome) -> Outcome {
        let mut ptrs = Vec::new();
        let mut outcome = Ok(Status::Noop);
        let mut visited = 0usize;
        let mut cursor = (0, 0);
        loop {
            let fetched = {
                let _state = if self.guarded() { Some(self.mechanism.read_state()?) } else { None };
                match self.advance(cursor.0, cursor.1) {
                    Some((segment, row)) => {
                        let current = &self.segments[segment];
                        current.chunk.row_ptrs(row, &current.lines, &mut ptrs)?;
                        Some((segment, row, current.chunk.slot(row)?.handle()))
                    }
                    None => None,
                }
            };
            let Some((segment, row, handle)) = fetched else { break };
            cursor = (segment, row + 1);
            visited += 1;
            outcome = combine_outcomes(outcome, visit(&self.segments[segment], row, handle, &ptrs));
            if outcome.is_err() {
                return outcome;
            }
        }
        if visited == 0 {
            return Ok(Status::NoItems);
        }
        outcome
    }

    /// Splits the iterable rows into contiguous ranges of at least
    /// `min_rows`, at most `threads` of them.
    fn partitions(&self, threads: usize, min_rows: usize) -> Vec<Vec<(usize, usize, usize)>> {
        let total = self.iterable_count();
        if total == 0 {
            return Vec::new();
        }
        let per = total.div_ceil(threads.max(1)).max(min_rows.max(1));
        let mut partitions = Vec::new();
        let mut current = Vec::new();
        let mut room = per;
        for (index, segment) in self.segments.iter().enumerate() {
            let mut start = 0;
            while start < segment.end {
                let take = room.min(segment.end - start);
                current.push((index, start, start + take));
                start += take;
                room -= take;
                if room == 0 {
                    partitions.push(std::mem::take(&mut current));
                    room = per;
                }
            }
        }
        if !current.is_empty() {
            partitions.push(current);
        }
        partitions
    }

    /// Runs `visit` over the visitable rows of one partition.
    ///
    /// Returns the combined outcome and the number of rows visited.
    fn run_partition(
        &self,
        ranges: &[(usize, usize, usize)],
        visit: &impl Fn(&SolidChainRow<'_>) -> Outcome,
    ) -> ApparatusResult<(Status, usize)> {
        let mut ptrs = Vec::new();
        let mut status = Status::Noop;
        let mut visited = 0;
        for &(index, start, end) in ranges {
            let segment = &self.segments[index];
            let mut row = start;
            while let Some(found) = segment.chunk.next_row(&self.filter, row, end) {
                segment.chunk.row_ptrs(found, &segment.lines, &mut ptrs)?;
                let view = self.view(segment, found, segment.chunk.slot(found)?.handle(), &ptrs);
                status = status.combine(visit(&SolidChainRow { view })?);
                visited += 1;
                row = found + 1;
            }
        }
        Ok((status, visited))
    }

    fn view<'a>(&'a self, segment: &'a Segment, row: usize, handle: SubjectHandle, ptrs: &'a [*mut u8]) -> RowView<'a> {
        RowView {
            mechanism: &self.mechanism,
            chunk: &segment.chunk,
            include: self.filter.include_traitmark(),
            row,
            handle,
            ptrs,
            guarded: self.guarded(),
        }
    }

    fn handles(&self) -> Handles<'_> {
        Handles { core: self, cursor: (0, 0) }
    }
}

impl Drop for ChainCore {
    fn drop(&mut self) {
        for segment in self.segments.iter().rev() {
            segment.chunk.release(self.mode);
        }
        self.mechanism.release_lock(self.mode);
    }
}


/// Liquid chain over the subjects matching a filter.
pub struct Chain {
    core: ChainCore,
}

impl Chain {
    pub(crate) fn new(mechanism: Arc<Mechanism>, filter: Filter) -> ApparatusResult<Self> {
        let core = ChainCore::new(mechanism, filter, LockMode::Liquid, |chunk, filter| {
            chunk.lines_for(filter.include_traitmark())
        })?;
        Ok(Self { core })
    }

    /// Re-targets the chain at `filter`.
    ///
    /// The new chunks are locked before the old ones are released.
    pub fn enchain(&mut self, filter: Filter) -> Outcome {
        let fresh = Chain::new(self.core.mechanism.clone(), filter)?;
        self.core = fresh.core;
        Ok(Status::Success)
    }

    /// Calls `f` once per visitable row, in chunk then row order.
    ///
    /// ## Behavior
    /// - Returns `NoItems` if nothing was visited.
    /// - Stops at the first failure and returns it.
    /// - Otherwise combines every row's outcome.

    pub fn operate<F, R>(&self, mut f: F) -> Outcome
    where
        F: FnMut(&mut ChainRow<'_>) -> R,
        R: IntoOutcome,
    {
        let core = &self.core;
        core.walk(|segment, row, handle, ptrs| f(&mut ChainRow { view: core.view(segment, row, handle, ptrs) }).into_outcome())
    }

    /// Handles of the visitable rows.
    pub fn iter(&self) -> Handles<'_> {
        self.core.handles()
    }

    /// Filter the chain was built from.
    pub fn filter(&self) -> &Filter {
        &self.core.filter
    }

    /// Number of locked chunks.
    pub fn chunks_count(&self) -> usize {
        self.core.segments.len()
    }

    /// Rows in the locked range, stale ones included.
    pub fn iterable_count(&self) -> usize {
        self.core.iterable_count()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("filter", &self.core.filter).field("chunks", &self.chunks_count()).finish()
    }
}


/// Solid chain over the subjects matching a filter.
pub struct SolidChain {
    core: ChainCore,
}

impl SolidChain {
    pub(crate) fn new(mechanism: Arc<Mechanism>, filter: Filter) -> ApparatusResult<Self> {
        let core = ChainCore::new(mechanism, filter, LockMode::Solid, |chunk, filter| {
            chunk.lines_for(filter.include_traitmark())
        })?;
        Ok(Self { core })
    }

    /// Solid chain reusing the line mappings cached for mechanic `id`.
    pub(crate) fn for_mechanic(mechanism: Arc<Mechanism>, filter: Filter, id: AdjectiveID) -> ApparatusResult<Self> {
        let core = ChainCore::new(mechanism, filter, LockMode::Solid, |chunk, _| {
            chunk.attached_lines(AttachmentKey::Mechanic(id))
        })?;
        Ok(Self { core })
    }

    /// Re-targets the chain at `filter`.
    pub fn enchain(&mut self, filter: Filter) -> Outcome {
        let fresh = SolidChain::new(self.core.mechanism.clone(), filter)?;
        self.core = fresh.core;
        Ok(Status::Success)
    }

    /// Calls `f` once per visitable row on the current thread.
    pub fn operate<F, R>(&self, mut f: F) -> Outcome
    where
        F: FnMut(&SolidChainRow<'_>) -> R,
        R: IntoOutcome,
    {
        let core = &self.core;
        core.walk(|segment, row, handle, ptrs| f(&SolidChainRow { view: core.view(segment, row, handle, ptrs) }).into_outcome())
    }

    /// Calls `f` once per visitable row on the rayon pool and waits.
    ///
    /// ## Behavior
    /// - Rows are split into at most `max_threads` contiguous ranges of at
    ///   least `min_rows_per_thread` rows; `max_threads == 0` uses the
    ///   mechanism's configured cap.
    /// - No order holds between ranges.
    /// - Ranges run to completion; the first failure in range order is
    ///   returned.

    pub fn operate_concurrently<F, R>(&self, f: F, max_threads: usize, min_rows_per_thread: usize) -> Outcome
    where
        F: Fn(&SolidChainRow<'_>) -> R + Sync + Send,
        R: IntoOutcome,
    {
        let partitions = self.partitions(max_threads, min_rows_per_thread);
        let visit = |row: &SolidChainRow<'_>| f(row).into_outcome();
        let results: Vec<ApparatusResult<(Status, usize)>> =
            partitions.par_iter().map(|ranges| self.core.run_partition(ranges, &visit)).collect();
        let mut outcome = Ok(Status::Noop);
        let mut visited = 0;
        for result in results {
            outcome = combine_outcomes(outcome, result.map(|(status, count)| {
                visited += count;
                status
            }));
        }
        match outcome {
            Ok(_) if visited == 0 => Ok(Status::NoItems),
            other => other,
        }
    }

    /// Starts [`SolidChain::operate_concurrently`] without waiting.
    ///
    /// Returns `Deferred` once the work is queued, or `NoItems` if there is
    /// nothing to visit. The chain stays locked until every range finished;
    /// failures go to the report sink. Use
    /// [`Mechanism::wait_for_operatings_completion`] to join.

    pub fn operate_concurrently_async<F, R>(self: Arc<Self>, f: F, max_threads: usize, min_rows_per_thread: usize) -> Outcome
    where
        F: Fn(&SolidChainRow<'_>) -> R + Sync + Send + 'static,
        R: IntoOutcome,
    {
        let partitions = self.partitions(max_threads, min_rows_per_thread);
        if partitions.is_empty() {
            return Ok(Status::NoItems);
        }
        let mechanism = self.core.mechanism.clone();
        let f = Arc::new(f);
        mechanism.operatings().begin(partitions.len());
        for ranges in partitions {
            let chain = self.clone();
            let mechanism = mechanism.clone();
            let f = f.clone();
            rayon::spawn(move || {
                let visit = |row: &SolidChainRow<'_>| f(row).into_outcome();
                if let Err(error) = chain.core.run_partition(&ranges, &visit) {
                    report_error(error.status(), &error.to_string());
                }
                drop(chain);
                mechanism.operatings().end();
            });
        }
        Ok(Status::Deferred)
    }

    /// Folds every visitable row into a value.
    ///
    /// Each range folds into its own accumulator starting at `init()`; the
    /// accumulators are then merged with `combine` in range order.

    pub fn reduce<A, I, Fold, Comb>(&self, init: I, fold: Fold, combine: Comb) -> ApparatusResult<A>
    where
        A: Send,
        I: Fn() -> A + Sync + Send,
        Fold: Fn(A, &SolidChainRow<'_>) -> A + Sync + Send,
        Comb: Fn(A, A) -> A,
    {
        let threads = self.core.mechanism.config().threads();
        let partitions = self.core.partitions(threads, self.core.mechanism.config().min_rows_per_thread);
        let partials: Vec<ApparatusResult<A>> = partitions
            .par_iter()
            .map(|ranges| {
                let accumulator = RefCell::new(Some(init()));
                let visit = |row: &SolidChainRow<'_>| {
                    let mut slot = accumulator.borrow_mut();
                    if let Some(acc) = slot.take() {
                        *slot = Some(fold(acc, row));
                    }
                    Ok(Status::Success)
                };
                self.core.run_partition(ranges, &visit)?;
                accumulator
                    .into_inner()
                    .ok_or_else(|| ApparatusError::SanityCheckFailed("reduction lost its accumulator".into()))
            })
            .collect();
        partials.into_iter().try_fold(init(), |acc, partial| Ok(combine(acc, partial?)))
    }

    fn partitions(&self, max_threads: usize, min_rows_per_thread: usize) -> Vec<Vec<(usize, usize, usize)>> {
        let threads = if max_threads == 0 { self.core.mechanism.config().threads() } else { max_threads };
        self.core.partitions(threads, min_rows_per_thread)
    }

    /// Handles of the visitable rows.
    pub fn iter(&self) -> Handles<'_> {
        self.core.handles()
    }

    /// Filter the chain was built from.
    pub fn filter(&self) -> &Filter {
        &self.core.filter
    }

    /// Number of locked chunks.
    pub fn chunks_count(&self) -> usize {
        self.core.segments.len()
    }

    /// Rows in the locked range.
    pub fn iterable_count(&self) -> usize {
        self.core.iterable_count()
    }
}

impl fmt::Debug for SolidChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolidChain").field("filter", &self.core.filter).field("chunks", &self.chunks_count()).finish()
    }
}


/// Iterator over the handles a chain visits.
pub struct Handles<'a> {
    core: &'a ChainCore,
    cursor: (usize, usize),
}

impl Iterator for Handles<'_> {
    type Item = SubjectHandle;

    fn next(&mut self) -> Option<SubjectHandle> {
        let _state = if self.core.guarded() { Some(self.core.mechanism.read_state().ok()?) } else { None };
        let (segment, row) = self.core.advance(self.cursor.0, self.cursor.1)?;
        self.cursor = (segment, row + 1);
        self.core.segments[segment].chunk.slot(row).ok().map(|slot| slot.handle())
    }
}


/// Row state shared by both row kinds.
pub(crate) struct RowView<'a> {
    pub(crate) mechanism: &'a Mechanism,
    pub(crate) chunk: &'a Chunk,
    pub(crate) include: &'a Traitmark,
    pub(crate) row: usize,
    pub(crate) handle: SubjectHandle,
    pub(crate) ptrs: &'a [*mut u8],
    pub(crate) guarded: bool,
}

impl RowView<'_> {
    fn ptr_of<T: Trait>(&self) -> ApparatusResult<*mut u8> {
        let info = trait_info::<T>();
        if let Some(ptr) = self.include.index_of(info.id()).and_then(|line| self.ptrs.get(line)) {
            return Ok(*ptr);
        }
        let _state = if self.guarded { Some(self.mechanism.read_state()?) } else { None };
        self.chunk.trait_ptr(self.row, info)
    }

    fn with_flags<R>(&self, f: impl FnOnce(&AtomicFlagmark) -> R) -> ApparatusResult<R> {
        let _state = if self.guarded { Some(self.mechanism.read_state()?) } else { None };
        Ok(f(self.chunk.slot(self.row)?.flagmark()))
    }

    fn line_ptr(&self, line: usize) -> Option<*mut u8> {
        self.ptrs.get(line).copied()
    }
}


/// A row visited by a liquid chain or an adjective.
pub struct ChainRow<'a> {
    pub(crate) view: RowView<'a>,
}

impl ChainRow<'_> {
    /// Subject occupying the row.
    #[inline]
    pub fn handle(&self) -> SubjectHandle {
        self.view.handle
    }

    /// Row index within its chunk.
    #[inline]
    pub fn row(&self) -> usize {
        self.view.row
    }

    /// Chunk of the row.
    #[inline]
    pub fn chunk(&self) -> &Chunk {
        self.view.chunk
    }

    /// Shared reference to trait `T`.
    pub fn get<T: Trait>(&self) -> ApparatusResult<&T> {
        let ptr = self.view.ptr_of::<T>()?;
        // SAFETY: the cell holds an initialised `T` and stays put while the chain is locked.
        Ok(unsafe { &*ptr.cast::<T>() })
    }

    /// Mutable reference to trait `T`.
    pub fn get_mut<T: Trait>(&mut self) -> ApparatusResult<&mut T> {
        let ptr = self.view.ptr_of::<T>()?;
        // SAFETY: as for `get`; `&mut self` keeps the reference unique for this row.
        Ok(unsafe { &mut *ptr.cast::<T>() })
    }

    /// Writes trait `T`, adding it through the mechanism if the row lacks it.
    pub fn set<T: Trait>(&mut self, value: T) -> Outcome {
        match self.get_mut::<T>() {
            Ok(slot) => {
                *slot = value;
                Ok(Status::Success)
            }
            Err(ApparatusError::Missing(_)) => self.view.mechanism.set_trait(self.view.handle, value),
            Err(error) => Err(error),
        }
    }

    /// Raw address of the cell at position `line` of the filter's include traitmark.
    pub fn line_ptr(&self, line: usize) -> Option<*mut u8> {
        self.view.line_ptr(line)
    }

    /// Current flagmark.
    pub fn flagmark(&self) -> ApparatusResult<Flagmark> {
        self.view.with_flags(|flags| flags.get())
    }

    /// `true` if every flag in `flag` is set.
    pub fn has_flag(&self, flag: Flagmark) -> ApparatusResult<bool> {
        self.view.with_flags(|flags| flags.has(flag))
    }

    /// Sets or clears a user-settable flag; returns its previous state.
    pub fn set_flag(&self, flag: Flagmark, state: bool) -> ApparatusResult<bool> {
        flag.ensure_user_settable()?;
        self.view.with_flags(|flags| flags.set_flag(flag, state))
    }

    /// Flips a user-settable flag; returns its previous state.
    pub fn toggle_flag(&self, flag: Flagmark) -> ApparatusResult<bool> {
        flag.ensure_user_settable()?;
        self.view.with_flags(|flags| flags.toggle_flag(flag))
    }

    /// Despawns the subject; the row turns stale.
    pub fn despawn(&self) -> Outcome {
        self.view.mechanism.despawn(self.view.handle)
    }
}


/// A row visited by a solid chain or a mechanic.
pub struct SolidChainRow<'a> {
    pub(crate) view: RowView<'a>,
}

impl SolidChainRow<'_> {
    /// Read-only handle of the subject.
    #[inline]
    pub fn handle(&self) -> SolidSubjectHandle {
        self.view.handle.solid()
    }

    /// Row index within its chunk.
    #[inline]
    pub fn row(&self) -> usize {
        self.view.row
    }

    /// Shared reference to trait `T`.
    pub fn get<T: Trait>(&self) -> ApparatusResult<&T> {
        let ptr = self.view.ptr_of::<T>()?;
        // SAFETY: the chunk is solid-locked, so the cell is initialised and immutable.
        Ok(unsafe { &*ptr.cast::<T>() })
    }

    /// Raw address of the cell at position `line` of the filter's include traitmark.
    pub fn line_ptr(&self, line: usize) -> Option<*const u8> {
        self.view.line_ptr(line).map(|ptr| ptr.cast_const())
    }

    /// Current flagmark.
    pub fn flagmark(&self) -> ApparatusResult<Flagmark> {
        self.view.with_flags(|flags| flags.get())
    }

    /// `true` if every flag in `flag` is set.
    pub fn has_flag(&self, flag: Flagmark) -> ApparatusResult<bool> {
        self.view.with_flags(|flags| flags.has(flag))
    }

    /// Atomically sets or clears a user-settable flag; returns its previous state.
    pub fn set_flag(&self, flag: Flagmark, state: bool) -> ApparatusResult<bool> {
        flag.ensure_user_settable()?;
        self.view.with_flags(|flags| flags.set_flag(flag, state))
    }

    /// Atomically flips a user-settable flag; returns its previous state.
    pub fn toggle_flag(&self, flag: Flagmark) -> ApparatusResult<bool> {
        flag.ensure_user_settable()?;
        self.view.with_flags(|flags| flags.toggle_flag(flag))
    }

    /// Queues a despawn of the subject.
    pub fn despawn_deferred(&self) -> Outcome {
        self.view.mechanism.despawn_deferred(self.view.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Heat(u32);

    #[test]
    fn partitions_cover_every_row_once() {
        let mechanism = Mechanism::new().unwrap();
        for i in 0..10 {
            mechanism.spawn_with((Heat(i),)).unwrap();
        }
        for i in 0..7 {
            mechanism.spawn_with((Heat(i), 0u8)).unwrap();
        }
        let chain = mechanism.enchain_solid(Filter::of::<(Heat,)>()).unwrap();
        let partitions = chain.partitions(4, 3);
        let covered: usize = partitions.iter().flatten().map(|(_, start, end)| end - start).sum();
        assert_eq!(covered, 17);
        assert!(partitions.len() <= 4);
        assert!(partitions.iter().all(|p| !p.is_empty()));
    }

    #[test]
    fn empty_chains_report_no_items() {
        let mechanism = Mechanism::new().unwrap();
        let chain = mechanism.enchain(Filter::of::<(Heat,)>()).unwrap();
        assert_eq!(chain.operate(|_| ()).unwrap(), Status::NoItems);
        assert_eq!(chain.chunks_count(), 0);
    }

    #[test]
    fn dropping_the_chain_unlocks_the_mechanism() {
        let mechanism = Mechanism::new().unwrap();
        mechanism.spawn_with((Heat(1),)).unwrap();
        let chain = mechanism.enchain_solid(Filter::of::<(Heat,)>()).unwrap();
        assert!(mechanism.is_solid());
        assert_eq!(mechanism.enchain(Filter::new()).unwrap_err().status(), Status::Conflict);
        drop(chain);
        assert!(!mechanism.is_locked());
    }
}
