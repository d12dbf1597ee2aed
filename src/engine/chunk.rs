//! # Chunks
//!
//! A chunk stores every subject of one exact traitmark as a row of
//! column-major trait cells.
//!
//! ## Layout
//!
//! ```text
//! columns[0] (trait id a) : [r0 r1 r2 ...]
//! columns[1] (trait id b) : [r0 r1 r2 ...]
//! slots                   : [h0/f0 h1/f1 h2/f2 ...]
//! ```
//!
//! Column `i` holds the trait at position `i` of the chunk's (id-sorted)
//! traitmark. Each slot carries the owning subject handle and its atomic
//! flagmark.
//!
//! ## Row lifecycle
//!
//! * Rows are appended at the tail by [`Chunk::reserve_row`].
//! * Releasing a row in an **unlocked** chunk swap-removes it immediately;
//!   the subject that moved into the hole must be relocated by the caller.
//! * Releasing a row in a **liquid-locked** chunk resets its cells, marks the
//!   slot `STALE` and leaves it in place, so iterators holding row indices stay
//!   valid. Stale rows are removed later by [`Chunk::compact`].
//! * A **solid-locked** chunk refuses every structural change.
//!
//! ## Concurrency
//!
//! The chunk body sits in an `UnsafeCell`. Structural methods are `unsafe`
//! and require the caller to hold the owning mechanism's writer guard; read
//! methods require the reader guard or a solid lock on the mechanism, under
//! which the body cannot change. Flagmarks are atomic and may be changed by
//! any holder of shared access. Column pages never move, so cell pointers
//! handed out under a lock stay valid for the lifetime of that lock.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::config::MechanismConfig;
use crate::engine::error::{ApparatusError, ApparatusResult};
use crate::engine::filter::Filter;
use crate::engine::flagmark::{AtomicFlagmark, Flagmark};
use crate::engine::lock::{LockCounter, LockMode};
use crate::engine::registry::{trait_info, Trait, TraitInfo};
use crate::engine::storage::{ScriptStructArray, TraitValue};
use crate::engine::subject::SubjectHandle;
use crate::engine::traitmark::Traitmark;
use crate::engine::types::{AdjectiveID, ChunkID, MechanismID};


/// Owner and flags of one chunk row.
#[derive(Debug)]
pub struct ChunkSlot {
    handle: SubjectHandle,
    flagmark: AtomicFlagmark,
}

impl ChunkSlot {
    /// Subject occupying the row; invalid after a hard release.
    #[inline]
    pub fn handle(&self) -> SubjectHandle {
        self.handle
    }

    /// Live flagmark of the row.
    #[inline]
    pub fn flagmark(&self) -> &AtomicFlagmark {
        &self.flagmark
    }

    #[inline]
    fn is_stale(&self) -> bool {
        self.flagmark.has(Flagmark::STALE)
    }
}

struct ChunkBody {
    columns: Vec<ScriptStructArray>,
    slots: Vec<ChunkSlot>,
}

/// What a cached line mapping belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum AttachmentKey {
    Adjective(AdjectiveID),
    Mechanic(AdjectiveID),
}

struct Attachment {
    key: AttachmentKey,
    lines: Arc<[usize]>,
}

/// Row-of-columns storage for subjects of one exact traitmark.
///
/// ## Invariants
/// - Every column has exactly `slots.len()` initialised elements.
/// - For every non-stale slot, the subject registry points back at
///   `(this chunk, row)`.
/// - The traitmark never changes after construction.

pub struct Chunk {
    id: ChunkID,
    mechanism: MechanismID,
    traitmark: Traitmark,
    body: UnsafeCell<ChunkBody>,
    lock: LockCounter,
    stale: AtomicUsize,
    attachments: RwLock<Vec<Attachment>>,
}

// Body access follows the mechanism guard discipline described above.
unsafe impl Sync for Chunk {}
unsafe impl Send for Chunk {}

impl Chunk {

    /// Creates an empty chunk for `traitmark`.
    ///
    /// ## Behavior
    /// Allocates one column per trait, in traitmark order, each with room
    /// for `config.chunk_initial_capacity` rows.

    pub(crate) fn new(
        id: ChunkID,
        mechanism: MechanismID,
        traitmark: Traitmark,
        config: &MechanismConfig,
    ) -> ApparatusResult<Self> {
        let columns = traitmark
            .traits()
            .iter()
            .map(|&info| ScriptStructArray::with_capacity(info, config.page_bytes, config.chunk_initial_capacity))
            .collect::<ApparatusResult<Vec<_>>>()?;
        Ok(Self {
            id,
            mechanism,
            traitmark,
            body: UnsafeCell::new(ChunkBody { columns, slots: Vec::with_capacity(config.chunk_initial_capacity) }),
            lock: LockCounter::new(),
            stale: AtomicUsize::new(0),
            attachments: RwLock::new(Vec::new()),
        })
    }

    #[inline]
    fn body(&self) -> &ChunkBody {
        // SAFETY: callers hold shared access per the module contract.
        unsafe { &*self.body.get() }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    unsafe fn body_mut(&self) -> &mut ChunkBody {
        unsafe { &mut *self.body.get() }
    }

    /// Chunk id within its mechanism.
    #[inline]
    pub fn id(&self) -> ChunkID {
        self.id
    }

    /// Owning mechanism.
    #[inline]
    pub fn mechanism_id(&self) -> MechanismID {
        self.mechanism
    }

    /// Frozen trait set.
    #[inline]
    pub fn traitmark(&self) -> &Traitmark {
        &self.traitmark
    }

    /// Signed lock depth.
    #[inline]
    pub fn lock_depth(&self) -> i32 {
        self.lock.depth()
    }

    /// Rows marked stale and not yet compacted.
    #[inline]
    pub fn stale_count(&self) -> usize {
        self.stale.load(Ordering::Acquire)
    }

    /// Physical row count, stale rows included.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.body().slots.len()
    }

    /// Rows that belong to live subjects.
    #[inline]
    pub(crate) fn live_len(&self) -> usize {
        self.len().saturating_sub(self.stale_count())
    }

    #[inline]
    pub(crate) fn acquire(&self, mode: LockMode) -> ApparatusResult<i32> {
        self.lock.acquire(mode)
    }

    #[inline]
    pub(crate) fn release(&self, mode: LockMode) -> i32 {
        self.lock.release(mode)
    }

    #[inline]
    pub(crate) fn slot(&self, row: usize) -> ApparatusResult<&ChunkSlot> {
        let slots = &self.body().slots;
        slots.get(row).ok_or(ApparatusError::OutOfRange { index: row, len: slots.len() })
    }

    /// Column holding trait `info`, if the chunk carries it.
    #[inline]
    fn column_of(&self, info: &TraitInfo) -> Option<usize> {
        self.traitmark.index_of(info.id())
    }

    /// Position of each trait of `traitmark` in this chunk's columns.
    ///
    /// `None` if the chunk lacks any of them.

    pub(crate) fn lines_for(&self, traitmark: &Traitmark) -> Option<Arc<[usize]>> {
        traitmark.traits().iter().map(|info| self.column_of(info)).collect::<Option<Vec<_>>>().map(Arc::from)
    }

    /// Records the line mapping of an adjective or mechanic.
    pub(crate) fn attach(&self, key: AttachmentKey, lines: Arc<[usize]>) {
        let mut attachments = self.attachments.write();
        match attachments.iter_mut().find(|a| a.key == key) {
            Some(existing) => existing.lines = lines,
            None => attachments.push(Attachment { key, lines }),
        }
    }

    /// Cached line mapping of an attachment.
    pub(crate) fn attached_lines(&self, key: AttachmentKey) -> Option<Arc<[usize]>> {
        self.attachments.read().iter().find(|a| a.key == key).map(|a| a.lines.clone())
    }

    /// Adjective ids attached to this chunk, in attachment order.
    pub(crate) fn attached_adjectives(&self) -> Vec<AdjectiveID> {
        self.attachments
            .read()
            .iter()
            .filter_map(|a| match a.key {
                AttachmentKey::Adjective(id) => Some(id),
                AttachmentKey::Mechanic(_) => None,
            })
            .collect()
    }

    /// Address of the cell at `(row, line)`.
    #[inline]
    pub(crate) fn cell_ptr(&self, row: usize, line: usize) -> ApparatusResult<*mut u8> {
        let body = self.body();
        let column = body.columns.get(line).ok_or(ApparatusError::OutOfRange { index: line, len: body.columns.len() })?;
        column.get_ptr(row)
    }

    /// Address of the cell of trait `info` at `row`.
    pub(crate) fn trait_ptr(&self, row: usize, info: &'static TraitInfo) -> ApparatusResult<*mut u8> {
        let line = self
            .column_of(info)
            .ok_or_else(|| ApparatusError::Missing(format!("chunk #{} has no `{}`", self.id, info.name())))?;
        self.cell_ptr(row, line)
    }

    /// Fills `out` with the cell addresses of `row` for each line.
    ///
    /// ## Purpose
    /// Hot path of chain iteration: the per-row pointer array handed to user
    /// functors.

    #[inline]
    pub(crate) fn row_ptrs(&self, row: usize, lines: &[usize], out: &mut Vec<*mut u8>) -> ApparatusResult<()> {
        out.clear();
        let columns = &self.body().columns;
        for &line in lines {
            let column = columns.get(line).ok_or(ApparatusError::OutOfRange { index: line, len: columns.len() })?;
            out.push(column.get_ptr(row)?);
        }
        Ok(())
    }

    /// Clone of trait `T` at `row`.
    pub(crate) fn read<T: Trait>(&self, row: usize) -> ApparatusResult<T> {
        let info = trait_info::<T>();
        let line = self
            .column_of(info)
            .ok_or_else(|| ApparatusError::Missing(format!("chunk #{} has no `{}`", self.id, info.name())))?;
        self.body().columns[line].get::<T>(row).cloned()
    }

    /// Snapshots every trait at `row` into owned values.
    pub(crate) fn snapshot_row(&self, row: usize) -> ApparatusResult<Vec<TraitValue>> {
        self.body()
            .columns
            .iter()
            .map(|column| {
                let at = column.get_ptr(row)?;
                // SAFETY: `at` is an initialised element of the column's type.
                unsafe { TraitValue::clone_from_raw(column.info(), at) }
            })
            .collect()
    }

    /// First visitable row in `[from, end)` whose flags satisfy `filter`.
    ///
    /// Rows flagged `STALE` or `DEFERRED_DESPAWN` are never visitable.

    #[inline]
    pub(crate) fn next_row(&self, filter: &Filter, from: usize, end: usize) -> Option<usize> {
        let slots = &self.body().slots;
        let end = end.min(slots.len());
        (from..end).find(|&row| {
            let flags = slots[row].flagmark.get();
            !flags.intersects(Flagmark::ITERATION_EXCLUDED) && filter.matches_flagmark(flags)
        })
    }

    /// Iterator over visitable rows from `offset` to the current end.
    pub(crate) fn begin<'a>(&'a self, filter: &'a Filter, offset: usize) -> RowCursor<'a> {
        RowCursor { chunk: self, filter, row: offset, end: self.len() }
    }

    /// Appends a default-initialised row owned by `handle`.
    ///
    /// ## Behavior
    /// Grows every column by one default element and appends the slot. On
    /// allocation failure the partially grown columns are rolled back.
    ///
    /// ## Safety
    /// Caller holds the mechanism writer guard, and the chunk is not solid.

    pub(crate) unsafe fn reserve_row(&self, handle: SubjectHandle, flagmark: Flagmark) -> ApparatusResult<usize> {
        if self.lock.is_solid() {
            return Err(ApparatusError::Fatal(format!("row reserved in solid chunk #{}", self.id)).surfaced());
        }
        let body = unsafe { self.body_mut() };
        for grown in 0..body.columns.len() {
            if let Err(error) = body.columns[grown].push_default() {
                for column in &mut body.columns[..grown] {
                    column.pop(1)?;
                }
                return Err(error);
            }
        }
        body.slots.push(ChunkSlot { handle, flagmark: AtomicFlagmark::new(flagmark) });
        Ok(body.slots.len() - 1)
    }

    /// Overwrites the cells of `row` with the matching `values`.
    ///
    /// Values whose trait the chunk lacks are rejected with `Missing`.
    ///
    /// ## Safety
    /// Caller holds the mechanism writer guard.

    pub(crate) unsafe fn write_values(&self, row: usize, values: &[TraitValue]) -> ApparatusResult<()> {
        let body = unsafe { self.body_mut() };
        for value in values {
            let line = self.column_of(value.info()).ok_or_else(|| {
                ApparatusError::Missing(format!("chunk #{} has no `{}`", self.id, value.info().name()))
            })?;
            let column = &mut body.columns[line];
            column.get_ptr(row)?;
            // SAFETY: `row` is initialised and `value` has the column's type.
            unsafe { column.copy_from_raw(row, value.as_ptr(), true) };
        }
        Ok(())
    }

    /// Copies every trait shared with `source` from `source_row` into `row`.
    ///
    /// ## Safety
    /// Caller holds the mechanism writer guard; `source` is a different chunk.

    pub(crate) unsafe fn copy_shared_from(&self, row: usize, source: &Chunk, source_row: usize) -> ApparatusResult<()> {
        let body = unsafe { self.body_mut() };
        for (line, info) in self.traitmark.traits().iter().enumerate() {
            let Some(source_line) = source.column_of(info) else { continue };
            let from = source.cell_ptr(source_row, source_line)?;
            let column = &mut body.columns[line];
            column.get_ptr(row)?;
            // SAFETY: both cells are initialised values of the same type in distinct chunks.
            unsafe { column.copy_from_raw(row, from, true) };
        }
        Ok(())
    }

    /// Releases `row`.
    ///
    /// ## Behavior
    /// - Unlocked: swap-removes the row. Returns the subject that moved into
    ///   `row`, if any, so the caller can update its registry entry.
    /// - Liquid: resets the row's cells, marks the slot `STALE` and, when
    ///   `hard`, drops the back-reference to the subject.
    /// - Solid: fails with `FatalError`.
    ///
    /// ## Safety
    /// Caller holds the mechanism writer guard.

    pub(crate) unsafe fn release_row(&self, row: usize, hard: bool) -> ApparatusResult<Option<(SubjectHandle, usize)>> {
        let depth = self.lock.depth();
        if depth < 0 {
            return Err(ApparatusError::Fatal(format!(
                "structural change on solid chunk #{} (depth {depth})",
                self.id
            ))
            .surfaced());
        }
        let body = unsafe { self.body_mut() };
        if row >= body.slots.len() {
            return Err(ApparatusError::OutOfRange { index: row, len: body.slots.len() }.surfaced());
        }
        if depth > 0 {
            for column in &mut body.columns {
                column.clear_row(row)?;
            }
            let slot = &mut body.slots[row];
            if !slot.flagmark.set_flag(Flagmark::STALE, true) {
                self.stale.fetch_add(1, Ordering::AcqRel);
            }
            if hard {
                slot.handle = SubjectHandle::INVALID;
            }
            return Ok(None);
        }
        for column in &mut body.columns {
            column.swap_remove(row)?;
        }
        body.slots.swap_remove(row);
        Ok(body.slots.get(row).filter(|slot| !slot.is_stale()).map(|slot| (slot.handle, row)))
    }

    /// Removes every stale row of an unlocked chunk.
    ///
    /// `relocate` is called for each live subject whose row changed. Returns
    /// the number of rows removed.
    ///
    /// ## Safety
    /// Caller holds the mechanism writer guard.

    pub(crate) unsafe fn compact(&self, mut relocate: impl FnMut(SubjectHandle, usize)) -> ApparatusResult<usize> {
        if self.lock.is_locked() || self.stale_count() == 0 {
            return Ok(0);
        }
        let body = unsafe { self.body_mut() };
        let mut removed = 0;
        for row in (0..body.slots.len()).rev() {
            if !body.slots[row].is_stale() {
                continue;
            }
            for column in &mut body.columns {
                column.swap_remove(row)?;
            }
            body.slots.swap_remove(row);
            removed += 1;
            if let Some(moved) = body.slots.get(row) {
                relocate(moved.handle, row);
            }
        }
        self.stale.store(0, Ordering::Release);
        log::trace!(target: "apparatus", "compacted {removed} stale rows of chunk #{}", self.id);
        Ok(removed)
    }

    /// Exchanges the shared trait values of `row` and `other[other_row]`.
    ///
    /// With `clear_missing`, traits present on only one side are reset to
    /// their defaults.
    ///
    /// ## Safety
    /// Caller holds the mechanism writer guard.

    pub(crate) unsafe fn swap_traits(
        &self,
        row: usize,
        other: &Chunk,
        other_row: usize,
        clear_missing: bool,
    ) -> ApparatusResult<()> {
        let body = unsafe { self.body_mut() };
        if std::ptr::eq(self, other) {
            for column in &mut body.columns {
                column.swap(row, other_row)?;
            }
            return Ok(());
        }
        let other_body = unsafe { other.body_mut() };
        for (line, info) in self.traitmark.traits().iter().enumerate() {
            match other.column_of(info) {
                Some(other_line) => body.columns[line].swap_across(row, &mut other_body.columns[other_line], other_row)?,
                None if clear_missing => body.columns[line].clear_row(row)?,
                None => {}
            }
        }
        if clear_missing {
            for (line, info) in other.traitmark.traits().iter().enumerate() {
                if self.column_of(info).is_none() {
                    other_body.columns[line].clear_row(other_row)?;
                }
            }
        }
        Ok(())
    }

    /// Drops every row and returns the columns to their initial capacity.
    ///
    /// ## Safety
    /// Caller holds the mechanism writer guard and the chunk is unlocked.

    pub(crate) unsafe fn clear(&self, capacity: usize) -> ApparatusResult<()> {
        let body = unsafe { self.body_mut() };
        for column in &mut body.columns {
            column.reset(capacity)?;
        }
        body.slots.clear();
        self.stale.store(0, Ordering::Release);
        self.lock.clear();
        Ok(())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("traitmark", &self.traitmark)
            .field("rows", &self.len())
            .field("stale", &self.stale_count())
            .field("lock", &self.lock_depth())
            .finish()
    }
}


/// Forward-only cursor over the visitable rows of a chunk.
pub struct RowCursor<'a> {
    chunk: &'a Chunk,
    filter: &'a Filter,
    row: usize,
    end: usize,
}

impl Iterator for RowCursor<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let row = self.chunk.next_row(self.filter, self.row, self.end)?;
        self.row = row + 1;
        Some(row)
    }
}
