//! # Adjectives and Mechanics
//!
//! Handlers bound to a mechanism together with a filter.
//!
//! * An **adjective** runs once on every subject spawned into a chunk whose
//!   traitmark matches its filter, provided the subject's flags match too.
//!   It receives a liquid [`ChainRow`], so it may initialise traits or queue
//!   further changes.
//! * A **mechanic** is a solid handler run concurrently over every matching
//!   subject on demand.
//!
//! Both record a per-chunk line mapping when a matching chunk is created, so
//! they never resolve columns per row.

use std::fmt;
use std::sync::Arc;

use crate::engine::chain::{ChainRow, RowView, SolidChain, SolidChainRow};
use crate::engine::chunk::{AttachmentKey, Chunk};
use crate::engine::error::{combine_outcomes, ApparatusError, Outcome, Status};
use crate::engine::filter::Filter;
use crate::engine::flagmark::Flagmark;
use crate::engine::lock::LockMode;
use crate::engine::mechanism::Mechanism;
use crate::engine::subject::SubjectHandle;
use crate::engine::types::AdjectiveID;


type AdjectiveHandler = dyn Fn(&mut ChainRow<'_>) -> Outcome + Send + Sync;
type MechanicHandler = dyn Fn(&SolidChainRow<'_>) -> Outcome + Send + Sync;

/// Spawn-time handler bound to a filter.
pub struct Adjective {
    id: AdjectiveID,
    filter: Filter,
    handler: Box<AdjectiveHandler>,
}

impl Adjective {
    pub(crate) fn new(
        id: AdjectiveID,
        filter: Filter,
        handler: impl Fn(&mut ChainRow<'_>) -> Outcome + Send + Sync + 'static,
    ) -> Self {
        Self { id, filter, handler: Box::new(handler) }
    }

    /// Registration id within the mechanism.
    #[inline]
    pub fn id(&self) -> AdjectiveID {
        self.id
    }

    /// Filter the adjective was bound with.
    #[inline]
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Line mapping into `chunk`, if the chunk matches.
    pub(crate) fn lines_in(&self, chunk: &Chunk) -> Option<Arc<[usize]>> {
        attach_lines(&self.filter, chunk)
    }
}

impl fmt::Debug for Adjective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adjective").field("id", &self.id).field("filter", &self.filter).finish()
    }
}

/// Concurrent solid handler bound to a filter.
pub struct Mechanic {
    id: AdjectiveID,
    filter: Filter,
    handler: Box<MechanicHandler>,
}

impl Mechanic {
    pub(crate) fn new(
        id: AdjectiveID,
        filter: Filter,
        handler: impl Fn(&SolidChainRow<'_>) -> Outcome + Send + Sync + 'static,
    ) -> Self {
        Self { id, filter, handler: Box::new(handler) }
    }

    /// Registration id within the mechanism.
    #[inline]
    pub fn id(&self) -> AdjectiveID {
        self.id
    }

    /// Filter the mechanic was bound with.
    #[inline]
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub(crate) fn lines_in(&self, chunk: &Chunk) -> Option<Arc<[usize]>> {
        attach_lines(&self.filter, chunk)
    }
}

impl fmt::Debug for Mechanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mechanic").field("id", &self.id).field("filter", &self.filter).finish()
    }
}

fn attach_lines(filter: &Filter, chunk: &Chunk) -> Option<Arc<[usize]>> {
    if !filter.matches_chunk(chunk.traitmark()) {
        return None;
    }
    chunk.lines_for(filter.include_traitmark())
}


/// Runs the adjectives attached to the chunk of a freshly spawned subject.
///
/// The mechanism and the chunk are held liquid for the duration, so
/// structural changes made by the handlers are applied after the last one
/// returns.
pub(crate) fn evaluate(mechanism: &Mechanism, handle: SubjectHandle) -> Outcome {
    let (chunk, row, adjectives) = {
        let state = mechanism.read_state()?;
        let (chunk, row) = state.locate(handle)?;
        let adjectives: Vec<Arc<Adjective>> = chunk
            .attached_adjectives()
            .into_iter()
            .filter_map(|id| state.adjectives.get(id as usize).cloned())
            .collect();
        if adjectives.is_empty() {
            return Ok(Status::Noop);
        }
        let chunk = chunk.clone();
        mechanism.acquire_lock(LockMode::Liquid)?;
        if let Err(error) = chunk.acquire(LockMode::Liquid) {
            drop(state);
            mechanism.release_lock(LockMode::Liquid);
            return Err(error);
        }
        (chunk, row, adjectives)
    };
    let outcome = run_adjectives(mechanism, &chunk, row, handle, &adjectives);
    chunk.release(LockMode::Liquid);
    mechanism.release_lock(LockMode::Liquid);
    outcome
}

fn run_adjectives(
    mechanism: &Mechanism,
    chunk: &Chunk,
    row: usize,
    handle: SubjectHandle,
    adjectives: &[Arc<Adjective>],
) -> Outcome {
    let mut ptrs = Vec::new();
    let mut outcome = Ok(Status::Noop);
    for adjective in adjectives {
        {
            let _state = mechanism.read_state()?;
            let flags = chunk.slot(row)?.flagmark().get();
            if flags.intersects(Flagmark::ITERATION_EXCLUDED) || !adjective.filter.matches_flagmark(flags) {
                continue;
            }
            let lines = chunk
                .attached_lines(AttachmentKey::Adjective(adjective.id))
                .ok_or_else(|| ApparatusError::SanityCheckFailed(format!("adjective #{} lost its lines", adjective.id)))?;
            chunk.row_ptrs(row, &lines, &mut ptrs)?;
        }
        let mut chain_row = ChainRow {
            view: RowView {
                mechanism,
                chunk,
                include: adjective.filter.include_traitmark(),
                row,
                handle,
                ptrs: &ptrs,
                guarded: true,
            },
        };
        outcome = combine_outcomes(outcome, (adjective.handler)(&mut chain_row));
    }
    outcome
}

/// Runs mechanic `id` concurrently over its matching subjects.
pub(crate) fn run_mechanic(mechanism: &Arc<Mechanism>, id: AdjectiveID) -> Outcome {
    let mechanic = mechanism
        .read_state()?
        .mechanics
        .get(id as usize)
        .cloned()
        .ok_or_else(|| ApparatusError::Missing(format!("mechanic #{id}")))?;
    let chain = SolidChain::for_mechanic(mechanism.clone(), mechanic.filter.clone(), id)?;
    chain.operate_concurrently(|row| (mechanic.handler)(row), 0, mechanism.config().min_rows_per_thread)
}
