//! Block version registry and compile queue
//!
//! Interns `(function, block, canonical state)` triples as block versions,
//! queues pending compilations FIFO, and tracks realized code ranges. The
//! per-block version cap degrades over-specialized requests to a generic
//! version with every location erased to the stack home and no type facts;
//! the requesting branch edge is responsible for the reconciling spills.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::codegen::state::CanonState;
use crate::ir::instr::{BlockId, FunId};

/// Interned block-version handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionId(pub u32);

/// How a two-way branch is laid out relative to the code that follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchShape {
    /// The true target is emitted immediately after (fall through to it)
    Next0,
    /// The false target is emitted immediately after
    Next1,
    /// Neither target falls through
    Default,
}

/// One interned block version
#[derive(Debug)]
pub struct BlockVersion {
    /// The function this version belongs to
    pub fun: FunId,
    /// The IR block
    pub block: BlockId,
    /// Entry state (canonical)
    pub state: CanonState,
    /// Start of the emitted range, once realized
    pub start: Option<usize>,
    /// End of the emitted range
    pub end: Option<usize>,
}

impl BlockVersion {
    /// Whether this version has been emitted
    pub fn is_realized(&self) -> bool {
        self.start.is_some()
    }
}

/// The version registry and pending-compilation queue
pub struct VersionManager {
    versions: Vec<BlockVersion>,
    index: FxHashMap<(FunId, BlockId, CanonState), VersionId>,
    block_counts: FxHashMap<(FunId, BlockId), u32>,
    queue: VecDeque<VersionId>,
    max_versions: u32,
}

impl VersionManager {
    /// Create a registry with the given per-block version cap.
    /// A cap of zero disables type specialization entirely: every request
    /// degrades to the generic state.
    pub fn new(max_versions: u32) -> VersionManager {
        VersionManager {
            versions: vec![],
            index: FxHashMap::default(),
            block_counts: FxHashMap::default(),
            queue: VecDeque::new(),
            max_versions,
        }
    }

    /// Intern a `(block, state)` pair, enqueueing a new version when the
    /// pair is unseen. Over the cap, the state is erased first.
    pub fn get_version(&mut self, fun: FunId, block: BlockId, state: CanonState) -> VersionId {
        let state = if self.cap_reached(fun, block) && !state.is_generic() {
            state.erase()
        } else {
            state
        };

        if let Some(&id) = self.index.get(&(fun, block, state.clone())) {
            return id;
        }

        let id = VersionId(self.versions.len() as u32);
        self.versions.push(BlockVersion {
            fun,
            block,
            state: state.clone(),
            start: None,
            end: None,
        });
        self.index.insert((fun, block, state), id);
        *self.block_counts.entry((fun, block)).or_insert(0) += 1;
        self.queue.push_back(id);
        tracing::trace!(?fun, ?block, version = id.0, "queued block version");
        id
    }

    /// Intern like `get_version` but without queueing: the version is
    /// compiled on first reach through a continuation stub (lazy mode)
    pub fn get_version_lazy(
        &mut self,
        fun: FunId,
        block: BlockId,
        state: CanonState,
    ) -> VersionId {
        let state = if self.cap_reached(fun, block) && !state.is_generic() {
            state.erase()
        } else {
            state
        };
        if let Some(&id) = self.index.get(&(fun, block, state.clone())) {
            return id;
        }
        let id = VersionId(self.versions.len() as u32);
        self.versions.push(BlockVersion {
            fun,
            block,
            state: state.clone(),
            start: None,
            end: None,
        });
        self.index.insert((fun, block, state), id);
        *self.block_counts.entry((fun, block)).or_insert(0) += 1;
        id
    }

    /// Queue a version created lazily, once a stub is first reached
    pub fn enqueue(&mut self, id: VersionId) {
        if !self.versions[id.0 as usize].is_realized() {
            self.queue.push_back(id);
        }
    }

    fn cap_reached(&self, fun: FunId, block: BlockId) -> bool {
        let count = self
            .block_counts
            .get(&(fun, block))
            .copied()
            .unwrap_or(0);
        count >= self.max_versions
    }

    /// The version record
    pub fn version(&self, id: VersionId) -> &BlockVersion {
        &self.versions[id.0 as usize]
    }

    /// Record the start of a version's code range; emission is in progress
    /// so self-referencing branches can resolve immediately
    pub fn mark_realized(&mut self, id: VersionId, start: usize) {
        let v = &mut self.versions[id.0 as usize];
        debug_assert!(v.start.is_none(), "version realized twice");
        v.start = Some(start);
        v.end = Some(start);
    }

    /// Close a version's code range
    pub fn set_end(&mut self, id: VersionId, end: usize) {
        let v = &mut self.versions[id.0 as usize];
        debug_assert!(v.start.is_some(), "version not realized");
        v.end = Some(end);
    }

    /// Pop the next pending version, skipping any already realized
    pub fn pop_pending(&mut self) -> Option<VersionId> {
        while let Some(id) = self.queue.pop_front() {
            if !self.versions[id.0 as usize].is_realized() {
                return Some(id);
            }
        }
        None
    }

    /// Move a pending version to the front of the queue so it is emitted
    /// next (fall-through layout)
    pub fn promote_front(&mut self, id: VersionId) {
        if let Some(pos) = self.queue.iter().position(|q| *q == id) {
            self.queue.remove(pos);
        }
        self.queue.push_front(id);
    }

    /// Number of versions interned for a block
    pub fn count_for_block(&self, fun: FunId, block: BlockId) -> u32 {
        self.block_counts
            .get(&(fun, block))
            .copied()
            .unwrap_or(0)
    }

    /// Total interned versions
    pub fn total_versions(&self) -> usize {
        self.versions.len()
    }

}
