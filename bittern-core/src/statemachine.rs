//! The block state machine: the closed set of cache-block states, the
//! fine-grained transition phases that step through each request path, and
//! the centrally auditable table of legal (path, phase) transitions.
//!
//! This module holds the data model only. The handlers that actually issue
//! pmem/devio I/O for each phase live in `cache`, which is the single
//! pivot point a completion re-enters: every phase ends by scheduling
//! exactly one async operation and handing the next phase back to that
//! pivot.

use crate::directory::BlockId;
use crate::hash::Hash128;

/// The five states a cache block can be in. Only `Invalid`, `Clean` and
/// `Dirty` are ever persisted; `CleanNoData`/`DirtyNoData` are interior
/// staging states that exist only between an invalid->valid allocation and
/// the first data/metadata write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Invalid,
    CleanNoData,
    DirtyNoData,
    Clean,
    Dirty,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Invalid | State::Clean | State::Dirty)
    }
}

/// Which request path a work item is driving. Distinct from `TransitionPath`
/// (the fine-grained phase): this groups the phases in §4.6's table into
/// the named row they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    ReadHit,
    ReadMiss,
    WriteMissWt,
    WriteMissWb,
    WriteHitWt,
    PartialWriteHitWt,
    WriteHitWbClean,
    PartialWriteHitWbClean,
    WriteHitWbDirtyCloneOriginal,
    WriteHitWbDirtyCloneClone,
    PartialWriteHitWbDirtyClone,
    PartialWriteMissWt,
    PartialWriteMissWb,
    Writeback,
    WritebackInvalidate,
    CleanInvalidate,
    DirtyInvalidate,
}

/// The fine-grained transition phase a held, transitional block is
/// currently executing, or `None` when the block is idle (terminal state,
/// not currently held by a transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPath {
    None,

    ReadHitCpfCacheStart,
    ReadHitCpfCacheEnd,

    ReadMissCpfDevStartio,
    ReadMissCpfDevEndio,
    ReadMissCptCacheEnd,

    WmissCptDevStartio,
    WmissCptDevEndio,
    WmissCptCacheEnd,
    WmissCptCacheStart,

    WhitCptDevStartio,
    WhitCptDevEndio,
    WhitCptCacheEnd,

    PwhitCpfCacheStart,
    PwhitCptDevStartio,
    PwhitCptDevEndio,
    PwhitCptCacheEnd,

    DirtyWhitCptCacheStart,
    DirtyWhitCptCacheEnd,

    DirtyPwhitCpfCacheStart,
    DirtyPwhitCptCacheStart,
    DirtyPwhitCptCacheEnd,

    DirtyInvalidateStart,
    DirtyInvalidateEnd,

    DwcCptCacheStart,
    DwcCptCacheEnd,

    DwcCpfOriginalCacheStart,
    DwcCptCloneCacheStart,
    DwcCptCloneCacheEnd,

    PwmissCpfDevStartio,
    PwmissCpfDevEndio,
    PwmissCptDevEndio,
    PwmissCptCacheEnd,

    WbCpfCacheStart,
    WbCpfCacheEnd,
    WbCptDevEndio,
    WbUpdMetadataEnd,

    WbInvCpfCacheStart,
    WbInvCpfCacheEnd,
    WbInvCptDevEndio,
    WbInvUpdMetadataEnd,

    CleanInvalidateStart,
    CleanInvalidateEnd,
}

/// One row of the legal-transition table: the path it belongs to, the
/// ordered phase sequence a work item steps through, and the terminal
/// state it lands on.
///
/// `terminal` is `None` for read hit: §4.6's table returns that path to
/// "valid" (whichever of clean/dirty the block already was), not to a
/// state the path itself fixes. `terminal_state` panics if asked for that
/// path's terminal rather than guessing; `run_read_hit` never asks,
/// preserving the snapshot's own state instead.
pub struct PathSpec {
    pub kind: PathKind,
    pub phases: &'static [TransitionPath],
    pub terminal: Option<State>,
}

macro_rules! path_spec {
    ($kind:expr, [$($phase:expr),+ $(,)?], $terminal:expr) => {
        PathSpec { kind: $kind, phases: &[$($phase),+], terminal: Some($terminal) }
    };
    ($kind:expr, [$($phase:expr),+ $(,)?], unchanged) => {
        PathSpec { kind: $kind, phases: &[$($phase),+], terminal: None }
    };
}

/// The centrally auditable list of legal transition sequences, one entry
/// per row of spec.md §4.6's table. Any phase sequence a work item takes
/// that doesn't appear here (in order) is a bug and must be rejected by
/// `validate_step`.
pub static PATH_TABLE: &[PathSpec] = &[
    path_spec!(PathKind::ReadHit, [TransitionPath::ReadHitCpfCacheStart, TransitionPath::ReadHitCpfCacheEnd], unchanged),
    path_spec!(
        PathKind::ReadMiss,
        [TransitionPath::ReadMissCpfDevStartio, TransitionPath::ReadMissCpfDevEndio, TransitionPath::ReadMissCptCacheEnd],
        State::Clean
    ),
    path_spec!(
        PathKind::WriteMissWt,
        [TransitionPath::WmissCptDevStartio, TransitionPath::WmissCptDevEndio, TransitionPath::WmissCptCacheEnd],
        State::Clean
    ),
    path_spec!(PathKind::WriteMissWb, [TransitionPath::WmissCptCacheStart, TransitionPath::WmissCptCacheEnd], State::Dirty),
    path_spec!(
        PathKind::WriteHitWt,
        [TransitionPath::WhitCptDevStartio, TransitionPath::WhitCptDevEndio, TransitionPath::WhitCptCacheEnd],
        State::Clean
    ),
    path_spec!(
        PathKind::PartialWriteHitWt,
        [
            TransitionPath::PwhitCpfCacheStart,
            TransitionPath::PwhitCptDevStartio,
            TransitionPath::PwhitCptDevEndio,
            TransitionPath::PwhitCptCacheEnd,
        ],
        State::Clean
    ),
    path_spec!(
        PathKind::WriteHitWbClean,
        [TransitionPath::DirtyWhitCptCacheStart, TransitionPath::DirtyWhitCptCacheEnd],
        State::Dirty
    ),
    path_spec!(
        PathKind::PartialWriteHitWbClean,
        [
            TransitionPath::DirtyPwhitCpfCacheStart,
            TransitionPath::DirtyPwhitCptCacheStart,
            TransitionPath::DirtyPwhitCptCacheEnd,
        ],
        State::Dirty
    ),
    path_spec!(
        PathKind::WriteHitWbDirtyCloneOriginal,
        [TransitionPath::DirtyInvalidateStart, TransitionPath::DirtyInvalidateEnd],
        State::Invalid
    ),
    path_spec!(
        PathKind::WriteHitWbDirtyCloneClone,
        [TransitionPath::DwcCptCacheStart, TransitionPath::DwcCptCacheEnd],
        State::Dirty
    ),
    path_spec!(
        PathKind::PartialWriteHitWbDirtyClone,
        [
            TransitionPath::DwcCpfOriginalCacheStart,
            TransitionPath::DwcCptCloneCacheStart,
            TransitionPath::DwcCptCloneCacheEnd,
        ],
        State::Dirty
    ),
    path_spec!(
        PathKind::PartialWriteMissWt,
        [
            TransitionPath::PwmissCpfDevStartio,
            TransitionPath::PwmissCpfDevEndio,
            TransitionPath::PwmissCptDevEndio,
            TransitionPath::PwmissCptCacheEnd,
        ],
        State::Clean
    ),
    path_spec!(
        PathKind::PartialWriteMissWb,
        [TransitionPath::PwmissCpfDevStartio, TransitionPath::PwmissCpfDevEndio, TransitionPath::PwmissCptCacheEnd],
        State::Dirty
    ),
    path_spec!(
        PathKind::Writeback,
        [
            TransitionPath::WbCpfCacheStart,
            TransitionPath::WbCpfCacheEnd,
            TransitionPath::WbCptDevEndio,
            TransitionPath::WbUpdMetadataEnd,
        ],
        State::Clean
    ),
    path_spec!(
        PathKind::WritebackInvalidate,
        [
            TransitionPath::WbInvCpfCacheStart,
            TransitionPath::WbInvCpfCacheEnd,
            TransitionPath::WbInvCptDevEndio,
            TransitionPath::WbInvUpdMetadataEnd,
        ],
        State::Invalid
    ),
    path_spec!(
        PathKind::CleanInvalidate,
        [TransitionPath::CleanInvalidateStart, TransitionPath::CleanInvalidateEnd],
        State::Invalid
    ),
    path_spec!(
        PathKind::DirtyInvalidate,
        [TransitionPath::DirtyInvalidateStart, TransitionPath::DirtyInvalidateEnd],
        State::Invalid
    ),
];

fn spec_for(kind: PathKind) -> &'static PathSpec {
    PATH_TABLE.iter().find(|p| p.kind == kind).expect("every PathKind has a PATH_TABLE entry")
}

/// Returns the phase that must follow `current` on `kind`'s path, or
/// `None` if `current` was the path's last phase (the transition is
/// complete and the block should land on `spec.terminal`).
///
/// Panics (a bug, per spec.md §4.6's validation hook) if `current` is not
/// `TransitionPath::None` and not a phase belonging to `kind`'s sequence.
pub fn next_phase(kind: PathKind, current: TransitionPath) -> Option<TransitionPath> {
    let spec = spec_for(kind);
    if current == TransitionPath::None {
        return Some(spec.phases[0]);
    }
    let pos = spec
        .phases
        .iter()
        .position(|&p| p == current)
        .unwrap_or_else(|| panic!("illegal transition: {current:?} is not on path {kind:?}"));
    spec.phases.get(pos + 1).copied()
}

/// Panics for a path whose terminal isn't fixed by the path itself (read
/// hit only, which preserves whichever of clean/dirty the block already
/// held). Callers that might drive such a path must consult the block's
/// own state instead of this function.
pub fn terminal_state(kind: PathKind) -> State {
    spec_for(kind)
        .terminal
        .unwrap_or_else(|| panic!("{kind:?} has no fixed terminal state; it preserves whatever state the block already held"))
}

/// Asserts that `(kind, from, to)` is a legal adjacent step. Used by the
/// cache's re-entry pivot on every phase advance, matching spec.md §4.6's
/// requirement that illegal transitions assert/fail rather than silently
/// proceed.
pub fn validate_step(kind: PathKind, from: TransitionPath, to: TransitionPath) {
    match next_phase(kind, from) {
        Some(expected) if expected == to => {}
        Some(expected) => panic!("illegal transition on {kind:?}: expected {expected:?}, got {to:?}"),
        None => panic!("illegal transition on {kind:?}: {from:?} was already terminal, got {to:?}"),
    }
}

/// The unit of in-flight work the state machine operates on.
///
/// Carries a pointer to the cache block being driven (by id, resolved
/// through the directory), an optional "original" block id used only by
/// dirty-write cloning, the writeback-mode snapshot taken at request
/// entry (so a mid-flight `cache_mode` control message cannot corrupt an
/// in-progress transition), the xid this work item runs under, and
/// lifecycle timestamps.
pub struct WorkItem {
    pub id: u64,
    pub kind: PathKind,
    pub phase: TransitionPath,
    pub block: BlockId,
    pub clone_of: Option<BlockId>,
    pub xid: u64,
    pub writeback_mode_snapshot: bool,
    pub created_at: std::time::Instant,
}

impl WorkItem {
    pub fn new(id: u64, kind: PathKind, block: BlockId, xid: u64, writeback_mode_snapshot: bool) -> WorkItem {
        WorkItem {
            id,
            kind,
            phase: TransitionPath::None,
            block,
            clone_of: None,
            xid,
            writeback_mode_snapshot,
            created_at: std::time::Instant::now(),
        }
    }

    /// Advances to the next phase in this work item's path, validating the
    /// step. Returns `None` once the path is exhausted (the caller should
    /// finalize to `terminal_state(self.kind)`).
    pub fn advance(&mut self) -> Option<TransitionPath> {
        let next = next_phase(self.kind, self.phase);
        if let Some(p) = next {
            validate_step(self.kind, self.phase, p);
            self.phase = p;
        }
        next
    }
}

/// A merged 4 KiB page plus the hash computed over it, the shared result
/// of every partial-write merge (read existing page, splice in the new
/// bytes, hash the result) regardless of which path invoked it.
pub struct MergedPage {
    pub page: Box<[u8; crate::layout::CACHE_BLOCK_SIZE]>,
    pub hash: Hash128,
}

/// Merges `data` at byte offset `offset` into `base` (the existing 4 KiB
/// page, read from cache on a partial hit or from the backing device on a
/// partial miss) and hashes the result. Implements spec.md §4.6's
/// "partial-write semantics".
pub fn merge_partial_write(base: &[u8; crate::layout::CACHE_BLOCK_SIZE], offset: usize, data: &[u8]) -> MergedPage {
    let mut page = Box::new(*base);
    page[offset..offset + data.len()].copy_from_slice(data);
    let hash = crate::hash::murmurhash3_128(page.as_slice());
    MergedPage { page, hash }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_hit_path_runs_to_completion() {
        let mut wi = WorkItem::new(1, PathKind::ReadHit, 3, 1, true);
        assert_eq!(wi.advance(), Some(TransitionPath::ReadHitCpfCacheStart));
        assert_eq!(wi.advance(), Some(TransitionPath::ReadHitCpfCacheEnd));
        assert_eq!(wi.advance(), None);
        assert_eq!(terminal_state(wi.kind), State::Clean);
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn skipping_a_phase_panics() {
        validate_step(PathKind::ReadMiss, TransitionPath::ReadMissCpfDevStartio, TransitionPath::ReadMissCptCacheEnd);
    }

    #[test]
    fn every_path_kind_has_a_table_entry() {
        for kind in [
            PathKind::ReadHit,
            PathKind::ReadMiss,
            PathKind::WriteMissWt,
            PathKind::WriteMissWb,
            PathKind::WriteHitWt,
            PathKind::PartialWriteHitWt,
            PathKind::WriteHitWbClean,
            PathKind::PartialWriteHitWbClean,
            PathKind::WriteHitWbDirtyCloneOriginal,
            PathKind::WriteHitWbDirtyCloneClone,
            PathKind::PartialWriteHitWbDirtyClone,
            PathKind::PartialWriteMissWt,
            PathKind::PartialWriteMissWb,
            PathKind::Writeback,
            PathKind::WritebackInvalidate,
            PathKind::CleanInvalidate,
            PathKind::DirtyInvalidate,
        ] {
            assert!(!spec_for(kind).phases.is_empty());
        }
    }

    #[test]
    fn merge_partial_write_splices_and_hashes() {
        let base = [0u8; crate::layout::CACHE_BLOCK_SIZE];
        let merged = merge_partial_write(&base, 512, &[0xAAu8; 1024]);
        assert!(merged.page[512..1536].iter().all(|&b| b == 0xAA));
        assert_eq!(merged.hash, crate::hash::murmurhash3_128(merged.page.as_slice()));
    }
}
