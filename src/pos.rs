//! The GC position cursor.
//!
//! Everything the GC walks is totally ordered: coarse phases first, then
//! per-btree progress as `(level, node min key)`, then allocator open
//! buckets by slot. Concurrent index updates compare their position against
//! a lock-free snapshot of the cursor to decide whether the sweep has
//! already passed them. References are only ever allowed to move forward in
//! this order (an open-bucket reference may migrate into the btree, never
//! the reverse), which is what keeps the sweep from missing them.

use crate::bkey::Bpos;
use crate::btree::{BtreeId, Node, BTREE_MAX_DEPTH};
use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicU32, Ordering};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcPhase {
    NotRunning,
    Start,
    Sb,
    /// Declared for ordering; pending node frees are not marked until full
    /// GC tolerates the btree key cache.
    PendingDelete,
    Btree(BtreeId),
    Alloc,
    Done,
}

impl GcPhase {
    fn rank(self) -> u32 {
        const NR: u32 = crate::btree::BTREE_ID_NR as u32;
        match self {
            GcPhase::NotRunning => 0,
            GcPhase::Start => 1,
            GcPhase::Sb => 2,
            GcPhase::PendingDelete => 3,
            GcPhase::Btree(id) => 4 + id.gc_phase_order() as u32,
            GcPhase::Alloc => 4 + NR,
            GcPhase::Done => 5 + NR,
        }
    }
}

impl PartialOrd for GcPhase {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GcPhase {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// A point in the GC total order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct GcPos {
    pub phase: GcPhase,
    pub level: u8,
    pub pos: Bpos,
}

pub fn gc_phase(phase: GcPhase) -> GcPos {
    GcPos {
        phase,
        level: 0,
        pos: Bpos::MIN,
    }
}

pub fn gc_pos_btree(btree: BtreeId, level: u8, pos: Bpos) -> GcPos {
    GcPos {
        phase: GcPhase::Btree(btree),
        level,
        pos,
    }
}

/// Position of one btree node's key walk.
pub fn gc_pos_btree_node(node: &Node) -> GcPos {
    gc_pos_btree(node.btree, node.level, node.min_key)
}

/// Sentinel ordered after every node of the btree: marking the pointer to
/// the root.
pub fn gc_pos_btree_root(btree: BtreeId) -> GcPos {
    gc_pos_btree(btree, BTREE_MAX_DEPTH, Bpos::MAX)
}

/// Position within the allocator phase; `slot` advances per open bucket so
/// the allocator can synchronize against a partially marked table.
pub fn gc_pos_alloc(slot: Option<usize>) -> GcPos {
    GcPos {
        phase: GcPhase::Alloc,
        level: 0,
        pos: Bpos::new(0, slot.map(|s| s as u64 + 1).unwrap_or(0)),
    }
}

/// Sequence-counted cell holding the cursor.
///
/// Readers retry on a concurrent write and never block; the single writer
/// is the GC orchestrator, serialized by holding `gc_lock` for writing.
pub struct GcPosCell {
    seq: AtomicU32,
    pos: UnsafeCell<GcPos>,
}

// SAFETY: `pos` is only written by the single GC writer while `seq` is odd;
// readers detect torn reads via the sequence counter and retry.
unsafe impl Sync for GcPosCell {}
unsafe impl Send for GcPosCell {}

impl GcPosCell {
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            pos: UnsafeCell::new(gc_phase(GcPhase::NotRunning)),
        }
    }

    /// Move the cursor. Callers other than the end-of-run reset must only
    /// ever move it forward.
    pub(crate) fn set(&self, new: GcPos) {
        let seq = self.seq.load(Ordering::Relaxed);
        debug_assert_eq!(seq & 1, 0);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: writers are serialized; readers retry while seq is odd.
        unsafe { core::ptr::write_volatile(self.pos.get(), new) };
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Lock-free snapshot, retried on concurrent writes.
    pub fn snapshot(&self) -> GcPos {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if seq & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }
            // SAFETY: a torn read is discarded below when seq has moved.
            let pos = unsafe { core::ptr::read_volatile(self.pos.get()) };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == seq {
                return pos;
            }
        }
    }

    /// Whether the sweep has yet to reach `pos`. A mutator whose reference
    /// sits at a position the GC already passed must mirror its change into
    /// the shadow counters itself.
    pub fn will_visit(&self, pos: GcPos) -> bool {
        self.snapshot() < pos
    }
}
