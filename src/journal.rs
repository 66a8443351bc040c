//! The journal facade and the journal-key overlay.
//!
//! During recovery the GC may discover index damage it cannot fix by
//! touching nodes directly; repairs are buffered as journal keys at
//! `(btree, level, pos)` and drained by the recovery caller once GC
//! returns. A deleted key acts as a whiteout over the on-disk key at the
//! same position.

use crate::bkey::{BKey, Bpos};
use crate::btree::BtreeId;
use crate::prelude::*;
use core::sync::atomic::{AtomicU64, Ordering};

pub struct Journal {
    seq: AtomicU64,
    blocked: CvarMutex<u32>,
    unblocked: Condvar,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            blocked: CvarMutex::new(0),
            unblocked: Condvar::new(),
        }
    }

    pub fn cur_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn bump_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Stall journal writers until `unblock()`.
    pub fn block(&self) {
        *self.blocked.lock().unwrap() += 1;
    }

    pub fn unblock(&self) {
        let mut blocked = self.blocked.lock().unwrap();
        debug_assert!(*blocked > 0);
        *blocked -= 1;
        if *blocked == 0 {
            self.unblocked.notify_all();
        }
    }

    pub fn is_blocked(&self) -> bool {
        *self.blocked.lock().unwrap() > 0
    }

    /// Writers call this before appending an entry.
    pub fn wait_unblocked(&self) {
        let mut blocked = self.blocked.lock().unwrap();
        while *blocked > 0 {
            blocked = self.unblocked.wait(blocked).unwrap();
        }
    }
}

/// Buffered index repairs, ordered by `(btree, level, pos)`.
pub struct JournalKeys {
    keys: Mutex<BTreeMap<(BtreeId, u8, Bpos), BKey>>,
}

impl JournalKeys {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, btree: BtreeId, level: u8, key: BKey) -> Result<()> {
        self.keys.lock().insert((btree, level, key.pos), key);
        Ok(())
    }

    /// Whiteout the key at `pos`.
    pub fn delete(&self, btree: BtreeId, level: u8, pos: Bpos) -> Result<()> {
        self.insert(btree, level, BKey::deleted(pos))
    }

    pub fn get(&self, btree: BtreeId, level: u8, pos: Bpos) -> Option<BKey> {
        self.keys.lock().get(&(btree, level, pos)).cloned()
    }

    /// All overlay keys for one node's `(btree, level)` range, in order.
    pub fn for_node(&self, btree: BtreeId, level: u8, min_key: Bpos, max_key: Bpos) -> Vec<BKey> {
        self.keys
            .lock()
            .range((btree, level, min_key)..=(btree, level, max_key))
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    /// Hand the buffered repairs to the recovery caller.
    pub fn drain(&self) -> Vec<(BtreeId, u8, BKey)> {
        let mut keys = self.keys.lock();
        core::mem::take(&mut *keys)
            .into_iter()
            .map(|((btree, level, _), k)| (btree, level, k))
            .collect()
    }
}
