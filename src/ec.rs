//! Erasure-coded stripe bookkeeping, kept as a live/shadow pair like the
//! bucket arrays.

use crate::prelude::*;
use hashbrown::HashMap;

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Stripe {
    pub alive: bool,
    pub sectors: u32,
    pub algorithm: u8,
    pub nr_blocks: u8,
    pub nr_redundant: u8,
    pub block_sectors: Vec<u32>,
    pub blocks_nonempty: u32,
}

pub struct StripeTables {
    live: Mutex<HashMap<u64, Stripe>>,
    gc: Mutex<Option<HashMap<u64, Stripe>>>,
}

impl StripeTables {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            gc: Mutex::new(None),
        }
    }

    pub fn live(&self) -> spin::MutexGuard<'_, HashMap<u64, Stripe>> {
        self.live.lock()
    }

    pub fn gc(&self) -> spin::MutexGuard<'_, Option<HashMap<u64, Stripe>>> {
        self.gc.lock()
    }

    /// Allocate the shadow stripe table for a GC run.
    pub fn gc_mem_alloc(&self) -> Result<()> {
        let mut gc = self.gc.lock();
        if gc.is_some() {
            return_errno_with_msg!(Invalid, "gc stripe table already allocated");
        }
        *gc = Some(HashMap::with_capacity(self.live.lock().len()));
        Ok(())
    }

    pub fn gc_free(&self) {
        *self.gc.lock() = None;
    }

    /// Whether stripe `idx` is alive in the given copy. During a GC run the
    /// shadow copy is authoritative for repair decisions.
    pub fn is_alive(&self, idx: u64, gc: bool) -> bool {
        if gc {
            self.gc
                .lock()
                .as_ref()
                .map(|t| t.get(&idx).map(|s| s.alive).unwrap_or(false))
                .unwrap_or(false)
        } else {
            self.live
                .lock()
                .get(&idx)
                .map(|s| s.alive)
                .unwrap_or(false)
        }
    }

    pub(crate) fn update(
        &self,
        gc: bool,
        idx: u64,
        f: impl FnOnce(&mut Stripe),
    ) -> Result<()> {
        if gc {
            let mut guard = self.gc.lock();
            let Some(table) = guard.as_mut() else {
                return_errno_with_msg!(Invalid, "no gc stripe table allocated");
            };
            f(table.entry(idx).or_default());
        } else {
            f(self.live.lock().entry(idx).or_default());
        }
        Ok(())
    }
}
