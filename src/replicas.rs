//! Replica-set registry backed by the superblock.
//!
//! Every key holding dirty pointers must have its replica set (data type
//! plus the devices holding a copy) recorded before the key goes live;
//! the initial GC pass re-checks and re-records them.

use crate::bkey::{BKey, BkeyVal, DataType};
use crate::prelude::*;
use hashbrown::HashSet;

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ReplicaEntry {
    pub data_type: DataType,
    pub devs: Vec<u32>,
}

impl ReplicaEntry {
    /// The replica set of a key, `None` for keys with no dirty pointers.
    pub fn from_key(k: &BKey) -> Option<ReplicaEntry> {
        let data_type = match k.val {
            BkeyVal::BtreePtrV1 { .. } | BkeyVal::BtreePtrV2 { .. } => DataType::Btree,
            BkeyVal::Stripe { .. } => DataType::Parity,
            _ => DataType::User,
        };
        let mut devs: Vec<u32> = k
            .ptrs()
            .iter()
            .filter(|p| !p.cached)
            .map(|p| p.dev)
            .collect();
        devs.sort_unstable();
        devs.dedup();
        if devs.is_empty() {
            return None;
        }
        Some(ReplicaEntry { data_type, devs })
    }
}

impl fmt::Display for ReplicaEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.data_type.name())?;
        for (i, dev) in self.devs.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { " " } else { "/" }, dev)?;
        }
        Ok(())
    }
}

pub struct Replicas {
    entries: Mutex<HashSet<ReplicaEntry>>,
}

impl Replicas {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashSet::new()),
        }
    }

    /// Whether the key's replica set is already recorded. Keys without
    /// dirty pointers need no entry.
    pub fn marked(&self, k: &BKey) -> bool {
        match ReplicaEntry::from_key(k) {
            Some(e) => self.entries.lock().contains(&e),
            None => true,
        }
    }

    pub fn mark_key(&self, k: &BKey) -> Result<()> {
        if let Some(e) = ReplicaEntry::from_key(k) {
            self.entries.lock().insert(e);
        }
        Ok(())
    }

    pub fn entries(&self) -> Vec<ReplicaEntry> {
        let mut v: Vec<_> = self.entries.lock().iter().cloned().collect();
        v.sort_by(|a, b| (a.data_type as u8, &a.devs).cmp(&(b.data_type as u8, &b.devs)));
        v
    }
}
