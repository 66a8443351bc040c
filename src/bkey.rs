//! Keys of the versioned btrees.
//!
//! A `BKey` is a tagged variant over the key types the GC walks: extents
//! (with data and stripe pointers), btree node pointers (v1 and v2),
//! reflink extents, reservations, inodes, bucket-gen records and stripes.

use crate::prelude::*;
use crate::util::div_round_up;
use serde::{Deserialize, Serialize};

/// Maximum replication factor.
pub const REPLICAS_MAX: usize = 4;

/// Position of a key: (inode, offset) pairs, totally ordered.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Bpos {
    pub inode: u64,
    pub offset: u64,
}

impl Bpos {
    pub const MIN: Bpos = Bpos {
        inode: 0,
        offset: 0,
    };
    pub const MAX: Bpos = Bpos {
        inode: u64::MAX,
        offset: u64::MAX,
    };

    pub const fn new(inode: u64, offset: u64) -> Self {
        Bpos { inode, offset }
    }

    /// The smallest position strictly greater than `self`, carrying from
    /// offset into inode.
    pub fn successor(self) -> Bpos {
        if self.offset < u64::MAX {
            Bpos::new(self.inode, self.offset + 1)
        } else {
            Bpos::new(self.inode + 1, 0)
        }
    }
}

impl fmt::Display for Bpos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

/// A data pointer embedded in a key.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Ptr {
    pub dev: u32,
    /// Device offset in sectors.
    pub offset: u64,
    pub gen: u8,
    pub cached: bool,
}

/// A stripe membership entry embedded in an extent.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct StripePtr {
    pub idx: u64,
    pub block: u8,
}

/// What a bucket holds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    #[default]
    Free = 0,
    Sb,
    Journal,
    Btree,
    User,
    Cached,
    Parity,
}

impl DataType {
    pub const NR: usize = 7;

    pub fn name(self) -> &'static str {
        match self {
            DataType::Free => "free",
            DataType::Sb => "sb",
            DataType::Journal => "journal",
            DataType::Btree => "btree",
            DataType::User => "user",
            DataType::Cached => "cached",
            DataType::Parity => "parity",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum BkeyVal {
    Deleted,
    Extent {
        ptrs: Vec<Ptr>,
        stripe_ptrs: Vec<StripePtr>,
    },
    /// Indirect extent, marked exactly like a plain one.
    Reflink {
        ptrs: Vec<Ptr>,
        stripe_ptrs: Vec<StripePtr>,
    },
    Reservation {
        nr_replicas: u8,
    },
    Inode,
    BtreePtrV1 {
        ptrs: Vec<Ptr>,
    },
    BtreePtrV2 {
        ptrs: Vec<Ptr>,
        /// Declared lower bound of the child's key range.
        min_key: Bpos,
        seq: u64,
        /// Set when the GC rewrote the declared range of this pointer.
        range_updated: bool,
    },
    /// Bucket-gen record from the alloc btree; seeing one is what makes a
    /// bucket's gen trustworthy.
    Alloc {
        gen: u8,
    },
    Stripe {
        algorithm: u8,
        nr_blocks: u8,
        nr_redundant: u8,
        ptrs: Vec<Ptr>,
    },
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BKey {
    pub pos: Bpos,
    /// Extent size in sectors.
    pub size: u32,
    pub version: u64,
    pub val: BkeyVal,
}

impl BKey {
    pub fn new(pos: Bpos, size: u32, val: BkeyVal) -> Self {
        BKey {
            pos,
            size,
            version: 0,
            val,
        }
    }

    /// A whiteout at `pos`.
    pub fn deleted(pos: Bpos) -> Self {
        BKey::new(pos, 0, BkeyVal::Deleted)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.val, BkeyVal::Deleted)
    }

    pub fn is_btree_ptr(&self) -> bool {
        matches!(
            self.val,
            BkeyVal::BtreePtrV1 { .. } | BkeyVal::BtreePtrV2 { .. }
        )
    }

    pub fn ptrs(&self) -> &[Ptr] {
        match &self.val {
            BkeyVal::Extent { ptrs, .. }
            | BkeyVal::Reflink { ptrs, .. }
            | BkeyVal::BtreePtrV1 { ptrs }
            | BkeyVal::BtreePtrV2 { ptrs, .. }
            | BkeyVal::Stripe { ptrs, .. } => ptrs,
            _ => &[],
        }
    }

    pub fn stripe_ptrs(&self) -> &[StripePtr] {
        match &self.val {
            BkeyVal::Extent { stripe_ptrs, .. } | BkeyVal::Reflink { stripe_ptrs, .. } => {
                stripe_ptrs
            }
            _ => &[],
        }
    }

    /// Keep only the pointers `keep` approves of. An extent left with no
    /// pointers at all becomes a whiteout.
    pub fn retain_ptrs(&mut self, mut keep: impl FnMut(&Ptr) -> bool) {
        let emptied = match &mut self.val {
            BkeyVal::Extent { ptrs, .. }
            | BkeyVal::Reflink { ptrs, .. }
            | BkeyVal::BtreePtrV1 { ptrs }
            | BkeyVal::BtreePtrV2 { ptrs, .. }
            | BkeyVal::Stripe { ptrs, .. } => {
                ptrs.retain(&mut keep);
                ptrs.is_empty()
            }
            _ => false,
        };
        if emptied && matches!(self.val, BkeyVal::Extent { .. } | BkeyVal::Reflink { .. }) {
            self.val = BkeyVal::Deleted;
        }
    }

    pub fn remove_stripe_ptr(&mut self, nth: usize) {
        if let BkeyVal::Extent { stripe_ptrs, .. } | BkeyVal::Reflink { stripe_ptrs, .. } =
            &mut self.val
        {
            stripe_ptrs.remove(nth);
        }
    }

    /// The data type a pointer of this key stamps its bucket with.
    pub fn ptr_data_type(&self, ptr: &Ptr) -> DataType {
        match self.val {
            BkeyVal::BtreePtrV1 { .. } | BkeyVal::BtreePtrV2 { .. } => DataType::Btree,
            BkeyVal::Stripe { .. } => DataType::Parity,
            _ if ptr.cached => DataType::Cached,
            _ => DataType::User,
        }
    }

    /// Unpacked in-node size, in 64-bit words.
    pub fn u64s(&self) -> usize {
        3 + match &self.val {
            BkeyVal::Deleted => 0,
            BkeyVal::Extent { ptrs, stripe_ptrs } | BkeyVal::Reflink { ptrs, stripe_ptrs } => {
                ptrs.len() + stripe_ptrs.len()
            }
            BkeyVal::Reservation { .. } => 1,
            BkeyVal::Inode => 2,
            BkeyVal::BtreePtrV1 { ptrs } => ptrs.len(),
            BkeyVal::BtreePtrV2 { ptrs, .. } => 3 + ptrs.len(),
            BkeyVal::Alloc { .. } => 1,
            BkeyVal::Stripe { ptrs, .. } => 2 + ptrs.len(),
        }
    }
}

/// State for computing a packed key format spanning several nodes.
#[derive(Default)]
pub struct FormatState {
    min: Option<Bpos>,
    max: Option<Bpos>,
}

impl FormatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_range(&mut self, min_key: Bpos, max_key: Bpos) {
        self.min = Some(match self.min {
            Some(cur) => cur.min(min_key),
            None => min_key,
        });
        self.max = Some(match self.max {
            Some(cur) => cur.max(max_key),
            None => max_key,
        });
    }

    pub fn done(self) -> BkeyFormat {
        let base = self.min.unwrap_or(Bpos::MIN);
        let max = self.max.unwrap_or(Bpos::MIN);
        BkeyFormat {
            base,
            inode_bits: bits_for(max.inode - base.inode),
            // Offsets restart per inode, so they pack relative to zero
            offset_bits: bits_for(max.offset),
        }
    }
}

fn bits_for(v: u64) -> u32 {
    64 - v.leading_zeros()
}

/// A packed key format: positions are stored as bit-packed deltas from a
/// base position.
#[derive(Clone, Copy, Debug)]
pub struct BkeyFormat {
    pub base: Bpos,
    pub inode_bits: u32,
    pub offset_bits: u32,
}

impl BkeyFormat {
    /// Packed size of `k` under this format, in 64-bit words.
    pub fn packed_u64s(&self, k: &BKey) -> usize {
        let header_bits = self.inode_bits + self.offset_bits + 32 + 8;
        1 + div_round_up(header_bits as usize, 64) + (k.u64s() - 3)
    }

    /// Whether `k` can be represented at all: its position fields must not
    /// underflow the base.
    pub fn fits(&self, k: &BKey) -> bool {
        k.pos >= self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pos_order_and_successor() {
        assert!(Bpos::new(1, 5) < Bpos::new(2, 0));
        assert!(Bpos::new(1, 5) < Bpos::new(1, 6));
        assert_eq!(Bpos::new(1, 5).successor(), Bpos::new(1, 6));
        assert_eq!(Bpos::new(1, u64::MAX).successor(), Bpos::new(2, 0));
    }

    #[test]
    fn retain_ptrs_whiteouts_empty_extents() {
        let mut k = BKey::new(
            Bpos::new(1, 8),
            8,
            BkeyVal::Extent {
                ptrs: vec![Ptr {
                    dev: 0,
                    offset: 0,
                    gen: 0,
                    cached: false,
                }],
                stripe_ptrs: vec![],
            },
        );
        k.retain_ptrs(|_| false);
        assert!(k.is_deleted());
    }

    #[test]
    fn format_spans_nodes() {
        let mut state = FormatState::new();
        state.add_range(Bpos::new(1, 0), Bpos::new(1, 100));
        state.add_range(Bpos::new(1, 101), Bpos::new(3, 50));
        let fmt = state.done();
        assert_eq!(fmt.base, Bpos::new(1, 0));
        assert!(fmt.fits(&BKey::deleted(Bpos::new(2, 0))));
        assert!(!fmt.fits(&BKey::deleted(Bpos::new(0, 0))));
    }
}
