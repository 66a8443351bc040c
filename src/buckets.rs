//! Bucket state and space accounting.
//!
//! All reference counting funnels through [`mark_key`]: the GC calls it
//! with the `gc` trigger flag set to populate the shadow copies, ordinary
//! index updates call [`mark_key_at`], which applies the change to the live
//! copies and mirrors it into the shadow iff the GC cursor has already
//! passed the reference's position.

use crate::bkey::{BKey, BkeyVal, DataType, Ptr, StripePtr, REPLICAS_MAX};
use crate::fs::{Dev, Fs};
use crate::pos::GcPos;
use crate::prelude::*;
use crate::replicas::ReplicaEntry;
use crate::util::{gen_cmp, gen_stale};
use core::sync::atomic::{AtomicUsize, Ordering};
use hashbrown::HashMap;

/// Per-bucket state. Two parallel arrays of these exist per device while GC
/// runs: slot 0 is live, slot 1 is the shadow written by the sweep.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Bucket {
    pub gen: u8,
    pub oldest_gen: u8,
    /// Scratch generation used by the gens pass.
    pub gc_gen: u8,
    pub data_type: DataType,
    pub dirty_sectors: u32,
    pub cached_sectors: u32,
    pub stripe: Option<u64>,
    pub owned_by_allocator: bool,
    /// False until the alloc btree has confirmed `gen`.
    pub gen_valid: bool,
}

impl Bucket {
    /// A bucket the allocator could hand out.
    pub fn is_available(&self) -> bool {
        !self.owned_by_allocator
            && self.dirty_sectors == 0
            && matches!(self.data_type, DataType::Free | DataType::Cached)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TypeUsage {
    pub buckets: u64,
    pub sectors: u64,
    pub fragmented: u64,
}

/// Per-device usage counters.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct DevUsage {
    pub buckets_ec: u64,
    pub buckets_unavailable: u64,
    pub d: [TypeUsage; DataType::NR],
}

/// Per-filesystem usage counters.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FsUsage {
    pub hidden: u64,
    pub btree: u64,
    pub data: u64,
    pub cached: u64,
    pub reserved: u64,
    pub nr_inodes: u64,
    pub persistent_reserved: [u64; REPLICAS_MAX],
    pub replicas: HashMap<ReplicaEntry, u64>,
}

impl FsUsage {
    fn accumulate(&mut self, other: &FsUsage) {
        self.hidden += other.hidden;
        self.btree += other.btree;
        self.data += other.data;
        self.cached += other.cached;
        self.reserved += other.reserved;
        self.nr_inodes += other.nr_inodes;
        for i in 0..REPLICAS_MAX {
            self.persistent_reserved[i] += other.persistent_reserved[i];
        }
        for (e, n) in &other.replicas {
            *self.replicas.entry(e.clone()).or_default() += n;
        }
    }
}

const FS_USAGE_SHARDS: usize = 4;

/// Live fs usage: a base value plus a small array of delta shards standing
/// in for per-CPU counters. Writers pick a shard; reconciliation folds the
/// shards into the base under the mark lock held for writing.
pub struct UsageShards {
    base: Mutex<FsUsage>,
    deltas: Vec<Mutex<FsUsage>>,
    next: AtomicUsize,
}

impl UsageShards {
    pub fn new() -> Self {
        Self {
            base: Mutex::new(FsUsage::default()),
            deltas: (0..FS_USAGE_SHARDS)
                .map(|_| Mutex::new(FsUsage::default()))
                .collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn apply(&self, f: impl FnOnce(&mut FsUsage)) {
        let shard = self.next.fetch_add(1, Ordering::Relaxed) % FS_USAGE_SHARDS;
        f(&mut self.deltas[shard].lock());
    }

    /// Fold all delta shards into the base.
    pub fn fold_to_base(&self) {
        let mut base = self.base.lock();
        for shard in &self.deltas {
            let delta = core::mem::take(&mut *shard.lock());
            base.accumulate(&delta);
        }
    }

    /// Folded view of the live usage.
    pub fn read(&self) -> FsUsage {
        let mut out = self.base.lock().clone();
        for shard in &self.deltas {
            out.accumulate(&shard.lock());
        }
        out
    }

    pub(crate) fn base(&self) -> spin::MutexGuard<'_, FsUsage> {
        self.base.lock()
    }
}

/// Trigger flags for the shared mark routine.
#[derive(Clone, Copy, Default, Debug)]
pub struct MarkFlags {
    /// Write the shadow copies instead of the live ones.
    pub gc: bool,
    /// No concurrent readers exist (recovery); the slow atomic paths may be
    /// skipped.
    pub noatomic: bool,
}

impl MarkFlags {
    pub const LIVE: MarkFlags = MarkFlags {
        gc: false,
        noatomic: false,
    };
    pub const GC: MarkFlags = MarkFlags {
        gc: true,
        noatomic: false,
    };

    pub fn gc_trigger(initial: bool) -> MarkFlags {
        MarkFlags {
            gc: true,
            noatomic: initial,
        }
    }
}

fn add_signed_u32(x: u32, delta: i64) -> u32 {
    (x as i64 + delta).max(0) as u32
}

fn add_signed_u64(x: u64, delta: i64) -> u64 {
    (x as i64 + delta).max(0) as u64
}

/// Remove or add one bucket's contribution to its device's usage counters.
pub(crate) fn dev_usage_account(u: &mut DevUsage, b: &Bucket, bucket_sectors: u32, sign: i64) {
    if b.data_type != DataType::Free {
        let t = &mut u.d[b.data_type as usize];
        t.buckets = add_signed_u64(t.buckets, sign);
        t.sectors = add_signed_u64(t.sectors, sign * b.dirty_sectors as i64);
        if matches!(b.data_type, DataType::User | DataType::Btree)
            && b.dirty_sectors > 0
            && b.dirty_sectors < bucket_sectors
        {
            t.fragmented = add_signed_u64(
                t.fragmented,
                sign * (bucket_sectors - b.dirty_sectors) as i64,
            );
        }
    }
    let cached = &mut u.d[DataType::Cached as usize];
    cached.sectors = add_signed_u64(cached.sectors, sign * b.cached_sectors as i64);

    if b.stripe.is_some() {
        u.buckets_ec = add_signed_u64(u.buckets_ec, sign);
    }
    if !b.is_available() {
        u.buckets_unavailable = add_signed_u64(u.buckets_unavailable, sign);
    }
}

fn usage_apply(fs: &Fs, flags: MarkFlags, f: impl FnOnce(&mut FsUsage)) -> Result<()> {
    if flags.gc {
        fs.usage_gc_apply(f)
    } else {
        fs.usage.apply(f);
        Ok(())
    }
}

fn ptr_dev_bucket(fs: &Fs, ptr: &Ptr) -> Result<(Arc<Dev>, u64)> {
    let dev = fs.dev(ptr.dev)?;
    let bucket = dev.bucket_of(ptr.offset);
    Ok((dev, bucket))
}

/// Read-only copy of the bucket a pointer refers to, from the live or
/// shadow array.
pub(crate) fn ptr_bucket_view(fs: &Fs, ptr: &Ptr, gc: bool) -> Result<Bucket> {
    let (dev, bucket) = ptr_dev_bucket(fs, ptr)?;
    dev.bucket_view(gc, bucket)
}

fn mark_extent(fs: &Fs, k: &BKey, ptrs: &[Ptr], stripe_ptrs: &[StripePtr], flags: MarkFlags, sign: i64) -> Result<()> {
    let sectors = k.size;
    let mut nr_cached_live = 0u32;
    let mut has_dirty = false;

    for ptr in ptrs {
        let (dev, bucket) = ptr_dev_bucket(fs, ptr)?;
        dev.bucket_update(flags.gc, bucket, |g| {
            if ptr.cached {
                // A cached pointer whose gen no longer matches is
                // implicitly dead; it contributes nothing.
                if g.gen != ptr.gen {
                    return;
                }
                g.cached_sectors = add_signed_u32(g.cached_sectors, sign * sectors as i64);
                if g.data_type == DataType::Free && g.cached_sectors > 0 {
                    g.data_type = DataType::Cached;
                }
                if g.cached_sectors == 0
                    && g.dirty_sectors == 0
                    && g.data_type == DataType::Cached
                {
                    g.data_type = DataType::Free;
                }
            } else {
                g.dirty_sectors = add_signed_u32(g.dirty_sectors, sign * sectors as i64);
                g.data_type = if g.dirty_sectors > 0 {
                    DataType::User
                } else if g.cached_sectors > 0 {
                    DataType::Cached
                } else {
                    DataType::Free
                };
            }
        })?;
        if ptr.cached {
            if ptr_bucket_view(fs, ptr, flags.gc)?.gen == ptr.gen {
                nr_cached_live += 1;
            }
        } else {
            has_dirty = true;
        }
    }

    for sp in stripe_ptrs {
        fs.stripes.update(flags.gc, sp.idx, |s| {
            if (sp.block as usize) < s.block_sectors.len() {
                s.block_sectors[sp.block as usize] =
                    add_signed_u32(s.block_sectors[sp.block as usize], sign * sectors as i64);
            }
        })?;
    }

    let entry = ReplicaEntry::from_key(k);
    usage_apply(fs, flags, |u| {
        if has_dirty {
            u.data = add_signed_u64(u.data, sign * sectors as i64);
        }
        u.cached = add_signed_u64(
            u.cached,
            sign * sectors as i64 * nr_cached_live as i64,
        );
        if let Some(entry) = entry {
            let n = u.replicas.entry(entry).or_default();
            *n = add_signed_u64(*n, sign * sectors as i64);
        }
    })
}

fn mark_btree_ptr(fs: &Fs, k: &BKey, ptrs: &[Ptr], flags: MarkFlags, sign: i64) -> Result<()> {
    let sectors = k.size;
    for ptr in ptrs {
        let (dev, bucket) = ptr_dev_bucket(fs, ptr)?;
        dev.bucket_update(flags.gc, bucket, |g| {
            g.dirty_sectors = add_signed_u32(g.dirty_sectors, sign * sectors as i64);
            g.data_type = if g.dirty_sectors > 0 {
                DataType::Btree
            } else {
                DataType::Free
            };
        })?;
    }
    let entry = ReplicaEntry::from_key(k);
    usage_apply(fs, flags, |u| {
        u.btree = add_signed_u64(u.btree, sign * sectors as i64 * ptrs.len() as i64);
        if let Some(entry) = entry {
            let n = u.replicas.entry(entry).or_default();
            *n = add_signed_u64(*n, sign * sectors as i64);
        }
    })
}

fn mark_stripe(
    fs: &Fs,
    k: &BKey,
    algorithm: u8,
    nr_blocks: u8,
    nr_redundant: u8,
    ptrs: &[Ptr],
    flags: MarkFlags,
    sign: i64,
) -> Result<()> {
    let idx = k.pos.offset;
    let sectors = k.size;

    fs.stripes.update(flags.gc, idx, |s| {
        if sign > 0 {
            s.alive = true;
            s.sectors = sectors;
            s.algorithm = algorithm;
            s.nr_blocks = nr_blocks;
            s.nr_redundant = nr_redundant;
            s.block_sectors.resize(nr_blocks as usize, 0);
        } else {
            s.alive = false;
        }
    })?;

    let nr_data = nr_blocks.saturating_sub(nr_redundant) as usize;
    for (i, ptr) in ptrs.iter().enumerate() {
        let (dev, bucket) = ptr_dev_bucket(fs, ptr)?;
        dev.bucket_update(flags.gc, bucket, |g| {
            g.stripe = if sign > 0 { Some(idx) } else { None };
            if i >= nr_data {
                g.dirty_sectors = add_signed_u32(g.dirty_sectors, sign * sectors as i64);
                g.data_type = if g.dirty_sectors > 0 {
                    DataType::Parity
                } else {
                    DataType::Free
                };
            }
        })?;
    }

    let entry = ReplicaEntry::from_key(k);
    usage_apply(fs, flags, |u| {
        if let Some(entry) = entry {
            let n = u.replicas.entry(entry).or_default();
            *n = add_signed_u64(*n, sign * sectors as i64);
        }
    })
}

fn mark_alloc_key(fs: &Fs, k: &BKey, gen: u8, flags: MarkFlags, sign: i64) -> Result<()> {
    if sign < 0 {
        return Ok(());
    }
    let dev = fs.dev(k.pos.inode as u32)?;
    dev.bucket_update(flags.gc, k.pos.offset, |g| {
        g.gen = gen;
        g.gen_valid = true;
    })
}

fn mark_key_sign(fs: &Fs, k: &BKey, flags: MarkFlags, sign: i64) -> Result<()> {
    match &k.val {
        BkeyVal::Deleted => Ok(()),
        BkeyVal::Extent { ptrs, stripe_ptrs } | BkeyVal::Reflink { ptrs, stripe_ptrs } => {
            mark_extent(fs, k, ptrs, stripe_ptrs, flags, sign)
        }
        BkeyVal::Reservation { nr_replicas } => {
            let nr = (*nr_replicas as usize).clamp(1, REPLICAS_MAX);
            usage_apply(fs, flags, |u| {
                u.persistent_reserved[nr - 1] =
                    add_signed_u64(u.persistent_reserved[nr - 1], sign * k.size as i64);
            })
        }
        BkeyVal::Inode => usage_apply(fs, flags, |u| {
            u.nr_inodes = add_signed_u64(u.nr_inodes, sign);
        }),
        BkeyVal::BtreePtrV1 { ptrs } | BkeyVal::BtreePtrV2 { ptrs, .. } => {
            mark_btree_ptr(fs, k, ptrs, flags, sign)
        }
        BkeyVal::Alloc { gen } => mark_alloc_key(fs, k, *gen, flags, sign),
        BkeyVal::Stripe {
            algorithm,
            nr_blocks,
            nr_redundant,
            ptrs,
        } => mark_stripe(fs, k, *algorithm, *nr_blocks, *nr_redundant, ptrs, flags, sign),
    }
}

/// Apply one key to the accounting selected by `flags`.
pub fn mark_key(fs: &Fs, k: &BKey, flags: MarkFlags) -> Result<()> {
    mark_key_sign(fs, k, flags, 1)
}

/// Remove one key's contribution from the accounting selected by `flags`.
pub fn unmark_key(fs: &Fs, k: &BKey, flags: MarkFlags) -> Result<()> {
    mark_key_sign(fs, k, flags, -1)
}

fn mark_key_at_sign(fs: &Fs, k: &BKey, pos: GcPos, sign: i64) -> Result<()> {
    let _mark = fs.mark_lock.read().unwrap();
    mark_key_sign(fs, k, MarkFlags::LIVE, sign)?;
    // GC already swept past this position, so it will not see the
    // reference; mirror the change into the shadow copy.
    if fs.gc_active() && !fs.will_visit(pos) {
        mark_key_sign(fs, k, MarkFlags::GC, sign)?;
    }
    Ok(())
}

/// Mark a new reference at position `pos`, honoring the concurrent-GC
/// ordering contract.
pub fn mark_key_at(fs: &Fs, k: &BKey, pos: GcPos) -> Result<()> {
    mark_key_at_sign(fs, k, pos, 1)
}

/// Drop a reference at position `pos`, honoring the concurrent-GC ordering
/// contract.
pub fn unmark_key_at(fs: &Fs, k: &BKey, pos: GcPos) -> Result<()> {
    mark_key_at_sign(fs, k, pos, -1)
}

/// Stamp a metadata (superblock or journal) bucket.
pub fn mark_metadata_bucket(
    fs: &Fs,
    dev: &Dev,
    bucket: u64,
    data_type: DataType,
    sectors: u32,
    flags: MarkFlags,
) -> Result<()> {
    debug_assert!(matches!(data_type, DataType::Sb | DataType::Journal));
    dev.bucket_update(flags.gc, bucket, |g| {
        g.data_type = data_type;
        g.dirty_sectors = add_signed_u32(g.dirty_sectors, sectors as i64);
    })?;
    usage_apply(fs, flags, |u| {
        u.hidden += sectors as u64;
    })
}

/// Flag a bucket as owned by the allocator (on a freelist or held open).
pub fn mark_alloc_bucket(dev: &Dev, bucket: u64, owned: bool, flags: MarkFlags) -> Result<()> {
    dev.bucket_update(flags.gc, bucket, |g| {
        g.owned_by_allocator = owned;
    })
}

/// Stale-cached check shared by the marker and the gens pass: how far the
/// pointer lags its bucket.
pub(crate) fn ptr_stale(g: &Bucket, ptr: &Ptr) -> u8 {
    gen_stale(g.gen, ptr.gen)
}

/// Whether the pointer's gen is ahead of its bucket's.
pub(crate) fn ptr_in_future(g: &Bucket, ptr: &Ptr) -> bool {
    gen_cmp(ptr.gen, g.gen) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::Bpos;
    use crate::config::FsConfig;
    use crate::fs::{DevConfig, Fs};

    fn extent_at(dev: u32, offset: u64, gen: u8, cached: bool, sectors: u32) -> BKey {
        BKey::new(
            Bpos::new(1, offset),
            sectors,
            BkeyVal::Extent {
                ptrs: vec![Ptr {
                    dev,
                    offset,
                    gen,
                    cached,
                }],
                stripe_ptrs: vec![],
            },
        )
    }

    fn new_fs() -> Arc<Fs> {
        Fs::new(FsConfig::default(), vec![DevConfig::default()]).unwrap()
    }

    #[test]
    fn mark_unmark_roundtrip() {
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        let k = extent_at(0, 20 * dev.bucket_sectors as u64, 0, false, 8);

        mark_key(&fs, &k, MarkFlags::LIVE).unwrap();
        let g = dev.bucket_view(false, 20).unwrap();
        assert_eq!(g.data_type, DataType::User);
        assert_eq!(g.dirty_sectors, 8);
        assert_eq!(fs.usage.read().data, 8);

        unmark_key(&fs, &k, MarkFlags::LIVE).unwrap();
        let g = dev.bucket_view(false, 20).unwrap();
        assert_eq!(g.data_type, DataType::Free);
        assert_eq!(g.dirty_sectors, 0);
        assert_eq!(fs.usage.read().data, 0);
    }

    #[test]
    fn stale_cached_ptr_is_dead() {
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        dev.bucket_update(false, 21, |g| g.gen = 4).unwrap();

        let k = extent_at(0, 21 * dev.bucket_sectors as u64, 3, true, 8);
        mark_key(&fs, &k, MarkFlags::LIVE).unwrap();
        assert_eq!(dev.bucket_view(false, 21).unwrap().cached_sectors, 0);
        assert_eq!(fs.usage.read().cached, 0);
    }

    #[test]
    fn dev_usage_transitions() {
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        let bucket_sectors = dev.bucket_sectors;
        let before = dev.usage_view(false).unwrap();

        let k = extent_at(0, 22 * bucket_sectors as u64, 0, false, 8);
        mark_key(&fs, &k, MarkFlags::LIVE).unwrap();

        let after = dev.usage_view(false).unwrap();
        let user = DataType::User as usize;
        assert_eq!(after.d[user].buckets - before.d[user].buckets, 1);
        assert_eq!(after.d[user].sectors - before.d[user].sectors, 8);
        assert_eq!(
            after.d[user].fragmented - before.d[user].fragmented,
            (bucket_sectors - 8) as u64
        );
        assert_eq!(after.buckets_unavailable - before.buckets_unavailable, 1);
    }

    #[test]
    fn shards_fold_into_base() {
        let shards = UsageShards::new();
        for _ in 0..10 {
            shards.apply(|u| u.data += 1);
        }
        assert_eq!(shards.read().data, 10);
        shards.fold_to_base();
        assert_eq!(shards.base().data, 10);
        assert_eq!(shards.read().data, 10);
    }
}
