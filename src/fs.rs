//! The filesystem assembly: devices, bucket arrays, locks and the shared
//! state the GC, the allocator and ordinary index updates coordinate
//! through.

use crate::bkey::DataType;
use crate::btree::{BtreeCache, BtreeRoot, NodeStore, BTREE_ID_NR};
use crate::buckets::{dev_usage_account, Bucket, DevUsage, FsUsage, UsageShards};
use crate::config::FsConfig;
use crate::ec::StripeTables;
use crate::fsck::FsckSink;
use crate::journal::{Journal, JournalKeys};
use crate::pos::{GcPos, GcPosCell};
use crate::prelude::*;
use crate::replicas::Replicas;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::collections::VecDeque;

/// Sector of the primary superblock copy; the region below it is reserved.
pub const SB_SECTOR: u64 = 8;

/// Allocator reserves, most to least constrained.
pub const RESERVE_NR: usize = 3;

pub const OPEN_BUCKETS_COUNT: usize = 64;

/// Filesystem flag bits.
pub const FS_NEED_ANOTHER_GC: u64 = 1 << 0;
pub const FS_NEED_ALLOC_WRITE: u64 = 1 << 1;
pub const FS_REBUILD_REPLICAS: u64 = 1 << 2;

#[derive(Clone, Debug)]
pub struct DevConfig {
    pub nbuckets: u64,
    pub bucket_sectors: u32,
    pub sb_offsets: Vec<u64>,
    pub sb_max_size_bits: u32,
    pub journal_buckets: Vec<u64>,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            nbuckets: 128,
            bucket_sectors: 128,
            sb_offsets: vec![SB_SECTOR],
            sb_max_size_bits: 5,
            journal_buckets: vec![1, 2],
        }
    }
}

/// One member device.
pub struct Dev {
    pub id: u32,
    pub nbuckets: u64,
    pub bucket_sectors: u32,
    pub sb_offsets: Vec<u64>,
    pub sb_max_size_bits: u32,
    pub journal_buckets: Vec<u64>,
    /// Live bucket array.
    buckets: Mutex<Vec<Bucket>>,
    /// Shadow bucket array, allocated only while GC runs.
    buckets_gc: Mutex<Option<Vec<Bucket>>>,
    usage: Mutex<DevUsage>,
    usage_gc: Mutex<Option<DevUsage>>,
    alloc_cursor: AtomicU64,
    allocator_sleep: CvarMutex<()>,
    allocator_wait: Condvar,
}

impl Dev {
    fn new(id: u32, cfg: DevConfig) -> Self {
        let buckets = vec![
            Bucket {
                // A fresh format writes alloc info, so gens start trusted
                gen_valid: true,
                ..Bucket::default()
            };
            cfg.nbuckets as usize
        ];
        Self {
            id,
            nbuckets: cfg.nbuckets,
            bucket_sectors: cfg.bucket_sectors,
            sb_offsets: cfg.sb_offsets,
            sb_max_size_bits: cfg.sb_max_size_bits,
            journal_buckets: cfg.journal_buckets,
            buckets: Mutex::new(buckets),
            buckets_gc: Mutex::new(None),
            usage: Mutex::new(DevUsage::default()),
            usage_gc: Mutex::new(None),
            alloc_cursor: AtomicU64::new(0),
            allocator_sleep: CvarMutex::new(()),
            allocator_wait: Condvar::new(),
        }
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.nbuckets * self.bucket_sectors as u64
    }

    /// Bucket number holding the given device offset.
    pub fn bucket_of(&self, offset_sectors: u64) -> u64 {
        offset_sectors / self.bucket_sectors as u64
    }

    pub fn bucket_to_sector(&self, bucket: u64) -> u64 {
        bucket * self.bucket_sectors as u64
    }

    pub fn bucket_view(&self, gc: bool, bucket: u64) -> Result<Bucket> {
        if bucket >= self.nbuckets {
            return_errno_with_msg!(Invalid, "bucket out of range");
        }
        if gc {
            match self.buckets_gc.lock().as_ref() {
                Some(arr) => Ok(arr[bucket as usize]),
                None => return_errno_with_msg!(Invalid, "no gc bucket array allocated"),
            }
        } else {
            Ok(self.buckets.lock()[bucket as usize])
        }
    }

    /// Mutate one bucket, keeping the matching usage counters in step.
    pub(crate) fn bucket_update(
        &self,
        gc: bool,
        bucket: u64,
        f: impl FnOnce(&mut Bucket),
    ) -> Result<()> {
        if bucket >= self.nbuckets {
            return_errno_with_msg!(Invalid, "bucket out of range");
        }
        if gc {
            let mut arr = self.buckets_gc.lock();
            let Some(arr) = arr.as_mut() else {
                return_errno_with_msg!(Invalid, "no gc bucket array allocated");
            };
            let mut usage = self.usage_gc.lock();
            let Some(usage) = usage.as_mut() else {
                return_errno_with_msg!(Invalid, "no gc dev usage allocated");
            };
            let old = arr[bucket as usize];
            f(&mut arr[bucket as usize]);
            dev_usage_account(usage, &old, self.bucket_sectors, -1);
            dev_usage_account(usage, &arr[bucket as usize], self.bucket_sectors, 1);
        } else {
            let mut arr = self.buckets.lock();
            let mut usage = self.usage.lock();
            let old = arr[bucket as usize];
            f(&mut arr[bucket as usize]);
            dev_usage_account(&mut usage, &old, self.bucket_sectors, -1);
            dev_usage_account(&mut usage, &arr[bucket as usize], self.bucket_sectors, 1);
        }
        Ok(())
    }

    pub fn usage_view(&self, gc: bool) -> Result<DevUsage> {
        if gc {
            match self.usage_gc.lock().as_ref() {
                Some(u) => Ok(u.clone()),
                None => return_errno_with_msg!(Invalid, "no gc dev usage allocated"),
            }
        } else {
            Ok(self.usage.lock().clone())
        }
    }

    /// Direct access to the live bucket array, bypassing usage accounting.
    /// Only for paths that touch generation fields or reconcile wholesale.
    pub(crate) fn with_buckets_live<R>(&self, f: impl FnOnce(&mut Vec<Bucket>) -> R) -> R {
        f(&mut self.buckets.lock())
    }

    pub(crate) fn buckets_live_guard(&self) -> spin::MutexGuard<'_, Vec<Bucket>> {
        self.buckets.lock()
    }

    pub(crate) fn buckets_gc_guard(&self) -> spin::MutexGuard<'_, Option<Vec<Bucket>>> {
        self.buckets_gc.lock()
    }

    pub(crate) fn usage_live_mut<R>(&self, f: impl FnOnce(&mut DevUsage) -> R) -> R {
        f(&mut self.usage.lock())
    }

    /// Allocate the shadow bucket array and usage for a GC run, seeding
    /// each shadow bucket's gen (and oldest_gen) from the live copy.
    pub(crate) fn gc_shadow_alloc(&self) -> Result<()> {
        let live = self.buckets.lock();
        let mut shadow = self.buckets_gc.lock();
        if shadow.is_some() {
            return_errno_with_msg!(Invalid, "gc bucket array already allocated");
        }
        *shadow = Some(
            live.iter()
                .map(|s| Bucket {
                    gen: s.gen,
                    oldest_gen: s.gen,
                    gen_valid: s.gen_valid,
                    ..Bucket::default()
                })
                .collect(),
        );
        *self.usage_gc.lock() = Some(DevUsage::default());
        Ok(())
    }

    pub(crate) fn gc_shadow_free(&self) {
        *self.buckets_gc.lock() = None;
        *self.usage_gc.lock() = None;
    }

    /// Claim a free bucket for a btree node write.
    pub(crate) fn claim_btree_bucket(&self) -> Result<Option<u64>> {
        let start = self.alloc_cursor.load(Ordering::Relaxed) % self.nbuckets;
        for i in 0..self.nbuckets {
            let b = (start + i) % self.nbuckets;
            let mut claimed = false;
            self.bucket_update(false, b, |g| {
                if g.data_type == DataType::Free
                    && !g.owned_by_allocator
                    && g.dirty_sectors == 0
                    && g.cached_sectors == 0
                {
                    g.data_type = DataType::Btree;
                    claimed = true;
                }
            })?;
            if claimed {
                self.alloc_cursor.store(b + 1, Ordering::Relaxed);
                return Ok(Some(b));
            }
        }
        Ok(None)
    }

    /// Wake the allocator thread in case it was waiting on gens to advance.
    pub fn wake_allocator(&self) {
        let _guard = self.allocator_sleep.lock().unwrap();
        self.allocator_wait.notify_all();
    }
}

/// Per-device allocator freelists, all guarded by the filesystem-wide
/// freelist lock.
#[derive(Default)]
pub struct FreeLists {
    pub free_inc: VecDeque<u64>,
    pub free: [VecDeque<u64>; RESERVE_NR],
}

#[derive(Clone, Copy, Default, Debug)]
pub struct OpenBucketSlot {
    pub valid: bool,
    pub dev: u32,
    pub bucket: u64,
}

pub struct OpenBucket {
    pub slot: Mutex<OpenBucketSlot>,
}

impl OpenBucket {
    fn new() -> Self {
        Self {
            slot: Mutex::new(OpenBucketSlot::default()),
        }
    }
}

pub struct Fs {
    pub config: FsConfig,
    pub devs: Vec<Arc<Dev>>,
    /// Btree roots, guarded by one lock (the btree root lock).
    pub(crate) roots: Mutex<Vec<BtreeRoot>>,
    pub node_store: NodeStore,
    pub node_cache: BtreeCache,
    pub journal: Journal,
    pub journal_keys: JournalKeys,
    pub stripes: StripeTables,
    pub replicas: Replicas,
    /// Live fs usage: base plus delta shards.
    pub usage: UsageShards,
    usage_gc: Mutex<Option<FsUsage>>,
    pub fsck: FsckSink,
    flags: AtomicU64,
    pub key_version: AtomicU64,
    pub(crate) gc_pos: GcPosCell,
    /// Read-shared during normal operation and the gens pass,
    /// write-exclusive during full GC.
    pub gc_lock: RwSem<()>,
    /// Read-held while marking keys, write-held by reconciliation.
    pub mark_lock: RwSem<()>,
    pub state_lock: CvarMutex<()>,
    pub sb_lock: CvarMutex<()>,
    /// One lock for every device's freelists.
    pub freelists: Mutex<Vec<FreeLists>>,
    pub open_buckets: [OpenBucket; OPEN_BUCKETS_COUNT],
    pub gc_count: AtomicU64,
    pub(crate) kick_gc: AtomicU32,
    pub(crate) gc_thread: CvarMutex<Option<std::thread::JoinHandle<()>>>,
    pub(crate) gc_stop: AtomicBool,
    pub(crate) gc_sleep: CvarMutex<()>,
    pub(crate) gc_wake: Condvar,
    io_clock_write: AtomicU64,
    pub capacity_sectors: u64,
    interior_updates: CvarMutex<usize>,
    interior_updates_done: Condvar,
    freelist_sleep: CvarMutex<()>,
    freelist_wait: Condvar,
}

impl Fs {
    pub fn new(config: FsConfig, dev_cfgs: Vec<DevConfig>) -> Result<Arc<Fs>> {
        if dev_cfgs.is_empty() {
            return_errno_with_msg!(Invalid, "filesystem needs at least one device");
        }
        let devs: Vec<Arc<Dev>> = dev_cfgs
            .into_iter()
            .enumerate()
            .map(|(i, cfg)| Arc::new(Dev::new(i as u32, cfg)))
            .collect();
        let capacity_sectors = devs.iter().map(|d| d.capacity_sectors()).sum();
        let nr_devs = devs.len();

        let fs = Arc::new(Fs {
            fsck: FsckSink::new(config.fix_errors),
            config,
            devs,
            roots: Mutex::new(vec![BtreeRoot::default(); BTREE_ID_NR]),
            node_store: NodeStore::new(),
            node_cache: BtreeCache::new(),
            journal: Journal::new(),
            journal_keys: JournalKeys::new(),
            stripes: StripeTables::new(),
            replicas: Replicas::new(),
            usage: UsageShards::new(),
            usage_gc: Mutex::new(None),
            flags: AtomicU64::new(0),
            key_version: AtomicU64::new(0),
            gc_pos: GcPosCell::new(),
            gc_lock: RwSem::new(()),
            mark_lock: RwSem::new(()),
            state_lock: CvarMutex::new(()),
            sb_lock: CvarMutex::new(()),
            freelists: Mutex::new((0..nr_devs).map(|_| FreeLists::default()).collect()),
            open_buckets: array_init::array_init(|_| OpenBucket::new()),
            gc_count: AtomicU64::new(0),
            kick_gc: AtomicU32::new(0),
            gc_thread: CvarMutex::new(None),
            gc_stop: AtomicBool::new(false),
            gc_sleep: CvarMutex::new(()),
            gc_wake: Condvar::new(),
            io_clock_write: AtomicU64::new(0),
            capacity_sectors,
            interior_updates: CvarMutex::new(0),
            interior_updates_done: Condvar::new(),
            freelist_sleep: CvarMutex::new(()),
            freelist_wait: Condvar::new(),
        });

        // Account the superblock and journal regions of every member, the
        // same way the device add path does.
        for dev in &fs.devs {
            crate::gc::mark_dev_superblock(&fs, dev, crate::buckets::MarkFlags::LIVE)?;
        }
        Ok(fs)
    }

    pub fn dev(&self, id: u32) -> Result<Arc<Dev>> {
        self.devs
            .get(id as usize)
            .cloned()
            .ok_or(Error::with_msg(Invalid, "no such device"))
    }

    pub fn flag_test(&self, bit: u64) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    pub fn flag_set(&self, bit: u64) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn flag_clear(&self, bit: u64) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }

    /// Whether a GC run currently owns shadow copies.
    pub fn gc_active(&self) -> bool {
        self.usage_gc.lock().is_some()
    }

    pub fn gc_pos_snapshot(&self) -> GcPos {
        self.gc_pos.snapshot()
    }

    /// Whether the sweep has yet to reach `pos`; see the cursor contract.
    pub fn will_visit(&self, pos: GcPos) -> bool {
        self.gc_pos.will_visit(pos)
    }

    pub(crate) fn usage_gc_alloc(&self) -> Result<()> {
        let mut usage = self.usage_gc.lock();
        if usage.is_some() {
            return_errno_with_msg!(Invalid, "gc fs usage already allocated");
        }
        *usage = Some(FsUsage::default());
        Ok(())
    }

    pub(crate) fn usage_gc_free(&self) {
        *self.usage_gc.lock() = None;
    }

    pub(crate) fn usage_gc_apply(&self, f: impl FnOnce(&mut FsUsage)) -> Result<()> {
        let mut usage = self.usage_gc.lock();
        match usage.as_mut() {
            Some(u) => {
                f(u);
                Ok(())
            }
            None => return_errno_with_msg!(Invalid, "no gc fs usage allocated"),
        }
    }

    pub fn usage_gc_view(&self) -> Result<FsUsage> {
        match self.usage_gc.lock().as_ref() {
            Some(u) => Ok(u.clone()),
            None => return_errno_with_msg!(Invalid, "no gc fs usage allocated"),
        }
    }

    /// Track an in-flight interior btree update; full GC drains these
    /// before taking its first snapshot.
    pub fn interior_update_begin(&self) -> InteriorUpdateGuard<'_> {
        *self.interior_updates.lock().unwrap() += 1;
        InteriorUpdateGuard { fs: self }
    }

    pub fn nr_interior_updates(&self) -> usize {
        *self.interior_updates.lock().unwrap()
    }

    pub(crate) fn wait_interior_updates(&self) {
        let mut nr = self.interior_updates.lock().unwrap();
        while *nr > 0 {
            nr = self.interior_updates_done.wait(nr).unwrap();
        }
    }

    /// Wake anything blocked on the freelists (allocations at startup can
    /// wait on the GC lock directly).
    pub fn freelist_wake(&self) {
        let _guard = self.freelist_sleep.lock().unwrap();
        self.freelist_wait.notify_all();
    }

    /// Ask the GC thread to run a pass.
    pub fn kick_gc(&self) {
        self.kick_gc.fetch_add(1, Ordering::AcqRel);
        let _guard = self.gc_sleep.lock().unwrap();
        self.gc_wake.notify_all();
    }

    pub fn kick_count(&self) -> u32 {
        self.kick_gc.load(Ordering::Acquire)
    }

    pub fn io_clock_now(&self) -> u64 {
        self.io_clock_write.load(Ordering::Acquire)
    }

    /// Advance the write clock; wakes the GC thread so it can re-check its
    /// deadline.
    pub fn io_clock_advance(&self, sectors: u64) {
        self.io_clock_write.fetch_add(sectors, Ordering::AcqRel);
        let _guard = self.gc_sleep.lock().unwrap();
        self.gc_wake.notify_all();
    }
}

pub struct InteriorUpdateGuard<'a> {
    fs: &'a Fs,
}

impl Drop for InteriorUpdateGuard<'_> {
    fn drop(&mut self) {
        let mut nr = self.fs.interior_updates.lock().unwrap();
        *nr -= 1;
        if *nr == 0 {
            self.fs.interior_updates_done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::DataType;

    #[test]
    fn format_marks_sb_and_journal() {
        let fs = Fs::new(FsConfig::default(), vec![DevConfig::default()]).unwrap();
        let dev = fs.dev(0).unwrap();

        // Bucket 0 holds both superblock copies, buckets 1-2 the journal
        assert_eq!(dev.bucket_view(false, 0).unwrap().data_type, DataType::Sb);
        assert_eq!(
            dev.bucket_view(false, 1).unwrap().data_type,
            DataType::Journal
        );
        assert_eq!(
            dev.bucket_view(false, 2).unwrap().data_type,
            DataType::Journal
        );
        assert_eq!(dev.bucket_view(false, 3).unwrap().data_type, DataType::Free);

        let usage = fs.usage.read();
        // 8 sectors below the primary copy, 32 for the copy itself, plus
        // two journal buckets
        assert_eq!(usage.hidden, 8 + 32 + 2 * dev.bucket_sectors as u64);
    }

    #[test]
    fn interior_update_gate() {
        let fs = Fs::new(FsConfig::default(), vec![DevConfig::default()]).unwrap();
        {
            let _a = fs.interior_update_begin();
            let _b = fs.interior_update_begin();
            assert_eq!(fs.nr_interior_updates(), 2);
        }
        assert_eq!(fs.nr_interior_updates(), 0);
        fs.wait_interior_updates();
    }

    #[test]
    fn shadow_lifecycle() {
        let fs = Fs::new(FsConfig::default(), vec![DevConfig::default()]).unwrap();
        let dev = fs.dev(0).unwrap();
        dev.with_buckets_live(|arr| arr[5].gen = 9);

        dev.gc_shadow_alloc().unwrap();
        let g = dev.bucket_view(true, 5).unwrap();
        assert_eq!(g.gen, 9);
        assert_eq!(g.oldest_gen, 9);
        assert_eq!(g.data_type, DataType::Free);
        assert!(dev.gc_shadow_alloc().is_err());

        dev.gc_shadow_free();
        assert!(dev.bucket_view(true, 5).is_err());
    }
}
