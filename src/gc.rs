//! Mark-and-reconcile garbage collection.
//!
//! The full sweep walks every reference in the filesystem and recomputes
//! per-bucket, per-device and per-filesystem accounting into shadow copies,
//! then reconciles them with the live copies under the mark lock held for
//! writing. Order matters throughout: concurrent GC relies on a total
//! ordering over everything it walks, and every operation that moves a
//! reference must move it forward in that ordering. A reference owned by an
//! open bucket may migrate into the btree, never the reverse; if references
//! could move backwards, the sweep could skip past them.
//!
//! The gens pass is the cheap little sibling: it walks only leaf keys,
//! rewrites extents whose pointers have gone badly stale and advances each
//! bucket's oldest_gen so the allocator may bump gens further.

use crate::bkey::{BKey, BkeyVal, Bpos, DataType, Ptr, REPLICAS_MAX};
use crate::btree::{
    node_addr, node_get, node_rewrite, nodes_at_level, BtreeAndJournalIter, BtreeId, Node,
};
use crate::buckets::{
    mark_alloc_bucket, mark_key, mark_metadata_bucket, ptr_bucket_view, ptr_in_future, ptr_stale,
    MarkFlags,
};
use crate::fs::{Dev, Fs, FS_NEED_ALLOC_WRITE, FS_NEED_ANOTHER_GC, FS_REBUILD_REPLICAS, SB_SECTOR};
use crate::fsck_err_on;
use crate::pos::{
    gc_phase, gc_pos_alloc, gc_pos_btree, gc_pos_btree_node, gc_pos_btree_root, GcPhase, GcPos,
};
use crate::prelude::*;
use crate::stats::GC_TIMES;
use crate::util::{gen_after, gen_cmp};
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::time::Instant;

/// Staleness at which the gens pass rewrites an extent instead of letting
/// its pointers lag further.
const GC_GENS_REWRITE_THRESHOLD: u8 = 16;

fn gc_pos_set(fs: &Fs, new: GcPos) {
    debug_assert!(fs.gc_pos.snapshot() < new);
    fs.gc_pos.set(new);
}

fn gc_pos_reset(fs: &Fs) {
    fs.gc_pos.set(gc_phase(GcPhase::NotRunning));
}

/* Topology checking */

// Missing: if an interior btree node is empty, we need to do something,
// perhaps just kill it.
fn gc_check_topology(
    fs: &Fs,
    node: &Node,
    prev: &mut Option<BKey>,
    cur: &BKey,
    is_last: bool,
) -> Result<()> {
    let expected_start = match prev {
        Some(p) => p.pos.successor(),
        None => node.min_key,
    };
    let mut update_min = false;
    let mut update_max = false;

    if let BkeyVal::BtreePtrV2 { min_key, .. } = &cur.val {
        let prev_text = match prev {
            Some(p) => format!("prev {}", p.pos),
            None => format!("start of node {}", node.min_key),
        };
        if fsck_err_on!(
            *min_key != expected_start,
            fs,
            "btree node with incorrect min_key at btree {} level {}: {}, cur {} min_key {} (expected {})",
            node.btree.name(),
            node.level,
            prev_text,
            cur.pos,
            min_key,
            expected_start
        ) {
            update_min = true;
        }
    }

    if fsck_err_on!(
        is_last && cur.pos != node.max_key,
        fs,
        "btree node with incorrect max_key at btree {} level {}: {}, expected {}",
        node.btree.name(),
        node.level,
        cur.pos,
        node.max_key
    ) {
        update_max = true;
    }

    *prev = Some(cur.clone());

    if update_min || update_max {
        if update_max {
            fs.journal_keys.delete(node.btree, node.level, cur.pos)?;
        }

        let mut new = cur.clone();
        if let BkeyVal::BtreePtrV2 {
            min_key,
            range_updated,
            ..
        } = &mut new.val
        {
            if update_min {
                *min_key = expected_start;
            }
            *range_updated = true;
        }
        if update_max {
            new.pos = node.max_key;
        }
        fs.journal_keys.insert(node.btree, node.level, new)?;

        // If the child is resident, fix the in-memory copy to match the
        // rewritten pointer.
        if let Ok(addr) = node_addr(cur) {
            if let Some(child) = fs.node_cache.get(addr) {
                let mut child = child.write();
                if update_min {
                    child.min_key = expected_start;
                }
                if update_max {
                    child.max_key = node.max_key;
                }
            }
        }
    }
    Ok(())
}

/* Pointer repair */

fn bucket_adopt_ptr_gen(fs: &Fs, ptr: &Ptr, zero_counters: bool) -> Result<()> {
    let dev = fs.dev(ptr.dev)?;
    let bucket = dev.bucket_of(ptr.offset);
    for gc in [false, true] {
        dev.bucket_update(gc, bucket, |g| {
            g.gen = ptr.gen;
            g.gen_valid = true;
            if zero_counters {
                g.data_type = DataType::Free;
                g.dirty_sectors = 0;
                g.cached_sectors = 0;
            }
        })?;
    }
    Ok(())
}

fn check_fix_ptrs(
    fs: &Fs,
    btree: BtreeId,
    level: u8,
    is_root: bool,
    k: &mut BKey,
) -> Result<()> {
    let mut do_update = false;

    for ptr in k.ptrs().to_vec() {
        let g = ptr_bucket_view(fs, &ptr, true)?;
        let dev = fs.dev(ptr.dev)?;
        let bucket = dev.bucket_of(ptr.offset);
        let data_type = k.ptr_data_type(&ptr).name();

        if fsck_err_on!(
            !g.gen_valid,
            fs,
            "bucket {}:{} data type {} ptr gen {} missing in alloc btree",
            ptr.dev,
            bucket,
            data_type,
            ptr.gen
        ) {
            if ptr.cached {
                bucket_adopt_ptr_gen(fs, &ptr, false)?;
                fs.flag_set(FS_NEED_ALLOC_WRITE);
            } else {
                do_update = true;
            }
        }

        if fsck_err_on!(
            ptr_in_future(&g, &ptr),
            fs,
            "bucket {}:{} data type {} ptr gen in the future: {} > {}",
            ptr.dev,
            bucket,
            data_type,
            ptr.gen,
            g.gen
        ) {
            if ptr.cached {
                bucket_adopt_ptr_gen(fs, &ptr, true)?;
                fs.flag_set(FS_NEED_ANOTHER_GC);
                fs.flag_set(FS_NEED_ALLOC_WRITE);
            } else {
                do_update = true;
                // Dropping a dirty pointer from the future leaves gens
                // inconsistent until the next pass re-marks the bucket.
                fs.flag_set(FS_NEED_ANOTHER_GC);
            }
        }

        if fsck_err_on!(
            !ptr.cached && gen_cmp(ptr.gen, g.gen) < 0,
            fs,
            "bucket {}:{} data type {} stale dirty ptr: {} < {}",
            ptr.dev,
            bucket,
            data_type,
            ptr.gen,
            g.gen
        ) {
            do_update = true;
        }
    }

    for sp in k.stripe_ptrs() {
        if fsck_err_on!(
            !fs.stripes.is_alive(sp.idx, true),
            fs,
            "pointer to nonexistent stripe {}",
            sp.idx
        ) {
            do_update = true;
        }
    }

    if do_update {
        if is_root {
            error!("cannot update btree roots yet");
            return_errno_with_msg!(Unsupported, "btree root needs pointer repair");
        }

        let mut new = k.clone();
        let verdicts: Vec<bool> = new
            .ptrs()
            .iter()
            .map(|ptr| {
                let Ok(g) = ptr_bucket_view(fs, ptr, true) else {
                    return false;
                };
                let dead = if ptr.cached {
                    !g.gen_valid || gen_cmp(ptr.gen, g.gen) > 0
                } else {
                    !g.gen_valid || gen_cmp(ptr.gen, g.gen) != 0
                };
                !dead
            })
            .collect();
        let mut nth = 0;
        new.retain_ptrs(|_| {
            let keep = verdicts[nth];
            nth += 1;
            keep
        });

        // Keep scanning until no dead stripe entries remain
        loop {
            let dead = new
                .stripe_ptrs()
                .iter()
                .position(|sp| !fs.stripes.is_alive(sp.idx, true));
            match dead {
                Some(nth) => new.remove_stripe_ptr(nth),
                None => break,
            }
        }

        fs.journal_keys.insert(btree, level, new.clone())?;
        *k = new;
    }
    Ok(())
}

/* Marking of btree keys and nodes */

fn gc_mark_key(
    fs: &Fs,
    btree: BtreeId,
    level: u8,
    is_root: bool,
    k: &BKey,
    max_stale: &mut u8,
    initial: bool,
) -> Result<BKey> {
    let mut k = k.clone();

    if initial {
        debug_assert!(
            !(fs.config.debug.journal_seq_verify && k.version > fs.journal.cur_seq())
        );

        if fsck_err_on!(
            k.version > fs.key_version.load(Ordering::Acquire),
            fs,
            "key version number higher than recorded: {} > {}",
            k.version,
            fs.key_version.load(Ordering::Acquire)
        ) {
            fs.key_version.store(k.version, Ordering::Release);
        }

        if fs.flag_test(FS_REBUILD_REPLICAS)
            || fsck_err_on!(
                !fs.replicas.marked(&k),
                fs,
                "superblock not marked as containing replicas (key at {})",
                k.pos
            )
        {
            fs.replicas.mark_key(&k).map_err(|e| {
                error!("error marking bkey replicas: {:?}", e);
                e
            })?;
        }

        check_fix_ptrs(fs, btree, level, is_root, &mut k)?;
    }

    for ptr in k.ptrs() {
        let dev = fs.dev(ptr.dev)?;
        let bucket = dev.bucket_of(ptr.offset);
        let mut stale = 0;
        dev.bucket_update(true, bucket, |g| {
            if gen_after(g.oldest_gen, ptr.gen) {
                g.oldest_gen = ptr.gen;
            }
            stale = ptr_stale(g, ptr);
        })?;
        *max_stale = (*max_stale).max(stale);
    }

    mark_key(fs, &k, MarkFlags::gc_trigger(initial))?;
    Ok(k)
}

fn btree_gc_mark_node(fs: &Fs, node: &Node, max_stale: &mut u8, initial: bool) -> Result<()> {
    *max_stale = 0;

    if node.level == 0 && !node.btree.needs_gc() {
        return Ok(());
    }

    for k in node.keys.iter().filter(|k| !k.is_deleted()) {
        gc_mark_key(fs, node.btree, node.level, false, k, max_stale, initial)?;
    }
    Ok(())
}

fn gc_sweep_depth(fs: &Fs, btree: BtreeId) -> u8 {
    if fs.config.debug.expensive_checks {
        0
    } else if !btree.needs_gc() {
        1
    } else {
        0
    }
}

/// Online sweep of one btree: walk nodes level by level, mark every key,
/// and rewrite nodes whose pointers have gone badly stale. Finally mark the
/// pointer to the root under the root lock.
fn gc_btree(fs: &Fs, btree: BtreeId, initial: bool) -> Result<()> {
    let depth = gc_sweep_depth(fs, btree);

    gc_pos_set(fs, gc_pos_btree(btree, 0, Bpos::MIN));

    let root_level = {
        let roots = fs.roots.lock();
        let root = &roots[btree as usize];
        root.key.as_ref().map(|_| root.level)
    };

    if let Some(root_level) = root_level {
        for level in depth..=root_level {
            for (node_key, node_arc) in nodes_at_level(fs, btree, level)? {
                let node = Node::clone(&node_arc.read());
                let node_pos = gc_pos_btree_node(&node);
                // The leftmost leaf shares the btree start position
                if fs.gc_pos_snapshot() < node_pos {
                    gc_pos_set(fs, node_pos);
                }

                let mut max_stale = 0;
                btree_gc_mark_node(fs, &node, &mut max_stale, initial)?;

                if !initial {
                    let dbg = &fs.config.debug;
                    if max_stale > 64
                        || (!dbg.rewrite_disabled
                            && (dbg.always_rewrite
                                || max_stale > GC_GENS_REWRITE_THRESHOLD))
                    {
                        node_rewrite(fs, btree, &node_key, level)?;
                    }
                }
            }
        }
    }

    {
        let roots = fs.roots.lock();
        let root = &roots[btree as usize];
        if let Some(root_key) = &root.key {
            let mut max_stale = 0;
            gc_mark_key(fs, btree, root.level, true, root_key, &mut max_stale, initial)?;
        }
        gc_pos_set(fs, gc_pos_btree_root(btree));
    }
    Ok(())
}

/// Recovery-mode recursive walk: node keys merged with the journal overlay,
/// topology checked against the previous key, unreadable children deleted
/// through the overlay.
fn gc_btree_init_recurse(fs: &Fs, node: &Node, target_depth: u8) -> Result<()> {
    let mut iter = BtreeAndJournalIter::new(fs, node);
    let mut prev: Option<BKey> = None;
    let mut max_stale = 0;

    while let Some(k) = iter.peek().cloned() {
        debug_assert!(k.pos >= node.min_key && k.pos <= node.max_key);

        let marked = gc_mark_key(fs, node.btree, node.level, false, &k, &mut max_stale, true)
            .map_err(|e| {
                error!("error from gc_mark_key: {:?}", e);
                e
            })?;
        iter.advance();

        if node.level > 0 {
            let is_last = iter.peek().is_none();
            gc_check_topology(fs, node, &mut prev, &marked, is_last)?;
        }
    }

    if node.level > target_depth {
        // Re-open the iterator so the descent sees any repairs made above.
        let mut iter = BtreeAndJournalIter::new(fs, node);
        while let Some(k) = iter.peek().cloned() {
            iter.advance();
            if !k.is_btree_ptr() {
                continue;
            }

            let child = match node_get(fs, &k) {
                Ok(child) => child,
                Err(e) if e.errno() == Io => {
                    if fsck_err_on!(
                        true,
                        fs,
                        "unreadable btree node at btree {} level {} pos {}",
                        node.btree.name(),
                        node.level - 1,
                        k.pos
                    ) {
                        fs.journal_keys.delete(node.btree, node.level, k.pos)?;
                        fs.flag_set(FS_NEED_ANOTHER_GC);
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => {
                    error!("error getting btree node: {:?}", e);
                    return Err(e);
                }
            };

            let child = Node::clone(&child.read());
            gc_btree_init_recurse(fs, &child, target_depth)?;
        }
    }
    Ok(())
}

/// Recovery-mode sweep of one btree, starting from a root whose bounds must
/// already be correct.
fn gc_btree_init(fs: &Fs, btree: BtreeId) -> Result<()> {
    let root = fs.roots.lock()[btree as usize].clone();
    let Some(root_key) = root.key else {
        return Ok(());
    };
    let target_depth = gc_sweep_depth(fs, btree);

    let node = Node::clone(&node_get(fs, &root_key)?.read());

    if node.min_key != Bpos::MIN {
        fs.fsck.err(format!(
            "btree root with incorrect min_key: {}",
            node.min_key
        ));
        return_errno_with_msg!(Invalid, "btree root with bad bounds");
    }
    if node.max_key != Bpos::MAX {
        fs.fsck.err(format!(
            "btree root with incorrect max_key: {}",
            node.max_key
        ));
        return_errno_with_msg!(Invalid, "btree root with bad bounds");
    }

    if node.level >= target_depth {
        gc_btree_init_recurse(fs, &node, target_depth)?;
    }

    let mut max_stale = 0;
    gc_mark_key(fs, btree, root.level, true, &root_key, &mut max_stale, true).map_err(|e| {
        error!("error marking btree root: {:?}", e);
        e
    })?;
    Ok(())
}

fn gc_btrees(fs: &Fs, initial: bool) -> Result<()> {
    let mut ids = BtreeId::ALL;
    ids.sort_by_key(|id| id.gc_phase_order());

    for id in ids {
        let ret = if initial {
            gc_btree_init(fs, id)
        } else {
            gc_btree(fs, id, initial)
        };
        if let Err(e) = ret {
            error!("gc of {} btree failed: {:?}", id.name(), e);
            return Err(e);
        }
    }
    Ok(())
}

/* Boundary marking */

fn mark_metadata_sectors(
    fs: &Fs,
    dev: &Dev,
    mut start: u64,
    end: u64,
    data_type: DataType,
    flags: MarkFlags,
) -> Result<()> {
    let mut bucket = dev.bucket_of(start);
    while start < end {
        let sectors = dev.bucket_to_sector(bucket + 1).min(end) - start;
        mark_metadata_bucket(fs, dev, bucket, data_type, sectors as u32, flags)?;
        bucket += 1;
        start += sectors;
    }
    Ok(())
}

/// Mark one device's superblock copies and journal buckets. Also called
/// from the device add path, before the new member carries any data.
pub fn mark_dev_superblock(fs: &Fs, dev: &Dev, flags: MarkFlags) -> Result<()> {
    let _mark = fs.mark_lock.read().unwrap();

    for &offset in &dev.sb_offsets {
        if offset == SB_SECTOR {
            mark_metadata_sectors(fs, dev, 0, SB_SECTOR, DataType::Sb, flags)?;
        }
        mark_metadata_sectors(
            fs,
            dev,
            offset,
            offset + (1u64 << dev.sb_max_size_bits),
            DataType::Sb,
            flags,
        )?;
    }

    for &bucket in &dev.journal_buckets {
        mark_metadata_bucket(
            fs,
            dev,
            bucket,
            DataType::Journal,
            dev.bucket_sectors,
            flags,
        )?;
    }
    Ok(())
}

fn mark_superblocks(fs: &Fs) -> Result<()> {
    let _sb = fs.sb_lock.lock().unwrap();
    gc_pos_set(fs, gc_phase(GcPhase::Sb));

    for dev in &fs.devs {
        mark_dev_superblock(fs, dev, MarkFlags::GC)?;
    }
    Ok(())
}

fn mark_allocator_buckets(fs: &Fs) -> Result<()> {
    let _mark = fs.mark_lock.read().unwrap();

    {
        let freelists = fs.freelists.lock();
        gc_pos_set(fs, gc_pos_alloc(None));

        for (nth, dev) in fs.devs.iter().enumerate() {
            let lists = &freelists[nth];
            for &bucket in &lists.free_inc {
                mark_alloc_bucket(dev, bucket, true, MarkFlags::GC)?;
            }
            for reserve in &lists.free {
                for &bucket in reserve {
                    mark_alloc_bucket(dev, bucket, true, MarkFlags::GC)?;
                }
            }
        }
    }

    for (slot, ob) in fs.open_buckets.iter().enumerate() {
        let open = ob.slot.lock();
        if open.valid {
            gc_pos_set(fs, gc_pos_alloc(Some(slot)));
            let dev = fs.dev(open.dev)?;
            mark_alloc_bucket(&dev, open.bucket, true, MarkFlags::GC)?;
        }
    }
    Ok(())
}

/* Reconciliation */

fn gc_free(fs: &Fs) {
    fs.stripes.gc_free();
    for dev in &fs.devs {
        dev.gc_shadow_free();
    }
    fs.usage_gc_free();
}

/// Compare the shadow accounting against the live copy and make the live
/// copy match, reporting every divergence when verifying. Runs under the
/// mark lock held for writing, with the journal blocked.
fn gc_done(fs: &Fs, initial: bool) -> Result<()> {
    let verify = !initial || fs.config.compat_alloc_info;
    let mut changed = false;

    // Stripes: shape must match, per-block sector counts are copied and
    // blocks_nonempty recomputed.
    {
        let shadow_guard = fs.stripes.gc();
        let Some(shadow) = shadow_guard.as_ref() else {
            return_errno_with_msg!(Invalid, "no gc stripe table at gc_done");
        };
        let mut live = fs.stripes.live();
        let mut idxs: Vec<u64> = shadow.keys().copied().collect();
        idxs.sort_unstable();

        for idx in idxs {
            let src = &shadow[&idx];
            let dst = live.entry(idx).or_default();

            if dst.alive != src.alive
                || dst.sectors != src.sectors
                || dst.algorithm != src.algorithm
                || dst.nr_blocks != src.nr_blocks
                || dst.nr_redundant != src.nr_redundant
            {
                error!("unexpected stripe inconsistency at gc_done, confused");
                return_errno_with_msg!(Invalid, "stripe shape diverged");
            }

            for block in 0..src.block_sectors.len() {
                if dst.block_sectors[block] != src.block_sectors[block] {
                    if verify {
                        fs.fsck.err(format!(
                            "stripe {} has wrong block_sectors[{}]: got {}, should be {}",
                            idx, block, dst.block_sectors[block], src.block_sectors[block]
                        ));
                    }
                    dst.block_sectors[block] = src.block_sectors[block];
                    changed = true;
                }
            }

            dst.blocks_nonempty = dst.block_sectors.iter().filter(|s| **s != 0).count() as u32;
        }
    }

    // Fold the per-shard deltas into the base before comparing.
    fs.usage.fold_to_base();

    // Buckets
    for dev in &fs.devs {
        let mut shadow_guard = dev.buckets_gc_guard();
        let Some(shadow) = shadow_guard.as_mut() else {
            return_errno_with_msg!(Invalid, "no gc bucket array at gc_done");
        };
        let mut live = dev.buckets_live_guard();

        for b in 0..live.len() {
            let src = &shadow[b];
            let dst = &mut live[b];

            macro_rules! copy_bucket_field {
                ($f:ident) => {
                    if dst.$f != src.$f {
                        if verify {
                            fs.fsck.err(format!(
                                "bucket {}:{} gen {} data type {} has wrong {}: got {:?}, should be {:?}",
                                dev.id,
                                b,
                                dst.gen,
                                dst.data_type.name(),
                                stringify!($f),
                                dst.$f,
                                src.$f
                            ));
                        }
                        dst.$f = src.$f;
                        changed = true;
                    }
                };
            }

            copy_bucket_field!(gen);
            copy_bucket_field!(data_type);
            copy_bucket_field!(owned_by_allocator);
            copy_bucket_field!(stripe);
            copy_bucket_field!(dirty_sectors);
            copy_bucket_field!(cached_sectors);

            dst.oldest_gen = src.oldest_gen;
        }
    }

    // Per-device usage
    for dev in &fs.devs {
        let src = dev.usage_view(true)?;
        dev.usage_live_mut(|dst| {
            macro_rules! copy_dev_field {
                ($f:expr, $s:expr, $msg:expr) => {
                    if $f != $s {
                        if verify {
                            fs.fsck.err(format!(
                                "dev {} has wrong {}: got {}, should be {}",
                                dev.id, $msg, $f, $s
                            ));
                        }
                        $f = $s;
                        changed = true;
                    }
                };
            }

            copy_dev_field!(dst.buckets_ec, src.buckets_ec, "buckets_ec");
            copy_dev_field!(
                dst.buckets_unavailable,
                src.buckets_unavailable,
                "buckets_unavailable"
            );

            for ty in 0..DataType::NR {
                let name = [
                    "free", "sb", "journal", "btree", "user", "cached", "parity",
                ][ty];
                copy_dev_field!(
                    dst.d[ty].buckets,
                    src.d[ty].buckets,
                    format_args!("{} buckets", name)
                );
                copy_dev_field!(
                    dst.d[ty].sectors,
                    src.d[ty].sectors,
                    format_args!("{} sectors", name)
                );
                copy_dev_field!(
                    dst.d[ty].fragmented,
                    src.d[ty].fragmented,
                    format_args!("{} fragmented", name)
                );
            }
        });
    }

    // Per-fs usage
    {
        let src = fs.usage_gc_view()?;
        let mut dst = fs.usage.base();

        macro_rules! copy_fs_field {
            ($f:ident) => {
                if dst.$f != src.$f {
                    if verify {
                        fs.fsck.err(format!(
                            "fs has wrong {}: got {}, should be {}",
                            stringify!($f),
                            dst.$f,
                            src.$f
                        ));
                    }
                    dst.$f = src.$f;
                    changed = true;
                }
            };
        }

        copy_fs_field!(hidden);
        copy_fs_field!(btree);
        copy_fs_field!(data);
        copy_fs_field!(cached);
        copy_fs_field!(reserved);
        copy_fs_field!(nr_inodes);

        for nth in 0..REPLICAS_MAX {
            if dst.persistent_reserved[nth] != src.persistent_reserved[nth] {
                if verify {
                    fs.fsck.err(format!(
                        "fs has wrong persistent_reserved[{}]: got {}, should be {}",
                        nth, dst.persistent_reserved[nth], src.persistent_reserved[nth]
                    ));
                }
                dst.persistent_reserved[nth] = src.persistent_reserved[nth];
                changed = true;
            }
        }

        for entry in fs.replicas.entries() {
            let s = src.replicas.get(&entry).copied().unwrap_or(0);
            let d = dst.replicas.entry(entry.clone()).or_default();
            if *d != s {
                if verify {
                    fs.fsck.err(format!(
                        "fs has wrong replicas entry {}: got {}, should be {}",
                        entry, d, s
                    ));
                }
                *d = s;
                changed = true;
            }
        }
    }

    if changed {
        fs.flag_set(FS_NEED_ALLOC_WRITE);
    }
    Ok(())
}

/// Allocate and seed the shadow copies for a run.
fn gc_start(fs: &Fs) -> Result<()> {
    fs.usage_gc_alloc().map_err(|e| {
        error!("error allocating gc fs usage");
        e
    })?;
    for dev in &fs.devs {
        dev.gc_shadow_alloc().map_err(|e| {
            error!("error allocating gc bucket array for dev {}", dev.id);
            e
        })?;
    }
    fs.stripes.gc_mem_alloc().map_err(|e| {
        error!("error allocating ec gc mem");
        e
    })?;

    let _mark = fs.mark_lock.write().unwrap();
    gc_pos_set(fs, gc_phase(GcPhase::Start));
    Ok(())
}

fn gc_pass(fs: &Fs, initial: bool) -> Result<()> {
    gc_start(fs)?;

    mark_superblocks(fs)?;

    gc_btrees(fs, initial)?;

    // Pending btree node frees would be marked here, at
    // GcPhase::PendingDelete, once full GC and the btree key cache get
    // along.

    mark_allocator_buckets(fs)?;

    gc_pos_set(fs, gc_phase(GcPhase::Done));
    Ok(())
}

/// Walk all references to buckets and recompute them.
///
/// Holds the GC lock exclusively for the whole run. Repairs made by the
/// initial pass can themselves invalidate what an earlier phase saw, so up
/// to two restarts are allowed before giving up.
pub fn gc(fs: &Fs, initial: bool) -> Result<()> {
    let start_time = Instant::now();
    let _state = fs.state_lock.lock().unwrap();
    let _gc = fs.gc_lock.write().unwrap();
    trace!("gc start, initial={}", initial);

    // Flush interior btree updates; their references move between nodes
    // and must be at rest before we take the first snapshot.
    fs.wait_interior_updates();

    let mut iterations = 0;
    let mut ret = loop {
        if let Err(e) = gc_pass(fs, initial) {
            break Err(e);
        }

        fs.gc_count.fetch_add(1, Ordering::AcqRel);

        if fs.flag_test(FS_NEED_ANOTHER_GC) || (iterations == 0 && fs.config.debug.restart_gc)
        {
            iterations += 1;
            if iterations <= 2 {
                info!("Second GC pass needed, restarting:");
                fs.flag_clear(FS_NEED_ANOTHER_GC);
                gc_pos_reset(fs);
                {
                    let _mark = fs.mark_lock.write().unwrap();
                    gc_free(fs);
                }
                // Flush buffered fsck errors, reset counters
                fs.fsck.flush();
                continue;
            }

            info!("Unable to fix bucket gens, looping");
            break Err(Error::with_msg(Invalid, "unable to fix bucket gens"));
        }

        break Ok(());
    };

    if ret.is_ok() {
        fs.journal.block();
        {
            let _mark = fs.mark_lock.write().unwrap();
            ret = gc_done(fs, initial);
            gc_pos_reset(fs);
            gc_free(fs);
        }
        fs.journal.unblock();
    } else {
        let _mark = fs.mark_lock.write().unwrap();
        gc_pos_reset(fs);
        gc_free(fs);
    }

    trace!("gc end");
    GC_TIMES.update(start_time.elapsed());

    // Wake the allocator and anything stuck on the freelists in case they
    // were waiting for gens to move.
    for dev in &fs.devs {
        dev.wake_allocator();
    }
    fs.freelist_wake();

    ret
}

/* Gens pass */

fn gc_btree_gens_key(fs: &Fs, k: &BKey) -> Result<bool> {
    let _mark = fs.mark_lock.read().unwrap();

    for ptr in k.ptrs() {
        let g = ptr_bucket_view(fs, ptr, false)?;
        if ptr_stale(&g, ptr) > GC_GENS_REWRITE_THRESHOLD {
            return Ok(true);
        }
    }

    for ptr in k.ptrs() {
        let dev = fs.dev(ptr.dev)?;
        let bucket = dev.bucket_of(ptr.offset);
        dev.bucket_update(false, bucket, |g| {
            if gen_after(g.gc_gen, ptr.gen) {
                g.gc_gen = ptr.gen;
            }
        })?;
    }
    Ok(false)
}

/// Drop the cached pointers that have gone stale; an extent left with no
/// pointers becomes a whiteout.
fn extent_normalize(fs: &Fs, k: &mut BKey) -> Result<()> {
    let verdicts: Vec<bool> = k
        .ptrs()
        .iter()
        .map(|ptr| {
            if !ptr.cached {
                return true;
            }
            match ptr_bucket_view(fs, ptr, false) {
                Ok(g) => g.gen == ptr.gen,
                Err(_) => false,
            }
        })
        .collect();
    let mut nth = 0;
    k.retain_ptrs(|_| {
        let keep = verdicts[nth];
        nth += 1;
        keep
    });
    Ok(())
}

/// Recalculating oldest_gen only needs leaf keys; btree node pointers never
/// carry cached pointers that could go stale.
fn gc_btree_gens(fs: &Fs, btree: BtreeId) -> Result<()> {
    for (leaf_key, leaf_arc) in nodes_at_level(fs, btree, 0)? {
        let keys = leaf_arc.read().keys.clone();
        for k in keys.iter().filter(|k| !k.is_deleted()) {
            if !gc_btree_gens_key(fs, k)? {
                continue;
            }

            let mut new = k.clone();
            extent_normalize(fs, &mut new)?;

            loop {
                match crate::btree::leaf_key_replace(fs, &leaf_key, k, new.clone()) {
                    Err(e) if e.errno() == Interrupted => continue,
                    Err(e) => return Err(e),
                    Ok(()) => break,
                }
            }

            // Fold the surviving pointers' gens now that the key walk will
            // not see the rewritten extent
            for ptr in new.ptrs() {
                let dev = fs.dev(ptr.dev)?;
                let bucket = dev.bucket_of(ptr.offset);
                dev.bucket_update(false, bucket, |g| {
                    if gen_after(g.gc_gen, ptr.gen) {
                        g.gc_gen = ptr.gen;
                    }
                })?;
            }
        }
    }
    Ok(())
}

/// Cheap oldest_gen refresher: seed each bucket's scratch gen from its
/// current gen, walk leaf keys lowering it to the oldest live pointer, then
/// publish the result. Only ever advances oldest_gen; never touches bucket
/// gens or topology.
pub fn gc_gens(fs: &Fs) -> Result<()> {
    let _gc = fs.gc_lock.read().unwrap();

    for dev in &fs.devs {
        dev.with_buckets_live(|arr| {
            for g in arr.iter_mut() {
                g.gc_gen = g.gen;
            }
        });
    }

    for id in BtreeId::ALL {
        if !id.needs_gc() {
            continue;
        }
        if let Err(e) = gc_btree_gens(fs, id) {
            error!("error recalculating oldest_gen: {:?}", e);
            return Err(e);
        }
    }

    for dev in &fs.devs {
        dev.with_buckets_live(|arr| {
            for g in arr.iter_mut() {
                g.oldest_gen = g.gc_gen;
            }
        });
    }

    fs.gc_count.fetch_add(1, Ordering::AcqRel);
    Ok(())
}

/* GC thread */

fn gc_thread_fn(fs: Arc<Fs>) {
    let mut last = fs.io_clock_now();
    let mut last_kick = fs.kick_count();

    loop {
        {
            let mut guard = fs.gc_sleep.lock().unwrap();
            loop {
                if fs.gc_stop.load(Ordering::Acquire) {
                    return;
                }
                if fs.kick_count() != last_kick {
                    break;
                }
                if fs.config.btree_gc_periodic {
                    let next = last + fs.capacity_sectors / 16;
                    if fs.io_clock_now() >= next {
                        break;
                    }
                    let (g, _) = fs
                        .gc_wake
                        .wait_timeout(guard, Duration::from_millis(20))
                        .unwrap();
                    guard = g;
                } else {
                    guard = fs.gc_wake.wait(guard).unwrap();
                }
            }
        }

        last = fs.io_clock_now();
        last_kick = fs.kick_count();

        #[cfg(feature = "full-gc-thread")]
        let ret = gc(&fs, false);
        #[cfg(not(feature = "full-gc-thread"))]
        let ret = gc_gens(&fs);

        if let Err(e) = ret {
            error!("btree gc failed: {:?}", e);
        }
    }
}

pub fn gc_thread_start(fs: &Arc<Fs>) -> Result<()> {
    let mut thread = fs.gc_thread.lock().unwrap();
    if thread.is_some() {
        return_errno_with_msg!(Invalid, "gc thread already running");
    }
    fs.gc_stop.store(false, Ordering::Release);

    let fs_for_thread = Arc::clone(fs);
    *thread = Some(std::thread::spawn(move || gc_thread_fn(fs_for_thread)));
    Ok(())
}

pub fn gc_thread_stop(fs: &Fs) {
    let handle = fs.gc_thread.lock().unwrap().take();
    if let Some(handle) = handle {
        fs.gc_stop.store(true, Ordering::Release);
        {
            let _guard = fs.gc_sleep.lock().unwrap();
            fs.gc_wake.notify_all();
        }
        let _ = handle.join();
        fs.gc_stop.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::StripePtr;
    use crate::btree::{make_node, set_root, BTREE_NODE_SECTORS};
    use crate::buckets::mark_key_at;
    use crate::config::FsConfig;
    use crate::fs::DevConfig;
    use std::sync::Once;

    static INIT_LOG: Once = Once::new();

    fn init_logger() {
        INIT_LOG.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }

    fn new_fs() -> Arc<Fs> {
        init_logger();
        Fs::new(FsConfig::default(), vec![DevConfig::default()]).unwrap()
    }

    fn extent(fs: &Fs, pos: Bpos, bucket: u64, gen: u8, cached: bool) -> BKey {
        let dev = fs.dev(0).unwrap();
        BKey::new(
            pos,
            8,
            BkeyVal::Extent {
                ptrs: vec![Ptr {
                    dev: 0,
                    offset: dev.bucket_to_sector(bucket),
                    gen,
                    cached,
                }],
                stripe_ptrs: vec![],
            },
        )
    }

    fn single_leaf_extents(fs: &Fs, keys: Vec<BKey>) -> BKey {
        let root = make_node(fs, BtreeId::Extents, 0, Bpos::MIN, Bpos::MAX, keys).unwrap();
        set_root(fs, BtreeId::Extents, Some(root.clone()), 0);
        root
    }

    #[test]
    fn clean_mark() {
        // S1: empty filesystem, only superblock and journal buckets marked
        let fs = new_fs();
        gc(&fs, false).unwrap();

        assert_eq!(fs.gc_count.load(Ordering::Acquire), 1);
        assert_eq!(fs.fsck.count(), 0);
        assert!(!fs.flag_test(FS_NEED_ALLOC_WRITE));

        let dev = fs.dev(0).unwrap();
        for b in 0..dev.nbuckets {
            let g = dev.bucket_view(false, b).unwrap();
            assert!(
                matches!(
                    g.data_type,
                    DataType::Free | DataType::Sb | DataType::Journal
                ),
                "bucket {} has type {:?}",
                b,
                g.data_type
            );
        }
        assert_eq!(fs.gc_pos_snapshot(), gc_phase(GcPhase::NotRunning));
    }

    #[test]
    fn sweep_recomputes_reference_coverage() {
        // Invariant 4: shadow sector counts equal the sum of key
        // contributions, visible after reconciliation copies them live
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        single_leaf_extents(
            &fs,
            vec![
                extent(&fs, Bpos::new(1, 8), 40, 0, false),
                extent(&fs, Bpos::new(1, 64), 40, 0, false),
                extent(&fs, Bpos::new(2, 8), 41, 0, false),
            ],
        );

        gc(&fs, false).unwrap();

        assert_eq!(fs.fsck.count(), 0);
        assert!(!fs.flag_test(FS_NEED_ALLOC_WRITE));
        assert_eq!(dev.bucket_view(false, 40).unwrap().dirty_sectors, 16);
        assert_eq!(dev.bucket_view(false, 41).unwrap().dirty_sectors, 8);
        assert_eq!(fs.usage.read().data, 24);
        assert_eq!(fs.usage.read().btree, BTREE_NODE_SECTORS as u64);
    }

    #[test]
    fn gc_is_idempotent() {
        // Invariant 2: a second run on an unmutated filesystem changes
        // nothing
        let fs = new_fs();
        single_leaf_extents(
            &fs,
            vec![
                extent(&fs, Bpos::new(1, 8), 40, 0, false),
                extent(&fs, Bpos::new(1, 64), 41, 0, true),
            ],
        );

        gc(&fs, false).unwrap();
        assert_eq!(fs.fsck.count(), 0);
        assert!(!fs.flag_test(FS_NEED_ALLOC_WRITE));

        gc(&fs, false).unwrap();
        assert_eq!(fs.fsck.count(), 0);
        assert!(!fs.flag_test(FS_NEED_ALLOC_WRITE));
        assert_eq!(fs.gc_count.load(Ordering::Acquire), 2);
    }

    #[test]
    fn clean_mark_multi_device() {
        init_logger();
        let fs = Fs::new(
            FsConfig::default(),
            vec![DevConfig::default(), DevConfig::default()],
        )
        .unwrap();

        gc(&fs, false).unwrap();

        assert_eq!(fs.fsck.count(), 0);
        for dev in &fs.devs {
            assert_eq!(dev.bucket_view(false, 0).unwrap().data_type, DataType::Sb);
            assert_eq!(
                dev.bucket_view(false, 1).unwrap().data_type,
                DataType::Journal
            );
        }
    }

    #[test]
    fn alloc_keys_refresh_bucket_gens() {
        // Sweeping the alloc btree is what makes a bucket's gen
        // authoritative; reconciliation pushes it into the live array
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();

        let alloc_key = BKey::new(Bpos::new(0, 45), 0, BkeyVal::Alloc { gen: 7 });
        let root =
            make_node(&fs, BtreeId::Alloc, 0, Bpos::MIN, Bpos::MAX, vec![alloc_key]).unwrap();
        set_root(&fs, BtreeId::Alloc, Some(root), 0);

        // The live copy lost the gen
        dev.with_buckets_live(|arr| arr[45].gen = 0);

        gc(&fs, true).unwrap();

        let g = dev.bucket_view(false, 45).unwrap();
        assert_eq!(g.gen, 7);
        assert!(fs.flag_test(FS_NEED_ALLOC_WRITE));
        let reports = fs.fsck.flush();
        assert!(reports.iter().any(|m| m.contains("wrong gen")));
    }

    #[test]
    fn inode_and_reservation_accounting() {
        let fs = new_fs();

        let inodes_root = make_node(
            &fs,
            BtreeId::Inodes,
            0,
            Bpos::MIN,
            Bpos::MAX,
            vec![
                BKey::new(Bpos::new(4, 0), 0, BkeyVal::Inode),
                BKey::new(Bpos::new(5, 0), 0, BkeyVal::Inode),
            ],
        )
        .unwrap();
        set_root(&fs, BtreeId::Inodes, Some(inodes_root), 0);

        single_leaf_extents(
            &fs,
            vec![
                extent(&fs, Bpos::new(4, 8), 40, 0, false),
                BKey::new(Bpos::new(4, 64), 16, BkeyVal::Reservation { nr_replicas: 2 }),
            ],
        );

        gc(&fs, false).unwrap();

        assert_eq!(fs.fsck.count(), 0);
        let usage = fs.usage.read();
        assert_eq!(usage.nr_inodes, 2);
        assert_eq!(usage.persistent_reserved[1], 16);
    }

    #[test]
    fn stale_cached_ptr_is_silently_ignored() {
        // S2: a cached pointer one gen behind contributes nothing and is
        // not an error outside recovery
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        dev.with_buckets_live(|arr| arr[41].gen = 1);

        single_leaf_extents(
            &fs,
            vec![
                extent(&fs, Bpos::new(1, 8), 40, 0, false),
                extent(&fs, Bpos::new(1, 64), 41, 0, true),
            ],
        );

        gc(&fs, false).unwrap();

        assert_eq!(fs.fsck.count(), 0);
        assert_eq!(dev.bucket_view(false, 41).unwrap().cached_sectors, 0);
        assert_eq!(fs.usage.read().cached, 0);
    }

    #[test]
    fn future_dirty_ptr_is_dropped_and_gc_loops() {
        // S3: a dirty pointer whose gen is ahead of its bucket is dropped
        // through the journal overlay and forces a second pass
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();

        single_leaf_extents(
            &fs,
            vec![
                extent(&fs, Bpos::new(1, 8), 40, 0, false),
                extent(&fs, Bpos::new(1, 16), 42, 2, false),
            ],
        );

        gc(&fs, true).unwrap();

        // The repair was reported (the restart flushed the buffer, the
        // lifetime count remains) and both passes ran
        assert!(fs.fsck.count() > 0);
        assert_eq!(fs.gc_count.load(Ordering::Acquire), 2);
        assert!(!fs.flag_test(FS_NEED_ANOTHER_GC));
        // The bad key was whited out through the overlay and the live
        // accounting corrected at reconciliation
        let overlay = fs
            .journal_keys
            .get(BtreeId::Extents, 0, Bpos::new(1, 16))
            .unwrap();
        assert!(overlay.is_deleted());
        assert_eq!(dev.bucket_view(false, 42).unwrap().dirty_sectors, 0);
        assert_eq!(dev.bucket_view(false, 40).unwrap().dirty_sectors, 8);
    }

    #[test]
    fn missing_alloc_info_drops_dirty_ptr() {
        // A dirty pointer into a bucket whose gen was never confirmed by
        // the alloc btree cannot be trusted
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        dev.with_buckets_live(|arr| arr[43].gen_valid = false);

        single_leaf_extents(&fs, vec![extent(&fs, Bpos::new(1, 8), 43, 0, false)]);

        gc(&fs, true).unwrap();

        let reports = fs.fsck.flush();
        assert!(reports
            .iter()
            .any(|m| m.contains("missing in alloc btree")));
        let overlay = fs
            .journal_keys
            .get(BtreeId::Extents, 0, Bpos::new(1, 8))
            .unwrap();
        assert!(overlay.is_deleted());
        assert_eq!(dev.bucket_view(false, 43).unwrap().dirty_sectors, 0);
    }

    #[test]
    fn interior_min_key_mismatch_is_repaired() {
        // S4: a btree_ptr_v2 whose declared min_key disagrees with its
        // predecessor gets a patched key through the overlay and the cached
        // child fixed up
        let fs = new_fs();
        let left = make_node(
            &fs,
            BtreeId::Extents,
            0,
            Bpos::MIN,
            Bpos::new(1, 100),
            vec![extent(&fs, Bpos::new(1, 8), 40, 0, false)],
        )
        .unwrap();
        let right = make_node(
            &fs,
            BtreeId::Extents,
            0,
            Bpos::new(1, 101),
            Bpos::MAX,
            vec![extent(&fs, Bpos::new(2, 8), 41, 0, false)],
        )
        .unwrap();
        let root = make_node(
            &fs,
            BtreeId::Extents,
            1,
            Bpos::MIN,
            Bpos::MAX,
            vec![left.clone(), right.clone()],
        )
        .unwrap();
        set_root(&fs, BtreeId::Extents, Some(root.clone()), 1);

        // Corrupt the declared lower bound of the right child
        {
            let root_node = node_get(&fs, &root).unwrap();
            let mut guard = root_node.write();
            if let BkeyVal::BtreePtrV2 { min_key, .. } = &mut guard.keys[1].val {
                *min_key = Bpos::new(1, 90);
            }
            let addr = node_addr(&root).unwrap();
            fs.node_store.write(addr, &guard).unwrap();
        }

        gc(&fs, true).unwrap();

        let reports = fs.fsck.flush();
        assert!(reports.iter().any(|m| m.contains("incorrect min_key")));

        let patched = fs
            .journal_keys
            .get(BtreeId::Extents, 1, right.pos)
            .expect("repair key in the overlay");
        match &patched.val {
            BkeyVal::BtreePtrV2 {
                min_key,
                range_updated,
                ..
            } => {
                assert_eq!(*min_key, Bpos::new(1, 101));
                assert!(range_updated);
            }
            other => panic!("unexpected repair key {:?}", other),
        }

        // The resident child was fixed in memory
        let child = fs.node_cache.get(node_addr(&right).unwrap()).unwrap();
        assert_eq!(child.read().min_key, Bpos::new(1, 101));
    }

    #[test]
    fn unreadable_child_is_deleted_and_pass_restarts() {
        let fs = new_fs();
        let left = make_node(
            &fs,
            BtreeId::Extents,
            0,
            Bpos::MIN,
            Bpos::new(1, 100),
            vec![extent(&fs, Bpos::new(1, 8), 40, 0, false)],
        )
        .unwrap();
        let right = make_node(
            &fs,
            BtreeId::Extents,
            0,
            Bpos::new(1, 101),
            Bpos::MAX,
            vec![],
        )
        .unwrap();
        let root = make_node(
            &fs,
            BtreeId::Extents,
            1,
            Bpos::MIN,
            Bpos::MAX,
            vec![left.clone(), right.clone()],
        )
        .unwrap();
        set_root(&fs, BtreeId::Extents, Some(root), 1);

        let addr = node_addr(&right).unwrap();
        fs.node_store.write_raw(addr, vec![0x13, 0x37]);
        fs.node_cache.remove(addr);

        gc(&fs, true).unwrap();

        assert!(fs.fsck.count() > 0);
        assert_eq!(fs.gc_count.load(Ordering::Acquire), 2);
        // The second pass noticed the surviving sibling no longer reaches
        // max_key and stretched its key over the hole: the old key is
        // whited out and the repair key at max_key points at the survivor.
        assert!(fs
            .journal_keys
            .get(BtreeId::Extents, 1, left.pos)
            .unwrap()
            .is_deleted());
        let stretched = fs
            .journal_keys
            .get(BtreeId::Extents, 1, Bpos::MAX)
            .unwrap();
        assert_eq!(node_addr(&stretched).unwrap(), node_addr(&left).unwrap());
    }

    #[test]
    fn stripe_accounting_is_recomputed() {
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();

        let stripe_key = BKey::new(
            Bpos::new(0, 1),
            16,
            BkeyVal::Stripe {
                algorithm: 0,
                nr_blocks: 3,
                nr_redundant: 1,
                ptrs: (0..3)
                    .map(|i| Ptr {
                        dev: 0,
                        offset: dev.bucket_to_sector(60 + i),
                        gen: 0,
                        cached: false,
                    })
                    .collect(),
            },
        );
        let stripes_root =
            make_node(&fs, BtreeId::Stripes, 0, Bpos::MIN, Bpos::MAX, vec![stripe_key]).unwrap();
        set_root(&fs, BtreeId::Stripes, Some(stripes_root), 0);

        let mut ext = extent(&fs, Bpos::new(1, 8), 40, 0, false);
        if let BkeyVal::Extent { stripe_ptrs, .. } = &mut ext.val {
            stripe_ptrs.push(StripePtr { idx: 1, block: 0 });
        }
        single_leaf_extents(&fs, vec![ext]);

        gc(&fs, false).unwrap();

        let live = fs.stripes.live();
        let stripe = live.get(&1).unwrap();
        assert!(stripe.alive);
        assert_eq!(stripe.block_sectors[0], 8);
        assert_eq!(stripe.blocks_nonempty, 1);
        // Parity block bucket is stamped and stripe membership counted
        assert_eq!(
            dev.bucket_view(false, 62).unwrap().data_type,
            DataType::Parity
        );
        assert_eq!(dev.bucket_view(false, 60).unwrap().stripe, Some(1));
        assert!(dev.usage_view(false).unwrap().buckets_ec >= 3);
    }

    #[test]
    fn allocator_buckets_are_marked() {
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();

        fs.freelists.lock()[0].free_inc.push_back(100);
        fs.freelists.lock()[0].free[0].push_back(101);
        {
            let mut slot = fs.open_buckets[3].slot.lock();
            *slot = crate::fs::OpenBucketSlot {
                valid: true,
                dev: 0,
                bucket: 102,
            };
        }
        // The live copy already considers them allocator-owned
        for b in [100, 101, 102] {
            dev.bucket_update(false, b, |g| g.owned_by_allocator = true)
                .unwrap();
        }

        gc(&fs, false).unwrap();

        assert_eq!(fs.fsck.count(), 0);
        for b in [100, 101, 102] {
            assert!(dev.bucket_view(false, b).unwrap().owned_by_allocator);
        }
    }

    #[test]
    fn reconciliation_corrects_drifted_counters() {
        // Damage the live accounting behind the GC's back; verification
        // reports and repairs it
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        single_leaf_extents(&fs, vec![extent(&fs, Bpos::new(1, 8), 40, 0, false)]);

        dev.with_buckets_live(|arr| arr[40].dirty_sectors = 999);

        gc(&fs, false).unwrap();

        assert!(fs.flag_test(FS_NEED_ALLOC_WRITE));
        let reports = fs.fsck.flush();
        assert!(reports.iter().any(|m| m.contains("wrong dirty_sectors")));
        assert_eq!(dev.bucket_view(false, 40).unwrap().dirty_sectors, 8);
    }

    #[test]
    fn restart_gc_debug_knob_forces_second_pass() {
        let mut config = FsConfig::default();
        config.debug.restart_gc = true;
        init_logger();
        let fs = Fs::new(config, vec![DevConfig::default()]).unwrap();

        gc(&fs, false).unwrap();
        assert_eq!(fs.gc_count.load(Ordering::Acquire), 2);
    }

    #[test]
    fn concurrent_mutator_law() {
        // Invariant 6: a mutator behind the cursor updates both copies, one
        // ahead of it updates only the live copy
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        gc_start(&fs).unwrap();
        fs.gc_pos
            .set(gc_pos_btree(BtreeId::Extents, 0, Bpos::new(5, 0)));

        let behind = extent(&fs, Bpos::new(1, 8), 50, 0, false);
        mark_key_at(&fs, &behind, gc_pos_btree(BtreeId::Extents, 0, Bpos::new(1, 0))).unwrap();
        assert_eq!(dev.bucket_view(false, 50).unwrap().dirty_sectors, 8);
        assert_eq!(dev.bucket_view(true, 50).unwrap().dirty_sectors, 8);

        let ahead = extent(&fs, Bpos::new(9, 8), 51, 0, false);
        mark_key_at(&fs, &ahead, gc_pos_btree(BtreeId::Extents, 0, Bpos::new(9, 0))).unwrap();
        assert_eq!(dev.bucket_view(false, 51).unwrap().dirty_sectors, 8);
        assert_eq!(dev.bucket_view(true, 51).unwrap().dirty_sectors, 0);

        gc_pos_reset(&fs);
        gc_free(&fs);
    }

    #[test]
    fn online_sweep_rewrites_stale_nodes() {
        // A node whose keys carry badly stale pointers is rewritten into a
        // fresh bucket during the sweep
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        dev.with_buckets_live(|arr| arr[50].gen = 20);

        let stale = BKey::new(
            Bpos::new(1, 8),
            8,
            BkeyVal::Extent {
                ptrs: vec![
                    Ptr {
                        dev: 0,
                        offset: dev.bucket_to_sector(50),
                        gen: 0,
                        cached: true,
                    },
                    Ptr {
                        dev: 0,
                        offset: dev.bucket_to_sector(51),
                        gen: 0,
                        cached: false,
                    },
                ],
                stripe_ptrs: vec![],
            },
        );
        let old_root = single_leaf_extents(&fs, vec![stale]);
        let old_addr = node_addr(&old_root).unwrap();

        gc(&fs, false).unwrap();

        assert_eq!(fs.fsck.count(), 0);
        let new_root = fs.roots.lock()[BtreeId::Extents as usize]
            .key
            .clone()
            .unwrap();
        assert_ne!(node_addr(&new_root).unwrap(), old_addr);
        // The old node's bucket no longer holds anything
        let old_bucket = dev.bucket_of(old_addr.1);
        assert_eq!(dev.bucket_view(false, old_bucket).unwrap().dirty_sectors, 0);
    }

    #[test]
    fn gens_pass_rewrites_badly_stale_extents() {
        // S5: bucket gen far ahead of a cached pointer; the extent is
        // normalized and oldest_gen catches up
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        dev.with_buckets_live(|arr| arr[50].gen = 20);

        let stale = BKey::new(
            Bpos::new(1, 8),
            8,
            BkeyVal::Extent {
                ptrs: vec![
                    Ptr {
                        dev: 0,
                        offset: dev.bucket_to_sector(50),
                        gen: 3,
                        cached: true,
                    },
                    Ptr {
                        dev: 0,
                        offset: dev.bucket_to_sector(51),
                        gen: 0,
                        cached: false,
                    },
                ],
                stripe_ptrs: vec![],
            },
        );
        let leaf = single_leaf_extents(&fs, vec![stale]);

        gc_gens(&fs).unwrap();

        assert_eq!(dev.bucket_view(false, 50).unwrap().oldest_gen, 20);
        assert_eq!(dev.bucket_view(false, 51).unwrap().oldest_gen, 0);

        let node = node_get(&fs, &leaf).unwrap();
        let guard = node.read();
        assert_eq!(guard.keys.len(), 1);
        assert_eq!(guard.keys[0].ptrs().len(), 1);
        assert!(!guard.keys[0].ptrs()[0].cached);
    }

    #[test]
    fn gens_pass_only_advances_oldest_gen() {
        // Invariant 3
        let fs = new_fs();
        let dev = fs.dev(0).unwrap();
        dev.with_buckets_live(|arr| {
            arr[50].gen = 5;
            arr[50].oldest_gen = 2;
        });
        single_leaf_extents(&fs, vec![extent(&fs, Bpos::new(1, 8), 50, 3, false)]);

        gc_gens(&fs).unwrap();

        let g = dev.bucket_view(false, 50).unwrap();
        // Advanced from 2 to the oldest live pointer, still bounded by gen
        assert_eq!(g.oldest_gen, 3);
        assert_eq!(g.gen, 5);
    }

    #[test]
    fn gc_thread_runs_on_kick() {
        let fs = new_fs();
        single_leaf_extents(&fs, vec![extent(&fs, Bpos::new(1, 8), 40, 0, false)]);

        gc_thread_start(&fs).unwrap();
        assert!(gc_thread_start(&fs).is_err());

        let before = fs.gc_count.load(Ordering::Acquire);
        fs.kick_gc();
        for _ in 0..200 {
            if fs.gc_count.load(Ordering::Acquire) > before {
                break;
            }
            crate::os::sleep(Duration::from_millis(5));
        }
        assert!(fs.gc_count.load(Ordering::Acquire) > before);

        gc_thread_stop(&fs);
        assert!(fs.gc_thread.lock().unwrap().is_none());
    }
}
