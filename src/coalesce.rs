//! Btree coalescing: merge adjacent sibling nodes with low occupancy into
//! fewer nodes.
//!
//! Independent of the mark and sweep machinery; runs under the GC lock
//! held for reading. Nodes are pulled through a sliding window of adjacent
//! siblings, revalidated by sequence number each step since a concurrent
//! split can yank a node out from under the window.

use crate::bkey::{BKey, FormatState};
use crate::btree::{
    alloc_node, blocks_for_u64s, btree_blocks, btree_ptr_for, node_addr, node_get,
    nodes_at_level, BtreeId, Node, BLOCK_U64S, BTREE_NODE_U64S,
};
use crate::buckets::{mark_key_at, unmark_key_at};
use crate::fs::Fs;
use crate::pos::gc_pos_btree;
use crate::prelude::*;
use crate::util::div_round_up;
use core::sync::atomic::Ordering;
use static_assertions::const_assert;
use std::collections::VecDeque;

/// Width of the sliding window of adjacent siblings.
pub const GC_MERGE_NODES: usize = 4;

const_assert!(GC_MERGE_NODES >= 2);

/// Window entry: pointer key, the node, and the sequence number it had
/// when it entered the window.
type WindowEntry = (BKey, Arc<RwLock<Node>>, u64);

/// Try to merge the nodes currently in the window. Returns whether a merge
/// happened; on success the window is reset to the rightmost replacement.
fn coalesce_nodes(
    fs: &Fs,
    btree: BtreeId,
    parent_key: &BKey,
    window: &mut VecDeque<WindowEntry>,
) -> Result<bool> {
    let nr_old = window.len();
    if nr_old <= 1 {
        return Ok(false);
    }

    // The window is newest-first; lay the nodes out left to right.
    let mut nodes: Vec<Node> = window
        .iter()
        .rev()
        .map(|(_, arc, _)| Node::clone(&arc.read()))
        .collect();

    // Check if all keys could fit in one fewer node
    let u64s: usize = nodes.iter().map(Node::live_u64s).sum();
    let blocks = btree_blocks() * 2 / 3;
    if blocks_for_u64s(div_round_up(u64s, nr_old - 1)) > blocks {
        return Ok(false);
    }

    // Find a packed format every key in the window can use
    let mut format = FormatState::new();
    for node in &nodes {
        format.add_range(node.min_key, node.max_key);
    }
    let format = format.done();
    for node in &nodes {
        let packed: usize = node
            .keys
            .iter()
            .filter(|k| !k.is_deleted())
            .map(|k| format.packed_u64s(k))
            .sum();
        if packed > BTREE_NODE_U64S || node.keys.iter().any(|k| !format.fits(k)) {
            trace!("btree coalesce fail: common format does not fit");
            return Ok(false);
        }
    }

    let _update = fs.interior_update_begin();

    for node in &mut nodes {
        node.seq += 1;
        node.keys.retain(|k| !k.is_deleted());
    }

    // Conceptually the nodes are concatenated and sliced up at new
    // boundaries: from the right, slide keys into the left neighbor for as
    // long as they fit.
    let fill_limit = blocks * BLOCK_U64S;
    let mut right = 1;
    while right < nodes.len() {
        let mut left_u64s = nodes[right - 1].live_u64s();
        let mut moved = 0;
        while moved < nodes[right].keys.len()
            && left_u64s + nodes[right].keys[moved].u64s() <= fill_limit
        {
            left_u64s += nodes[right].keys[moved].u64s();
            moved += 1;
        }

        if moved == nodes[right].keys.len() {
            // The right node fits entirely in its left neighbor
            let absorbed = nodes.remove(right);
            let left = &mut nodes[right - 1];
            left.keys.extend(absorbed.keys);
            left.max_key = absorbed.max_key;
        } else if moved > 0 {
            let moved_keys: Vec<BKey> = nodes[right].keys.drain(..moved).collect();
            let left = &mut nodes[right - 1];
            left.keys.extend(moved_keys);
            left.max_key = left.keys.last().map(|k| k.pos).unwrap_or(left.max_key);
            nodes[right].min_key = left.max_key.successor();
            right += 1;
        } else {
            right += 1;
        }
    }

    if nodes.len() == nr_old {
        trace!("btree coalesce fail: nothing to merge after repack");
        return Ok(false);
    }

    // Write the replacement nodes into fresh buckets
    let mut new_keys = Vec::with_capacity(nodes.len());
    for node in nodes {
        let (dev, bucket, addr) = alloc_node(fs)?;
        let gen = dev.bucket_view(false, bucket)?.gen;
        let key = btree_ptr_for(&dev, bucket, gen, &node);
        crate::btree::node_write(fs, addr, node)?;
        new_keys.push(key);
    }

    // Update the parent: the old keys get deleted, except where a new key
    // has the same position and overwrites it on insertion anyway.
    let parent_arc = node_get(fs, parent_key)?;
    let ref_pos = {
        let mut parent = parent_arc.write();
        for (old_key, _, _) in window.iter() {
            if new_keys.iter().all(|nk| nk.pos != old_key.pos) {
                parent.keys.retain(|k| k.pos != old_key.pos);
            }
        }
        for nk in &new_keys {
            match parent.keys.iter_mut().find(|k| k.pos == nk.pos) {
                Some(slot) => *slot = nk.clone(),
                None => {
                    let at = parent.keys.partition_point(|k| k.pos < nk.pos);
                    parent.keys.insert(at, nk.clone());
                }
            }
        }
        parent.seq += 1;
        fs.node_store.write(node_addr(parent_key)?, &parent)?;
        gc_pos_btree(btree, parent.level, parent.min_key)
    };

    for nk in &new_keys {
        mark_key_at(fs, nk, ref_pos)?;
    }
    for (old_key, _, _) in window.iter() {
        unmark_key_at(fs, old_key, ref_pos)?;
    }

    // Free the old nodes in memory
    for (old_key, _, _) in window.iter() {
        let addr = node_addr(old_key)?;
        fs.node_cache.remove(addr);
        fs.node_store.remove(addr);
    }

    trace!(
        "coalesced {} {} nodes into {}",
        nr_old,
        btree.name(),
        new_keys.len()
    );

    // Keep only the rightmost replacement in the window; the others are
    // not adjacent to whatever comes next.
    window.clear();
    let rightmost = new_keys.pop().unwrap();
    let node = node_get(fs, &rightmost)?;
    let seq = node.read().seq;
    window.push_front((rightmost, node, seq));
    Ok(true)
}

/// Slide a window over one parent's children, merging where profitable.
fn coalesce_parent(fs: &Fs, btree: BtreeId, parent_key: &BKey) -> Result<()> {
    let mut window: VecDeque<WindowEntry> = VecDeque::new();
    let mut nth = 0;

    loop {
        if fs.gc_stop.load(Ordering::Acquire) {
            return_errno_with_msg!(Shutdown, "coalesce interrupted");
        }

        let parent = node_get(fs, parent_key)?;
        let child_key = {
            let guard = parent.read();
            guard.keys.get(nth).cloned()
        };
        let Some(child_key) = child_key else {
            break;
        };
        nth += 1;
        if !child_key.is_btree_ptr() {
            continue;
        }

        let child = node_get(fs, &child_key)?;
        let child_seq = child.read().seq;
        window.push_front((child_key, child, child_seq));
        window.truncate(GC_MERGE_NODES);

        // Re-validate the tail: drop entries whose lock sequence moved or
        // whose level disagrees with the newest entry
        let front_level = window[0].1.read().level;
        let mut valid = 1;
        while valid < window.len() {
            let (_, node, seq) = &window[valid];
            let guard = node.read();
            if guard.seq != *seq || guard.level != front_level {
                break;
            }
            valid += 1;
        }
        window.truncate(valid);

        if coalesce_nodes(fs, btree, parent_key, &mut window)? {
            // The parent shrank; continue right after the merged node
            let merged_pos = window[0].0.pos;
            let guard = parent.read();
            nth = guard.keys.partition_point(|k| k.pos <= merged_pos);
        }
    }
    Ok(())
}

fn coalesce_btree(fs: &Fs, btree: BtreeId) -> Result<()> {
    let root_level = fs.roots.lock()[btree as usize].level;

    for level in 1..=root_level {
        for (parent_key, _) in nodes_at_level(fs, btree, level)? {
            coalesce_parent(fs, btree, &parent_key)?;
        }
    }
    Ok(())
}

/// Coalesce adjacent nodes with low occupancy across all btrees. Errors
/// are traced, not returned; a shutdown request stops the walk quietly.
pub fn coalesce(fs: &Fs) {
    let _gc = fs.gc_lock.read().unwrap();
    trace!("coalesce start");

    for id in BtreeId::ALL {
        let has_root = fs.roots.lock()[id as usize].key.is_some();
        if !has_root {
            continue;
        }
        if let Err(e) = coalesce_btree(fs, id) {
            if e.errno() != Shutdown {
                error!("btree coalescing failed: {:?}", e);
            }
            return;
        }
    }

    trace!("coalesce end");
}
