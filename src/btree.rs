//! In-memory btree forest: node model, node store, node cache and the
//! iterators the GC walks with.
//!
//! Nodes are persisted into the node store as postcard-encoded blobs, one
//! bucket per node; a blob that fails to decode reads back as an I/O
//! error, which is how unreadable nodes surface to recovery.

use crate::bkey::{BKey, BkeyVal, Bpos, Ptr};
use crate::buckets::{mark_key_at, unmark_key_at};
use crate::fs::{Dev, Fs};
use crate::pos::{gc_pos_btree, gc_pos_btree_root};
use crate::prelude::*;
use lru::LruCache;
use core::num::NonZeroUsize;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub const BTREE_MAX_DEPTH: u8 = 4;
/// On-disk size of a btree node.
pub const BTREE_NODE_SECTORS: u32 = 64;
pub const BLOCK_SECTORS: u32 = 8;
pub const BLOCK_U64S: usize = 512;
/// Key capacity of a node, in 64-bit words.
pub const BTREE_NODE_U64S: usize =
    (BTREE_NODE_SECTORS / BLOCK_SECTORS) as usize * BLOCK_U64S;

const BTREE_CACHE_CAPACITY: usize = 1024;

const_assert!(BTREE_NODE_SECTORS % BLOCK_SECTORS == 0);
const_assert!(BTREE_NODE_U64S >= BLOCK_U64S);

pub fn btree_blocks() -> usize {
    (BTREE_NODE_SECTORS / BLOCK_SECTORS) as usize
}

/// Blocks needed to hold `u64s` worth of keys.
pub fn blocks_for_u64s(u64s: usize) -> usize {
    crate::util::div_round_up(u64s, BLOCK_U64S)
}

/// The btrees, in on-disk id order.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum BtreeId {
    Extents = 0,
    Inodes,
    Dirents,
    Xattrs,
    Alloc,
    Stripes,
    Reflink,
}

pub const BTREE_ID_NR: usize = 7;

impl BtreeId {
    pub const ALL: [BtreeId; BTREE_ID_NR] = [
        BtreeId::Extents,
        BtreeId::Inodes,
        BtreeId::Dirents,
        BtreeId::Xattrs,
        BtreeId::Alloc,
        BtreeId::Stripes,
        BtreeId::Reflink,
    ];

    /// Sweep order: bucket gens first, then stripes so extent stripe
    /// pointers find their stripes already populated.
    pub fn gc_phase_order(self) -> u8 {
        match self {
            BtreeId::Alloc => 0,
            BtreeId::Stripes => 1,
            BtreeId::Extents => 2,
            BtreeId::Inodes => 3,
            BtreeId::Dirents => 4,
            BtreeId::Xattrs => 5,
            BtreeId::Reflink => 6,
        }
    }

    /// Whether this btree's leaf keys carry pointers or accounting the GC
    /// must recompute. Interior nodes always do.
    pub fn needs_gc(self) -> bool {
        !matches!(self, BtreeId::Dirents | BtreeId::Xattrs)
    }

    pub fn name(self) -> &'static str {
        match self {
            BtreeId::Extents => "extents",
            BtreeId::Inodes => "inodes",
            BtreeId::Dirents => "dirents",
            BtreeId::Xattrs => "xattrs",
            BtreeId::Alloc => "alloc",
            BtreeId::Stripes => "stripes",
            BtreeId::Reflink => "reflink",
        }
    }
}

/// One btree node.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Node {
    pub btree: BtreeId,
    /// 0 = leaf.
    pub level: u8,
    pub min_key: Bpos,
    pub max_key: Bpos,
    /// Sorted by position.
    pub keys: Vec<BKey>,
    /// Bumped on every write; coalescing revalidates its window with it.
    pub seq: u64,
}

impl Node {
    pub fn live_u64s(&self) -> usize {
        self.keys
            .iter()
            .filter(|k| !k.is_deleted())
            .map(|k| k.u64s())
            .sum()
    }

    pub fn contains_pos(&self, pos: Bpos) -> bool {
        self.min_key <= pos && pos <= self.max_key
    }
}

/// Device address of a node: (dev, sector offset).
pub type NodeAddr = (u32, u64);

/// Address a btree pointer key refers to.
pub fn node_addr(k: &BKey) -> Result<NodeAddr> {
    match k.ptrs().first() {
        Some(ptr) => Ok((ptr.dev, ptr.offset)),
        None => Err(Error::with_msg(Invalid, "btree ptr key without pointers")),
    }
}

/// Backing store for node blobs.
pub struct NodeStore {
    blobs: Mutex<HashMap<NodeAddr, Vec<u8>>>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn read(&self, addr: NodeAddr) -> Result<Node> {
        let blobs = self.blobs.lock();
        let Some(blob) = blobs.get(&addr) else {
            return_errno_with_msg!(Io, "unreadable btree node");
        };
        postcard::from_bytes(blob).map_err(|_| Error::with_msg(Io, "unreadable btree node"))
    }

    pub fn write(&self, addr: NodeAddr, node: &Node) -> Result<()> {
        let blob = postcard::to_allocvec(node)
            .map_err(|_| Error::with_msg(Invalid, "serialize btree node failed"))?;
        self.blobs.lock().insert(addr, blob);
        Ok(())
    }

    pub fn remove(&self, addr: NodeAddr) {
        self.blobs.lock().remove(&addr);
    }

    /// Overwrite a node blob with raw bytes; damage injection for tests.
    pub fn write_raw(&self, addr: NodeAddr, bytes: Vec<u8>) {
        self.blobs.lock().insert(addr, bytes);
    }
}

/// Decoded-node cache. Cached copies may be adjusted in memory by topology
/// repair without rewriting the backing blob.
pub struct BtreeCache {
    cache: Mutex<LruCache<NodeAddr, Arc<RwLock<Node>>>>,
}

impl BtreeCache {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(BTREE_CACHE_CAPACITY).unwrap(),
            )),
        }
    }

    pub fn get(&self, addr: NodeAddr) -> Option<Arc<RwLock<Node>>> {
        self.cache.lock().get(&addr).cloned()
    }

    pub(crate) fn insert(&self, addr: NodeAddr, node: Arc<RwLock<Node>>) {
        self.cache.lock().put(addr, node);
    }

    pub fn remove(&self, addr: NodeAddr) {
        self.cache.lock().pop(&addr);
    }
}

/// Root of one btree. A root with no key is fake: an empty tree that was
/// never written out, skipped by marking.
#[derive(Clone, Debug, Default)]
pub struct BtreeRoot {
    pub key: Option<BKey>,
    pub level: u8,
}

/// Fetch a node through the cache.
pub fn node_get(fs: &Fs, k: &BKey) -> Result<Arc<RwLock<Node>>> {
    let addr = node_addr(k)?;
    if let Some(node) = fs.node_cache.get(addr) {
        return Ok(node);
    }
    let node = Arc::new(RwLock::new(fs.node_store.read(addr)?));
    fs.node_cache.insert(addr, Arc::clone(&node));
    Ok(node)
}

/// Write a node to the store and refresh the cache.
pub fn node_write(fs: &Fs, addr: NodeAddr, node: Node) -> Result<()> {
    fs.node_store.write(addr, &node)?;
    fs.node_cache.insert(addr, Arc::new(RwLock::new(node)));
    Ok(())
}

/// All nodes of one btree at `level`, in key order, paired with the keys
/// pointing at them.
pub fn nodes_at_level(
    fs: &Fs,
    btree: BtreeId,
    level: u8,
) -> Result<Vec<(BKey, Arc<RwLock<Node>>)>> {
    let root = fs.roots.lock()[btree as usize].clone();
    let Some(root_key) = root.key else {
        return Ok(Vec::new());
    };
    if root.level < level {
        return Ok(Vec::new());
    }

    let mut frontier = vec![root_key];
    let mut cur_level = root.level;
    while cur_level > level {
        let mut next = Vec::new();
        for key in &frontier {
            let node = node_get(fs, key)?;
            let guard = node.read();
            debug_assert_eq!(guard.level, cur_level);
            next.extend(guard.keys.iter().filter(|k| k.is_btree_ptr()).cloned());
        }
        frontier = next;
        cur_level -= 1;
    }

    let mut out = Vec::with_capacity(frontier.len());
    for key in frontier {
        let node = node_get(fs, &key)?;
        out.push((key, node));
    }
    Ok(out)
}

/// Iterator over a node's keys merged with the not-yet-applied journal
/// overlay for the same `(btree, level)`. Overlay keys override node keys
/// at the same position; whiteouts hide them.
pub struct BtreeAndJournalIter {
    keys: Vec<BKey>,
    next: usize,
}

impl BtreeAndJournalIter {
    pub fn new(fs: &Fs, node: &Node) -> Self {
        let mut merged: BTreeMap<Bpos, BKey> = node
            .keys
            .iter()
            .map(|k| (k.pos, k.clone()))
            .collect();
        for jk in fs
            .journal_keys
            .for_node(node.btree, node.level, node.min_key, node.max_key)
        {
            merged.insert(jk.pos, jk);
        }
        Self {
            keys: merged
                .into_values()
                .filter(|k| !k.is_deleted())
                .collect(),
            next: 0,
        }
    }

    pub fn peek(&self) -> Option<&BKey> {
        self.keys.get(self.next)
    }

    pub fn advance(&mut self) {
        self.next += 1;
    }
}

/// Claim a free bucket for a new btree node.
pub(crate) fn alloc_node(fs: &Fs) -> Result<(Arc<Dev>, u64, NodeAddr)> {
    for dev in &fs.devs {
        if let Some(bucket) = dev.claim_btree_bucket()? {
            let addr = (dev.id, bucket * dev.bucket_sectors as u64);
            return Ok((Arc::clone(dev), bucket, addr));
        }
    }
    return_errno_with_msg!(NoSpace, "no free buckets for a btree node");
}

pub(crate) fn btree_ptr_for(dev: &Dev, bucket: u64, gen: u8, node: &Node) -> BKey {
    BKey::new(
        node.max_key,
        BTREE_NODE_SECTORS,
        BkeyVal::BtreePtrV2 {
            ptrs: vec![Ptr {
                dev: dev.id,
                offset: bucket * dev.bucket_sectors as u64,
                gen,
                cached: false,
            }],
            min_key: node.min_key,
            seq: node.seq,
            range_updated: false,
        },
    )
}

/// Create a node, persist it and account its reference and (for leaves)
/// its contents against the live counters. Returns the pointer key for the
/// parent.
pub fn make_node(
    fs: &Fs,
    btree: BtreeId,
    level: u8,
    min_key: Bpos,
    max_key: Bpos,
    keys: Vec<BKey>,
) -> Result<BKey> {
    debug_assert!(keys.windows(2).all(|w| w[0].pos < w[1].pos));
    let (dev, bucket, addr) = alloc_node(fs)?;
    let gen = dev.bucket_view(false, bucket)?.gen;
    let node = Node {
        btree,
        level,
        min_key,
        max_key,
        keys,
        seq: 1,
    };
    let key = btree_ptr_for(&dev, bucket, gen, &node);

    if level == 0 {
        let content_pos = gc_pos_btree(btree, 0, min_key);
        for k in node.keys.iter().filter(|k| !k.is_deleted()) {
            fs.replicas.mark_key(k)?;
            mark_key_at(fs, k, content_pos)?;
        }
    }
    fs.replicas.mark_key(&key)?;
    mark_key_at(fs, &key, gc_pos_btree(btree, level + 1, max_key))?;
    node_write(fs, addr, node)?;
    Ok(key)
}

pub fn set_root(fs: &Fs, btree: BtreeId, key: Option<BKey>, level: u8) {
    let mut roots = fs.roots.lock();
    roots[btree as usize] = BtreeRoot { key, level };
}

/// Find the interior node holding the pointer at (`pos`, `child_level`).
/// `None` when the child is the root.
pub fn find_parent(
    fs: &Fs,
    btree: BtreeId,
    pos: Bpos,
    child_level: u8,
) -> Result<Option<(BKey, Arc<RwLock<Node>>)>> {
    {
        let roots = fs.roots.lock();
        if roots[btree as usize].level == child_level {
            return Ok(None);
        }
    }
    for (key, node) in nodes_at_level(fs, btree, child_level + 1)? {
        if node.read().contains_pos(pos) {
            return Ok(Some((key, node)));
        }
    }
    return_errno_with_msg!(NotFound, "no parent node for child");
}

/// Rewrite a node into a freshly allocated bucket and swap the parent (or
/// root) reference over to it. Used by the online sweep to refresh nodes
/// whose pointers have gone badly stale.
pub fn node_rewrite(fs: &Fs, btree: BtreeId, old_key: &BKey, level: u8) -> Result<()> {
    let _update = fs.interior_update_begin();
    let old_addr = node_addr(old_key)?;
    let mut node = Node::clone(&node_get(fs, old_key)?.read());
    node.seq += 1;

    let (dev, bucket, addr) = alloc_node(fs)?;
    let gen = dev.bucket_view(false, bucket)?.gen;
    let new_key = btree_ptr_for(&dev, bucket, gen, &node);
    node_write(fs, addr, node)?;

    let ref_pos = match find_parent(fs, btree, old_key.pos, level)? {
        Some((parent_key, parent)) => {
            let parent_addr = node_addr(&parent_key)?;
            let mut guard = parent.write();
            let Some(slot) = guard.keys.iter_mut().find(|k| k.pos == old_key.pos) else {
                return_errno_with_msg!(Invalid, "parent lost the key being rewritten");
            };
            *slot = new_key.clone();
            guard.seq += 1;
            fs.node_store.write(parent_addr, &guard)?;
            gc_pos_btree(btree, guard.level, guard.min_key)
        }
        None => {
            let mut roots = fs.roots.lock();
            let root = &mut roots[btree as usize];
            root.key = Some(new_key.clone());
            gc_pos_btree_root(btree)
        }
    };

    mark_key_at(fs, &new_key, ref_pos)?;
    unmark_key_at(fs, old_key, ref_pos)?;

    fs.node_cache.remove(old_addr);
    fs.node_store.remove(old_addr);
    trace!(
        "rewrote {} node at {} into {}:{}",
        btree.name(),
        old_key.pos,
        addr.0,
        addr.1
    );
    Ok(())
}

/// Replace (or, if `new` is a whiteout, drop) one key in a leaf, keeping
/// the live accounting in step. The gens pass commits its extent rewrites
/// through this.
pub fn leaf_key_replace(
    fs: &Fs,
    leaf_key: &BKey,
    old: &BKey,
    new: BKey,
) -> Result<()> {
    let addr = node_addr(leaf_key)?;
    let node_arc = node_get(fs, leaf_key)?;
    let mut node = node_arc.write();
    debug_assert_eq!(node.level, 0);
    let Some(slot) = node.keys.iter().position(|k| k.pos == old.pos) else {
        return_errno_with_msg!(NotFound, "key being replaced is gone");
    };

    let content_pos = gc_pos_btree(node.btree, 0, node.min_key);
    mark_key_at(fs, &new, content_pos)?;
    unmark_key_at(fs, old, content_pos)?;

    if new.is_deleted() {
        node.keys.remove(slot);
    } else {
        node.keys[slot] = new;
    }
    node.seq += 1;
    fs.node_store.write(addr, &node)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::fs::DevConfig;

    fn new_fs() -> Arc<Fs> {
        Fs::new(FsConfig::default(), vec![DevConfig::default()]).unwrap()
    }

    fn extent(fs: &Fs, inode: u64, offset: u64, bucket: u64) -> BKey {
        let dev = fs.dev(0).unwrap();
        BKey::new(
            Bpos::new(inode, offset),
            8,
            BkeyVal::Extent {
                ptrs: vec![Ptr {
                    dev: 0,
                    offset: bucket * dev.bucket_sectors as u64,
                    gen: 0,
                    cached: false,
                }],
                stripe_ptrs: vec![],
            },
        )
    }

    #[test]
    fn build_and_walk_two_levels() {
        let fs = new_fs();
        let left = make_node(
            &fs,
            BtreeId::Extents,
            0,
            Bpos::MIN,
            Bpos::new(1, 100),
            vec![extent(&fs, 1, 8, 40), extent(&fs, 1, 64, 41)],
        )
        .unwrap();
        let right = make_node(
            &fs,
            BtreeId::Extents,
            0,
            Bpos::new(1, 101),
            Bpos::MAX,
            vec![extent(&fs, 2, 8, 42)],
        )
        .unwrap();
        let root = make_node(
            &fs,
            BtreeId::Extents,
            1,
            Bpos::MIN,
            Bpos::MAX,
            vec![left, right],
        )
        .unwrap();
        set_root(&fs, BtreeId::Extents, Some(root), 1);

        let leaves = nodes_at_level(&fs, BtreeId::Extents, 0).unwrap();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].1.read().keys.len(), 2);
        let interior = nodes_at_level(&fs, BtreeId::Extents, 1).unwrap();
        assert_eq!(interior.len(), 1);
    }

    #[test]
    fn journal_overlay_overrides_node_keys() {
        let fs = new_fs();
        let leaf_key = make_node(
            &fs,
            BtreeId::Extents,
            0,
            Bpos::MIN,
            Bpos::MAX,
            vec![extent(&fs, 1, 8, 40), extent(&fs, 1, 64, 41)],
        )
        .unwrap();
        set_root(&fs, BtreeId::Extents, Some(leaf_key.clone()), 0);

        // Whiteout one key, patch the other
        fs.journal_keys
            .delete(BtreeId::Extents, 0, Bpos::new(1, 8))
            .unwrap();
        let mut patched = extent(&fs, 1, 64, 43);
        patched.version = 7;
        fs.journal_keys
            .insert(BtreeId::Extents, 0, patched)
            .unwrap();

        let node = node_get(&fs, &leaf_key).unwrap();
        let mut iter = BtreeAndJournalIter::new(&fs, &node.read());
        let k = iter.peek().cloned().unwrap();
        assert_eq!(k.pos, Bpos::new(1, 64));
        assert_eq!(k.version, 7);
        iter.advance();
        assert!(iter.peek().is_none());
    }

    #[test]
    fn corrupt_node_reads_as_io_error() {
        let fs = new_fs();
        let leaf_key = make_node(&fs, BtreeId::Extents, 0, Bpos::MIN, Bpos::MAX, vec![])
            .unwrap();
        let addr = node_addr(&leaf_key).unwrap();
        fs.node_store.write_raw(addr, vec![0xff, 0x00, 0x17]);
        fs.node_cache.remove(addr);
        assert_eq!(node_get(&fs, &leaf_key).unwrap_err().errno(), Io);
    }

    #[test]
    fn rewrite_swaps_parent_pointer() {
        let fs = new_fs();
        let left = make_node(
            &fs,
            BtreeId::Extents,
            0,
            Bpos::MIN,
            Bpos::new(1, 100),
            vec![extent(&fs, 1, 8, 40)],
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
            vec![left.clone(), right],
        )
        .unwrap();
        set_root(&fs, BtreeId::Extents, Some(root.clone()), 1);

        let old_addr = node_addr(&left).unwrap();
        node_rewrite(&fs, BtreeId::Extents, &left, 0).unwrap();

        let parent = node_get(&fs, &root).unwrap();
        let guard = parent.read();
        let swapped = guard.keys.iter().find(|k| k.pos == left.pos).unwrap();
        assert_ne!(node_addr(swapped).unwrap(), old_addr);
        // Old bucket no longer holds btree data
        let dev = fs.dev(0).unwrap();
        let old_bucket = dev.bucket_of(old_addr.1);
        let g = dev.bucket_view(false, old_bucket).unwrap();
        assert_eq!(g.dirty_sectors, 0);
    }
}
