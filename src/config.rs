#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    /// Repair consistency errors found during the sweep instead of only
    /// reporting them.
    pub fix_errors: bool,
    /// Wake the GC thread on the write clock, not just on explicit kicks.
    pub btree_gc_periodic: bool,
    /// The on-disk allocation info is trustworthy, so reconciliation of an
    /// initial (recovery) run verifies against it.
    pub compat_alloc_info: bool,
    pub debug: GcDebug,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            fix_errors: true,
            btree_gc_periodic: false,
            compat_alloc_info: true,
            debug: GcDebug::default(),
        }
    }
}

/// Debug knobs for the GC, all off by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcDebug {
    /// Rewrite every node with any stale pointer, not just badly stale ones.
    pub always_rewrite: bool,
    /// Never rewrite nodes during the online sweep.
    pub rewrite_disabled: bool,
    /// Force one extra GC iteration to exercise the restart path.
    pub restart_gc: bool,
    /// Assert that key versions never exceed the current journal sequence.
    pub journal_seq_verify: bool,
    /// Walk every level of every btree, even ones whose leaf keys carry no
    /// pointers.
    pub expensive_checks: bool,
}
