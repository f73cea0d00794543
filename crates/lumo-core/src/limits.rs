//! Shared limits and tuning constants

/// Minimum free slots guaranteed to a host function on entry.
pub const MIN_STACK: usize = 20;

/// Hard ceiling on the value stack of one thread, in slots.
pub const MAX_STACK: usize = 1_000_000;

/// Extra slots reserved above the ceiling while handling a stack error.
pub const ERROR_STACK_EXTRA: usize = 200;

/// Maximum nesting of host-call re-entries (metamethods, hooks, pcall
/// drivers). Bounds native stack growth the way the frame vector cannot.
pub const MAX_HOST_CALLS: usize = 200;

/// Maximum number of upvalues in a closure.
pub const MAX_UPVALUES: usize = 255;

/// Chain bound for `__index` / `__newindex` delegation before the lookup is
/// declared cyclic.
pub const MAX_META_CHAIN: usize = 2000;

/// Strings at most this many bytes are interned.
pub const MAX_SHORT_LEN: usize = 40;

/// Number of array slots flushed per `SETLIST` batch.
pub const FIELDS_PER_FLUSH: usize = 50;

/// Default GC pause: collector waits until the heap doubles (percent).
pub const GC_PAUSE_DEFAULT: u32 = 200;

/// Default GC step multiplier (percent).
pub const GC_STEP_MUL_DEFAULT: u32 = 200;

/// Smallest accepted GC step multiplier (percent).
pub const GC_STEP_MUL_MIN: u32 = 40;

/// Registry slot holding the main thread.
pub const RIDX_MAINTHREAD: i64 = 1;

/// Registry slot holding the globals table.
pub const RIDX_GLOBALS: i64 = 2;

/// Last well-known registry slot.
pub const RIDX_LAST: i64 = RIDX_GLOBALS;

/// Pseudo-index addressing the registry.
pub const REGISTRY_INDEX: i64 = -1_001_000;

/// Pseudo-index of the i-th upvalue of the running host closure (1-based).
pub const fn upvalue_index(i: usize) -> i64 {
    REGISTRY_INDEX - i as i64
}

/// Runtime version number, `major * 100 + minor`.
pub const VERSION_NUM: i64 = 503;
