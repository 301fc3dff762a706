//! The 32-bit-pointer memory pool backing all packed directory state.
//!
//! Every directory rep block, attribute record, forwarding pointer, and
//! evaluator surrogate lives in one contiguous arena addressed by 32-bit
//! *short pointers*. A short pointer encodes `offset + 1`; 0 is the null
//! short pointer. The arena is a memory-mapped temporary file created at
//! the hard size limit and mapped exactly once, so the base address (and
//! with it every short pointer) stays stable for the life of the process;
//! "growth" advances a watermark and enforces the configured limits.
//!
//! Each allocated block begins with a header byte: the high 4 bits hold the
//! [`BlockKind`], the low 4 bits belong to the client (bit 1 is the shared
//! *visited* bit used by mark/sweep and checkpointing).
//!
//! Free space ≥ [`FREE_BLOCK_MIN`] bytes is kept on circular doubly-linked
//! free lists partitioned by power-of-two size class; smaller fragments are
//! filled with `freeByte` markers and reclaimed by the next sweep. A
//! trailing-edge table maps the short pointer just past each free region to
//! its start so that `free` can coalesce backward.

use std::cell::UnsafeCell;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::types::ShortId;

/// Alignment of every allocated block (8 bytes).
pub const ALIGN_MASK: u32 = 7;

/// Minimum size of a block that can live on a free list.
pub const FREE_BLOCK_MIN: u32 = 13;

// Free-block field offsets (relative to the block start).
const FREEBK_LENGTH: u32 = 1;
const FREEBK_NEXT: u32 = 5;
const FREEBK_PREV: u32 = 9;

/// A 32-bit index into the pool; 0 is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ShortPtr(pub u32);

impl ShortPtr {
    pub const NULL: ShortPtr = ShortPtr(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Byte offset into the arena.
    #[inline]
    fn offset(self) -> usize {
        debug_assert!(self.0 != 0, "null short pointer dereferenced");
        (self.0 - 1) as usize
    }
}

impl std::fmt::Display for ShortPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Block type codes stored in the high 4 bits of every header byte.
///
/// The discriminants appear in checkpoints; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    FreeByte = 0,
    FreeBlock = 1,
    /// Mutable / volatile directory rep block.
    DirInner = 2,
    Forward = 3,
    DirEvaluator = 4,
    DirImmutable = 5,
    Attrib = 6,
    DirAppendable = 7,
}

impl BlockKind {
    pub const COUNT: usize = 8;

    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        use BlockKind::*;
        Some(match value {
            0 => FreeByte,
            1 => FreeBlock,
            2 => DirInner,
            3 => Forward,
            4 => DirEvaluator,
            5 => DirImmutable,
            6 => Attrib,
            7 => DirAppendable,
            _ => return None,
        })
    }
}

/// Per-kind hooks the pool calls during mark/sweep/rebuild.
///
/// Implemented by the repository handle, which knows how to parse each
/// client block kind and which derived tables to repopulate.
pub trait PoolHooks {
    /// Mark phase: set the visited bit on every block reachable from the
    /// three roots, plus the immutable directories named in `keep_derived`.
    fn mark_roots(&self, keep_derived: &[ShortId]);

    /// Returns the size in bytes of the client block at `sp`.
    fn block_size(&self, kind: BlockKind, sp: ShortPtr) -> u32;

    /// Rebuild pass over live blocks, run after a sweep or a checkpoint
    /// read; repopulates the fingerprint and directory-shortid tables.
    fn rebuild(&self, kind: BlockKind, sp: ShortPtr);
}

/// Pool sizing knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Aborting past this limit is preceded by a configuration hint.
    pub soft_limit: u32,
    /// Absolute ceiling; also the size of the sparse backing file.
    pub hard_limit: u32,
    /// Minimum watermark extension, rounded up to whole pages.
    pub min_grow: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            soft_limit: 0x3800_0000,
            hard_limit: 0x4000_0000,
            min_grow: 4 << 20,
        }
    }
}

/// Counters surfaced by [`MemPool::stats`].
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub size: u32,
    pub free_list_blocks: u32,
    pub free_list_bytes: u32,
    pub free_wasted_bytes: u32,
    pub nonempty_free_lists: u8,
    pub allocate_calls: u64,
    pub allocate_rej_small: u64,
    pub allocate_rej_large: u64,
    pub allocate_split: u64,
    pub allocate_new: u64,
    pub allocate_time: Duration,
    pub free_calls: u64,
    pub free_coalesce_before: u64,
    pub free_coalesce_after: u64,
    pub free_time: Duration,
    pub grow_calls: u64,
}

struct PoolInner {
    /// First never-allocated short pointer.
    watermark: u32,
    /// Current logical size (watermark ceiling before grow is needed).
    grown: u32,
    /// Cursor into each size class's circular free list (0 = empty).
    free_lists: Vec<u32>,
    /// Trailing-edge table: sp just past a free region -> region start sp.
    origins: FnvHashMap<u32, u32>,
    stats: PoolStats,
}

/// The memory pool.
///
/// Raw byte access takes `&self`: block contents are mutated concurrently
/// by threads holding different repository locks (stable tree vs. distinct
/// volatile subtrees), which partition the blocks between them. The
/// structural state (free lists, watermark, trailing edges) is guarded by
/// an internal mutex that is never held across any other lock acquisition.
pub struct MemPool {
    /// Keeps the backing file alive for the life of the pool.
    _file: NamedTempFile,
    map: UnsafeCell<MmapMut>,
    inner: Mutex<PoolInner>,
    config: PoolConfig,
    page_size: u32,
}

// SAFETY: all mutation of mapped bytes is confined to blocks owned by the
// caller under the repository locking protocol (see module docs); the
// mapping itself is created once and never moved or resized.
unsafe impl Send for MemPool {}
unsafe impl Sync for MemPool {}

impl MemPool {
    /// Creates an empty pool with the given limits.
    pub fn new(config: PoolConfig) -> io::Result<MemPool> {
        let file = NamedTempFile::new()?;
        // Sparse file at the hard limit; pages materialize on first write.
        file.as_file().set_len(config.hard_limit as u64)?;
        let map = unsafe { MmapOptions::new().map_mut(file.as_file())? };
        let page_size = 4096;
        let grown = page_size.max(config.min_grow).min(config.hard_limit);
        Ok(MemPool {
            _file: file,
            map: UnsafeCell::new(map),
            inner: Mutex::new(PoolInner {
                watermark: 1,
                grown,
                free_lists: Vec::new(),
                origins: FnvHashMap::default(),
                stats: PoolStats::default(),
            }),
            config,
            page_size,
        })
    }

    // -----------------------------------------------------------------
    // Raw access
    // -----------------------------------------------------------------

    #[inline]
    fn raw(&self) -> &mut [u8] {
        // SAFETY: see the Sync impl; disjointness of concurrent accesses is
        // the caller's locking obligation, as in the original design.
        unsafe { (*self.map.get()).as_mut() }
    }

    #[inline]
    pub fn read_u8(&self, sp: ShortPtr) -> u8 {
        self.raw()[sp.offset()]
    }

    #[inline]
    pub fn write_u8(&self, sp: ShortPtr, value: u8) {
        self.raw()[sp.offset()] = value;
    }

    #[inline]
    pub fn read_u32(&self, sp: ShortPtr) -> u32 {
        let at = sp.offset();
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.raw()[at..at + 4]);
        u32::from_le_bytes(buf)
    }

    #[inline]
    pub fn write_u32(&self, sp: ShortPtr, value: u32) {
        let at = sp.offset();
        self.raw()[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn read_u64(&self, sp: ShortPtr) -> u64 {
        let at = sp.offset();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.raw()[at..at + 8]);
        u64::from_le_bytes(buf)
    }

    #[inline]
    pub fn write_u64(&self, sp: ShortPtr, value: u64) {
        let at = sp.offset();
        self.raw()[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Shared view of `len` bytes starting at `sp`.
    #[inline]
    pub fn bytes(&self, sp: ShortPtr, len: usize) -> &[u8] {
        let at = sp.offset();
        &self.raw()[at..at + len]
    }

    #[inline]
    pub fn write_bytes(&self, sp: ShortPtr, src: &[u8]) {
        let at = sp.offset();
        self.raw()[at..at + src.len()].copy_from_slice(src);
    }

    /// Short pointer `delta` bytes past `sp`.
    #[inline]
    pub fn advance(&self, sp: ShortPtr, delta: u32) -> ShortPtr {
        ShortPtr(sp.0 + delta)
    }

    // -----------------------------------------------------------------
    // Header byte
    // -----------------------------------------------------------------

    /// The block kind stored in the header at `sp`.
    #[inline]
    pub fn kind_of(&self, sp: ShortPtr) -> BlockKind {
        BlockKind::from_u8(self.read_u8(sp) >> 4).expect("4-bit kind is always valid")
    }

    #[inline]
    fn set_kind(&self, sp: ShortPtr, kind: BlockKind) {
        // Setting the kind clears the client bits, as at allocation.
        self.write_u8(sp, (kind as u8) << 4);
    }

    /// Client visited bit (bit 1), shared by mark/sweep and checkpointing.
    #[inline]
    pub fn visited(&self, sp: ShortPtr) -> bool {
        self.read_u8(sp) & 0x02 != 0
    }

    #[inline]
    pub fn set_visited(&self, sp: ShortPtr, value: bool) {
        let byte = self.read_u8(sp);
        self.write_u8(sp, (byte & !0x02) | ((value as u8) << 1));
    }

    /// Client bits 2-3 (used by directory reps for the more/base kind).
    #[inline]
    pub fn client_bits(&self, sp: ShortPtr) -> u8 {
        (self.read_u8(sp) >> 2) & 0x3
    }

    #[inline]
    pub fn set_client_bits(&self, sp: ShortPtr, value: u8) {
        debug_assert!(value <= 3);
        let byte = self.read_u8(sp);
        self.write_u8(sp, (byte & !0x0c) | (value << 2));
    }

    // -----------------------------------------------------------------
    // Free-block fields
    // -----------------------------------------------------------------

    #[inline]
    fn fb_length(&self, sp: ShortPtr) -> u32 {
        self.read_u32(ShortPtr(sp.0 + FREEBK_LENGTH))
    }

    #[inline]
    fn fb_set_length(&self, sp: ShortPtr, len: u32) {
        self.write_u32(ShortPtr(sp.0 + FREEBK_LENGTH), len);
    }

    #[inline]
    fn fb_next(&self, sp: ShortPtr) -> u32 {
        self.read_u32(ShortPtr(sp.0 + FREEBK_NEXT))
    }

    #[inline]
    fn fb_set_next(&self, sp: ShortPtr, next: u32) {
        self.write_u32(ShortPtr(sp.0 + FREEBK_NEXT), next);
    }

    #[inline]
    fn fb_prev(&self, sp: ShortPtr) -> u32 {
        self.read_u32(ShortPtr(sp.0 + FREEBK_PREV))
    }

    #[inline]
    fn fb_set_prev(&self, sp: ShortPtr, prev: u32) {
        self.write_u32(ShortPtr(sp.0 + FREEBK_PREV), prev);
    }

    /// Size class for a free block of `size` bytes (16-31 -> 0, 32-63 -> 1, …).
    fn free_list_index(size: u32) -> usize {
        debug_assert!(size > FREE_BLOCK_MIN);
        let mut index = 0;
        let mut s = size >> 5;
        while s > 0 {
            s >>= 1;
            index += 1;
        }
        index
    }

    fn remove_from_free_list(&self, inner: &mut PoolInner, block: ShortPtr, keep_origin: bool) {
        debug_assert_eq!(self.kind_of(block), BlockKind::FreeBlock);
        let length = self.fb_length(block);
        let index = Self::free_list_index(length);
        let cursor = inner.free_lists[index];
        debug_assert!(cursor != 0);

        if self.fb_prev(block) == block.0 {
            // List of length one.
            debug_assert_eq!(self.fb_next(block), block.0);
            inner.free_lists[index] = 0;
            while inner.free_lists.last() == Some(&0) {
                inner.free_lists.pop();
            }
        } else {
            let prev = ShortPtr(self.fb_prev(block));
            let next = ShortPtr(self.fb_next(block));
            self.fb_set_next(prev, next.0);
            self.fb_set_prev(next, prev.0);
            if cursor == block.0 {
                inner.free_lists[index] = prev.0;
            }
        }

        if !keep_origin {
            let removed = inner.origins.remove(&(block.0 + length));
            debug_assert_eq!(removed, Some(block.0));
        }

        inner.stats.free_list_blocks -= 1;
        inner.stats.free_list_bytes -= length;
    }

    fn add_to_free_list(&self, inner: &mut PoolInner, block: ShortPtr) {
        debug_assert_eq!(self.kind_of(block), BlockKind::FreeBlock);
        let length = self.fb_length(block);
        let index = Self::free_list_index(length);

        while inner.free_lists.len() <= index {
            inner.free_lists.push(0);
        }
        let cursor = inner.free_lists[index];
        if cursor == 0 {
            self.fb_set_next(block, block.0);
            self.fb_set_prev(block, block.0);
            inner.free_lists[index] = block.0;
        } else {
            let next = ShortPtr(self.fb_next(ShortPtr(cursor)));
            self.fb_set_next(block, next.0);
            self.fb_set_prev(block, cursor);
            self.fb_set_next(ShortPtr(cursor), block.0);
            self.fb_set_prev(next, block.0);
        }

        let clobbered = inner.origins.insert(block.0 + length, block.0);
        debug_assert!(clobbered.is_none());

        inner.stats.free_list_blocks += 1;
        inner.stats.free_list_bytes += length;
    }

    /// Fills `[start, start+len)` with freeByte markers and registers the
    /// run in the trailing-edge table.
    fn fill_free_bytes(&self, inner: &mut PoolInner, start: ShortPtr, len: u32) {
        if len == 0 {
            return;
        }
        let at = start.offset();
        self.raw()[at..at + len as usize].fill(0);
        inner.stats.free_wasted_bytes += len;
        let clobbered = inner.origins.insert(start.0 + len, start.0);
        debug_assert!(clobbered.is_none());
    }

    // -----------------------------------------------------------------
    // Allocate / free
    // -----------------------------------------------------------------

    /// Allocates a block of at least `size` bytes with the given kind.
    ///
    /// The caller must hold a lock that gates weeding and checkpointing
    /// (the stable lock, the volatile-root lock, or a volatile subtree
    /// lock); otherwise the new block could be swept before the caller
    /// stores a pointer to it.
    ///
    /// Exhaustion is fatal: the configured limits exist to bound the
    /// 32-bit address space and the process cannot continue past them.
    pub fn allocate(&self, kind: BlockKind, size: u32) -> ShortPtr {
        let started = Instant::now();
        let mut asize = size.max(FREE_BLOCK_MIN);
        asize += asize.wrapping_neg() & ALIGN_MASK;

        let mut inner = self.inner.lock();
        let chosen = self.allocate_block(&mut inner, asize);

        // Fill the aligned tail past `size` with freeByte markers so a
        // later free can absorb it.
        if size < asize {
            let mut at = ShortPtr(chosen.0 + size);
            let mut used = size;
            // Unaligned leading padding never gets an origin entry.
            while used < asize && (used & ALIGN_MASK) != 0 {
                self.write_u8(at, 0);
                at = ShortPtr(at.0 + 1);
                used += 1;
            }
            if used < asize {
                let residue = asize - used;
                if residue < FREE_BLOCK_MIN {
                    self.fill_free_bytes(&mut inner, at, residue);
                } else {
                    // Rare: requested size below FREE_BLOCK_MIN satisfied
                    // from a block between one and two minimum sizes.
                    self.set_kind(at, BlockKind::FreeBlock);
                    self.fb_set_length(at, residue);
                    self.add_to_free_list(&mut inner, at);
                    inner.stats.allocate_split += 1;
                }
            }
        }

        self.set_kind(chosen, kind);
        inner.stats.allocate_calls += 1;
        inner.stats.allocate_time += started.elapsed();
        chosen
    }

    /// Finds or carves a block of exactly `asize` aligned bytes.
    fn allocate_block(&self, inner: &mut PoolInner, asize: u32) -> ShortPtr {
        let mut index = if asize <= FREE_BLOCK_MIN {
            0
        } else {
            Self::free_list_index(asize)
        };
        while index < inner.free_lists.len() {
            let cursor = inner.free_lists[index];
            if cursor == 0 {
                index += 1;
                continue;
            }
            let mut prev = ShortPtr(cursor);
            let mut p = ShortPtr(self.fb_next(prev));
            loop {
                let p_len = self.fb_length(p);
                if p_len >= asize {
                    let mut best = p;
                    let mut best_len = p_len;
                    // Best local fit: advance while the next block still
                    // fits and is smaller.
                    while best_len > asize {
                        let next = ShortPtr(self.fb_next(best));
                        let next_len = self.fb_length(next);
                        if next_len < asize || next_len >= best_len {
                            break;
                        }
                        best = next;
                        best_len = next_len;
                        inner.stats.allocate_rej_large += 1;
                    }
                    self.remove_from_free_list(inner, best, false);
                    let excess = best_len - asize;
                    if excess >= FREE_BLOCK_MIN {
                        let split = ShortPtr(best.0 + asize);
                        self.set_kind(split, BlockKind::FreeBlock);
                        self.fb_set_length(split, excess);
                        self.add_to_free_list(inner, split);
                        inner.stats.allocate_split += 1;
                    } else if excess > 0 {
                        // Too small to list: freeByte fill, remembered in
                        // the trailing-edge table so a later neighboring
                        // free can absorb it.
                        self.fill_free_bytes(inner, ShortPtr(best.0 + asize), excess);
                    }
                    return best;
                }
                prev = p;
                p = ShortPtr(self.fb_next(p));
                inner.stats.allocate_rej_small += 1;
                if prev.0 == cursor {
                    break;
                }
            }
            index += 1;
        }

        // Carve from the unused tail, growing if needed.
        let p = ShortPtr(inner.watermark);
        if inner.grown - inner.watermark <= asize {
            self.grow(inner, asize - (inner.grown - inner.watermark));
        }
        inner.watermark += asize;
        inner.stats.allocate_new += 1;
        p
    }

    /// Extends the logical pool size by at least `need` bytes.
    fn grow(&self, inner: &mut PoolInner, need: u32) {
        let grow_by = need
            .max(self.config.min_grow)
            .next_multiple_of(self.page_size);
        let new_size = inner.grown.saturating_add(grow_by);
        if new_size > self.config.hard_limit {
            panic!(
                "memory pool hard limit exceeded: {} + {} > {}",
                inner.grown, grow_by, self.config.hard_limit
            );
        }
        if new_size > self.config.soft_limit {
            log::error!(
                "memory pool soft limit exceeded ({} > {}); raise the limit \
                 or weed the repository",
                new_size,
                self.config.soft_limit
            );
            panic!("memory pool soft limit exceeded");
        }
        inner.grown = new_size;
        inner.stats.grow_calls += 1;
    }

    /// Frees the block at `sp` of the given size, coalescing with adjacent
    /// free space. If `kind` is provided the header is checked against it.
    pub fn free(&self, sp: ShortPtr, size: u32, kind: Option<BlockKind>) {
        let started = Instant::now();
        if let Some(expected) = kind {
            assert_eq!(self.kind_of(sp), expected, "freeing block of wrong kind");
        }
        let mut inner = self.inner.lock();

        let mut start = sp;
        let mut asize = size;

        // Coalesce forward over freeByte runs and free blocks.
        let mut q = ShortPtr(sp.0 + asize);
        let mut merged_after = false;
        while q.0 < inner.watermark {
            match self.kind_of(q) {
                BlockKind::FreeByte => {
                    q = ShortPtr(q.0 + 1);
                    asize += 1;
                    inner.stats.free_wasted_bytes = inner.stats.free_wasted_bytes.saturating_sub(1);
                    // A free region may end exactly here; absorb its entry.
                    if (q.0 - 1) & ALIGN_MASK == 0 {
                        if let Some(run_start) = inner.origins.remove(&q.0) {
                            debug_assert!(run_start > sp.0 && run_start < q.0);
                            merged_after = true;
                        }
                    }
                }
                BlockKind::FreeBlock => {
                    let len = self.fb_length(q);
                    self.remove_from_free_list(&mut inner, q, false);
                    q = ShortPtr(q.0 + len);
                    asize += len;
                    merged_after = true;
                }
                _ => break,
            }
        }
        if merged_after {
            inner.stats.free_coalesce_after += 1;
        }

        // Coalesce backward via the trailing-edge table.
        if let Some(run_start) = inner.origins.remove(&start.0) {
            let run_len = start.0 - run_start;
            if run_len > FREE_BLOCK_MIN {
                self.remove_from_free_list(&mut inner, ShortPtr(run_start), true);
            } else {
                inner.stats.free_wasted_bytes =
                    inner.stats.free_wasted_bytes.saturating_sub(run_len);
            }
            start = ShortPtr(run_start);
            asize += run_len;
            inner.stats.free_coalesce_before += 1;
        }

        if asize > FREE_BLOCK_MIN {
            self.set_kind(start, BlockKind::FreeBlock);
            self.fb_set_length(start, asize);
            self.add_to_free_list(&mut inner, start);
        } else {
            let at = start.offset();
            self.raw()[at..at + asize as usize].fill(0);
            inner.stats.free_wasted_bytes += asize;
            inner.origins.insert(start.0 + asize, start.0);
        }

        inner.stats.free_calls += 1;
        inner.stats.free_time += started.elapsed();
    }

    // -----------------------------------------------------------------
    // Mark / sweep / rebuild
    // -----------------------------------------------------------------

    /// One mark phase plus one sweep phase.
    ///
    /// Marks everything reachable from the roots (plus the immutable
    /// directories named by `keep_derived`), then rebuilds the free lists
    /// and trailing-edge table by scanning the arena in address order,
    /// and finally runs the per-kind rebuild pass over the survivors.
    pub fn gc(&self, hooks: &dyn PoolHooks, keep_derived: &[ShortId]) {
        hooks.mark_roots(keep_derived);

        let mut inner = self.inner.lock();
        inner.free_lists.clear();
        inner.origins.clear();
        inner.stats.free_list_blocks = 0;
        inner.stats.free_list_bytes = 0;
        inner.stats.free_wasted_bytes = 0;

        let watermark = inner.watermark;
        let mut sp = 1u32;
        let mut run_start: Option<u32> = None;
        while sp < watermark {
            let here = ShortPtr(sp);
            match self.kind_of(here) {
                BlockKind::FreeByte => {
                    run_start.get_or_insert(sp);
                    sp += 1;
                }
                BlockKind::FreeBlock => {
                    let len = self.fb_length(here);
                    run_start.get_or_insert(sp);
                    sp += len;
                }
                kind => {
                    let size = hooks.block_size(kind, here);
                    debug_assert!(size > 0);
                    let live = self.visited(here);
                    self.set_visited(here, false);
                    if live {
                        if let Some(start) = run_start.take() {
                            self.close_free_run(&mut inner, start, sp);
                        }
                    } else {
                        run_start.get_or_insert(sp);
                    }
                    sp += size;
                    // Alignment padding shows up as freeBytes and is
                    // handled by the arms above.
                }
            }
        }
        // A trailing run returns to the unused tail.
        if let Some(start) = run_start {
            inner.watermark = start;
        }
        inner.stats.size = inner.grown;
        drop(inner);

        self.rebuild_pass(hooks);
    }

    /// Converts a free run `[start, end)` into a listed block or freeBytes.
    fn close_free_run(&self, inner: &mut PoolInner, start: u32, end: u32) {
        let len = end - start;
        if len > FREE_BLOCK_MIN {
            let block = ShortPtr(start);
            self.set_kind(block, BlockKind::FreeBlock);
            self.fb_set_length(block, len);
            self.add_to_free_list(inner, block);
        } else {
            let at = ShortPtr(start).offset();
            self.raw()[at..at + len as usize].fill(0);
            inner.stats.free_wasted_bytes += len;
            inner.origins.insert(end, start);
        }
    }

    /// Walks live blocks in address order invoking the rebuild hook.
    pub fn rebuild_pass(&self, hooks: &dyn PoolHooks) {
        let watermark = self.inner.lock().watermark;
        let mut sp = 1u32;
        while sp < watermark {
            let here = ShortPtr(sp);
            match self.kind_of(here) {
                BlockKind::FreeByte => sp += 1,
                BlockKind::FreeBlock => sp += self.fb_length(here),
                kind => {
                    hooks.rebuild(kind, here);
                    sp += hooks.block_size(kind, here);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Checkpoint support
    // -----------------------------------------------------------------

    /// First never-allocated short pointer.
    pub fn watermark(&self) -> u32 {
        self.inner.lock().watermark
    }

    /// Dumps the raw arena bytes `[1, end)` to a checkpoint stream.
    pub fn dump_region(&self, writer: &mut dyn Write, from: u32, end: u32) -> io::Result<()> {
        if end > from {
            writer.write_all(self.bytes(ShortPtr(from), (end - from) as usize))?;
        }
        Ok(())
    }

    /// Resets the pool to empty (no free lists, watermark at 1).
    ///
    /// Used before loading a checkpoint image.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.watermark = 1;
        inner.free_lists.clear();
        inner.origins.clear();
        inner.stats = PoolStats::default();
    }

    /// Loads `end - from` image bytes from a checkpoint stream into the
    /// arena at `[from, end)` and advances the watermark to `end`.
    pub fn load_region(&self, reader: &mut dyn Read, from: u32, end: u32) -> io::Result<()> {
        debug_assert!(from >= 1 && end >= from);
        {
            let mut inner = self.inner.lock();
            while inner.grown < end {
                let need = end - inner.grown;
                self.grow(&mut inner, need);
            }
            inner.watermark = end;
        }
        if end > from {
            let at = ShortPtr(from).offset();
            reader.read_exact(&mut self.raw()[at..at + (end - from) as usize])?;
        }
        Ok(())
    }

    /// Snapshot of the pool statistics.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.size = inner.grown;
        stats.nonempty_free_lists = inner.free_lists.iter().filter(|&&c| c != 0).count() as u8;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> MemPool {
        MemPool::new(PoolConfig {
            soft_limit: 8 << 20,
            hard_limit: 16 << 20,
            min_grow: 4096,
        })
        .unwrap()
    }

    #[test]
    fn allocate_aligns_and_tags() {
        let pool = small_pool();
        let a = pool.allocate(BlockKind::Attrib, 14);
        let b = pool.allocate(BlockKind::Forward, 33);
        assert_eq!((a.0 - 1) & ALIGN_MASK, 0);
        assert_eq!((b.0 - 1) & ALIGN_MASK, 0);
        assert_eq!(pool.kind_of(a), BlockKind::Attrib);
        assert_eq!(pool.kind_of(b), BlockKind::Forward);
        // 14 rounds to 16, so b starts 16 past a.
        assert_eq!(b.0, a.0 + 16);
    }

    #[test]
    fn read_write_round_trip() {
        let pool = small_pool();
        let sp = pool.allocate(BlockKind::DirInner, 64);
        pool.write_u32(ShortPtr(sp.0 + 4), 0xdead_beef);
        pool.write_bytes(ShortPtr(sp.0 + 8), b"hello");
        assert_eq!(pool.read_u32(ShortPtr(sp.0 + 4)), 0xdead_beef);
        assert_eq!(pool.bytes(ShortPtr(sp.0 + 8), 5), b"hello");
    }

    #[test]
    fn free_then_reallocate_reuses() {
        let pool = small_pool();
        let a = pool.allocate(BlockKind::Attrib, 64);
        let _b = pool.allocate(BlockKind::Attrib, 64);
        pool.free(a, 64, Some(BlockKind::Attrib));
        let c = pool.allocate(BlockKind::Forward, 64);
        assert_eq!(c, a);
    }

    #[test]
    fn free_coalesces_neighbors() {
        let pool = small_pool();
        let a = pool.allocate(BlockKind::Attrib, 32);
        let b = pool.allocate(BlockKind::Attrib, 32);
        let c = pool.allocate(BlockKind::Attrib, 32);
        let _guard = pool.allocate(BlockKind::Attrib, 32);
        pool.free(a, 32, None);
        pool.free(c, 32, None);
        pool.free(b, 32, None);
        // All three merged: a 96-byte allocation fits at a's address.
        let big = pool.allocate(BlockKind::DirInner, 96);
        assert_eq!(big, a);
    }

    #[test]
    fn visited_bit_round_trip() {
        let pool = small_pool();
        let sp = pool.allocate(BlockKind::Attrib, 16);
        assert!(!pool.visited(sp));
        pool.set_visited(sp, true);
        assert!(pool.visited(sp));
        assert_eq!(pool.kind_of(sp), BlockKind::Attrib);
        pool.set_visited(sp, false);
        assert!(!pool.visited(sp));
    }

    #[test]
    fn client_bits_independent_of_visited() {
        let pool = small_pool();
        let sp = pool.allocate(BlockKind::DirInner, 32);
        pool.set_client_bits(sp, 2);
        pool.set_visited(sp, true);
        assert_eq!(pool.client_bits(sp), 2);
        pool.set_client_bits(sp, 1);
        assert!(pool.visited(sp));
        assert_eq!(pool.client_bits(sp), 1);
    }

    #[test]
    fn stats_track_calls() {
        let pool = small_pool();
        let sp = pool.allocate(BlockKind::Attrib, 16);
        pool.free(sp, 16, None);
        let stats = pool.stats();
        assert_eq!(stats.allocate_calls, 1);
        assert_eq!(stats.free_calls, 1);
        assert!(stats.size > 0);
    }

    struct NoHooks;
    impl PoolHooks for NoHooks {
        fn mark_roots(&self, _keep: &[ShortId]) {}
        fn block_size(&self, _kind: BlockKind, _sp: ShortPtr) -> u32 {
            16
        }
        fn rebuild(&self, _kind: BlockKind, _sp: ShortPtr) {}
    }

    #[test]
    fn gc_reclaims_unmarked() {
        let pool = small_pool();
        let a = pool.allocate(BlockKind::Attrib, 16);
        let b = pool.allocate(BlockKind::Attrib, 16);
        // Mark only b by hand; a sweep should reclaim a.
        pool.set_visited(b, true);
        pool.gc(&NoHooks, &[]);
        let c = pool.allocate(BlockKind::Attrib, 16);
        assert_eq!(c, a);
        assert_eq!(pool.kind_of(b), BlockKind::Attrib);
    }
}
