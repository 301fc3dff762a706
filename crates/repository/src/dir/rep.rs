//! Packed representation of directory contents.
//!
//! A directory is a chain of rep blocks in the pool. Most directories that
//! exist at any moment have no node object; they exist only in this packed
//! form.
//!
//! Block layout (block kinds `DirInner`, `DirImmutable`, `DirAppendable`):
//!
//! ```text
//! header: u8        kind in high 4 bits; visited in bit 1;
//!                   more/base discriminator in bits 2-3
//! timestamp: u32
//! id: u32           immutable: directory shortid; else pseudo-inode
//! fptag: 16 bytes   immutable directories only
//! snapshot: u32     mutable: cached immutable projection
//! free_len: u32     bytes of free space between end mark and link word
//! entries …         then a 0xff end mark, `free_len` free bytes, and a
//!                   final 4-byte more-or-base short pointer
//! ```
//!
//! Entry layout:
//!
//! ```text
//! flags: u8         master:1 (bit 0), has-fp:1 (bit 2),
//!                   same-as-base:1 (bit 3), type:4 (high bits)
//! value: u32        meaning depends on type
//! attrib: u32       head of the attribute chain
//! fptag: 16 bytes   only when has-fp
//! arc_len: u8
//! arc bytes         no terminator, at most 255
//! ```

use bitflags::bitflags;

use crate::fingerprint::Fingerprint;
use crate::pool::{BlockKind, MemPool, ShortPtr};
use crate::types::SourceKind;

/// Header field offsets.
pub const OFF_TIMESTAMP: u32 = 1;
pub const OFF_ID: u32 = 5;
pub const OFF_FPTAG: u32 = 9;
pub const OFF_SNAPSHOT: u32 = 25;
pub const OFF_FREELEN: u32 = 29;
/// First entry starts here.
pub const HEADER_SIZE: u32 = 33;

/// Fixed per-block overhead besides entries and free space:
/// header + end mark + more-or-base word.
pub const BLOCK_OVERHEAD: u32 = HEADER_SIZE + 1 + 4;

/// Size of a freshly allocated rep block.
pub const DEFAULT_REP_SIZE: u32 = 512;

/// Entry sizes without the arc bytes.
pub const ENTRY_MIN: u32 = 10;
pub const ENTRY_MIN_FP: u32 = 26;

/// The byte that terminates a block's entry run. Never a valid entry
/// flags byte: real gap entries carry no master/fp/base bits.
pub const END_MARK: u8 = 0xff;

bitflags! {
    /// Low bits of an entry's flags byte (the high 4 bits hold the type).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        const MASTER = 0x01;
        const HAS_FP = 0x04;
        const SAME_AS_BASE = 0x08;
    }
}

/// What the trailing more-or-base pointer of a block means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// No continuation and no base.
    None,
    /// Points at the next rep block of the same directory.
    More,
    /// Points at the base layer under this directory.
    Base,
}

impl LinkKind {
    fn from_bits(bits: u8) -> LinkKind {
        match bits {
            1 => LinkKind::More,
            2 => LinkKind::Base,
            _ => LinkKind::None,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            LinkKind::None => 0,
            LinkKind::More => 1,
            LinkKind::Base => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Rep blocks
// ---------------------------------------------------------------------------

/// One rep block in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepBlock(pub ShortPtr);

impl RepBlock {
    /// Allocates an empty rep block of at least `size` bytes.
    pub fn create(pool: &MemPool, kind: SourceKind, size: u32) -> RepBlock {
        let size = size.max(BLOCK_OVERHEAD);
        let block_kind = match kind {
            SourceKind::ImmutableDirectory => BlockKind::DirImmutable,
            SourceKind::AppendableDirectory => BlockKind::DirAppendable,
            _ => BlockKind::DirInner,
        };
        let sp = pool.allocate(block_kind, size);
        let block = RepBlock(sp);
        // Zero the header fields and the free space.
        let zero = vec![0u8; size as usize - 1];
        pool.write_bytes(ShortPtr(sp.0 + 1), &zero);
        pool.write_u8(ShortPtr(sp.0 + HEADER_SIZE), END_MARK);
        block.set_free_len(pool, size - BLOCK_OVERHEAD);
        block
    }

    #[inline]
    pub fn timestamp(&self, pool: &MemPool) -> u32 {
        pool.read_u32(ShortPtr(self.0 .0 + OFF_TIMESTAMP))
    }

    #[inline]
    pub fn set_timestamp(&self, pool: &MemPool, value: u32) {
        pool.write_u32(ShortPtr(self.0 .0 + OFF_TIMESTAMP), value);
    }

    #[inline]
    pub fn id(&self, pool: &MemPool) -> u32 {
        pool.read_u32(ShortPtr(self.0 .0 + OFF_ID))
    }

    #[inline]
    pub fn set_id(&self, pool: &MemPool, value: u32) {
        pool.write_u32(ShortPtr(self.0 .0 + OFF_ID), value);
    }

    pub fn fptag(&self, pool: &MemPool) -> Fingerprint {
        let mut fp = Fingerprint::NULL;
        fp.0
            .copy_from_slice(pool.bytes(ShortPtr(self.0 .0 + OFF_FPTAG), 16));
        fp
    }

    pub fn set_fptag(&self, pool: &MemPool, fp: &Fingerprint) {
        pool.write_bytes(ShortPtr(self.0 .0 + OFF_FPTAG), &fp.0);
    }

    #[inline]
    pub fn snapshot(&self, pool: &MemPool) -> ShortPtr {
        ShortPtr(pool.read_u32(ShortPtr(self.0 .0 + OFF_SNAPSHOT)))
    }

    #[inline]
    pub fn set_snapshot(&self, pool: &MemPool, sp: ShortPtr) {
        pool.write_u32(ShortPtr(self.0 .0 + OFF_SNAPSHOT), sp.0);
    }

    #[inline]
    pub fn free_len(&self, pool: &MemPool) -> u32 {
        pool.read_u32(ShortPtr(self.0 .0 + OFF_FREELEN))
    }

    #[inline]
    pub fn set_free_len(&self, pool: &MemPool, value: u32) {
        pool.write_u32(ShortPtr(self.0 .0 + OFF_FREELEN), value);
    }

    /// First entry position.
    #[inline]
    pub fn first_entry(&self) -> ShortPtr {
        ShortPtr(self.0 .0 + HEADER_SIZE)
    }

    /// Offset of the end mark, walking the entries.
    pub fn end_mark(&self, pool: &MemPool) -> ShortPtr {
        let mut at = self.first_entry();
        while !Entry(at).is_end_mark(pool) {
            at = Entry(at).next(pool);
        }
        at
    }

    /// Total block size in bytes (parsed from the contents).
    pub fn size(&self, pool: &MemPool) -> u32 {
        let end = self.end_mark(pool);
        (end.0 - self.0 .0) + 1 + self.free_len(pool) + 4
    }

    #[inline]
    pub fn link_kind(&self, pool: &MemPool) -> LinkKind {
        LinkKind::from_bits(pool.client_bits(self.0))
    }

    /// The trailing more-or-base short pointer.
    pub fn link(&self, pool: &MemPool) -> ShortPtr {
        let size = self.size(pool);
        ShortPtr(pool.read_u32(ShortPtr(self.0 .0 + size - 4)))
    }

    pub fn set_link(&self, pool: &MemPool, kind: LinkKind, target: ShortPtr) {
        let size = self.size(pool);
        pool.set_client_bits(self.0, kind.to_bits());
        pool.write_u32(ShortPtr(self.0 .0 + size - 4), target.0);
    }

    /// Iterates the entries of this block only.
    pub fn entries<'p>(&self, pool: &'p MemPool) -> EntryIter<'p> {
        EntryIter {
            pool,
            at: self.first_entry(),
        }
    }
}

/// Iterator over the entries of one rep block.
pub struct EntryIter<'p> {
    pool: &'p MemPool,
    at: ShortPtr,
}

impl Iterator for EntryIter<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let entry = Entry(self.at);
        if entry.is_end_mark(self.pool) {
            return None;
        }
        self.at = entry.next(self.pool);
        Some(entry)
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One packed entry inside a rep block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry(pub ShortPtr);

impl Entry {
    #[inline]
    pub fn is_end_mark(&self, pool: &MemPool) -> bool {
        pool.read_u8(self.0) == END_MARK
    }

    #[inline]
    fn flags(&self, pool: &MemPool) -> u8 {
        pool.read_u8(self.0)
    }

    #[inline]
    pub fn kind(&self, pool: &MemPool) -> SourceKind {
        SourceKind::from_u8(self.flags(pool) >> 4).expect("4-bit kind is always valid")
    }

    pub fn set_kind(&self, pool: &MemPool, kind: SourceKind) {
        let flags = self.flags(pool);
        pool.write_u8(self.0, (flags & 0x0f) | ((kind as u8) << 4));
    }

    #[inline]
    pub fn master(&self, pool: &MemPool) -> bool {
        self.flags(pool) & EntryFlags::MASTER.bits() != 0
    }

    pub fn set_master(&self, pool: &MemPool, value: bool) {
        let flags = self.flags(pool) & !EntryFlags::MASTER.bits();
        pool.write_u8(self.0, flags | value as u8);
    }

    #[inline]
    pub fn has_fp(&self, pool: &MemPool) -> bool {
        self.flags(pool) & EntryFlags::HAS_FP.bits() != 0
    }

    #[inline]
    pub fn same_as_base(&self, pool: &MemPool) -> bool {
        self.flags(pool) & EntryFlags::SAME_AS_BASE.bits() != 0
    }

    #[inline]
    pub fn value(&self, pool: &MemPool) -> u32 {
        pool.read_u32(ShortPtr(self.0 .0 + 1))
    }

    #[inline]
    pub fn set_value(&self, pool: &MemPool, value: u32) {
        pool.write_u32(ShortPtr(self.0 .0 + 1), value);
    }

    #[inline]
    pub fn attrib(&self, pool: &MemPool) -> ShortPtr {
        ShortPtr(pool.read_u32(ShortPtr(self.0 .0 + 5)))
    }

    #[inline]
    pub fn set_attrib(&self, pool: &MemPool, sp: ShortPtr) {
        pool.write_u32(ShortPtr(self.0 .0 + 5), sp.0);
    }

    /// Short pointer of the attrib field itself (the cell an attribute
    /// chain hangs from).
    #[inline]
    pub fn attrib_cell(&self) -> ShortPtr {
        ShortPtr(self.0 .0 + 5)
    }

    /// The entry's content fingerprint, or null if it has none.
    pub fn fptag(&self, pool: &MemPool) -> Fingerprint {
        if !self.has_fp(pool) {
            return Fingerprint::NULL;
        }
        let mut fp = Fingerprint::NULL;
        fp.0.copy_from_slice(pool.bytes(ShortPtr(self.0 .0 + 9), 16));
        fp
    }

    /// Overwrites the fingerprint; the entry must have been created with
    /// one (the flag governs the layout).
    pub fn set_fptag(&self, pool: &MemPool, fp: &Fingerprint) {
        debug_assert!(self.has_fp(pool));
        pool.write_bytes(ShortPtr(self.0 .0 + 9), &fp.0);
    }

    #[inline]
    fn arc_len_off(&self, pool: &MemPool) -> u32 {
        if self.has_fp(pool) {
            25
        } else {
            9
        }
    }

    #[inline]
    pub fn arc_len(&self, pool: &MemPool) -> u32 {
        pool.read_u8(ShortPtr(self.0 .0 + self.arc_len_off(pool))) as u32
    }

    /// The arc bytes (pathname component).
    pub fn arc<'p>(&self, pool: &'p MemPool) -> &'p [u8] {
        let off = self.arc_len_off(pool);
        let len = pool.read_u8(ShortPtr(self.0 .0 + off)) as usize;
        pool.bytes(ShortPtr(self.0 .0 + off + 1), len)
    }

    pub fn arc_string(&self, pool: &MemPool) -> String {
        String::from_utf8_lossy(self.arc(pool)).into_owned()
    }

    /// Entry size in bytes.
    pub fn size(&self, pool: &MemPool) -> u32 {
        let base = if self.has_fp(pool) {
            ENTRY_MIN_FP
        } else {
            ENTRY_MIN
        };
        base + self.arc_len(pool)
    }

    /// Position just past this entry.
    #[inline]
    pub fn next(&self, pool: &MemPool) -> ShortPtr {
        ShortPtr(self.0 .0 + self.size(pool))
    }

    /// How many raw indices this entry consumes (gaps consume several).
    pub fn index_width(&self, pool: &MemPool) -> u32 {
        if self.kind(pool) == SourceKind::Gap {
            self.value(pool)
        } else {
            1
        }
    }

    /// Rewrites an entry in place, preserving its fp layout and arc.
    ///
    /// Cannot change an entry between gap and non-gap: a gap's value is an
    /// index count, not content.
    pub fn overwrite(
        &self,
        pool: &MemPool,
        master: bool,
        same_as_base: bool,
        kind: SourceKind,
        value: u32,
        attrib: ShortPtr,
        fptag: Option<&Fingerprint>,
    ) {
        debug_assert_eq!(
            self.kind(pool) == SourceKind::Gap,
            kind == SourceKind::Gap,
            "cannot change an entry between gap and non-gap"
        );
        let keep_fp = self.flags(pool) & EntryFlags::HAS_FP.bits();
        let mut flags = keep_fp | ((kind as u8) << 4);
        flags |= master as u8;
        flags |= (same_as_base as u8) << 3;
        pool.write_u8(self.0, flags);
        self.set_value(pool, value);
        self.set_attrib(pool, attrib);
        match fptag {
            Some(fp) => {
                debug_assert!(keep_fp != 0);
                self.set_fptag(pool, fp);
            }
            None => {
                if keep_fp != 0 {
                    self.set_fptag(pool, &Fingerprint::NULL);
                }
            }
        }
    }
}

/// Builds the flags byte for a fresh entry.
pub fn make_flags(master: bool, same_as_base: bool, has_fp: bool, kind: SourceKind) -> u8 {
    let mut flags = (kind as u8) << 4;
    flags |= master as u8;
    flags |= (has_fp as u8) << 2;
    flags |= (same_as_base as u8) << 3;
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    fn pool() -> MemPool {
        MemPool::new(PoolConfig {
            soft_limit: 8 << 20,
            hard_limit: 16 << 20,
            min_grow: 4096,
        })
        .unwrap()
    }

    #[test]
    fn fresh_block_shape() {
        let pool = pool();
        let block = RepBlock::create(&pool, SourceKind::MutableDirectory, DEFAULT_REP_SIZE);
        assert_eq!(pool.kind_of(block.0), BlockKind::DirInner);
        assert_eq!(block.size(&pool), DEFAULT_REP_SIZE);
        assert_eq!(block.free_len(&pool), DEFAULT_REP_SIZE - BLOCK_OVERHEAD);
        assert_eq!(block.link_kind(&pool), LinkKind::None);
        assert_eq!(block.entries(&pool).count(), 0);
    }

    #[test]
    fn block_kinds_by_directory_kind() {
        let pool = pool();
        let imm = RepBlock::create(&pool, SourceKind::ImmutableDirectory, 64);
        let app = RepBlock::create(&pool, SourceKind::AppendableDirectory, 64);
        let vol = RepBlock::create(&pool, SourceKind::VolatileDirectory, 64);
        assert_eq!(pool.kind_of(imm.0), BlockKind::DirImmutable);
        assert_eq!(pool.kind_of(app.0), BlockKind::DirAppendable);
        assert_eq!(pool.kind_of(vol.0), BlockKind::DirInner);
    }

    #[test]
    fn header_fields_round_trip() {
        let pool = pool();
        let block = RepBlock::create(&pool, SourceKind::ImmutableDirectory, 128);
        block.set_timestamp(&pool, 123);
        block.set_id(&pool, 0x8000_0001);
        let fp = Fingerprint::of_text("dir");
        block.set_fptag(&pool, &fp);
        block.set_snapshot(&pool, ShortPtr(77));
        assert_eq!(block.timestamp(&pool), 123);
        assert_eq!(block.id(&pool), 0x8000_0001);
        assert_eq!(block.fptag(&pool), fp);
        assert_eq!(block.snapshot(&pool), ShortPtr(77));
    }

    #[test]
    fn link_round_trip() {
        let pool = pool();
        let block = RepBlock::create(&pool, SourceKind::MutableDirectory, 64);
        let base = RepBlock::create(&pool, SourceKind::ImmutableDirectory, 64);
        block.set_link(&pool, LinkKind::Base, base.0);
        assert_eq!(block.link_kind(&pool), LinkKind::Base);
        assert_eq!(block.link(&pool), base.0);
    }

    #[test]
    fn flags_round_trip() {
        let flags = make_flags(true, false, true, SourceKind::ImmutableFile);
        assert_eq!(flags & 1, 1);
        assert_eq!(flags & 4, 4);
        assert_eq!(flags & 8, 0);
        assert_eq!(flags >> 4, SourceKind::ImmutableFile as u8);
        // A gap entry with no flag bits can never be the end mark.
        assert_ne!(make_flags(false, false, false, SourceKind::Gap), END_MARK);
    }
}
