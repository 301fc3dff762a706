//! Garbage-collection and checkpoint plumbing for directory reps.
//!
//! The pool drives three passes and calls back per block kind: mark
//! (graph traversal from the roots), sweep (address-order walk that needs
//! every block's size), and rebuild (repopulating the fingerprint and
//! directory-shortid tables). Checkpointing is a separate post-order
//! traversal that assigns fresh short pointers and compresses runs of
//! dead entries into gaps.

use std::io::{self, Write};

use crate::attrib::AttrRec;
use crate::forward::Forward;
use crate::pool::{BlockKind, MemPool, ShortPtr, ALIGN_MASK};
use crate::refcount::SidRefCount;
use crate::repository::Repository;
use crate::types::{ShortId, SourceKind};

use super::rep::{LinkKind, RepBlock, END_MARK, ENTRY_MIN, HEADER_SIZE, OFF_SNAPSHOT};
use super::Source;

/// Size of a directory rep block, parsed from its contents.
pub fn block_size(pool: &MemPool, sp: ShortPtr) -> u32 {
    RepBlock(sp).size(pool)
}

/// Rebuild hook: re-registers immutable directories and sealed files.
///
/// This is an address-order walk, so continuation blocks arrive on their
/// own; they carry a zero id and a zero fingerprint and drop out of the
/// registration naturally.
pub fn rebuild(repo: &Repository, kind: BlockKind, sp: ShortPtr) {
    let pool = repo.pool();
    let block = RepBlock(sp);
    if kind == BlockKind::DirImmutable {
        let sid = ShortId(block.id(pool));
        if !sid.is_null() {
            repo.dirsids().set(sid, sp);
            repo.fpindex().set_dir(block.fptag(pool), sp, sid);
        }
    }
    for entry in block.entries(pool) {
        if entry.kind(pool) == SourceKind::ImmutableFile {
            repo.fpindex()
                .set_file(entry.fptag(pool), ShortId(entry.value(pool)));
        }
    }
}

impl Source {
    /// Mark phase: sets the visited bit on every pool block reachable
    /// from this directory.
    pub fn mark(&self, repo: &Repository) {
        let pool = repo.pool();
        if pool.visited(self.rep) {
            return;
        }
        let mut block = RepBlock(self.rep);
        loop {
            pool.set_visited(block.0, true);
            for entry in block.entries(pool) {
                let kind = entry.kind(pool);
                match kind {
                    SourceKind::Outdated | SourceKind::Gap => continue,
                    SourceKind::Deleted => {
                        let value = entry.value(pool);
                        if value != 0 {
                            Forward(ShortPtr(value)).mark(pool);
                        }
                    }
                    _ => {}
                }
                let attrib = entry.attrib(pool);
                if !attrib.is_null() {
                    AttrRec(attrib).mark(pool);
                }
                match kind {
                    SourceKind::ImmutableDirectory
                    | SourceKind::AppendableDirectory
                    | SourceKind::MutableDirectory
                    | SourceKind::VolatileDirectory
                    | SourceKind::VolatileROEDirectory => {
                        let child = Source::for_rep(kind, ShortPtr(entry.value(pool)));
                        child.mark(repo);
                    }
                    SourceKind::EvaluatorDirectory | SourceKind::EvaluatorROEDirectory => {
                        crate::evaluator::mark(pool, ShortPtr(entry.value(pool)));
                    }
                    _ => {}
                }
            }
            match block.link_kind(pool) {
                LinkKind::More => block = RepBlock(block.link(pool)),
                LinkKind::Base => {
                    let base = block.link(pool);
                    match self.kind {
                        SourceKind::VolatileDirectory | SourceKind::VolatileROEDirectory => {
                            crate::evaluator::mark(pool, base);
                        }
                        _ => {
                            let node =
                                Source::for_rep(SourceKind::ImmutableDirectory, base);
                            node.mark(repo);
                        }
                    }
                    break;
                }
                LinkKind::None => break,
            }
        }
        // The latest projection is kept alive with its directory.
        let snapshot = RepBlock(self.rep).snapshot(pool);
        if self.kind == SourceKind::MutableDirectory && !snapshot.is_null() {
            Source::for_rep(SourceKind::ImmutableDirectory, snapshot).mark(repo);
        }
    }

    /// Frees this changeable subtree outright: rep blocks, attribute
    /// chains, forwarding pointers, and one reference per mutable file
    /// (unlinking shortids that drop to zero).
    ///
    /// Shared structure (immutable children, evaluator surrogates) is
    /// left for the next sweep.
    pub fn free_tree(&self, repo: &Repository) {
        let pool = repo.pool();
        debug_assert!(matches!(
            self.kind,
            SourceKind::MutableDirectory
                | SourceKind::VolatileDirectory
                | SourceKind::VolatileROEDirectory
        ));
        let mut block = RepBlock(self.rep);
        loop {
            for entry in block.entries(pool) {
                let attrib = entry.attrib(pool);
                if !attrib.is_null() {
                    free_attrib_chain(pool, attrib);
                }
                match entry.kind(pool) {
                    SourceKind::MutableFile => {
                        let sid = ShortId(entry.value(pool));
                        if let Some(sidref) = &self.sidref {
                            if sidref.decrement(sid, true) == 0 {
                                repo.unlink_now(sid);
                            }
                        }
                    }
                    SourceKind::MutableDirectory
                    | SourceKind::VolatileDirectory
                    | SourceKind::VolatileROEDirectory => {
                        let mut child =
                            Source::for_rep(entry.kind(pool), ShortPtr(entry.value(pool)));
                        child.sidref = self.sidref.clone();
                        child.free_tree(repo);
                    }
                    SourceKind::Deleted => {
                        let value = entry.value(pool);
                        if value != 0 {
                            pool.free(
                                ShortPtr(value),
                                crate::forward::FORWARD_SIZE,
                                Some(BlockKind::Forward),
                            );
                        }
                    }
                    _ => {}
                }
            }
            let size = block.size(pool);
            let link_kind = block.link_kind(pool);
            let link = block.link(pool);
            pool.free(block.0, size, None);
            match link_kind {
                LinkKind::More => block = RepBlock(link),
                _ => break,
            }
        }
    }

    /// Accumulates mutable-file references for this directory's own rep,
    /// recursing into mutable children (the rebuild counterpart of the
    /// incrementally maintained counter).
    pub fn build_sid_refcount(&self, repo: &Repository, sidref: &SidRefCount) {
        let pool = repo.pool();
        let mut block = RepBlock(self.rep);
        loop {
            for entry in block.entries(pool) {
                match entry.kind(pool) {
                    SourceKind::MutableFile => {
                        sidref.increment(ShortId(entry.value(pool)));
                    }
                    SourceKind::MutableDirectory
                    | SourceKind::VolatileDirectory
                    | SourceKind::VolatileROEDirectory => {
                        let child =
                            Source::for_rep(entry.kind(pool), ShortPtr(entry.value(pool)));
                        child.build_sid_refcount(repo, sidref);
                    }
                    _ => {}
                }
            }
            match block.link_kind(pool) {
                LinkKind::More => block = RepBlock(block.link(pool)),
                _ => break,
            }
        }
    }
}

fn free_attrib_chain(pool: &MemPool, head: ShortPtr) {
    let mut cur = head;
    while !cur.is_null() {
        let rec = AttrRec(cur);
        let next = rec.next(pool);
        pool.free(cur, rec.size(pool), Some(BlockKind::Attrib));
        cur = next;
    }
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

/// Writes the directory rooted at `rep` into a checkpoint stream,
/// post-order, returning its post-checkpoint short pointer.
///
/// The chain is merged into one block; runs of dead entries become single
/// gap entries (and deleted entries with nothing left to shadow are
/// absorbed too), preserving the raw-index numbering. The visited bit
/// marks written blocks and the snapshot field is smashed to stash the
/// new short pointer, so shared directories are written once.
pub fn checkpoint_dir(
    repo: &Repository,
    next_sp: &mut u32,
    out: &mut dyn Write,
    rep: ShortPtr,
) -> io::Result<ShortPtr> {
    let pool = repo.pool();
    if pool.visited(rep) {
        return Ok(ShortPtr(pool.read_u32(ShortPtr(rep.0 + OFF_SNAPSHOT))));
    }
    let base_link = checkpoint_children(repo, next_sp, out, rep)?;
    let buf = compose_merged_block(repo, rep, base_link);

    let new_sp = ShortPtr(*next_sp);
    *next_sp += buf.len() as u32;
    out.write_all(&buf)?;

    pool.set_visited(rep, true);
    pool.write_u32(ShortPtr(rep.0 + OFF_SNAPSHOT), new_sp.0);
    Ok(new_sp)
}

/// Post-order pass: writes this directory's children, attribute chains,
/// forwards, and base into the stream, patching the in-memory entries to
/// carry the post-checkpoint short pointers. Returns the rewritten base.
pub(crate) fn checkpoint_children(
    repo: &Repository,
    next_sp: &mut u32,
    out: &mut dyn Write,
    rep: ShortPtr,
) -> io::Result<Option<ShortPtr>> {
    let pool = repo.pool();
    let first = RepBlock(rep);
    let mut block = first;
    let base_link;
    loop {
        for entry in block.entries(pool) {
            let kind = entry.kind(pool);
            match kind {
                SourceKind::ImmutableDirectory
                | SourceKind::AppendableDirectory
                | SourceKind::MutableDirectory
                | SourceKind::VolatileDirectory
                | SourceKind::VolatileROEDirectory => {
                    let new_child =
                        checkpoint_dir(repo, next_sp, out, ShortPtr(entry.value(pool)))?;
                    entry.set_value(pool, new_child.0);
                }
                SourceKind::EvaluatorDirectory | SourceKind::EvaluatorROEDirectory => {
                    let new_child = crate::evaluator::checkpoint_eval(
                        repo,
                        next_sp,
                        out,
                        ShortPtr(entry.value(pool)),
                    )?;
                    entry.set_value(pool, new_child.0);
                }
                SourceKind::Deleted | SourceKind::Outdated => {
                    let value = entry.value(pool);
                    if value != 0 {
                        let new_forward =
                            Forward(ShortPtr(value)).checkpoint(pool, next_sp, out)?;
                        entry.set_value(pool, new_forward.0);
                    }
                }
                _ => {}
            }
            let attrib = entry.attrib(pool);
            if !attrib.is_null() {
                let new_head = AttrRec(attrib).checkpoint(pool, next_sp, out)?;
                entry.set_attrib(pool, new_head);
            }
        }
        match block.link_kind(pool) {
            LinkKind::More => block = RepBlock(block.link(pool)),
            LinkKind::Base => {
                let base = block.link(pool);
                base_link = Some(if pool.kind_of(base) == BlockKind::DirEvaluator {
                    crate::evaluator::checkpoint_eval(repo, next_sp, out, base)?
                } else {
                    checkpoint_dir(repo, next_sp, out, base)?
                });
                break;
            }
            LinkKind::None => {
                base_link = None;
                break;
            }
        }
    }
    Ok(base_link)
}

/// Serializes the whole chain as one block, compressing dead runs into
/// gaps. The result's length does not depend on any patched pointer
/// value, so it can be used to pre-size a block before the children pass.
pub(crate) fn compose_merged_block(
    repo: &Repository,
    rep: ShortPtr,
    base_link: Option<ShortPtr>,
) -> Vec<u8> {
    let pool = repo.pool();
    let first = RepBlock(rep);
    let block_kind = pool.kind_of(rep);
    let has_base = base_link.is_some();

    let mut entries: Vec<u8> = Vec::new();
    let mut gap_run = 0u32;
    let mut block = first;
    loop {
        for entry in block.entries(pool) {
            let kind = entry.kind(pool);
            // Tombstones keeping a forwarding pointer must survive, or
            // renamed-away names stop resolving after a reload.
            let absorbable = kind == SourceKind::Gap
                || (kind == SourceKind::Outdated && entry.value(pool) == 0)
                || (kind == SourceKind::Deleted
                    && !has_base
                    && repo.log_version() >= 2
                    && entry.value(pool) == 0);
            if absorbable {
                gap_run += entry.index_width(pool);
                continue;
            }
            if gap_run > 0 {
                push_gap(&mut entries, gap_run);
                gap_run = 0;
            }
            entries.extend_from_slice(pool.bytes(entry.0, entry.size(pool) as usize));
        }
        match block.link_kind(pool) {
            LinkKind::More => block = RepBlock(block.link(pool)),
            _ => break,
        }
    }
    // A trailing dead run still consumes indices.
    if gap_run > 0 {
        push_gap(&mut entries, gap_run);
    }

    // Header: identity fields preserved, snapshot dropped, free space
    // zero, link word pointing at the rewritten base.
    let size = HEADER_SIZE + entries.len() as u32 + 1 + 4;
    let pad = size.wrapping_neg() & ALIGN_MASK;
    let mut buf = Vec::with_capacity((size + pad) as usize);
    let link_bits = if has_base { 2u8 } else { 0 };
    buf.push(((block_kind as u8) << 4) | (link_bits << 2));
    buf.extend_from_slice(&first.timestamp(pool).to_le_bytes());
    buf.extend_from_slice(&first.id(pool).to_le_bytes());
    buf.extend_from_slice(&first.fptag(pool).0);
    buf.extend_from_slice(&0u32.to_le_bytes()); // snapshot
    buf.extend_from_slice(&0u32.to_le_bytes()); // free_len
    debug_assert_eq!(buf.len() as u32, HEADER_SIZE);
    buf.extend_from_slice(&entries);
    buf.push(END_MARK);
    buf.extend_from_slice(&base_link.unwrap_or(ShortPtr::NULL).0.to_le_bytes());
    buf.resize((size + pad) as usize, 0);
    buf
}

/// Appends a gap entry covering `width` raw indices.
fn push_gap(entries: &mut Vec<u8>, width: u32) {
    let start = entries.len();
    entries.push((SourceKind::Gap as u8) << 4);
    entries.extend_from_slice(&width.to_le_bytes());
    entries.extend_from_slice(&0u32.to_le_bytes()); // attrib
    entries.push(0); // arc length
    debug_assert_eq!(entries.len() - start, ENTRY_MIN as usize);
}
