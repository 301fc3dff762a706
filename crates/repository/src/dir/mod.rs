//! Directory nodes over the packed rep.
//!
//! A [`Source`] is a transient handle onto one node of the namespace; most
//! directories exist only in packed form and get a `Source` constructed on
//! demand during traversal. Dispatch is by [`SourceKind`], read from the
//! packed type tag.
//!
//! Submodules:
//!
//! * [`rep`] — packed block and entry encoding
//! * `mutate` — inserts, rename, delete, master flag
//! * `seal` — copy-on-write in, make-immutable out, snapshots
//! * `gc` — mark, sweep sizing, rebuild, checkpoint, free

pub mod gc;
pub mod mutate;
pub mod rep;
pub mod seal;

use std::cell::Cell;
use std::sync::Arc;

use crate::access::{AccessClass, Identity, NodeAc};
use crate::attrib;
use crate::error::{RepositoryError, Result};
use crate::fingerprint::Fingerprint;
use crate::forward::{Forward, MAX_FOLLOW_DEPTH};
use crate::longid::LongId;
use crate::pool::{BlockKind, MemPool, ShortPtr};
use crate::refcount::SidRefCount;
use crate::repository::Repository;
use crate::types::{ShortId, SourceKind, NULL_SHORTID};

use rep::{Entry, LinkKind, RepBlock, DEFAULT_REP_SIZE, END_MARK, ENTRY_MIN, ENTRY_MIN_FP};

/// Where a node's attribute-chain head pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttribsLoc {
    /// The node cannot carry attributes (e.g. inside an immutable base).
    None,
    /// A 4-byte cell in the pool (an entry's attrib field).
    Pool(ShortPtr),
    /// One of the three root cells held by the repository handle.
    RepositoryRoot,
    MutableRoot,
    VolatileRoot,
}

impl AttribsLoc {
    #[inline]
    pub fn has_attribs(self) -> bool {
        !matches!(self, AttribsLoc::None)
    }
}

/// Cached facts about a rep chain, filled lazily by one walk.
#[derive(Debug, Clone, Copy)]
pub struct RepCaches {
    /// End mark of the last rep block.
    pub rep_end: ShortPtr,
    /// Next unassigned raw index (1-origin).
    pub next_raw_index: u32,
    /// Base layer under the last rep block, if any.
    pub base: ShortPtr,
    /// Last block of the chain.
    pub last_block: ShortPtr,
    /// Total bytes across the chain's blocks.
    pub total_size: u32,
}

/// A transient handle onto one node of the namespace.
#[derive(Clone, Debug)]
pub struct Source {
    pub longid: LongId,
    pub kind: SourceKind,
    pub master: bool,
    pub pseudo_inode: u32,
    pub fptag: Fingerprint,
    pub attribs: AttribsLoc,
    pub ac: NodeAc,
    /// Directory kinds: first rep block. Leaves: null.
    pub rep: ShortPtr,
    /// File kinds: the shortid. Directories: null.
    pub sid: ShortId,
    /// Shared mutable-shortid counter for the containing tree.
    pub sidref: Option<Arc<SidRefCount>>,
    caches: Cell<Option<RepCaches>>,
}

impl Source {
    /// Bare directory handle onto an existing rep; everything else is the
    /// caller's to fill in.
    pub fn for_rep(kind: SourceKind, rep: ShortPtr) -> Source {
        Source {
            longid: LongId::NULL,
            kind,
            master: false,
            pseudo_inode: 0,
            fptag: Fingerprint::NULL,
            attribs: AttribsLoc::None,
            ac: NodeAc::default(),
            rep,
            sid: NULL_SHORTID,
            sidref: None,
            caches: Cell::new(None),
        }
    }

    /// Leaf handle (files, ghosts, stubs, devices).
    pub fn for_leaf(kind: SourceKind, sid: ShortId) -> Source {
        let mut node = Source::for_rep(kind, ShortPtr::NULL);
        node.sid = sid;
        node
    }

    /// The directory shortid, for immutable directories that have one.
    pub fn shortid(&self, pool: &MemPool) -> ShortId {
        if self.kind == SourceKind::ImmutableDirectory {
            ShortId(RepBlock(self.rep).id(pool))
        } else {
            NULL_SHORTID
        }
    }

    /// Discards cached rep facts (after another handle mutated the rep).
    pub fn resync(&self) {
        self.caches.set(None);
    }

    /// Pseudo-inode for the entry at `index` of this directory.
    pub fn index_to_pseudo_inode(&self, index: u32) -> u32 {
        self.pseudo_inode.wrapping_mul(0x0100_0193) ^ index
    }

    // -----------------------------------------------------------------
    // Rep-chain walking
    // -----------------------------------------------------------------

    fn first_block(&self) -> RepBlock {
        debug_assert!(!self.rep.is_null());
        RepBlock(self.rep)
    }

    /// Fills and returns the cached chain facts.
    pub fn caches(&self, pool: &MemPool) -> RepCaches {
        if let Some(caches) = self.caches.get() {
            return caches;
        }
        let caches = fill_caches(pool, self.first_block());
        self.caches.set(Some(caches));
        caches
    }

    /// Base layer of this directory, if any.
    pub fn base_rep(&self, pool: &MemPool) -> ShortPtr {
        self.caches(pool).base
    }

    pub fn next_raw_index(&self, pool: &MemPool) -> u32 {
        self.caches(pool).next_raw_index
    }

    pub fn timestamp(&self, pool: &MemPool) -> u32 {
        self.first_block().timestamp(pool)
    }

    /// Finds an entry by arc in the own rep (not the base).
    ///
    /// Returns the entry and its raw index. Deleted and outdated entries
    /// are only returned when asked for.
    pub fn find_arc(
        &self,
        pool: &MemPool,
        arc: &[u8],
        include_deleted: bool,
        include_outdated: bool,
    ) -> Option<(Entry, u32)> {
        if arc.is_empty() {
            return None;
        }
        let mut block = self.first_block();
        let mut raw_index = 1u32;
        let mut total_size = 0u32;
        loop {
            for entry in block.entries(pool) {
                if entry.arc_len(pool) as usize == arc.len() && entry.arc(pool) == arc {
                    match entry.kind(pool) {
                        SourceKind::Deleted => {
                            if include_deleted {
                                return Some((entry, raw_index));
                            }
                        }
                        SourceKind::Outdated => {
                            if include_outdated {
                                return Some((entry, raw_index));
                            }
                        }
                        SourceKind::Gap => {}
                        _ => return Some((entry, raw_index)),
                    }
                }
                raw_index += entry.index_width(pool);
            }
            total_size += block.size(pool);
            match block.link_kind(pool) {
                LinkKind::More => block = RepBlock(block.link(pool)),
                _ => break,
            }
        }
        // Not found; the walk just computed the cache contents.
        if self.caches.get().is_none() {
            let base = if block.link_kind(pool) == LinkKind::Base {
                block.link(pool)
            } else {
                ShortPtr::NULL
            };
            self.caches.set(Some(RepCaches {
                rep_end: block.end_mark(pool),
                next_raw_index: raw_index,
                base,
                last_block: block.0,
                total_size,
            }));
        }
        None
    }

    /// Finds the entry covering `raw_index` in the own rep.
    ///
    /// A gap entry covering the index is returned as such.
    pub fn find_raw_index(&self, pool: &MemPool, raw_index: u32) -> Option<Entry> {
        let mut block = self.first_block();
        let mut at = 1u32;
        loop {
            for entry in block.entries(pool) {
                if entry.kind(pool) == SourceKind::Gap {
                    at += entry.value(pool) - 1;
                }
                if at >= raw_index {
                    return Some(entry);
                }
                at += 1;
            }
            match block.link_kind(pool) {
                LinkKind::More => block = RepBlock(block.link(pool)),
                _ => return None,
            }
        }
    }

    /// Appends a fresh entry at the tail of the rep, allocating a new
    /// block when free space runs out. Returns the entry.
    pub fn append_entry(
        &self,
        pool: &MemPool,
        master: bool,
        same_as_base: bool,
        kind: SourceKind,
        value: u32,
        attrib: ShortPtr,
        fptag: Option<&Fingerprint>,
        arc: &[u8],
    ) -> Entry {
        debug_assert!(arc.len() <= 255);
        let mut caches = self.caches(pool);
        let entry_len =
            arc.len() as u32 + if fptag.is_some() { ENTRY_MIN_FP } else { ENTRY_MIN };

        let mut last = RepBlock(caches.last_block);
        if last.free_len(pool) < entry_len {
            // Chain on another block.
            let block_kind = pool.kind_of(self.rep);
            let fresh = create_block_raw(pool, block_kind, DEFAULT_REP_SIZE);
            if last.link_kind(pool) == LinkKind::Base {
                fresh.set_link(pool, LinkKind::Base, last.link(pool));
            }
            last.set_link(pool, LinkKind::More, fresh.0);
            caches.rep_end = fresh.end_mark(pool);
            caches.last_block = fresh.0;
            caches.total_size += DEFAULT_REP_SIZE;
            last = fresh;
        }

        let entry = Entry(caches.rep_end);
        let free_len = last.free_len(pool);
        pool.write_u8(entry.0, rep::make_flags(master, same_as_base, fptag.is_some(), kind));
        entry.set_value(pool, value);
        entry.set_attrib(pool, attrib);
        if let Some(fp) = fptag {
            entry.set_fptag(pool, fp);
        }
        let arc_off = if fptag.is_some() { 25 } else { 9 };
        pool.write_u8(ShortPtr(entry.0 .0 + arc_off), arc.len() as u8);
        pool.write_bytes(ShortPtr(entry.0 .0 + arc_off + 1), arc);

        caches.rep_end = ShortPtr(entry.0 .0 + entry_len);
        pool.write_u8(caches.rep_end, END_MARK);
        last.set_free_len(pool, free_len - entry_len);
        caches.next_raw_index += if kind == SourceKind::Gap { value } else { 1 };
        caches.total_size += entry_len;
        self.caches.set(Some(caches));
        entry
    }

    // -----------------------------------------------------------------
    // Base handling
    // -----------------------------------------------------------------

    /// Node for the base layer, inheriting identity facts from `self`.
    pub fn base_node(&self, repo: &Repository) -> Option<Source> {
        let base = self.base_rep(repo.pool());
        if base.is_null() {
            return None;
        }
        let kind = match self.kind {
            SourceKind::VolatileDirectory => SourceKind::EvaluatorDirectory,
            SourceKind::VolatileROEDirectory => SourceKind::EvaluatorROEDirectory,
            _ => SourceKind::ImmutableDirectory,
        };
        let mut node = Source::for_rep(kind, base);
        node.longid = self.longid;
        node.pseudo_inode = self.pseudo_inode;
        node.ac = self.ac.clone();
        node.master = self.master;
        if kind == SourceKind::ImmutableDirectory {
            node.fptag = RepBlock(base).fptag(repo.pool());
        }
        Some(node)
    }

    /// The base layer as a first-class result (requires read access).
    pub fn get_base(&self, repo: &Repository, who: Option<&Identity>) -> Result<Source> {
        if !matches!(
            self.kind,
            SourceKind::MutableDirectory | SourceKind::ImmutableDirectory
        ) {
            return Err(RepositoryError::Inappropriate);
        }
        if !repo.access().check(who, AccessClass::Read, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }
        self.base_node(repo).ok_or(RepositoryError::NotFound)
    }

    // -----------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------

    /// Looks `arc` up in this directory, descending the base chain.
    pub fn lookup(
        &self,
        repo: &Repository,
        arc: &str,
        who: Option<&Identity>,
    ) -> Result<Source> {
        self.lookup_with_offset(repo, arc, who, 0)
    }

    fn lookup_with_offset(
        &self,
        repo: &Repository,
        arc: &str,
        who: Option<&Identity>,
        mut index_offset: u32,
    ) -> Result<Source> {
        let pool = repo.pool();
        if self.kind.is_evaluator() {
            return crate::evaluator::lookup(repo, self, arc);
        }
        if !self.kind.is_local_directory() {
            return Err(RepositoryError::NotADirectory);
        }
        if !repo.access().check(who, AccessClass::Search, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }

        // Walk down the base chain (iterative to keep the stack flat).
        let mut cur = self.clone();
        let (entry, raw_index) = loop {
            if let Some(found) = cur.find_arc(pool, arc.as_bytes(), true, false) {
                break found;
            }
            match cur.base_node(repo) {
                None => return Err(RepositoryError::NotFound),
                Some(base) => {
                    if base.kind.is_evaluator() {
                        debug_assert_eq!(index_offset, 0);
                        return crate::evaluator::lookup(repo, &base, arc);
                    }
                    if cur.kind == SourceKind::ImmutableDirectory {
                        index_offset += 2 * (cur.next_raw_index(pool) - 1);
                    }
                    cur = base;
                }
            }
        };
        if entry.kind(pool) == SourceKind::Deleted {
            return Err(RepositoryError::NotFound);
        }

        let index = if cur.kind == SourceKind::ImmutableDirectory {
            index_offset + 2 * raw_index
        } else {
            debug_assert_eq!(index_offset, 0);
            2 * raw_index - 1
        };
        let mut result = child_from_entry(repo, &cur, entry, index)?;

        if entry.same_as_base(pool) {
            // Borrow the pre-rename longid and pseudo-inode from the base
            // so the entry keeps one stable handle across copy-on-write.
            debug_assert!(cur.kind != SourceKind::ImmutableDirectory);
            if let Some(base) = self.base_node(repo) {
                if let Ok(base_result) = base.lookup(repo, arc, None) {
                    result.longid = base_result.longid;
                    if let Some((_, base_index)) = base_result.longid.parent() {
                        result.pseudo_inode = self.index_to_pseudo_inode(base_index);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Looks up the entry with directory index `index`, returning the node
    /// and the arc it is bound under.
    pub fn lookup_index(&self, repo: &Repository, index: u32) -> Result<(Source, String)> {
        self.lookup_index_depth(repo, index, 0)
    }

    pub(crate) fn lookup_index_depth(
        &self,
        repo: &Repository,
        index: u32,
        depth: usize,
    ) -> Result<(Source, String)> {
        let pool = repo.pool();
        if depth > MAX_FOLLOW_DEPTH {
            log::warn!("forwarding chain deeper than {MAX_FOLLOW_DEPTH}; giving up");
            return Err(RepositoryError::NotFound);
        }
        if self.kind.is_evaluator() {
            return crate::evaluator::lookup_index(repo, self, index);
        }
        if !self.kind.is_local_directory() {
            return Err(RepositoryError::NotADirectory);
        }

        let mut shadowed: Option<(LongId, u32)> = None;
        let entry;
        let owner: Source;
        if self.kind == SourceKind::ImmutableDirectory {
            // Immutable directories have only even indices.
            if index & 1 != 0 {
                return Err(RepositoryError::NotFound);
            }
            let mut cur = self.clone();
            let mut index_offset = 0u32;
            entry = loop {
                if let Some(found) = cur.find_raw_index(pool, (index - index_offset) >> 1) {
                    break found;
                }
                index_offset += 2 * (cur.next_raw_index(pool) - 1);
                match cur.base_node(repo) {
                    None => return Err(RepositoryError::NotFound),
                    Some(base) => cur = base,
                }
            };
            owner = cur;
        } else if index & 1 != 0 {
            // Odd index: the own rep.
            match self.find_raw_index(pool, (index + 1) >> 1) {
                Some(found) => {
                    entry = found;
                    owner = self.clone();
                }
                None => return Err(RepositoryError::NotFound),
            }
        } else {
            // Even index: the base, unless a same-as-base entry shadows it.
            let base = self.base_node(repo).ok_or(RepositoryError::NotFound)?;
            let (base_result, arc) = base.lookup_index_depth(repo, index, depth + 1)?;
            match self.find_arc(pool, arc.as_bytes(), true, true) {
                Some((shadow, _)) if shadow.same_as_base(pool) => {
                    // Use the shadowing entry's content with the base's
                    // identity.
                    shadowed = Some((base_result.longid, base_result.pseudo_inode));
                    entry = shadow;
                    owner = self.clone();
                }
                _ => {
                    let mut result = base_result;
                    self.fix_leaf_pseudo_inode(&mut result, index);
                    return Ok((result, arc));
                }
            }
        }

        let arc = entry.arc_string(pool);
        let kind = entry.kind(pool);
        if matches!(kind, SourceKind::Deleted | SourceKind::Outdated) && entry.value(pool) != 0 {
            // Follow the forwarding pointer, keeping the old longid.
            let result_longid = self.longid.append(index);
            if result_longid.is_null() {
                return Err(RepositoryError::LongIdOverflow);
            }
            let forward = Forward(ShortPtr(entry.value(pool)));
            let target = forward.longid(pool);
            let mut result = repo
                .lookup_unlocked(&target, depth + 1)
                .ok_or(RepositoryError::NotFound)?;
            result.longid = result_longid;
            self.fix_leaf_pseudo_inode(&mut result, index);
            return Ok((result, arc));
        }
        if matches!(kind, SourceKind::Deleted | SourceKind::Outdated | SourceKind::Gap) {
            return Err(RepositoryError::NotFound);
        }

        let mut result = child_from_entry(repo, &owner, entry, index)?;
        if let Some((longid, pseudo_inode)) = shadowed {
            result.longid = longid;
            result.pseudo_inode = pseudo_inode;
        }
        Ok((result, arc))
    }

    fn fix_leaf_pseudo_inode(&self, result: &mut Source, index: u32) {
        if result.kind.is_file()
            && !LongId::ROOT.is_ancestor_of(&self.longid)
            && self.kind != SourceKind::VolatileROEDirectory
        {
            result.pseudo_inode = self.index_to_pseudo_inode(index);
        }
    }

    // -----------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------

    /// Lists this directory's visible entries in index order, shadowed
    /// base entries suppressed. The callback returns false to stop.
    ///
    /// `delta_only` restricts the listing to the layers above the most
    /// recent complete snapshot (used while snapshotting).
    pub fn list(
        &self,
        repo: &Repository,
        first_index: u32,
        callback: &mut dyn FnMut(&ListEntry) -> bool,
        who: Option<&Identity>,
        delta_only: bool,
        index_offset: u32,
    ) -> Result<()> {
        let pool = repo.pool();
        debug_assert_eq!(index_offset & 1, 0);
        if !repo.access().check(who, AccessClass::Read, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }
        if self.kind.is_evaluator() {
            let mut hidden = fnv::FnvHashSet::default();
            return crate::evaluator::list(repo, self, first_index, callback, &mut hidden);
        }

        let mut hidden: fnv::FnvHashSet<Vec<u8>> = fnv::FnvHashSet::default();
        let mut cur = self.clone();
        let mut index_offset = index_offset;
        loop {
            let mut index: u32 = if cur.kind == SourceKind::ImmutableDirectory {
                2
            } else {
                1
            };
            let mut block = cur.first_block();
            loop {
                for entry in block.entries(pool) {
                    let kind = entry.kind(pool);
                    let mut skip = match kind {
                        SourceKind::Deleted => !delta_only,
                        SourceKind::Outdated | SourceKind::Gap => true,
                        _ => false,
                    };

                    let arc = entry.arc(pool).to_vec();
                    if hidden.contains(&arc) {
                        skip = true;
                    } else if !matches!(kind, SourceKind::Outdated | SourceKind::Gap) {
                        hidden.insert(arc.clone());
                    }

                    // Resume support: skip entries before first_index.
                    if first_index != 0 {
                        let here = index + index_offset;
                        if index & 1 != 0 {
                            if first_index & 1 == 0 || first_index > here {
                                skip = true;
                            }
                        } else if first_index & 1 == 0 && first_index > here {
                            skip = true;
                        }
                    }

                    if !skip {
                        let filesid;
                        let pseudo_inode;
                        match kind {
                            SourceKind::MutableDirectory
                            | SourceKind::VolatileDirectory
                            | SourceKind::VolatileROEDirectory => {
                                filesid = NULL_SHORTID;
                                pseudo_inode = RepBlock(ShortPtr(entry.value(pool))).id(pool);
                            }
                            SourceKind::ImmutableFile | SourceKind::MutableFile => {
                                filesid = ShortId(entry.value(pool));
                                if self.kind == SourceKind::VolatileROEDirectory
                                    || LongId::ROOT.is_ancestor_of(&self.longid)
                                {
                                    pseudo_inode = filesid.0;
                                } else {
                                    pseudo_inode =
                                        self.index_to_pseudo_inode(index + index_offset);
                                }
                            }
                            _ => {
                                filesid = NULL_SHORTID;
                                pseudo_inode = self.index_to_pseudo_inode(index + index_offset);
                            }
                        }
                        let item = ListEntry {
                            kind,
                            arc: String::from_utf8_lossy(&arc).into_owned(),
                            index: index + index_offset,
                            pseudo_inode,
                            filesid,
                            master: entry.master(pool),
                        };
                        if !callback(&item) {
                            return Ok(());
                        }
                    }

                    index += 2 * entry.index_width(pool);
                }
                match block.link_kind(pool) {
                    LinkKind::More => block = RepBlock(block.link(pool)),
                    _ => break,
                }
            }

            let base_index_offset = if cur.kind == SourceKind::ImmutableDirectory {
                index_offset + ((cur.next_raw_index(pool) << 1) - 2)
            } else {
                debug_assert_eq!(index_offset, 0);
                0
            };

            // A delta listing of a changeable directory is its own rep
            // only; for an immutable one it runs down to the nearest
            // complete snapshot.
            if delta_only && self.kind != SourceKind::ImmutableDirectory {
                return Ok(());
            }

            match cur.base_node(repo) {
                None => return Ok(()),
                Some(base) => {
                    if base.kind.is_evaluator() {
                        let first = if first_index & 1 != 0 { 0 } else { first_index };
                        return crate::evaluator::list(repo, &base, first, callback, &mut hidden);
                    }
                    cur = base;
                    index_offset = base_index_offset;
                    if delta_only && !cur.shortid(pool).is_null() {
                        // Reached a complete snapshot; the delta ends here.
                        return Ok(());
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Measurement
    // -----------------------------------------------------------------

    /// Counts entries and bytes across the rep and its base chain.
    pub fn measure(&self, repo: &Repository) -> Result<DirectoryStats> {
        if !self.kind.is_local_directory() {
            return Err(RepositoryError::Inappropriate);
        }
        let pool = repo.pool();
        let mut stats = DirectoryStats::default();
        let mut cur = self.clone();
        loop {
            let mut block = cur.first_block();
            loop {
                for entry in block.entries(pool) {
                    stats.total_count += 1;
                    stats.total_size += entry.size(pool);
                    if entry.kind(pool).is_visible() {
                        stats.used_count += 1;
                        stats.used_size += entry.size(pool);
                    }
                }
                match block.link_kind(pool) {
                    LinkKind::More => block = RepBlock(block.link(pool)),
                    _ => break,
                }
            }
            match cur.base_node(repo) {
                Some(base) if base.kind == SourceKind::ImmutableDirectory => {
                    stats.base_chain_length += 1;
                    cur = base;
                }
                _ => break,
            }
        }
        Ok(stats)
    }
}

/// One visible listing row.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub kind: SourceKind,
    pub arc: String,
    pub index: u32,
    pub pseudo_inode: u32,
    pub filesid: ShortId,
    pub master: bool,
}

/// Counters returned by [`Source::measure`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub base_chain_length: u32,
    pub used_count: u32,
    pub used_size: u32,
    pub total_count: u32,
    pub total_size: u32,
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

/// Allocates an empty rep block with an explicit pool kind (used for
/// continuation blocks, which reuse the first block's kind).
fn create_block_raw(pool: &MemPool, kind: BlockKind, size: u32) -> RepBlock {
    let source_kind = match kind {
        BlockKind::DirImmutable => SourceKind::ImmutableDirectory,
        BlockKind::DirAppendable => SourceKind::AppendableDirectory,
        _ => SourceKind::MutableDirectory,
    };
    RepBlock::create(pool, source_kind, size)
}

/// Walks the whole chain computing [`RepCaches`].
fn fill_caches(pool: &MemPool, first: RepBlock) -> RepCaches {
    let mut block = first;
    let mut raw_index = 1u32;
    let mut total_size = 0u32;
    loop {
        for entry in block.entries(pool) {
            raw_index += entry.index_width(pool);
        }
        total_size += block.size(pool);
        match block.link_kind(pool) {
            LinkKind::More => block = RepBlock(block.link(pool)),
            _ => break,
        }
    }
    let base = if block.link_kind(pool) == LinkKind::Base {
        block.link(pool)
    } else {
        ShortPtr::NULL
    };
    RepCaches {
        rep_end: block.end_mark(pool),
        next_raw_index: raw_index,
        base,
        last_block: block.0,
        total_size,
    }
}

/// Resolves owner/group/mode facts for a child with attribute location
/// `attribs`, inheriting from the parent where the child is silent.
pub fn resolve_ac(repo: &Repository, attribs: AttribsLoc, parent_ac: &NodeAc) -> NodeAc {
    let pool = repo.pool();
    let head = repo.attrib_head(attribs);
    if head.is_null() {
        return NodeAc {
            owners: parent_ac.owners.clone(),
            groups: parent_ac.groups.clone(),
            // setuid and setgid bits are not inherited.
            mode: parent_ac.mode & 0o777,
        };
    }
    let owners = attrib::get_attrib_values(pool, head, "#owner");
    let groups = attrib::get_attrib_values(pool, head, "#group");
    let mode = attrib::get_attrib(pool, head, "#mode")
        .map(|m| crate::access::parse_mode_bits(&m))
        .unwrap_or(parent_ac.mode & 0o777);
    NodeAc {
        owners: if owners.is_empty() {
            parent_ac.owners.clone()
        } else {
            owners
        },
        groups: if groups.is_empty() {
            parent_ac.groups.clone()
        } else {
            groups
        },
        mode,
    }
}

/// Builds the result node for `entry` at directory index `index` of `dir`.
///
/// Fails with `LongIdOverflow` when the child's name would not fit, and
/// `NotFound` for entry kinds that have no node (deleted, outdated, gap).
pub fn child_from_entry(
    repo: &Repository,
    dir: &Source,
    entry: Entry,
    index: u32,
) -> Result<Source> {
    let pool = repo.pool();
    let kind = entry.kind(pool);
    let mut node = match kind {
        SourceKind::ImmutableFile | SourceKind::MutableFile => {
            let mut node = Source::for_leaf(kind, ShortId(entry.value(pool)));
            node.fptag = entry.fptag(pool);
            node.attribs = AttribsLoc::Pool(entry.attrib_cell());
            if dir.kind == SourceKind::VolatileROEDirectory {
                node.longid = LongId::from_shortid(node.sid, Some(&node.fptag));
                node.pseudo_inode = node.sid.0;
            } else if LongId::ROOT.is_ancestor_of(&dir.longid) {
                node.longid = dir.longid.append(index);
                node.pseudo_inode = node.sid.0;
            } else {
                node.longid = dir.longid.append(index);
                node.pseudo_inode = dir.index_to_pseudo_inode(index);
            }
            node
        }
        SourceKind::Ghost | SourceKind::Stub | SourceKind::Device => {
            let mut node = Source::for_leaf(kind, ShortId(entry.value(pool)));
            node.attribs = AttribsLoc::Pool(entry.attrib_cell());
            node.longid = dir.longid.append(index);
            node.pseudo_inode = dir.index_to_pseudo_inode(index);
            node
        }
        SourceKind::ImmutableDirectory | SourceKind::AppendableDirectory => {
            let rep = ShortPtr(entry.value(pool));
            let mut node = Source::for_rep(kind, rep);
            node.attribs = AttribsLoc::Pool(entry.attrib_cell());
            node.fptag = RepBlock(rep).fptag(pool);
            node.longid = dir.longid.append(index);
            node.pseudo_inode = dir.index_to_pseudo_inode(index);
            node
        }
        SourceKind::MutableDirectory
        | SourceKind::VolatileDirectory
        | SourceKind::VolatileROEDirectory => {
            let rep = ShortPtr(entry.value(pool));
            let mut node = Source::for_rep(kind, rep);
            node.attribs = AttribsLoc::Pool(entry.attrib_cell());
            node.fptag = RepBlock(rep).fptag(pool);
            node.longid = dir.longid.append(index);
            node.pseudo_inode = RepBlock(rep).id(pool);
            node.sidref = dir.sidref.clone();
            node
        }
        SourceKind::EvaluatorDirectory | SourceKind::EvaluatorROEDirectory => {
            let rep = ShortPtr(entry.value(pool));
            let mut node = Source::for_rep(kind, rep);
            node.attribs = AttribsLoc::Pool(entry.attrib_cell());
            node.longid = dir.longid.append(index);
            node.pseudo_inode = dir.index_to_pseudo_inode(index);
            node
        }
        SourceKind::Deleted | SourceKind::Outdated | SourceKind::Gap | SourceKind::Unused => {
            return Err(RepositoryError::NotFound)
        }
    };

    if node.longid.is_null() {
        return Err(RepositoryError::LongIdOverflow);
    }

    // Only appendable and mutable directories support per-entry
    // attributes; elsewhere the cell stays unused and children inherit.
    if !matches!(
        dir.kind,
        SourceKind::AppendableDirectory | SourceKind::MutableDirectory
    ) {
        node.attribs = AttribsLoc::None;
    }

    node.master = match dir.kind {
        // Appendable entries carry their own master flag.
        SourceKind::AppendableDirectory => entry.master(pool),
        // Immutable children inherit the parent's flag.
        SourceKind::ImmutableDirectory => dir.master,
        // Non-replicated trees are always master.
        _ => true,
    };

    node.ac = resolve_ac(repo, node.attribs, &dir.ac);
    Ok(node)
}
