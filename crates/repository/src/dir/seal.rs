//! Crossing the mutability frontier.
//!
//! Downward: `make_index_mutable` and `copy_index_to_mutable` bring
//! immutable base content into a mutable or volatile rep (copy-on-write).
//! Upward: `make_entry_immutable` seals a mutable file (deduplicating by
//! content fingerprint below a size threshold), and
//! `copy_mutable_to_immutable` projects a whole mutable directory into a
//! fresh immutable rep, reusing the cached snapshot when nothing changed.
//! `collapse_base` flattens a long base chain into one layer.

use crate::access::{AccessClass, Identity};
use crate::error::{RepositoryError, Result};
use crate::fingerprint::{Fingerprint, CONTENTS_PREFIX, EXECUTABLE_PREFIX};
use crate::pool::ShortPtr;
use crate::repository::Repository;
use crate::types::{ShortId, SourceKind, NULL_SHORTID};

use super::rep::{Entry, LinkKind, RepBlock, DEFAULT_REP_SIZE, END_MARK, ENTRY_MIN};
use super::{child_from_entry, Source};

impl Source {
    // -----------------------------------------------------------------
    // Copy-on-write in
    // -----------------------------------------------------------------

    /// Makes the entry at `index` mutable.
    ///
    /// Immutable files get a fresh shortid (`sid`, or a copy of up to
    /// `copy_max` bytes of the original when `sid` is null); immutable or
    /// evaluator directories get a fresh changeable rep based on the
    /// original.
    pub fn make_index_mutable(
        &self,
        repo: &Repository,
        index: u32,
        mut sid: ShortId,
        copy_max: u64,
        who: Option<&Identity>,
    ) -> Result<Source> {
        let pool = repo.pool();
        if !matches!(
            self.kind,
            SourceKind::MutableDirectory
                | SourceKind::VolatileDirectory
                | SourceKind::VolatileROEDirectory
        ) {
            return Err(RepositoryError::Inappropriate);
        }
        if !repo.access().check(who, AccessClass::Write, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }

        let mut entry: Option<Entry> = None;
        let old_kind;
        let mut old_value = 0u32;
        let old_master;
        let mut old_sid = NULL_SHORTID;
        let arc: Vec<u8>;

        if index & 1 != 0 {
            // Odd index: the own rep.
            let found = self
                .find_raw_index(pool, (index + 1) >> 1)
                .ok_or(RepositoryError::NotFound)?;
            old_kind = found.kind(pool);
            old_value = found.value(pool);
            old_sid = ShortId(old_value);
            old_master = found.master(pool);
            arc = found.arc(pool).to_vec();
            entry = Some(found);
        } else {
            // Even index: resolve in the base first.
            let base = self.base_node(repo).ok_or(RepositoryError::NotFound)?;
            let (base_result, base_arc) = base.lookup_index(repo, index)?;
            debug_assert!(!matches!(
                base_result.kind,
                SourceKind::MutableDirectory
                    | SourceKind::VolatileDirectory
                    | SourceKind::VolatileROEDirectory
            ));
            let mut kind = base_result.kind;
            let mut master = base_result.master;
            if kind == SourceKind::ImmutableFile {
                old_sid = base_result.sid;
            } else {
                old_value = base_result.rep.0;
            }
            arc = base_arc.into_bytes();
            // A same-as-base entry in the own rep supersedes the base.
            if let Some((shadow, _)) = self.find_arc(pool, &arc, true, true) {
                if shadow.same_as_base(pool) {
                    kind = shadow.kind(pool);
                    old_value = shadow.value(pool);
                    old_sid = ShortId(old_value);
                    master = shadow.master(pool);
                    entry = Some(shadow);
                }
            }
            old_kind = kind;
            old_master = master;
        }

        if !matches!(
            old_kind,
            SourceKind::ImmutableFile
                | SourceKind::ImmutableDirectory
                | SourceKind::EvaluatorDirectory
                | SourceKind::EvaluatorROEDirectory
        ) {
            return Err(RepositoryError::Inappropriate);
        }

        if old_kind == SourceKind::ImmutableFile && sid.is_null() {
            // Assign the copy now, before logging, so replay reuses the
            // same shortid and copies nothing.
            if old_sid.is_null() {
                return Err(RepositoryError::InvalidArgs);
            }
            sid = repo
                .store()
                .copy_sid(old_sid, copy_max)
                .map_err(|e| {
                    log::error!("copy-on-write of {old_sid} failed: {e}");
                    RepositoryError::OutOfSpace
                })?;
        }

        if repo.should_log(self.kind) {
            let record = format!("(makm {} {} {})\n", self.longid, index, sid);
            repo.journal().start();
            repo.journal().put(&record);
            repo.commit();
        }

        let new_kind;
        let new_value;
        if old_kind == SourceKind::ImmutableFile {
            new_kind = SourceKind::MutableFile;
            new_value = sid.0;
        } else {
            new_kind = self.kind;
            let block = RepBlock::create(pool, new_kind, DEFAULT_REP_SIZE);
            block.set_link(pool, LinkKind::Base, ShortPtr(old_value));
            block.set_timestamp(pool, self.timestamp(pool));
            block.set_id(pool, self.index_to_pseudo_inode(index));
            new_value = block.0 .0;
        }
        let entry = match entry {
            None => self.append_entry(
                pool,
                old_master,
                true,
                new_kind,
                new_value,
                ShortPtr::NULL,
                if new_kind == SourceKind::MutableFile {
                    Some(&Fingerprint::NULL)
                } else {
                    None
                },
                &arc,
            ),
            Some(entry) => {
                entry.set_kind(pool, new_kind);
                entry.set_value(pool, new_value);
                entry
            }
        };
        self.invalidate_snapshot(repo);

        if let Some(sidref) = &self.sidref {
            debug_assert!(old_kind != SourceKind::ImmutableFile || sidref.count(old_sid) == 0);
            if new_kind == SourceKind::MutableFile {
                sidref.increment(ShortId(new_value));
            }
        }

        let node = child_from_entry(repo, self, entry, index)?;
        if node.longid.is_null() {
            return Err(RepositoryError::LongIdOverflow);
        }
        Ok(node)
    }

    /// Copies the base entry at even `index` into the mutable rep as a
    /// same-as-base entry, so it can carry attributes of its own.
    pub fn copy_index_to_mutable(
        &self,
        repo: &Repository,
        index: u32,
        who: Option<&Identity>,
    ) -> Result<Source> {
        let pool = repo.pool();
        if self.kind != SourceKind::MutableDirectory {
            return Err(RepositoryError::Inappropriate);
        }
        if index & 1 != 0 {
            // Odd index: already in the mutable rep.
            return Err(RepositoryError::Inappropriate);
        }
        if !repo.access().check(who, AccessClass::Write, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }

        let base = self.base_node(repo).ok_or(RepositoryError::NotFound)?;
        let (base_result, arc) = base.lookup_index(repo, index)?;
        debug_assert!(matches!(
            base_result.kind,
            SourceKind::ImmutableDirectory | SourceKind::ImmutableFile
        ));
        let old_kind = base_result.kind;
        let (old_value, old_fptag) = if old_kind == SourceKind::ImmutableFile {
            (base_result.sid.0, Some(base_result.fptag))
        } else {
            (base_result.rep.0, None)
        };

        if self.find_arc(pool, arc.as_bytes(), true, false).is_some() {
            // The name has been replaced or deleted in the mutable part.
            return Err(RepositoryError::Inappropriate);
        }

        if repo.should_log(self.kind) {
            let record = format!("(copy2m {} {})\n", self.longid, index);
            repo.journal().start();
            repo.journal().put(&record);
            repo.commit();
        }

        let entry = self.append_entry(
            pool,
            base_result.master,
            true,
            old_kind,
            old_value,
            ShortPtr::NULL,
            old_fptag.as_ref(),
            arc.as_bytes(),
        );
        self.invalidate_snapshot(repo);
        child_from_entry(repo, self, entry, index)
    }

    // -----------------------------------------------------------------
    // Sealing out
    // -----------------------------------------------------------------

    /// Applies a `maki` change: flips the entry at odd `index` from
    /// mutableFile to immutableFile.
    pub fn make_index_immutable(
        &self,
        repo: &Repository,
        index: u32,
        fptag: Option<&Fingerprint>,
        newsid: ShortId,
    ) -> Result<()> {
        let entry = self
            .find_raw_index(repo.pool(), (index + 1) >> 1)
            .ok_or(RepositoryError::NotFound)?;
        self.make_entry_immutable_raw(repo, entry, index, fptag, newsid);
        Ok(())
    }

    /// The in-memory half of sealing one entry, with its journal record.
    pub(crate) fn make_entry_immutable_raw(
        &self,
        repo: &Repository,
        entry: Entry,
        index: u32,
        fptag: Option<&Fingerprint>,
        newsid: ShortId,
    ) {
        let pool = repo.pool();
        debug_assert!(matches!(
            self.kind,
            SourceKind::MutableDirectory
                | SourceKind::VolatileDirectory
                | SourceKind::VolatileROEDirectory
        ));
        debug_assert!(index & 1 != 0);
        debug_assert_eq!(entry.kind(pool), SourceKind::MutableFile);

        // Sealing a file in a mutable directory without a fingerprint
        // would be unreplayable; ignore the request (even from a journal).
        if fptag.is_none() && self.kind == SourceKind::MutableDirectory {
            return;
        }

        if repo.should_log(self.kind) {
            debug_assert!(!self.longid.is_null());
            let mut record = format!("(maki {} {}", self.longid, index);
            if let Some(fp) = fptag {
                record.push(' ');
                record.push_str(&fp.to_journal());
            }
            if !newsid.is_null() {
                record.push(' ');
                record.push_str(&newsid.to_string());
            }
            record.push_str(")\n");
            repo.journal().start();
            repo.journal().put(&record);
            repo.commit();
        }

        if let Some(sidref) = &self.sidref {
            sidref.decrement(ShortId(entry.value(pool)), false);
        }

        entry.set_kind(pool, SourceKind::ImmutableFile);
        if let Some(fp) = fptag {
            entry.set_fptag(pool, fp);
        }
        if !newsid.is_null() {
            entry.set_value(pool, newsid.0);
        }
        if let Some(fp) = fptag {
            repo.fpindex().set_file(*fp, ShortId(entry.value(pool)));
        }
        self.invalidate_snapshot(repo);
    }

    /// Seals one mutable-file entry, with content fingerprinting and
    /// deduplication for files below `fp_threshold` bytes.
    ///
    /// `snapshot_fptag` is supplied while snapshotting, so files that are
    /// not fingerprinted by content derive their tag from the enclosing
    /// snapshot and their name.
    pub(crate) fn seal_entry(
        &self,
        repo: &Repository,
        entry: Entry,
        index: u32,
        fp_threshold: u64,
        snapshot_fptag: Option<&Fingerprint>,
    ) {
        let pool = repo.pool();
        debug_assert_eq!(entry.kind(pool), SourceKind::MutableFile);
        let filesid = ShortId(entry.value(pool));

        if !repo.logging() {
            // Replaying: the journal carries explicit maki records, so
            // getting here means an old log sealed files implicitly while
            // snapshotting. Derive the fingerprint the same way.
            let fptag = snapshot_fptag
                .expect("implicit seal happens only while snapshotting")
                .extend(b"/")
                .extend(entry.arc(pool));
            self.make_entry_immutable_raw(repo, entry, index, Some(&fptag), NULL_SHORTID);
            return;
        }

        let store = repo.store();
        let size = match store.size(filesid) {
            Ok(size) => size,
            Err(e) => {
                log::warn!("missing shortid {filesid} while sealing: {e}");
                0
            }
        };

        let mut fptag: Option<Fingerprint> = None;
        let mut dupsid = NULL_SHORTID;
        if size < fp_threshold {
            let prefix = match store.is_executable(filesid) {
                Ok(true) => EXECUTABLE_PREFIX,
                _ => CONTENTS_PREFIX,
            };
            match store.open_read(filesid) {
                Ok(mut file) => match Fingerprint::of_file_contents(prefix, &mut file) {
                    Ok(fp) => {
                        dupsid = repo.fpindex().get(&fp);
                        fptag = Some(fp);
                    }
                    Err(e) => log::warn!("cannot fingerprint {filesid}: {e}"),
                },
                Err(e) => log::warn!("cannot open {filesid} for fingerprinting: {e}"),
            }
        }

        if dupsid.is_null() {
            let links = self
                .sidref
                .as_ref()
                .map(|sidref| sidref.count(filesid))
                .unwrap_or(1);
            if links > 1 {
                // Other hard links stay mutable; seal a private copy.
                match store.copy_sid(filesid, u64::MAX) {
                    Ok(copy) => {
                        if let Err(e) = store.seal(copy) {
                            log::warn!("cannot seal copied shortid {copy}: {e}");
                        }
                        dupsid = copy;
                    }
                    Err(e) => {
                        log::error!("cannot copy multiply-linked shortid {filesid}: {e}");
                        return;
                    }
                }
            } else if let Err(e) = store.seal(filesid) {
                log::warn!("cannot seal shortid {filesid}: {e}");
            }
            let fptag = fptag.unwrap_or_else(|| match snapshot_fptag {
                // Snapshotting: name-derived tags replay deterministically.
                Some(snap) => snap.extend(b"/").extend(entry.arc(pool)),
                // Otherwise the parent is not immutable yet, so tags
                // cannot be name-based; a logged unique id works as well.
                None => repo.unique_fptag(),
            });
            self.make_entry_immutable_raw(repo, entry, index, Some(&fptag), dupsid);
        } else {
            // A sealed file with identical content exists; point at it
            // and drop the new bytes once the record is committed.
            self.make_entry_immutable_raw(repo, entry, index, fptag.as_ref(), dupsid);
            let refs_left = self
                .sidref
                .as_ref()
                .map(|sidref| sidref.count(filesid))
                .unwrap_or(0);
            if repo.journal().nesting() == 0 && refs_left == 0 {
                repo.unlink_now(filesid);
            }
        }
    }

    // -----------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------

    /// Projects this mutable directory into an immutable rep.
    ///
    /// Mutable children are projected recursively and mutable files are
    /// sealed first (emitting their maki records). Outdated entries and
    /// gaps are discarded; deleted entries survive only when a retained
    /// base leaves something to shadow. If nothing changed since the last
    /// projection, the cached snapshot is returned instead of a new rep.
    /// Subtrees whose names would overflow the longid envelope are
    /// dropped with a warning.
    pub fn copy_mutable_to_immutable(&self, repo: &Repository, fptag: &Fingerprint) -> Source {
        let pool = repo.pool();
        let caches = self.caches(pool);

        if caches.next_raw_index == 1 && !caches.base.is_null() {
            // Nothing of our own: the base is the projection.
            return immutable_result(pool, caches.base);
        }

        let size = caches.total_size.max(super::rep::BLOCK_OVERHEAD);
        let dest = RepBlock::create(pool, SourceKind::ImmutableDirectory, size);
        if !caches.base.is_null() {
            dest.set_link(pool, LinkKind::Base, caches.base);
        }
        dest.set_timestamp(pool, self.timestamp(pool));
        dest.set_fptag(pool, fptag);

        let mut out = ShortPtr(dest.0 .0 + super::rep::HEADER_SIZE);
        let mut block = RepBlock(self.rep);
        let mut ri = 1u32;
        loop {
            for entry in block.entries(pool) {
                let mut skip = false;
                let mut patch_kind: Option<SourceKind> = None;
                let mut patch_value: Option<u32> = None;
                let mut register_fp = false;
                match entry.kind(pool) {
                    SourceKind::MutableDirectory => {
                        let child_longid = if self.longid.is_null() {
                            crate::longid::LongId::NULL
                        } else {
                            self.longid.append((ri << 1) - 1)
                        };
                        if !child_longid.is_null() || repo.log_version() < 4 {
                            debug_assert!(!repo.logging() || !child_longid.is_null());
                            let mut child = Source::for_rep(
                                SourceKind::MutableDirectory,
                                ShortPtr(entry.value(pool)),
                            );
                            child.longid = child_longid;
                            child.sidref = self.sidref.clone();
                            let child_old_snapshot = RepBlock(child.rep).snapshot(pool);
                            let child_fptag = fptag.extend(b"/").extend(entry.arc(pool));
                            let sealed = child.copy_mutable_to_immutable(repo, &child_fptag);
                            patch_kind = Some(SourceKind::ImmutableDirectory);
                            patch_value = Some(sealed.rep.0);
                            if child_old_snapshot != RepBlock(child.rep).snapshot(pool) {
                                // The child made a new snapshot; ours
                                // cannot be reused either.
                                RepBlock(self.rep).set_snapshot(pool, ShortPtr::NULL);
                            }
                        } else {
                            log::warn!(
                                "dropping deeply nested directory \"{}\" in {} from new snapshot",
                                entry.arc_string(pool),
                                self.longid
                            );
                            skip = true;
                        }
                    }
                    SourceKind::MutableFile => {
                        // Seal in place first; emits maki before the
                        // caller's insi record.
                        self.seal_entry(repo, entry, (ri << 1) - 1, 0, Some(fptag));
                        debug_assert_eq!(entry.kind(pool), SourceKind::ImmutableFile);
                        debug_assert!(RepBlock(self.rep).snapshot(pool).is_null());
                        register_fp = true;
                    }
                    SourceKind::ImmutableFile => {
                        // One more chance to notice a duplicate.
                        let dup = repo.fpindex().get(&entry.fptag(pool));
                        if !dup.is_null() {
                            entry.set_value(pool, dup.0);
                        }
                        if RepBlock(self.rep).snapshot(pool).is_null() {
                            register_fp = true;
                        }
                    }
                    SourceKind::ImmutableDirectory => {}
                    SourceKind::Outdated => skip = true,
                    SourceKind::Gap => {
                        skip = true;
                        ri += entry.value(pool) - 1;
                    }
                    SourceKind::Deleted => {
                        if repo.log_version() >= 2 && caches.base.is_null() {
                            skip = true;
                        } else {
                            patch_value = Some(0); // drop any forward
                        }
                    }
                    other => {
                        log::error!("unexpected {other:?} entry in a mutable directory");
                        skip = true;
                    }
                }
                if !skip {
                    let entry_size = entry.size(pool) as usize;
                    let bytes = pool.bytes(entry.0, entry_size).to_vec();
                    let copied = Entry(out);
                    pool.write_bytes(out, &bytes);
                    if let Some(kind) = patch_kind {
                        copied.set_kind(pool, kind);
                    }
                    if let Some(value) = patch_value {
                        copied.set_value(pool, value);
                    }
                    copied.set_attrib(pool, ShortPtr::NULL);
                    // Clear the same-as-base flag without moving the arc.
                    let flags = pool.read_u8(out) & !super::rep::EntryFlags::SAME_AS_BASE.bits();
                    pool.write_u8(out, flags);
                    if register_fp {
                        repo.fpindex()
                            .set_file(copied.fptag(pool), ShortId(copied.value(pool)));
                    }
                    out = ShortPtr(out.0 + entry_size as u32);
                }
                ri += 1;
            }
            match block.link_kind(pool) {
                LinkKind::More => block = RepBlock(block.link(pool)),
                _ => break,
            }
        }

        let snapshot = RepBlock(self.rep).snapshot(pool);
        if !snapshot.is_null() {
            // Identical to the previous projection: discard this one.
            pool.free(dest.0, size, None);
            return immutable_result(pool, snapshot);
        }

        // Complete the new rep and remember it as the latest projection.
        pool.write_u8(out, END_MARK);
        let used = out.0 - dest.0 .0;
        dest.set_free_len(pool, size - used - 1 - 4);
        let dirsid = repo.dirsids().assign(dest.0);
        dest.set_id(pool, dirsid.0);
        repo.fpindex().set_dir(*fptag, dest.0, dirsid);
        if self.kind == SourceKind::MutableDirectory {
            RepBlock(self.rep).set_snapshot(pool, dest.0);
        }
        immutable_result(pool, dest.0)
    }

    // -----------------------------------------------------------------
    // Base collapsing
    // -----------------------------------------------------------------

    /// Replaces this directory's base chain with a single flattened
    /// layer. Identity (fingerprint, shortid, timestamp) and the visible
    /// listing of the base are preserved.
    pub fn collapse_base(&self, repo: &Repository, who: Option<&Identity>) -> Result<()> {
        let pool = repo.pool();
        if !matches!(
            self.kind,
            SourceKind::ImmutableDirectory | SourceKind::MutableDirectory
        ) {
            return Err(RepositoryError::Inappropriate);
        }
        if !repo.access().check(who, AccessClass::Ownership, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }
        let base_rep = self.base_rep(pool);
        if base_rep.is_null() {
            return Ok(());
        }
        let base = Source::for_rep(SourceKind::ImmutableDirectory, base_rep);
        if base.base_rep(pool).is_null() {
            // Already flat; collapsing would only burn memory.
            return Ok(());
        }

        let collapsed = base.collapse(repo);
        let caches = self.caches(pool);
        RepBlock(caches.last_block).set_link(pool, LinkKind::Base, collapsed.rep);
        self.resync();

        if repo.should_log(self.kind) {
            let record = format!("(colb {})\n", self.longid);
            repo.journal().start();
            repo.journal().put(&record);
            repo.commit();
        }
        Ok(())
    }

    /// Builds the flat single-layer equivalent of this immutable
    /// directory, preserving the combined index numbering via gaps.
    fn collapse(&self, repo: &Repository) -> Source {
        let pool = repo.pool();
        debug_assert_eq!(self.kind, SourceKind::ImmutableDirectory);

        // Gather the surviving entries layer by layer, top first.
        let mut seen: fnv::FnvHashSet<Vec<u8>> = fnv::FnvHashSet::default();
        let mut kept: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut layer = self.clone();
        let mut index_offset = 0u32;
        loop {
            let mut block = RepBlock(layer.rep);
            let mut ri = 1u32;
            loop {
                for entry in block.entries(pool) {
                    let kind = entry.kind(pool);
                    let arc = entry.arc(pool).to_vec();
                    let shadowed = seen.contains(&arc);
                    match kind {
                        SourceKind::Outdated | SourceKind::Gap => {}
                        SourceKind::Deleted => {
                            // With no base left there is nothing to
                            // shadow, but the arc still hides base
                            // entries below this layer.
                            seen.insert(arc);
                        }
                        _ => {
                            if !shadowed {
                                let index = index_offset + 2 * ri;
                                let mut bytes =
                                    pool.bytes(entry.0, entry.size(pool) as usize).to_vec();
                                bytes[0] &= !super::rep::EntryFlags::SAME_AS_BASE.bits();
                                kept.push((index, bytes));
                            }
                            seen.insert(arc);
                        }
                    }
                    ri += entry.index_width(pool);
                }
                match block.link_kind(pool) {
                    LinkKind::More => block = RepBlock(block.link(pool)),
                    _ => break,
                }
            }
            index_offset += 2 * (layer.next_raw_index(pool) - 1);
            match layer.base_node(repo) {
                Some(base) => layer = base,
                None => break,
            }
        }
        kept.sort_by_key(|(index, _)| *index);

        // Lay the entries out at their original indices, padding holes
        // with gap entries.
        let entry_bytes: u32 = kept.iter().map(|(_, b)| b.len() as u32).sum();
        let size = super::rep::BLOCK_OVERHEAD + entry_bytes + (kept.len() as u32 + 1) * ENTRY_MIN;
        let dest = RepBlock::create(pool, SourceKind::ImmutableDirectory, size);
        let src = RepBlock(self.rep);
        dest.set_timestamp(pool, src.timestamp(pool));
        dest.set_id(pool, src.id(pool));
        let fptag = src.fptag(pool);
        dest.set_fptag(pool, &fptag);

        let mut out = ShortPtr(dest.0 .0 + super::rep::HEADER_SIZE);
        let mut next_raw = 1u32;
        for (index, bytes) in &kept {
            let raw = index / 2;
            if raw > next_raw {
                // Gap entry covering the skipped raw indices.
                let gap = Entry(out);
                pool.write_u8(out, (SourceKind::Gap as u8) << 4);
                gap.set_value(pool, raw - next_raw);
                gap.set_attrib(pool, ShortPtr::NULL);
                pool.write_u8(ShortPtr(out.0 + 9), 0);
                out = ShortPtr(out.0 + ENTRY_MIN);
            }
            pool.write_bytes(out, bytes);
            Entry(out).set_attrib(pool, ShortPtr::NULL);
            out = ShortPtr(out.0 + bytes.len() as u32);
            next_raw = raw + 1;
        }
        pool.write_u8(out, END_MARK);
        let used = out.0 - dest.0 .0;
        dest.set_free_len(pool, size - used - 1 - 4);

        // The flattened rep answers for the same directory shortid.
        let sid = ShortId(src.id(pool));
        if !sid.is_null() {
            repo.dirsids().set(sid, dest.0);
        }
        repo.fpindex().set_dir(fptag, dest.0, sid);
        Source::for_rep(SourceKind::ImmutableDirectory, dest.0)
    }
}

/// Node handle for an immutable rep, carrying its shortid-derived longid
/// and fingerprint so callers can link or journal it directly.
fn immutable_result(pool: &crate::pool::MemPool, rep: ShortPtr) -> Source {
    let mut node = Source::for_rep(SourceKind::ImmutableDirectory, rep);
    let block = RepBlock(rep);
    node.fptag = block.fptag(pool);
    let sid = ShortId(block.id(pool));
    if !sid.is_null() {
        node.longid = crate::longid::LongId::from_shortid(sid, None);
        node.pseudo_inode = sid.0;
    }
    node.master = true;
    node
}
