//! Mutations on directory nodes: inserts, rename, delete, master flag,
//! timestamps, attribute writes.
//!
//! Every mutation follows the same shape: validate the variant and the
//! caller's access, pre-check longid overflow, apply the change to the
//! packed rep, append a journal record, and commit (volatile directories
//! are never journaled). Deferred side effects (unlinking a newly
//! unreferenced shortid) wait for the outermost transaction.

use crate::access::{AccessClass, Identity};
use crate::attrib::{self, AttribOp};
use crate::error::{RepositoryError, Result};
use crate::fingerprint::Fingerprint;
use crate::forward::Forward;
use crate::journal::quote;
use crate::longid::LongId;
use crate::pool::ShortPtr;
use crate::repository::Repository;
use crate::types::{now, DupeCheck, ShortId, SourceKind, Timestamp, MAX_ARC_LEN, NULL_SHORTID};

use super::rep::{LinkKind, RepBlock, DEFAULT_REP_SIZE};
use super::{child_from_entry, AttribsLoc, Source};

/// What `insert_common` hands back to the specific insert operation.
struct InsertPrep {
    /// User to record as `#owner` on the new entry, if any.
    set_owner: Option<String>,
    /// Shortid to unlink once the record commits.
    delsid: ShortId,
    /// Attribute chain inherited from a replaced stub/ghost.
    attribs: ShortPtr,
}

impl Source {
    /// Bumps the directory timestamp to at least `timestamp`, always
    /// moving it forward.
    fn bump_timestamp(&self, repo: &Repository, timestamp: Timestamp) {
        let pool = repo.pool();
        let block = RepBlock(self.rep);
        let current = block.timestamp(pool);
        if timestamp > current {
            block.set_timestamp(pool, timestamp);
        } else {
            block.set_timestamp(pool, current + 1);
        }
    }

    /// Clears the cached snapshot after any change to a mutable rep.
    pub(crate) fn invalidate_snapshot(&self, repo: &Repository) {
        if self.kind == SourceKind::MutableDirectory {
            RepBlock(self.rep).set_snapshot(repo.pool(), ShortPtr::NULL);
        }
    }

    /// Index the next inserted entry will occupy.
    pub fn next_insert_index(&self, repo: &Repository) -> u32 {
        2 * self.next_raw_index(repo.pool()) - 1
    }

    /// Pre-checks that the new entry's longid fits the envelope.
    ///
    /// Directories of kind volatileROE skip the check: their children get
    /// shortid-derived longids.
    fn check_new_longid(&self, index: u32) -> Result<LongId> {
        if self.kind == SourceKind::VolatileROEDirectory {
            return Ok(LongId::NULL);
        }
        let new_longid = self.longid.append(index);
        if new_longid.is_null() {
            return Err(RepositoryError::LongIdOverflow);
        }
        Ok(new_longid)
    }

    /// Shared first half of every insertion: access checks, replication
    /// agreement, dupe handling, owner inheritance.
    ///
    /// May modify the rep (outdating a replaced entry), so all error
    /// checking must come before the call.
    fn insert_common(
        &self,
        repo: &Repository,
        arc: &str,
        master: bool,
        new_kind: SourceKind,
        who: Option<&Identity>,
        chk: DupeCheck,
    ) -> Result<InsertPrep> {
        let pool = repo.pool();
        if arc.is_empty() {
            return Err(RepositoryError::NotFound); // matches Unix
        }
        if !repo.access().check(who, AccessClass::Write, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }

        let found = self.find_arc(pool, arc.as_bytes(), true, false);
        let mut prep = InsertPrep {
            set_owner: None,
            delsid: NULL_SHORTID,
            attribs: ShortPtr::NULL,
        };

        // Replication agreement for appendable directories (see the
        // safety table in the design notes): unsafe changes need the
        // agreement capability.
        if self.kind == SourceKind::AppendableDirectory {
            match found {
                Some((entry, _)) => {
                    if entry.master(pool) != master
                        && !repo.access().check(who, AccessClass::Agreement, &self.ac)
                    {
                        return Err(RepositoryError::NotMaster);
                    }
                    let old_kind = entry.kind(pool);
                    let safe = (master && old_kind == SourceKind::Stub)
                        || (master && new_kind == SourceKind::Ghost)
                        || (!master && new_kind == SourceKind::Stub)
                        || (!master && new_kind == SourceKind::Ghost);
                    if !safe && !repo.access().check(who, AccessClass::Agreement, &self.ac) {
                        return Err(RepositoryError::NameInUse);
                    }
                    if new_kind == SourceKind::Ghost
                        && !repo.access().check(who, AccessClass::Delete, &self.ac)
                    {
                        return Err(RepositoryError::NoPermission);
                    }
                    // A stub/ghost replacement keeps the old attributes.
                    if old_kind == SourceKind::Stub
                        || new_kind == SourceKind::Stub
                        || new_kind == SourceKind::Ghost
                    {
                        prep.attribs = entry.attrib(pool);
                    }
                }
                None => {
                    if !(self.master && master)
                        && !repo.access().check(who, AccessClass::Agreement, &self.ac)
                    {
                        return Err(RepositoryError::NotMaster);
                    }
                }
            }
        }

        match chk {
            DupeCheck::ReplaceDiff | DupeCheck::ReplaceNonMaster => {
                if let Some((entry, _)) = found {
                    if chk == DupeCheck::ReplaceNonMaster && entry.master(pool) {
                        return Err(RepositoryError::NameInUse);
                    }
                    // Replacing a mutable file drops one reference.
                    if entry.kind(pool) == SourceKind::MutableFile {
                        let sid = ShortId(entry.value(pool));
                        match self.kind {
                            SourceKind::MutableDirectory => {
                                if let Some(sidref) = &self.sidref {
                                    if sidref.decrement(sid, false) == 0 && repo.logging() {
                                        if repo.journal().nesting() == 0 {
                                            prep.delsid = sid;
                                        } else {
                                            // Not before the outer commit.
                                            repo.journal().defer_unlink(sid);
                                        }
                                    }
                                }
                            }
                            SourceKind::VolatileDirectory
                            | SourceKind::VolatileROEDirectory => {
                                let sidref =
                                    self.sidref.as_ref().expect("volatile tree has a sidref");
                                if sidref.decrement(sid, false) == 0 {
                                    repo.unlink_now(sid);
                                }
                            }
                            _ => {}
                        }
                    }
                    if entry.kind(pool) != SourceKind::Deleted {
                        entry.set_value(pool, 0); // if deleted, this is a forward
                        entry.set_attrib(pool, ShortPtr::NULL);
                    }
                    entry.set_kind(pool, SourceKind::Outdated);
                }
            }
            DupeCheck::DontReplace => match found {
                Some((entry, _)) => {
                    if entry.kind(pool) == SourceKind::Deleted {
                        entry.set_kind(pool, SourceKind::Outdated);
                    } else {
                        debug_assert!(entry.kind(pool) != SourceKind::Outdated);
                        return Err(RepositoryError::NameInUse);
                    }
                }
                None => {
                    // The arc may still be bound in the base.
                    if let Some(base) = self.base_node(repo) {
                        match base.lookup(repo, arc, None) {
                            Ok(_) => return Err(RepositoryError::NameInUse),
                            Err(RepositoryError::NotFound) => {}
                            Err(other) => return Err(other),
                        }
                    }
                }
            },
        }

        // Owner inheritance: a master insert by a user who is not already
        // a co-owner of the parent makes that user the child's owner.
        if master {
            if let Some(who) = who {
                if let Some(user) = who.users.first() {
                    if !self.ac.owners.iter().any(|o| o == user) {
                        prep.set_owner = Some(user.clone());
                    }
                }
            }
        }

        self.invalidate_snapshot(repo);
        Ok(prep)
    }

    /// Writes `#owner` on a freshly inserted entry; emits an `attr`
    /// record inside the caller's open transaction.
    fn apply_set_owner(&self, repo: &Repository, node: &Source, owner: &str) {
        if node
            .write_attrib(repo, AttribOp::Set, "#owner", owner, None, 0)
            .is_err()
        {
            log::warn!("could not set #owner on {}", node.longid);
        }
    }

    // -----------------------------------------------------------------
    // Inserts
    // -----------------------------------------------------------------

    /// Inserts an immutable file entry.
    pub fn insert_file(
        &self,
        repo: &Repository,
        arc: &str,
        sid: ShortId,
        master: bool,
        who: Option<&Identity>,
        chk: DupeCheck,
        timestamp: Timestamp,
        force_fptag: Option<&Fingerprint>,
    ) -> Result<Source> {
        let pool = repo.pool();
        if !matches!(
            self.kind,
            SourceKind::AppendableDirectory
                | SourceKind::MutableDirectory
                | SourceKind::VolatileDirectory
                | SourceKind::VolatileROEDirectory
        ) {
            return Err(RepositoryError::Inappropriate);
        }
        if arc.len() > MAX_ARC_LEN {
            return Err(RepositoryError::NameTooLong);
        }
        if sid.is_null() {
            return Err(RepositoryError::InvalidArgs);
        }
        let index = self.next_insert_index(repo);
        self.check_new_longid(index)?;

        let prep = self.insert_common(repo, arc, master, SourceKind::ImmutableFile, who, chk)?;
        let timestamp = if timestamp == 0 { now() } else { timestamp };

        let fptag = match force_fptag {
            Some(fp) => *fp,
            None => match self.kind {
                SourceKind::AppendableDirectory => {
                    self.fptag.extend(b"/").extend(arc.as_bytes())
                }
                SourceKind::VolatileDirectory | SourceKind::VolatileROEDirectory => {
                    // Not logged, so a nonreplayable unique tag is fine.
                    repo.unique_fptag()
                }
                _ => Fingerprint::NULL,
            },
        };
        let entry = self.append_entry(
            pool,
            master,
            false,
            SourceKind::ImmutableFile,
            sid.0,
            prep.attribs,
            Some(&fptag),
            arc.as_bytes(),
        );
        if self.kind == SourceKind::AppendableDirectory {
            repo.fpindex().set_file(fptag, sid);
        }
        self.bump_timestamp(repo, timestamp);

        let node = child_from_entry(repo, self, entry, index)?;
        if repo.should_log(self.kind) {
            let mut record = format!(
                "(insf {} {} {} {} {}",
                self.longid,
                quote(arc),
                sid,
                master as u8,
                timestamp
            );
            if let Some(fp) = force_fptag {
                record.push(' ');
                record.push_str(&fp.to_journal());
            }
            record.push_str(")\n");
            repo.journal().start();
            repo.journal().put(&record);
            if let Some(owner) = &prep.set_owner {
                self.apply_set_owner(repo, &node, owner);
            }
            repo.commit();
        }
        if !prep.delsid.is_null() {
            repo.unlink_now(prep.delsid);
        }
        Ok(node)
    }

    /// Inserts a mutable file entry and counts the new reference.
    pub fn insert_mutable_file(
        &self,
        repo: &Repository,
        arc: &str,
        sid: ShortId,
        master: bool,
        who: Option<&Identity>,
        chk: DupeCheck,
        timestamp: Timestamp,
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
        if arc.len() > MAX_ARC_LEN {
            return Err(RepositoryError::NameTooLong);
        }
        if sid.is_null() {
            return Err(RepositoryError::InvalidArgs);
        }
        let index = self.next_insert_index(repo);
        self.check_new_longid(index)?;

        let prep = self.insert_common(repo, arc, master, SourceKind::MutableFile, who, chk)?;
        let timestamp = if timestamp == 0 { now() } else { timestamp };

        let entry = self.append_entry(
            pool,
            master,
            false,
            SourceKind::MutableFile,
            sid.0,
            prep.attribs,
            Some(&Fingerprint::NULL),
            arc.as_bytes(),
        );
        if let Some(sidref) = &self.sidref {
            sidref.increment(sid);
        }
        self.bump_timestamp(repo, timestamp);

        let node = child_from_entry(repo, self, entry, index)?;
        if repo.should_log(self.kind) {
            let record = format!(
                "(insu {} {} {} {} {})\n",
                self.longid,
                quote(arc),
                sid,
                master as u8,
                timestamp
            );
            repo.journal().start();
            repo.journal().put(&record);
            if let Some(owner) = &prep.set_owner {
                self.apply_set_owner(repo, &node, owner);
            }
            repo.commit();
        }
        if !prep.delsid.is_null() {
            repo.unlink_now(prep.delsid);
        }
        Ok(node)
    }

    /// Inserts an immutable directory entry.
    ///
    /// `child` may be an existing immutable directory (linked by
    /// reference), a mutable directory (sealed via a deep copy first), or
    /// `None` for a fresh empty one.
    pub fn insert_immutable_directory(
        &self,
        repo: &Repository,
        arc: &str,
        child: Option<&Source>,
        master: bool,
        who: Option<&Identity>,
        chk: DupeCheck,
        timestamp: Timestamp,
        force_fptag: Option<&Fingerprint>,
    ) -> Result<Source> {
        let pool = repo.pool();
        if !matches!(
            self.kind,
            SourceKind::AppendableDirectory | SourceKind::MutableDirectory
        ) {
            return Err(RepositoryError::Inappropriate);
        }
        if let Some(child) = child {
            if !matches!(
                child.kind,
                SourceKind::MutableDirectory | SourceKind::ImmutableDirectory
            ) {
                return Err(RepositoryError::Inappropriate);
            }
            if !repo.access().check(who, AccessClass::Read, &child.ac) {
                return Err(RepositoryError::NoPermission);
            }
        }
        if arc.len() > MAX_ARC_LEN {
            return Err(RepositoryError::NameTooLong);
        }
        let index = self.next_insert_index(repo);
        let new_longid = self.check_new_longid(index)?;

        let prep =
            self.insert_common(repo, arc, master, SourceKind::ImmutableDirectory, who, chk)?;
        let timestamp = if timestamp == 0 { now() } else { timestamp };

        let child_rep;
        let child_fptag;
        match child {
            Some(proto) if proto.kind == SourceKind::ImmutableDirectory => {
                child_fptag = RepBlock(proto.rep).fptag(pool);
                if let Some(forced) = force_fptag {
                    if *forced != child_fptag {
                        return Err(RepositoryError::InvalidArgs);
                    }
                }
                child_rep = proto.rep;
            }
            Some(proto) => {
                // Sink a mutable directory into an immutable parent.
                let fptag = match force_fptag {
                    Some(fp) => *fp,
                    None => self.fptag.extend(b"/").extend(arc.as_bytes()),
                };
                let sealed = proto.copy_mutable_to_immutable(repo, &fptag);
                child_rep = sealed.rep;
                child_fptag = RepBlock(sealed.rep).fptag(pool);
            }
            None => {
                // Fresh empty immutable directory.
                let fptag = match force_fptag {
                    Some(fp) => *fp,
                    None => self.fptag.extend(b"/").extend(arc.as_bytes()),
                };
                let block = RepBlock::create(pool, SourceKind::ImmutableDirectory, 0);
                block.set_timestamp(pool, timestamp);
                block.set_fptag(pool, &fptag);
                let dirsid = repo.dirsids().assign(block.0);
                block.set_id(pool, dirsid.0);
                repo.fpindex().set_dir(fptag, block.0, dirsid);
                child_rep = block.0;
                child_fptag = fptag;
            }
        }

        let entry = self.append_entry(
            pool,
            master,
            false,
            SourceKind::ImmutableDirectory,
            child_rep.0,
            prep.attribs,
            None,
            arc.as_bytes(),
        );
        self.bump_timestamp(repo, timestamp);

        let mut node = child_from_entry(repo, self, entry, index)?;
        node.longid = new_longid;
        node.fptag = child_fptag;
        if repo.should_log(self.kind) {
            let child_longid = match child {
                None => LongId::NULL,
                Some(proto) => proto.longid,
            };
            let mut record = format!(
                "(insi {} {} {} {} {}",
                self.longid,
                quote(arc),
                child_longid,
                master as u8,
                timestamp
            );
            if let Some(fp) = force_fptag {
                record.push(' ');
                record.push_str(&fp.to_journal());
            }
            record.push_str(")\n");
            repo.journal().start();
            repo.journal().put(&record);
            if let Some(owner) = &prep.set_owner {
                self.apply_set_owner(repo, &node, owner);
            }
            repo.commit();
        }
        if !prep.delsid.is_null() {
            repo.unlink_now(prep.delsid);
        }
        Ok(node)
    }

    /// Inserts an appendable directory entry (appendable parents only).
    pub fn insert_appendable_directory(
        &self,
        repo: &Repository,
        arc: &str,
        master: bool,
        who: Option<&Identity>,
        chk: DupeCheck,
        timestamp: Timestamp,
    ) -> Result<Source> {
        let pool = repo.pool();
        if self.kind != SourceKind::AppendableDirectory {
            return Err(RepositoryError::Inappropriate);
        }
        if arc.len() > MAX_ARC_LEN {
            return Err(RepositoryError::NameTooLong);
        }
        let index = self.next_insert_index(repo);
        self.check_new_longid(index)?;

        let prep =
            self.insert_common(repo, arc, master, SourceKind::AppendableDirectory, who, chk)?;
        let timestamp = if timestamp == 0 { now() } else { timestamp };

        let block = RepBlock::create(pool, SourceKind::AppendableDirectory, 0);
        block.set_timestamp(pool, timestamp);
        let entry = self.append_entry(
            pool,
            master,
            false,
            SourceKind::AppendableDirectory,
            block.0 .0,
            prep.attribs,
            None,
            arc.as_bytes(),
        );
        self.bump_timestamp(repo, timestamp);

        let node = child_from_entry(repo, self, entry, index)?;
        if repo.should_log(self.kind) {
            let record = format!(
                "(insa {} {} {} {})\n",
                self.longid,
                quote(arc),
                master as u8,
                timestamp
            );
            repo.journal().start();
            repo.journal().put(&record);
            if let Some(owner) = &prep.set_owner {
                self.apply_set_owner(repo, &node, owner);
            }
            repo.commit();
        }
        if !prep.delsid.is_null() {
            repo.unlink_now(prep.delsid);
        }
        Ok(node)
    }

    /// Inserts a mutable directory entry.
    ///
    /// `child` is an optional base prototype: an immutable directory under
    /// a mutable parent, or an evaluator directory under a volatile one.
    pub fn insert_mutable_directory(
        &self,
        repo: &Repository,
        arc: &str,
        child: Option<&Source>,
        master: bool,
        who: Option<&Identity>,
        chk: DupeCheck,
        timestamp: Timestamp,
    ) -> Result<Source> {
        let pool = repo.pool();
        let expected_base = match self.kind {
            SourceKind::MutableDirectory => SourceKind::ImmutableDirectory,
            SourceKind::VolatileDirectory => SourceKind::EvaluatorDirectory,
            SourceKind::VolatileROEDirectory => SourceKind::EvaluatorROEDirectory,
            _ => return Err(RepositoryError::Inappropriate),
        };
        if let Some(child) = child {
            if child.kind != expected_base {
                return Err(RepositoryError::Inappropriate);
            }
            if !repo.access().check(who, AccessClass::Read, &child.ac) {
                return Err(RepositoryError::NoPermission);
            }
        }
        if arc.len() > MAX_ARC_LEN {
            return Err(RepositoryError::NameTooLong);
        }
        let index = self.next_insert_index(repo);
        self.check_new_longid(index)?;

        let prep = self.insert_common(repo, arc, master, self.kind, who, chk)?;
        let timestamp = if timestamp == 0 { now() } else { timestamp };

        let block = RepBlock::create(pool, self.kind, DEFAULT_REP_SIZE);
        block.set_timestamp(pool, timestamp);
        block.set_id(pool, self.index_to_pseudo_inode(index));
        if let Some(proto) = child {
            block.set_link(pool, LinkKind::Base, proto.rep);
        }
        let entry = self.append_entry(
            pool,
            master,
            false,
            self.kind,
            block.0 .0,
            prep.attribs,
            None,
            arc.as_bytes(),
        );
        self.bump_timestamp(repo, timestamp);

        let node = child_from_entry(repo, self, entry, index)?;
        if repo.should_log(self.kind) {
            let child_longid = match child {
                None => LongId::NULL,
                Some(proto) => proto.longid,
            };
            let record = format!(
                "(insm {} {} {} {} {})\n",
                self.longid,
                quote(arc),
                child_longid,
                master as u8,
                timestamp
            );
            repo.journal().start();
            repo.journal().put(&record);
            if let Some(owner) = &prep.set_owner {
                self.apply_set_owner(repo, &node, owner);
            }
            repo.commit();
        }
        if !prep.delsid.is_null() {
            repo.unlink_now(prep.delsid);
        }
        Ok(node)
    }

    /// Inserts a ghost (appendable parents only).
    pub fn insert_ghost(
        &self,
        repo: &Repository,
        arc: &str,
        master: bool,
        who: Option<&Identity>,
        chk: DupeCheck,
        timestamp: Timestamp,
    ) -> Result<Source> {
        self.insert_placeholder(repo, arc, master, who, chk, timestamp, SourceKind::Ghost)
    }

    /// Inserts a stub (appendable parents only).
    pub fn insert_stub(
        &self,
        repo: &Repository,
        arc: &str,
        master: bool,
        who: Option<&Identity>,
        chk: DupeCheck,
        timestamp: Timestamp,
    ) -> Result<Source> {
        self.insert_placeholder(repo, arc, master, who, chk, timestamp, SourceKind::Stub)
    }

    fn insert_placeholder(
        &self,
        repo: &Repository,
        arc: &str,
        master: bool,
        who: Option<&Identity>,
        chk: DupeCheck,
        timestamp: Timestamp,
        kind: SourceKind,
    ) -> Result<Source> {
        let pool = repo.pool();
        if self.kind != SourceKind::AppendableDirectory {
            return Err(RepositoryError::Inappropriate);
        }
        if arc.len() > MAX_ARC_LEN {
            return Err(RepositoryError::NameTooLong);
        }
        let index = self.next_insert_index(repo);
        self.check_new_longid(index)?;

        let prep = self.insert_common(repo, arc, master, kind, who, chk)?;
        let timestamp = if timestamp == 0 { now() } else { timestamp };

        let entry = self.append_entry(
            pool,
            master,
            false,
            kind,
            0,
            prep.attribs,
            None,
            arc.as_bytes(),
        );
        self.bump_timestamp(repo, timestamp);

        let node = child_from_entry(repo, self, entry, index)?;
        if repo.should_log(self.kind) {
            let tag = if kind == SourceKind::Ghost { "insg" } else { "inss" };
            let record = format!(
                "({tag} {} {} {} {})\n",
                self.longid,
                quote(arc),
                master as u8,
                timestamp
            );
            repo.journal().start();
            repo.journal().put(&record);
            if let Some(owner) = &prep.set_owner {
                self.apply_set_owner(repo, &node, owner);
            }
            repo.commit();
        }
        if !prep.delsid.is_null() {
            repo.unlink_now(prep.delsid);
        }
        Ok(node)
    }

    // -----------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------

    /// Deletes the binding of `arc`.
    ///
    /// In an appendable master directory the caller is expected to insert
    /// a ghost instead (deleting would break the agreement invariant); in
    /// mutable and volatile directories a `deleted` entry is created, as
    /// an `outdated` one when nothing in the base is shadowed and the log
    /// version allows the compression.
    pub fn really_delete(
        &self,
        repo: &Repository,
        arc: &str,
        who: Option<&Identity>,
        exist_check: bool,
        timestamp: Timestamp,
    ) -> Result<()> {
        let pool = repo.pool();
        if !self.kind.is_changeable() {
            return Err(RepositoryError::Inappropriate);
        }
        if self.master && self.kind == SourceKind::AppendableDirectory {
            // Deleting a master name outright violates the agreement
            // invariant whenever any replica holds the name.
            if !repo.access().check(who, AccessClass::Agreement, &self.ac) {
                return Err(RepositoryError::NameInUse);
            }
        } else if !repo.access().check(who, AccessClass::Write, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }

        let found = self.find_arc(pool, arc.as_bytes(), true, false);

        // Does the arc resolve in the base?
        let in_base = match self.base_node(repo) {
            None => Err(RepositoryError::NotFound),
            Some(base) => base.lookup(repo, arc, None).map(|_| ()),
        };

        match found {
            None => {
                if exist_check {
                    in_base?;
                } else if repo.log_version() >= 2 && in_base == Err(RepositoryError::NotFound) {
                    // Nothing to shadow: avoid a needless deleted entry.
                    return Ok(());
                }
            }
            Some((entry, _)) if entry.kind(pool) == SourceKind::Deleted => {
                return if exist_check {
                    Err(RepositoryError::NotFound)
                } else {
                    Ok(())
                };
            }
            Some(_) => {}
        }
        let timestamp = if timestamp == 0 { now() } else { timestamp };

        if repo.should_log(self.kind) {
            let record = format!(
                "(del {} {} {})\n",
                self.longid,
                quote(arc),
                timestamp
            );
            repo.journal().start();
            repo.journal().put(&record);
            repo.commit();
        }

        if self.kind == SourceKind::AppendableDirectory {
            // Replicated namespace: the binding is outdated and, under a
            // master directory, a ghost keeps the name from silently
            // reappearing elsewhere.
            let old_attrib = match found {
                Some((entry, _)) => {
                    let attrib = entry.attrib(pool);
                    entry.overwrite(
                        pool,
                        true,
                        entry.same_as_base(pool),
                        SourceKind::Outdated,
                        0,
                        ShortPtr::NULL,
                        None,
                    );
                    attrib
                }
                None => ShortPtr::NULL,
            };
            if self.master {
                self.append_entry(
                    pool,
                    true,
                    false,
                    SourceKind::Ghost,
                    0,
                    old_attrib,
                    None,
                    arc.as_bytes(),
                );
            }
            let block = RepBlock(self.rep);
            if timestamp > block.timestamp(pool) {
                block.set_timestamp(pool, timestamp);
            }
            return Ok(());
        }

        let dtype = if repo.log_version() >= 2 && in_base == Err(RepositoryError::NotFound) {
            // Not shadowing anything: eligible for gap compression at the
            // next checkpoint.
            SourceKind::Outdated
        } else {
            SourceKind::Deleted
        };
        match found {
            None => {
                self.append_entry(pool, true, true, dtype, 0, ShortPtr::NULL, None, arc.as_bytes());
            }
            Some((entry, _)) => {
                let old_kind = entry.kind(pool);
                if old_kind == SourceKind::MutableFile {
                    let sid = ShortId(entry.value(pool));
                    match self.kind {
                        SourceKind::MutableDirectory => {
                            if let Some(sidref) = &self.sidref {
                                if sidref.decrement(sid, false) == 0 && repo.logging() {
                                    repo.queue_unlink(sid);
                                }
                            }
                        }
                        SourceKind::VolatileDirectory | SourceKind::VolatileROEDirectory => {
                            let sidref =
                                self.sidref.as_ref().expect("volatile tree has a sidref");
                            if sidref.decrement(sid, false) == 0 {
                                repo.unlink_now(sid);
                            }
                        }
                        _ => {}
                    }
                } else if matches!(
                    old_kind,
                    SourceKind::MutableDirectory
                        | SourceKind::VolatileDirectory
                        | SourceKind::VolatileROEDirectory
                ) {
                    // Reclaim the whole subtree; these directories have
                    // exactly one reference.
                    let mut child = Source::for_rep(old_kind, ShortPtr(entry.value(pool)));
                    child.sidref = self.sidref.clone();
                    child.free_tree(repo);
                }
                entry.overwrite(
                    pool,
                    true,
                    entry.same_as_base(pool),
                    dtype,
                    0,
                    ShortPtr::NULL,
                    None,
                );
            }
        }
        let block = RepBlock(self.rep);
        if timestamp > block.timestamp(pool) {
            block.set_timestamp(pool, timestamp);
        }
        self.invalidate_snapshot(repo);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Rename
    // -----------------------------------------------------------------

    /// Renames `from_dir`/`from_arc` to `self`/`arc`.
    ///
    /// Mutable sources leave a forwarding pointer so the old longid keeps
    /// resolving; master appendable sources leave a ghost.
    pub fn rename_to(
        &self,
        repo: &Repository,
        arc: &str,
        from_dir: &Source,
        from_arc: &str,
        who: Option<&Identity>,
        chk: DupeCheck,
        timestamp: Timestamp,
    ) -> Result<()> {
        let pool = repo.pool();
        match self.kind {
            SourceKind::AppendableDirectory
            | SourceKind::MutableDirectory
            | SourceKind::VolatileDirectory
            | SourceKind::VolatileROEDirectory => {
                if from_dir.kind != self.kind || from_dir.master != self.master {
                    return Err(RepositoryError::Inappropriate);
                }
            }
            _ => return Err(RepositoryError::Inappropriate),
        }
        let same_dir = from_dir.longid == self.longid;
        if same_dir {
            from_dir.resync();
        }
        let from_dir: &Source = if same_dir { self } else { from_dir };

        let mut target = from_dir.lookup(repo, from_arc, who)?;
        if !repo.access().check(who, AccessClass::Write, &from_dir.ac) {
            return Err(RepositoryError::NoPermission);
        }
        // No loops: the source must not be an ancestor of the target
        // directory.
        if target.longid.is_ancestor_of(&self.longid) {
            return Err(RepositoryError::InvalidArgs);
        }

        let old_entry = from_dir.find_arc(pool, from_arc.as_bytes(), false, false);
        let mut index = self.next_insert_index(repo);
        if same_dir && old_entry.is_none() {
            // A forwarding entry will be appended first, shifting the
            // index of the renamed object by one.
            index += 2;
        }
        let new_longid = self.longid.append(index);
        if new_longid.is_null() {
            return Err(RepositoryError::LongIdOverflow);
        }
        if arc.len() > MAX_ARC_LEN {
            return Err(RepositoryError::NameTooLong);
        }

        let prep = self.insert_common(repo, arc, target.master, target.kind, who, chk)?;
        let timestamp = if timestamp == 0 { now() } else { timestamp };

        // Copy the owner history when the move crosses an ownership
        // realm, so the moved node does not silently inherit new owners.
        let need_owner = !same_dir
            && target.ac.owners != self.ac.owners
            && !target.ac.owners.is_empty();

        let mut need_commit = false;
        if repo.should_log(self.kind) {
            let record = format!(
                "(ren {} {} {} {} {})\n",
                self.longid,
                quote(arc),
                from_dir.longid,
                quote(from_arc),
                timestamp
            );
            repo.journal().start();
            repo.journal().put(&record);
            need_commit = true;
        }
        let old_attrib = match target.attribs {
            AttribsLoc::Pool(cell) => ShortPtr(pool.read_u32(cell)),
            _ => ShortPtr::NULL,
        };

        // Remove from the old parent.
        if from_dir.kind == SourceKind::AppendableDirectory {
            if let Some((entry, _)) = old_entry {
                entry.overwrite(
                    pool,
                    true,
                    entry.same_as_base(pool),
                    SourceKind::Outdated,
                    0,
                    ShortPtr::NULL,
                    None,
                );
            }
            if from_dir.master {
                // Leave a ghost where the master name used to be.
                from_dir.append_entry(
                    pool,
                    true,
                    false,
                    SourceKind::Ghost,
                    0,
                    ShortPtr::NULL,
                    None,
                    from_arc.as_bytes(),
                );
            }
        } else {
            let forward = Forward::create(pool, &new_longid);
            match old_entry {
                None => {
                    from_dir.append_entry(
                        pool,
                        true,
                        true,
                        SourceKind::Deleted,
                        forward.0 .0,
                        ShortPtr::NULL,
                        None,
                        from_arc.as_bytes(),
                    );
                }
                Some((entry, _)) => {
                    let mut dtype = SourceKind::Deleted;
                    if repo.log_version() >= 2 {
                        match from_dir.base_node(repo) {
                            None => dtype = SourceKind::Outdated,
                            Some(base) if repo.log_version() >= 3 => {
                                if base.lookup(repo, from_arc, None).is_err() {
                                    dtype = SourceKind::Outdated;
                                }
                            }
                            Some(_) => {}
                        }
                    }
                    entry.overwrite(
                        pool,
                        true,
                        entry.same_as_base(pool),
                        dtype,
                        forward.0 .0,
                        ShortPtr::NULL,
                        None,
                    );
                }
            }
            from_dir.invalidate_snapshot(repo);
        }
        from_dir.bump_timestamp(repo, timestamp);

        // Copy-on-write the target when the variants mismatch.
        let needs_cow = matches!(
            (target.kind, from_dir.kind),
            (SourceKind::ImmutableDirectory, SourceKind::MutableDirectory)
                | (SourceKind::EvaluatorDirectory, SourceKind::VolatileDirectory)
                | (
                    SourceKind::EvaluatorROEDirectory,
                    SourceKind::VolatileROEDirectory
                )
        );
        if needs_cow {
            let block = RepBlock::create(pool, from_dir.kind, DEFAULT_REP_SIZE);
            block.set_link(pool, LinkKind::Base, target.rep);
            block.set_id(pool, target.pseudo_inode);
            block.set_timestamp(pool, target.timestamp(pool));
            let mut new_target = Source::for_rep(from_dir.kind, block.0);
            new_target.master = target.master;
            new_target.fptag = target.fptag;
            new_target.longid = target.longid;
            new_target.pseudo_inode = target.pseudo_inode;
            new_target.ac = target.ac.clone();
            new_target.sidref = self.sidref.clone();
            target = new_target;
        }

        // Insert into the new parent.
        let new_value = match target.kind {
            SourceKind::ImmutableFile | SourceKind::MutableFile | SourceKind::Device => {
                target.sid.0
            }
            SourceKind::Ghost | SourceKind::Stub => 0,
            _ => target.rep.0,
        };
        let new_fptag = if target.kind == SourceKind::AppendableDirectory {
            self.fptag.extend(b"/").extend(arc.as_bytes())
        } else {
            target.fptag
        };
        let entry = self.append_entry(
            pool,
            target.master,
            false,
            target.kind,
            new_value,
            old_attrib,
            if target.kind.is_file() {
                Some(&new_fptag)
            } else {
                None
            },
            arc.as_bytes(),
        );
        if self.kind == SourceKind::AppendableDirectory
            && target.kind == SourceKind::ImmutableFile
        {
            repo.fpindex().set_file(new_fptag, target.sid);
        }
        self.bump_timestamp(repo, timestamp);
        self.invalidate_snapshot(repo);

        if !prep.delsid.is_null() {
            repo.unlink_now(prep.delsid);
        }
        if need_commit {
            if need_owner {
                // The moved node has attributes now; copy each owner over
                // (each write emits its own attr record in this
                // transaction).
                if let Ok(moved) = child_from_entry(repo, self, entry, index) {
                    for owner in &target.ac.owners {
                        let _ = moved.write_attrib(
                            repo,
                            AttribOp::Add,
                            "#owner",
                            owner,
                            None,
                            0,
                        );
                    }
                }
            }
            repo.commit();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Master flag, timestamps, attributes
    // -----------------------------------------------------------------

    /// Toggles the master flag on the entry at `index`.
    pub fn set_index_master(
        &self,
        repo: &Repository,
        index: u32,
        state: bool,
        who: Option<&Identity>,
    ) -> Result<()> {
        let pool = repo.pool();
        if !self.kind.is_changeable() {
            return Err(RepositoryError::Inappropriate);
        }
        // Changing the flag affects the replication agreement.
        if !repo.access().check(who, AccessClass::Agreement, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }
        if index & 1 == 0 {
            return Err(RepositoryError::Inappropriate);
        }
        let entry = self
            .find_raw_index(pool, (index + 1) >> 1)
            .ok_or(RepositoryError::NotFound)?;
        if !entry.kind(pool).is_visible() {
            return Err(RepositoryError::NotFound);
        }
        entry.set_master(pool, state);

        if repo.should_log(self.kind) {
            let record = format!("(mast {} {} {})\n", self.longid, index, state as u8);
            repo.journal().start();
            repo.journal().put(&record);
            repo.commit();
        }
        Ok(())
    }

    /// Sets the directory timestamp outright (used by the filesystem
    /// frontier to honor utimes).
    pub fn set_dir_timestamp(
        &self,
        repo: &Repository,
        timestamp: Timestamp,
        who: Option<&Identity>,
    ) -> Result<()> {
        if !self.kind.is_local_directory() {
            return Err(RepositoryError::Inappropriate);
        }
        if !repo.access().check(who, AccessClass::Write, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }
        RepBlock(self.rep).set_timestamp(repo.pool(), timestamp);
        self.invalidate_snapshot(repo);
        if repo.should_log(self.kind) {
            let record = format!("(time {} {})\n", self.longid, timestamp);
            repo.journal().start();
            repo.journal().put(&record);
            repo.commit();
        }
        Ok(())
    }

    /// Writes one attribute-history record on this node.
    ///
    /// `#`-prefixed names are reserved: they need ownership access, and
    /// the replication-master marker needs administrative access.
    pub fn write_attrib(
        &self,
        repo: &Repository,
        op: AttribOp,
        name: &str,
        value: &str,
        who: Option<&Identity>,
        timestamp: Timestamp,
    ) -> Result<Timestamp> {
        let pool = repo.pool();
        if !self.attribs.has_attribs() {
            return Err(RepositoryError::InvalidArgs);
        }
        let class = if name == "master-repository" {
            AccessClass::Administrative
        } else if name.starts_with('#') {
            AccessClass::Ownership
        } else {
            AccessClass::Write
        };
        if !repo.access().check(who, class, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }

        let head = repo.attrib_head(self.attribs);
        let ts = attrib::would_write_attrib(pool, head, op, name, value, timestamp)?;

        if repo.logging() {
            let record = format!(
                "(attr {} {} {} {} {})\n",
                self.longid,
                op as u8,
                quote(name),
                quote(value),
                ts
            );
            repo.journal().start();
            repo.journal().put(&record);
            repo.commit();
        }

        let loc = self.attribs;
        let (applied_ts, _) = attrib::write_attrib(
            pool,
            &|| repo.attrib_head(loc),
            &mut |sp| repo.set_attrib_head(loc, sp),
            op,
            name,
            value,
            ts,
        )?;
        Ok(applied_ts)
    }
}
