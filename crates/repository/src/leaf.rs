//! Leaf node operations: files, ghosts, stubs, devices.
//!
//! A leaf [`Source`] carries only a shortid; its bytes live in the
//! external store. Reads and writes here enforce the repository's access
//! rules and the mutability regime — the byte I/O itself is plain store
//! traffic.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::access::{AccessClass, Identity};
use crate::dir::Source;
use crate::error::{RepositoryError, Result};
use crate::repository::Repository;
use crate::types::SourceKind;

impl Source {
    /// Size in bytes of the file's contents.
    pub fn file_size(&self, repo: &Repository) -> Result<u64> {
        if !self.kind.is_file() {
            return Err(RepositoryError::IsADirectory);
        }
        repo.store().size(self.sid).map_err(|_| RepositoryError::NotFound)
    }

    /// Reads up to `buffer.len()` bytes at `offset`.
    pub fn read_at(
        &self,
        repo: &Repository,
        buffer: &mut [u8],
        offset: u64,
        who: Option<&Identity>,
    ) -> Result<usize> {
        if !self.kind.is_file() {
            return Err(RepositoryError::IsADirectory);
        }
        if !repo.access().check(who, AccessClass::Read, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }
        let mut file = repo
            .store()
            .open_read(self.sid)
            .map_err(|_| RepositoryError::NotFound)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| RepositoryError::InvalidArgs)?;
        let mut total = 0;
        while total < buffer.len() {
            match file.read(&mut buffer[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    log::warn!("read of shortid {} failed: {e}", self.sid);
                    return Err(RepositoryError::InvalidArgs);
                }
            }
        }
        Ok(total)
    }

    /// Writes `data` at `offset`. Only mutable files accept writes;
    /// writing an immutable file is the caller's cue to copy-on-write
    /// via [`Repository::make_mutable`] first.
    pub fn write_at(
        &self,
        repo: &Repository,
        data: &[u8],
        offset: u64,
        who: Option<&Identity>,
    ) -> Result<usize> {
        if self.kind != SourceKind::MutableFile {
            return Err(if self.kind == SourceKind::ImmutableFile {
                RepositoryError::Inappropriate
            } else {
                RepositoryError::IsADirectory
            });
        }
        if !repo.access().check(who, AccessClass::Write, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }
        let mut file = repo
            .store()
            .open_write(self.sid)
            .map_err(|_| RepositoryError::NotFound)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| RepositoryError::InvalidArgs)?;
        file.write_all(data).map_err(|e| {
            log::warn!("write of shortid {} failed: {e}", self.sid);
            RepositoryError::OutOfSpace
        })?;
        Ok(data.len())
    }

    /// Truncates or extends a mutable file.
    pub fn set_file_size(
        &self,
        repo: &Repository,
        size: u64,
        who: Option<&Identity>,
    ) -> Result<()> {
        if self.kind != SourceKind::MutableFile {
            return Err(RepositoryError::Inappropriate);
        }
        if !repo.access().check(who, AccessClass::Write, &self.ac) {
            return Err(RepositoryError::NoPermission);
        }
        let file = repo
            .store()
            .open_write(self.sid)
            .map_err(|_| RepositoryError::NotFound)?;
        file.set_len(size).map_err(|_| RepositoryError::OutOfSpace)
    }

    /// Number of live links to this file's shortid (always 1 for sealed
    /// files; mutable files can be hard-linked within their tree).
    pub fn link_count(&self) -> u32 {
        match (&self.sidref, self.kind) {
            (Some(sidref), SourceKind::MutableFile) => sidref.count(self.sid).max(1),
            _ => 1,
        }
    }

    /// Whether the stored file has an execute bit set.
    pub fn executable(&self, repo: &Repository) -> Result<bool> {
        if !self.kind.is_file() {
            return Err(RepositoryError::IsADirectory);
        }
        repo.store()
            .is_executable(self.sid)
            .map_err(|_| RepositoryError::NotFound)
    }
}
