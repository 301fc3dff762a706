//! Derived lookup tables: fingerprint → shortid and shortid → directory rep.
//!
//! [`FpShortIdTable`] deduplicates sealed content: one table maps a file's
//! content fingerprint to its shortid, the other maps an immutable
//! directory's fingerprint to its rep block. Both are populated as files
//! and directories are made immutable and rebuilt from scratch by the
//! rebuild pass after a sweep or a checkpoint read — the entries point
//! into the pool, and a sweep may have moved or dropped them.
//!
//! [`DirShortIdTable`] maps directory shortids to their rep blocks so that
//! `0,3,…` longids can resolve, and hands out unused directory shortids.

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::fingerprint::Fingerprint;
use crate::pool::ShortPtr;
use crate::types::{ShortId, NULL_SHORTID};

/// Fingerprint-keyed dedup tables for sealed files and directories.
#[derive(Debug, Default)]
pub struct FpShortIdTable {
    files: Mutex<FnvHashMap<Fingerprint, ShortId>>,
    dirs: Mutex<FnvHashMap<Fingerprint, ShortPtr>>,
}

impl FpShortIdTable {
    pub fn new() -> FpShortIdTable {
        FpShortIdTable::default()
    }

    /// Records a sealed file's fingerprint.
    pub fn set_file(&self, fptag: Fingerprint, sid: ShortId) {
        if fptag.is_null() || sid.is_null() {
            return;
        }
        self.files.lock().insert(fptag, sid);
    }

    /// Records an immutable directory's fingerprint and rep.
    pub fn set_dir(&self, fptag: Fingerprint, rep: ShortPtr, sid: ShortId) {
        if fptag.is_null() {
            return;
        }
        self.dirs.lock().insert(fptag, rep);
        if !sid.is_null() {
            self.files.lock().insert(fptag, sid);
        }
    }

    /// Looks a fingerprint up in both tables, returning the shortid.
    pub fn get(&self, fptag: &Fingerprint) -> ShortId {
        if let Some(&sid) = self.files.lock().get(fptag) {
            return sid;
        }
        NULL_SHORTID
    }

    /// The rep of the immutable directory sealed with `fptag`, if any.
    pub fn get_dir_rep(&self, fptag: &Fingerprint) -> Option<ShortPtr> {
        self.dirs.lock().get(fptag).copied()
    }

    /// Empties both tables ahead of a rebuild.
    pub fn clear(&self) {
        self.files.lock().clear();
        self.dirs.lock().clear();
    }
}

/// Directory shortid → rep block, plus unused-shortid assignment.
#[derive(Debug)]
pub struct DirShortIdTable {
    reps: Mutex<FnvHashMap<ShortId, ShortPtr>>,
    next_probe: Mutex<u32>,
}

impl Default for DirShortIdTable {
    fn default() -> Self {
        DirShortIdTable {
            reps: Mutex::new(FnvHashMap::default()),
            next_probe: Mutex::new(1),
        }
    }
}

impl DirShortIdTable {
    pub fn new() -> DirShortIdTable {
        DirShortIdTable::default()
    }

    /// Registers the rep for a directory shortid.
    pub fn set(&self, sid: ShortId, rep: ShortPtr) {
        debug_assert!(sid.is_dir());
        self.reps.lock().insert(sid, rep);
    }

    /// The rep registered for `sid`, or null if unknown.
    pub fn get(&self, sid: ShortId) -> ShortPtr {
        self.reps.lock().get(&sid).copied().unwrap_or(ShortPtr::NULL)
    }

    pub fn remove(&self, sid: ShortId) {
        self.reps.lock().remove(&sid);
    }

    /// Assigns a fresh, unused directory shortid and registers its rep.
    pub fn assign(&self, rep: ShortPtr) -> ShortId {
        let mut reps = self.reps.lock();
        let mut probe = self.next_probe.lock();
        loop {
            let candidate = ShortId(0x8000_0000 | *probe);
            *probe = probe.wrapping_add(1) & 0x7fff_ffff;
            if *probe == 0 {
                *probe = 1;
            }
            if !reps.contains_key(&candidate) {
                reps.insert(candidate, rep);
                return candidate;
            }
        }
    }

    pub fn clear(&self) {
        self.reps.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_table_round_trip() {
        let table = FpShortIdTable::new();
        let fp = Fingerprint::of_text("TextDcontents");
        assert_eq!(table.get(&fp), NULL_SHORTID);
        table.set_file(fp, ShortId(0x42));
        assert_eq!(table.get(&fp), ShortId(0x42));
        table.clear();
        assert_eq!(table.get(&fp), NULL_SHORTID);
    }

    #[test]
    fn dir_table_round_trip() {
        let table = FpShortIdTable::new();
        let fp = Fingerprint::of_text("dir");
        table.set_dir(fp, ShortPtr(64), ShortId(0x8000_0009));
        assert_eq!(table.get_dir_rep(&fp), Some(ShortPtr(64)));
        assert_eq!(table.get(&fp), ShortId(0x8000_0009));
    }

    #[test]
    fn null_fingerprint_ignored() {
        let table = FpShortIdTable::new();
        table.set_file(Fingerprint::NULL, ShortId(1));
        assert_eq!(table.get(&Fingerprint::NULL), NULL_SHORTID);
    }

    #[test]
    fn assign_unique_dir_shortids() {
        let table = DirShortIdTable::new();
        let a = table.assign(ShortPtr(8));
        let b = table.assign(ShortPtr(16));
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
        assert_eq!(table.get(a), ShortPtr(8));
        assert_eq!(table.get(b), ShortPtr(16));
    }
}
