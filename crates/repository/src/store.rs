//! Interface to the external shortid byte-stream store.
//!
//! The engine stores only 32-bit shortids; the bytes live outside it. This
//! module defines the seam the engine consumes ([`SidStore`]), a
//! filesystem-tree implementation used by the server and the tests, and a
//! small cache of open read handles so hot files are not reopened on every
//! access.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use moka::sync::Cache;

use crate::types::{ShortId, NULL_SHORTID};

/// Byte-stream store keyed by shortid.
///
/// Implementations must be safe to call from many worker threads.
pub trait SidStore: Send + Sync {
    /// Assigns a fresh file shortid and creates an empty file for it.
    fn create(&self) -> io::Result<ShortId>;

    /// Opens the file for reading.
    fn open_read(&self, sid: ShortId) -> io::Result<File>;

    /// Opens the file for writing (appending descriptors are the caller's
    /// business; this is a plain read-write handle).
    fn open_write(&self, sid: ShortId) -> io::Result<File>;

    /// Size of the stored file in bytes.
    fn size(&self, sid: ShortId) -> io::Result<u64>;

    /// True if the file was stored with any execute bit set.
    fn is_executable(&self, sid: ShortId) -> io::Result<bool>;

    /// Strips write permission from the stored file and syncs it, sealing
    /// the bytes under this shortid.
    fn seal(&self, sid: ShortId) -> io::Result<()>;

    /// Removes the file.
    fn unlink(&self, sid: ShortId) -> io::Result<()>;

    /// Copies up to `copy_max` bytes of `src` into a fresh shortid.
    ///
    /// `copy_max` exists for the caller that knows the client is about to
    /// overwrite the copy anyway; `u64::MAX` copies everything.
    fn copy_sid(&self, src: ShortId, copy_max: u64) -> io::Result<ShortId>;
}

/// Filesystem-tree store: shortid `0xabcdef12` lives at `ab/cd/ef12` under
/// the store root.
pub struct FsStore {
    root: PathBuf,
    next_sid: AtomicU32,
    handles: FdCache,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> FsStore {
        FsStore {
            root: root.into(),
            next_sid: AtomicU32::new(1),
            handles: FdCache::new(512),
        }
    }

    fn path_of(&self, sid: ShortId) -> PathBuf {
        self.root
            .join(format!("{:02x}", (sid.0 >> 24) & 0xff))
            .join(format!("{:02x}", (sid.0 >> 16) & 0xff))
            .join(format!("{:04x}", sid.0 & 0xffff))
    }

    /// True if the store still holds bytes for `sid`.
    pub fn exists(&self, sid: ShortId) -> bool {
        self.path_of(sid).exists()
    }
}

impl SidStore for FsStore {
    fn create(&self) -> io::Result<ShortId> {
        loop {
            let raw = self.next_sid.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff;
            if raw == 0 {
                continue;
            }
            let sid = ShortId(raw);
            let path = self.path_of(sid);
            if path.exists() {
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            OpenOptions::new().write(true).create_new(true).open(&path)?;
            return Ok(sid);
        }
    }

    fn open_read(&self, sid: ShortId) -> io::Result<File> {
        File::open(self.path_of(sid))
    }

    fn open_write(&self, sid: ShortId) -> io::Result<File> {
        self.handles.invalidate(sid);
        OpenOptions::new().read(true).write(true).open(self.path_of(sid))
    }

    fn size(&self, sid: ShortId) -> io::Result<u64> {
        Ok(fs::metadata(self.path_of(sid))?.len())
    }

    fn is_executable(&self, sid: ShortId) -> io::Result<bool> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(self.path_of(sid))?.permissions().mode();
            Ok(mode & 0o111 != 0)
        }
        #[cfg(not(unix))]
        {
            let _ = sid;
            Ok(false)
        }
    }

    fn seal(&self, sid: ShortId) -> io::Result<()> {
        // Flush any cached descriptor before the file goes read-only.
        self.handles.invalidate(sid);
        let path = self.path_of(sid);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.sync_all()?;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms)?;
        Ok(())
    }

    fn unlink(&self, sid: ShortId) -> io::Result<()> {
        self.handles.invalidate(sid);
        match fs::remove_file(self.path_of(sid)) {
            Ok(()) => Ok(()),
            // Already gone is fine; unlinks can race a weed.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn copy_sid(&self, src: ShortId, copy_max: u64) -> io::Result<ShortId> {
        let dst = self.create()?;
        let mut from = self.open_read(src)?;
        let mut to = OpenOptions::new().write(true).open(self.path_of(dst))?;
        let mut remaining = copy_max;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = buf.len().min(remaining.min(usize::MAX as u64) as usize);
            let got = from.read(&mut buf[..want])?;
            if got == 0 {
                break;
            }
            to.write_all(&buf[..got])?;
            remaining -= got as u64;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // Preserve the executable bits; the copy is writable again.
            let src_mode = fs::metadata(self.path_of(src))?.permissions().mode();
            let mut perms = fs::metadata(self.path_of(dst))?.permissions();
            perms.set_mode(0o644 | (src_mode & 0o111));
            fs::set_permissions(self.path_of(dst), perms)?;
        }
        Ok(dst)
    }
}

/// Cache of open read handles, keyed by shortid.
///
/// Sealing or unlinking a shortid must invalidate its entry so no stale
/// descriptor outlives the permission change.
pub struct FdCache {
    cache: Cache<ShortId, Arc<File>>,
}

impl FdCache {
    pub fn new(capacity: u64) -> FdCache {
        FdCache {
            cache: Cache::new(capacity),
        }
    }

    /// Returns a cached read handle, opening via `open` on a miss.
    pub fn get_or_open(
        &self,
        sid: ShortId,
        open: impl FnOnce() -> io::Result<File>,
    ) -> io::Result<Arc<File>> {
        if let Some(handle) = self.cache.get(&sid) {
            return Ok(handle);
        }
        let handle = Arc::new(open()?);
        self.cache.insert(sid, handle.clone());
        Ok(handle)
    }

    pub fn invalidate(&self, sid: ShortId) {
        self.cache.invalidate(&sid);
    }
}

/// Writes `contents` into a fresh shortid; test and bootstrap helper.
pub fn create_with_contents(store: &dyn SidStore, contents: &[u8]) -> io::Result<ShortId> {
    let sid = store.create()?;
    debug_assert!(sid != NULL_SHORTID);
    let mut file = store.open_write(sid)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(sid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn create_write_read() {
        let (_dir, store) = store();
        let sid = create_with_contents(&store, b"hello").unwrap();
        let mut text = String::new();
        store.open_read(sid).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello");
        assert_eq!(store.size(sid).unwrap(), 5);
    }

    #[test]
    fn seal_makes_read_only() {
        let (_dir, store) = store();
        let sid = create_with_contents(&store, b"data").unwrap();
        store.seal(sid).unwrap();
        assert!(store.open_write(sid).is_err());
        assert!(store.open_read(sid).is_ok());
    }

    #[test]
    fn copy_sid_copies_bytes() {
        let (_dir, store) = store();
        let src = create_with_contents(&store, b"0123456789").unwrap();
        let full = store.copy_sid(src, u64::MAX).unwrap();
        assert_eq!(store.size(full).unwrap(), 10);
        let partial = store.copy_sid(src, 4).unwrap();
        assert_eq!(store.size(partial).unwrap(), 4);
        assert_ne!(src, full);
        assert_ne!(full, partial);
    }

    #[test]
    fn unlink_is_idempotent() {
        let (_dir, store) = store();
        let sid = create_with_contents(&store, b"x").unwrap();
        store.unlink(sid).unwrap();
        store.unlink(sid).unwrap();
        assert!(!store.exists(sid));
    }
}
