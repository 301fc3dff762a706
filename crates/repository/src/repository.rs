//! The repository handle: the three roots, the process-wide locks, the
//! journal, recovery, and the drivers that span multiple directories.
//!
//! Everything the original kept as process globals lives here and is
//! threaded through the directory operations explicitly.
//!
//! Locking: `StableLock` covers both packed trees hanging from the
//! repository and mutable roots; `VolatileRootLock` covers the *set* of
//! volatile subtrees, each of which carries its own lock for its
//! interior. A lookup below the volatile root holds the root lock only
//! across the discriminator step and the subtree-lock acquisition.

use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::access::{AccessClass, AccessConfig, AccessControl, Identity, NodeAc};
use crate::attrib::{self, AttribOp};
use crate::checkpoint;
use crate::copylock::CopyGate;
use crate::dir::{self, gc, rep::LinkKind, rep::RepBlock, AttribsLoc, Source};
use crate::error::{RepositoryError, Result};
use crate::evaluator::{EvalDir, EvaluatorGateway};
use crate::fingerprint::{Fingerprint, UNIQUE_PREFIX};
use crate::fpindex::{DirShortIdTable, FpShortIdTable};
use crate::forward::MAX_FOLLOW_DEPTH;
use crate::journal::{Journal, RecordReader, MAX_LOG_VERSION};
use crate::longid::{LongId, RootKind};
use crate::pool::{BlockKind, MemPool, PoolConfig, PoolHooks, ShortPtr};
use crate::refcount::SidRefCount;
use crate::store::{FsStore, SidStore};
use crate::types::{now, DupeCheck, ShortId, SourceKind, NULL_SHORTID};

/// The three root attribute/rep cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootCell {
    Repository,
    Mutable,
    Volatile,
}

impl RootCell {
    fn index(self) -> usize {
        match self {
            RootCell::Repository => 0,
            RootCell::Mutable => 1,
            RootCell::Volatile => 2,
        }
    }
}

/// Lock wanted by a [`Repository::lookup`] caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
    /// The caller already holds the volatile-root lock; take only the
    /// inner subtree lock.
    ReadV,
    WriteV,
    /// The caller asserts it already holds a sufficient lock.
    Check,
    None,
}

/// The lock a lookup returned; dropping it releases the tree.
pub enum Lock<'r> {
    None,
    StableRead(RwLockReadGuard<'r, ()>),
    StableWrite(RwLockWriteGuard<'r, ()>),
    VolatileRead(RwLockReadGuard<'r, ()>),
    VolatileWrite(RwLockWriteGuard<'r, ()>),
    SubtreeRead(ArcRwLockReadGuard<RawRwLock, ()>),
    SubtreeWrite(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// One volatile subtree's out-of-pool state.
#[derive(Clone)]
struct VolatileSubtree {
    lock: Arc<RwLock<()>>,
    sidref: Arc<SidRefCount>,
}

/// Configuration for opening a repository.
pub struct RepositoryConfig {
    pub pool: PoolConfig,
    pub access: AccessConfig,
    /// Root of the shortid byte store.
    pub store_root: PathBuf,
    /// Journal file (created if absent).
    pub journal_path: PathBuf,
    /// Checkpoint to load before replaying, if one exists.
    pub checkpoint_path: Option<PathBuf>,
    /// Content-fingerprinting size threshold for sealing files.
    pub fp_threshold: u64,
}

impl RepositoryConfig {
    /// A self-contained configuration under one scratch directory.
    pub fn under(root: &std::path::Path) -> RepositoryConfig {
        RepositoryConfig {
            pool: PoolConfig::default(),
            access: AccessConfig::default(),
            store_root: root.join("sid"),
            journal_path: root.join("repository.log"),
            checkpoint_path: Some(root.join("repository.ckp")),
            fp_threshold: 1 << 20,
        }
    }
}

/// The in-memory directory engine.
pub struct Repository {
    pool: MemPool,
    journal: Journal,
    access: AccessControl,
    store: Box<dyn SidStore>,
    fpindex: FpShortIdTable,
    dirsids: DirShortIdTable,
    copy_gate: CopyGate,
    evaluator: Option<Box<dyn EvaluatorGateway>>,

    stable_lock: RwLock<()>,
    volatile_root_lock: RwLock<()>,

    mutable_sidref: Arc<SidRefCount>,
    root_reps: [AtomicU32; 3],
    root_attribs: [AtomicU32; 3],
    volatile_subtrees: Mutex<FnvHashMap<u32, VolatileSubtree>>,

    fp_threshold: u64,
    unique_counter: AtomicU64,
}

impl Repository {
    // -----------------------------------------------------------------
    // Construction and recovery
    // -----------------------------------------------------------------

    /// Opens (or creates) a repository: loads the latest checkpoint if
    /// one exists, replays the journal, and finishes recovery.
    pub fn open(config: RepositoryConfig) -> std::io::Result<Repository> {
        let repo = Repository {
            pool: MemPool::new(config.pool)?,
            journal: Journal::open(&config.journal_path)?,
            access: AccessControl::new(config.access),
            store: Box::new(FsStore::new(&config.store_root)),
            fpindex: FpShortIdTable::new(),
            dirsids: DirShortIdTable::new(),
            copy_gate: CopyGate::new(),
            evaluator: None,
            stable_lock: RwLock::new(()),
            volatile_root_lock: RwLock::new(()),
            mutable_sidref: Arc::new(SidRefCount::new()),
            root_reps: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
            root_attribs: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
            volatile_subtrees: Mutex::new(FnvHashMap::default()),
            fp_threshold: config.fp_threshold,
            unique_counter: AtomicU64::new(1),
        };

        let loaded = match &config.checkpoint_path {
            Some(path) if path.exists() => {
                let file = std::fs::File::open(path)?;
                let mut input = BufReader::new(file);
                let roots = checkpoint::read_checkpoint(&repo, &mut input, true)?;
                repo.install_roots(&roots);
                true
            }
            _ => false,
        };
        if !loaded {
            repo.init_empty_roots();
        }

        // Replay the journal against the recovered state.
        let log_text = std::fs::read_to_string(&config.journal_path)?;
        if !log_text.is_empty() {
            repo.replay(&log_text);
        }
        repo.recovery_done();
        Ok(repo)
    }

    /// Creates empty roots (first start, or tests).
    fn init_empty_roots(&self) {
        let repo_rep = RepBlock::create(
            &self.pool,
            SourceKind::AppendableDirectory,
            dir::rep::DEFAULT_REP_SIZE,
        );
        repo_rep.set_timestamp(&self.pool, now());
        let mutable_rep = RepBlock::create(
            &self.pool,
            SourceKind::MutableDirectory,
            dir::rep::DEFAULT_REP_SIZE,
        );
        mutable_rep.set_timestamp(&self.pool, now());
        let volatile_rep = RepBlock::create(
            &self.pool,
            SourceKind::VolatileDirectory,
            dir::rep::DEFAULT_REP_SIZE,
        );
        volatile_rep.set_timestamp(&self.pool, now());
        self.root_reps[0].store(repo_rep.0 .0, Ordering::Release);
        self.root_reps[1].store(mutable_rep.0 .0, Ordering::Release);
        self.root_reps[2].store(volatile_rep.0 .0, Ordering::Release);
        for cell in &self.root_attribs {
            cell.store(0, Ordering::Release);
        }
    }

    fn install_roots(&self, roots: &checkpoint::CheckpointRoots) {
        self.root_reps[0].store(roots.repository_rep.0, Ordering::Release);
        self.root_attribs[0].store(roots.repository_attribs.0, Ordering::Release);
        self.root_reps[1].store(roots.mutable_rep.0, Ordering::Release);
        self.root_attribs[1].store(roots.mutable_attribs.0, Ordering::Release);
        if roots.volatile_rep.is_null() {
            let volatile_rep = RepBlock::create(
                &self.pool,
                SourceKind::VolatileDirectory,
                dir::rep::DEFAULT_REP_SIZE,
            );
            self.root_reps[2].store(volatile_rep.0 .0, Ordering::Release);
            self.root_attribs[2].store(0, Ordering::Release);
        } else {
            self.root_reps[2].store(roots.volatile_rep.0, Ordering::Release);
            self.root_attribs[2].store(roots.volatile_attribs.0, Ordering::Release);
        }

        // Derived state from the loaded image.
        self.fpindex.clear();
        self.dirsids.clear();
        self.pool.rebuild_pass(self);
        self.rebuild_volatile_subtrees();
        self.mutable_sidref.clear();
        self.mutable_root().build_sid_refcount(self, &self.mutable_sidref);
    }

    /// Recreates the per-subtree locks and reference counters after a
    /// checkpoint read.
    fn rebuild_volatile_subtrees(&self) {
        let mut subtrees = self.volatile_subtrees.lock();
        subtrees.clear();
        let vroot = self.volatile_root();
        let mut block = RepBlock(vroot.rep);
        let mut raw = 1u32;
        loop {
            for entry in block.entries(&self.pool) {
                let kind = entry.kind(&self.pool);
                if matches!(
                    kind,
                    SourceKind::VolatileDirectory | SourceKind::VolatileROEDirectory
                ) {
                    let sidref = Arc::new(SidRefCount::new());
                    let child = Source::for_rep(kind, ShortPtr(entry.value(&self.pool)));
                    child.build_sid_refcount(self, &sidref);
                    subtrees.insert(
                        raw,
                        VolatileSubtree {
                            lock: Arc::new(RwLock::new(())),
                            sidref,
                        },
                    );
                }
                raw += entry.index_width(&self.pool);
            }
            match block.link_kind(&self.pool) {
                LinkKind::More => block = RepBlock(block.link(&self.pool)),
                _ => break,
            }
        }
    }

    /// Final recovery step: volatile-root identity, logging, counter
    /// verification, and the version bump.
    fn recovery_done(&self) {
        // The volatile root's owner and group are not journaled (they are
        // in the volatile checkpoint region), so re-assert them on every
        // recovery.
        let vroot = self.volatile_root();
        let runtool = self.access.config().runtool_user.clone();
        let admin = self.access.config().admin_group.clone();
        let _ = vroot.write_attrib(self, AttribOp::Set, "#owner", &runtool, None, 0);
        let _ = vroot.write_attrib(self, AttribOp::Set, "#group", &admin, None, 0);

        self.journal.set_enabled(true);

        // The incrementally recovered counter must agree with a fresh
        // walk of the mutable tree; divergence means the journal and the
        // engine disagree about reality, and serving would corrupt.
        let rebuilt = SidRefCount::new();
        self.mutable_root().build_sid_refcount(self, &rebuilt);
        if !rebuilt.compare(&self.mutable_sidref) {
            panic!("mutable-tree shortid refcount rebuild disagrees with recovery");
        }

        if self.journal.version() < MAX_LOG_VERSION {
            self.journal.set_version(MAX_LOG_VERSION);
            self.journal.start();
            self.journal.put(&format!("(vers {MAX_LOG_VERSION})\n"));
            self.commit();
        }
    }

    // -----------------------------------------------------------------
    // Plumbing accessors
    // -----------------------------------------------------------------

    pub fn pool(&self) -> &MemPool {
        &self.pool
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn store(&self) -> &dyn SidStore {
        self.store.as_ref()
    }

    pub fn fpindex(&self) -> &FpShortIdTable {
        &self.fpindex
    }

    pub fn dirsids(&self) -> &DirShortIdTable {
        &self.dirsids
    }

    pub fn copy_gate(&self) -> &CopyGate {
        &self.copy_gate
    }

    pub fn evaluator_gateway(&self) -> Option<&dyn EvaluatorGateway> {
        self.evaluator.as_deref()
    }

    /// Installs the RPC adapter's evaluator gateway.
    pub fn set_evaluator_gateway(&mut self, gateway: Box<dyn EvaluatorGateway>) {
        self.evaluator = Some(gateway);
    }

    pub fn logging(&self) -> bool {
        self.journal.enabled()
    }

    pub fn log_version(&self) -> u32 {
        self.journal.version()
    }

    /// Whether an operation on a directory of this kind journals itself.
    pub fn should_log(&self, kind: SourceKind) -> bool {
        self.journal.enabled()
            && !matches!(
                kind,
                SourceKind::VolatileDirectory | SourceKind::VolatileROEDirectory
            )
    }

    /// Commits the innermost open transaction, releasing deferred
    /// unlinks when it was the outermost one.
    pub fn commit(&self) {
        for sid in self.journal.commit() {
            self.unlink_now(sid);
        }
    }

    /// Unlinks a shortid from the store immediately.
    pub fn unlink_now(&self, sid: ShortId) {
        if sid.is_null() {
            return;
        }
        if let Err(e) = self.store.unlink(sid) {
            log::warn!("unlink of shortid {sid} failed: {e}");
        }
    }

    /// Unlinks now, or at the outermost commit if inside a transaction.
    pub fn queue_unlink(&self, sid: ShortId) {
        if self.journal.nesting() == 0 {
            self.unlink_now(sid);
        } else {
            self.journal.defer_unlink(sid);
        }
    }

    /// A fresh never-repeating fingerprint (for content not fingerprinted
    /// by value).
    pub fn unique_fptag(&self) -> Fingerprint {
        let count = self.unique_counter.fetch_add(1, Ordering::Relaxed);
        Fingerprint::of_text(UNIQUE_PREFIX)
            .extend(&count.to_le_bytes())
            .extend(&now().to_le_bytes())
    }

    /// Reads an attribute chain head.
    pub fn attrib_head(&self, loc: AttribsLoc) -> ShortPtr {
        match loc {
            AttribsLoc::None => ShortPtr::NULL,
            AttribsLoc::Pool(cell) => ShortPtr(self.pool.read_u32(cell)),
            AttribsLoc::RepositoryRoot => self.root_attrib_cell(RootCell::Repository),
            AttribsLoc::MutableRoot => self.root_attrib_cell(RootCell::Mutable),
            AttribsLoc::VolatileRoot => self.root_attrib_cell(RootCell::Volatile),
        }
    }

    /// Writes an attribute chain head.
    pub fn set_attrib_head(&self, loc: AttribsLoc, head: ShortPtr) {
        match loc {
            AttribsLoc::None => debug_assert!(false, "write to a node without attributes"),
            AttribsLoc::Pool(cell) => self.pool.write_u32(cell, head.0),
            AttribsLoc::RepositoryRoot => {
                self.root_attribs[0].store(head.0, Ordering::Release)
            }
            AttribsLoc::MutableRoot => self.root_attribs[1].store(head.0, Ordering::Release),
            AttribsLoc::VolatileRoot => self.root_attribs[2].store(head.0, Ordering::Release),
        }
    }

    pub fn root_attrib_cell(&self, cell: RootCell) -> ShortPtr {
        ShortPtr(self.root_attribs[cell.index()].load(Ordering::Acquire))
    }

    pub fn root_rep(&self, cell: RootCell) -> ShortPtr {
        ShortPtr(self.root_reps[cell.index()].load(Ordering::Acquire))
    }

    // -----------------------------------------------------------------
    // Roots
    // -----------------------------------------------------------------

    fn root_ac(&self, loc: AttribsLoc, default_mode: u32) -> NodeAc {
        let head = self.attrib_head(loc);
        let owners = attrib::get_attrib_values(&self.pool, head, "#owner");
        let groups = attrib::get_attrib_values(&self.pool, head, "#group");
        let mode = attrib::get_attrib(&self.pool, head, "#mode")
            .map(|m| crate::access::parse_mode_bits(&m))
            .unwrap_or(default_mode);
        NodeAc {
            owners,
            groups,
            mode,
        }
    }

    /// The appendable repository root.
    pub fn repository_root(&self) -> Source {
        let mut node = Source::for_rep(
            SourceKind::AppendableDirectory,
            self.root_rep(RootCell::Repository),
        );
        node.longid = LongId::ROOT;
        node.master = true;
        node.pseudo_inode = 1;
        node.fptag = Fingerprint::of_text("(PATHNAME)/repo");
        node.attribs = AttribsLoc::RepositoryRoot;
        node.ac = self.root_ac(AttribsLoc::RepositoryRoot, 0o755);
        node
    }

    /// The mutable (workspace) root.
    pub fn mutable_root(&self) -> Source {
        let mut node =
            Source::for_rep(SourceKind::MutableDirectory, self.root_rep(RootCell::Mutable));
        node.longid = LongId::MUTABLE_ROOT;
        node.master = true;
        node.pseudo_inode = 2;
        node.attribs = AttribsLoc::MutableRoot;
        node.ac = self.root_ac(AttribsLoc::MutableRoot, 0o755);
        node.sidref = Some(self.mutable_sidref.clone());
        node
    }

    /// The volatile root (its children are the per-session subtrees).
    pub fn volatile_root(&self) -> Source {
        let mut node =
            Source::for_rep(SourceKind::VolatileDirectory, self.root_rep(RootCell::Volatile));
        node.longid = LongId::VOLATILE_ROOT;
        node.master = true;
        node.pseudo_inode = 3;
        node.attribs = AttribsLoc::VolatileRoot;
        node.ac = self.root_ac(AttribsLoc::VolatileRoot, 0o755);
        node
    }

    // -----------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------

    /// Resolves a longid to a node, acquiring the lock the caller asked
    /// for. Returns `None` when the longid does not name anything (the
    /// lock is released on that path).
    pub fn lookup(&self, longid: &LongId, kind: LockKind) -> Option<(Source, Lock<'_>)> {
        match longid.root_kind() {
            RootKind::Null => None,
            RootKind::Repository => {
                let lock = self.stable_lock_for(kind)?;
                let node = self.walk(self.repository_root(), longid)?;
                Some((node, lock))
            }
            RootKind::Mutable => {
                let lock = self.stable_lock_for(kind)?;
                let node = self.walk(self.mutable_root(), longid)?;
                Some((node, lock))
            }
            RootKind::Volatile => self.lookup_volatile(longid, kind),
            RootKind::DirShortId => {
                let lock = self.stable_lock_for(kind)?;
                let sid = longid.embedded_shortid()?;
                if !sid.is_dir() {
                    return None;
                }
                let rep = self.dirsids.get(sid);
                if rep.is_null() {
                    return None;
                }
                let mut node = Source::for_rep(SourceKind::ImmutableDirectory, rep);
                node.longid = LongId::from_shortid(sid, None);
                node.master = true;
                node.fptag = RepBlock(rep).fptag(&self.pool);
                node.pseudo_inode = sid.0;
                node.ac = NodeAc {
                    owners: Vec::new(),
                    groups: Vec::new(),
                    mode: 0o555,
                };
                let node = self.walk(node, longid)?;
                Some((node, lock))
            }
            RootKind::FileShortId => {
                // Direct file reference: no lock, no attributes. Assumed
                // mutable by default; the frontier corrects if needed.
                let sid = longid.embedded_shortid()?;
                if sid.is_dir() {
                    return None;
                }
                let mut node = Source::for_leaf(SourceKind::MutableFile, sid);
                node.longid = *longid;
                node.master = true;
                node.fptag = longid.embedded_fingerprint();
                node.pseudo_inode = sid.0;
                node.ac = NodeAc {
                    owners: Vec::new(),
                    groups: Vec::new(),
                    mode: 0o666,
                };
                Some((node, Lock::None))
            }
        }
    }

    fn stable_lock_for(&self, kind: LockKind) -> Option<Lock<'_>> {
        Some(match kind {
            LockKind::Read | LockKind::ReadV => Lock::StableRead(self.stable_lock.read()),
            LockKind::Write | LockKind::WriteV => Lock::StableWrite(self.stable_lock.write()),
            LockKind::Check | LockKind::None => Lock::None,
        })
    }

    fn lookup_volatile(&self, longid: &LongId, kind: LockKind) -> Option<(Source, Lock<'_>)> {
        let mut indices = longid.indices();
        let Some(first) = indices.next() else {
            // The volatile root itself.
            let lock = match kind {
                LockKind::Read => Lock::VolatileRead(self.volatile_root_lock.read()),
                LockKind::Write => Lock::VolatileWrite(self.volatile_root_lock.write()),
                _ => Lock::None,
            };
            return Some((self.volatile_root(), lock));
        };

        // Hold the root lock only across the subtree resolution; the
        // subtree's own lock protects the rest of the walk.
        let root_guard = match kind {
            LockKind::Read | LockKind::Write => Some(self.volatile_root_lock.read()),
            _ => None,
        };
        let resolved = self.volatile_subtree(first, kind);
        drop(root_guard);
        let (subtree, lock) = resolved?;

        let mut node = subtree;
        for index in indices {
            let (child, _) = node.lookup_index(self, index).ok()?;
            node = child;
        }
        Some((node, lock))
    }

    /// Resolves one volatile-root child and takes its subtree lock.
    fn volatile_subtree(&self, index: u32, kind: LockKind) -> Option<(Source, Lock<'_>)> {
        if index & 1 == 0 {
            return None;
        }
        let raw = (index + 1) >> 1;
        let side = self.volatile_subtrees.lock().get(&raw).cloned()?;
        let lock = match kind {
            LockKind::Read | LockKind::ReadV => Lock::SubtreeRead(side.lock.read_arc()),
            LockKind::Write | LockKind::WriteV => Lock::SubtreeWrite(side.lock.write_arc()),
            LockKind::Check | LockKind::None => Lock::None,
        };
        let vroot = self.volatile_root();
        let (mut node, _) = vroot.lookup_index(self, index).ok()?;
        node.sidref = Some(side.sidref.clone());
        Some((node, lock))
    }

    fn walk(&self, node: Source, longid: &LongId) -> Option<Source> {
        self.walk_depth(node, longid, 0)
    }

    fn walk_depth(&self, mut node: Source, longid: &LongId, depth: usize) -> Option<Source> {
        for index in longid.indices() {
            let (child, _) = node.lookup_index_depth(self, index, depth).ok()?;
            node = child;
        }
        Some(node)
    }

    /// Lock-free resolution for internal callers (forwarding pointers).
    /// `depth` bounds chained forwards across the whole resolution.
    pub fn lookup_unlocked(&self, longid: &LongId, depth: usize) -> Option<Source> {
        if depth > MAX_FOLLOW_DEPTH {
            return None;
        }
        match longid.root_kind() {
            RootKind::Repository => self.walk_depth(self.repository_root(), longid, depth),
            RootKind::Mutable => self.walk_depth(self.mutable_root(), longid, depth),
            _ => self.lookup(longid, LockKind::None).map(|(node, _)| node),
        }
    }

    // -----------------------------------------------------------------
    // Volatile subtree management
    // -----------------------------------------------------------------

    /// Creates a volatile subtree for an evaluator session, returning
    /// its longid. Not journaled; volatile state dies with the session
    /// (but survives a checkpointed restart).
    pub fn create_volatile_directory(
        &self,
        host: &str,
        port: &str,
        handle: u64,
        read_only_existing: bool,
    ) -> Result<LongId> {
        let _guard = self.volatile_root_lock.write();
        let pool = &self.pool;
        let vroot = self.volatile_root();

        let kind = if read_only_existing {
            SourceKind::VolatileROEDirectory
        } else {
            SourceKind::VolatileDirectory
        };
        let raw = vroot.next_raw_index(pool);
        let index = 2 * raw - 1;
        let longid = LongId::VOLATILE_ROOT.append(index);
        if longid.is_null() {
            return Err(RepositoryError::LongIdOverflow);
        }

        let timestamp = now();
        let base = EvalDir::create(pool, host, port, handle, timestamp);
        let block = RepBlock::create(pool, kind, dir::rep::DEFAULT_REP_SIZE);
        block.set_timestamp(pool, timestamp);
        block.set_id(pool, vroot.index_to_pseudo_inode(index));
        block.set_link(pool, LinkKind::Base, base.0);

        let arc = index.to_string();
        vroot.append_entry(
            pool,
            true,
            false,
            kind,
            block.0 .0,
            ShortPtr::NULL,
            None,
            arc.as_bytes(),
        );
        self.volatile_subtrees.lock().insert(
            raw,
            VolatileSubtree {
                lock: Arc::new(RwLock::new(())),
                sidref: Arc::new(SidRefCount::new()),
            },
        );
        Ok(longid)
    }

    /// Tears down a volatile subtree, reclaiming its pool state and
    /// poisoning the evaluator session shared by its surrogates.
    pub fn delete_volatile_directory(&self, index: u32) -> Result<()> {
        let _guard = self.volatile_root_lock.write();
        let pool = &self.pool;
        if index & 1 == 0 {
            return Err(RepositoryError::Inappropriate);
        }
        let raw = (index + 1) >> 1;
        let side = self
            .volatile_subtrees
            .lock()
            .remove(&raw)
            .ok_or(RepositoryError::NotFound)?;
        let vroot = self.volatile_root();
        let entry = vroot
            .find_raw_index(pool, raw)
            .ok_or(RepositoryError::NotFound)?;
        let kind = entry.kind(pool);
        if !matches!(
            kind,
            SourceKind::VolatileDirectory | SourceKind::VolatileROEDirectory
        ) {
            return Err(RepositoryError::NotFound);
        }
        // Exclusive access to the interior before tearing it down.
        let _subtree_guard = side.lock.write();
        let mut subtree = Source::for_rep(kind, ShortPtr(entry.value(pool)));
        subtree.sidref = Some(side.sidref.clone());
        let base = subtree.base_rep(pool);
        if !base.is_null() {
            EvalDir(base).poison(pool);
        }
        subtree.free_tree(self);
        entry.overwrite(pool, true, false, SourceKind::Outdated, 0, ShortPtr::NULL, None);
        vroot.resync();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Cross-directory drivers
    // -----------------------------------------------------------------

    /// Copy-on-write entry point: makes the node named by `longid`
    /// mutable, making parents mutable as needed on the way down.
    ///
    /// Concurrent callers for the same source file coalesce on the copy
    /// gate so exactly one physical copy happens.
    pub fn make_mutable(
        &self,
        node: &Source,
        sid: ShortId,
        copy_max: u64,
        who: Option<&Identity>,
    ) -> Result<Source> {
        if !self.access.check(who, AccessClass::Write, &node.ac) {
            return Err(RepositoryError::NoPermission);
        }
        if !(LongId::MUTABLE_ROOT.is_ancestor_of(&node.longid)
            || LongId::VOLATILE_ROOT.is_ancestor_of(&node.longid))
        {
            return Err(RepositoryError::Inappropriate);
        }
        let (parent_id, index) = node.longid.parent().ok_or(RepositoryError::Inappropriate)?;
        let parent = self
            .lookup_unlocked(&parent_id, 0)
            .ok_or(RepositoryError::Inappropriate)?;
        let parent = if matches!(
            parent.kind,
            SourceKind::ImmutableDirectory
                | SourceKind::EvaluatorDirectory
                | SourceKind::EvaluatorROEDirectory
        ) {
            self.make_mutable(&parent, NULL_SHORTID, u64::MAX, who)?
        } else {
            parent
        };

        if node.kind == SourceKind::ImmutableFile && sid.is_null() {
            // Serialize per source shortid: one thread copies, the rest
            // re-check after it finishes.
            self.copy_gate.enter(node.sid);
            let result = parent.make_index_mutable(self, index, sid, copy_max, who);
            self.copy_gate.finish(node.sid);
            result
        } else {
            parent.make_index_mutable(self, index, sid, copy_max, who)
        }
    }

    /// Copies a node from an immutable base into its mutable parent (so
    /// it can carry attributes), making parents mutable as needed.
    pub fn copy_to_mutable(&self, node: &Source, who: Option<&Identity>) -> Result<Source> {
        if !self.access.check(who, AccessClass::Write, &node.ac) {
            return Err(RepositoryError::NoPermission);
        }
        if !LongId::MUTABLE_ROOT.is_ancestor_of(&node.longid) {
            return Err(RepositoryError::Inappropriate);
        }
        let (parent_id, index) = node.longid.parent().ok_or(RepositoryError::Inappropriate)?;
        let parent = self
            .lookup_unlocked(&parent_id, 0)
            .ok_or(RepositoryError::Inappropriate)?;
        let parent = if parent.kind != SourceKind::MutableDirectory {
            self.make_mutable(&parent, NULL_SHORTID, u64::MAX, who)?
        } else {
            parent
        };
        parent.copy_index_to_mutable(self, index, who)
    }

    /// Seals every mutable file under `dir` (recursively), fingerprinting
    /// contents below the configured threshold.
    pub fn make_files_immutable(&self, dir: &Source, who: Option<&Identity>) -> Result<()> {
        if !self.access.check(who, AccessClass::Write, &dir.ac) {
            return Err(RepositoryError::NoPermission);
        }
        if !matches!(
            dir.kind,
            SourceKind::MutableDirectory
                | SourceKind::VolatileDirectory
                | SourceKind::VolatileROEDirectory
        ) {
            return Err(RepositoryError::Inappropriate);
        }
        self.seal_tree(dir);
        Ok(())
    }

    fn seal_tree(&self, dir: &Source) {
        let pool = &self.pool;
        let mut block = RepBlock(dir.rep);
        let mut raw = 1u32;
        loop {
            for entry in block.entries(pool) {
                match entry.kind(pool) {
                    SourceKind::MutableFile => {
                        dir.seal_entry(self, entry, 2 * raw - 1, self.fp_threshold, None);
                    }
                    SourceKind::MutableDirectory
                    | SourceKind::VolatileDirectory
                    | SourceKind::VolatileROEDirectory => {
                        let mut child =
                            Source::for_rep(entry.kind(pool), ShortPtr(entry.value(pool)));
                        child.longid = dir.longid.append(2 * raw - 1);
                        child.sidref = dir.sidref.clone();
                        if child.longid.is_null() {
                            log::warn!(
                                "skipping seal of deeply nested directory \"{}\" in {}",
                                entry.arc_string(pool),
                                dir.longid
                            );
                        } else {
                            self.seal_tree(&child);
                        }
                    }
                    _ => {}
                }
                raw += entry.index_width(pool);
            }
            match block.link_kind(pool) {
                LinkKind::More => block = RepBlock(block.link(pool)),
                _ => break,
            }
        }
    }

    /// Resolves `$LAST`: the largest all-digits arc (no leading zeros)
    /// visible in `dir`.
    pub fn resolve_last_arc(&self, dir: &Source, who: Option<&Identity>) -> Result<Option<String>> {
        let mut best: Option<(u64, String)> = None;
        dir.list(
            self,
            0,
            &mut |item| {
                let arc = &item.arc;
                let numeric = !arc.is_empty()
                    && arc.bytes().all(|b| b.is_ascii_digit())
                    && (arc.len() == 1 || !arc.starts_with('0'));
                if numeric {
                    if let Ok(value) = arc.parse::<u64>() {
                        if best.as_ref().map(|(b, _)| value > *b).unwrap_or(true) {
                            best = Some((value, arc.clone()));
                        }
                    }
                }
                true
            },
            who,
            false,
            0,
        )?;
        Ok(best.map(|(_, arc)| arc))
    }

    // -----------------------------------------------------------------
    // Garbage collection and checkpointing
    // -----------------------------------------------------------------

    /// Runs one mark/sweep over the pool, keeping (besides the roots)
    /// the immutable directories named in `keep_derived`.
    pub fn gc(&self, keep_derived: &[ShortId]) {
        let _stable = self.stable_lock.write();
        let _volatile = self.volatile_root_lock.write();
        self.fpindex.clear();
        self.dirsids.clear();
        self.pool.gc(self, keep_derived);
    }

    /// Writes a checkpoint to `path`, then reloads it (checkpointing
    /// consumes the in-memory image), and truncates the journal.
    pub fn checkpoint(&self, path: &std::path::Path) -> std::io::Result<()> {
        let _stable = self.stable_lock.write();
        let _volatile = self.volatile_root_lock.write();

        let tmp = path.with_extension("ckp-tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            checkpoint::write_checkpoint(self, &mut file)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;

        let file = std::fs::File::open(path)?;
        let mut input = BufReader::new(file);
        let roots = checkpoint::read_checkpoint(self, &mut input, true)?;
        self.install_roots(&roots);
        self.journal.truncate()?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Journal replay
    // -----------------------------------------------------------------

    /// Replays journal text against the current state with logging off.
    /// Any failure is corruption and panics (recovery cannot proceed).
    fn replay(&self, text: &str) {
        self.journal.set_enabled(false);
        let mut reader = RecordReader::new(text);
        while let Some(tag) = reader.open_record() {
            self.replay_record(&tag, &mut reader);
            reader.close_record();
        }
    }

    fn replay_node(&self, longid: &LongId, tag: &str) -> Source {
        match self.lookup_unlocked(longid, 0) {
            Some(node) => node,
            None => panic!("recovery failed: invalid longid in \"{tag}\": {longid}"),
        }
    }

    fn replay_record(&self, tag: &str, reader: &mut RecordReader) {
        match tag {
            "vers" => {
                let version = reader.integer() as u32;
                if version > MAX_LOG_VERSION {
                    panic!(
                        "journal version {version} is newer than this server \
                         (max {MAX_LOG_VERSION})"
                    );
                }
                self.journal.set_version(version);
            }
            "del" => {
                let longid = reader.longid();
                let arc = reader.quoted();
                let ts = reader.timestamp();
                let node = self.replay_node(&longid, tag);
                node.really_delete(self, &arc, None, false, ts)
                    .unwrap_or_else(|e| panic!("recovery failed: del {longid} {arc}: {e}"));
            }
            "insf" => {
                let longid = reader.longid();
                let arc = reader.quoted();
                let sid = reader.shortid();
                let master = reader.boolean();
                let ts = reader.timestamp();
                let fptag = (!reader.at_close()).then(|| reader.fingerprint());
                let node = self.replay_node(&longid, tag);
                node.insert_file(
                    self,
                    &arc,
                    sid,
                    master,
                    None,
                    DupeCheck::ReplaceDiff,
                    ts,
                    fptag.as_ref(),
                )
                .unwrap_or_else(|e| panic!("recovery failed: insf {longid} {arc}: {e}"));
            }
            "insu" => {
                let longid = reader.longid();
                let arc = reader.quoted();
                let sid = reader.shortid();
                let master = reader.boolean();
                let ts = reader.timestamp();
                let node = self.replay_node(&longid, tag);
                node.insert_mutable_file(self, &arc, sid, master, None, DupeCheck::ReplaceDiff, ts)
                    .unwrap_or_else(|e| panic!("recovery failed: insu {longid} {arc}: {e}"));
            }
            "insi" => {
                let longid = reader.longid();
                let arc = reader.quoted();
                let child_longid = reader.longid();
                let master = reader.boolean();
                let ts = reader.timestamp();
                let fptag = (!reader.at_close()).then(|| reader.fingerprint());
                let node = self.replay_node(&longid, tag);
                let child = if child_longid.is_null() {
                    None
                } else {
                    Some(self.replay_node(&child_longid, tag))
                };
                node.insert_immutable_directory(
                    self,
                    &arc,
                    child.as_ref(),
                    master,
                    None,
                    DupeCheck::ReplaceDiff,
                    ts,
                    fptag.as_ref(),
                )
                .unwrap_or_else(|e| panic!("recovery failed: insi {longid} {arc}: {e}"));
            }
            "insm" => {
                let longid = reader.longid();
                let arc = reader.quoted();
                let child_longid = reader.longid();
                let master = reader.boolean();
                let ts = reader.timestamp();
                let node = self.replay_node(&longid, tag);
                let child = if child_longid.is_null() {
                    None
                } else {
                    Some(self.replay_node(&child_longid, tag))
                };
                node.insert_mutable_directory(
                    self,
                    &arc,
                    child.as_ref(),
                    master,
                    None,
                    DupeCheck::ReplaceDiff,
                    ts,
                )
                .unwrap_or_else(|e| panic!("recovery failed: insm {longid} {arc}: {e}"));
            }
            "insa" | "insg" | "inss" => {
                let longid = reader.longid();
                let arc = reader.quoted();
                let master = reader.boolean();
                let ts = reader.timestamp();
                let node = self.replay_node(&longid, tag);
                let result = match tag {
                    "insa" => node.insert_appendable_directory(
                        self,
                        &arc,
                        master,
                        None,
                        DupeCheck::ReplaceDiff,
                        ts,
                    ),
                    "insg" => {
                        node.insert_ghost(self, &arc, master, None, DupeCheck::ReplaceDiff, ts)
                    }
                    _ => node.insert_stub(self, &arc, master, None, DupeCheck::ReplaceDiff, ts),
                };
                result.unwrap_or_else(|e| panic!("recovery failed: {tag} {longid} {arc}: {e}"));
            }
            "ren" => {
                let to_longid = reader.longid();
                let to_arc = reader.quoted();
                let from_longid = reader.longid();
                let from_arc = reader.quoted();
                let ts = reader.timestamp();
                let to = self.replay_node(&to_longid, tag);
                let from = self.replay_node(&from_longid, tag);
                to.rename_to(self, &to_arc, &from, &from_arc, None, DupeCheck::ReplaceDiff, ts)
                    .unwrap_or_else(|e| {
                        panic!("recovery failed: ren {to_longid} {to_arc}: {e}")
                    });
            }
            "makm" => {
                let longid = reader.longid();
                let index = reader.integer() as u32;
                let sid = reader.shortid();
                let node = self.replay_node(&longid, tag);
                node.make_index_mutable(self, index, sid, u64::MAX, None)
                    .unwrap_or_else(|e| panic!("recovery failed: makm {longid} {index}: {e}"));
            }
            "maki" => {
                let longid = reader.longid();
                let index = reader.integer() as u32;
                let fptag = (!reader.at_close()).then(|| reader.fingerprint());
                let sid = if reader.at_close() {
                    NULL_SHORTID
                } else {
                    reader.shortid()
                };
                let node = self.replay_node(&longid, tag);
                node.make_index_immutable(self, index, fptag.as_ref(), sid)
                    .unwrap_or_else(|e| panic!("recovery failed: maki {longid} {index}: {e}"));
            }
            "copy2m" => {
                let longid = reader.longid();
                let index = reader.integer() as u32;
                let node = self.replay_node(&longid, tag);
                node.copy_index_to_mutable(self, index, None)
                    .unwrap_or_else(|e| panic!("recovery failed: copy2m {longid} {index}: {e}"));
            }
            "mast" => {
                let longid = reader.longid();
                let index = reader.integer() as u32;
                let state = reader.boolean();
                let node = self.replay_node(&longid, tag);
                node.set_index_master(self, index, state, None)
                    .unwrap_or_else(|e| panic!("recovery failed: mast {longid} {index}: {e}"));
            }
            "attr" => {
                let longid = reader.longid();
                let op = AttribOp::from_u8(reader.integer() as u8)
                    .unwrap_or_else(|| panic!("recovery failed: bad attr op"));
                let name = reader.quoted();
                let value = reader.quoted();
                let ts = reader.timestamp();
                let node = self.replay_node(&longid, tag);
                if !node.attribs.has_attribs()
                    && LongId::MUTABLE_ROOT.is_ancestor_of(&node.longid)
                {
                    // An old server could log attribute writes on objects
                    // in an immutable base; nothing can be done now.
                    log::warn!(
                        "skipping replay of attribute write on attribute-less \
                         node {longid}"
                    );
                } else {
                    match node.write_attrib(self, op, &name, &value, None, ts) {
                        Ok(_) | Err(RepositoryError::NameInUse) => {}
                        Err(e) => panic!("recovery failed: attr {longid} {name}: {e}"),
                    }
                }
            }
            "time" => {
                let longid = reader.longid();
                let ts = reader.timestamp();
                let node = self.replay_node(&longid, tag);
                node.set_dir_timestamp(self, ts, None)
                    .unwrap_or_else(|e| panic!("recovery failed: time {longid}: {e}"));
            }
            "colb" => {
                let longid = reader.longid();
                let node = self.replay_node(&longid, tag);
                node.collapse_base(self, None)
                    .unwrap_or_else(|e| panic!("recovery failed: colb {longid}: {e}"));
            }
            other => panic!("recovery failed: unknown record tag {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pool hooks
// ---------------------------------------------------------------------------

impl PoolHooks for Repository {
    fn mark_roots(&self, keep_derived: &[ShortId]) {
        self.repository_root().mark(self);
        self.mutable_root().mark(self);
        self.volatile_root().mark(self);
        for cell in [RootCell::Repository, RootCell::Mutable, RootCell::Volatile] {
            let head = self.root_attrib_cell(cell);
            if !head.is_null() {
                crate::attrib::AttrRec(head).mark(&self.pool);
            }
        }
        for &sid in keep_derived {
            let rep = self.dirsids.get(sid);
            if !rep.is_null() {
                Source::for_rep(SourceKind::ImmutableDirectory, rep).mark(self);
            }
        }
    }

    fn block_size(&self, kind: BlockKind, sp: ShortPtr) -> u32 {
        match kind {
            BlockKind::DirInner | BlockKind::DirImmutable | BlockKind::DirAppendable => {
                gc::block_size(&self.pool, sp)
            }
            BlockKind::Forward => crate::forward::FORWARD_SIZE,
            BlockKind::Attrib => crate::attrib::AttrRec(sp).size(&self.pool),
            BlockKind::DirEvaluator => crate::evaluator::block_size(&self.pool, sp),
            BlockKind::FreeByte | BlockKind::FreeBlock => {
                unreachable!("free space is handled by the pool itself")
            }
        }
    }

    fn rebuild(&self, kind: BlockKind, sp: ShortPtr) {
        if matches!(
            kind,
            BlockKind::DirInner | BlockKind::DirImmutable | BlockKind::DirAppendable
        ) {
            gc::rebuild(self, kind, sp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::create_with_contents;

    fn open_repo(dir: &tempfile::TempDir) -> Repository {
        let mut config = RepositoryConfig::under(dir.path());
        config.pool = PoolConfig {
            soft_limit: 48 << 20,
            hard_limit: 64 << 20,
            min_grow: 64 << 10,
        };
        Repository::open(config).unwrap()
    }

    fn listing(repo: &Repository, dir: &Source) -> Vec<(String, SourceKind)> {
        let mut rows = Vec::new();
        dir.list(
            repo,
            0,
            &mut |item| {
                rows.push((item.arc.clone(), item.kind));
                true
            },
            None,
            false,
            0,
        )
        .unwrap();
        rows
    }

    fn new_workdir(repo: &Repository, arc: &str) -> Source {
        repo.mutable_root()
            .insert_mutable_directory(
                repo,
                arc,
                None,
                true,
                None,
                DupeCheck::DontReplace,
                0,
            )
            .unwrap()
    }

    #[test]
    fn fresh_repository_has_empty_roots() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        assert!(listing(&repo, &repo.repository_root()).is_empty());
        assert!(listing(&repo, &repo.mutable_root()).is_empty());
        assert_eq!(repo.log_version(), MAX_LOG_VERSION);
    }

    #[test]
    fn insert_then_lookup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let work = new_workdir(&repo, "work");
        let sid = create_with_contents(repo.store(), b"contents").unwrap();
        work.insert_mutable_file(&repo, "file", sid, true, None, DupeCheck::DontReplace, 0)
            .unwrap();

        let found = work.lookup(&repo, "file", None).unwrap();
        assert_eq!(found.kind, SourceKind::MutableFile);
        assert_eq!(found.sid, sid);

        // The node's longid resolves back to the same entry.
        let via_longid = repo.lookup_unlocked(&found.longid, 0).unwrap();
        assert_eq!(via_longid.sid, sid);
        assert_eq!(via_longid.longid, found.longid);

        assert_eq!(
            work.lookup(&repo, "missing", None).unwrap_err(),
            RepositoryError::NotFound
        );
    }

    #[test]
    fn duplicate_insert_is_name_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let work = new_workdir(&repo, "work");
        let sid = create_with_contents(repo.store(), b"x").unwrap();
        work.insert_mutable_file(&repo, "f", sid, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        let sid2 = create_with_contents(repo.store(), b"y").unwrap();
        assert_eq!(
            work.insert_mutable_file(&repo, "f", sid2, true, None, DupeCheck::DontReplace, 0)
                .unwrap_err(),
            RepositoryError::NameInUse
        );
    }

    #[test]
    fn insert_then_seal() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let work = new_workdir(&repo, "work");
        let sid = create_with_contents(repo.store(), b"hello").unwrap();
        work.insert_mutable_file(&repo, "f", sid, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        assert_eq!(work.sidref.as_ref().unwrap().count(sid), 1);

        repo.make_files_immutable(&work, None).unwrap();

        let sealed = work.lookup(&repo, "f", None).unwrap();
        assert_eq!(sealed.kind, SourceKind::ImmutableFile);
        let expected = Fingerprint::of_text("TextDhello");
        assert_eq!(sealed.fptag, expected);
        assert_eq!(repo.fpindex().get(&expected), sid);
        assert_eq!(work.sidref.as_ref().unwrap().count(sid), 0);
    }

    #[test]
    fn sealing_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let work = new_workdir(&repo, "work");
        let sid = create_with_contents(repo.store(), b"same").unwrap();
        work.insert_mutable_file(&repo, "f", sid, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        repo.make_files_immutable(&work, None).unwrap();
        let first = work.lookup(&repo, "f", None).unwrap();
        repo.make_files_immutable(&work, None).unwrap();
        let second = work.lookup(&repo, "f", None).unwrap();
        assert_eq!(first.kind, second.kind);
        assert_eq!(first.sid, second.sid);
        assert_eq!(first.fptag, second.fptag);
    }

    #[test]
    fn sealing_deduplicates_content() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let work = new_workdir(&repo, "work");
        let sid_a = create_with_contents(repo.store(), b"same bytes").unwrap();
        let sid_b = create_with_contents(repo.store(), b"same bytes").unwrap();
        work.insert_mutable_file(&repo, "a", sid_a, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        work.insert_mutable_file(&repo, "b", sid_b, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        repo.make_files_immutable(&work, None).unwrap();
        let a = work.lookup(&repo, "a", None).unwrap();
        let b = work.lookup(&repo, "b", None).unwrap();
        assert_eq!(a.fptag, b.fptag);
        // The second seal redirected to the first shortid.
        assert_eq!(a.sid, b.sid);
    }

    #[test]
    fn rename_preserves_longid_via_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let work = new_workdir(&repo, "work");
        let sid = create_with_contents(repo.store(), b"payload").unwrap();
        let a = work
            .insert_mutable_file(&repo, "a", sid, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        let old_longid = a.longid;

        work.rename_to(&repo, "b", &work, "a", None, DupeCheck::DontReplace, 0)
            .unwrap();
        work.resync();

        assert_eq!(
            work.lookup(&repo, "a", None).unwrap_err(),
            RepositoryError::NotFound
        );
        let b = work.lookup(&repo, "b", None).unwrap();
        assert_eq!(b.sid, sid);

        // The pre-rename longid still resolves, to the node now at b.
        let via_old = repo.lookup_unlocked(&old_longid, 0).unwrap();
        assert_eq!(via_old.sid, sid);
        assert_eq!(via_old.kind, SourceKind::MutableFile);
    }

    #[test]
    fn rename_rejects_ancestor_loop() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let outer = new_workdir(&repo, "outer");
        let inner = outer
            .insert_mutable_directory(&repo, "inner", None, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        // Moving "outer" into its own child must fail.
        assert_eq!(
            inner
                .rename_to(
                    &repo,
                    "moved",
                    &repo.mutable_root(),
                    "outer",
                    None,
                    DupeCheck::DontReplace,
                    0,
                )
                .unwrap_err(),
            RepositoryError::InvalidArgs
        );
    }

    /// Gateway for sessions whose evaluator holds an empty directory.
    struct EmptyEvaluator;

    impl crate::evaluator::EvaluatorGateway for EmptyEvaluator {
        fn lookup(
            &self,
            _session: &crate::evaluator::EvalSession,
            _arc: &str,
        ) -> Result<Option<crate::evaluator::EvalEntry>> {
            Ok(None)
        }

        fn list(
            &self,
            _session: &crate::evaluator::EvalSession,
            _first_index: u32,
        ) -> Result<Vec<crate::evaluator::EvalEntry>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn hard_link_then_delete_each() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = open_repo(&dir);
        repo.set_evaluator_gateway(Box::new(EmptyEvaluator));
        let longid = repo
            .create_volatile_directory("evalhost", "9000", 7, false)
            .unwrap();
        let (vdir, _lock) = repo.lookup(&longid, LockKind::Write).unwrap();
        let sidref = vdir.sidref.clone().unwrap();

        let sid = create_with_contents(repo.store(), b"linked").unwrap();
        vdir.insert_mutable_file(&repo, "x", sid, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        vdir.insert_mutable_file(&repo, "y", sid, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        assert_eq!(sidref.count(sid), 2);

        vdir.really_delete(&repo, "x", None, true, 0).unwrap();
        assert_eq!(sidref.count(sid), 1);
        assert!(repo.store().size(sid).is_ok());

        vdir.really_delete(&repo, "y", None, true, 0).unwrap();
        assert_eq!(sidref.count(sid), 0);
        assert!(repo.store().size(sid).is_err());
    }

    #[test]
    fn delete_leaves_ghost_in_master_appendable() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let root = repo.repository_root();
        root.insert_appendable_directory(&repo, "proj", true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        root.resync();
        root.really_delete(&repo, "proj", None, true, 0).unwrap();
        root.resync();
        let ghost = root.lookup(&repo, "proj", None).unwrap();
        assert_eq!(ghost.kind, SourceKind::Ghost);
    }

    #[test]
    fn attribute_canonicalization_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let work = new_workdir(&repo, "work");
        work.write_attrib(&repo, AttribOp::Add, "k", "v1", None, 0).unwrap();
        work.write_attrib(&repo, AttribOp::Add, "k", "v2", None, 0).unwrap();
        work.write_attrib(&repo, AttribOp::Remove, "k", "v1", None, 0).unwrap();
        work.write_attrib(&repo, AttribOp::Set, "k", "v3", None, 0).unwrap();

        let head = repo.attrib_head(work.attribs);
        let values = attrib::get_attrib_values(&repo.pool, head, "k");
        assert_eq!(values, vec!["v3".to_string()]);
        let history = attrib::get_history(&repo.pool, head);
        let for_k: Vec<_> = history.iter().filter(|h| h.1 == "k").collect();
        assert_eq!(for_k.len(), 1);
        assert_eq!(for_k[0].0, AttribOp::Set);
    }

    #[test]
    fn overflow_insert_fails_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let mut node = new_workdir(&repo, "deep");
        loop {
            match node.insert_mutable_directory(
                &repo,
                "d",
                None,
                true,
                None,
                DupeCheck::DontReplace,
                0,
            ) {
                Ok(child) => node = child,
                Err(RepositoryError::LongIdOverflow) => break,
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        // The overflowing insert left no entry behind.
        assert_eq!(
            node.lookup(&repo, "d", None).unwrap_err(),
            RepositoryError::NotFound
        );
    }

    #[test]
    fn deep_nesting_snapshot_drops_overflow_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);

        // A chain that fits comfortably on its own.
        let top_a = new_workdir(&repo, "a");
        let mut tail_a = top_a.clone();
        let mut depth_a = 1usize;
        for _ in 0..12 {
            tail_a = tail_a
                .insert_mutable_directory(&repo, "d", None, true, None, DupeCheck::DontReplace, 0)
                .unwrap();
            depth_a += 1;
        }

        // A second chain built until just before its names fill up.
        let top_b = new_workdir(&repo, "b");
        let mut chain_b = vec![top_b.clone()];
        loop {
            let tail = chain_b.last().unwrap();
            match tail.insert_mutable_directory(
                &repo,
                "d",
                None,
                true,
                None,
                DupeCheck::DontReplace,
                0,
            ) {
                Ok(child) => chain_b.push(child),
                Err(RepositoryError::LongIdOverflow) => break,
                Err(other) => panic!("unexpected error {other}"),
            }
        }

        // Moving chain A under the deepest level of chain B that still
        // has room pushes A's lower levels past the longid envelope.
        let mut host = None;
        for node in chain_b.iter().rev() {
            match node.rename_to(
                &repo,
                "moved",
                &repo.mutable_root(),
                "a",
                None,
                DupeCheck::DontReplace,
                0,
            ) {
                Ok(()) => {
                    host = Some(node.clone());
                    break;
                }
                Err(RepositoryError::LongIdOverflow) => continue,
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        let host = host.expect("some level of chain B can host the rename");

        let sealed = host.copy_mutable_to_immutable(&repo, &Fingerprint::of_text("snap"));
        assert_eq!(sealed.kind, SourceKind::ImmutableDirectory);

        // The moved subtree is present but ends before its full depth:
        // the overflowing levels were dropped from the snapshot.
        let mut cur = sealed.lookup(&repo, "moved", None).unwrap();
        let mut reached = 1usize;
        loop {
            match cur.lookup(&repo, "d", None) {
                Ok(child) => {
                    assert_eq!(child.kind, SourceKind::ImmutableDirectory);
                    cur = child;
                    reached += 1;
                }
                Err(RepositoryError::NotFound) => break,
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert!(reached < depth_a);
    }

    #[test]
    fn refcount_rebuild_matches_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let work = new_workdir(&repo, "work");
        let sub = work
            .insert_mutable_directory(&repo, "sub", None, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        let sid_a = create_with_contents(repo.store(), b"a").unwrap();
        let sid_b = create_with_contents(repo.store(), b"b").unwrap();
        work.insert_mutable_file(&repo, "a", sid_a, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        sub.insert_mutable_file(&repo, "b", sid_b, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        sub.insert_mutable_file(&repo, "b2", sid_b, true, None, DupeCheck::DontReplace, 0)
            .unwrap();

        let rebuilt = SidRefCount::new();
        repo.mutable_root().build_sid_refcount(&repo, &rebuilt);
        assert!(rebuilt.compare(&repo.mutable_sidref));
        assert_eq!(rebuilt.count(sid_b), 2);
    }

    #[test]
    fn gc_preserves_reachable_state() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let work = new_workdir(&repo, "work");
        let sid = create_with_contents(repo.store(), b"keep me").unwrap();
        work.insert_mutable_file(&repo, "f", sid, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        work.write_attrib(&repo, AttribOp::Set, "note", "still here", None, 0)
            .unwrap();
        let before = listing(&repo, &work);

        repo.gc(&[]);

        let work = repo
            .mutable_root()
            .lookup(&repo, "work", None)
            .unwrap();
        assert_eq!(listing(&repo, &work), before);
        let head = repo.attrib_head(work.attribs);
        assert_eq!(
            attrib::get_attrib(&repo.pool, head, "note"),
            Some("still here".to_string())
        );
    }

    #[test]
    fn checkpoint_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt_path = dir.path().join("repository.ckp");
        let sid;
        let work_longid;
        {
            let repo = open_repo(&dir);
            let work = new_workdir(&repo, "work");
            work_longid = work.longid;
            sid = create_with_contents(repo.store(), b"persisted").unwrap();
            work.insert_mutable_file(&repo, "keep", sid, true, None, DupeCheck::DontReplace, 0)
                .unwrap();
            let tmp = create_with_contents(repo.store(), b"gone").unwrap();
            work.insert_mutable_file(&repo, "tmp", tmp, true, None, DupeCheck::DontReplace, 0)
                .unwrap();
            work.really_delete(&repo, "tmp", None, true, 0).unwrap();
            work.rename_to(&repo, "kept", &work, "keep", None, DupeCheck::DontReplace, 0)
                .unwrap();
            repo.checkpoint(&ckpt_path).unwrap();

            // Still resolvable right after the reload.
            let work = repo.lookup_unlocked(&work_longid, 0).unwrap();
            assert_eq!(work.lookup(&repo, "kept", None).unwrap().sid, sid);
        }

        // A fresh process loads the checkpoint and replays no journal.
        let repo = open_repo(&dir);
        let work = repo.lookup_unlocked(&work_longid, 0).unwrap();
        let found = work.lookup(&repo, "kept", None).unwrap();
        assert_eq!(found.sid, sid);
        assert_eq!(
            work.lookup(&repo, "tmp", None).unwrap_err(),
            RepositoryError::NotFound
        );
        let rebuilt = SidRefCount::new();
        repo.mutable_root().build_sid_refcount(&repo, &rebuilt);
        assert!(rebuilt.compare(&repo.mutable_sidref));
    }

    #[test]
    fn journal_replay_recovers_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let sid;
        {
            let repo = open_repo(&dir);
            let work = new_workdir(&repo, "work");
            sid = create_with_contents(repo.store(), b"logged").unwrap();
            work.insert_mutable_file(&repo, "f", sid, true, None, DupeCheck::DontReplace, 0)
                .unwrap();
            work.write_attrib(&repo, AttribOp::Set, "k", "v", None, 0).unwrap();
        }

        // No checkpoint was taken: everything comes back from the log.
        let repo = open_repo(&dir);
        let work = repo
            .mutable_root()
            .lookup(&repo, "work", None)
            .unwrap();
        let found = work.lookup(&repo, "f", None).unwrap();
        assert_eq!(found.sid, sid);
        let head = repo.attrib_head(work.attribs);
        assert_eq!(
            attrib::get_attrib(&repo.pool, head, "k"),
            Some("v".to_string())
        );
    }

    #[test]
    fn collapse_base_preserves_observables() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let root = repo.repository_root();
        let work = new_workdir(&repo, "work");
        let sid = create_with_contents(repo.store(), b"layered").unwrap();
        work.insert_mutable_file(&repo, "f", sid, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        repo.make_files_immutable(&work, None).unwrap();

        // Check the work area in as /v1 (sealing it), advance over it,
        // and check the advance in as /v2, giving /v2 a two-layer base
        // chain.
        let v1 = root
            .insert_immutable_directory(
                &repo,
                "v1",
                Some(&work),
                true,
                None,
                DupeCheck::DontReplace,
                0,
                None,
            )
            .unwrap();
        let over = repo
            .mutable_root()
            .insert_mutable_directory(
                &repo,
                "over",
                Some(&v1),
                true,
                None,
                DupeCheck::DontReplace,
                0,
            )
            .unwrap();
        let sid2 = create_with_contents(repo.store(), b"more").unwrap();
        over.insert_mutable_file(&repo, "g", sid2, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        repo.make_files_immutable(&over, None).unwrap();
        let v2 = root
            .insert_immutable_directory(
                &repo,
                "v2",
                Some(&over),
                true,
                None,
                DupeCheck::DontReplace,
                0,
                None,
            )
            .unwrap();

        let third = repo
            .mutable_root()
            .insert_mutable_directory(
                &repo,
                "third",
                Some(&v2),
                true,
                None,
                DupeCheck::DontReplace,
                0,
            )
            .unwrap();

        let before = listing(&repo, &third);
        let fptag_before = v2.fptag;
        third.collapse_base(&repo, None).unwrap();
        let after = listing(&repo, &third);
        let before_set: std::collections::BTreeSet<_> =
            before.iter().map(|(arc, _)| arc.clone()).collect();
        let after_set: std::collections::BTreeSet<_> =
            after.iter().map(|(arc, _)| arc.clone()).collect();
        assert_eq!(before_set, after_set);
        assert!(after_set.contains("f") && after_set.contains("g"));
        // The flattened base keeps the original identity.
        let base = third.get_base(&repo, None).unwrap();
        assert_eq!(base.fptag, fptag_before);
        assert!(base.base_rep(repo.pool()).is_null());
    }

    #[test]
    fn resolve_last_arc_picks_largest_number() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let root = repo.repository_root();
        let proj = root
            .insert_appendable_directory(&repo, "proj", true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        for arc in ["1", "2", "10", "007", "checkout"] {
            proj.insert_appendable_directory(&repo, arc, true, None, DupeCheck::DontReplace, 0)
                .unwrap();
        }
        assert_eq!(
            repo.resolve_last_arc(&proj, None).unwrap(),
            Some("10".to_string())
        );
    }

    #[test]
    fn make_mutable_copies_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open_repo(&dir);
        let work = new_workdir(&repo, "work");
        let sid = create_with_contents(repo.store(), b"original").unwrap();
        work.insert_mutable_file(&repo, "f", sid, true, None, DupeCheck::DontReplace, 0)
            .unwrap();
        repo.make_files_immutable(&work, None).unwrap();
        let sealed = work.lookup(&repo, "f", None).unwrap();
        assert_eq!(sealed.kind, SourceKind::ImmutableFile);

        let writable = repo
            .make_mutable(&sealed, NULL_SHORTID, u64::MAX, None)
            .unwrap();
        assert_eq!(writable.kind, SourceKind::MutableFile);
        assert_ne!(writable.sid, sealed.sid);
        // Same handle before and after the copy.
        assert_eq!(writable.longid, sealed.longid);
        // The copy starts with the sealed bytes.
        assert_eq!(repo.store().size(writable.sid).unwrap(), 8);
    }
}
