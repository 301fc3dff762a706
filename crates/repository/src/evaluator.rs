//! Evaluator-directory surrogates.
//!
//! A volatile directory's base is not local state: it is a directory
//! structure living inside a remote evaluator process, reached over RPC
//! by the (out-of-scope) protocol adapter, which implements
//! [`EvaluatorGateway`]. The pool holds only small surrogate blocks
//! naming the session (host, port, handle) plus one shared *session cell*
//! whose aliveness flag invalidates every surrogate of the session at
//! once when the evaluator goes away.
//!
//! Surrogate block layout (block kind [`BlockKind::DirEvaluator`]):
//!
//! ```text
//! flags: u8       visited in bit 1; bit 0 set marks a session cell
//! cell: u32       short pointer to the shared session cell
//! timestamp: u32
//! handle: u64     directory handle inside the evaluator
//! host, port      length-prefixed byte strings
//! ```
//!
//! Session cell layout: `flags: u8, alive: u8, stash: u32`.

use std::io::{self, Write};

use crate::dir::{ListEntry, Source};
use crate::error::{RepositoryError, Result};
use crate::fingerprint::Fingerprint;
use crate::pool::{BlockKind, MemPool, ShortPtr, ALIGN_MASK};
use crate::repository::Repository;
use crate::types::{ShortId, SourceKind, Timestamp};

const OFF_CELL: u32 = 1;
const OFF_TIMESTAMP: u32 = 5;
const OFF_HANDLE: u32 = 9;
const OFF_HOST: u32 = 17;

const CELL_SIZE: u32 = 6;
const CELL_OFF_ALIVE: u32 = 1;
const CELL_OFF_STASH: u32 = 2;

/// Naming facts for one evaluator session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalSession {
    pub host: String,
    pub port: String,
    pub handle: u64,
}

/// One entry as reported by the remote evaluator.
#[derive(Debug, Clone)]
pub struct EvalEntry {
    pub arc: String,
    /// `ImmutableFile` or `EvaluatorDirectory`.
    pub kind: SourceKind,
    /// Directory index at the evaluator (even, per the overlay scheme).
    pub index: u32,
    pub sid: ShortId,
    pub fptag: Option<Fingerprint>,
    pub master: bool,
    /// For subdirectories: the child's handle at the evaluator.
    pub dir_handle: u64,
}

/// The seam the RPC adapter implements.
pub trait EvaluatorGateway: Send + Sync {
    fn lookup(&self, session: &EvalSession, arc: &str) -> Result<Option<EvalEntry>>;
    fn list(&self, session: &EvalSession, first_index: u32) -> Result<Vec<EvalEntry>>;
}

/// A surrogate block in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalDir(pub ShortPtr);

impl EvalDir {
    /// Allocates a surrogate for a fresh session, including its cell.
    pub fn create(
        pool: &MemPool,
        host: &str,
        port: &str,
        handle: u64,
        timestamp: Timestamp,
    ) -> EvalDir {
        let cell = pool.allocate(BlockKind::DirEvaluator, CELL_SIZE);
        pool.write_u8(ShortPtr(cell.0), (BlockKind::DirEvaluator as u8) << 4 | 0x01);
        pool.write_u8(ShortPtr(cell.0 + CELL_OFF_ALIVE), 1);
        pool.write_u32(ShortPtr(cell.0 + CELL_OFF_STASH), 0);
        Self::create_with_cell(pool, cell, host, port, handle, timestamp)
    }

    /// Allocates a sibling surrogate sharing an existing session cell.
    pub fn create_with_cell(
        pool: &MemPool,
        cell: ShortPtr,
        host: &str,
        port: &str,
        handle: u64,
        timestamp: Timestamp,
    ) -> EvalDir {
        let size = OFF_HOST + 1 + host.len() as u32 + 1 + port.len() as u32;
        let sp = pool.allocate(BlockKind::DirEvaluator, size);
        pool.write_u32(ShortPtr(sp.0 + OFF_CELL), cell.0);
        pool.write_u32(ShortPtr(sp.0 + OFF_TIMESTAMP), timestamp);
        pool.write_u64(ShortPtr(sp.0 + OFF_HANDLE), handle);
        let mut at = ShortPtr(sp.0 + OFF_HOST);
        pool.write_u8(at, host.len() as u8);
        pool.write_bytes(ShortPtr(at.0 + 1), host.as_bytes());
        at = ShortPtr(at.0 + 1 + host.len() as u32);
        pool.write_u8(at, port.len() as u8);
        pool.write_bytes(ShortPtr(at.0 + 1), port.as_bytes());
        EvalDir(sp)
    }

    #[inline]
    pub fn cell(&self, pool: &MemPool) -> ShortPtr {
        ShortPtr(pool.read_u32(ShortPtr(self.0 .0 + OFF_CELL)))
    }

    #[inline]
    pub fn timestamp(&self, pool: &MemPool) -> Timestamp {
        pool.read_u32(ShortPtr(self.0 .0 + OFF_TIMESTAMP))
    }

    #[inline]
    pub fn handle(&self, pool: &MemPool) -> u64 {
        pool.read_u64(ShortPtr(self.0 .0 + OFF_HANDLE))
    }

    pub fn host(&self, pool: &MemPool) -> String {
        let len = pool.read_u8(ShortPtr(self.0 .0 + OFF_HOST)) as usize;
        String::from_utf8_lossy(pool.bytes(ShortPtr(self.0 .0 + OFF_HOST + 1), len)).into_owned()
    }

    pub fn port(&self, pool: &MemPool) -> String {
        let host_len = pool.read_u8(ShortPtr(self.0 .0 + OFF_HOST)) as u32;
        let at = self.0 .0 + OFF_HOST + 1 + host_len;
        let len = pool.read_u8(ShortPtr(at)) as usize;
        String::from_utf8_lossy(pool.bytes(ShortPtr(at + 1), len)).into_owned()
    }

    /// True while the evaluator session is believed reachable.
    pub fn alive(&self, pool: &MemPool) -> bool {
        let cell = self.cell(pool);
        !cell.is_null() && pool.read_u8(ShortPtr(cell.0 + CELL_OFF_ALIVE)) != 0
    }

    /// Marks the whole session dead (every sibling surrogate notices).
    pub fn poison(&self, pool: &MemPool) {
        let cell = self.cell(pool);
        if !cell.is_null() {
            pool.write_u8(ShortPtr(cell.0 + CELL_OFF_ALIVE), 0);
        }
    }

    pub fn session(&self, pool: &MemPool) -> EvalSession {
        EvalSession {
            host: self.host(pool),
            port: self.port(pool),
            handle: self.handle(pool),
        }
    }

    /// Surrogate block size (cells are fixed-size).
    pub fn size(&self, pool: &MemPool) -> u32 {
        if pool.read_u8(self.0) & 0x01 != 0 {
            return CELL_SIZE;
        }
        let host_len = pool.read_u8(ShortPtr(self.0 .0 + OFF_HOST)) as u32;
        let port_len = pool.read_u8(ShortPtr(self.0 .0 + OFF_HOST + 1 + host_len)) as u32;
        OFF_HOST + 1 + host_len + 1 + port_len
    }
}

/// Block-size hook for the pool sweep.
pub fn block_size(pool: &MemPool, sp: ShortPtr) -> u32 {
    EvalDir(sp).size(pool)
}

/// Mark hook: a surrogate keeps its session cell alive.
pub fn mark(pool: &MemPool, sp: ShortPtr) {
    if pool.visited(sp) {
        return;
    }
    pool.set_visited(sp, true);
    let cell = EvalDir(sp).cell(pool);
    if !cell.is_null() {
        pool.set_visited(cell, true);
    }
}

fn gateway_for<'r>(
    repo: &'r Repository,
    node: &Source,
) -> Result<(&'r dyn EvaluatorGateway, EvalSession)> {
    let pool = repo.pool();
    let dir = EvalDir(node.rep);
    if !dir.alive(pool) {
        return Err(RepositoryError::RpcFailure);
    }
    let gateway = repo.evaluator_gateway().ok_or(RepositoryError::RpcFailure)?;
    Ok((gateway, dir.session(pool)))
}

/// Builds the node for an entry the evaluator reported.
fn child_from_eval_entry(
    repo: &Repository,
    node: &Source,
    found: &EvalEntry,
) -> Result<Source> {
    let pool = repo.pool();
    let longid = node.longid.append(found.index);
    if longid.is_null() {
        return Err(RepositoryError::LongIdOverflow);
    }
    let mut child = match found.kind {
        SourceKind::ImmutableFile => {
            let mut child = Source::for_leaf(SourceKind::ImmutableFile, found.sid);
            child.fptag = found.fptag.unwrap_or(Fingerprint::NULL);
            child
        }
        SourceKind::EvaluatorDirectory | SourceKind::EvaluatorROEDirectory => {
            let parent = EvalDir(node.rep);
            let sub = EvalDir::create_with_cell(
                pool,
                parent.cell(pool),
                &parent.host(pool),
                &parent.port(pool),
                found.dir_handle,
                parent.timestamp(pool),
            );
            // The subdirectory surrogate inherits the caller's flavor.
            let kind = if node.kind == SourceKind::EvaluatorROEDirectory {
                SourceKind::EvaluatorROEDirectory
            } else {
                SourceKind::EvaluatorDirectory
            };
            Source::for_rep(kind, sub.0)
        }
        other => {
            log::warn!("evaluator reported unsupported entry kind {other:?}");
            return Err(RepositoryError::RpcFailure);
        }
    };
    child.longid = longid;
    child.master = true;
    child.pseudo_inode = node.index_to_pseudo_inode(found.index);
    child.ac = node.ac.clone();
    Ok(child)
}

/// Looks `arc` up at the remote evaluator.
pub fn lookup(repo: &Repository, node: &Source, arc: &str) -> Result<Source> {
    let (gateway, session) = gateway_for(repo, node)?;
    match gateway.lookup(&session, arc)? {
        None => Err(RepositoryError::NotFound),
        Some(found) => child_from_eval_entry(repo, node, &found),
    }
}

/// Index-based lookup at the remote evaluator.
pub fn lookup_index(repo: &Repository, node: &Source, index: u32) -> Result<(Source, String)> {
    let (gateway, session) = gateway_for(repo, node)?;
    for found in gateway.list(&session, index)? {
        if found.index == index {
            let child = child_from_eval_entry(repo, node, &found)?;
            return Ok((child, found.arc));
        }
    }
    Err(RepositoryError::NotFound)
}

/// Listing via the remote evaluator, honoring the shadow set accumulated
/// from the layers above.
pub fn list(
    repo: &Repository,
    node: &Source,
    first_index: u32,
    callback: &mut dyn FnMut(&ListEntry) -> bool,
    hidden: &mut fnv::FnvHashSet<Vec<u8>>,
) -> Result<()> {
    let (gateway, session) = gateway_for(repo, node)?;
    for found in gateway.list(&session, first_index)? {
        if !hidden.insert(found.arc.clone().into_bytes()) {
            continue;
        }
        let item = ListEntry {
            kind: found.kind,
            arc: found.arc.clone(),
            index: found.index,
            pseudo_inode: node.index_to_pseudo_inode(found.index),
            filesid: found.sid,
            master: found.master,
        };
        if !callback(&item) {
            return Ok(());
        }
    }
    Ok(())
}

/// Checkpoint hook: writes the surrogate and (once) its session cell.
pub fn checkpoint_eval(
    repo: &Repository,
    next_sp: &mut u32,
    out: &mut dyn Write,
    sp: ShortPtr,
) -> io::Result<ShortPtr> {
    let pool = repo.pool();
    let dir = EvalDir(sp);
    if pool.visited(sp) {
        // Stash lives in the cell field for surrogates.
        return Ok(ShortPtr(pool.read_u32(ShortPtr(sp.0 + OFF_CELL))));
    }

    // The shared cell first.
    let cell = dir.cell(pool);
    let new_cell = if cell.is_null() {
        ShortPtr::NULL
    } else if pool.visited(cell) {
        ShortPtr(pool.read_u32(ShortPtr(cell.0 + CELL_OFF_STASH)))
    } else {
        let pad = CELL_SIZE.wrapping_neg() & ALIGN_MASK;
        let new_cell = ShortPtr(*next_sp);
        *next_sp += CELL_SIZE + pad;
        out.write_all(pool.bytes(cell, CELL_SIZE as usize))?;
        for _ in 0..pad {
            out.write_all(&[0])?;
        }
        pool.set_visited(cell, true);
        pool.write_u32(ShortPtr(cell.0 + CELL_OFF_STASH), new_cell.0);
        new_cell
    };

    let size = dir.size(pool);
    let pad = size.wrapping_neg() & ALIGN_MASK;
    let new_sp = ShortPtr(*next_sp);
    *next_sp += size + pad;
    let mut buf = pool.bytes(sp, size as usize).to_vec();
    buf[OFF_CELL as usize..OFF_CELL as usize + 4].copy_from_slice(&new_cell.0.to_le_bytes());
    buf.resize((size + pad) as usize, 0);
    out.write_all(&buf)?;

    pool.set_visited(sp, true);
    pool.write_u32(ShortPtr(sp.0 + OFF_CELL), new_sp.0);
    Ok(new_sp)
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
    fn surrogate_round_trip() {
        let pool = pool();
        let dir = EvalDir::create(&pool, "evalhost", "9001", 0xdead_beef_0000_0001, 42);
        assert_eq!(dir.host(&pool), "evalhost");
        assert_eq!(dir.port(&pool), "9001");
        assert_eq!(dir.handle(&pool), 0xdead_beef_0000_0001);
        assert_eq!(dir.timestamp(&pool), 42);
        assert!(dir.alive(&pool));
    }

    #[test]
    fn poison_kills_all_siblings() {
        let pool = pool();
        let a = EvalDir::create(&pool, "h", "1", 1, 0);
        let b = EvalDir::create_with_cell(&pool, a.cell(&pool), "h", "1", 2, 0);
        assert!(a.alive(&pool) && b.alive(&pool));
        a.poison(&pool);
        assert!(!a.alive(&pool));
        assert!(!b.alive(&pool));
    }

    #[test]
    fn size_parses() {
        let pool = pool();
        let dir = EvalDir::create(&pool, "host", "22", 9, 0);
        assert_eq!(dir.size(&pool), OFF_HOST + 1 + 4 + 1 + 2);
    }
}
