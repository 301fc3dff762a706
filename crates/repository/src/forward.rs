//! Forwarding pointers for renamed names.
//!
//! When a name is renamed out of a mutable or volatile directory, the old
//! entry becomes `deleted` with its value field pointing at one of these
//! records, which holds the longid of the new location. Old longids then
//! keep resolving after the rename. Forwarding records are reclaimed by
//! the sweep when the deleted entry that referenced them goes away.
//!
//! Packed layout (block kind [`BlockKind::Forward`]):
//!
//! ```text
//! flags: u8        visited in bit 1
//! longid: 32 bytes
//! ```

use std::io::{self, Write};

use crate::longid::{LongId, LONGID_LEN};
use crate::pool::{BlockKind, MemPool, ShortPtr, ALIGN_MASK};

/// Total record size.
pub const FORWARD_SIZE: u32 = 1 + LONGID_LEN as u32;

/// Renames may chain through several forwarding records; resolution gives
/// up past this depth rather than loop on a corrupted structure.
pub const MAX_FOLLOW_DEPTH: usize = 32;

/// A forwarding-pointer record in the pool.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Forward(pub ShortPtr);

impl Forward {
    /// Allocates a forwarding record holding `longid`.
    pub fn create(pool: &MemPool, longid: &LongId) -> Forward {
        let sp = pool.allocate(BlockKind::Forward, FORWARD_SIZE);
        pool.write_bytes(ShortPtr(sp.0 + 1), &longid.bytes);
        Forward(sp)
    }

    /// The target longid.
    pub fn longid(&self, pool: &MemPool) -> LongId {
        let mut id = LongId { bytes: [0; LONGID_LEN] };
        id.bytes
            .copy_from_slice(pool.bytes(ShortPtr(self.0 .0 + 1), LONGID_LEN));
        id
    }

    pub fn mark(&self, pool: &MemPool) {
        debug_assert_eq!(pool.kind_of(self.0), BlockKind::Forward);
        pool.set_visited(self.0, true);
    }

    /// Post-checkpoint short pointer stash, smashed over the longid bytes.
    fn redirection(&self, pool: &MemPool) -> ShortPtr {
        ShortPtr(pool.read_u32(ShortPtr(self.0 .0 + 1)))
    }

    fn set_redirection(&self, pool: &MemPool, sp: ShortPtr) {
        pool.write_u32(ShortPtr(self.0 .0 + 1), sp.0);
    }

    /// Writes this record into a checkpoint stream, returning its new
    /// short pointer (the record is written at most once).
    pub fn checkpoint(
        &self,
        pool: &MemPool,
        next_sp: &mut u32,
        out: &mut dyn Write,
    ) -> io::Result<ShortPtr> {
        if pool.visited(self.0) {
            return Ok(self.redirection(pool));
        }
        let pad = FORWARD_SIZE.wrapping_neg() & ALIGN_MASK;
        let new_sp = ShortPtr(*next_sp);
        *next_sp += FORWARD_SIZE + pad;
        out.write_all(pool.bytes(self.0, FORWARD_SIZE as usize))?;
        for _ in 0..pad {
            out.write_all(&[0])?;
        }
        pool.set_visited(self.0, true);
        self.set_redirection(pool, new_sp);
        Ok(new_sp)
    }
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
    fn round_trip() {
        let pool = pool();
        let target = LongId::MUTABLE_ROOT.append(3).append(7);
        let fwd = Forward::create(&pool, &target);
        assert_eq!(pool.kind_of(fwd.0), BlockKind::Forward);
        assert_eq!(fwd.longid(&pool), target);
    }

    #[test]
    fn checkpoint_assigns_stable_sp() {
        let pool = pool();
        let fwd = Forward::create(&pool, &LongId::MUTABLE_ROOT.append(1));
        let mut out = Vec::new();
        let mut next_sp = 1u32;
        let first = fwd.checkpoint(&pool, &mut next_sp, &mut out).unwrap();
        let again = fwd.checkpoint(&pool, &mut next_sp, &mut out).unwrap();
        assert_eq!(first, again);
        assert_eq!(out.len() as u32, FORWARD_SIZE + (FORWARD_SIZE.wrapping_neg() & 7));
    }
}
