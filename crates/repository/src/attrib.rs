//! Mutable attributes: append-only per-name history with canonicalization.
//!
//! Each attributed node carries a singly linked chain of packed records in
//! the pool, most recent first. A record is `(op, name, value, timestamp)`.
//! The chain is kept *canonical*: records that later writes render
//! redundant are removed as the write is applied, so the chain is the
//! smallest history still equivalent to the full one.
//!
//! Invariants on the canonical chain K (`w1 > w2` meaning strictly more
//! recent):
//!
//! 1. If K contains `(set|clear, n, v1, t1)` it contains no other record
//!    for `n` older than it.
//! 2. If K contains `(remove|add, n, v, t1)` it contains no older
//!    `(op != clear, n, v, t2)`.
//! 3. K is a subset of the full history, except that a `set` may survive
//!    as a `clear` with the same arguments.
//!
//! Packed record layout (block kind [`BlockKind::Attrib`]):
//!
//! ```text
//! flags: u8      op in client bits 2-3, visited in bit 1
//! next: u32      short pointer to the next-older record
//! timestamp: u32
//! name: NUL-terminated bytes
//! value: NUL-terminated bytes
//! ```

use std::io::{self, Write};

use crate::error::{RepositoryError, Result};
use crate::pool::{BlockKind, MemPool, ShortPtr, ALIGN_MASK};
use crate::types::{now, Timestamp};

/// Minimum record size: flags + next + timestamp + two empty NUL strings.
pub const ATTR_MIN_SIZE: u32 = 11;

const OFF_NEXT: u32 = 1;
const OFF_TIMESTAMP: u32 = 5;
const OFF_NAME: u32 = 9;

/// An attribute-history operation, stored in 2 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttribOp {
    Set = 0,
    Clear = 1,
    Add = 2,
    Remove = 3,
}

impl AttribOp {
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => AttribOp::Set,
            1 => AttribOp::Clear,
            2 => AttribOp::Add,
            3 => AttribOp::Remove,
            _ => return None,
        })
    }
}

/// One record in the history chain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AttrRec(pub ShortPtr);

impl AttrRec {
    /// Allocates a new record in the pool.
    pub fn create(
        pool: &MemPool,
        op: AttribOp,
        name: &str,
        value: &str,
        timestamp: Timestamp,
    ) -> AttrRec {
        let size = ATTR_MIN_SIZE + name.len() as u32 + value.len() as u32;
        let sp = pool.allocate(BlockKind::Attrib, size);
        let rec = AttrRec(sp);
        rec.set_op(pool, op);
        rec.set_next(pool, ShortPtr::NULL);
        pool.write_u32(ShortPtr(sp.0 + OFF_TIMESTAMP), timestamp);
        let mut at = ShortPtr(sp.0 + OFF_NAME);
        pool.write_bytes(at, name.as_bytes());
        at = ShortPtr(at.0 + name.len() as u32);
        pool.write_u8(at, 0);
        at = ShortPtr(at.0 + 1);
        pool.write_bytes(at, value.as_bytes());
        pool.write_u8(ShortPtr(at.0 + value.len() as u32), 0);
        rec
    }

    #[inline]
    pub fn op(&self, pool: &MemPool) -> AttribOp {
        AttribOp::from_u8(pool.client_bits(self.0)).expect("2-bit op is always valid")
    }

    #[inline]
    pub fn set_op(&self, pool: &MemPool, op: AttribOp) {
        pool.set_client_bits(self.0, op as u8);
    }

    #[inline]
    pub fn next(&self, pool: &MemPool) -> ShortPtr {
        ShortPtr(pool.read_u32(ShortPtr(self.0 .0 + OFF_NEXT)))
    }

    #[inline]
    pub fn set_next(&self, pool: &MemPool, next: ShortPtr) {
        pool.write_u32(ShortPtr(self.0 .0 + OFF_NEXT), next.0);
    }

    #[inline]
    pub fn timestamp(&self, pool: &MemPool) -> Timestamp {
        pool.read_u32(ShortPtr(self.0 .0 + OFF_TIMESTAMP))
    }

    fn cstr_at(&self, pool: &MemPool, mut at: ShortPtr) -> (String, u32) {
        let start = at;
        while pool.read_u8(at) != 0 {
            at = ShortPtr(at.0 + 1);
        }
        let len = at.0 - start.0;
        let bytes = pool.bytes(start, len as usize);
        (String::from_utf8_lossy(bytes).into_owned(), len)
    }

    pub fn name(&self, pool: &MemPool) -> String {
        self.cstr_at(pool, ShortPtr(self.0 .0 + OFF_NAME)).0
    }

    pub fn value(&self, pool: &MemPool) -> String {
        let (_, name_len) = self.cstr_at(pool, ShortPtr(self.0 .0 + OFF_NAME));
        self.cstr_at(pool, ShortPtr(self.0 .0 + OFF_NAME + name_len + 1))
            .0
    }

    /// Total record size in bytes, parsed from the contents.
    pub fn size(&self, pool: &MemPool) -> u32 {
        let (_, name_len) = self.cstr_at(pool, ShortPtr(self.0 .0 + OFF_NAME));
        let (_, value_len) =
            self.cstr_at(pool, ShortPtr(self.0 .0 + OFF_NAME + name_len + 1));
        ATTR_MIN_SIZE + name_len + value_len
    }

    /// Marks this record and everything older in the chain.
    pub fn mark(&self, pool: &MemPool) {
        let mut cur = *self;
        while !cur.0.is_null() {
            debug_assert_eq!(pool.kind_of(cur.0), BlockKind::Attrib);
            pool.set_visited(cur.0, true);
            cur = AttrRec(cur.next(pool));
        }
    }

    /// Writes the chain into a checkpoint stream.
    ///
    /// Records are assigned consecutive short pointers from `next_sp`;
    /// each record's visited bit is set and its next field smashed to hold
    /// its new short pointer, so a chain referenced twice is written once.
    /// Returns the head's post-checkpoint short pointer.
    pub fn checkpoint(
        &self,
        pool: &MemPool,
        next_sp: &mut u32,
        out: &mut dyn Write,
    ) -> io::Result<ShortPtr> {
        if pool.visited(self.0) {
            return Ok(self.next(pool)); // reused field
        }
        let mut cur = *self;
        let mut head_new = ShortPtr::NULL;
        loop {
            debug_assert_eq!(pool.kind_of(cur.0), BlockKind::Attrib);
            let size = cur.size(pool);
            let pad = size.wrapping_neg() & ALIGN_MASK;
            let new_sp = ShortPtr(*next_sp);
            if head_new.is_null() {
                head_new = new_sp;
            }
            *next_sp += size + pad;

            let old_next = cur.next(pool);
            let mut stop = true;
            if !old_next.is_null() {
                let next_rec = AttrRec(old_next);
                if pool.visited(old_next) {
                    // Already written; its next field holds its new SP.
                    let next_new = next_rec.next(pool);
                    cur.set_next(pool, next_new);
                    log::warn!(
                        "multiply referenced attribute chain; \
                         post-checkpoint short pointer = {next_new}"
                    );
                } else {
                    cur.set_next(pool, ShortPtr(*next_sp));
                    stop = false;
                }
            }

            out.write_all(pool.bytes(cur.0, size as usize))?;
            for _ in 0..pad {
                out.write_all(&[0])?;
            }
            pool.set_visited(cur.0, true);
            cur.set_next(pool, new_sp); // smash: remember the new address

            if stop {
                break;
            }
            cur = AttrRec(old_next);
        }
        Ok(head_new)
    }
}

// ---------------------------------------------------------------------------
// Chain queries
// ---------------------------------------------------------------------------

/// Walks a chain from `head`, most recent first.
fn chain(pool: &MemPool, head: ShortPtr) -> impl Iterator<Item = AttrRec> + '_ {
    let mut cur = head;
    std::iter::from_fn(move || {
        if cur.is_null() {
            return None;
        }
        debug_assert_eq!(pool.kind_of(cur), BlockKind::Attrib);
        let rec = AttrRec(cur);
        cur = rec.next(pool);
        Some(rec)
    })
}

/// True if `value` is currently bound under `name`.
pub fn in_attribs(pool: &MemPool, head: ShortPtr, name: &str, value: &str) -> bool {
    for rec in chain(pool, head) {
        if rec.name(pool) != name {
            continue;
        }
        match rec.op(pool) {
            AttribOp::Set => return rec.value(pool) == value,
            AttribOp::Clear => return false,
            AttribOp::Add => {
                if rec.value(pool) == value {
                    return true;
                }
            }
            AttribOp::Remove => {
                if rec.value(pool) == value {
                    return false;
                }
            }
        }
    }
    false
}

/// Returns one bound value for `name`, or `None` if the set is empty.
pub fn get_attrib(pool: &MemPool, head: ShortPtr, name: &str) -> Option<String> {
    for rec in chain(pool, head) {
        if rec.name(pool) != name {
            continue;
        }
        match rec.op(pool) {
            // By invariant 1 a surviving set or add cannot have been
            // overridden by anything newer than records already seen.
            AttribOp::Set | AttribOp::Add => return Some(rec.value(pool)),
            AttribOp::Clear => return None,
            AttribOp::Remove => {}
        }
    }
    None
}

/// Returns every value bound under `name`, newest binding first.
pub fn get_attrib_values(pool: &MemPool, head: ShortPtr, name: &str) -> Vec<String> {
    let mut out = Vec::new();
    for rec in chain(pool, head) {
        if rec.name(pool) != name {
            continue;
        }
        match rec.op(pool) {
            AttribOp::Set => {
                out.push(rec.value(pool));
                return out;
            }
            AttribOp::Clear => return out,
            AttribOp::Add => out.push(rec.value(pool)),
            AttribOp::Remove => {}
        }
    }
    out
}

/// Lists the names that have at least one bound value.
pub fn list_attrib_names(pool: &MemPool, head: ShortPtr) -> Vec<String> {
    let mut seen = fnv::FnvHashSet::default();
    let mut out = Vec::new();
    for rec in chain(pool, head) {
        match rec.op(pool) {
            AttribOp::Set | AttribOp::Add => {
                let name = rec.name(pool);
                if seen.insert(name.clone()) {
                    out.push(name);
                }
            }
            AttribOp::Clear | AttribOp::Remove => {}
        }
    }
    out
}

/// Full canonical history, most recent first.
pub fn get_history(pool: &MemPool, head: ShortPtr) -> Vec<(AttribOp, String, String, Timestamp)> {
    chain(pool, head)
        .map(|rec| {
            (
                rec.op(pool),
                rec.name(pool),
                rec.value(pool),
                rec.timestamp(pool),
            )
        })
        .collect()
}

/// Deep-copies a chain (for renames that cross an ownership realm).
pub fn copy_attribs(pool: &MemPool, from: ShortPtr) -> ShortPtr {
    let mut new_head = ShortPtr::NULL;
    let mut prev: Option<AttrRec> = None;
    for rec in chain(pool, from) {
        let copy = AttrRec::create(
            pool,
            rec.op(pool),
            &rec.name(pool),
            &rec.value(pool),
            rec.timestamp(pool),
        );
        match prev {
            None => new_head = copy.0,
            Some(p) => p.set_next(pool, copy.0),
        }
        prev = Some(copy);
    }
    new_head
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Total order on history records: newer sorts greater; ties broken by
/// name, value, then op so that differing ops with equal arguments are
/// adjacent.
fn compare_write(
    a: (AttribOp, &str, &str, Timestamp),
    b: (AttribOp, &str, &str, Timestamp),
) -> std::cmp::Ordering {
    (a.3, a.1, a.2, a.0 as u8).cmp(&(b.3, b.1, b.2, b.0 as u8))
}

/// Picks a timestamp for a new record that will not be shadowed by the
/// existing head: `max(now(), head.timestamp + 1)` in effect.
fn new_timestamp(
    pool: &MemPool,
    head: ShortPtr,
    op: AttribOp,
    name: &str,
    value: &str,
) -> Timestamp {
    let mut result = now();
    if head.is_null() {
        return result;
    }
    let first = AttrRec(head);
    let cmp = compare_write(
        (op, name, value, result),
        (
            first.op(pool),
            &first.name(pool),
            &first.value(pool),
            first.timestamp(pool),
        ),
    );
    if cmp != std::cmp::Ordering::Greater {
        result = first.timestamp(pool) + 1;
    }
    result
}

/// Outcome of applying one attribute write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A record was inserted (possibly as a substituted `clear`).
    Applied,
    /// The invariants made the write a no-op; nothing changed.
    Discarded,
}

/// Pre-checks a write: returns the timestamp it would use, and whether it
/// would change the canonical chain. Used to pick the timestamp for the
/// journal record before committing the write.
pub fn would_write_attrib(
    pool: &MemPool,
    head: ShortPtr,
    mut op: AttribOp,
    name: &str,
    value: &str,
    timestamp: Timestamp,
) -> Result<Timestamp> {
    let ts = if timestamp == 0 {
        new_timestamp(pool, head, op, name, value)
    } else {
        timestamp
    };
    for rec in chain(pool, head) {
        let cmp = compare_write(
            (op, name, value, ts),
            (
                rec.op(pool),
                &rec.name(pool),
                &rec.value(pool),
                rec.timestamp(pool),
            ),
        );
        match cmp {
            std::cmp::Ordering::Greater => break,
            std::cmp::Ordering::Equal => return Err(RepositoryError::NameInUse),
            std::cmp::Ordering::Less => {}
        }
        if rec.name(pool) == name {
            match rec.op(pool) {
                AttribOp::Set | AttribOp::Clear => return Err(RepositoryError::NameInUse),
                AttribOp::Add | AttribOp::Remove => {
                    if rec.value(pool) == value {
                        match op {
                            AttribOp::Add | AttribOp::Remove => {
                                return Err(RepositoryError::NameInUse)
                            }
                            AttribOp::Set => op = AttribOp::Clear,
                            AttribOp::Clear => {}
                        }
                    }
                }
            }
        }
    }
    Ok(ts)
}

/// Applies a write to the chain whose head cell is read/written through
/// the closures. Returns the timestamp recorded.
///
/// A write the invariants render redundant is reported as
/// [`WriteOutcome::Discarded`]; an *exact* duplicate fails with
/// [`RepositoryError::NameInUse`] (the RPC boundary maps that to success).
pub fn write_attrib(
    pool: &MemPool,
    get_head: &dyn Fn() -> ShortPtr,
    set_head: &mut dyn FnMut(ShortPtr),
    mut op: AttribOp,
    name: &str,
    value: &str,
    timestamp: Timestamp,
) -> Result<(Timestamp, WriteOutcome)> {
    let head = get_head();
    let ts = if timestamp == 0 {
        new_timestamp(pool, head, op, name, value)
    } else {
        timestamp
    };

    let mut prev: Option<AttrRec> = None;
    let mut cur = head;
    while !cur.is_null() {
        let rec = AttrRec(cur);
        let cmp = compare_write(
            (op, name, value, ts),
            (
                rec.op(pool),
                &rec.name(pool),
                &rec.value(pool),
                rec.timestamp(pool),
            ),
        );
        match cmp {
            std::cmp::Ordering::Greater => break,
            std::cmp::Ordering::Equal => return Err(RepositoryError::NameInUse),
            std::cmp::Ordering::Less => {}
        }
        // Preserve the invariants against the newer record.
        if rec.name(pool) == name {
            match rec.op(pool) {
                AttribOp::Set | AttribOp::Clear => {
                    // Invariant 1: the new older write is invisible.
                    return Ok((ts, WriteOutcome::Discarded));
                }
                AttribOp::Add | AttribOp::Remove => {
                    if rec.value(pool) == value {
                        match op {
                            AttribOp::Add | AttribOp::Remove => {
                                // Invariant 2: invisible.
                                return Ok((ts, WriteOutcome::Discarded));
                            }
                            AttribOp::Set => {
                                // Substitute a clear (invariant 3); this
                                // sorts epsilon-smaller, never earlier in
                                // the chain than where we stand.
                                op = AttribOp::Clear;
                            }
                            AttribOp::Clear => {}
                        }
                    }
                }
            }
        }
        prev = Some(rec);
        cur = rec.next(pool);
    }

    // Insert between prev and cur.
    let inserted = AttrRec::create(pool, op, name, value, ts);
    match prev {
        None => {
            inserted.set_next(pool, head);
            set_head(inserted.0);
        }
        Some(p) => {
            inserted.set_next(pool, p.next(pool));
            p.set_next(pool, inserted.0);
        }
    }

    // Restore the invariants below the inserted record.
    let mut prev = inserted;
    let mut cur = AttrRec(inserted.next(pool));
    if op == AttribOp::Set || op == AttribOp::Clear {
        while !cur.0.is_null() {
            let next = AttrRec(cur.next(pool));
            if cur.name(pool) == name {
                let cur_op = cur.op(pool);
                prev.set_next(pool, next.0);
                pool.free(cur.0, cur.size(pool), Some(BlockKind::Attrib));
                if matches!(cur_op, AttribOp::Set | AttribOp::Clear) {
                    // Invariant 1 held below this point already.
                    return Ok((ts, WriteOutcome::Applied));
                }
                cur = next;
                continue;
            }
            prev = cur;
            cur = next;
        }
    } else {
        while !cur.0.is_null() {
            let next = AttrRec(cur.next(pool));
            if cur.name(pool) == name {
                match cur.op(pool) {
                    AttribOp::Add | AttribOp::Remove => {
                        if cur.value(pool) == value {
                            prev.set_next(pool, next.0);
                            pool.free(cur.0, cur.size(pool), Some(BlockKind::Attrib));
                            // No further ops on this (name, value) exist.
                            return Ok((ts, WriteOutcome::Applied));
                        }
                    }
                    AttribOp::Set => {
                        if cur.value(pool) == value {
                            // The set stays visible for other readers of
                            // the name but this value is now dead: turn it
                            // into a clear (invariant 3).
                            cur.set_op(pool, AttribOp::Clear);
                        }
                        return Ok((ts, WriteOutcome::Applied));
                    }
                    AttribOp::Clear => {
                        return Ok((ts, WriteOutcome::Applied));
                    }
                }
            }
            prev = cur;
            cur = next;
        }
    }
    Ok((ts, WriteOutcome::Applied))
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

    struct Chain(std::cell::Cell<ShortPtr>);

    impl Chain {
        fn new() -> Chain {
            Chain(std::cell::Cell::new(ShortPtr::NULL))
        }

        fn write(
            &self,
            pool: &MemPool,
            op: AttribOp,
            name: &str,
            value: &str,
            ts: Timestamp,
        ) -> Result<(Timestamp, WriteOutcome)> {
            let head = &self.0;
            write_attrib(
                pool,
                &|| head.get(),
                &mut |sp| head.set(sp),
                op,
                name,
                value,
                ts,
            )
        }

        fn head(&self) -> ShortPtr {
            self.0.get()
        }
    }

    #[test]
    fn record_round_trip() {
        let pool = pool();
        let rec = AttrRec::create(&pool, AttribOp::Add, "key", "val", 42);
        assert_eq!(rec.op(&pool), AttribOp::Add);
        assert_eq!(rec.name(&pool), "key");
        assert_eq!(rec.value(&pool), "val");
        assert_eq!(rec.timestamp(&pool), 42);
        assert_eq!(rec.size(&pool), ATTR_MIN_SIZE + 6);
    }

    #[test]
    fn set_and_get() {
        let pool = pool();
        let chain = Chain::new();
        chain.write(&pool, AttribOp::Set, "k", "v1", 10).unwrap();
        assert_eq!(get_attrib(&pool, chain.head(), "k"), Some("v1".into()));
        assert!(in_attribs(&pool, chain.head(), "k", "v1"));
        assert!(!in_attribs(&pool, chain.head(), "k", "v2"));
    }

    #[test]
    fn add_accumulates_values() {
        let pool = pool();
        let chain = Chain::new();
        chain.write(&pool, AttribOp::Add, "k", "a", 10).unwrap();
        chain.write(&pool, AttribOp::Add, "k", "b", 11).unwrap();
        let mut values = get_attrib_values(&pool, chain.head(), "k");
        values.sort();
        assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn canonicalization_scenario() {
        // add(k,v1); add(k,v2); remove(k,v1); set(k,v3) leaves exactly one
        // (set, k, v3) record for k.
        let pool = pool();
        let chain = Chain::new();
        chain.write(&pool, AttribOp::Add, "k", "v1", 10).unwrap();
        chain.write(&pool, AttribOp::Add, "k", "v2", 11).unwrap();
        chain.write(&pool, AttribOp::Remove, "k", "v1", 12).unwrap();
        chain.write(&pool, AttribOp::Set, "k", "v3", 13).unwrap();

        assert_eq!(
            get_attrib_values(&pool, chain.head(), "k"),
            vec!["v3".to_string()]
        );
        let history = get_history(&pool, chain.head());
        let for_k: Vec<_> = history.iter().filter(|h| h.1 == "k").collect();
        assert_eq!(for_k.len(), 1);
        assert_eq!(for_k[0].0, AttribOp::Set);
        assert_eq!(for_k[0].2, "v3");
    }

    #[test]
    fn duplicate_write_is_name_in_use() {
        let pool = pool();
        let chain = Chain::new();
        chain.write(&pool, AttribOp::Set, "k", "v", 10).unwrap();
        assert_eq!(
            chain.write(&pool, AttribOp::Set, "k", "v", 10),
            Err(RepositoryError::NameInUse)
        );
    }

    #[test]
    fn timestamps_strictly_increase() {
        let pool = pool();
        let chain = Chain::new();
        let (t1, _) = chain.write(&pool, AttribOp::Add, "k", "a", 0).unwrap();
        let (t2, _) = chain.write(&pool, AttribOp::Add, "k", "b", 0).unwrap();
        let (t3, _) = chain.write(&pool, AttribOp::Add, "k", "c", 0).unwrap();
        assert!(t2 > t1);
        assert!(t3 > t2);
    }

    #[test]
    fn older_write_under_newer_set_is_discarded() {
        let pool = pool();
        let chain = Chain::new();
        chain.write(&pool, AttribOp::Set, "k", "v", 100).unwrap();
        let (_, outcome) = chain.write(&pool, AttribOp::Add, "k", "w", 50).unwrap();
        assert_eq!(outcome, WriteOutcome::Discarded);
        assert_eq!(get_attrib_values(&pool, chain.head(), "k"), vec!["v".to_string()]);
    }

    #[test]
    fn clear_empties_the_set() {
        let pool = pool();
        let chain = Chain::new();
        chain.write(&pool, AttribOp::Add, "k", "a", 10).unwrap();
        chain.write(&pool, AttribOp::Clear, "k", "", 11).unwrap();
        assert_eq!(get_attrib(&pool, chain.head(), "k"), None);
        assert!(list_attrib_names(&pool, chain.head()).is_empty());
    }

    #[test]
    fn list_names() {
        let pool = pool();
        let chain = Chain::new();
        chain.write(&pool, AttribOp::Set, "a", "1", 10).unwrap();
        chain.write(&pool, AttribOp::Add, "b", "2", 11).unwrap();
        let mut names = list_attrib_names(&pool, chain.head());
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn copy_is_deep_and_equal() {
        let pool = pool();
        let chain = Chain::new();
        chain.write(&pool, AttribOp::Add, "k", "a", 10).unwrap();
        chain.write(&pool, AttribOp::Set, "m", "b", 11).unwrap();
        let copy = copy_attribs(&pool, chain.head());
        assert_ne!(copy, chain.head());
        assert_eq!(
            get_history(&pool, copy),
            get_history(&pool, chain.head())
        );
    }

    #[test]
    fn would_write_matches_write() {
        let pool = pool();
        let chain = Chain::new();
        chain.write(&pool, AttribOp::Set, "k", "v", 10).unwrap();
        assert!(would_write_attrib(&pool, chain.head(), AttribOp::Set, "k", "v", 10).is_err());
        let ts = would_write_attrib(&pool, chain.head(), AttribOp::Set, "k", "w", 0).unwrap();
        assert!(ts > 10);
    }
}
