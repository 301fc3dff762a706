//! Reference counts for mutable-file shortids.
//!
//! Mutable and volatile directories allow hard links: several entries may
//! name the same mutable shortid. One counter instance serves the whole
//! mutable tree and one serves each volatile subtree. When a count reaches
//! zero the shortid is eligible for physical deletion from the external
//! store (deferred until the outermost transaction commits).
//!
//! The counter is maintained incrementally by every mutating operation and
//! rebuilt from a tree walk after recovery; a mismatch between the two is
//! a recovery failure, not something to paper over.

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::types::ShortId;

/// A map from shortid to live-reference count.
#[derive(Debug, Default)]
pub struct SidRefCount {
    counts: Mutex<FnvHashMap<ShortId, u32>>,
}

impl SidRefCount {
    pub fn new() -> SidRefCount {
        SidRefCount::default()
    }

    /// Adds one reference, returning the new count.
    pub fn increment(&self, sid: ShortId) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(sid).or_insert(0);
        *count += 1;
        *count
    }

    /// Removes one reference, returning the new count.
    ///
    /// Decrementing a zero count is a caller bug unless `allow_zero` is
    /// set, in which case the count stays at zero and zero is returned.
    pub fn decrement(&self, sid: ShortId, allow_zero: bool) -> u32 {
        let mut counts = self.counts.lock();
        match counts.get_mut(&sid) {
            Some(count) if *count > 0 => {
                *count -= 1;
                let now = *count;
                if now == 0 {
                    counts.remove(&sid);
                }
                now
            }
            _ => {
                assert!(allow_zero, "decrement of unreferenced shortid {sid}");
                0
            }
        }
    }

    /// Current count for `sid` (zero if absent).
    pub fn count(&self, sid: ShortId) -> u32 {
        self.counts.lock().get(&sid).copied().unwrap_or(0)
    }

    /// Drops every count (ahead of a rebuild from a loaded image).
    pub fn clear(&self) {
        self.counts.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }

    /// Compares against another counter, logging every difference.
    /// Returns true when the two agree exactly.
    pub fn compare(&self, other: &SidRefCount) -> bool {
        let mine = self.counts.lock();
        let theirs = other.counts.lock();
        let mut equal = true;
        for (sid, count) in mine.iter() {
            let other_count = theirs.get(sid).copied().unwrap_or(0);
            if *count != other_count {
                log::error!("shortid {sid} refcount mismatch: {count} vs {other_count}");
                equal = false;
            }
        }
        for (sid, count) in theirs.iter() {
            if !mine.contains_key(sid) {
                log::error!("shortid {sid} refcount mismatch: 0 vs {count}");
                equal = false;
            }
        }
        equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_decrement() {
        let counts = SidRefCount::new();
        assert_eq!(counts.increment(ShortId(7)), 1);
        assert_eq!(counts.increment(ShortId(7)), 2);
        assert_eq!(counts.count(ShortId(7)), 2);
        assert_eq!(counts.decrement(ShortId(7), false), 1);
        assert_eq!(counts.decrement(ShortId(7), false), 0);
        assert_eq!(counts.count(ShortId(7)), 0);
        assert!(counts.is_empty());
    }

    #[test]
    fn decrement_missing_with_allow_zero() {
        let counts = SidRefCount::new();
        assert_eq!(counts.decrement(ShortId(9), true), 0);
    }

    #[test]
    #[should_panic]
    fn decrement_missing_panics() {
        let counts = SidRefCount::new();
        counts.decrement(ShortId(9), false);
    }

    #[test]
    fn compare_detects_divergence() {
        let a = SidRefCount::new();
        let b = SidRefCount::new();
        a.increment(ShortId(1));
        b.increment(ShortId(1));
        assert!(a.compare(&b));
        b.increment(ShortId(2));
        assert!(!a.compare(&b));
    }
}
