//! Single-flight serialization of copy-on-write by file-identifier.
//!
//! The first write to an immutable file copies its bytes to a fresh
//! shortid. The copy happens without the directory lock held, so several
//! threads can race to copy the same source; this table lets exactly one
//! proceed per shortid while the rest wait on a condition variable and
//! then re-check whether the copy is still needed.

use fnv::FnvHashSet;
use parking_lot::{Condvar, Mutex};

use crate::types::ShortId;

/// Upper bound on simultaneously in-progress copies; beyond this, new
/// entrants wait for a slot.
const MAX_IN_PROGRESS: usize = 64;

#[derive(Default)]
pub struct CopyGate {
    in_progress: Mutex<FnvHashSet<ShortId>>,
    changed: Condvar,
}

impl CopyGate {
    pub fn new() -> CopyGate {
        CopyGate::default()
    }

    /// Blocks until no other thread is copying `sid` and a table slot is
    /// free, then claims the slot. Pair with [`CopyGate::finish`].
    pub fn enter(&self, sid: ShortId) {
        let mut table = self.in_progress.lock();
        while table.contains(&sid) || table.len() >= MAX_IN_PROGRESS {
            self.changed.wait(&mut table);
        }
        table.insert(sid);
    }

    /// Releases the slot claimed by [`CopyGate::enter`] and wakes waiters.
    pub fn finish(&self, sid: ShortId) {
        let mut table = self.in_progress.lock();
        let was_present = table.remove(&sid);
        debug_assert!(was_present, "finish without matching enter");
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn excludes_same_sid() {
        let gate = Arc::new(CopyGate::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(std::thread::spawn(move || {
                gate.enter(ShortId(42));
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);
                gate.finish(ShortId(42));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_sids_run_concurrently() {
        let gate = Arc::new(CopyGate::new());
        let gate2 = gate.clone();
        gate.enter(ShortId(1));
        let t = std::thread::spawn(move || {
            gate2.enter(ShortId(2));
            gate2.finish(ShortId(2));
        });
        t.join().unwrap();
        gate.finish(ShortId(1));
    }
}
