// =============================================================================
// ARNm Runtime — Process Barrier
// =============================================================================
//
// A generation-counted rendezvous: the Nth arriving process resets the
// count and bumps the generation; everyone else suspends (yielding to the
// scheduler) until the generation moves. Reusable across rounds.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sync::spinlock::SpinLock;
use crate::task::scheduler::{current_process, yield_now};

/// A reusable barrier for a fixed party count.
pub struct Barrier {
    parties: usize,
    /// Arrivals in the current generation, under the lock so the
    /// last-arrival reset is atomic with the decision.
    arrived: SpinLock<usize>,
    /// Bumped once per completed round.
    generation: AtomicUsize,
}

impl Barrier {
    /// Barrier for `parties` participants (minimum 1).
    pub fn new(parties: usize) -> Barrier {
        Barrier {
            parties: parties.max(1),
            arrived: SpinLock::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    /// Arrive and wait for the round to complete.
    ///
    /// Returns true for exactly one participant per round (the one that
    /// tripped the barrier), mirroring the leader convention of std's
    /// barrier.
    pub fn wait(&self) -> bool {
        let gen = self.generation.load(Ordering::Acquire);
        {
            let mut arrived = self.arrived.lock();
            *arrived += 1;
            if *arrived == self.parties {
                *arrived = 0;
                // Release the waiters of this generation.
                self.generation.fetch_add(1, Ordering::Release);
                return true;
            }
        }
        while self.generation.load(Ordering::Acquire) == gen {
            if current_process().is_some() {
                yield_now();
            } else {
                std::thread::yield_now();
            }
        }
        false
    }

    /// Number of participants the barrier synchronizes.
    pub fn parties(&self) -> usize {
        self.parties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn single_party_never_blocks() {
        let b = Barrier::new(1);
        assert!(b.wait());
        assert!(b.wait());
    }

    #[test]
    fn releases_all_with_one_leader() {
        const PARTIES: usize = 4;
        let barrier = Arc::new(Barrier::new(PARTIES));
        let leaders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..PARTIES)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let leaders = Arc::clone(&leaders);
                std::thread::spawn(move || {
                    if barrier.wait() {
                        leaders.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn is_reusable_across_rounds() {
        const PARTIES: usize = 3;
        const ROUNDS: usize = 5;
        let barrier = Arc::new(Barrier::new(PARTIES));
        let passes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..PARTIES)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let passes = Arc::clone(&passes);
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        barrier.wait();
                        passes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(passes.load(Ordering::SeqCst), PARTIES * ROUNDS);
    }
}
