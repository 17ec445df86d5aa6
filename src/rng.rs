//! Per-worker random streams for victim selection

use rand_xoshiro::{
    rand_core::{RngCore, SeedableRng},
    Xoroshiro128StarStar,
};

/// Victim-selection stream for one worker
///
/// Every worker draws from the same master xoroshiro128** sequence,
/// partitioned by jumping: worker `i` starts `i` jumps (of 2^64 draws each)
/// into the stream, so no two workers ever share a subsequence. The draws
/// only pick steal victims, which asks for nothing beyond an even spread
/// across the worker indices.
pub(crate) struct VictimRng(Xoroshiro128StarStar);
//
impl VictimRng {
    /// Set up worker `worker`'s slice of the master stream seeded by `seed`
    pub fn stream(seed: u64, worker: usize) -> Self {
        let mut rng = Xoroshiro128StarStar::seed_from_u64(seed);
        for _ in 0..worker {
            rng.jump();
        }
        Self(rng)
    }

    /// Pick a victim index in `0..workers`
    pub fn next_index(&mut self, workers: usize) -> usize {
        // Modulo bias over a 64-bit draw is immaterial at worker counts
        (self.0.next_u64() % workers as u64) as usize
    }
}
