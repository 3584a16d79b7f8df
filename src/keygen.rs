//! Per-worker key-index generator
//!
//! Each worker owns one generator. The recurrence is the classic 32-bit LCG
//! (`214013 * s + 2531011`) carried over a 64-bit state with wrapping
//! arithmetic, so two workers never share state and a worker's access
//! sequence is a pure function of its index and the number of draws.

/// LCG multiplier
pub const LCG_MULTIPLIER: u64 = 214_013;
/// LCG increment
pub const LCG_INCREMENT: u64 = 2_531_011;

/// Deterministic pseudo-random index source owned by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIndexGenerator {
    state: u64,
}

impl KeyIndexGenerator {
    /// Generator seeded for worker `worker`: `A * worker + C`.
    pub fn for_worker(worker: usize) -> Self {
        Self {
            state: step(worker as u64),
        }
    }

    /// Generator starting from an arbitrary state.
    pub fn from_state(state: u64) -> Self {
        Self { state }
    }

    /// Current state, before the next draw.
    pub fn state(&self) -> u64 {
        self.state
    }

    /// Return the current state and advance once.
    #[inline]
    pub fn next(&mut self) -> u64 {
        let current = self.state;
        self.state = step(current);
        current
    }

    /// Index probed by operation `op` against a working set of `working_set` items.
    ///
    /// Computes `(op + (state >> 16)) % working_set` from the current state and
    /// then advances the state once.
    ///
    /// # Panics
    ///
    /// Panics if `working_set` is zero. Configurations are clamped to a positive
    /// floor before they reach the workers.
    #[inline]
    pub fn index_for(&mut self, op: u64, working_set: u64) -> u64 {
        let state = self.next();
        op.wrapping_add(state >> 16) % working_set
    }
}

#[inline(always)]
fn step(state: u64) -> u64 {
    LCG_MULTIPLIER
        .wrapping_mul(state)
        .wrapping_add(LCG_INCREMENT)
}
