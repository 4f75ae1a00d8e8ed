//! Truncated-binary exponential backoff with automatic reset
//!
//! Paces the reactivation of a restarted worker. Each advance samples a
//! uniform slot count from a window that doubles per retry, bounded below
//! by a constant delay. Once the retry ceiling is hit the window resets,
//! so a long-suffering worker is periodically given a fast retry again.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Consecutive retries before the backoff window resets.
pub const DEFAULT_RETRY_CEILING: u32 = 10;

/// Largest accepted retry ceiling (keeps the slot window within u64).
const MAX_RETRY_CEILING: u32 = 30;

/// Snapshot of a backoff's counters after an advance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    /// Retries since the last reset
    pub retries: u32,

    /// Number of times the ceiling was hit and the window reset
    pub resets: u32,

    /// Retries across all resets
    pub total_retries: u64,

    /// The wait produced by the most recent advance
    pub current_wait: Duration,
}

/// Exponential backoff state for one worker
///
/// Pure value object: no I/O and no clock access beyond the owned RNG.
/// With a seeded RNG ([`Backoff::with_seed`]) the produced wait sequence is
/// fully deterministic, which the tests rely on.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use viewflow_dispatch::Backoff;
///
/// let mut backoff = Backoff::with_seed(
///     Duration::from_millis(100),
///     Duration::from_millis(50),
///     42,
/// );
///
/// let state = backoff.next();
/// assert!(state.current_wait >= Duration::from_millis(50));
/// ```
#[derive(Debug)]
pub struct Backoff {
    slot: Duration,
    constant_delay: Duration,
    ceiling: u32,
    rng: StdRng,
    retries: u32,
    resets: u32,
    total_retries: u64,
    current_wait: Duration,
}

impl Backoff {
    /// Create a backoff with an entropy-seeded RNG
    pub fn new(slot: Duration, constant_delay: Duration) -> Self {
        Self::with_rng(slot, constant_delay, StdRng::from_entropy())
    }

    /// Create a backoff with a deterministic seed
    pub fn with_seed(slot: Duration, constant_delay: Duration, seed: u64) -> Self {
        Self::with_rng(slot, constant_delay, StdRng::seed_from_u64(seed))
    }

    /// Create a backoff with an explicit RNG
    pub fn with_rng(slot: Duration, constant_delay: Duration, rng: StdRng) -> Self {
        Self {
            slot,
            constant_delay,
            ceiling: DEFAULT_RETRY_CEILING,
            rng,
            retries: 0,
            resets: 0,
            total_retries: 0,
            current_wait: constant_delay,
        }
    }

    /// Set the retry ceiling (clamped to `1..=30`)
    pub fn with_ceiling(mut self, ceiling: u32) -> Self {
        self.ceiling = ceiling.clamp(1, MAX_RETRY_CEILING);
        self
    }

    /// Advance the backoff and return the new state
    ///
    /// Below the ceiling the retry count increments and the wait is sampled
    /// as `constant_delay + k * slot` with `k` uniform in
    /// `[0, 2^retries - 1]`. At the ceiling the window resets: `resets`
    /// increments, `retries` drops to zero and the wait collapses to the
    /// constant delay. `total_retries` increments on every advance.
    pub fn next(&mut self) -> BackoffState {
        if self.retries < self.ceiling {
            self.retries += 1;
            let slots = 1u64 << self.retries;
            let k = self.rng.gen_range(0..slots);
            self.current_wait = self
                .constant_delay
                .saturating_add(self.slot.saturating_mul(k as u32));
        } else {
            self.resets += 1;
            self.retries = 0;
            self.current_wait = self.constant_delay;
        }
        self.total_retries += 1;
        self.state()
    }

    /// Current counters without advancing
    pub fn state(&self) -> BackoffState {
        BackoffState {
            retries: self.retries,
            resets: self.resets,
            total_retries: self.total_retries,
            current_wait: self.current_wait,
        }
    }

    /// The wait produced by the most recent advance
    pub fn current_wait(&self) -> Duration {
        self.current_wait
    }

    /// Retries since the last reset
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Number of window resets so far
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Retries across all resets
    pub fn total_retries(&self) -> u64 {
        self.total_retries
    }
}
