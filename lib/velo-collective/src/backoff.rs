// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Retry pacing for transport reconnects.
//!
//! A [`Backoff`] produces the successive waits of a retry loop. It never
//! decides how many attempts to make; that belongs to whoever owns the loop
//! (see [`retry_with_backoff`]).

use std::future::Future;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Strategy producing successive wait durations for a retry loop.
pub trait Backoff: Send {
    /// Advance the policy and return how long to wait before the next attempt.
    fn next_backoff(&mut self) -> Duration;

    /// Return to the initial state. Call after a successful attempt.
    fn reset(&mut self);

    /// Block the calling thread for [`next_backoff`](Self::next_backoff).
    ///
    /// Never call this while holding a lock other threads need.
    fn sleep_backoff(&mut self) {
        std::thread::sleep(self.next_backoff());
    }
}

/// Async counterpart of [`Backoff::sleep_backoff`].
pub async fn sleep_backoff_async(backoff: &mut dyn Backoff) {
    let wait = backoff.next_backoff();
    tokio::time::sleep(wait).await;
}

/// Invalid backoff parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    /// The randomization factor must lie in `[0, 1]`.
    #[error("randomization factor must be in [0, 1], got {0}")]
    RandomizationFactor(f64),

    /// The multiplier must be finite and at least 1.
    #[error("multiplier must be finite and >= 1.0, got {0}")]
    Multiplier(f64),

    /// The initial interval must not exceed the maximum interval.
    #[error("initial interval {initial:?} exceeds max interval {max:?}")]
    Interval {
        /// Requested initial interval.
        initial: Duration,
        /// Requested cap.
        max: Duration,
    },
}

/// Exponential growth with multiplicative jitter.
///
/// The first call after construction or [`reset`](Backoff::reset) returns
/// roughly `initial_interval`; each following call multiplies the interval by
/// `multiplier`, capped at `max_interval`. The returned value is the interval
/// scaled by a uniform factor in `[1 - randomization_factor, 1 + randomization_factor]`
/// so that many ranks retrying after the same failure spread out.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffWithJitter {
    initial_interval: Duration,
    multiplier: f64,
    randomization_factor: f64,
    max_interval: Duration,
    current_interval: Duration,
    rng: SmallRng,
}

impl ExponentialBackoffWithJitter {
    /// Default first wait.
    pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
    /// Default growth factor.
    pub const DEFAULT_MULTIPLIER: f64 = 1.5;
    /// Default jitter spread.
    pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;
    /// Default cap.
    pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_millis(60_000);

    /// Policy with the default parameters and an OS-seeded generator.
    pub fn new() -> Self {
        Self {
            initial_interval: Self::DEFAULT_INITIAL_INTERVAL,
            multiplier: Self::DEFAULT_MULTIPLIER,
            randomization_factor: Self::DEFAULT_RANDOMIZATION_FACTOR,
            max_interval: Self::DEFAULT_MAX_INTERVAL,
            current_interval: Duration::ZERO,
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Policy with explicit parameters, validated here once.
    pub fn with_params(
        initial_interval: Duration,
        multiplier: f64,
        randomization_factor: f64,
        max_interval: Duration,
    ) -> Result<Self, BackoffError> {
        if !(0.0..=1.0).contains(&randomization_factor) {
            return Err(BackoffError::RandomizationFactor(randomization_factor));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::Multiplier(multiplier));
        }
        if initial_interval > max_interval {
            return Err(BackoffError::Interval {
                initial: initial_interval,
                max: max_interval,
            });
        }

        Ok(Self {
            initial_interval,
            multiplier,
            randomization_factor,
            max_interval,
            current_interval: Duration::ZERO,
            rng: SmallRng::from_os_rng(),
        })
    }

    /// Replace the generator with a deterministic one.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Interval before jitter, as of the last call.
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Configured first wait.
    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    /// Configured cap.
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Configured growth factor.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Configured jitter spread.
    pub fn randomization_factor(&self) -> f64 {
        self.randomization_factor
    }
}

impl Default for ExponentialBackoffWithJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff for ExponentialBackoffWithJitter {
    fn next_backoff(&mut self) -> Duration {
        self.current_interval = if self.current_interval.is_zero() {
            self.initial_interval
        } else {
            saturating_mul_f64(self.current_interval, self.multiplier).min(self.max_interval)
        };

        if self.randomization_factor == 0.0 {
            return self.current_interval;
        }

        let jitter = self
            .rng
            .random_range(1.0 - self.randomization_factor..=1.0 + self.randomization_factor);
        saturating_mul_f64(self.current_interval, jitter)
    }

    fn reset(&mut self) {
        self.current_interval = Duration::ZERO;
    }
}

fn saturating_mul_f64(interval: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(interval.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Constant wait, for deterministic retry cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    interval: Duration,
}

impl FixedBackoff {
    /// Policy that always waits `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Backoff for FixedBackoff {
    fn next_backoff(&mut self) -> Duration {
        self.interval
    }

    fn reset(&mut self) {}
}

/// Outcome of a retry loop that never succeeded.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The deadline passed; carries the error of the last attempt.
    #[error("deadline exceeded after {attempts} attempts: {last}")]
    Deadline {
        /// Number of attempts made.
        attempts: usize,
        /// Error returned by the final attempt.
        last: E,
    },
}

/// Run `op` until it succeeds or `deadline` passes, pacing attempts with `backoff`.
///
/// Each wait is `min(next_backoff, time remaining)`. On success the policy is
/// reset so the next failure starts the curve over.
pub async fn retry_with_backoff<T, E, F, Fut>(
    backoff: &mut dyn Backoff,
    deadline: Instant,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0usize;

    loop {
        attempts += 1;
        let err = match op().await {
            Ok(value) => {
                backoff.reset();
                return Ok(value);
            }
            Err(err) => err,
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(RetryError::Deadline {
                attempts,
                last: err,
            });
        }

        let remaining = deadline.saturating_duration_since(now);
        let wait = backoff.next_backoff().min(remaining);
        tracing::warn!(
            attempt = attempts,
            ?wait,
            ?remaining,
            "attempt failed, retrying: {}",
            err
        );
        tokio::time::sleep(wait).await;
    }
}
