//! # Readiness Gate
//!
//! Blocks process start-up until the store answers a ping. Failed probes are
//! logged and retried after an exponentially growing delay capped at
//! `max_interval`, plus additive jitter so processes started together do not
//! retry in lockstep. With `max_elapsed = None` the gate waits forever.

use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{info, warn};

use crate::client::StoreClient;
use crate::error::{ClientError, ClientResult};

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Jitter added to each delay, as a fraction of it (`0.0` disables).
    pub randomization: f64,
    /// Stop retrying once this much time has passed since the first attempt.
    pub max_elapsed: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(20),
            randomization: 0.5,
            max_elapsed: None,
        }
    }
}

impl Backoff {
    /// `delay` plus a random share of up to `randomization * delay`.
    pub fn jittered(&self, delay: Duration) -> Duration {
        apply_jitter(delay, self.randomization, rand::thread_rng().gen::<f64>())
    }

    /// Infinite sequence of retry delays, ignoring `max_elapsed`.
    pub fn intervals(&self) -> Intervals {
        Intervals {
            next: self.initial.min(self.max_interval),
            multiplier: self.multiplier.max(1.0),
            max_interval: self.max_interval,
        }
    }
}

fn apply_jitter(delay: Duration, randomization: f64, roll: f64) -> Duration {
    if randomization.is_nan() || randomization <= 0.0 {
        return delay;
    }
    let spread = delay.as_secs_f64() * randomization.min(1.0);
    delay.saturating_add(Duration::from_secs_f64(spread * roll.clamp(0.0, 1.0)))
}

/// Iterator over backoff delays.
#[derive(Debug, Clone)]
pub struct Intervals {
    next: Duration,
    multiplier: f64,
    max_interval: Duration,
}

impl Iterator for Intervals {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        let grown = current.as_secs_f64() * self.multiplier;
        self.next = if grown >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(grown)
        };
        Some(current)
    }
}

/// Outcome of a successful readiness wait.
#[derive(Debug, Clone, Copy)]
pub struct ReadyReport {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Pings until the store answers.
///
/// Returns `ClientError::NotReady` only when `backoff.max_elapsed` runs out.
pub fn wait_until_ready(client: &StoreClient, backoff: &Backoff) -> ClientResult<ReadyReport> {
    let started = Instant::now();
    let mut delays = backoff.intervals();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let err = match client.ping() {
            Ok(()) => {
                let elapsed = started.elapsed();
                info!(attempts, ?elapsed, "store connection ready");
                return Ok(ReadyReport { attempts, elapsed });
            }
            Err(err) => err,
        };

        let delay = backoff.jittered(delays.next().unwrap_or(backoff.max_interval));
        if let Some(limit) = backoff.max_elapsed {
            if started.elapsed() + delay > limit {
                return Err(ClientError::NotReady {
                    attempts,
                    source: Box::new(err),
                });
            }
        }

        warn!(
            error = %err,
            retry_in_secs = delay.as_secs_f64(),
            "waiting for store pool to hand out a live connection"
        );
        thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_grow_and_cap() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(500),
            randomization: 0.0,
            max_elapsed: None,
        };
        let delays: Vec<u128> = backoff.intervals().take(5).map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn multiplier_below_one_does_not_shrink() {
        let backoff = Backoff {
            multiplier: 0.5,
            ..Backoff::default()
        };
        let delays: Vec<Duration> = backoff.intervals().take(3).collect();
        assert!(delays.iter().all(|d| *d == Duration::from_millis(500)));
    }

    #[test]
    fn initial_above_cap_is_clamped() {
        let backoff = Backoff {
            initial: Duration::from_secs(60),
            ..Backoff::default()
        };
        assert_eq!(backoff.intervals().next(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let base = Duration::from_millis(400);
        assert_eq!(apply_jitter(base, 0.5, 0.0), base);
        assert_eq!(apply_jitter(base, 0.5, 1.0), Duration::from_millis(600));
        assert_eq!(apply_jitter(base, 0.0, 1.0), base);
        assert_eq!(apply_jitter(base, f64::NAN, 1.0), base);

        let backoff = Backoff::default();
        for _ in 0..100 {
            let delay = backoff.jittered(base);
            assert!(delay >= base && delay <= Duration::from_millis(600), "{delay:?}");
        }
    }
}
