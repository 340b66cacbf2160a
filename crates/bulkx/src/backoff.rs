//! 🔄 Backoff: the fine art of trying again, but slower each time.
//!
//! 🧠 Knowledge graph:
//! - `Backoff` is a policy: `reset()` at the start of a retry run, `next_backoff()` after each
//!   failure. `None` means "we're done here".
//! - The processor keeps ONE prototype and `box_clone()`s a fresh policy per commit, so two
//!   workers never share a retry budget.
//! - `retry_notify` runs a `UnitOfWork` under a policy. `Attempt::Permanent` short-circuits: a
//!   document that cannot serialize will not serialize harder on the fifth try.
//! - Delays use `tokio::time`, so paused-clock tests don't actually wait 10 seconds.
//!
//! Knock knock. Who's there? 429. 429 who? 429, try again in 400 milliseconds. 🦆

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// ⏳ A retry policy. Stateful, so each retry run gets its own copy.
pub trait Backoff: Send + Sync + Debug {
    /// 🔁 Start a new retry run: zero attempts, fresh elapsed clock.
    fn reset(&mut self);
    /// ⏱️ Delay before the next attempt, or `None` when the budget is spent.
    fn next_backoff(&mut self) -> Option<Duration>;
    /// 🧬 A fresh copy of this policy, for the next commit.
    fn box_clone(&self) -> Box<dyn Backoff>;
}

impl Clone for Box<dyn Backoff> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

// ===== Exponential =====

/// 📈 initial * multiplier^n, capped at `max_interval`, until `max_elapsed_time` or
/// `max_retries` runs out.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// ⌛ Total wall-clock budget for one retry run. `None` = unlimited.
    pub max_elapsed_time: Option<Duration>,
    /// 🔢 Max number of retries (not counting the first attempt). `None` = unlimited.
    pub max_retries: Option<usize>,
    current_interval: Duration,
    retries: usize,
    started_at: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            max_interval,
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(60)),
            max_retries: None,
            current_interval: initial_interval,
            retries: 0,
            started_at: None,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_elapsed_time(mut self, max_elapsed_time: Option<Duration>) -> Self {
        self.max_elapsed_time = max_elapsed_time;
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<usize>) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for ExponentialBackoff {
    /// 🔧 200ms doubling up to 10s, for at most a minute. The bulk processor's classic.
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(10))
    }
}

impl Backoff for ExponentialBackoff {
    fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.retries = 0;
        self.started_at = Some(Instant::now());
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let started_at = *self.started_at.get_or_insert_with(Instant::now);
        if let Some(max_retries) = self.max_retries {
            if self.retries >= max_retries {
                return None;
            }
        }
        let delay = self.current_interval.min(self.max_interval);
        if let Some(max_elapsed_time) = self.max_elapsed_time {
            // ⌛ Don't start a sleep that would carry us past the budget.
            if started_at.elapsed() + delay > max_elapsed_time {
                return None;
            }
        }
        self.retries += 1;
        self.current_interval = self
            .current_interval
            .mul_f64(self.multiplier)
            .min(self.max_interval);
        Some(delay)
    }

    fn box_clone(&self) -> Box<dyn Backoff> {
        Box::new(self.clone())
    }
}

// ===== Constant =====

/// ➖ Same delay every time.
#[derive(Debug, Clone)]
pub struct ConstantBackoff {
    pub interval: Duration,
    pub max_retries: Option<usize>,
    retries: usize,
}

impl ConstantBackoff {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_retries: None,
            retries: 0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: Option<usize>) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Backoff for ConstantBackoff {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.max_retries.is_some_and(|max| self.retries >= max) {
            return None;
        }
        self.retries += 1;
        Some(self.interval)
    }

    fn box_clone(&self) -> Box<dyn Backoff> {
        Box::new(self.clone())
    }
}

// ===== Stop =====

/// 🛑 Never retries. One shot, then accept fate.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopBackoff;

impl Backoff for StopBackoff {
    fn reset(&mut self) {}

    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }

    fn box_clone(&self) -> Box<dyn Backoff> {
        Box::new(*self)
    }
}

// ===== Retry driver =====

/// 🎲 How one attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<E> {
    /// 🔄 Worth another go, if the policy allows.
    Transient(E),
    /// 🪦 Retrying won't help. Stop now.
    Permanent(E),
}

/// 🏗️ A unit of work that can be attempted repeatedly. `&mut self` so it can carry state
/// (like which items still need sending) from one attempt to the next.
#[async_trait]
pub trait UnitOfWork: Send {
    type Output: Send;
    type Error: Send;

    async fn attempt(&mut self) -> Result<Self::Output, Attempt<Self::Error>>;
}

/// 🔁 Run `work` until it succeeds, fails permanently, or `backoff` gives up.
///
/// `notify` hears about every failed attempt that WILL be retried, together with the delay
/// about to be slept. It observes; it does not vote. Returns the last error on exhaustion.
pub async fn retry_notify<W, N>(
    backoff: &mut dyn Backoff,
    work: &mut W,
    mut notify: N,
) -> Result<W::Output, W::Error>
where
    W: UnitOfWork + ?Sized,
    N: FnMut(&W::Error, Duration) + Send,
{
    backoff.reset();
    loop {
        let err = match work.attempt().await {
            Ok(output) => return Ok(output),
            Err(Attempt::Permanent(err)) => return Err(err),
            Err(Attempt::Transient(err)) => err,
        };
        let Some(delay) = backoff.next_backoff() else {
            return Err(err);
        };
        notify(&err, delay);
        tokio::time::sleep(delay).await;
    }
}
