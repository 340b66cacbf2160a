//! 🔧 Processor config: the serde face of `BulkProcessorBuilder`.
//!
//! Every knob has a default, so an empty `[processor]` table (or none at all) gives you the
//! classic: one worker, commit every 1000 ops or 5 MiB, no periodic flush, retry 408/429/503/507
//! with exponential backoff. Durations are milliseconds because TOML has no opinion on
//! durations and we didn't want to give it one.

use std::time::Duration;

use serde::Deserialize;

use crate::backoff::{Backoff, ConstantBackoff, ExponentialBackoff, StopBackoff};

pub(crate) const DEFAULT_RETRY_ITEM_STATUS_CODES: [u16; 4] = [408, 429, 503, 507];

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// 🏷️ Shows up in every worker log line. Helps when two processors share a process.
    #[serde(default)]
    pub name: Option<String>,
    /// 🧵 Concurrent workers. Clamped to at least 1.
    #[serde(default = "default_workers", alias = "num_workers")]
    pub workers: usize,
    /// 🔢 Commit after this many ops. -1 disables.
    #[serde(default = "default_bulk_actions")]
    pub bulk_actions: i64,
    /// 📏 Commit once the estimated payload reaches this many bytes. -1 disables.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: i64,
    /// ⏰ Periodic flush interval. 0 disables.
    #[serde(default)]
    pub flush_interval_ms: u64,
    /// 📊 Collect stats beyond the flush counter.
    #[serde(default)]
    pub stats: bool,
    #[serde(default = "default_retry_item_status_codes")]
    pub retry_item_status_codes: Vec<u16>,
    /// 📡 Default index for every batch (`/{index}/_bulk`).
    #[serde(default)]
    pub index: Option<String>,
    /// 🩺 How often a worker parked on a dead connection re-checks health.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_workers() -> usize {
    1
}

fn default_bulk_actions() -> i64 {
    1000
}

// 📏 5 MiB, the classic bulk sweet spot
fn default_bulk_size() -> i64 {
    5 << 20
}

fn default_retry_item_status_codes() -> Vec<u16> {
    DEFAULT_RETRY_ITEM_STATUS_CODES.to_vec()
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: None,
            workers: default_workers(),
            bulk_actions: default_bulk_actions(),
            bulk_size: default_bulk_size(),
            flush_interval_ms: 0,
            stats: false,
            retry_item_status_codes: default_retry_item_status_codes(),
            index: None,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_ms > 0).then(|| Duration::from_millis(self.flush_interval_ms))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// ⏳ Which retry policy to clone for every commit.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum BackoffConfig {
    Exponential(ExponentialBackoffConfig),
    Constant {
        interval_ms: u64,
        #[serde(default)]
        max_retries: Option<usize>,
    },
    Stop,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential(ExponentialBackoffConfig::default())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ExponentialBackoffConfig {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// ⌛ 0 = no elapsed-time budget.
    #[serde(default = "default_max_elapsed_time_ms")]
    pub max_elapsed_time_ms: u64,
    #[serde(default)]
    pub max_retries: Option<usize>,
}

fn default_initial_interval_ms() -> u64 {
    200
}

fn default_max_interval_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_elapsed_time_ms() -> u64 {
    60_000
}

impl Default for ExponentialBackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            max_elapsed_time_ms: default_max_elapsed_time_ms(),
            max_retries: None,
        }
    }
}

impl BackoffConfig {
    /// 🏗️ Turn config into the prototype policy the processor clones per commit.
    pub fn build(&self) -> Box<dyn Backoff> {
        match self {
            BackoffConfig::Exponential(exp) => Box::new(
                ExponentialBackoff::new(
                    Duration::from_millis(exp.initial_interval_ms),
                    Duration::from_millis(exp.max_interval_ms),
                )
                .with_multiplier(exp.multiplier)
                .with_max_elapsed_time(
                    (exp.max_elapsed_time_ms > 0).then(|| Duration::from_millis(exp.max_elapsed_time_ms)),
                )
                .with_max_retries(exp.max_retries),
            ),
            BackoffConfig::Constant {
                interval_ms,
                max_retries,
            } => Box::new(
                ConstantBackoff::new(Duration::from_millis(*interval_ms)).with_max_retries(*max_retries),
            ),
            BackoffConfig::Stop => Box::new(StopBackoff),
        }
    }
}
