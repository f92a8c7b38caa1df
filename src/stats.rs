//! Per-call timing statistics.
//!
//! Every wrapped lifecycle call (`prepare`, `start`, `trigger`, `stop`,
//! `reading`, `wait_ready`) is timed and stored under the key
//! `"<object>.<phase>"`. The chain owns one [`ChainStats`] shared by all of its
//! objects; `Chain::reset_stats` clears it between scans.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::error::{AcqResult, Phase};

/// One timed call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStat {
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Aggregate over all calls recorded under one key.
#[derive(Debug, Clone, PartialEq)]
pub struct StatSummary {
    pub key: String,
    pub count: usize,
    pub total: Duration,
    pub max: Duration,
}

#[derive(Debug, Default)]
pub struct ChainStats {
    calls: Mutex<HashMap<String, Vec<CallStat>>>,
}

impl ChainStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, object: &str, phase: Phase, stat: CallStat) {
        self.calls
            .lock()
            .entry(format!("{}.{}", object, phase))
            .or_default()
            .push(stat);
    }

    /// Number of calls recorded for `object.phase`.
    pub fn count(&self, object: &str, phase: Phase) -> usize {
        self.calls
            .lock()
            .get(&format!("{}.{}", object, phase))
            .map_or(0, Vec::len)
    }

    pub fn snapshot(&self) -> HashMap<String, Vec<CallStat>> {
        self.calls.lock().clone()
    }

    /// Per-key aggregates sorted by key.
    pub fn summary(&self) -> Vec<StatSummary> {
        let calls = self.calls.lock();
        let mut summary: Vec<StatSummary> = calls
            .iter()
            .map(|(key, stats)| StatSummary {
                key: key.clone(),
                count: stats.len(),
                total: stats.iter().map(|s| s.elapsed).sum(),
                max: stats.iter().map(|s| s.elapsed).max().unwrap_or_default(),
            })
            .collect();
        summary.sort_by(|a, b| a.key.cmp(&b.key));
        summary
    }

    pub fn reset(&self) {
        self.calls.lock().clear();
    }
}

/// Run `fut`, logging start/end/failure and recording its duration.
pub(crate) async fn profile<T, F>(
    stats: Option<Arc<ChainStats>>,
    object: &str,
    phase: Phase,
    fut: F,
) -> AcqResult<T>
where
    F: Future<Output = AcqResult<T>>,
{
    let started = Utc::now();
    let clock = Instant::now();
    debug!(object, %phase, "start");

    let result = fut.await;

    let elapsed = clock.elapsed();
    if let Err(err) = &result {
        error!(object, %phase, error = %err, "exception caught");
    }
    debug!(object, %phase, elapsed_ms = elapsed.as_secs_f64() * 1e3, "end");
    if let Some(stats) = stats {
        stats.record(object, phase, CallStat { started, elapsed });
    }
    result
}
