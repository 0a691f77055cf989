//! Per-URI execution accounting and admission control.
//!
//! Every script execution passes through `admit` before it runs and `end`
//! after it finishes. Admission enforces two per-file caps: the number of
//! simultaneous executions and the cumulative execution time (the quota).
//! A periodic sampler derives per-URI QPS from the served counts, and a
//! daily maintenance tick dumps the table and starts accounting afresh.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cron::Schedule;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Sampling period of the QPS estimator.
pub const QPS_SAMPLE_SPAN: Duration = Duration::from_millis(100);

/// Daily dump-and-purge schedule: 03:00 local time.
const PURGE_SCHEDULE: &str = "0 0 3 * * *";

/// Accounting state of one URI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostInfo {
    /// Cumulative execution time in nanoseconds.
    pub cost: u64,
    /// Admitted executions so far.
    pub count: u64,
    /// `count` at the previous QPS sample.
    pub old_count: u64,
    /// Executions currently in flight.
    pub concurrent: u32,
    /// Admissions per second over the last sample window.
    pub qps: f64,
    /// Admissions refused so far.
    pub rejected: u64,
    /// Quota the file declared at its last admission.
    pub quota: u64,
}

/// The accounting table.
pub struct CostAccountant {
    table: DashMap<String, CostInfo>,
    last_sample: Mutex<Instant>,
}

impl CostAccountant {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
            last_sample: Mutex::new(Instant::now()),
        }
    }

    /// Decide whether one more execution of `uri` may start. Returns
    /// `true` to reject. A first-seen URI is always admitted; afterwards
    /// the concurrent cap and the cumulative quota both have to hold.
    pub fn admit(&self, uri: &str, quota: u64, max_concurrent: u32) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.table.entry(uri.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(CostInfo {
                    count: 1,
                    concurrent: 1,
                    quota,
                    ..CostInfo::default()
                });
                false
            }
            Entry::Occupied(mut slot) => {
                let info = slot.get_mut();
                info.quota = quota;
                if info.concurrent >= max_concurrent || info.cost >= quota {
                    info.rejected += 1;
                    true
                } else {
                    info.concurrent += 1;
                    info.count += 1;
                    false
                }
            }
        }
    }

    /// Record the end of an execution. The concurrent counter saturates
    /// at zero so an unpaired decrement can never drive it negative.
    pub fn end(&self, uri: &str, elapsed_ns: u64) {
        if let Some(mut info) = self.table.get_mut(uri) {
            info.concurrent = info.concurrent.saturating_sub(1);
            info.cost += elapsed_ns;
        }
    }

    /// Accounting state of one URI.
    pub fn get(&self, uri: &str) -> Option<CostInfo> {
        self.table.get(uri).map(|info| info.clone())
    }

    /// Snapshot of the whole table.
    pub fn list(&self) -> Vec<(String, CostInfo)> {
        self.table
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Recompute the per-URI QPS from the counts accumulated since the
    /// previous sample.
    pub fn sample_qps(&self) {
        let mut last = self.last_sample.lock();
        let elapsed = last.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        for mut entry in self.table.iter_mut() {
            let info = entry.value_mut();
            info.qps = (info.count - info.old_count) as f64 / elapsed;
            info.old_count = info.count;
        }
        *last = Instant::now();
    }

    /// Drop all accounting state.
    pub fn purge(&self) {
        self.table.clear();
    }

    fn dump_and_purge(&self) {
        let list: Vec<_> = self
            .list()
            .into_iter()
            .map(|(uri, info)| {
                serde_json::json!({
                    "URI": uri,
                    "Cost": info.cost,
                    "Count": info.count,
                    "Rejected": info.rejected,
                })
            })
            .collect();
        log::info!(
            "cost table dump: {}",
            serde_json::to_string(&list).unwrap_or_default()
        );
        self.purge();
        log::info!("purged cost table");
    }

    /// Start the sampler and the daily maintenance tick.
    pub fn spawn_tasks(self: &Arc<Self>) {
        let sampler = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(QPS_SAMPLE_SPAN);
            loop {
                tick.tick().await;
                sampler.sample_qps();
            }
        });

        let daily = self.clone();
        tokio::spawn(async move {
            // The schedule string is a constant and always parses.
            let schedule = match Schedule::from_str(PURGE_SCHEDULE) {
                Ok(s) => s,
                Err(err) => {
                    log::error!("bad purge schedule: {}", err);
                    return;
                }
            };
            loop {
                let next = match schedule.upcoming(chrono::Local).next() {
                    Some(at) => at,
                    None => return,
                };
                let wait = (next - chrono::Local::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(wait).await;
                daily.dump_and_purge();
            }
        });
    }
}

impl Default for CostAccountant {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_admission_creates_entry() {
        let cost = CostAccountant::new();
        assert!(!cost.admit("u", 1000, 1));
        let info = cost.get("u").unwrap();
        assert_eq!(info.count, 1);
        assert_eq!(info.concurrent, 1);
    }

    #[test]
    fn test_concurrent_cap_rejects() {
        let cost = CostAccountant::new();
        assert!(!cost.admit("u", u64::MAX, 1));
        // Second simultaneous execution is over the cap.
        assert!(cost.admit("u", u64::MAX, 1));
        assert_eq!(cost.get("u").unwrap().rejected, 1);

        cost.end("u", 10);
        assert!(!cost.admit("u", u64::MAX, 1));
    }

    #[test]
    fn test_quota_exhaustion_rejects() {
        let cost = CostAccountant::new();
        assert!(!cost.admit("u", 100, 10));
        cost.end("u", 150);
        assert!(cost.admit("u", 100, 10));
        let info = cost.get("u").unwrap();
        assert_eq!(info.rejected, 1);
        assert_eq!(info.cost, 150);
    }

    #[test]
    fn test_end_saturates_at_zero() {
        let cost = CostAccountant::new();
        assert!(!cost.admit("u", u64::MAX, 10));
        cost.end("u", 1);
        cost.end("u", 1);
        assert_eq!(cost.get("u").unwrap().concurrent, 0);
    }

    #[test]
    fn test_sample_qps_snapshots_count() {
        let cost = CostAccountant::new();
        assert!(!cost.admit("u", u64::MAX, 10));
        std::thread::sleep(Duration::from_millis(5));
        cost.sample_qps();
        let info = cost.get("u").unwrap();
        assert!(info.qps > 0.0);
        assert_eq!(info.old_count, info.count);

        std::thread::sleep(Duration::from_millis(5));
        cost.sample_qps();
        assert_eq!(cost.get("u").unwrap().qps, 0.0);
    }

    #[test]
    fn test_purge() {
        let cost = CostAccountant::new();
        cost.admit("u", 1, 1);
        cost.purge();
        assert!(cost.get("u").is_none());
    }
}
