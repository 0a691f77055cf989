//! Status-code histogram and request QPS, persisted across restarts.
//!
//! A single worker task owns the histogram and drains a channel of status
//! codes. Two sentinel codes drive it: a tick (persist the histogram and
//! resample QPS) and a clear. The synthetic pass-through code marks cache
//! misses and is excluded from the user-visible totals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

/// Synthetic code recorded on each cache miss.
pub const STATUS_PASS_THROUGH: i32 = 600;

const ACTION_TICK: i32 = 0;
const ACTION_CLEAR: i32 = -1;

/// Sled key holding the serialized histogram.
pub const DB_KEY: &str = "reqStatusCodeCounts";

/// Persistence and sampling period.
pub const SAMPLE_SPAN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct QpsState {
    qps: f64,
    last_total: u64,
    last_time: DateTime<Utc>,
}

/// The histogram aggregator.
pub struct ReqCount {
    tx: mpsc::UnboundedSender<i32>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<i32>>>,
    codes: RwLock<HashMap<i32, u64>>,
    qps: Mutex<QpsState>,
    db: sled::Db,
}

impl ReqCount {
    /// Aggregator persisting into `db`.
    pub fn new(db: sled::Db) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            codes: RwLock::new(HashMap::new()),
            qps: Mutex::new(QpsState {
                qps: 0.0,
                last_total: 0,
                last_time: Utc::now(),
            }),
            db,
        })
    }

    /// Record a served status code. Never blocks.
    pub fn send(&self, code: i32) {
        let _ = self.tx.send(code);
    }

    /// Zero the histogram.
    pub fn clear(&self) {
        let _ = self.tx.send(ACTION_CLEAR);
    }

    /// Copy of the histogram.
    pub fn codes(&self) -> HashMap<i32, u64> {
        self.codes.read().clone()
    }

    /// Sum over all codes except the pass-through marker.
    pub fn total(&self) -> u64 {
        self.codes
            .read()
            .iter()
            .filter(|(code, _)| **code != STATUS_PASS_THROUGH)
            .map(|(_, n)| n)
            .sum()
    }

    /// Requests per second over the last sample window.
    pub fn qps(&self) -> f64 {
        self.qps.lock().qps
    }

    /// Total at the last sample.
    pub fn last_total(&self) -> u64 {
        self.qps.lock().last_total
    }

    /// Wall-clock time of the last sample, in milliseconds.
    pub fn last_time_millis(&self) -> i64 {
        self.qps.lock().last_time.timestamp_millis()
    }

    fn load(&self) {
        let data = match self.db.get(DB_KEY) {
            Ok(Some(data)) => data,
            _ => return,
        };
        if let Ok(saved) = serde_json::from_slice::<HashMap<i32, u64>>(&data) {
            *self.codes.write() = saved;
        }
        let mut qps = self.qps.lock();
        qps.last_time = Utc::now();
        qps.last_total = self.total();
    }

    fn save(&self) {
        let data = match serde_json::to_vec(&*self.codes.read()) {
            Ok(data) => data,
            Err(_) => return,
        };
        if let Err(err) = self.db.insert(DB_KEY, data) {
            log::error!("persist status counts: {}", err);
        }
    }

    fn sample_qps(&self) {
        let total = self.total();
        let now = Utc::now();
        let mut qps = self.qps.lock();
        let span = (now - qps.last_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if span >= SAMPLE_SPAN {
            qps.qps = total.saturating_sub(qps.last_total) as f64 / span.as_secs_f64();
        }
        qps.last_time = now;
        qps.last_total = total;
    }

    /// Start the owning worker and the tick timer. Call once.
    pub fn spawn_worker(self: &Arc<Self>) {
        let mut rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };

        self.load();

        let ticker = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SAMPLE_SPAN);
            loop {
                tick.tick().await;
                let _ = ticker.tx.send(ACTION_TICK);
            }
        });

        let worker = self.clone();
        tokio::spawn(async move {
            while let Some(code) = rx.recv().await {
                match code {
                    ACTION_TICK => {
                        worker.save();
                        worker.sample_qps();
                    }
                    ACTION_CLEAR => {
                        worker.codes.write().clear();
                    }
                    code => {
                        *worker.codes.write().entry(code).or_insert(0) += 1;
                    }
                }
            }
        });
    }
}
