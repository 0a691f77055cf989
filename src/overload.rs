//! Reactive eviction of cache entries whose upstream recently failed.
//!
//! Failure reports are staged and coalesced by key. A periodic tick
//! inspects the staged set and only drains it once no new report has
//! arrived for a full tick, so a transient spike never triggers a wave of
//! evictions mid-storm. Each drain is capped at a handful of entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Which upstream call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadOrigin {
    /// A file fetch.
    File,
    /// A glob RPC.
    Glob,
}

/// One staged failure report.
#[derive(Debug, Clone)]
pub struct OverloadMessage {
    /// Failure origin.
    pub origin: OverloadOrigin,
    /// The URI or pattern involved.
    pub uri: String,
    /// For glob failures, which ordering's cache was involved.
    pub desc: bool,
}

/// Eviction callback for file-origin failures.
pub type FileHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Eviction callback for glob-origin failures.
pub type GlobHandler = Box<dyn Fn(&str, bool) + Send + Sync>;

const ACTIVITY_SPAN: Duration = Duration::from_secs(1);
const POP_LIMIT: usize = 5;

struct Staged {
    messages: HashMap<String, OverloadMessage>,
    last_activity: Instant,
}

/// The failure monitor.
pub struct OverloadMonitor {
    staged: Mutex<Staged>,
    file_handler: FileHandler,
    glob_handler: GlobHandler,
}

impl OverloadMonitor {
    /// Create a monitor with the two eviction callbacks.
    pub fn new(file_handler: FileHandler, glob_handler: GlobHandler) -> Self {
        Self {
            staged: Mutex::new(Staged {
                messages: HashMap::new(),
                last_activity: Instant::now(),
            }),
            file_handler,
            glob_handler,
        }
    }

    fn key(msg: &OverloadMessage) -> String {
        match msg.origin {
            OverloadOrigin::File => format!("file:{}", msg.uri),
            OverloadOrigin::Glob => format!("glob:{}:{}", msg.desc as u8, msg.uri),
        }
    }

    /// Stage a failure report, coalescing repeats of the same key.
    pub fn report(&self, origin: OverloadOrigin, uri: &str, desc: bool) {
        let msg = OverloadMessage {
            origin,
            uri: uri.to_string(),
            desc,
        };
        let mut staged = self.staged.lock();
        staged.last_activity = Instant::now();
        staged.messages.insert(Self::key(&msg), msg);
    }

    /// Drain up to the pop limit, but only when the staged set has been
    /// quiet for at least one activity span.
    pub fn pop(&self) {
        let drained: Vec<OverloadMessage> = {
            let mut staged = self.staged.lock();
            if staged.messages.is_empty() {
                return;
            }
            if staged.last_activity.elapsed() < ACTIVITY_SPAN {
                return;
            }
            let keys: Vec<String> = staged.messages.keys().take(POP_LIMIT).cloned().collect();
            keys.into_iter()
                .filter_map(|k| staged.messages.remove(&k))
                .collect()
        };

        for msg in drained {
            match msg.origin {
                OverloadOrigin::File => (self.file_handler)(&msg.uri),
                OverloadOrigin::Glob => (self.glob_handler)(&msg.uri, msg.desc),
            }
        }
    }

    /// Number of staged reports.
    pub fn staged_count(&self) -> usize {
        self.staged.lock().messages.len()
    }

    /// Drop every staged report without invoking handlers.
    pub fn purge(&self) {
        self.staged.lock().messages.clear();
    }

    /// Start the periodic drain tick.
    pub fn spawn_tick(self: &Arc<Self>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ACTIVITY_SPAN);
            loop {
                tick.tick().await;
                monitor.pop();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor_with_counters() -> (Arc<OverloadMonitor>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let files = Arc::new(AtomicUsize::new(0));
        let globs = Arc::new(AtomicUsize::new(0));
        let f = files.clone();
        let g = globs.clone();
        let monitor = Arc::new(OverloadMonitor::new(
            Box::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |_, _| {
                g.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        (monitor, files, globs)
    }

    fn backdate(monitor: &OverloadMonitor) {
        monitor.staged.lock().last_activity = Instant::now() - Duration::from_secs(2);
    }

    #[test]
    fn test_coalesces_repeated_reports() {
        let (monitor, _, _) = monitor_with_counters();
        monitor.report(OverloadOrigin::File, "http://a/1", false);
        monitor.report(OverloadOrigin::File, "http://a/1", false);
        assert_eq!(monitor.staged_count(), 1);
        // Same pattern for each ordering is two distinct keys.
        monitor.report(OverloadOrigin::Glob, "^p", true);
        monitor.report(OverloadOrigin::Glob, "^p", false);
        assert_eq!(monitor.staged_count(), 3);
    }

    #[test]
    fn test_pop_waits_for_quiescence() {
        let (monitor, files, _) = monitor_with_counters();
        monitor.report(OverloadOrigin::File, "http://a/1", false);

        // Fresh activity: nothing drains.
        monitor.pop();
        assert_eq!(files.load(Ordering::SeqCst), 0);

        backdate(&monitor);
        monitor.pop();
        assert_eq!(files.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.staged_count(), 0);
    }

    #[test]
    fn test_pop_limit() {
        let (monitor, files, _) = monitor_with_counters();
        for i in 0..8 {
            monitor.report(OverloadOrigin::File, &format!("http://a/{}", i), false);
        }
        backdate(&monitor);
        monitor.pop();
        assert_eq!(files.load(Ordering::SeqCst), 5);
        assert_eq!(monitor.staged_count(), 3);
    }

    #[test]
    fn test_routes_by_origin() {
        let (monitor, files, globs) = monitor_with_counters();
        monitor.report(OverloadOrigin::File, "http://a/1", false);
        monitor.report(OverloadOrigin::Glob, "^p", true);
        backdate(&monitor);
        monitor.pop();
        assert_eq!(files.load(Ordering::SeqCst), 1);
        assert_eq!(globs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_purge_drops_without_handling() {
        let (monitor, files, _) = monitor_with_counters();
        monitor.report(OverloadOrigin::File, "http://a/1", false);
        monitor.purge();
        backdate(&monitor);
        monitor.pop();
        assert_eq!(files.load(Ordering::SeqCst), 0);
    }
}
