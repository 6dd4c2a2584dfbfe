//! Counter accumulation and fire-and-forget monitor submission.
//!
//! Subsystems bump named stats on the hot path; a periodic timer pushes
//! snapshots to the monitor without ever applying back-pressure.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

/// How a stat folds repeated samples into its exported value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExportType {
    /// Number of samples.
    Count,
    /// Running total of sample values.
    Sum,
    /// Mean of sample values.
    Avg,
}

#[derive(Clone, Copy, Debug, Default)]
struct Stat {
    count: i64,
    sum: i64,
}

#[derive(Debug, Default)]
struct Inner {
    stats: BTreeMap<String, (ExportType, Stat)>,
    gauges: BTreeMap<String, i64>,
}

/// Thread-safe store of named counters, cloneable across subsystems.
#[derive(Clone, Debug, Default)]
pub struct CounterStore {
    inner: Arc<Mutex<Inner>>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one sample into the named stat.
    pub fn add_value(&self, name: &str, value: i64, export: ExportType) {
        let mut inner = self.inner.lock().expect("counter store poisoned");
        let (_, stat) = inner
            .stats
            .entry(name.to_owned())
            .or_insert((export, Stat::default()));
        stat.count += 1;
        stat.sum = stat.sum.saturating_add(value);
    }

    pub fn bump(&self, name: &str) {
        self.add_value(name, 1, ExportType::Count);
    }

    /// Sets a flat gauge, overwriting any previous value.
    pub fn set_gauge(&self, name: &str, value: i64) {
        let mut inner = self.inner.lock().expect("counter store poisoned");
        let _ = inner.gauges.insert(name.to_owned(), value);
    }

    /// Non-destructive snapshot of every stat and gauge.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let inner = self.inner.lock().expect("counter store poisoned");
        let mut out = BTreeMap::new();
        for (name, (export, stat)) in &inner.stats {
            let value = match export {
                ExportType::Count => stat.count,
                ExportType::Sum => stat.sum,
                ExportType::Avg => {
                    if stat.count == 0 {
                        0
                    } else {
                        stat.sum / stat.count
                    }
                }
            };
            let _ = out.insert(name.clone(), value);
        }
        for (name, value) in &inner.gauges {
            let _ = out.insert(name.clone(), *value);
        }
        out
    }
}

/// Fire-and-forget handle to the monitor task; dropped submissions are
/// acceptable, blocking the caller is not.
#[derive(Clone, Debug)]
pub struct MonitorClient {
    tx: mpsc::UnboundedSender<(String, BTreeMap<String, i64>)>,
}

impl MonitorClient {
    pub fn set_counters(&self, source: &str, counters: BTreeMap<String, i64>) {
        let _ = self.tx.send((source.to_owned(), counters));
    }
}

/// Spawns the monitor sink; snapshots are logged at debug level. A real
/// deployment points this at an external collector instead.
pub fn spawn_monitor() -> MonitorClient {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, BTreeMap<String, i64>)>();
    drop(tokio::spawn(async move {
        while let Some((source, counters)) = rx.recv().await {
            debug!(%source, num_counters = counters.len(), "counters submitted");
        }
    }));
    MonitorClient { tx }
}

/// A monitor client whose submissions go nowhere; for tests and tools.
pub fn null_monitor() -> MonitorClient {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    MonitorClient { tx }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod lib_tests;
