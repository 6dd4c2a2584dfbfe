//! Performance event chains carried through the pipeline to measure
//! end-to-end convergence.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PerfEvent {
    pub node_name: String,
    pub event_name: String,
    /// Milliseconds since the unix epoch.
    pub unix_ts: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PerfEvents {
    pub events: Vec<PerfEvent>,
}

impl PerfEvents {
    /// Appends an event stamped with the current wall clock.
    pub fn mark(&mut self, node_name: &str, event_name: &str) {
        self.events.push(PerfEvent {
            node_name: node_name.to_owned(),
            event_name: event_name.to_owned(),
            unix_ts: unix_ts_now(),
        });
    }

    /// Timestamp of the first event in the chain, if any.
    pub fn started_at(&self) -> Option<i64> {
        self.events.first().map(|event| event.unix_ts)
    }
}

pub fn unix_ts_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
