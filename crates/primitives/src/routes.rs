//! Route databases published by the decision engine and consumed by the
//! FIB programmer.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::lsdb::IpPrefix;
use crate::perf::PerfEvents;

#[derive(Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct NextHop {
    /// Neighbor the packet is handed to.
    pub node: String,
    pub if_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    /// Path cost through this nexthop.
    pub metric: i64,
    /// Label to push for MPLS-forwarded prefixes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_label: Option<i32>,
    /// True for loop-free alternates kept alongside the shortest paths.
    #[serde(default)]
    pub is_lfa: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UnicastRoute {
    pub dest: IpPrefix,
    pub nexthops: Vec<NextHop>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RouteDatabase {
    pub this_node_name: String,
    #[serde(default)]
    pub unicast_routes: Vec<UnicastRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf_events: Option<PerfEvents>,
}

/// Incremental change relative to the previously published database.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RouteDatabaseDelta {
    pub this_node_name: String,
    #[serde(default)]
    pub routes_to_update: Vec<UnicastRoute>,
    #[serde(default)]
    pub routes_to_delete: Vec<IpPrefix>,
}

impl RouteDatabaseDelta {
    pub fn is_empty(&self) -> bool {
        self.routes_to_update.is_empty() && self.routes_to_delete.is_empty()
    }
}

/// What the decision engine emits on its publication channel.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RouteUpdate {
    Full(RouteDatabase),
    Delta(RouteDatabaseDelta),
}

/// Diffs two route databases into the delta the FIB applies.
pub fn route_db_delta(old: &RouteDatabase, new: &RouteDatabase) -> RouteDatabaseDelta {
    let mut delta = RouteDatabaseDelta {
        this_node_name: new.this_node_name.clone(),
        ..Default::default()
    };

    for route in &new.unicast_routes {
        let unchanged = old
            .unicast_routes
            .iter()
            .any(|previous| previous == route);
        if !unchanged {
            delta.routes_to_update.push(route.clone());
        }
    }

    for previous in &old.unicast_routes {
        let still_present = new
            .unicast_routes
            .iter()
            .any(|route| route.dest == previous.dest);
        if !still_present {
            delta.routes_to_delete.push(previous.dest);
        }
    }

    delta
}

#[cfg(test)]
#[path = "routes_tests.rs"]
mod routes_tests;
