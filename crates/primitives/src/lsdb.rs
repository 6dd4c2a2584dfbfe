//! Link-state database payloads: adjacency and prefix announcements.
//!
//! These are the decoded forms of the values published into the store
//! under the `adj:` and `prefix:` key markers.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::perf::PerfEvents;

/// An IP prefix rendered as `addr/len` on the wire.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct IpPrefix {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

#[derive(Debug, Error)]
pub enum IpPrefixParseError {
    #[error("missing '/' separator in prefix: {0}")]
    MissingSeparator(String),
    #[error("invalid address in prefix: {0}")]
    InvalidAddr(#[from] std::net::AddrParseError),
    #[error("invalid prefix length: {0}")]
    InvalidLen(#[from] std::num::ParseIntError),
}

impl IpPrefix {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    pub fn is_v4(&self) -> bool {
        self.addr.is_ipv4()
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = IpPrefixParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| IpPrefixParseError::MissingSeparator(s.to_owned()))?;
        Ok(Self {
            addr: addr.parse()?,
            prefix_len: len.parse()?,
        })
    }
}

impl Serialize for IpPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// One directed adjacency reported by a node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Adjacency {
    pub other_node_name: String,
    pub if_name: String,
    pub metric: i64,
    /// MPLS label allocated for this adjacency.
    #[serde(default)]
    pub adj_label: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nexthop_v4: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nexthop_v6: Option<IpAddr>,
    /// Overloaded links carry no transit traffic.
    #[serde(default)]
    pub is_overloaded: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AdjacencyDatabase {
    pub this_node_name: String,
    /// Overloaded nodes are not used for transit.
    #[serde(default)]
    pub is_overloaded: bool,
    #[serde(default)]
    pub adjacencies: Vec<Adjacency>,
    /// MPLS label identifying this node.
    #[serde(default)]
    pub node_label: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf_events: Option<PerfEvents>,
}

/// Origin class of a prefix announcement; lower sorts as preferred on
/// equal-cost ties.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Default,
)]
pub enum PrefixType {
    #[default]
    Loopback,
    Static,
    Bgp,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Default,
)]
pub enum PrefixForwardingType {
    #[default]
    Ip,
    Mpls,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Default,
)]
pub enum PrefixForwardingAlgo {
    #[default]
    SpEcmp,
    Ksp2EdEcmp,
}

#[derive(Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PrefixEntry {
    pub prefix: IpPrefix,
    #[serde(default)]
    pub prefix_type: PrefixType,
    #[serde(default)]
    pub forwarding_type: PrefixForwardingType,
    #[serde(default)]
    pub forwarding_algo: PrefixForwardingAlgo,
    /// Tie-break metric among equal-cost announcing nodes; lower wins.
    #[serde(default)]
    pub metric: i64,
}

impl PrefixEntry {
    pub fn new(prefix: IpPrefix) -> Self {
        Self {
            prefix,
            prefix_type: PrefixType::default(),
            forwarding_type: PrefixForwardingType::default(),
            forwarding_algo: PrefixForwardingAlgo::default(),
            metric: 0,
        }
    }

    /// Ordering tuple applied among equal-cost best nodes.
    pub fn tie_break_key(&self) -> (PrefixType, PrefixForwardingType, i64) {
        (self.prefix_type, self.forwarding_type, self.metric)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PrefixDatabase {
    pub this_node_name: String,
    #[serde(default)]
    pub prefix_entries: Vec<PrefixEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf_events: Option<PerfEvents>,
}

#[cfg(test)]
#[path = "lsdb_tests.rs"]
mod lsdb_tests;
