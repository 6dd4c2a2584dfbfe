//! The command-channel schema: requests served by the store, their
//! responses, and the framing envelope spoken between peers.
//!
//! Commands form a tagged sum dispatched by a single match; malformed
//! requests come back as [`KvResponse::Error`] rather than tearing the
//! connection down.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::value::{Publication, Value};

/// How a node reaches a peer: its command endpoint, its publication
/// endpoint, and whether it participates in spanning-tree flooding.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerSpec {
    pub cmd_addr: String,
    pub pub_addr: String,
    #[serde(default)]
    pub support_flood_optimization: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeySetParams {
    #[serde(default)]
    pub key_vals: BTreeMap<String, Value>,
    /// Expiration tombstones travelling with a flood.
    #[serde(default)]
    pub expired_keys: Vec<String>,
    #[serde(default)]
    pub solicit_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flood_root_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyGetParams {
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyDumpParams {
    /// Comma-separated list of key prefixes; empty matches everything.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub originator_ids: BTreeSet<String>,
    /// When present the responder diffs against these hashes instead of
    /// dumping everything (three-way sync).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_val_hashes: Option<BTreeMap<String, Value>>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerAddParams {
    pub peers: BTreeMap<String, PeerSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerDelParams {
    pub peer_names: Vec<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DualMessageKind {
    Update,
    Query,
    Reply,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DualMessage {
    pub root_id: String,
    pub kind: DualMessageKind,
    /// Sender's reported distance to the root; `i64::MAX` when unreachable.
    pub distance: i64,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DualMessages {
    /// Node the messages originate from.
    pub src_id: String,
    pub messages: Vec<DualMessage>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FloodTopoSetParams {
    pub root_id: String,
    pub src_id: String,
    pub set_child: bool,
    /// When true `root_id` is ignored and the action applies to all roots.
    #[serde(default)]
    pub all_roots: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SptInfo {
    pub passive: bool,
    pub cost: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SptInfos {
    #[serde(default)]
    pub infos: BTreeMap<String, SptInfo>,
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flood_root_id: Option<String>,
    #[serde(default)]
    pub flood_peers: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerCmdReply {
    pub peers: BTreeMap<String, PeerSpec>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum KvRequest {
    KeySet(KeySetParams),
    KeyGet(KeyGetParams),
    KeyDump(KeyDumpParams),
    HashDump(KeyDumpParams),
    PeerAdd(PeerAddParams),
    PeerDel(PeerDelParams),
    PeerDump,
    Dual(DualMessages),
    FloodTopoSet(FloodTopoSetParams),
    FloodTopoGet,
    CountersGet,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum KvResponse {
    Ok,
    Publication(Publication),
    Peers(PeerCmdReply),
    SptInfos(SptInfos),
    Counters(BTreeMap<String, i64>),
    Error(String),
}

/// Frames exchanged on a command connection. The initiator introduces
/// itself with `Hello`, then sends requests; `id` is present only when a
/// response is solicited.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum WireMessage {
    Hello {
        node_id: String,
        connect_id: String,
    },
    Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        request: KvRequest,
    },
    Response {
        id: u64,
        response: KvResponse,
    },
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod rpc_tests;
