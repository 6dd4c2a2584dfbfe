//! Shared types for the Meridian routing platform.
//!
//! Everything that travels between nodes or between subsystems lives here:
//! versioned key-values and their publication deltas, the LSDB payloads
//! (adjacency and prefix databases), the route databases the decision
//! engine emits, and the request/response enums spoken on the command
//! channel.

pub mod backoff;
pub mod lsdb;
pub mod perf;
pub mod routes;
pub mod rpc;
pub mod value;

pub use backoff::ExponentialBackoff;
pub use lsdb::{
    Adjacency, AdjacencyDatabase, IpPrefix, PrefixDatabase, PrefixEntry, PrefixForwardingAlgo,
    PrefixForwardingType, PrefixType,
};
pub use perf::{PerfEvent, PerfEvents};
pub use routes::{
    route_db_delta, NextHop, RouteDatabase, RouteDatabaseDelta, RouteUpdate, UnicastRoute,
};
pub use rpc::{
    DualMessage, DualMessageKind, DualMessages, FloodTopoSetParams, KeyDumpParams, KeyGetParams,
    KeySetParams, KvRequest, KvResponse, PeerAddParams, PeerCmdReply, PeerDelParams, PeerSpec,
    SptInfo, SptInfos, WireMessage,
};
pub use value::{generate_hash, Publication, Value, TTL_INFINITY};

/// Default marker prefixing adjacency database keys (`adj:<node>`).
pub const ADJ_DB_MARKER: &str = "adj:";

/// Default marker prefixing prefix database keys (`prefix:<node>`).
pub const PREFIX_DB_MARKER: &str = "prefix:";
