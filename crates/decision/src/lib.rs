//! The decision engine: SPF route computation over the replicated
//! link-state database, debounced and published as full databases plus
//! deltas for the FIB programmer.

pub mod controller;
pub mod spf;

pub use controller::{Decision, DecisionClient, DecisionRequest};
pub use spf::{FirstHop, SpfNode, SpfSolver};
