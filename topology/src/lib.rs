//! Latency/reliability topology for simulated networks.
//!
//! A [Topology] is a graph of network points-of-presence: each vertex carries
//! an intra-PoP latency [Cdf] and a reliability probability, and each
//! directional edge carries an inter-PoP latency [Cdf] and reliability.
//! Lookups between attached vertices answer from the direct edge when one
//! exists; otherwise a memoizing shortest-path layer computes (and caches)
//! routes from the source to every currently-attached destination at once.
//!
//! Graph mutation and path-cache access are guarded by independent
//! reader/writer locks so read-mostly latency queries never serialize behind
//! unrelated cache population.

mod cdf;
pub use cdf::Cdf;
mod graph;
pub use graph::Topology;
mod path;
pub use path::Path;

use thiserror::Error;

/// Identifier for a network point-of-presence.
pub type VertexId = u64;

/// Sentinel returned by latency/reliability lookups for unroutable pairs.
pub const UNROUTABLE: f64 = -1.0;

/// Errors that can only occur at topology construction or validation time.
///
/// Missing vertices or edges during lookups are not errors: they log a
/// warning and return the [UNROUTABLE] sentinel, since the caller treats
/// them as "currently unroutable".
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid cdf: {0}")]
    InvalidCdf(&'static str),
    #[error("topology is empty")]
    Empty,
    #[error("vertex {to} unreachable from {from}")]
    Disconnected { from: VertexId, to: VertexId },
    #[error("vertex {0} is under-attributed")]
    Unattributed(VertexId),
}
