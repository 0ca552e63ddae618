//! Memoized shortest paths between points-of-presence.
//!
//! For graphs too large to pre-compute pairwise, a cache miss runs one
//! Dijkstra pass from the source to every currently-attached destination and
//! memoizes all discovered paths, amortizing the cost across future lookups
//! from the same source.

use crate::{graph::Graph, VertexId};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap},
};

/// A routed path between two points-of-presence.
#[derive(Clone, Debug, PartialEq)]
pub struct Path {
    /// End-to-end latency in milliseconds (sum of edge mean latencies).
    pub latency_ms: f64,
    /// End-to-end reliability (product of edge reliabilities).
    pub reliability: f64,
    /// Vertices traversed, source and destination included.
    pub hops: Vec<VertexId>,
}

/// Lazily populated (src, dst) -> [Path] cache.
#[derive(Debug, Default)]
pub(crate) struct PathCache {
    paths: BTreeMap<(VertexId, VertexId), Path>,
}

impl PathCache {
    pub(crate) fn get(&self, src: VertexId, dst: VertexId) -> Option<&Path> {
        self.paths.get(&(src, dst))
    }

    pub(crate) fn insert(&mut self, src: VertexId, dst: VertexId, path: Path) {
        // First computation wins; repeated lookups must return the same entry.
        self.paths.entry((src, dst)).or_insert(path);
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&(VertexId, VertexId), &Path)> {
        self.paths.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.paths.len()
    }
}

/// Edge weight ordered by total order on f64.
#[derive(PartialEq)]
struct Cost(f64);

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Run a single-source Dijkstra from `src`, returning a [Path] for every
/// vertex in `targets` that is reachable.
///
/// Edge weights are the mean of the edge latency distribution, so repeated
/// runs are deterministic and cached entries are idempotent.
pub(crate) fn shortest_paths(
    graph: &Graph,
    src: VertexId,
    targets: &BTreeSet<VertexId>,
) -> Vec<(VertexId, Path)> {
    let mut dist: BTreeMap<VertexId, f64> = BTreeMap::new();
    let mut predecessor: BTreeMap<VertexId, VertexId> = BTreeMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(src, 0.0);
    heap.push(Reverse((Cost(0.0), src)));

    while let Some(Reverse((Cost(cost), vertex))) = heap.pop() {
        if dist.get(&vertex).is_some_and(|&best| cost > best) {
            continue;
        }
        for (next, edge) in graph.outgoing(vertex) {
            if next == vertex {
                continue;
            }
            let candidate = cost + edge.latency.mean();
            if dist.get(&next).map_or(true, |&best| candidate < best) {
                dist.insert(next, candidate);
                predecessor.insert(next, vertex);
                heap.push(Reverse((Cost(candidate), next)));
            }
        }
    }

    let mut paths = Vec::new();
    for &target in targets {
        if target == src {
            continue;
        }
        let Some(&latency_ms) = dist.get(&target) else {
            continue;
        };

        // Walk predecessors back to the source to recover the hop list.
        let mut hops = vec![target];
        let mut cursor = target;
        while cursor != src {
            cursor = predecessor[&cursor];
            hops.push(cursor);
        }
        hops.reverse();

        let mut reliability = 1.0;
        for pair in hops.windows(2) {
            if let Some(edge) = graph.edge(pair[0], pair[1]) {
                reliability *= edge.reliability;
            }
        }

        paths.push((
            target,
            Path {
                latency_ms,
                reliability,
                hops,
            },
        ));
    }
    paths
}
