//! The topology graph and its concurrent access wrapper.

use crate::{
    path::{shortest_paths, PathCache},
    Cdf, Error, Path, VertexId, UNROUTABLE,
};
use rand::Rng;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
    sync::RwLock,
};
use tracing::{debug, warn};

/// A network point-of-presence.
#[derive(Clone, Debug)]
pub(crate) struct Vertex {
    /// Latency between two hosts attached to this PoP.
    pub(crate) intra: Cdf,
    /// Probability a packet survives traversal of this PoP.
    pub(crate) reliability: f64,
}

/// A directional connection between two points-of-presence.
#[derive(Clone, Debug)]
pub(crate) struct Edge {
    pub(crate) latency: Cdf,
    pub(crate) reliability: f64,
}

/// Mutable graph state, kept behind one lock so latency queries see a
/// consistent vertex/edge view.
#[derive(Debug, Default)]
pub(crate) struct Graph {
    vertices: BTreeMap<VertexId, Vertex>,
    edges: BTreeMap<(VertexId, VertexId), Edge>,
    /// Running (min, max) latency over every registered CDF.
    runahead: Option<(f64, f64)>,
}

impl Graph {
    fn absorb_runahead(&mut self, cdf: &Cdf) {
        let (low, high) = (cdf.minimum(), cdf.maximum());
        self.runahead = Some(match self.runahead {
            None => (low, high),
            Some((min, max)) => (min.min(low), max.max(high)),
        });
    }

    pub(crate) fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(&id)
    }

    pub(crate) fn edge(&self, from: VertexId, to: VertexId) -> Option<&Edge> {
        self.edges.get(&(from, to))
    }

    pub(crate) fn outgoing(&self, from: VertexId) -> impl Iterator<Item = (VertexId, &Edge)> {
        self.edges
            .range((from, VertexId::MIN)..=(from, VertexId::MAX))
            .map(|((_, to), edge)| (*to, edge))
    }

    /// A graph is complete when every ordered pair of distinct vertices has a
    /// direct edge. Complete graphs never need shortest-path computation.
    fn is_complete(&self) -> bool {
        let n = self.vertices.len();
        if n < 2 {
            return false;
        }
        let non_self = self.edges.keys().filter(|(a, b)| a != b).count();
        non_self == n * (n - 1)
    }
}

/// Latency/reliability graph with a memoizing shortest-path cache.
///
/// The graph and the cache are guarded by independent reader/writer locks:
/// populating the cache takes a read lock on the graph and a separate write
/// lock on the cache, so it never serializes behind unrelated graph reads.
#[derive(Debug, Default)]
pub struct Topology {
    graph: RwLock<Graph>,
    cache: RwLock<PathCache>,
    /// Vertices with at least one attached host, refcounted.
    attached: RwLock<BTreeMap<VertexId, usize>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a point-of-presence. A duplicate id logs a warning and is
    /// otherwise a no-op. Reliability is clamped to [0, 1] at insertion.
    pub fn add_vertex(&self, id: VertexId, intra: Cdf, reliability: f64) {
        let mut graph = self.graph.write().unwrap();
        if graph.vertices.contains_key(&id) {
            warn!(vertex = id, "duplicate vertex");
            return;
        }
        graph.absorb_runahead(&intra);
        graph.vertices.insert(
            id,
            Vertex {
                intra,
                reliability: reliability.clamp(0.0, 1.0),
            },
        );
    }

    /// Register both directions of a connection between two registered
    /// points-of-presence. A missing endpoint logs a warning and leaves the
    /// graph unchanged. Reliabilities are clamped to [0, 1] at insertion.
    pub fn add_edge(
        &self,
        a: VertexId,
        latency_ab: Cdf,
        reliability_ab: f64,
        b: VertexId,
        latency_ba: Cdf,
        reliability_ba: f64,
    ) {
        let mut graph = self.graph.write().unwrap();
        if !graph.vertices.contains_key(&a) || !graph.vertices.contains_key(&b) {
            warn!(from = a, to = b, "edge endpoint not registered");
            return;
        }
        graph.absorb_runahead(&latency_ab);
        graph.absorb_runahead(&latency_ba);
        graph.edges.insert(
            (a, b),
            Edge {
                latency: latency_ab,
                reliability: reliability_ab.clamp(0.0, 1.0),
            },
        );
        graph.edges.insert(
            (b, a),
            Edge {
                latency: latency_ba,
                reliability: reliability_ba.clamp(0.0, 1.0),
            },
        );
    }

    /// Record that a host attached to `vertex`. Attached vertices are the
    /// target set for shortest-path runs.
    pub fn attach(&self, vertex: VertexId) {
        *self.attached.write().unwrap().entry(vertex).or_insert(0) += 1;
    }

    /// Record that a host detached from `vertex`.
    pub fn detach(&self, vertex: VertexId) {
        let mut attached = self.attached.write().unwrap();
        if let Some(count) = attached.get_mut(&vertex) {
            *count -= 1;
            if *count == 0 {
                attached.remove(&vertex);
            }
        }
    }

    /// Sample the latency (milliseconds) of a direct route: the intra-PoP
    /// distribution when `src == dst`, else the correctly-directed edge.
    /// Returns [UNROUTABLE] when no direct route exists.
    pub fn end2end_latency<R: Rng>(&self, rng: &mut R, src: VertexId, dst: VertexId) -> f64 {
        let graph = self.graph.read().unwrap();
        if src == dst {
            match graph.vertex(src) {
                Some(vertex) => vertex.intra.sample(rng),
                None => {
                    warn!(vertex = src, "latency lookup for unregistered vertex");
                    UNROUTABLE
                }
            }
        } else {
            match graph.edge(src, dst) {
                Some(edge) => edge.latency.sample(rng),
                None => {
                    debug!(from = src, to = dst, "no direct edge for latency lookup");
                    UNROUTABLE
                }
            }
        }
    }

    /// Reliability of a direct route, always within [0, 1] when routable,
    /// [UNROUTABLE] otherwise.
    pub fn end2end_reliability(&self, src: VertexId, dst: VertexId) -> f64 {
        let graph = self.graph.read().unwrap();
        if src == dst {
            match graph.vertex(src) {
                Some(vertex) => vertex.reliability,
                None => {
                    warn!(vertex = src, "reliability lookup for unregistered vertex");
                    UNROUTABLE
                }
            }
        } else {
            match graph.edge(src, dst) {
                Some(edge) => edge.reliability,
                None => {
                    debug!(from = src, to = dst, "no direct edge for reliability lookup");
                    UNROUTABLE
                }
            }
        }
    }

    /// Conservative (min, max) latency bound in milliseconds over every
    /// registered distribution. The scheduler consumes this as the lookahead
    /// window bounding how far simulated time may safely advance.
    pub fn runahead(&self) -> Option<(f64, f64)> {
        self.graph.read().unwrap().runahead
    }

    /// Sample a latency for (src, dst), falling back to the cached
    /// shortest-path latency when no direct route exists. `None` means the
    /// pair is unroutable.
    pub fn latency<R: Rng>(&self, rng: &mut R, src: VertexId, dst: VertexId) -> Option<f64> {
        let direct = self.end2end_latency(rng, src, dst);
        if direct >= 0.0 {
            return Some(direct);
        }
        self.path(src, dst).map(|path| path.latency_ms)
    }

    /// Reliability for (src, dst), falling back to the cached shortest-path
    /// reliability when no direct route exists.
    pub fn reliability(&self, src: VertexId, dst: VertexId) -> Option<f64> {
        let direct = self.end2end_reliability(src, dst);
        if direct >= 0.0 {
            return Some(direct);
        }
        self.path(src, dst).map(|path| path.reliability)
    }

    /// Resolve the routed path between two points-of-presence.
    ///
    /// Complete graphs answer from the direct edge without ever running
    /// shortest-path. Otherwise a cache miss runs one Dijkstra pass from
    /// `src` to every attached destination and memoizes all results. A
    /// self-loop with no self-edge approximates as twice the minimum
    /// outgoing path.
    pub fn path(&self, src: VertexId, dst: VertexId) -> Option<Path> {
        if let Some(path) = self.cache.read().unwrap().get(src, dst) {
            return Some(path.clone());
        }

        if src == dst {
            return self.self_loop(src);
        }

        // Complete graphs use the direct edge as the path.
        {
            let graph = self.graph.read().unwrap();
            if graph.is_complete() {
                let edge = graph.edge(src, dst)?;
                let path = Path {
                    latency_ms: edge.latency.mean(),
                    reliability: edge.reliability,
                    hops: vec![src, dst],
                };
                drop(graph);
                self.cache.write().unwrap().insert(src, dst, path.clone());
                return Some(path);
            }
        }

        self.populate_from(src);
        self.cache.read().unwrap().get(src, dst).cloned()
    }

    /// Run one multi-target shortest-path pass from `src` and memoize every
    /// discovered path.
    fn populate_from(&self, src: VertexId) {
        let targets: BTreeSet<VertexId> =
            self.attached.read().unwrap().keys().copied().collect();
        let computed = {
            let graph = self.graph.read().unwrap();
            shortest_paths(&graph, src, &targets)
        };
        debug!(
            src,
            targets = targets.len(),
            found = computed.len(),
            "populated path cache"
        );
        let mut cache = self.cache.write().unwrap();
        for (dst, path) in computed {
            cache.insert(src, dst, path);
        }
    }

    /// Approximate a self-loop with no self-edge as twice the minimum
    /// outgoing path from `src`.
    fn self_loop(&self, src: VertexId) -> Option<Path> {
        self.populate_from(src);
        let cache = self.cache.read().unwrap();
        let best = cache
            .entries()
            .filter(|((from, _), _)| *from == src)
            .map(|(_, path)| path)
            .min_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms))?;

        let mut hops = best.hops.clone();
        hops.extend(best.hops.iter().rev().skip(1));
        Some(Path {
            latency_ms: best.latency_ms * 2.0,
            reliability: best.reliability * best.reliability,
            hops,
        })
    }

    /// Verify the topology can support a simulation: at least one vertex,
    /// every vertex fully attributed, and every vertex reachable from every
    /// attached vertex. Failures here are fatal at startup.
    pub fn validate(&self) -> Result<(), Error> {
        let graph = self.graph.read().unwrap();
        if graph.vertices.is_empty() {
            return Err(Error::Empty);
        }
        for (&id, vertex) in &graph.vertices {
            if !vertex.reliability.is_finite() {
                return Err(Error::Unattributed(id));
            }
        }

        let attached: Vec<VertexId> = self.attached.read().unwrap().keys().copied().collect();
        for &from in &attached {
            if graph.vertex(from).is_none() {
                return Err(Error::Unattributed(from));
            }
            let mut seen = BTreeSet::from([from]);
            let mut frontier = vec![from];
            while let Some(vertex) = frontier.pop() {
                for (next, _) in graph.outgoing(vertex) {
                    if seen.insert(next) {
                        frontier.push(next);
                    }
                }
            }
            for &to in &attached {
                if !seen.contains(&to) {
                    return Err(Error::Disconnected { from, to });
                }
            }
        }
        Ok(())
    }

    /// Render the path cache as human-readable text, one line per pair:
    /// `src<->dst: latency ms, loss%, hop list`. Emitted at simulation
    /// teardown; free-text, not a stable format.
    pub fn dump_paths(&self) -> String {
        let cache = self.cache.read().unwrap();
        let mut out = String::with_capacity(cache.len() * 48);
        for ((src, dst), path) in cache.entries() {
            let loss = (1.0 - path.reliability) * 100.0;
            let _ = writeln!(
                out,
                "{}<->{}: {:.3} ms, loss {:.2}%, hops {:?}",
                src, dst, path.latency_ms, loss, path.hops
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn rng() -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(42)
    }

    /// Line topology: 1 - 2 - 3 with 10ms edges.
    fn line() -> Topology {
        let topology = Topology::new();
        for id in 1..=3 {
            topology.add_vertex(id, Cdf::constant(1.0), 1.0);
            topology.attach(id);
        }
        topology.add_edge(1, Cdf::constant(10.0), 0.9, 2, Cdf::constant(10.0), 0.9);
        topology.add_edge(2, Cdf::constant(10.0), 0.8, 3, Cdf::constant(10.0), 0.8);
        topology
    }

    #[test]
    fn direct_latency_covered_or_sentinel() {
        let topology = line();
        let mut rng = rng();
        assert_eq!(topology.end2end_latency(&mut rng, 1, 2), 10.0);
        assert_eq!(topology.end2end_latency(&mut rng, 1, 1), 1.0);
        assert_eq!(topology.end2end_latency(&mut rng, 1, 3), UNROUTABLE);
        assert_eq!(topology.end2end_latency(&mut rng, 7, 7), UNROUTABLE);
    }

    #[test]
    fn reliability_clamped_at_insertion() {
        let topology = Topology::new();
        topology.add_vertex(1, Cdf::constant(1.0), 7.5);
        topology.add_vertex(2, Cdf::constant(1.0), -0.5);
        topology.add_edge(1, Cdf::constant(5.0), 2.0, 2, Cdf::constant(5.0), -3.0);
        assert_eq!(topology.end2end_reliability(1, 1), 1.0);
        assert_eq!(topology.end2end_reliability(2, 2), 0.0);
        assert_eq!(topology.end2end_reliability(1, 2), 1.0);
        assert_eq!(topology.end2end_reliability(2, 1), 0.0);
    }

    #[test]
    fn duplicate_vertex_is_noop() {
        let topology = Topology::new();
        topology.add_vertex(1, Cdf::constant(1.0), 1.0);
        topology.add_vertex(1, Cdf::constant(99.0), 0.5);
        let mut rng = rng();
        assert_eq!(topology.end2end_latency(&mut rng, 1, 1), 1.0);
        assert_eq!(topology.end2end_reliability(1, 1), 1.0);
    }

    #[test]
    fn missing_endpoint_leaves_graph_unchanged() {
        let topology = Topology::new();
        topology.add_vertex(1, Cdf::constant(1.0), 1.0);
        topology.add_edge(1, Cdf::constant(5.0), 1.0, 9, Cdf::constant(5.0), 1.0);
        let mut rng = rng();
        assert_eq!(topology.end2end_latency(&mut rng, 1, 9), UNROUTABLE);
        assert_eq!(topology.end2end_latency(&mut rng, 9, 1), UNROUTABLE);
    }

    #[test]
    fn runahead_tracks_min_and_max() {
        let topology = Topology::new();
        assert_eq!(topology.runahead(), None);
        topology.add_vertex(1, Cdf::constant(5.0), 1.0);
        assert_eq!(topology.runahead(), Some((5.0, 5.0)));
        topology.add_vertex(2, Cdf::constant(2.0), 1.0);
        topology.add_edge(1, Cdf::constant(30.0), 1.0, 2, Cdf::constant(8.0), 1.0);
        assert_eq!(topology.runahead(), Some((2.0, 30.0)));
    }

    #[test]
    fn multihop_path_via_cache() {
        let topology = line();
        let path = topology.path(1, 3).expect("route exists");
        assert_eq!(path.latency_ms, 20.0);
        assert!((path.reliability - 0.72).abs() < 1e-9);
        assert_eq!(path.hops, vec![1, 2, 3]);

        // Populating from 1 memoized the sibling target too.
        assert!(topology.path(1, 2).is_some());
    }

    #[test]
    fn cache_is_idempotent() {
        let topology = line();
        let first = topology.path(1, 3).unwrap();
        let second = topology.path(1, 3).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn complete_graph_answers_from_direct_edge() {
        let topology = Topology::new();
        for id in 1..=3 {
            topology.add_vertex(id, Cdf::constant(1.0), 1.0);
            topology.attach(id);
        }
        topology.add_edge(1, Cdf::constant(3.0), 1.0, 2, Cdf::constant(3.0), 1.0);
        topology.add_edge(2, Cdf::constant(4.0), 1.0, 3, Cdf::constant(4.0), 1.0);
        topology.add_edge(1, Cdf::constant(9.0), 1.0, 3, Cdf::constant(9.0), 1.0);

        // The 1->2->3 route (7ms) is shorter than the direct edge (9ms), so a
        // shortest-path answer would differ. Complete graphs must take the
        // direct edge.
        let path = topology.path(1, 3).unwrap();
        assert_eq!(path.latency_ms, 9.0);
        assert_eq!(path.hops, vec![1, 3]);
    }

    #[test]
    fn self_loop_doubles_minimum_outgoing() {
        let topology = line();
        let path = topology.path(2, 2).unwrap();
        assert_eq!(path.latency_ms, 20.0);
        assert!((path.reliability - 0.64).abs() < 1e-9 || (path.reliability - 0.81).abs() < 1e-9);
    }

    #[test]
    fn latency_falls_back_to_path() {
        let topology = line();
        let mut rng = rng();
        assert_eq!(topology.latency(&mut rng, 1, 3), Some(20.0));
        assert_eq!(topology.latency(&mut rng, 1, 2), Some(10.0));
        let reliability = topology.reliability(1, 3).unwrap();
        assert!((reliability - 0.72).abs() < 1e-9);
    }

    #[test]
    fn validate_detects_disconnection() {
        let topology = Topology::new();
        topology.add_vertex(1, Cdf::constant(1.0), 1.0);
        topology.add_vertex(2, Cdf::constant(1.0), 1.0);
        topology.attach(1);
        topology.attach(2);
        assert!(matches!(
            topology.validate(),
            Err(Error::Disconnected { .. })
        ));

        topology.add_edge(1, Cdf::constant(1.0), 1.0, 2, Cdf::constant(1.0), 1.0);
        assert!(topology.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty() {
        let topology = Topology::new();
        assert!(matches!(topology.validate(), Err(Error::Empty)));
    }

    #[test]
    fn dump_renders_cached_paths() {
        let topology = line();
        topology.path(1, 3);
        let dump = topology.dump_paths();
        assert!(dump.contains("1<->3"));
        assert!(dump.contains("ms"));
        assert!(dump.contains("loss"));
    }
}
