//! Core metrics.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// How a delivery was routed.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RouteClass {
    /// Source and destination on the same host.
    Loopback,
    /// Destination hosted by this worker.
    Local,
    /// Destination on another worker of this machine.
    Process,
    /// Destination on another machine.
    Machine,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabel {
    pub route: RouteClass,
}

impl From<RouteClass> for RouteLabel {
    fn from(route: RouteClass) -> Self {
        Self { route }
    }
}

/// Metrics for the event-routing core.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Packets scheduled for delivery, by route class.
    pub delivered: Family<RouteLabel, Counter>,
    /// Packets dropped by the reliability draw or inbound overflow, by route
    /// class.
    pub dropped: Family<RouteLabel, Counter>,
    /// Retransmit requests issued for reliable-protocol drops.
    pub retransmits: Counter,
    /// Events executed at their target host.
    pub executed: Counter,
    /// Events pushed back because the host's CPU delay grew.
    pub rescheduled: Counter,
    /// Events discarded (unknown or torn-down host, stale frames).
    pub discarded: Counter,
}

impl Metrics {
    /// Create and register with the provided registry.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "packets_delivered",
            "Packets scheduled for delivery",
            metrics.delivered.clone(),
        );
        registry.register(
            "packets_dropped",
            "Packets dropped by reliability draw or inbound overflow",
            metrics.dropped.clone(),
        );
        registry.register(
            "retransmits",
            "Retransmit requests issued for reliable-protocol drops",
            metrics.retransmits.clone(),
        );
        registry.register(
            "events_executed",
            "Events executed at their target host",
            metrics.executed.clone(),
        );
        registry.register(
            "events_rescheduled",
            "Events pushed back because the host CPU delay grew",
            metrics.rescheduled.clone(),
        );
        registry.register(
            "events_discarded",
            "Events discarded for unknown or torn-down hosts",
            metrics.discarded.clone(),
        );
        metrics
    }
}
