//! Network-emulation and event-routing core.
//!
//! Simulated hosts are identified by bit-packed [VirtualAddress]es and placed
//! across workers (processes) and machines. The [VciManager] decides *when*
//! a simulated network event reaches its destination — drawing latency and
//! reliability from an [emnet_topology::Topology], serializing transfers
//! through per-host bandwidth-limited [transport] state — and *how*: a local
//! enqueue, an inter-process hop, or an inter-machine hop, depending on where
//! the destination host lives.
//!
//! The global time-ordered event queue and the inter-process/machine
//! transports are external collaborators, consumed through the [EventQueue]
//! and [Router] traits. Protocol state machines (TCP/UDP) sit above this
//! core and are reached through [ProtocolHandler].

mod address;
pub use address::{AddressScheme, VirtualAddress};
mod cabinet;
pub use cabinet::Cabinet;
mod context;
pub use context::{ProcessScope, SimulationContext, WorkerScope};
mod event;
pub use event::{Event, EventKind, FrameType, Hop, Layer};
mod manager;
pub use manager::{Exec, ProtocolHandler, VciManager};
mod metrics;
pub use metrics::{Metrics, RouteClass};
mod packet;
pub use packet::{Packet, PacketHandle, PacketHeader, Protocol, TcpHeader};
mod timers;
pub use timers::{TimerCallback, TimerId, TimerManager};
pub mod transport;

use bytes::Bytes;
use std::time::SystemTime;
use thiserror::Error;

/// Identifier of a socket within a host, assigned by the protocol layer.
pub type SocketId = u32;

/// Errors surfaced by the core.
///
/// Reliability-draw drops and wrong-worker frames are expected control flow
/// and never appear here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid address scheme: {0}")]
    InvalidScheme(&'static str),
    #[error("address already registered: {0}")]
    AddressInUse(VirtualAddress),
    #[error("host not served by this worker: {0}")]
    ForeignHost(VirtualAddress),
    #[error("unknown host: {0}")]
    UnknownHost(VirtualAddress),
    #[error("shared-memory cabinet exhausted")]
    CabinetExhausted,
    #[error("payload exceeds cabinet slot size")]
    SlotOverflow,
    #[error("frame truncated")]
    FrameTruncated,
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("route closed")]
    RouteClosed,
}

/// The external time-ordered event queue.
///
/// The core never reorders or inspects scheduled events; ordering of
/// deliveries to the same host is this queue's responsibility. The core
/// guarantees it never schedules a `deliver_at` earlier than the current
/// simulated time.
pub trait EventQueue {
    fn schedule(&mut self, deliver_at: SystemTime, event: Event);
}

/// The external inter-process / inter-machine transport primitive.
pub trait Router {
    fn route(
        &mut self,
        hop: Hop,
        layer: Layer,
        worker: u32,
        frame_type: FrameType,
        payload: Bytes,
    ) -> Result<(), Error>;
}
