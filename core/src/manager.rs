//! The VCI manager: decides when and how events reach simulated hosts.
//!
//! Scheduling a packet draws a reliability verdict and a latency sample from
//! the topology, then dispatches the resulting event by destination: a local
//! enqueue when the target host lives on this worker, an encoded frame over
//! the [Router] otherwise. Execution is the inverse: events arriving at their
//! `deliver_at` are applied to the target host's mailbox, respecting host
//! teardown and CPU-delay pushback.

use crate::{
    timers::TimerCallback,
    transport::{self, Admission, TransportManager},
    Error, Event, EventKind, EventQueue, FrameType, Hop, Metrics, PacketHandle, PacketHeader,
    Router, SimulationContext, SocketId, TimerId, TimerManager, VirtualAddress,
};
use bytes::Bytes;
use emnet_topology::{VertexId, UNROUTABLE};
use prometheus_client::registry::Registry;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

/// Delivery delay for host-internal traffic; never touches the topology.
const LOOPBACK_DELAY: Duration = Duration::from_micros(1);

/// How long a sender waits before being told to retransmit a dropped
/// reliable-protocol packet.
const RETRANSMIT_DELAY: Duration = Duration::from_millis(1);

/// Outcome of executing one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exec {
    /// Applied to the target host.
    Executed,
    /// Pushed back because the host's CPU delay grew since scheduling.
    Rescheduled,
    /// Target host was cancelled; the event was dropped.
    HostDestroyed,
    /// No such host on this worker; the event was dropped.
    Discarded,
}

/// The protocol layer above the core, one per host.
///
/// Implementations hold TCP/UDP state machines; the core calls in when an
/// event addressed to the host fires, and pulls outbound packets during
/// upload drains.
pub trait ProtocolHandler {
    fn on_packet(&mut self, packet: PacketHandle);
    fn on_retransmit(&mut self, header: PacketHeader);
    fn on_close(&mut self, header: PacketHeader);
    fn on_notify(&mut self, socket: SocketId);
    fn on_poll(&mut self, socket: SocketId);
    /// Next packet `socket` wants on the wire, or `None` when drained.
    fn next_upload(&mut self, socket: SocketId) -> Option<PacketHandle>;
}

/// Per-host state owned by this worker.
struct HostMailbox {
    vertex: VertexId,
    transport: TransportManager,
    handler: Box<dyn ProtocolHandler>,
    /// Simulated processing lag; events scheduled before it grew are pushed
    /// back rather than delivered early.
    cpu_delay: Duration,
    /// Cancelled but not yet unregistered; events addressed here are
    /// swallowed.
    destroyed: bool,
}

/// Event-routing core for one worker.
pub struct VciManager {
    /// Hosts on this worker, keyed by node id.
    mailboxes: HashMap<u32, HostMailbox>,
    /// Topology placement of every known host, local and remote.
    vertices: HashMap<VirtualAddress, VertexId>,
    timers: TimerManager,
    metrics: Metrics,
}

impl VciManager {
    pub fn new(registry: &mut Registry) -> Self {
        Self {
            mailboxes: HashMap::new(),
            vertices: HashMap::new(),
            timers: TimerManager::new(),
            metrics: Metrics::new(registry),
        }
    }

    /// Register a host served by this worker, attaching it to its
    /// point-of-presence.
    pub fn register_host(
        &mut self,
        ctx: &SimulationContext,
        addr: VirtualAddress,
        vertex: VertexId,
        link: transport::Config,
        handler: Box<dyn ProtocolHandler>,
        now: SystemTime,
    ) -> Result<(), Error> {
        if !ctx.is_local(addr) {
            return Err(Error::ForeignHost(addr));
        }
        let node = ctx.process.scheme.node(addr);
        if self.mailboxes.contains_key(&node) {
            return Err(Error::AddressInUse(addr));
        }
        self.vertices.insert(addr, vertex);
        self.mailboxes.insert(
            node,
            HostMailbox {
                vertex,
                transport: TransportManager::new(link, now),
                handler,
                cpu_delay: Duration::ZERO,
                destroyed: false,
            },
        );
        ctx.process.topology.attach(vertex);
        debug!(%addr, vertex, "host registered");
        Ok(())
    }

    /// Record the placement of a host served elsewhere, attaching its
    /// point-of-presence so shortest-path runs target it and lookups toward
    /// it resolve.
    pub fn register_remote(
        &mut self,
        ctx: &SimulationContext,
        addr: VirtualAddress,
        vertex: VertexId,
    ) {
        match self.vertices.insert(addr, vertex) {
            Some(previous) if previous != vertex => {
                ctx.process.topology.detach(previous);
                ctx.process.topology.attach(vertex);
            }
            Some(_) => {}
            None => ctx.process.topology.attach(vertex),
        }
    }

    /// Forget a remote host, detaching its point-of-presence.
    pub fn unregister_remote(&mut self, ctx: &SimulationContext, addr: VirtualAddress) {
        if let Some(vertex) = self.vertices.remove(&addr) {
            ctx.process.topology.detach(vertex);
        }
    }

    /// Cancel a host: pending and future events addressed to it become
    /// no-ops, and its timers are invalidated in place. State is reclaimed by
    /// [Self::unregister_host].
    pub fn cancel_host(
        &mut self,
        ctx: &SimulationContext,
        addr: VirtualAddress,
    ) -> Result<(), Error> {
        let node = ctx.process.scheme.node(addr);
        let mailbox = self
            .mailboxes
            .get_mut(&node)
            .ok_or(Error::UnknownHost(addr))?;
        mailbox.destroyed = true;
        self.timers.invalidate_all(node);
        debug!(%addr, "host cancelled");
        Ok(())
    }

    /// Reclaim a host's state and detach it from its point-of-presence.
    pub fn unregister_host(&mut self, ctx: &SimulationContext, addr: VirtualAddress) {
        let node = ctx.process.scheme.node(addr);
        if let Some(mailbox) = self.mailboxes.remove(&node) {
            ctx.process.topology.detach(mailbox.vertex);
        }
        self.vertices.remove(&addr);
        self.timers.discard(node);
    }

    /// Update a host's simulated processing lag.
    pub fn set_cpu_delay(
        &mut self,
        ctx: &SimulationContext,
        addr: VirtualAddress,
        delay: Duration,
    ) -> Result<(), Error> {
        let node = ctx.process.scheme.node(addr);
        let mailbox = self
            .mailboxes
            .get_mut(&node)
            .ok_or(Error::UnknownHost(addr))?;
        mailbox.cpu_delay = delay;
        Ok(())
    }

    /// Sample the latency in milliseconds between two hosts, [UNROUTABLE]
    /// when either host is unknown or no route exists.
    pub fn get_latency<R: Rng>(
        &self,
        ctx: &SimulationContext,
        rng: &mut R,
        src: VirtualAddress,
        dst: VirtualAddress,
    ) -> f64 {
        let (Some(&sv), Some(&dv)) = (self.vertices.get(&src), self.vertices.get(&dst)) else {
            return UNROUTABLE;
        };
        ctx.process
            .topology
            .latency(rng, sv, dv)
            .unwrap_or(UNROUTABLE)
    }

    /// Whether packets toward `addr` can travel by cabinet slot reference.
    pub fn can_share_memory(&self, ctx: &SimulationContext, addr: VirtualAddress) -> bool {
        ctx.process.cabinet.is_some() && ctx.same_machine(addr)
    }

    /// Mark `socket` on `addr` as having data to send, waking the host's
    /// upload drain if one is not already outstanding.
    pub fn ready_send(
        &mut self,
        ctx: &SimulationContext,
        now: SystemTime,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        addr: VirtualAddress,
        socket: SocketId,
    ) -> Result<(), Error> {
        let node = ctx.process.scheme.node(addr);
        let mailbox = self
            .mailboxes
            .get_mut(&node)
            .ok_or(Error::UnknownHost(addr))?;
        if mailbox.transport.ready_send(socket) {
            self.schedule_uploaded(ctx, now, queue, router, addr, Duration::ZERO)?;
        }
        Ok(())
    }

    /// Schedule a packet for delivery: draw the reliability verdict, sample
    /// the latency, and dispatch toward the destination host.
    ///
    /// A drop on a reliable protocol schedules a retransmit notice back to
    /// the source. Host-internal traffic bypasses the topology entirely.
    pub fn schedule_packet<R: Rng>(
        &self,
        ctx: &SimulationContext,
        rng: &mut R,
        now: SystemTime,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        packet: PacketHandle,
    ) -> Result<(), Error> {
        let header = packet.header();
        let (src, dst) = (header.src, header.dst);

        if src == dst || header.protocol == crate::Protocol::Local {
            let event = Event::new(
                dst,
                now,
                LOOPBACK_DELAY,
                self.checkpoint(ctx, dst),
                EventKind::Packet(packet),
            );
            self.dispatch(ctx, queue, router, event)?;
            self.metrics
                .delivered
                .get_or_create(&crate::RouteClass::Loopback.into())
                .inc();
            return Ok(());
        }

        let class = self.route_class(ctx, dst);
        let src_vertex = *self.vertices.get(&src).ok_or(Error::UnknownHost(src))?;
        let dst_vertex = *self.vertices.get(&dst).ok_or(Error::UnknownHost(dst))?;

        let topology = &ctx.process.topology;
        let Some(reliability) = topology.reliability(src_vertex, dst_vertex) else {
            warn!(%src, %dst, "no route between hosts, dropping packet");
            self.metrics.dropped.get_or_create(&class.into()).inc();
            return Ok(());
        };
        if rng.gen::<f64>() >= reliability {
            trace!(%src, %dst, reliability, "packet lost to reliability draw");
            self.metrics.dropped.get_or_create(&class.into()).inc();
            if header.protocol.reliable() {
                self.schedule_retransmit(ctx, now, queue, router, header)?;
            }
            return Ok(());
        }

        let Some(latency_ms) = topology.latency(rng, src_vertex, dst_vertex) else {
            warn!(%src, %dst, "no route between hosts, dropping packet");
            self.metrics.dropped.get_or_create(&class.into()).inc();
            return Ok(());
        };
        let delay = Duration::from_secs_f64(latency_ms.max(0.0) / 1_000.0);
        let event = Event::new(
            dst,
            now,
            delay,
            self.checkpoint(ctx, dst),
            EventKind::Packet(packet),
        );
        self.dispatch(ctx, queue, router, event)?;
        self.metrics.delivered.get_or_create(&class.into()).inc();
        Ok(())
    }

    /// Tell `header.src` to retransmit the described packet.
    pub fn schedule_retransmit(
        &self,
        ctx: &SimulationContext,
        now: SystemTime,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        header: PacketHeader,
    ) -> Result<(), Error> {
        self.metrics.retransmits.inc();
        self.schedule_control(
            ctx,
            now,
            queue,
            router,
            header.src,
            RETRANSMIT_DELAY,
            EventKind::Retransmit(header),
        )
    }

    /// Deliver a connection-close notice to `target`.
    pub fn schedule_close(
        &self,
        ctx: &SimulationContext,
        now: SystemTime,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        target: VirtualAddress,
        header: PacketHeader,
    ) -> Result<(), Error> {
        self.schedule_control(
            ctx,
            now,
            queue,
            router,
            target,
            Duration::ZERO,
            EventKind::Close(header),
        )
    }

    /// Wake a socket's state machine on `target` after `delay`.
    pub fn schedule_notify(
        &self,
        ctx: &SimulationContext,
        now: SystemTime,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        target: VirtualAddress,
        delay: Duration,
        socket: SocketId,
    ) -> Result<(), Error> {
        self.schedule_control(ctx, now, queue, router, target, delay, EventKind::Notify(socket))
    }

    /// Poll a socket on `target` for readiness after `delay`.
    pub fn schedule_poll(
        &self,
        ctx: &SimulationContext,
        now: SystemTime,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        target: VirtualAddress,
        delay: Duration,
        socket: SocketId,
    ) -> Result<(), Error> {
        self.schedule_control(ctx, now, queue, router, target, delay, EventKind::Poll(socket))
    }

    /// Wake `target`'s upload drain after `delay`.
    pub fn schedule_uploaded(
        &self,
        ctx: &SimulationContext,
        now: SystemTime,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        target: VirtualAddress,
        delay: Duration,
    ) -> Result<(), Error> {
        self.schedule_control(ctx, now, queue, router, target, delay, EventKind::Uploaded)
    }

    /// Wake `target`'s download drain after `delay`.
    pub fn schedule_downloaded(
        &self,
        ctx: &SimulationContext,
        now: SystemTime,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        target: VirtualAddress,
        delay: Duration,
    ) -> Result<(), Error> {
        self.schedule_control(ctx, now, queue, router, target, delay, EventKind::Downloaded)
    }

    /// Arm a timer for `addr`, scheduling its fired event at expiry.
    pub fn create_timer(
        &mut self,
        ctx: &SimulationContext,
        queue: &mut impl EventQueue,
        addr: VirtualAddress,
        expire_at: SystemTime,
        callback: TimerCallback,
    ) -> Result<TimerId, Error> {
        if !ctx.is_local(addr) {
            return Err(Error::ForeignHost(addr));
        }
        let node = ctx.process.scheme.node(addr);
        if !self.mailboxes.contains_key(&node) {
            return Err(Error::UnknownHost(addr));
        }
        let id = self.timers.create(node, expire_at, callback);
        let event = Event {
            target: addr,
            deliver_at: expire_at,
            checkpoint: self.checkpoint(ctx, addr),
            kind: EventKind::TimerFired(id),
        };
        queue.schedule(expire_at, event);
        Ok(id)
    }

    /// Cancel a timer; its already-scheduled fired event becomes a no-op.
    pub fn destroy_timer(&mut self, ctx: &SimulationContext, addr: VirtualAddress, id: TimerId) {
        self.timers.invalidate(ctx.process.scheme.node(addr), id);
    }

    /// Cancel every timer belonging to `addr`.
    pub fn destroy_timers(&mut self, ctx: &SimulationContext, addr: VirtualAddress) {
        self.timers.invalidate_all(ctx.process.scheme.node(addr));
    }

    /// Decode a frame received from another worker. Undecodable frames and
    /// frames addressed to hosts not served here are dropped, not fatal.
    pub fn decode_frame(
        &self,
        ctx: &SimulationContext,
        frame_type: FrameType,
        payload: Bytes,
    ) -> Option<Event> {
        let cabinet = ctx.process.cabinet.as_deref();
        let event = match Event::decode(frame_type, payload, cabinet) {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "dropping undecodable frame");
                self.metrics.discarded.inc();
                return None;
            }
        };
        if !ctx.is_local(event.target) {
            trace!(target = %event.target, "dropping frame for non-local host");
            self.metrics.discarded.inc();
            return None;
        }
        Some(event)
    }

    /// Execute an event that has reached its delivery time.
    pub fn exec_event<R: Rng>(
        &mut self,
        ctx: &SimulationContext,
        rng: &mut R,
        now: SystemTime,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        event: Event,
    ) -> Result<Exec, Error> {
        let node = ctx.process.scheme.node(event.target);
        {
            let Some(mailbox) = self.mailboxes.get(&node) else {
                trace!(target = %event.target, "event for unknown host");
                self.metrics.discarded.inc();
                return Ok(Exec::Discarded);
            };
            if mailbox.destroyed {
                self.metrics.discarded.inc();
                return Ok(Exec::HostDestroyed);
            }
            // The host's processing lag grew after this event was scheduled:
            // push delivery back by the difference.
            if mailbox.cpu_delay > event.checkpoint {
                let extra = mailbox.cpu_delay - event.checkpoint;
                let pushed = Event {
                    target: event.target,
                    deliver_at: event.deliver_at + extra,
                    checkpoint: mailbox.cpu_delay,
                    kind: event.kind,
                };
                queue.schedule(pushed.deliver_at, pushed);
                self.metrics.rescheduled.inc();
                return Ok(Exec::Rescheduled);
            }
        }

        match event.kind {
            EventKind::Packet(packet) => {
                let header = packet.header();
                let admission = match self.mailboxes.get_mut(&node) {
                    Some(mailbox) => mailbox.transport.ready_receive(packet),
                    None => return Ok(Exec::Discarded),
                };
                match admission {
                    Admission::QueuedWake => self.schedule_downloaded(
                        ctx,
                        now,
                        queue,
                        router,
                        event.target,
                        Duration::ZERO,
                    )?,
                    Admission::Rejected => {
                        self.metrics
                            .dropped
                            .get_or_create(&crate::RouteClass::Local.into())
                            .inc();
                        if header.protocol.reliable() {
                            self.schedule_retransmit(ctx, now, queue, router, header)?;
                        }
                    }
                    Admission::Queued => {}
                }
            }
            EventKind::Downloaded => {
                let chain = match self.mailboxes.get_mut(&node) {
                    Some(mailbox) => {
                        let HostMailbox {
                            transport, handler, ..
                        } = mailbox;
                        transport.download_next(now, |packet| handler.on_packet(packet))
                    }
                    None => return Ok(Exec::Discarded),
                };
                if let Some(delay) = chain {
                    self.schedule_downloaded(ctx, now, queue, router, event.target, delay)?;
                }
            }
            EventKind::Uploaded => {
                let mut outbound = Vec::new();
                let chain = match self.mailboxes.get_mut(&node) {
                    Some(mailbox) => {
                        let HostMailbox {
                            transport, handler, ..
                        } = mailbox;
                        transport.upload_next(
                            now,
                            |socket| handler.next_upload(socket),
                            |packet| outbound.push(packet),
                        )
                    }
                    None => return Ok(Exec::Discarded),
                };
                for packet in outbound {
                    self.schedule_packet(ctx, rng, now, queue, router, packet)?;
                }
                if let Some(delay) = chain {
                    self.schedule_uploaded(ctx, now, queue, router, event.target, delay)?;
                }
            }
            EventKind::Retransmit(header) => {
                if let Some(mailbox) = self.mailboxes.get_mut(&node) {
                    mailbox.handler.on_retransmit(header);
                }
            }
            EventKind::Close(header) => {
                if let Some(mailbox) = self.mailboxes.get_mut(&node) {
                    mailbox.handler.on_close(header);
                }
            }
            EventKind::Notify(socket) => {
                if let Some(mailbox) = self.mailboxes.get_mut(&node) {
                    mailbox.handler.on_notify(socket);
                }
            }
            EventKind::Poll(socket) => {
                if let Some(mailbox) = self.mailboxes.get_mut(&node) {
                    mailbox.handler.on_poll(socket);
                }
            }
            EventKind::TimerFired(id) => {
                if let Some(callback) = self.timers.fire(node, id) {
                    callback();
                }
            }
        }
        self.metrics.executed.inc();
        Ok(Exec::Executed)
    }

    /// Log the resolved path cache at simulation teardown.
    pub fn teardown(&self, ctx: &SimulationContext) {
        for line in ctx.process.topology.dump_paths().lines() {
            info!("{line}");
        }
    }

    fn schedule_control(
        &self,
        ctx: &SimulationContext,
        now: SystemTime,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        target: VirtualAddress,
        delay: Duration,
        kind: EventKind,
    ) -> Result<(), Error> {
        let event = Event::new(target, now, delay, self.checkpoint(ctx, target), kind);
        self.dispatch(ctx, queue, router, event)
    }

    /// Route an event by destination: local enqueue, inter-process frame
    /// (cabinet-eligible), or inter-machine frame.
    fn dispatch(
        &self,
        ctx: &SimulationContext,
        queue: &mut impl EventQueue,
        router: &mut impl Router,
        event: Event,
    ) -> Result<(), Error> {
        if ctx.is_local(event.target) {
            queue.schedule(event.deliver_at, event);
            return Ok(());
        }
        let layer = event.kind.layer();
        let worker = ctx.process.scheme.worker(event.target);
        if ctx.same_machine(event.target) {
            let cabinet = ctx.process.cabinet.as_deref();
            let (frame_type, payload) = event.encode(cabinet)?;
            router.route(Hop::Process, layer, worker, frame_type, payload)
        } else {
            let (frame_type, payload) = event.encode(None)?;
            router.route(Hop::Machine, layer, worker, frame_type, payload)
        }
    }

    fn route_class(&self, ctx: &SimulationContext, dst: VirtualAddress) -> crate::RouteClass {
        if ctx.is_local(dst) {
            crate::RouteClass::Local
        } else if ctx.same_machine(dst) {
            crate::RouteClass::Process
        } else {
            crate::RouteClass::Machine
        }
    }

    /// CPU-delay checkpoint stamped onto events toward `addr`; zero for
    /// hosts served by other workers.
    fn checkpoint(&self, ctx: &SimulationContext, addr: VirtualAddress) -> Duration {
        if !ctx.is_local(addr) {
            return Duration::ZERO;
        }
        let node = ctx.process.scheme.node(addr);
        self.mailboxes
            .get(&node)
            .map_or(Duration::ZERO, |mailbox| mailbox.cpu_delay)
    }
}
