//! Routed events and their wire frames.
//!
//! Event kinds form a closed tagged union dispatched by exhaustive pattern
//! matching, so adding a kind is compile-time checked everywhere it matters.
//! Events crossing a process or machine boundary are serialized into frames;
//! on the same machine with the cabinet enabled, packet payloads travel as a
//! shared-memory slot reference instead of a copy.

use crate::{
    timers::TimerId, Cabinet, Error, Packet, PacketHandle, PacketHeader, SocketId, VirtualAddress,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Where a routed frame is headed relative to the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hop {
    /// Another worker on this machine.
    Process,
    /// A worker on another machine.
    Machine,
}

/// Communication layer tag carried alongside routed frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layer {
    /// Packet traffic.
    Network,
    /// Control notices (retransmit, close, notify, poll, chained wakeups).
    Control,
}

/// Frame encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    /// Fully serialized event, payload included.
    Event,
    /// Event whose packet payload is a cabinet slot reference.
    SlotEvent,
}

/// What a routed event does when it fires.
#[derive(Debug)]
pub enum EventKind {
    /// A packet arriving at its destination host.
    Packet(PacketHandle),
    /// Tell the source host to retransmit the described packet.
    Retransmit(PacketHeader),
    /// Connection close notice for the described 4-tuple.
    Close(PacketHeader),
    /// Wake a socket's state machine.
    Notify(SocketId),
    /// Poll a socket for readiness.
    Poll(SocketId),
    /// Self-chained upload-batch wakeup.
    Uploaded,
    /// Self-chained download-batch wakeup.
    Downloaded,
    /// A host timer reached its expiry.
    TimerFired(TimerId),
}

impl EventKind {
    /// The layer this kind travels on when routed between workers.
    pub const fn layer(&self) -> Layer {
        match self {
            Self::Packet(_) => Layer::Network,
            Self::Retransmit(_)
            | Self::Close(_)
            | Self::Notify(_)
            | Self::Poll(_)
            | Self::Uploaded
            | Self::Downloaded
            | Self::TimerFired(_) => Layer::Control,
        }
    }
}

/// A scheduled event, bound for `target`.
#[derive(Debug)]
pub struct Event {
    pub target: VirtualAddress,
    pub deliver_at: SystemTime,
    /// CPU-delay of the target host observed when the event was created;
    /// compared against the host's current delay at execution time.
    pub checkpoint: Duration,
    pub kind: EventKind,
}

const TAG_PACKET: u8 = 0;
const TAG_PACKET_SLOT: u8 = 1;
const TAG_RETRANSMIT: u8 = 2;
const TAG_CLOSE: u8 = 3;
const TAG_NOTIFY: u8 = 4;
const TAG_POLL: u8 = 5;
const TAG_UPLOADED: u8 = 6;
const TAG_DOWNLOADED: u8 = 7;
const TAG_TIMER: u8 = 8;

impl Event {
    /// Create an event delivered `delay` after `now`. Delivery can never
    /// precede creation: `delay` is non-negative by construction.
    pub fn new(
        target: VirtualAddress,
        now: SystemTime,
        delay: Duration,
        checkpoint: Duration,
        kind: EventKind,
    ) -> Self {
        Self {
            target,
            deliver_at: now + delay,
            checkpoint,
            kind,
        }
    }

    /// Serialize for an inter-worker hop.
    ///
    /// When a cabinet is provided (same-machine hop) and the packet fits, the
    /// payload is deposited into a shared-memory slot and only the reference
    /// crosses the boundary.
    pub fn encode(&self, cabinet: Option<&Cabinet>) -> Result<(FrameType, Bytes), Error> {
        let mut buf = BytesMut::new();
        buf.put_u32(self.target.raw());
        let nanos = self
            .deliver_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        buf.put_u64(nanos);
        buf.put_u64(self.checkpoint.as_nanos() as u64);

        let mut frame_type = FrameType::Event;
        match &self.kind {
            EventKind::Packet(handle) => {
                let packet = handle.read();
                match cabinet {
                    Some(cabinet) if cabinet.fits(&packet) => {
                        let slot = cabinet.store(packet.clone())?;
                        buf.put_u8(TAG_PACKET_SLOT);
                        buf.put_u32(slot);
                        frame_type = FrameType::SlotEvent;
                    }
                    _ => {
                        buf.put_u8(TAG_PACKET);
                        packet.encode(&mut buf);
                    }
                }
            }
            EventKind::Retransmit(header) => {
                buf.put_u8(TAG_RETRANSMIT);
                header.encode(&mut buf);
            }
            EventKind::Close(header) => {
                buf.put_u8(TAG_CLOSE);
                header.encode(&mut buf);
            }
            EventKind::Notify(socket) => {
                buf.put_u8(TAG_NOTIFY);
                buf.put_u32(*socket);
            }
            EventKind::Poll(socket) => {
                buf.put_u8(TAG_POLL);
                buf.put_u32(*socket);
            }
            EventKind::Uploaded => buf.put_u8(TAG_UPLOADED),
            EventKind::Downloaded => buf.put_u8(TAG_DOWNLOADED),
            EventKind::TimerFired(id) => {
                buf.put_u8(TAG_TIMER);
                buf.put_u64(*id);
            }
        }
        Ok((frame_type, buf.freeze()))
    }

    /// Decode a routed frame. Slot frames rehydrate their packet from the
    /// cabinet.
    pub fn decode(
        frame_type: FrameType,
        mut buf: Bytes,
        cabinet: Option<&Cabinet>,
    ) -> Result<Self, Error> {
        if buf.remaining() < 4 + 8 + 8 + 1 {
            return Err(Error::FrameTruncated);
        }
        let target = VirtualAddress::new(buf.get_u32());
        let deliver_at = UNIX_EPOCH + Duration::from_nanos(buf.get_u64());
        let checkpoint = Duration::from_nanos(buf.get_u64());

        let kind = match buf.get_u8() {
            TAG_PACKET => EventKind::Packet(PacketHandle::new(Packet::decode(&mut buf)?)),
            TAG_PACKET_SLOT => {
                if frame_type != FrameType::SlotEvent {
                    return Err(Error::InvalidFrame("slot tag in full frame"));
                }
                if buf.remaining() < 4 {
                    return Err(Error::FrameTruncated);
                }
                let slot = buf.get_u32();
                let cabinet = cabinet.ok_or(Error::InvalidFrame("slot frame without cabinet"))?;
                let packet = cabinet
                    .load(slot)
                    .ok_or(Error::InvalidFrame("vacant cabinet slot"))?;
                EventKind::Packet(PacketHandle::with_slot(packet, slot))
            }
            TAG_RETRANSMIT => EventKind::Retransmit(PacketHeader::decode(&mut buf)?),
            TAG_CLOSE => EventKind::Close(PacketHeader::decode(&mut buf)?),
            TAG_NOTIFY => {
                if buf.remaining() < 4 {
                    return Err(Error::FrameTruncated);
                }
                EventKind::Notify(buf.get_u32())
            }
            TAG_POLL => {
                if buf.remaining() < 4 {
                    return Err(Error::FrameTruncated);
                }
                EventKind::Poll(buf.get_u32())
            }
            TAG_UPLOADED => EventKind::Uploaded,
            TAG_DOWNLOADED => EventKind::Downloaded,
            TAG_TIMER => {
                if buf.remaining() < 8 {
                    return Err(Error::FrameTruncated);
                }
                EventKind::TimerFired(buf.get_u64())
            }
            _ => return Err(Error::InvalidFrame("unknown event tag")),
        };

        Ok(Self {
            target,
            deliver_at,
            checkpoint,
            kind,
        })
    }
}
