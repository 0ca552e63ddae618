//! Reference-counted, lockable packet representation.
//!
//! All header fields live in one fixed-size struct so the hot path never
//! takes a secondary allocation. The [PacketHandle] is an atomically counted
//! shared-ownership handle: the outbound path, a colocated receiver's inbound
//! queue, and in-flight events can all reference the same packet without
//! copying — each hand-off clones the handle before storing and drops it
//! after consuming, and the packet is freed exactly once when the last handle
//! drops. The per-pod reader/writer lock supports safe concurrent access when
//! the payload is backed by cross-process shared memory.

use crate::{Error, VirtualAddress};
use bytes::{Buf, BufMut, Bytes};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Transport protocol carried by a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    /// Host-internal (loopback) traffic; never touches the topology.
    Local,
}

impl Protocol {
    /// Reliable transports get retransmits on drop; unreliable ones do not.
    pub const fn reliable(&self) -> bool {
        matches!(self, Self::Tcp)
    }

    const fn to_wire(self) -> u8 {
        match self {
            Self::Tcp => 0,
            Self::Udp => 1,
            Self::Local => 2,
        }
    }

    fn from_wire(raw: u8) -> Result<Self, Error> {
        match raw {
            0 => Ok(Self::Tcp),
            1 => Ok(Self::Udp),
            2 => Ok(Self::Local),
            _ => Err(Error::InvalidFrame("unknown protocol")),
        }
    }
}

/// TCP-specific header fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpHeader {
    pub sequence: u32,
    pub acknowledgment: u32,
    pub flags: u8,
    pub window: u32,
}

impl TcpHeader {
    pub const FIN: u8 = 1 << 0;
    pub const SYN: u8 = 1 << 1;
    pub const RST: u8 = 1 << 2;
    pub const ACK: u8 = 1 << 3;
}

/// Fixed-size packet header: protocol plus the connection 4-tuple, with
/// optional TCP fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub protocol: Protocol,
    pub src: VirtualAddress,
    pub src_port: u16,
    pub dst: VirtualAddress,
    pub dst_port: u16,
    pub tcp: Option<TcpHeader>,
}

/// Serialized size of a header on the wire.
const HEADER_BASE_LEN: usize = 1 + 4 + 2 + 4 + 2 + 1;
const TCP_FIELDS_LEN: usize = 4 + 4 + 1 + 4;

impl PacketHeader {
    pub const fn wire_len(&self) -> usize {
        match self.tcp {
            Some(_) => HEADER_BASE_LEN + TCP_FIELDS_LEN,
            None => HEADER_BASE_LEN,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.protocol.to_wire());
        buf.put_u32(self.src.raw());
        buf.put_u16(self.src_port);
        buf.put_u32(self.dst.raw());
        buf.put_u16(self.dst_port);
        match &self.tcp {
            Some(tcp) => {
                buf.put_u8(1);
                buf.put_u32(tcp.sequence);
                buf.put_u32(tcp.acknowledgment);
                buf.put_u8(tcp.flags);
                buf.put_u32(tcp.window);
            }
            None => buf.put_u8(0),
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        if buf.remaining() < HEADER_BASE_LEN {
            return Err(Error::FrameTruncated);
        }
        let protocol = Protocol::from_wire(buf.get_u8())?;
        let src = VirtualAddress::new(buf.get_u32());
        let src_port = buf.get_u16();
        let dst = VirtualAddress::new(buf.get_u32());
        let dst_port = buf.get_u16();
        let tcp = match buf.get_u8() {
            0 => None,
            1 => {
                if buf.remaining() < TCP_FIELDS_LEN {
                    return Err(Error::FrameTruncated);
                }
                Some(TcpHeader {
                    sequence: buf.get_u32(),
                    acknowledgment: buf.get_u32(),
                    flags: buf.get_u8(),
                    window: buf.get_u32(),
                })
            }
            _ => return Err(Error::InvalidFrame("bad tcp marker")),
        };
        Ok(Self {
            protocol,
            src,
            src_port,
            dst,
            dst_port,
            tcp,
        })
    }
}

/// A packet: fixed header plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Bytes this packet occupies on the simulated wire; the unit charged
    /// against bandwidth budgets.
    pub fn wire_len(&self) -> usize {
        self.header.wire_len() + self.payload.len()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let header = PacketHeader::decode(buf)?;
        if buf.remaining() < 4 {
            return Err(Error::FrameTruncated);
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(Error::FrameTruncated);
        }
        let payload = buf.copy_to_bytes(len);
        Ok(Self { header, payload })
    }
}

/// The raw object behind a [PacketHandle].
#[derive(Debug)]
struct Pod {
    packet: RwLock<Packet>,
    /// Cabinet slot index when the payload is backed by shared memory.
    slot: Option<u32>,
}

/// Atomically counted shared-ownership handle to a packet.
#[derive(Clone, Debug)]
pub struct PacketHandle {
    pod: Arc<Pod>,
}

impl PacketHandle {
    pub fn new(packet: Packet) -> Self {
        Self {
            pod: Arc::new(Pod {
                packet: RwLock::new(packet),
                slot: None,
            }),
        }
    }

    pub(crate) fn with_slot(packet: Packet, slot: u32) -> Self {
        Self {
            pod: Arc::new(Pod {
                packet: RwLock::new(packet),
                slot: Some(slot),
            }),
        }
    }

    /// Shared read access to the packet.
    pub fn read(&self) -> RwLockReadGuard<'_, Packet> {
        self.pod.packet.read().unwrap()
    }

    /// Exclusive write access to the packet.
    pub fn write(&self) -> RwLockWriteGuard<'_, Packet> {
        self.pod.packet.write().unwrap()
    }

    /// Copy of the fixed-size header.
    pub fn header(&self) -> PacketHeader {
        self.read().header
    }

    pub fn wire_len(&self) -> usize {
        self.read().wire_len()
    }

    /// Cabinet slot backing this packet, when shared memory is in use.
    pub fn slot(&self) -> Option<u32> {
        self.pod.slot
    }

    /// Number of live handles to this pod.
    pub fn references(&self) -> usize {
        Arc::strong_count(&self.pod)
    }
}
