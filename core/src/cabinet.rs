//! Shared-memory cabinet: a preallocated arena of fixed-size slots for
//! zero-copy packet hand-off between workers on the same machine.
//!
//! Each slot carries its own reader/writer lock so unrelated packets never
//! contend; the free list is the only arena-wide state. Exhaustion is a
//! configuration error, not a recoverable runtime condition — callers
//! propagate it as fatal.

use crate::{Error, Packet};
use std::sync::{Mutex, RwLock};
use tracing::debug;

/// Fixed-size slot arena.
#[derive(Debug)]
pub struct Cabinet {
    slot_size: usize,
    slots: Vec<RwLock<Option<Packet>>>,
    free: Mutex<Vec<u32>>,
}

impl Cabinet {
    /// Allocate an arena of `slots` slots holding payloads up to `slot_size`
    /// bytes.
    pub fn new(slots: u32, slot_size: usize) -> Self {
        debug!(slots, slot_size, "allocating cabinet");
        Self {
            slot_size,
            slots: (0..slots).map(|_| RwLock::new(None)).collect(),
            free: Mutex::new((0..slots).rev().collect()),
        }
    }

    /// Whether a packet's payload fits a slot.
    pub fn fits(&self, packet: &Packet) -> bool {
        packet.payload.len() <= self.slot_size
    }

    /// Deposit a packet, returning its slot index.
    pub fn store(&self, packet: Packet) -> Result<u32, Error> {
        if packet.payload.len() > self.slot_size {
            return Err(Error::SlotOverflow);
        }
        let slot = self
            .free
            .lock()
            .unwrap()
            .pop()
            .ok_or(Error::CabinetExhausted)?;
        *self.slots[slot as usize].write().unwrap() = Some(packet);
        Ok(slot)
    }

    /// Take the packet out of `slot`, returning the slot to the free list.
    pub fn load(&self, slot: u32) -> Option<Packet> {
        let packet = self.slots.get(slot as usize)?.write().unwrap().take()?;
        self.free.lock().unwrap().push(slot);
        Some(packet)
    }

    /// Slots currently unoccupied.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PacketHeader, Protocol, VirtualAddress};
    use bytes::Bytes;

    fn packet(fill: u8, len: usize) -> Packet {
        Packet {
            header: PacketHeader {
                protocol: Protocol::Udp,
                src: VirtualAddress::new(1),
                src_port: 1,
                dst: VirtualAddress::new(2),
                dst_port: 2,
                tcp: None,
            },
            payload: Bytes::from(vec![fill; len]),
        }
    }

    #[test]
    fn store_and_load_round_trip() {
        let cabinet = Cabinet::new(4, 64);
        let original = packet(7, 10);
        let slot = cabinet.store(original.clone()).unwrap();
        assert_eq!(cabinet.available(), 3);
        assert_eq!(cabinet.load(slot), Some(original));
        assert_eq!(cabinet.available(), 4);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let cabinet = Cabinet::new(2, 64);
        cabinet.store(packet(0, 1)).unwrap();
        cabinet.store(packet(1, 1)).unwrap();
        assert!(matches!(
            cabinet.store(packet(2, 1)),
            Err(Error::CabinetExhausted)
        ));
    }

    #[test]
    fn oversize_payload_rejected() {
        let cabinet = Cabinet::new(1, 8);
        assert!(!cabinet.fits(&packet(0, 9)));
        assert!(matches!(
            cabinet.store(packet(0, 9)),
            Err(Error::SlotOverflow)
        ));
        // Slot not consumed by the failed store.
        assert_eq!(cabinet.available(), 1);
    }

    #[test]
    fn load_of_empty_slot_is_none() {
        let cabinet = Cabinet::new(1, 8);
        assert_eq!(cabinet.load(0), None);
        assert_eq!(cabinet.load(9), None);
    }
}
