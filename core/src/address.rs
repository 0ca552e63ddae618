//! Bit-packed virtual addressing.
//!
//! A [VirtualAddress] packs a (machine, worker, node) triple into 32 bits:
//! machine-id bits, then worker-id bits, then random node-id bits. The bit
//! widths are sized at startup from the deployment shape, which makes "is
//! this address local to me?" an O(1) mask-and-compare with no lookup table.

use crate::Error;
use rand::Rng;
use std::fmt;

/// A 32-bit synthetic host address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualAddress(u32);

impl VirtualAddress {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let octets = self.0.to_be_bytes();
        write!(
            f,
            "{}.{}.{}.{}",
            octets[0], octets[1], octets[2], octets[3]
        )
    }
}

/// Packs and unpacks (machine, worker, node) triples.
///
/// Widths are `ceil(log2(num_machines))` and `ceil(log2(max_workers))`; the
/// remaining bits hold the node id.
#[derive(Clone, Copy, Debug)]
pub struct AddressScheme {
    machine_bits: u32,
    worker_bits: u32,
    node_bits: u32,
}

/// Number of bits needed to distinguish `n` values.
const fn bits_for(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        u32::BITS - (n - 1).leading_zeros()
    }
}

impl AddressScheme {
    /// Size the scheme for a deployment of `num_machines` machines with up to
    /// `max_workers` workers each.
    pub fn new(num_machines: u32, max_workers: u32) -> Result<Self, Error> {
        if num_machines == 0 || max_workers == 0 {
            return Err(Error::InvalidScheme("empty deployment"));
        }
        let machine_bits = bits_for(num_machines);
        let worker_bits = bits_for(max_workers);
        if machine_bits + worker_bits >= u32::BITS {
            return Err(Error::InvalidScheme("no bits left for node ids"));
        }
        Ok(Self {
            machine_bits,
            worker_bits,
            node_bits: u32::BITS - machine_bits - worker_bits,
        })
    }

    /// Pack a (machine, worker, node) triple. Out-of-width components are
    /// masked to their configured widths.
    pub const fn build(&self, machine: u32, worker: u32, node: u32) -> VirtualAddress {
        let machine = machine & mask(self.machine_bits);
        let worker = worker & mask(self.worker_bits);
        let node = node & mask(self.node_bits);
        VirtualAddress(
            shl(machine, self.worker_bits + self.node_bits) | shl(worker, self.node_bits) | node,
        )
    }

    pub const fn machine(&self, addr: VirtualAddress) -> u32 {
        shr(addr.0, self.worker_bits + self.node_bits) & mask(self.machine_bits)
    }

    pub const fn worker(&self, addr: VirtualAddress) -> u32 {
        shr(addr.0, self.node_bits) & mask(self.worker_bits)
    }

    pub const fn node(&self, addr: VirtualAddress) -> u32 {
        addr.0 & mask(self.node_bits)
    }

    /// Draw a random node id for (machine, worker), redrawing while the
    /// address's high-order byte is all-zero or all-one to avoid aliasing
    /// loopback/broadcast-like values. When the machine/worker prefix fills
    /// the high byte, redrawing cannot change it and the first draw is used.
    pub fn rand_node<R: Rng>(&self, rng: &mut R, machine: u32, worker: u32) -> VirtualAddress {
        let node_in_high_byte = self.node_bits > u32::BITS - 8;
        loop {
            let addr = self.build(machine, worker, rng.gen());
            let high = addr.0 >> 24;
            if !node_in_high_byte || (high != 0x00 && high != 0xFF) {
                return addr;
            }
        }
    }

    /// True when `addr` lives on this (machine, worker): one shift, one
    /// compare.
    pub const fn is_local(&self, addr: VirtualAddress, machine: u32, worker: u32) -> bool {
        shr(addr.0, self.node_bits) == (shl(machine, self.worker_bits) | worker)
    }

    /// True when `addr` lives on this machine, any worker.
    pub const fn same_machine(&self, addr: VirtualAddress, machine: u32) -> bool {
        self.machine(addr) == machine
    }
}

const fn mask(bits: u32) -> u32 {
    if bits == 0 {
        0
    } else if bits == u32::BITS {
        u32::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Shift left, yielding 0 instead of overflowing when a component width is 0
/// and the complementary widths sum to the full 32 bits.
const fn shl(value: u32, shift: u32) -> u32 {
    if shift >= u32::BITS {
        0
    } else {
        value << shift
    }
}

const fn shr(value: u32, shift: u32) -> u32 {
    if shift >= u32::BITS {
        0
    } else {
        value >> shift
    }
}
