//! Explicit simulation context.
//!
//! Core calls never consult global mutable state; everything they need is
//! passed by reference through a [SimulationContext], split into a
//! process-global scope (shared by every worker in the process) and a
//! worker-local scope.

use crate::{AddressScheme, Cabinet, VirtualAddress};
use emnet_topology::Topology;
use std::sync::Arc;

/// State shared by every worker in this process.
#[derive(Debug)]
pub struct ProcessScope {
    pub scheme: AddressScheme,
    /// The machine this process runs on.
    pub machine: u32,
    pub topology: Arc<Topology>,
    /// Shared-memory arena for same-machine packet hand-off, when enabled.
    pub cabinet: Option<Arc<Cabinet>>,
}

/// State owned by one worker.
#[derive(Clone, Copy, Debug)]
pub struct WorkerScope {
    pub worker: u32,
}

/// The context threaded through every core call.
#[derive(Debug)]
pub struct SimulationContext {
    pub process: Arc<ProcessScope>,
    pub worker: WorkerScope,
}

impl SimulationContext {
    pub fn new(process: Arc<ProcessScope>, worker: u32) -> Self {
        Self {
            process,
            worker: WorkerScope { worker },
        }
    }

    /// Whether `addr` is hosted by this worker.
    pub fn is_local(&self, addr: VirtualAddress) -> bool {
        self.process
            .scheme
            .is_local(addr, self.process.machine, self.worker.worker)
    }

    /// Whether `addr` is hosted somewhere on this machine.
    pub fn same_machine(&self, addr: VirtualAddress) -> bool {
        self.process.scheme.same_machine(addr, self.process.machine)
    }
}
