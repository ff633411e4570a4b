//! Synchronization objects referenced by wait/signal commands.

use crate::memory::{Allocation, GpuAddress};

/// In-order counter metadata of a counter-based event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterInfo {
    pub device_counter_allocation: Allocation,
    pub base_device_address: GpuAddress,
    pub allocation_offset: u64,
    pub counter_value: u64,
    /// Counter lives in caller-provided memory; waits compare its value.
    pub external_memory: bool,
}

/// An event. Legacy events are a slot in an event-pool allocation;
/// counter-based events wait on an in-order counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    allocation: Option<Allocation>,
    gpu_address: GpuAddress,
    counter: Option<CounterInfo>,
}

impl Event {
    /// A slot at `offset` inside an event-pool allocation.
    pub fn pool_slot(allocation: Allocation, offset: u64) -> Self {
        Self {
            allocation: Some(allocation),
            gpu_address: allocation.gpu_address + offset,
            counter: None,
        }
    }

    pub fn counter_based(allocation: Option<Allocation>, gpu_address: GpuAddress, counter: CounterInfo) -> Self {
        Self {
            allocation,
            gpu_address,
            counter: Some(counter),
        }
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.gpu_address
    }

    pub fn counter(&self) -> Option<&CounterInfo> {
        self.counter.as_ref()
    }

    pub fn is_counter_based(&self) -> bool {
        self.counter.is_some()
    }

    /// Address a wait on this event polls.
    pub fn wait_address(&self) -> GpuAddress {
        match &self.counter {
            Some(c) => c.base_device_address + c.allocation_offset,
            None => self.gpu_address,
        }
    }
}

/// The command list's own in-order counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InOrderCounter {
    pub allocation: Option<Allocation>,
    /// Counter compares are 64-bit and go through a GPR pair.
    pub qword: bool,
}

impl InOrderCounter {
    /// Whether `event` signals through this counter.
    pub fn owns(&self, event: &Event) -> bool {
        match (self.allocation, event.counter()) {
            (Some(own), Some(c)) => own.id == c.device_counter_allocation.id,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocationId, AllocationKind};

    fn alloc(id: u32, gpu: u64) -> Allocation {
        Allocation {
            id: AllocationId(id),
            kind: AllocationKind::Event,
            gpu_address: gpu,
            size: 4096,
        }
    }

    #[test]
    fn test_pool_slot_address() {
        let e = Event::pool_slot(alloc(1, 0x10_0000), 0x40);
        assert_eq!(e.gpu_address(), 0x10_0040);
        assert_eq!(e.wait_address(), 0x10_0040);
        assert!(!e.is_counter_based());
    }

    #[test]
    fn test_counter_based_wait_address() {
        let counter = CounterInfo {
            device_counter_allocation: alloc(2, 0x20_0000),
            base_device_address: 0x20_0000,
            allocation_offset: 8,
            counter_value: 3,
            external_memory: false,
        };
        let e = Event::counter_based(None, 0, counter);
        assert!(e.is_counter_based());
        assert_eq!(e.wait_address(), 0x20_0008);
        assert!(e.allocation().is_none());

        let own = InOrderCounter {
            allocation: Some(counter.device_counter_allocation),
            qword: false,
        };
        assert!(own.owns(&e));
        assert!(!InOrderCounter::default().owns(&e));
    }
}
