//! Host-environment abstractions.
//!
//! The driver core never touches hardware or physical memory directly; the
//! embedder (a kernel, a VMM, or the test simulator) supplies these traits.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Memory-mapped register access relative to the controller's register base.
///
/// Implementations must behave like volatile device registers: no caching,
/// no reordering of accesses to the same offset.
pub trait Mmio: Send + Sync {
    fn read_u32(&self, offset: u64) -> u32;
    fn write_u32(&self, offset: u64, val: u32);
}

/// Byte-addressed physical memory as seen by the device's DMA engine.
///
/// Command lists, command tables and the received-FIS area are built by
/// writing little-endian words through this trait so the hardware observes
/// exactly the layout the driver constructed.
pub trait DmaMemory: Send + Sync {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&self, paddr: u64, buf: &[u8]);

    fn read_u8(&self, paddr: u64) -> u8 {
        let mut buf = [0u8; 1];
        self.read_physical(paddr, &mut buf);
        buf[0]
    }

    fn read_u16(&self, paddr: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.read_physical(paddr, &mut buf);
        u16::from_le_bytes(buf)
    }

    fn read_u32(&self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_u64(&self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u8(&self, paddr: u64, val: u8) {
        self.write_physical(paddr, &[val]);
    }

    fn write_u16(&self, paddr: u64, val: u16) {
        self.write_physical(paddr, &val.to_le_bytes());
    }

    fn write_u32(&self, paddr: u64, val: u32) {
        self.write_physical(paddr, &val.to_le_bytes());
    }

    fn write_u64(&self, paddr: u64, val: u64) {
        self.write_physical(paddr, &val.to_le_bytes());
    }
}

/// A physically contiguous, non-paged DMA buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub phys: u64,
    pub len: usize,
}

/// Allocator for [`DmaRegion`]s.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `len` bytes aligned to `align`, entirely below `max_phys`.
    fn alloc(&self, len: usize, align: usize, max_phys: u64) -> Option<DmaRegion>;
    fn free(&self, region: DmaRegion);
}

/// Monotonic time source plus the yield primitive the enumeration busy-wait
/// uses while a command is in flight.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
    fn yield_now(&self);
}

/// Std clock backed by `Instant`.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// Upward notifications from the driver to the storage stack.
pub trait EventSink: Send + Sync {
    /// A device arrived on or departed from `port`; the owner should rescan.
    ///
    /// Invoked from the deferred interrupt stage with no driver locks held,
    /// so the sink may call back into the controller synchronously.
    fn topology_changed(&self, port: usize);
}

/// Sink that drops all notifications.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn topology_changed(&self, _port: usize) {}
}

/// The bundle of host services handed to [`crate::AhciController`].
pub struct Host {
    pub mmio: Arc<dyn Mmio>,
    pub mem: Arc<dyn DmaMemory>,
    pub dma: Arc<dyn DmaAllocator>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventSink>,
}
