//! Host-side AHCI SATA driver core.
//!
//! Implements the AHCI 1.x host programming model: controller reset and BIOS
//! handoff, port probe and IDENTIFY enumeration, a per-port command-slot
//! scheduler with an overflow request queue, PRDT-based scatter/gather DMA
//! command construction (LBA28 and LBA48), a two-stage interrupt pipeline
//! (register-only hard IRQ + deferred retirement scan), and removal draining.
//!
//! The crate is host-independent: register access, physical memory, DMA
//! allocation, time, and upward notifications all go through the traits in
//! [`hal`]. `ahci-sim` provides a software HBA implementing those traits for
//! the integration tests.

pub mod ata;
pub mod fis;
pub mod hal;
pub mod regs;

mod controller;
mod error;
mod port;
mod request;

pub use controller::{AhciController, MAX_PORTS};
pub use error::AhciError;
pub use hal::{
    Clock, DmaAllocator, DmaMemory, DmaRegion, EventSink, Host, Mmio, MonotonicClock,
    NullEventSink,
};
pub use port::PortFlags;
pub use request::{CompletionHandle, IoFlags, IoRequest, RequestKind, SgFragment};
