//! Controller-level bring-up, capability discovery, and the two-stage
//! interrupt pipeline.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::ata::SECTOR_SIZE;
use crate::error::AhciError;
use crate::hal::Host;
use crate::port::Port;
use crate::regs::{
    BOHC_BB, BOHC_BOS, BOHC_OOC, BOHC_OOS, CAP2_BOH, CAP_NCS_MASK, CAP_NCS_SHIFT, CAP_NP_MASK,
    CAP_S64A, CAP_SNCQ, CAP_SSNTF, GHC_AE, GHC_IE, HBA_REG_BOHC, HBA_REG_CAP, HBA_REG_CAP2,
    HBA_REG_GHC, HBA_REG_IS, HBA_REG_PI, PORT_REG_IS,
};
use crate::request::IoRequest;

/// Hardware maximum number of ports per HBA.
pub const MAX_PORTS: usize = 32;

/// Initial wait for the BIOS to release ownership.
const HANDOFF_TIMEOUT: Duration = Duration::from_millis(50);
/// Extended wait once the BIOS has signalled it is busy cleaning up.
const HANDOFF_BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Host services plus reset-discovered capabilities, shared with every port.
pub(crate) struct Shared {
    pub(crate) host: Host,
    max_phys: AtomicU64,
    command_count: AtomicU32,
}

impl Shared {
    fn new(host: Host) -> Self {
        Self {
            host,
            max_phys: AtomicU64::new(u32::MAX as u64),
            command_count: AtomicU32::new(1),
        }
    }

    /// Highest physical address the controller can DMA to or from.
    pub(crate) fn max_phys(&self) -> u64 {
        self.max_phys.load(Ordering::Acquire)
    }

    /// Usable command slots per port.
    pub(crate) fn command_count(&self) -> usize {
        self.command_count.load(Ordering::Acquire) as usize
    }
}

/// Driver core for one AHCI host bus adapter.
///
/// All methods take `&self`; the hard-IRQ, DPC, and thread-context entry
/// points may be invoked from three different threads.
pub struct AhciController {
    shared: Shared,
    /// Ports with latched interrupt events awaiting the DPC.
    pending_ports: AtomicU32,
    implemented: AtomicU32,
    port_count: AtomicU32,
    ports: Vec<Port>,
}

impl AhciController {
    pub fn new(host: Host) -> Self {
        Self {
            shared: Shared::new(host),
            pending_ports: AtomicU32::new(0),
            implemented: AtomicU32::new(0),
            port_count: AtomicU32::new(0),
            ports: (0..MAX_PORTS).map(Port::new).collect(),
        }
    }

    /// Brings the controller into a known state: AHCI mode, BIOS handoff,
    /// capability discovery, per-port initialization, interrupts on.
    pub fn reset(&self) -> Result<(), AhciError> {
        let mmio = &self.shared.host.mmio;
        let ghc = mmio.read_u32(HBA_REG_GHC);
        if ghc & GHC_AE == 0 {
            mmio.write_u32(HBA_REG_GHC, ghc | GHC_AE);
        }

        let mut implemented = mmio.read_u32(HBA_REG_PI);
        if implemented == 0 {
            warn!("implemented-ports mask is empty; assuming all ports");
            implemented = u32::MAX;
        }

        let cap2 = mmio.read_u32(HBA_REG_CAP2);
        if cap2 & CAP2_BOH != 0 {
            self.bios_handoff()?;
        }

        let cap = mmio.read_u32(HBA_REG_CAP);
        let port_count = (cap & CAP_NP_MASK) + 1;
        if (port_count as usize) < MAX_PORTS {
            implemented &= (1u32 << port_count) - 1;
        }
        // Without both NCQ and S-Notification the multi-slot engine is not
        // trustworthy; fall back to one command at a time.
        let command_count = if cap & CAP_SNCQ != 0 && cap & CAP_SSNTF != 0 {
            ((cap & CAP_NCS_MASK) >> CAP_NCS_SHIFT) + 1
        } else {
            1
        };
        let max_phys = if cap & CAP_S64A != 0 {
            u64::MAX
        } else {
            u32::MAX as u64
        };
        self.implemented.store(implemented, Ordering::Release);
        self.port_count.store(port_count, Ordering::Release);
        self.shared.command_count.store(command_count, Ordering::Release);
        self.shared.max_phys.store(max_phys, Ordering::Release);
        debug!(implemented, port_count, command_count, "controller capabilities");

        for idx in 0..MAX_PORTS {
            if implemented & (1 << idx) == 0 {
                continue;
            }
            if let Err(err) = self.ports[idx].prepare(&self.shared) {
                warn!(port = idx, %err, "port failed to initialize; skipping");
            }
        }

        let is = mmio.read_u32(HBA_REG_IS);
        if is != 0 {
            mmio.write_u32(HBA_REG_IS, is);
        }
        let ghc = mmio.read_u32(HBA_REG_GHC);
        mmio.write_u32(HBA_REG_GHC, ghc | GHC_IE);
        Ok(())
    }

    /// Requests controller ownership from platform firmware.
    fn bios_handoff(&self) -> Result<(), AhciError> {
        let mmio = &self.shared.host.mmio;
        let clock = &self.shared.host.clock;
        let bohc = mmio.read_u32(HBA_REG_BOHC);
        if bohc & BOHC_BOS == 0 {
            return Ok(());
        }
        mmio.write_u32(HBA_REG_BOHC, bohc | BOHC_OOS);
        let start = clock.now();
        let mut timeout = HANDOFF_TIMEOUT;
        loop {
            let bohc = mmio.read_u32(HBA_REG_BOHC);
            if bohc & (BOHC_BOS | BOHC_BB) == 0 {
                break;
            }
            if bohc & BOHC_BB != 0 {
                timeout = HANDOFF_BUSY_TIMEOUT;
            }
            if clock.now() - start >= timeout {
                warn!(bohc, "BIOS did not release controller ownership");
                return Err(AhciError::Timeout);
            }
            clock.yield_now();
        }
        let bohc = mmio.read_u32(HBA_REG_BOHC);
        if bohc & BOHC_OOC != 0 {
            mmio.write_u32(HBA_REG_BOHC, bohc | BOHC_OOC);
        }
        Ok(())
    }

    /// Hard-IRQ stage. Register access and atomics only; returns whether the
    /// interrupt belonged to this controller.
    ///
    /// Port interrupt statuses must be acknowledged before the global status
    /// or the controller re-latches the port bits.
    pub fn interrupt_service(&self) -> bool {
        let mmio = &self.shared.host.mmio;
        let is = mmio.read_u32(HBA_REG_IS);
        if is == 0 {
            return false;
        }
        self.pending_ports.fetch_or(is, Ordering::AcqRel);
        let mut bits = is;
        while bits != 0 {
            let idx = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            let port = &self.ports[idx];
            let port_is = mmio.read_u32(port.reg_offset(PORT_REG_IS));
            port.events.fetch_or(port_is, Ordering::AcqRel);
            mmio.write_u32(port.reg_offset(PORT_REG_IS), port_is);
        }
        mmio.write_u32(HBA_REG_IS, is);
        true
    }

    /// Deferred stage: drains the pending-ports bitmap and runs each port's
    /// event handling and retirement scan.
    pub fn interrupt_dpc(&self) {
        let mut bits = self.pending_ports.swap(0, Ordering::AcqRel);
        while bits != 0 {
            let idx = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            self.ports[idx].process_interrupt(&self.shared);
        }
    }

    /// Checks whether `port` has an attached device, starting the port when
    /// one is found. `Ok(false)` covers every flavor of "no media".
    pub fn probe_port(&self, port: usize) -> Result<bool, AhciError> {
        if port >= MAX_PORTS {
            return Err(AhciError::NoSuchDevice);
        }
        if self.implemented.load(Ordering::Acquire) & (1 << port) == 0 {
            return Ok(false);
        }
        Ok(self.ports[port].probe(&self.shared))
    }

    /// Runs IDENTIFY on `port` and returns the drive's sector count. The
    /// port must have probed successfully.
    pub fn enumerate_port(&self, port: usize) -> Result<u64, AhciError> {
        if port >= MAX_PORTS {
            return Err(AhciError::NoSuchDevice);
        }
        self.ports[port].enumerate(&self.shared)
    }

    /// Submits a block request to `port`. Queues internally when all command
    /// slots are busy; completion is reported through the request's handle.
    pub fn enqueue(&self, port: usize, request: IoRequest) -> Result<(), AhciError> {
        if port >= MAX_PORTS {
            request.complete(Err(AhciError::NoSuchDevice));
            return Err(AhciError::NoSuchDevice);
        }
        self.ports[port].enqueue(&self.shared, request)
    }

    /// Probes every implemented port, enumerating new arrivals and draining
    /// ports whose device departed. Returns the ports with media.
    pub fn rescan_ports(&self) -> Vec<usize> {
        let implemented = self.implemented.load(Ordering::Acquire);
        let mut present = Vec::new();
        for idx in 0..MAX_PORTS {
            if implemented & (1 << idx) == 0 {
                continue;
            }
            let port = &self.ports[idx];
            if port.probe(&self.shared) {
                if !port.attached() {
                    match port.enumerate(&self.shared) {
                        Ok(sectors) => trace!(port = idx, sectors, "drive arrived"),
                        Err(err) => {
                            warn!(port = idx, %err, "failed to enumerate drive");
                            continue;
                        }
                    }
                }
                present.push(idx);
            } else if port.attached() {
                debug!(port = idx, "drive departed; draining port");
                port.remove(&self.shared, true);
            }
        }
        present
    }

    /// Drains `port` after its disk disappeared. Registers are still
    /// reachable, so the port is stopped first.
    pub fn remove_port(&self, port: usize) {
        if port < MAX_PORTS {
            self.ports[port].remove(&self.shared, true);
        }
    }

    /// Tears the whole controller down: registers are assumed unreachable,
    /// every request fails with `NoSuchDevice`, DMA areas go back to the
    /// allocator.
    pub fn remove_controller(&self) {
        for port in &self.ports {
            port.remove(&self.shared, false);
            port.release_dma(&self.shared);
        }
    }

    pub fn implemented_ports(&self) -> u32 {
        self.implemented.load(Ordering::Acquire)
    }

    pub fn port_count(&self) -> usize {
        self.port_count.load(Ordering::Acquire) as usize
    }

    pub fn command_slot_count(&self) -> usize {
        self.shared.command_count()
    }

    pub fn max_physical(&self) -> u64 {
        self.shared.max_phys()
    }

    pub fn is_attached(&self, port: usize) -> bool {
        port < MAX_PORTS && self.ports[port].attached()
    }

    /// Capacity of the drive on `port` in sectors; zero when detached.
    pub fn total_sectors(&self, port: usize) -> u64 {
        if port < MAX_PORTS {
            self.ports[port].total_sectors()
        } else {
            0
        }
    }

    /// Logical block size of attached drives.
    pub fn block_size(&self, _port: usize) -> usize {
        SECTOR_SIZE
    }
}
