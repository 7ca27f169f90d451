//! Per-port state machine: command-slot scheduling, request queueing, DMA
//! command construction, retirement, and removal draining.

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use crate::ata::{
    parse_identify, ATA_CMD_FLUSH_CACHE, ATA_CMD_IDENTIFY, ATA_CMD_READ_DMA,
    ATA_CMD_READ_DMA_EXT, ATA_CMD_WRITE_DMA, ATA_CMD_WRITE_DMA_EXT, ATA_DEVICE_LBA, LBA28_MAX,
    LBA28_MAX_SECTORS, LBA48_MAX_SECTORS, SECTOR_SHIFT, SECTOR_SIZE,
};
use crate::controller::Shared;
use crate::error::AhciError;
use crate::fis::{RegisterFis, FIS_REGISTER_DWORDS};
use crate::hal::{DmaMemory, DmaRegion};
use crate::regs::{
    port_reg_base, CMD_HDR_OFF_CONTROL, CMD_HDR_OFF_CTBA, CMD_HDR_OFF_CTBAU, CMD_HDR_OFF_PRDBC,
    CMD_HDR_PRDTL_SHIFT, CMD_HDR_WRITE, COMMAND_HEADER_SIZE, COMMAND_LIST_ALIGN,
    COMMAND_TABLE_ALIGN, COMMAND_TABLE_PRDT_OFFSET, COMMAND_TABLE_SIZE, MAX_COMMAND_SLOTS,
    PORT_CMD_FR, PORT_CMD_FRE, PORT_CMD_CR, PORT_CMD_POD, PORT_CMD_ST, PORT_CMD_SUD,
    PORT_INT_CONNECTION_MASK, PORT_INT_DEFAULT_ENABLE, PORT_INT_ERROR_MASK, PORT_REG_CI,
    PORT_REG_CLB, PORT_REG_CLBU, PORT_REG_CMD, PORT_REG_FB, PORT_REG_FBU, PORT_REG_IE,
    PORT_REG_IS, PORT_REG_SCTL, PORT_REG_SERR, PORT_REG_SSTS, PORT_REG_TFD, PORT_SCTL_DET_MASK,
    PORT_SSTS_DET_MASK, PORT_SSTS_DET_PHY, PORT_TFD_ERR_MASK, PRDT_DBC_MASK, PRDT_ENTRY_COUNT,
    PRDT_ENTRY_SIZE, PRDT_MAX_ENTRY_BYTES, PRDT_OFF_DBA, PRDT_OFF_DBAU, PRDT_OFF_DBC,
    RECEIVED_FIS_SIZE,
};
use crate::request::{IoFlags, IoRequest, RequestKind, SgFragment};

/// Maximum wait for PxCMD.CR/FR to drop after clearing ST/FRE.
const PORT_STOP_TIMEOUT: Duration = Duration::from_millis(1000);
/// SATA mandates 10 ms for PHY detection after spin-up; doubled for slow
/// devices and rounded up.
const PHY_DETECT_TIMEOUT: Duration = Duration::from_millis(25);

bitflags! {
    /// Software state discovered at enumeration time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortFlags: u32 {
        /// 48-bit addressing supported (IDENTIFY word 83 bit 10).
        const LBA48 = 1 << 0;
        /// Multiple command slots usable.
        const NCQ = 1 << 1;
    }
}

#[derive(Default)]
struct Slot {
    request: Option<IoRequest>,
    /// Byte count of the chunk currently in flight on this slot.
    io_size: usize,
}

struct PortInner {
    /// Slots handed to hardware and not yet retired.
    pending: u32,
    /// Usable command slots for this controller.
    command_mask: u32,
    slots: [Slot; MAX_COMMAND_SLOTS],
    /// Requests waiting for a free slot, oldest first.
    queue: VecDeque<IoRequest>,
    flags: PortFlags,
    total_sectors: u64,
    /// Whether a drive has been enumerated and handed to the block layer.
    attached: bool,
    /// Command list + command tables, one combined allocation.
    cmd_area: Option<DmaRegion>,
    fis_area: Option<DmaRegion>,
    command_list_phys: u64,
    tables_phys: u64,
}

impl PortInner {
    fn new() -> Self {
        Self {
            pending: 0,
            command_mask: 1,
            slots: std::array::from_fn(|_| Slot::default()),
            queue: VecDeque::new(),
            flags: PortFlags::empty(),
            total_sectors: 0,
            attached: false,
            cmd_area: None,
            fis_area: None,
            command_list_phys: 0,
            tables_phys: 0,
        }
    }

    fn command_header_phys(&self, slot: usize) -> u64 {
        self.command_list_phys + (slot * COMMAND_HEADER_SIZE) as u64
    }

    fn command_table_phys(&self, slot: usize) -> u64 {
        self.tables_phys + (slot * COMMAND_TABLE_SIZE) as u64
    }
}

pub(crate) struct Port {
    index: usize,
    regs_base: u64,
    /// Interrupt events latched by the hard-IRQ stage, consumed by the DPC.
    pub(crate) events: AtomicU32,
    /// Slot reservation mask. Atomic so the allocator math is lock-free;
    /// transitions still happen under the DPC lock.
    allocated: AtomicU32,
    inner: Mutex<PortInner>,
}

impl Port {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            regs_base: port_reg_base(index),
            events: AtomicU32::new(0),
            allocated: AtomicU32::new(0),
            inner: Mutex::new(PortInner::new()),
        }
    }

    pub(crate) fn reg_offset(&self, reg: u64) -> u64 {
        self.regs_base + reg
    }

    fn read_reg(&self, shared: &Shared, reg: u64) -> u32 {
        shared.host.mmio.read_u32(self.regs_base + reg)
    }

    fn write_reg(&self, shared: &Shared, reg: u64, val: u32) {
        shared.host.mmio.write_u32(self.regs_base + reg, val);
    }

    pub(crate) fn attached(&self) -> bool {
        self.inner.lock().unwrap().attached
    }

    pub(crate) fn total_sectors(&self) -> u64 {
        self.inner.lock().unwrap().total_sectors
    }

    /// Brings the port to a stopped, cleanly configured state and publishes
    /// its DMA areas. Called for every implemented port during controller
    /// reset.
    pub(crate) fn prepare(&self, shared: &Shared) -> Result<(), AhciError> {
        self.stop(shared)?;

        let mut inner = self.inner.lock().unwrap();
        let slots = shared.command_count();
        inner.command_mask = if slots >= MAX_COMMAND_SLOTS {
            u32::MAX
        } else {
            (1u32 << slots) - 1
        };
        inner.pending = 0;
        self.allocated.store(0, Ordering::Release);
        self.events.store(0, Ordering::Release);

        if inner.cmd_area.is_none() {
            let header_span = align_up(slots * COMMAND_HEADER_SIZE, COMMAND_TABLE_ALIGN);
            let len = header_span + slots * COMMAND_TABLE_SIZE;
            let region = shared
                .host
                .dma
                .alloc(len, COMMAND_LIST_ALIGN, shared.max_phys())
                .ok_or(AhciError::InsufficientResources)?;
            inner.command_list_phys = region.phys;
            inner.tables_phys = region.phys + header_span as u64;
            inner.cmd_area = Some(region);
        }
        if inner.fis_area.is_none() {
            let region = shared
                .host
                .dma
                .alloc(RECEIVED_FIS_SIZE, RECEIVED_FIS_SIZE, shared.max_phys())
                .ok_or(AhciError::InsufficientResources)?;
            inner.fis_area = Some(region);
        }
        let mem = shared.host.mem.as_ref();
        if let Some(region) = inner.cmd_area {
            zero_region(mem, region);
        }
        if let Some(region) = inner.fis_area {
            zero_region(mem, region);
        }

        self.write_reg(shared, PORT_REG_CLB, inner.command_list_phys as u32);
        self.write_reg(shared, PORT_REG_CLBU, (inner.command_list_phys >> 32) as u32);
        let fis_phys = inner.fis_area.map(|r| r.phys).unwrap_or(0);
        self.write_reg(shared, PORT_REG_FB, fis_phys as u32);
        self.write_reg(shared, PORT_REG_FBU, (fis_phys >> 32) as u32);

        let sctl = self.read_reg(shared, PORT_REG_SCTL);
        self.write_reg(shared, PORT_REG_SCTL, sctl & !PORT_SCTL_DET_MASK);
        let cmd = self.read_reg(shared, PORT_REG_CMD);
        self.write_reg(shared, PORT_REG_CMD, cmd | PORT_CMD_FRE);
        self.write_reg(shared, PORT_REG_SERR, u32::MAX);
        self.write_reg(shared, PORT_REG_IS, u32::MAX);
        self.write_reg(shared, PORT_REG_IE, PORT_INT_DEFAULT_ENABLE);
        Ok(())
    }

    /// Clears ST and FRE and waits for the command list and FIS receive
    /// engines to drain.
    fn stop(&self, shared: &Shared) -> Result<(), AhciError> {
        let cmd = self.read_reg(shared, PORT_REG_CMD);
        self.write_reg(shared, PORT_REG_CMD, cmd & !(PORT_CMD_ST | PORT_CMD_FRE));
        let deadline = shared.host.clock.now() + PORT_STOP_TIMEOUT;
        loop {
            if self.read_reg(shared, PORT_REG_CMD) & (PORT_CMD_CR | PORT_CMD_FR) == 0 {
                return Ok(());
            }
            if shared.host.clock.now() >= deadline {
                return Err(AhciError::Timeout);
            }
            shared.host.clock.yield_now();
        }
    }

    /// Checks for an attached device, spinning the PHY up if needed.
    /// Returns whether media is present; on success the port is started.
    pub(crate) fn probe(&self, shared: &Shared) -> bool {
        let ssts = self.read_reg(shared, PORT_REG_SSTS);
        if ssts & PORT_SSTS_DET_MASK != PORT_SSTS_DET_PHY {
            let cmd = self.read_reg(shared, PORT_REG_CMD);
            self.write_reg(shared, PORT_REG_CMD, cmd | PORT_CMD_POD | PORT_CMD_SUD);
            let deadline = shared.host.clock.now() + PHY_DETECT_TIMEOUT;
            loop {
                let ssts = self.read_reg(shared, PORT_REG_SSTS);
                if ssts & PORT_SSTS_DET_MASK == PORT_SSTS_DET_PHY {
                    break;
                }
                if shared.host.clock.now() >= deadline {
                    return false;
                }
                shared.host.clock.yield_now();
            }
        }
        let tfd = self.read_reg(shared, PORT_REG_TFD);
        if tfd & PORT_TFD_ERR_MASK != 0 {
            warn!(port = self.index, tfd, "device detected but task file is faulted");
            return false;
        }
        let cmd = self.read_reg(shared, PORT_REG_CMD);
        self.write_reg(shared, PORT_REG_CMD, cmd | PORT_CMD_ST | PORT_CMD_FRE);
        true
    }

    /// Issues IDENTIFY DEVICE and records the drive's geometry.
    ///
    /// The submitted slot carries no request; after dropping the lock this
    /// busy-yields until the retirement scan clears the pending bit, then
    /// reclaims the slot itself.
    pub(crate) fn enumerate(&self, shared: &Shared) -> Result<u64, AhciError> {
        let buffer = shared
            .host
            .dma
            .alloc(SECTOR_SIZE, SECTOR_SIZE, shared.max_phys())
            .ok_or(AhciError::InsufficientResources)?;

        let slot = {
            let mut inner = self.inner.lock().unwrap();
            let Some(slot) = self.allocate_slot(shared, &inner) else {
                drop(inner);
                shared.host.dma.free(buffer);
                return Err(AhciError::InsufficientResources);
            };
            let mem = shared.host.mem.as_ref();
            let table = inner.command_table_phys(slot);
            let fis = RegisterFis {
                command: ATA_CMD_IDENTIFY,
                device: ATA_DEVICE_LBA,
                count: 1,
                ..RegisterFis::default()
            };
            write_cfis(mem, table, &fis);
            let prdt = table + COMMAND_TABLE_PRDT_OFFSET as u64;
            mem.write_u32(prdt + PRDT_OFF_DBA, buffer.phys as u32);
            mem.write_u32(prdt + PRDT_OFF_DBAU, (buffer.phys >> 32) as u32);
            mem.write_u32(prdt + 0x08, 0);
            mem.write_u32(prdt + PRDT_OFF_DBC, (SECTOR_SIZE - 1) as u32);
            let hdr = inner.command_header_phys(slot);
            mem.write_u32(hdr + CMD_HDR_OFF_CONTROL, FIS_REGISTER_DWORDS | (1 << CMD_HDR_PRDTL_SHIFT));
            mem.write_u32(hdr + CMD_HDR_OFF_PRDBC, 0);
            self.submit(shared, &mut inner, slot);
            slot
        };

        let mask = 1u32 << slot;
        loop {
            if self.inner.lock().unwrap().pending & mask == 0 {
                break;
            }
            shared.host.clock.yield_now();
        }

        let mut inner = self.inner.lock().unwrap();
        self.free_slot(&inner, slot);
        let tfd = self.read_reg(shared, PORT_REG_TFD);
        if tfd & PORT_TFD_ERR_MASK != 0 {
            drop(inner);
            shared.host.dma.free(buffer);
            warn!(port = self.index, tfd, "IDENTIFY failed");
            return Err(AhciError::DeviceIoError);
        }
        let mut data = [0u8; SECTOR_SIZE];
        shared.host.mem.read_physical(buffer.phys, &mut data);
        let geometry = parse_identify(&data);
        if geometry.total_sectors == 0 {
            drop(inner);
            shared.host.dma.free(buffer);
            warn!(port = self.index, "IDENTIFY reported zero capacity");
            return Err(AhciError::DeviceIoError);
        }
        inner.flags = PortFlags::empty();
        if geometry.lba48 {
            inner.flags |= PortFlags::LBA48;
        }
        if shared.command_count() > 1 {
            inner.flags |= PortFlags::NCQ;
        }
        inner.total_sectors = geometry.total_sectors;
        inner.attached = true;
        drop(inner);
        shared.host.dma.free(buffer);
        debug!(
            port = self.index,
            sectors = geometry.total_sectors,
            lba48 = geometry.lba48,
            "enumerated drive"
        );
        Ok(geometry.total_sectors)
    }

    /// Reserves the lowest free slot (slot 0 only without NCQ) and writes a
    /// fresh command header pointing at the slot's command table.
    fn allocate_slot(&self, shared: &Shared, inner: &PortInner) -> Option<usize> {
        let allocated = self.allocated.load(Ordering::Acquire);
        let slot = if inner.flags.contains(PortFlags::NCQ) {
            let free = !allocated & inner.command_mask;
            if free == 0 {
                return None;
            }
            free.trailing_zeros() as usize
        } else {
            if allocated != 0 {
                return None;
            }
            0
        };
        let mask = 1u32 << slot;
        debug_assert_eq!(inner.pending & mask, 0);
        self.allocated.fetch_or(mask, Ordering::AcqRel);

        let mem = shared.host.mem.as_ref();
        let hdr = inner.command_header_phys(slot);
        let table = inner.command_table_phys(slot);
        mem.write_u32(hdr + CMD_HDR_OFF_CONTROL, 0);
        mem.write_u32(hdr + CMD_HDR_OFF_PRDBC, 0);
        mem.write_u32(hdr + CMD_HDR_OFF_CTBA, table as u32);
        mem.write_u32(hdr + CMD_HDR_OFF_CTBAU, (table >> 32) as u32);
        Some(slot)
    }

    fn free_slot(&self, inner: &PortInner, slot: usize) {
        debug_assert_eq!(inner.pending & (1 << slot), 0);
        self.allocated.fetch_and(!(1u32 << slot), Ordering::AcqRel);
    }

    /// Hands the slot to hardware. The fence orders the descriptor writes
    /// before the issue-register write; `pending` is updated after so the
    /// interrupt path never sees a software bit without hardware state.
    fn submit(&self, shared: &Shared, inner: &mut PortInner, slot: usize) {
        fence(Ordering::Release);
        self.write_reg(shared, PORT_REG_CI, 1u32 << slot);
        inner.pending |= 1u32 << slot;
    }

    /// Accepts a request from the block layer: dispatch immediately if a
    /// slot is free, otherwise queue for the DPC to pick up.
    pub(crate) fn enqueue(&self, shared: &Shared, request: IoRequest) -> Result<(), AhciError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.attached {
            drop(inner);
            request.complete(Err(AhciError::NoSuchDevice));
            return Err(AhciError::NoSuchDevice);
        }
        match self.allocate_slot(shared, &inner) {
            Some(slot) => {
                let kind = request.kind;
                inner.slots[slot].request = Some(request);
                match kind {
                    RequestKind::Synchronize => self.execute_flush(shared, &mut inner, slot),
                    RequestKind::Read | RequestKind::Write => {
                        self.execute_dma_io(shared, &mut inner, slot)
                    }
                }
            }
            None => inner.queue.push_back(request),
        }
        Ok(())
    }

    /// DPC stage for this port: consume latched events, retire every slot
    /// whose PxCI bit dropped, then notify on topology changes.
    pub(crate) fn process_interrupt(&self, shared: &Shared) {
        let events = self.events.swap(0, Ordering::AcqRel);
        if events == 0 {
            return;
        }
        trace!(port = self.index, events, "port interrupt");
        if events & PORT_INT_ERROR_MASK != 0 {
            warn!(port = self.index, events, "port error interrupt");
        }

        {
            let mut inner = self.inner.lock().unwrap();
            let ci = self.read_reg(shared, PORT_REG_CI);
            // Hardware never starts commands on its own.
            debug_assert_eq!(ci & !inner.pending, 0);
            let finished = (ci ^ inner.pending) & inner.pending;
            if finished != 0 {
                let tfd = self.read_reg(shared, PORT_REG_TFD);
                let failed = tfd & PORT_TFD_ERR_MASK != 0;
                if failed {
                    warn!(port = self.index, tfd, "task file error; failing retired commands");
                }
                inner.pending &= !finished;
                let mut bits = finished;
                while bits != 0 {
                    let slot = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    self.retire_slot(shared, &mut inner, slot, failed);
                }
            }
        }

        // The sink may call straight back into this port, so notify with the
        // lock released.
        if events & PORT_INT_CONNECTION_MASK != 0 {
            debug!(port = self.index, "connection change");
            shared.host.events.topology_changed(self.index);
        }
    }

    fn retire_slot(&self, shared: &Shared, inner: &mut PortInner, slot: usize, failed: bool) {
        let io_size = std::mem::take(&mut inner.slots[slot].io_size);
        if inner.slots[slot].request.is_none() {
            // IDENTIFY: the busy-waiting enumerator owns the slot.
            return;
        }
        if failed {
            if let Some(request) = inner.slots[slot].request.take() {
                request.complete(Err(AhciError::DeviceIoError));
            }
            self.begin_next(shared, inner, slot);
            return;
        }
        let (done, needs_flush) = {
            let Some(request) = inner.slots[slot].request.as_mut() else {
                return;
            };
            if request.is_io() && io_size != 0 {
                request.bytes_completed += io_size;
                request.new_offset += io_size as u64;
            }
            let done = !request.is_io() || request.bytes_remaining() == 0;
            let needs_flush = done
                && request.is_write()
                && request.flags.contains(IoFlags::WRITE_SYNCHRONIZED)
                && io_size != 0;
            (done, needs_flush)
        };
        if needs_flush {
            self.execute_flush(shared, inner, slot);
        } else if !done {
            self.execute_dma_io(shared, inner, slot);
        } else {
            if let Some(request) = inner.slots[slot].request.take() {
                request.complete(Ok(()));
            }
            self.begin_next(shared, inner, slot);
        }
    }

    /// Starts the oldest queued request on a just-vacated slot, or frees it.
    fn begin_next(&self, shared: &Shared, inner: &mut PortInner, slot: usize) {
        match inner.queue.pop_front() {
            Some(request) => {
                let kind = request.kind;
                inner.slots[slot].request = Some(request);
                match kind {
                    RequestKind::Synchronize => self.execute_flush(shared, inner, slot),
                    RequestKind::Read | RequestKind::Write => {
                        self.execute_dma_io(shared, inner, slot)
                    }
                }
            }
            None => self.free_slot(inner, slot),
        }
    }

    /// Builds and submits one READ/WRITE DMA command for the next chunk of
    /// the slot's request.
    fn execute_dma_io(&self, shared: &Shared, inner: &mut PortInner, slot: usize) {
        let max_sectors = if inner.flags.contains(PortFlags::LBA48) {
            LBA48_MAX_SECTORS
        } else {
            LBA28_MAX_SECTORS
        };
        let chunk = {
            let Some(request) = inner.slots[slot].request.as_ref() else {
                return;
            };
            let remaining = request.bytes_remaining();
            if remaining == 0 {
                0
            } else {
                let budget = remaining.min(max_sectors as usize * SECTOR_SIZE);
                let skip = request.buffer_offset + request.bytes_completed;
                let (entries, total) = build_prdt_plan(&request.fragments, skip, budget);
                debug_assert!(!entries.is_empty());
                debug_assert_eq!(total % SECTOR_SIZE, 0);

                let mem = shared.host.mem.as_ref();
                let table = inner.command_table_phys(slot);
                let prdt_base = table + COMMAND_TABLE_PRDT_OFFSET as u64;
                let max_phys = shared.max_phys();
                for (i, &(phys, len)) in entries.iter().enumerate() {
                    debug_assert!(phys + len as u64 <= max_phys);
                    let entry = prdt_base + (i * PRDT_ENTRY_SIZE) as u64;
                    mem.write_u32(entry + PRDT_OFF_DBA, phys as u32);
                    mem.write_u32(entry + PRDT_OFF_DBAU, (phys >> 32) as u32);
                    mem.write_u32(entry + 0x08, 0);
                    mem.write_u32(entry + PRDT_OFF_DBC, (len as u32 - 1) & PRDT_DBC_MASK);
                }

                let sectors = (total / SECTOR_SIZE) as u64;
                let lba = request.new_offset >> SECTOR_SHIFT;
                let write = request.is_write();
                // Every sector of the command must be addressable in 28 bits
                // to use the short form, not just the first.
                let fis = if lba + sectors - 1 > LBA28_MAX || sectors > LBA28_MAX_SECTORS {
                    RegisterFis {
                        command: if write {
                            ATA_CMD_WRITE_DMA_EXT
                        } else {
                            ATA_CMD_READ_DMA_EXT
                        },
                        features: 0,
                        lba,
                        device: ATA_DEVICE_LBA,
                        // 65536 sectors is encoded as 0.
                        count: (sectors & 0xFFFF) as u16,
                    }
                } else {
                    RegisterFis {
                        command: if write { ATA_CMD_WRITE_DMA } else { ATA_CMD_READ_DMA },
                        features: 0,
                        lba: lba & 0x00FF_FFFF,
                        // LBA bits 24-27 travel in the device register.
                        device: ATA_DEVICE_LBA | ((lba >> 24) as u8 & 0xF),
                        // 256 sectors is encoded as 0.
                        count: (sectors & 0xFF) as u16,
                    }
                };
                write_cfis(mem, table, &fis);

                let hdr = inner.command_header_phys(slot);
                let control = FIS_REGISTER_DWORDS
                    | if write { CMD_HDR_WRITE } else { 0 }
                    | ((entries.len() as u32) << CMD_HDR_PRDTL_SHIFT);
                mem.write_u32(hdr + CMD_HDR_OFF_CONTROL, control);
                mem.write_u32(hdr + CMD_HDR_OFF_PRDBC, 0);
                total
            }
        };
        if chunk == 0 {
            if let Some(request) = inner.slots[slot].request.take() {
                self.free_slot(inner, slot);
                request.complete(Ok(()));
            }
            return;
        }
        inner.slots[slot].io_size = chunk;
        self.submit(shared, inner, slot);
    }

    /// Submits FLUSH CACHE on the slot: no PRDT, no LBA, no count.
    fn execute_flush(&self, shared: &Shared, inner: &mut PortInner, slot: usize) {
        let mem = shared.host.mem.as_ref();
        let table = inner.command_table_phys(slot);
        write_cfis(mem, table, &RegisterFis::new(ATA_CMD_FLUSH_CACHE));
        let hdr = inner.command_header_phys(slot);
        mem.write_u32(hdr + CMD_HDR_OFF_CONTROL, FIS_REGISTER_DWORDS);
        mem.write_u32(hdr + CMD_HDR_OFF_PRDBC, 0);
        inner.slots[slot].io_size = 0;
        self.submit(shared, inner, slot);
    }

    /// Fails every in-flight and queued request with `NoSuchDevice` and
    /// forgets the drive. `touch_registers` is false when the controller
    /// itself is gone.
    pub(crate) fn remove(&self, shared: &Shared, touch_registers: bool) {
        let mut inner = self.inner.lock().unwrap();
        if touch_registers && self.stop(shared).is_err() {
            warn!(port = self.index, "port did not stop during removal");
        }
        let pending = std::mem::take(&mut inner.pending);
        let mut bits = pending;
        while bits != 0 {
            let slot = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            inner.slots[slot].io_size = 0;
            if let Some(request) = inner.slots[slot].request.take() {
                request.complete(Err(AhciError::NoSuchDevice));
            }
        }
        while let Some(request) = inner.queue.pop_front() {
            request.complete(Err(AhciError::NoSuchDevice));
        }
        self.allocated.store(0, Ordering::Release);
        self.events.store(0, Ordering::Release);
        inner.flags = PortFlags::empty();
        inner.total_sectors = 0;
        inner.attached = false;
    }

    /// Returns the port's DMA areas to the allocator at controller teardown.
    pub(crate) fn release_dma(&self, shared: &Shared) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(region) = inner.cmd_area.take() {
            shared.host.dma.free(region);
        }
        if let Some(region) = inner.fis_area.take() {
            shared.host.dma.free(region);
        }
        inner.command_list_phys = 0;
        inner.tables_phys = 0;
    }
}

fn align_up(val: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (val + align - 1) & !(align - 1)
}

fn zero_region(mem: &dyn DmaMemory, region: DmaRegion) {
    mem.write_physical(region.phys, &vec![0u8; region.len]);
}

fn write_cfis(mem: &dyn DmaMemory, table: u64, fis: &RegisterFis) {
    let encoded = fis.encode();
    let mut cfis = [0u8; 0x40];
    cfis[..encoded.len()].copy_from_slice(&encoded);
    mem.write_physical(table, &cfis);
}

/// Walks the scatter list, skipping `skip` bytes, and plans PRDT entries
/// covering at most `budget` bytes. Entries are bounded by the 4 MiB
/// per-entry cap, fragment boundaries, and the 120-entry table.
fn build_prdt_plan(
    fragments: &[SgFragment],
    mut skip: usize,
    mut budget: usize,
) -> (Vec<(u64, usize)>, usize) {
    let mut entries: Vec<(u64, usize)> = Vec::new();
    let mut total = 0usize;
    for fragment in fragments {
        if budget == 0 || entries.len() == PRDT_ENTRY_COUNT {
            break;
        }
        if skip >= fragment.len {
            skip -= fragment.len;
            continue;
        }
        let mut offset = skip;
        skip = 0;
        while offset < fragment.len && budget > 0 && entries.len() < PRDT_ENTRY_COUNT {
            let take = (fragment.len - offset)
                .min(budget)
                .min(PRDT_MAX_ENTRY_BYTES as usize);
            debug_assert_eq!(take % 2, 0);
            entries.push((fragment.phys + offset as u64, take));
            total += take;
            offset += take;
            budget -= take;
        }
    }
    (entries, total)
}
