//! Register-accurate software HBA.
//!
//! Implements the AHCI programming model the driver core targets: HBA and
//! per-port registers, BIOS/OS handoff, a command-list engine that parses
//! command headers, CFIS and PRDT out of simulated physical memory, and
//! per-port interrupt latching. Commands execute synchronously inside the
//! PxCI register write; the driver still observes completion through its
//! normal interrupt pipeline.

use std::sync::{Arc, Mutex};

use ahci_driver::ata::{
    ATA_CMD_FLUSH_CACHE, ATA_CMD_IDENTIFY, ATA_CMD_READ_DMA, ATA_CMD_READ_DMA_EXT,
    ATA_CMD_WRITE_DMA, ATA_CMD_WRITE_DMA_EXT, SECTOR_SIZE,
};
use ahci_driver::fis::FIS_TYPE_REGISTER_H2D;
use ahci_driver::regs::{
    BOHC_BB, BOHC_BOS, BOHC_OOC, BOHC_OOS, BOHC_SOOE, CAP2_BOH, CAP_NCS_SHIFT, CAP_S64A, CAP_SNCQ,
    CAP_SSNTF, COMMAND_HEADER_SIZE, COMMAND_TABLE_PRDT_OFFSET, GHC_AE, GHC_IE, HBA_REG_BOHC,
    HBA_REG_CAP, HBA_REG_CAP2, HBA_REG_GHC, HBA_REG_IS, HBA_REG_PI, HBA_REG_VS, PORT_BASE,
    PORT_CMD_CLO, PORT_CMD_CR, PORT_CMD_FR, PORT_CMD_FRE, PORT_CMD_POD, PORT_CMD_ST, PORT_CMD_SUD,
    PORT_IS_DHRS, PORT_IS_PCS, PORT_IS_TFES, PORT_REG_CI, PORT_REG_CLB, PORT_REG_CLBU,
    PORT_REG_CMD, PORT_REG_FB, PORT_REG_FBU, PORT_REG_IE, PORT_REG_IS, PORT_REG_SCTL,
    PORT_REG_SERR, PORT_REG_SIG, PORT_REG_SSTS, PORT_REG_TFD, PORT_STRIDE, PRDT_DBC_MASK,
    PRDT_ENTRY_SIZE,
};
use ahci_driver::{DmaMemory, Mmio};

use crate::drive::SimDrive;
use crate::mem::SimMemory;

const SATA_SIG_ATA: u32 = 0x0000_0101;
/// DRDY | DSC.
const TFD_READY: u32 = 0x50;
/// DRDY | DSC | ERR, with ABRT in the error byte.
const TFD_ERROR: u32 = 0x51 | (0x04 << 8);
/// Received-FIS area offset where the D2H register FIS lands.
const RX_FIS_D2H_OFFSET: u64 = 0x40;

/// How the emulated BIOS responds to an ownership claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiosBehavior {
    /// BIOS never owned the controller; BOS starts clear.
    NotOwned,
    /// BIOS releases ownership as soon as the OS claims it.
    Cooperative,
    /// BIOS raises the busy bit and releases after the OS polls BOHC
    /// `polls` more times.
    Busy { polls: u32 },
    /// BIOS never releases ownership.
    Stubborn,
}

pub struct SimHbaConfig {
    /// Implemented ports, 1..=16 (CAP.NP is reported in 4 bits).
    pub ports: usize,
    /// Command slots per port, 1..=32.
    pub slots: usize,
    pub ncq: bool,
    pub sntf: bool,
    pub s64a: bool,
    pub boh: bool,
    pub bios: BiosBehavior,
    /// Report an all-zero ports-implemented mask.
    pub empty_pi: bool,
}

impl Default for SimHbaConfig {
    fn default() -> Self {
        Self {
            ports: 4,
            slots: 32,
            ncq: true,
            sntf: true,
            s64a: true,
            boh: true,
            bios: BiosBehavior::Cooperative,
            empty_pi: false,
        }
    }
}

/// One executed (or rejected) command, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTrace {
    pub port: usize,
    pub slot: usize,
    pub command: u8,
    pub lba: u64,
    pub sectors: u64,
    pub prdt_entries: usize,
    pub byte_count: usize,
    pub failed: bool,
}

/// Externally visible snapshot of a port's register file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimPortState {
    pub clb: u64,
    pub fb: u64,
    pub is: u32,
    pub ie: u32,
    pub cmd: u32,
    pub tfd: u32,
    pub ssts: u32,
    pub sctl: u32,
    pub serr: u32,
    pub ci: u32,
}

struct SimPort {
    clb: u64,
    fb: u64,
    is: u32,
    ie: u32,
    cmd: u32,
    tfd: u32,
    sig: u32,
    ssts: u32,
    sctl: u32,
    serr: u32,
    ci: u32,
    drive: Option<SimDrive>,
    /// Requires PxCMD.SUD before the PHY reports a device.
    staggered: bool,
    /// Fail this many upcoming commands with ABRT.
    fail_commands: u32,
}

impl SimPort {
    fn new() -> Self {
        Self {
            clb: 0,
            fb: 0,
            is: 0,
            ie: 0,
            cmd: 0,
            tfd: 0,
            sig: 0,
            ssts: 0,
            sctl: 0,
            serr: 0,
            ci: 0,
            drive: None,
            staggered: false,
            fail_commands: 0,
        }
    }

    fn refresh_running(&mut self) {
        // FR and CR track FRE and ST immediately; synchronous execution
        // needs no stop sequencing.
        self.cmd &= !(PORT_CMD_FR | PORT_CMD_CR);
        if self.cmd & PORT_CMD_FRE != 0 {
            self.cmd |= PORT_CMD_FR;
        }
        if self.cmd & PORT_CMD_ST != 0 {
            self.cmd |= PORT_CMD_CR;
        }
    }

    fn refresh_ssts(&mut self) {
        self.ssts = if self.drive.is_some() {
            if self.staggered && self.cmd & PORT_CMD_SUD == 0 {
                // Device present, PHY not established.
                0x1
            } else {
                // DET=3, SPD=Gen1, IPM=active.
                (1 << 8) | (1 << 4) | 3
            }
        } else {
            0
        };
    }
}

struct HbaInner {
    cap: u32,
    ghc: u32,
    pi: u32,
    cap2: u32,
    bohc: u32,
    vs: u32,
    bios: BiosBehavior,
    ports: Vec<SimPort>,
    trace: Vec<CommandTrace>,
}

pub struct SimHba {
    mem: Arc<SimMemory>,
    inner: Mutex<HbaInner>,
}

impl SimHba {
    pub fn new(mem: Arc<SimMemory>, config: SimHbaConfig) -> Self {
        assert!((1..=16).contains(&config.ports));
        assert!((1..=32).contains(&config.slots));
        let mut cap = (config.ports as u32 - 1) & 0xF;
        cap |= ((config.slots as u32 - 1) & 0x1F) << CAP_NCS_SHIFT;
        if config.sntf {
            cap |= CAP_SSNTF;
        }
        if config.ncq {
            cap |= CAP_SNCQ;
        }
        if config.s64a {
            cap |= CAP_S64A;
        }
        let pi = if config.empty_pi {
            0
        } else {
            (1u32 << config.ports) - 1
        };
        let bohc = match config.bios {
            BiosBehavior::NotOwned => 0,
            _ => BOHC_BOS,
        };
        Self {
            mem,
            inner: Mutex::new(HbaInner {
                cap,
                ghc: GHC_AE,
                pi,
                cap2: if config.boh { CAP2_BOH } else { 0 },
                bohc,
                vs: 0x0001_0300,
                bios: config.bios,
                ports: (0..32).map(|_| SimPort::new()).collect(),
                trace: Vec::new(),
            }),
        }
    }

    pub fn attach_drive(&self, port: usize, drive: SimDrive) {
        let mut inner = self.inner.lock().unwrap();
        let p = &mut inner.ports[port];
        p.drive = Some(drive);
        p.sig = SATA_SIG_ATA;
        p.tfd = TFD_READY;
        p.refresh_ssts();
        p.is |= PORT_IS_PCS;
    }

    pub fn detach_drive(&self, port: usize) {
        let mut inner = self.inner.lock().unwrap();
        let p = &mut inner.ports[port];
        p.drive = None;
        p.sig = 0;
        p.tfd = 0;
        p.refresh_ssts();
        p.is |= PORT_IS_PCS;
    }

    pub fn set_staggered_spinup(&self, port: usize, staggered: bool) {
        let mut inner = self.inner.lock().unwrap();
        let p = &mut inner.ports[port];
        p.staggered = staggered;
        p.refresh_ssts();
    }

    /// The next `count` commands on `port` fail with an aborted status.
    pub fn inject_command_errors(&self, port: usize, count: u32) {
        self.inner.lock().unwrap().ports[port].fail_commands = count;
    }

    /// Latches an error into the task-file register, as a device stuck in
    /// an error state after reset would show.
    pub fn force_task_file_error(&self, port: usize) {
        self.inner.lock().unwrap().ports[port].tfd = TFD_ERROR;
    }

    pub fn trace(&self) -> Vec<CommandTrace> {
        self.inner.lock().unwrap().trace.clone()
    }

    pub fn clear_trace(&self) {
        self.inner.lock().unwrap().trace.clear();
    }

    pub fn flush_count(&self, port: usize) -> u32 {
        self.inner.lock().unwrap().ports[port]
            .drive
            .as_ref()
            .map(|d| d.flush_count())
            .unwrap_or(0)
    }

    pub fn read_drive_sector(&self, port: usize, lba: u64) -> [u8; SECTOR_SIZE] {
        self.inner.lock().unwrap().ports[port]
            .drive
            .as_ref()
            .map(|d| d.read_sector(lba))
            .unwrap_or([0u8; SECTOR_SIZE])
    }

    pub fn write_drive_sector(&self, port: usize, lba: u64, data: &[u8; SECTOR_SIZE]) {
        if let Some(drive) = self.inner.lock().unwrap().ports[port].drive.as_mut() {
            drive.write_sector(lba, data);
        }
    }

    pub fn port_state(&self, port: usize) -> SimPortState {
        let inner = self.inner.lock().unwrap();
        let p = &inner.ports[port];
        SimPortState {
            clb: p.clb,
            fb: p.fb,
            is: p.is,
            ie: p.ie,
            cmd: p.cmd,
            tfd: p.tfd,
            ssts: p.ssts,
            sctl: p.sctl,
            serr: p.serr,
            ci: p.ci,
        }
    }

    pub fn bohc(&self) -> u32 {
        self.inner.lock().unwrap().bohc
    }

    /// Level-sensitive interrupt line: any enabled port event while global
    /// interrupts are on.
    pub fn irq_pending(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.ghc & GHC_IE != 0 && inner.ports.iter().any(|p| p.is & p.ie != 0)
    }

    fn global_is(inner: &HbaInner) -> u32 {
        let mut is = 0u32;
        for (idx, p) in inner.ports.iter().enumerate() {
            if p.is != 0 {
                is |= 1 << idx;
            }
        }
        is
    }

    fn read_bohc(inner: &mut HbaInner) -> u32 {
        if let BiosBehavior::Busy { polls } = &mut inner.bios {
            if inner.bohc & BOHC_BB != 0 {
                if *polls == 0 {
                    inner.bohc &= !(BOHC_BOS | BOHC_BB);
                    inner.bohc |= BOHC_OOC;
                } else {
                    *polls -= 1;
                }
            }
        }
        inner.bohc
    }

    fn write_bohc(inner: &mut HbaInner, val: u32) {
        if val & BOHC_OOS != 0 {
            inner.bohc |= BOHC_OOS;
            match inner.bios {
                BiosBehavior::NotOwned | BiosBehavior::Cooperative => {
                    inner.bohc = (inner.bohc & !BOHC_BOS) | BOHC_OOS | BOHC_OOC;
                }
                BiosBehavior::Busy { .. } => {
                    inner.bohc |= BOHC_BB;
                }
                BiosBehavior::Stubborn => {}
            }
        }
        if val & BOHC_OOC != 0 {
            inner.bohc &= !BOHC_OOC;
        }
        inner.bohc = (inner.bohc & !BOHC_SOOE) | (val & BOHC_SOOE);
    }

    fn process_slot(&self, inner: &mut HbaInner, port_idx: usize, slot: usize) {
        let mem = self.mem.as_ref();
        let (clb, rx_fis) = {
            let p = &inner.ports[port_idx];
            let rx = (p.cmd & PORT_CMD_FRE != 0).then_some(p.fb);
            (p.clb, rx)
        };
        let hdr = clb + (slot * COMMAND_HEADER_SIZE) as u64;
        let dw0 = mem.read_u32(hdr);
        let prdtl = ((dw0 >> 16) & 0xFFFF) as usize;
        let ctba = mem.read_u32(hdr + 0x08) as u64 | (mem.read_u32(hdr + 0x0C) as u64) << 32;
        let mut cfis = [0u8; 0x40];
        mem.read_physical(ctba, &mut cfis);
        let segments: Vec<(u64, usize)> = (0..prdtl)
            .map(|i| {
                let entry = ctba + COMMAND_TABLE_PRDT_OFFSET as u64 + (i * PRDT_ENTRY_SIZE) as u64;
                let dba = mem.read_u32(entry) as u64 | (mem.read_u32(entry + 4) as u64) << 32;
                let dbc = ((mem.read_u32(entry + 0x0C) & PRDT_DBC_MASK) + 1) as usize;
                (dba, dbc)
            })
            .collect();

        let injected = {
            let p = &mut inner.ports[port_idx];
            if p.fail_commands > 0 {
                p.fail_commands -= 1;
                true
            } else {
                false
            }
        };
        let command = cfis[2];
        let result = execute_command(
            inner.ports[port_idx].drive.as_mut(),
            mem,
            &cfis,
            &segments,
            injected,
        );

        let p = &mut inner.ports[port_idx];
        p.ci &= !(1u32 << slot);
        let (lba, sectors, byte_count, failed) = match result {
            Ok((lba, sectors, bytes)) => {
                mem.write_u32(hdr + 0x04, bytes as u32);
                p.tfd = TFD_READY;
                p.is |= PORT_IS_DHRS;
                (lba, sectors, bytes, false)
            }
            Err(()) => {
                p.tfd = TFD_ERROR;
                p.is |= PORT_IS_TFES;
                (0, 0, 0, true)
            }
        };
        if let Some(fb) = rx_fis {
            let mut fis = [0u8; 20];
            fis[0] = 0x34;
            fis[1] = 0x40;
            fis[2] = p.tfd as u8;
            fis[3] = (p.tfd >> 8) as u8;
            mem.write_physical(fb + RX_FIS_D2H_OFFSET, &fis);
        }
        inner.trace.push(CommandTrace {
            port: port_idx,
            slot,
            command,
            lba,
            sectors,
            prdt_entries: segments.len(),
            byte_count,
            failed,
        });
    }
}

/// Runs one decoded command against the drive. `Err(())` means an aborted
/// command (task-file error).
fn execute_command(
    drive: Option<&mut SimDrive>,
    mem: &SimMemory,
    cfis: &[u8; 0x40],
    segments: &[(u64, usize)],
    injected_failure: bool,
) -> Result<(u64, u64, usize), ()> {
    if injected_failure || cfis[0] != FIS_TYPE_REGISTER_H2D {
        return Err(());
    }
    let drive = drive.ok_or(())?;
    match cfis[2] {
        ATA_CMD_IDENTIFY => {
            let data = drive.identify();
            let copied = scatter(mem, segments, &data);
            Ok((0, 1, copied))
        }
        ATA_CMD_READ_DMA | ATA_CMD_READ_DMA_EXT => {
            let (lba, count) = decode_lba(cfis, cfis[2] == ATA_CMD_READ_DMA_EXT);
            if !drive.in_range(lba, count) {
                return Err(());
            }
            let mut data = vec![0u8; count as usize * SECTOR_SIZE];
            for i in 0..count as usize {
                data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                    .copy_from_slice(&drive.read_sector(lba + i as u64));
            }
            let copied = scatter(mem, segments, &data);
            Ok((lba, count, copied))
        }
        ATA_CMD_WRITE_DMA | ATA_CMD_WRITE_DMA_EXT => {
            let (lba, count) = decode_lba(cfis, cfis[2] == ATA_CMD_WRITE_DMA_EXT);
            if !drive.in_range(lba, count) {
                return Err(());
            }
            let mut data = vec![0u8; count as usize * SECTOR_SIZE];
            let copied = gather(mem, segments, &mut data);
            if copied < data.len() {
                return Err(());
            }
            let mut sector = [0u8; SECTOR_SIZE];
            for (i, chunk) in data.chunks_exact(SECTOR_SIZE).enumerate() {
                sector.copy_from_slice(chunk);
                drive.write_sector(lba + i as u64, &sector);
            }
            Ok((lba, count, copied))
        }
        ATA_CMD_FLUSH_CACHE => {
            drive.flush();
            Ok((0, 0, 0))
        }
        _ => Err(()),
    }
}

fn decode_lba(cfis: &[u8; 0x40], ext: bool) -> (u64, u64) {
    let low = cfis[4] as u64 | (cfis[5] as u64) << 8 | (cfis[6] as u64) << 16;
    if ext {
        let lba =
            low | (cfis[8] as u64) << 24 | (cfis[9] as u64) << 32 | (cfis[10] as u64) << 40;
        let count = cfis[12] as u64 | (cfis[13] as u64) << 8;
        (lba, if count == 0 { 65536 } else { count })
    } else {
        let lba = low | ((cfis[7] & 0xF) as u64) << 24;
        let count = cfis[12] as u64;
        (lba, if count == 0 { 256 } else { count })
    }
}

fn scatter(mem: &SimMemory, segments: &[(u64, usize)], data: &[u8]) -> usize {
    let mut off = 0;
    for &(phys, len) in segments {
        if off >= data.len() {
            break;
        }
        let take = len.min(data.len() - off);
        mem.write_physical(phys, &data[off..off + take]);
        off += take;
    }
    off
}

fn gather(mem: &SimMemory, segments: &[(u64, usize)], data: &mut [u8]) -> usize {
    let mut off = 0;
    for &(phys, len) in segments {
        if off >= data.len() {
            break;
        }
        let take = len.min(data.len() - off);
        mem.read_physical(phys, &mut data[off..off + take]);
        off += take;
    }
    off
}

impl Mmio for SimHba {
    fn read_u32(&self, offset: u64) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        if offset < PORT_BASE {
            return match offset {
                HBA_REG_CAP => inner.cap,
                HBA_REG_GHC => inner.ghc,
                HBA_REG_IS => Self::global_is(&inner),
                HBA_REG_PI => inner.pi,
                HBA_REG_VS => inner.vs,
                HBA_REG_CAP2 => inner.cap2,
                HBA_REG_BOHC => Self::read_bohc(&mut inner),
                _ => 0,
            };
        }
        let idx = ((offset - PORT_BASE) / PORT_STRIDE) as usize;
        let reg = (offset - PORT_BASE) % PORT_STRIDE;
        if idx >= inner.ports.len() {
            return 0;
        }
        let p = &inner.ports[idx];
        match reg {
            PORT_REG_CLB => p.clb as u32,
            PORT_REG_CLBU => (p.clb >> 32) as u32,
            PORT_REG_FB => p.fb as u32,
            PORT_REG_FBU => (p.fb >> 32) as u32,
            PORT_REG_IS => p.is,
            PORT_REG_IE => p.ie,
            PORT_REG_CMD => p.cmd,
            PORT_REG_TFD => p.tfd,
            PORT_REG_SIG => p.sig,
            PORT_REG_SSTS => p.ssts,
            PORT_REG_SCTL => p.sctl,
            PORT_REG_SERR => p.serr,
            PORT_REG_CI => p.ci,
            _ => 0,
        }
    }

    fn write_u32(&self, offset: u64, val: u32) {
        let mut inner = self.inner.lock().unwrap();
        if offset < PORT_BASE {
            match offset {
                HBA_REG_GHC => inner.ghc = val & (GHC_AE | GHC_IE),
                // Global IS is derived from the per-port statuses.
                HBA_REG_IS => {}
                HBA_REG_BOHC => Self::write_bohc(&mut inner, val),
                _ => {}
            }
            return;
        }
        let idx = ((offset - PORT_BASE) / PORT_STRIDE) as usize;
        let reg = (offset - PORT_BASE) % PORT_STRIDE;
        if idx >= inner.ports.len() {
            return;
        }
        match reg {
            PORT_REG_CLB => {
                let p = &mut inner.ports[idx];
                p.clb = (p.clb & 0xFFFF_FFFF_0000_0000) | val as u64;
            }
            PORT_REG_CLBU => {
                let p = &mut inner.ports[idx];
                p.clb = (p.clb & 0xFFFF_FFFF) | (val as u64) << 32;
            }
            PORT_REG_FB => {
                let p = &mut inner.ports[idx];
                p.fb = (p.fb & 0xFFFF_FFFF_0000_0000) | val as u64;
            }
            PORT_REG_FBU => {
                let p = &mut inner.ports[idx];
                p.fb = (p.fb & 0xFFFF_FFFF) | (val as u64) << 32;
            }
            PORT_REG_IS => inner.ports[idx].is &= !val,
            PORT_REG_IE => inner.ports[idx].ie = val,
            PORT_REG_CMD => {
                let p = &mut inner.ports[idx];
                p.cmd = val & (PORT_CMD_ST | PORT_CMD_SUD | PORT_CMD_POD | PORT_CMD_CLO | PORT_CMD_FRE);
                p.refresh_running();
                p.refresh_ssts();
            }
            PORT_REG_SCTL => inner.ports[idx].sctl = val,
            PORT_REG_SERR => inner.ports[idx].serr &= !val,
            PORT_REG_CI => {
                inner.ports[idx].ci |= val;
                if inner.ports[idx].cmd & PORT_CMD_ST != 0 {
                    let mut bits = val;
                    while bits != 0 {
                        let slot = bits.trailing_zeros() as usize;
                        bits &= bits - 1;
                        self.process_slot(&mut inner, idx, slot);
                    }
                }
            }
            _ => {}
        }
    }
}
