//! AHCI 1.x register offsets, bit definitions, and DMA descriptor layout.
//!
//! Offsets are byte offsets from the HBA's ABAR (memory register base). Bit
//! positions are plain `u32` constants; software-only state uses `bitflags`
//! elsewhere.

// Global HBA registers.
pub const HBA_REG_CAP: u64 = 0x00;
pub const HBA_REG_GHC: u64 = 0x04;
pub const HBA_REG_IS: u64 = 0x08;
pub const HBA_REG_PI: u64 = 0x0C;
pub const HBA_REG_VS: u64 = 0x10;
pub const HBA_REG_CAP2: u64 = 0x24;
pub const HBA_REG_BOHC: u64 = 0x28;

pub const PORT_BASE: u64 = 0x100;
pub const PORT_STRIDE: u64 = 0x80;

// Per-port registers, relative to the port's register file.
pub const PORT_REG_CLB: u64 = 0x00;
pub const PORT_REG_CLBU: u64 = 0x04;
pub const PORT_REG_FB: u64 = 0x08;
pub const PORT_REG_FBU: u64 = 0x0C;
pub const PORT_REG_IS: u64 = 0x10;
pub const PORT_REG_IE: u64 = 0x14;
pub const PORT_REG_CMD: u64 = 0x18;
pub const PORT_REG_TFD: u64 = 0x20;
pub const PORT_REG_SIG: u64 = 0x24;
pub const PORT_REG_SSTS: u64 = 0x28;
pub const PORT_REG_SCTL: u64 = 0x2C;
pub const PORT_REG_SERR: u64 = 0x30;
pub const PORT_REG_SACT: u64 = 0x34;
pub const PORT_REG_CI: u64 = 0x38;

/// Byte offset of port `n`'s register file from ABAR.
pub fn port_reg_base(port: usize) -> u64 {
    PORT_BASE + PORT_STRIDE * port as u64
}

// GHC bits.
pub const GHC_HR: u32 = 1 << 0;
pub const GHC_IE: u32 = 1 << 1;
pub const GHC_AE: u32 = 1 << 31;

// CAP bits.
pub const CAP_NP_MASK: u32 = 0xF;
pub const CAP_NCS_SHIFT: u32 = 8;
pub const CAP_NCS_MASK: u32 = 0x1F << CAP_NCS_SHIFT;
pub const CAP_SSNTF: u32 = 1 << 29;
pub const CAP_SNCQ: u32 = 1 << 30;
pub const CAP_S64A: u32 = 1 << 31;

// CAP2 bits.
pub const CAP2_BOH: u32 = 1 << 0;

// BOHC bits.
pub const BOHC_BOS: u32 = 1 << 0;
pub const BOHC_OOS: u32 = 1 << 1;
pub const BOHC_SOOE: u32 = 1 << 2;
pub const BOHC_OOC: u32 = 1 << 3;
pub const BOHC_BB: u32 = 1 << 4;

// PxCMD bits.
pub const PORT_CMD_ST: u32 = 1 << 0;
pub const PORT_CMD_SUD: u32 = 1 << 1;
pub const PORT_CMD_POD: u32 = 1 << 2;
pub const PORT_CMD_CLO: u32 = 1 << 3;
pub const PORT_CMD_FRE: u32 = 1 << 4;
pub const PORT_CMD_FR: u32 = 1 << 14;
pub const PORT_CMD_CR: u32 = 1 << 15;

// PxTFD bits (low byte mirrors the ATA status register).
pub const PORT_TFD_ERR: u32 = 1 << 0;
pub const PORT_TFD_DRQ: u32 = 1 << 3;
pub const PORT_TFD_BSY: u32 = 1 << 7;
/// Any of these in PxTFD means the task file is in an error or busy state.
pub const PORT_TFD_ERR_MASK: u32 = PORT_TFD_ERR | PORT_TFD_DRQ | PORT_TFD_BSY;

// PxSSTS / PxSCTL detection field.
pub const PORT_SSTS_DET_MASK: u32 = 0xF;
/// Device present and PHY communication established.
pub const PORT_SSTS_DET_PHY: u32 = 0x3;
pub const PORT_SCTL_DET_MASK: u32 = 0xF;

// PxIS / PxIE bits.
pub const PORT_IS_DHRS: u32 = 1 << 0;
pub const PORT_IS_PSS: u32 = 1 << 1;
pub const PORT_IS_DSS: u32 = 1 << 2;
pub const PORT_IS_SDBS: u32 = 1 << 3;
pub const PORT_IS_UFS: u32 = 1 << 4;
pub const PORT_IS_DPS: u32 = 1 << 5;
pub const PORT_IS_PCS: u32 = 1 << 6;
pub const PORT_IS_DMPS: u32 = 1 << 7;
pub const PORT_IS_PRCS: u32 = 1 << 22;
pub const PORT_IS_IPMS: u32 = 1 << 23;
pub const PORT_IS_OFS: u32 = 1 << 24;
pub const PORT_IS_INFS: u32 = 1 << 26;
pub const PORT_IS_IFS: u32 = 1 << 27;
pub const PORT_IS_HBDS: u32 = 1 << 28;
pub const PORT_IS_HBFS: u32 = 1 << 29;
pub const PORT_IS_TFES: u32 = 1 << 30;
pub const PORT_IS_CPDS: u32 = 1 << 31;

/// Interrupt sources enabled on every started port.
pub const PORT_INT_DEFAULT_ENABLE: u32 = PORT_IS_DHRS
    | PORT_IS_PSS
    | PORT_IS_DSS
    | PORT_IS_SDBS
    | PORT_IS_UFS
    | PORT_IS_DPS
    | PORT_IS_PCS
    | PORT_IS_DMPS
    | PORT_IS_PRCS
    | PORT_IS_IPMS
    | PORT_IS_OFS
    | PORT_IS_INFS
    | PORT_IS_IFS
    | PORT_IS_HBDS
    | PORT_IS_HBFS
    | PORT_IS_TFES;

/// Events that indicate a device arrived or departed.
pub const PORT_INT_CONNECTION_MASK: u32 =
    PORT_IS_PCS | PORT_IS_DMPS | PORT_IS_PRCS | PORT_IS_CPDS;

/// Events that indicate a port-level error.
pub const PORT_INT_ERROR_MASK: u32 = PORT_IS_IPMS
    | PORT_IS_OFS
    | PORT_IS_INFS
    | PORT_IS_IFS
    | PORT_IS_HBDS
    | PORT_IS_HBFS
    | PORT_IS_TFES;

// Command list / command table geometry.

/// Hardware maximum number of command slots per port.
pub const MAX_COMMAND_SLOTS: usize = 32;
/// Size of one command header in the command list.
pub const COMMAND_HEADER_SIZE: usize = 32;
/// PRDT entries per command table.
pub const PRDT_ENTRY_COUNT: usize = 120;
/// Size of one PRDT entry.
pub const PRDT_ENTRY_SIZE: usize = 16;
/// Maximum byte count one PRDT entry can describe.
pub const PRDT_MAX_ENTRY_BYTES: u32 = 0x40_0000;
/// 0x40 CFIS + 0x10 ATAPI + 0x30 reserved, then the PRDT.
pub const COMMAND_TABLE_PRDT_OFFSET: usize = 0x80;
/// Total size of one command table (PRDT included).
pub const COMMAND_TABLE_SIZE: usize =
    COMMAND_TABLE_PRDT_OFFSET + PRDT_ENTRY_COUNT * PRDT_ENTRY_SIZE;
/// Required alignment of each command table.
pub const COMMAND_TABLE_ALIGN: usize = 128;
/// Required alignment of the command list base (PxCLB).
pub const COMMAND_LIST_ALIGN: usize = 1024;
/// Size and alignment of the received-FIS area (PxFB).
pub const RECEIVED_FIS_SIZE: usize = 0x1000;

// Command header dword 0 fields.
pub const CMD_HDR_CFL_MASK: u32 = 0x1F;
pub const CMD_HDR_WRITE: u32 = 1 << 6;
pub const CMD_HDR_PRDTL_SHIFT: u32 = 16;

// Command header field offsets within the 32-byte header.
pub const CMD_HDR_OFF_CONTROL: u64 = 0x00;
pub const CMD_HDR_OFF_PRDBC: u64 = 0x04;
pub const CMD_HDR_OFF_CTBA: u64 = 0x08;
pub const CMD_HDR_OFF_CTBAU: u64 = 0x0C;

// PRDT entry field offsets.
pub const PRDT_OFF_DBA: u64 = 0x00;
pub const PRDT_OFF_DBAU: u64 = 0x04;
pub const PRDT_OFF_DBC: u64 = 0x0C;
pub const PRDT_DBC_MASK: u32 = 0x003F_FFFF;
