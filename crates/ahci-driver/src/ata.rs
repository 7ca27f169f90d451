//! ATA command opcodes, addressing limits, and IDENTIFY DEVICE parsing.

pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_SHIFT: u32 = 9;

pub const ATA_CMD_READ_DMA: u8 = 0xC8;
pub const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
pub const ATA_CMD_WRITE_DMA: u8 = 0xCA;
pub const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
pub const ATA_CMD_FLUSH_CACHE: u8 = 0xE7;
pub const ATA_CMD_IDENTIFY: u8 = 0xEC;

/// Device register bit selecting LBA addressing.
pub const ATA_DEVICE_LBA: u8 = 0x40;

/// Highest LBA reachable with 28-bit addressing.
pub const LBA28_MAX: u64 = (1 << 28) - 1;
/// Sector-count ceiling for one 28-bit command (encoded as 0 on the wire).
pub const LBA28_MAX_SECTORS: u64 = 256;
/// Sector-count ceiling for one 48-bit command (encoded as 0 on the wire).
pub const LBA48_MAX_SECTORS: u64 = 65536;

const IDENTIFY_WORD_CAPABILITIES_83: usize = 83;
const IDENTIFY_WORD_LBA28_SECTORS: usize = 60;
const IDENTIFY_WORD_LBA48_SECTORS: usize = 100;
const IDENTIFY_83_LBA48: u16 = 1 << 10;

/// Geometry reported by IDENTIFY DEVICE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyGeometry {
    pub lba48: bool,
    pub total_sectors: u64,
}

fn identify_word(data: &[u8; SECTOR_SIZE], word: usize) -> u16 {
    u16::from_le_bytes([data[word * 2], data[word * 2 + 1]])
}

/// Parses the addressing mode and capacity out of a raw IDENTIFY sector.
///
/// LBA48 support is word 83 bit 10; the sector count comes from words 100-103
/// when LBA48 is in use and words 60-61 otherwise.
pub fn parse_identify(data: &[u8; SECTOR_SIZE]) -> IdentifyGeometry {
    let lba48 = identify_word(data, IDENTIFY_WORD_CAPABILITIES_83) & IDENTIFY_83_LBA48 != 0;
    let total_sectors = if lba48 {
        (0..4).fold(0u64, |acc, i| {
            acc | (identify_word(data, IDENTIFY_WORD_LBA48_SECTORS + i) as u64) << (16 * i)
        })
    } else {
        identify_word(data, IDENTIFY_WORD_LBA28_SECTORS) as u64
            | (identify_word(data, IDENTIFY_WORD_LBA28_SECTORS + 1) as u64) << 16
    };
    IdentifyGeometry {
        lba48,
        total_sectors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_word(data: &mut [u8; SECTOR_SIZE], word: usize, val: u16) {
        data[word * 2..word * 2 + 2].copy_from_slice(&val.to_le_bytes());
    }

    #[test]
    fn parse_identify_lba48() {
        let mut data = [0u8; SECTOR_SIZE];
        put_word(&mut data, 83, 1 << 10);
        // 2_097_152 sectors (1 GiB).
        put_word(&mut data, 100, 0x0000);
        put_word(&mut data, 101, 0x0020);
        // Stale LBA28 words must be ignored.
        put_word(&mut data, 60, 0xFFFF);
        put_word(&mut data, 61, 0x0FFF);
        let geom = parse_identify(&data);
        assert!(geom.lba48);
        assert_eq!(geom.total_sectors, 2_097_152);
    }

    #[test]
    fn parse_identify_lba28_only() {
        let mut data = [0u8; SECTOR_SIZE];
        put_word(&mut data, 60, 0x5678);
        put_word(&mut data, 61, 0x0012);
        let geom = parse_identify(&data);
        assert!(!geom.lba48);
        assert_eq!(geom.total_sectors, 0x0012_5678);
    }
}
