//! SATA Frame Information Structure construction.
//!
//! Only the host-to-device register FIS is ever built by this driver; it is
//! written into the first 0x40 bytes of a command table.

/// FIS type byte for a host-to-device register FIS.
pub const FIS_TYPE_REGISTER_H2D: u8 = 0x27;
/// Flag bit indicating the FIS carries a new command.
pub const FIS_FLAG_COMMAND: u8 = 0x80;
/// Encoded size of a register FIS.
pub const FIS_REGISTER_SIZE: usize = 20;
/// Register FIS length in dwords, as programmed into the command header.
pub const FIS_REGISTER_DWORDS: u32 = (FIS_REGISTER_SIZE / 4) as u32;

/// Host-to-device register FIS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterFis {
    pub command: u8,
    pub features: u16,
    pub lba: u64,
    pub device: u8,
    pub count: u16,
}

impl RegisterFis {
    pub fn new(command: u8) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    /// Serializes the FIS with the command-update flag set.
    pub fn encode(&self) -> [u8; FIS_REGISTER_SIZE] {
        let mut fis = [0u8; FIS_REGISTER_SIZE];
        fis[0] = FIS_TYPE_REGISTER_H2D;
        fis[1] = FIS_FLAG_COMMAND;
        fis[2] = self.command;
        fis[3] = self.features as u8;
        fis[4] = self.lba as u8;
        fis[5] = (self.lba >> 8) as u8;
        fis[6] = (self.lba >> 16) as u8;
        fis[7] = self.device;
        fis[8] = (self.lba >> 24) as u8;
        fis[9] = (self.lba >> 32) as u8;
        fis[10] = (self.lba >> 40) as u8;
        fis[11] = (self.features >> 8) as u8;
        fis[12] = self.count as u8;
        fis[13] = (self.count >> 8) as u8;
        fis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ata::{ATA_CMD_READ_DMA_EXT, ATA_DEVICE_LBA};

    #[test]
    fn encode_read_dma_ext() {
        let fis = RegisterFis {
            command: ATA_CMD_READ_DMA_EXT,
            features: 0,
            lba: 0x0123_4567_89AB,
            device: ATA_DEVICE_LBA,
            count: 0x0102,
        };
        let bytes = fis.encode();
        assert_eq!(bytes[0], 0x27);
        assert_eq!(bytes[1], 0x80);
        assert_eq!(bytes[2], ATA_CMD_READ_DMA_EXT);
        assert_eq!(&bytes[4..7], &[0xAB, 0x89, 0x67]);
        assert_eq!(bytes[7], 0x40);
        assert_eq!(&bytes[8..11], &[0x45, 0x23, 0x01]);
        assert_eq!(bytes[12], 0x02);
        assert_eq!(bytes[13], 0x01);
        assert_eq!(bytes[16..], [0, 0, 0, 0]);
    }

    #[test]
    fn encode_count_256_as_zero_low_byte() {
        let fis = RegisterFis {
            count: 256,
            ..RegisterFis::new(0xC8)
        };
        let bytes = fis.encode();
        assert_eq!(bytes[12], 0);
        assert_eq!(bytes[13], 1);
    }
}
