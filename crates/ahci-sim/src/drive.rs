//! In-memory ATA drive model.

use std::collections::HashMap;

use ahci_driver::ata::SECTOR_SIZE;

/// A sparse sector store with IDENTIFY synthesis and a flush counter.
///
/// Capacity is independent of storage: unwritten sectors read as zeros, so
/// multi-gigabyte geometries cost nothing.
pub struct SimDrive {
    total_sectors: u64,
    lba48: bool,
    sectors: HashMap<u64, Box<[u8; SECTOR_SIZE]>>,
    flushes: u32,
}

impl SimDrive {
    /// An LBA48-capable drive.
    pub fn new(total_sectors: u64) -> Self {
        Self {
            total_sectors,
            lba48: true,
            sectors: HashMap::new(),
            flushes: 0,
        }
    }

    /// A drive that only speaks 28-bit addressing.
    pub fn new_lba28(total_sectors: u64) -> Self {
        assert!(total_sectors <= 1 << 28);
        Self {
            total_sectors,
            lba48: false,
            sectors: HashMap::new(),
            flushes: 0,
        }
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn in_range(&self, lba: u64, count: u64) -> bool {
        lba.checked_add(count)
            .map(|end| end <= self.total_sectors)
            .unwrap_or(false)
    }

    pub fn read_sector(&self, lba: u64) -> [u8; SECTOR_SIZE] {
        match self.sectors.get(&lba) {
            Some(data) => **data,
            None => [0u8; SECTOR_SIZE],
        }
    }

    pub fn write_sector(&mut self, lba: u64, data: &[u8; SECTOR_SIZE]) {
        self.sectors.insert(lba, Box::new(*data));
    }

    pub fn flush(&mut self) {
        self.flushes += 1;
    }

    pub fn flush_count(&self) -> u32 {
        self.flushes
    }

    /// Synthesizes the IDENTIFY DEVICE response sector.
    pub fn identify(&self) -> [u8; SECTOR_SIZE] {
        let mut data = [0u8; SECTOR_SIZE];
        let mut put_word = |word: usize, val: u16| {
            data[word * 2..word * 2 + 2].copy_from_slice(&val.to_le_bytes());
        };
        let lba28_sectors = self.total_sectors.min(0x0FFF_FFFF) as u32;
        put_word(60, lba28_sectors as u16);
        put_word(61, (lba28_sectors >> 16) as u16);
        if self.lba48 {
            put_word(83, 1 << 10);
            for i in 0..4 {
                put_word(100 + i, (self.total_sectors >> (16 * i)) as u16);
            }
        }
        data
    }
}
