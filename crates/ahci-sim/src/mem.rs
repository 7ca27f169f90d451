//! Sparse physical memory shared between the driver and the HBA model.

use std::collections::BTreeMap;
use std::sync::Mutex;

use ahci_driver::{DmaAllocator, DmaMemory, DmaRegion};

const PAGE_SIZE: usize = 4096;
const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// DMA allocations are handed out from this base upward.
const ALLOC_BASE: u64 = 0x10_0000;

/// Page-sparse physical memory.
///
/// Pages materialize on first write, so buffers can live at arbitrary
/// physical addresses (including above 4 GiB) without backing the whole
/// address space. Also acts as a bump [`DmaAllocator`]; `free` is a no-op.
pub struct SimMemory {
    pages: Mutex<BTreeMap<u64, Box<[u8; PAGE_SIZE]>>>,
    next_alloc: Mutex<u64>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            next_alloc: Mutex::new(ALLOC_BASE),
        }
    }
}

impl Default for SimMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaMemory for SimMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) {
        let pages = self.pages.lock().unwrap();
        let mut addr = paddr;
        let mut done = 0;
        while done < buf.len() {
            let page = addr & !PAGE_MASK;
            let offset = (addr & PAGE_MASK) as usize;
            let take = (PAGE_SIZE - offset).min(buf.len() - done);
            match pages.get(&page) {
                Some(data) => buf[done..done + take].copy_from_slice(&data[offset..offset + take]),
                None => buf[done..done + take].fill(0),
            }
            addr += take as u64;
            done += take;
        }
    }

    fn write_physical(&self, paddr: u64, buf: &[u8]) {
        let mut pages = self.pages.lock().unwrap();
        let mut addr = paddr;
        let mut done = 0;
        while done < buf.len() {
            let page = addr & !PAGE_MASK;
            let offset = (addr & PAGE_MASK) as usize;
            let take = (PAGE_SIZE - offset).min(buf.len() - done);
            let data = pages
                .entry(page)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            data[offset..offset + take].copy_from_slice(&buf[done..done + take]);
            addr += take as u64;
            done += take;
        }
    }
}

impl DmaAllocator for SimMemory {
    fn alloc(&self, len: usize, align: usize, max_phys: u64) -> Option<DmaRegion> {
        assert!(align.is_power_of_two());
        let mut next = self.next_alloc.lock().unwrap();
        let base = (*next + align as u64 - 1) & !(align as u64 - 1);
        let end = base.checked_add(len as u64)?;
        if end - 1 > max_phys {
            return None;
        }
        *next = end;
        Some(DmaRegion { phys: base, len })
    }

    fn free(&self, _region: DmaRegion) {}
}
