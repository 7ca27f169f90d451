//! Multi-chunk transfers: command-size and PRDT-capacity splitting.

mod common;

use ahci_driver::ata::{ATA_CMD_READ_DMA_EXT, ATA_CMD_WRITE_DMA_EXT, SECTOR_SIZE};
use ahci_driver::{IoFlags, IoRequest};
use common::{collect, contiguous_fragments, pattern, stage, TestRig};

const MIB: usize = 1024 * 1024;

#[test]
fn large_write_splits_at_command_sector_limit() {
    let rig = TestRig::with_drive(1 << 20);
    // 64 MiB in sixteen 4 MiB fragments. One LBA48 command moves at most
    // 65536 sectors (32 MiB), so this takes exactly two commands.
    let len = 64 * MIB;
    let data = pattern(10, len);
    let fragments = contiguous_fragments(0x100_0000, 4 * MIB, 16);
    stage(&rig.mem, &fragments, &data);

    let (request, handle) = IoRequest::write(0, len, fragments, IoFlags::empty());
    rig.ctl.enqueue(0, request).unwrap();
    rig.pump();
    assert_eq!(handle.wait(), (Ok(()), len));

    let trace = rig.hba.trace();
    assert_eq!(trace.len(), 2);
    for cmd in &trace {
        assert_eq!(cmd.command, ATA_CMD_WRITE_DMA_EXT);
        assert_eq!(cmd.sectors, 65536);
        assert_eq!(cmd.prdt_entries, 8);
        assert_eq!(cmd.byte_count, 32 * MIB);
    }
    assert_eq!(trace[0].lba, 0);
    assert_eq!(trace[1].lba, 65536);
    // Both chunks ran on the same command slot.
    assert_eq!(trace[0].slot, trace[1].slot);

    for lba in [0u64, 1, 65535, 65536, 131071] {
        let off = lba as usize * SECTOR_SIZE;
        assert_eq!(
            &rig.hba.read_drive_sector(0, lba)[..],
            &data[off..off + SECTOR_SIZE],
            "sector {lba} mismatch"
        );
    }
}

#[test]
fn heavily_fragmented_read_splits_at_prdt_capacity() {
    let rig = TestRig::with_drive(1 << 20);
    // 360 page-sized fragments against a 120-entry PRDT: three chunks of
    // 120 entries each, 960 sectors per chunk.
    let len = 360 * 4096;
    let data = pattern(11, len);
    for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
        let mut sector = [0u8; SECTOR_SIZE];
        sector.copy_from_slice(chunk);
        rig.hba.write_drive_sector(0, i as u64, &sector);
    }

    let fragments = contiguous_fragments(0x80_0000, 4096, 360);
    let (request, handle) = IoRequest::read(0, len, fragments.clone());
    rig.ctl.enqueue(0, request).unwrap();
    rig.pump();
    assert_eq!(handle.wait(), (Ok(()), len));

    let trace = rig.hba.trace();
    assert_eq!(trace.len(), 3);
    for (i, cmd) in trace.iter().enumerate() {
        assert_eq!(cmd.command, ATA_CMD_READ_DMA_EXT);
        assert_eq!(cmd.lba, i as u64 * 960);
        assert_eq!(cmd.sectors, 960);
        assert_eq!(cmd.prdt_entries, 120);
        assert_eq!(cmd.slot, trace[0].slot);
    }
    assert_eq!(collect(&rig.mem, &fragments, len), data);
}
