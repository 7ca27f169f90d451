//! Write-through semantics and data durability across a driver restart.

mod common;

use ahci_driver::ata::{ATA_CMD_FLUSH_CACHE, ATA_CMD_WRITE_DMA, SECTOR_SIZE};
use ahci_driver::{IoFlags, IoRequest};
use common::{collect, contiguous_fragments, pattern, stage, TestRig};

#[test]
fn synchronized_write_chases_data_with_a_flush() {
    let rig = TestRig::with_drive(1 << 20);
    let len = 8192;
    let data = pattern(20, len);
    let fragments = contiguous_fragments(0x20_0000, len, 1);
    stage(&rig.mem, &fragments, &data);

    let (request, handle) = IoRequest::write(0x1000, len, fragments, IoFlags::WRITE_SYNCHRONIZED);
    rig.ctl.enqueue(0, request).unwrap();
    rig.pump();
    assert_eq!(handle.wait(), (Ok(()), len));

    let trace = rig.hba.trace();
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].command, ATA_CMD_WRITE_DMA);
    assert_eq!(trace[0].lba, 8);
    assert_eq!(trace[0].sectors, 16);
    assert_eq!(trace[1].command, ATA_CMD_FLUSH_CACHE);
    // The flush rides the slot the data command just vacated.
    assert_eq!(trace[0].slot, trace[1].slot);
    assert_eq!(rig.hba.flush_count(0), 1);
}

#[test]
fn plain_write_does_not_flush() {
    let rig = TestRig::with_drive(1 << 20);
    let fragments = contiguous_fragments(0x20_0000, SECTOR_SIZE, 1);
    stage(&rig.mem, &fragments, &pattern(21, SECTOR_SIZE));
    let (request, handle) = IoRequest::write(0, SECTOR_SIZE, fragments, IoFlags::empty());
    rig.ctl.enqueue(0, request).unwrap();
    rig.pump();
    assert_eq!(handle.wait(), (Ok(()), SECTOR_SIZE));
    assert_eq!(rig.hba.trace().len(), 1);
    assert_eq!(rig.hba.flush_count(0), 0);
}

#[test]
fn data_survives_a_driver_restart() {
    let mut rig = TestRig::with_drive(1 << 20);
    let len = 4 * SECTOR_SIZE;
    let data = pattern(22, len);
    let fragments = contiguous_fragments(0x20_0000, len, 1);
    stage(&rig.mem, &fragments, &data);
    let (request, handle) = IoRequest::write(0x8000, len, fragments, IoFlags::WRITE_SYNCHRONIZED);
    rig.ctl.enqueue(0, request).unwrap();
    rig.pump();
    assert_eq!(handle.wait(), (Ok(()), len));

    // A fresh driver instance brings the same hardware back up.
    rig.restart_controller();
    rig.ctl.reset().unwrap();
    assert!(rig.ctl.probe_port(0).unwrap());
    rig.enumerate(0);

    let fragments = contiguous_fragments(0x40_0000, len, 1);
    let (request, handle) = IoRequest::read(0x8000, len, fragments.clone());
    rig.ctl.enqueue(0, request).unwrap();
    rig.pump();
    assert_eq!(handle.wait(), (Ok(()), len));
    assert_eq!(collect(&rig.mem, &fragments, len), data);
}
