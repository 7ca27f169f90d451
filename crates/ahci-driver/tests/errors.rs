//! Device error reporting and recovery without a port reset.

mod common;

use ahci_driver::ata::SECTOR_SIZE;
use ahci_driver::regs::PORT_CMD_ST;
use ahci_driver::{AhciError, IoFlags, IoRequest};
use ahci_sim::{SimDrive, SimHbaConfig};
use common::{contiguous_fragments, pattern, stage, TestRig};

fn one_sector_write(rig: &TestRig, lba: u64, seed: u64) -> ahci_driver::CompletionHandle {
    let fragments = contiguous_fragments(0x10_0000 + lba * 0x1000, SECTOR_SIZE, 1);
    stage(&rig.mem, &fragments, &pattern(seed, SECTOR_SIZE));
    let (request, handle) = IoRequest::write(
        lba * SECTOR_SIZE as u64,
        SECTOR_SIZE,
        fragments,
        IoFlags::empty(),
    );
    rig.ctl.enqueue(0, request).unwrap();
    handle
}

#[test]
fn failed_command_completes_with_io_error() {
    let rig = TestRig::with_drive(1 << 20);
    rig.hba.inject_command_errors(0, 1);

    let handle = one_sector_write(&rig, 0, 1);
    rig.pump();
    assert_eq!(handle.wait(), (Err(AhciError::DeviceIoError), 0));
    assert!(rig.hba.trace()[0].failed);

    // The port keeps running; the next command goes through unharmed.
    assert_ne!(rig.hba.port_state(0).cmd & PORT_CMD_ST, 0);
    let handle = one_sector_write(&rig, 1, 2);
    rig.pump();
    assert_eq!(handle.wait(), (Ok(()), SECTOR_SIZE));
    assert!(!rig.hba.trace()[1].failed);
}

#[test]
fn queued_request_still_dispatches_after_a_failure() {
    let rig = TestRig::new(SimHbaConfig {
        ncq: false,
        ..SimHbaConfig::default()
    });
    rig.hba.attach_drive(0, SimDrive::new(1 << 20));
    rig.ctl.reset().unwrap();
    assert!(rig.ctl.probe_port(0).unwrap());
    rig.enumerate(0);
    rig.hba.clear_trace();
    rig.hba.inject_command_errors(0, 1);

    // Slot 0 takes the first write; the second waits in the queue.
    let first = one_sector_write(&rig, 0, 3);
    let second = one_sector_write(&rig, 1, 4);
    rig.pump();
    assert_eq!(first.wait().0, Err(AhciError::DeviceIoError));
    assert_eq!(second.wait(), (Ok(()), SECTOR_SIZE));

    let trace = rig.hba.trace();
    assert_eq!(trace.len(), 2);
    assert!(trace[0].failed);
    assert!(!trace[1].failed);
}

#[test]
fn mid_transfer_failure_reports_partial_progress() {
    let rig = TestRig::with_drive(1 << 20);
    // Two chunks of 960 sectors each; the second one fails.
    let len = 240 * 4096;
    let fragments = contiguous_fragments(0x80_0000, 4096, 240);
    stage(&rig.mem, &fragments, &pattern(5, len));

    let (request, handle) = IoRequest::write(0, len, fragments, IoFlags::empty());
    rig.ctl.enqueue(0, request).unwrap();
    // The first chunk is already on the wire; poison the follow-up.
    rig.hba.inject_command_errors(0, 1);
    rig.pump();
    let (status, bytes) = handle.wait();
    assert_eq!(status, Err(AhciError::DeviceIoError));
    assert_eq!(bytes, 120 * 4096);
}
