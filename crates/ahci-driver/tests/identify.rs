//! Port probe and IDENTIFY enumeration.

mod common;

use ahci_driver::ata::{ATA_CMD_IDENTIFY, SECTOR_SIZE};
use ahci_driver::regs::{PORT_CMD_ST, PORT_CMD_SUD};
use ahci_driver::{AhciError, IoRequest};
use ahci_sim::{SimDrive, SimHbaConfig};
use common::{contiguous_fragments, TestRig};

#[test]
fn probe_reports_no_media_on_empty_port() {
    let rig = TestRig::new(SimHbaConfig::default());
    rig.ctl.reset().unwrap();
    assert_eq!(rig.ctl.probe_port(1), Ok(false));
}

#[test]
fn probe_rejects_unimplemented_and_invalid_ports() {
    let rig = TestRig::new(SimHbaConfig {
        ports: 2,
        ..SimHbaConfig::default()
    });
    rig.ctl.reset().unwrap();
    assert_eq!(rig.ctl.probe_port(5), Ok(false));
    assert_eq!(rig.ctl.probe_port(40), Err(AhciError::NoSuchDevice));
}

#[test]
fn probe_spins_up_staggered_device() {
    let rig = TestRig::new(SimHbaConfig::default());
    rig.hba.set_staggered_spinup(0, true);
    rig.hba.attach_drive(0, SimDrive::new(4096));
    rig.ctl.reset().unwrap();
    assert_eq!(rig.ctl.probe_port(0), Ok(true));
    let state = rig.hba.port_state(0);
    assert_ne!(state.cmd & PORT_CMD_SUD, 0);
    assert_ne!(state.cmd & PORT_CMD_ST, 0);
}

#[test]
fn probe_reports_no_media_on_faulted_task_file() {
    let rig = TestRig::new(SimHbaConfig::default());
    rig.hba.attach_drive(0, SimDrive::new(4096));
    rig.ctl.reset().unwrap();
    rig.hba.force_task_file_error(0);
    assert_eq!(rig.ctl.probe_port(0), Ok(false));
}

#[test]
fn enumerate_reads_lba48_geometry() {
    let rig = TestRig::new(SimHbaConfig::default());
    // 1 GiB drive.
    rig.hba.attach_drive(0, SimDrive::new(2_097_152));
    rig.ctl.reset().unwrap();
    assert!(rig.ctl.probe_port(0).unwrap());
    let sectors = rig.enumerate(0);
    assert_eq!(sectors, 2_097_152);
    assert!(rig.ctl.is_attached(0));
    assert_eq!(rig.ctl.total_sectors(0), 2_097_152);
    assert_eq!(rig.ctl.block_size(0), SECTOR_SIZE);

    let trace = rig.hba.trace();
    assert_eq!(trace.len(), 1);
    assert_eq!(trace[0].command, ATA_CMD_IDENTIFY);
    assert_eq!(trace[0].prdt_entries, 1);
    assert_eq!(trace[0].byte_count, SECTOR_SIZE);
}

#[test]
fn enumerate_reads_lba28_geometry() {
    let rig = TestRig::new(SimHbaConfig::default());
    rig.hba.attach_drive(0, SimDrive::new_lba28(0x10_0000));
    rig.ctl.reset().unwrap();
    assert!(rig.ctl.probe_port(0).unwrap());
    assert_eq!(rig.enumerate(0), 0x10_0000);
}

#[test]
fn enumerate_surfaces_identify_failure() {
    let rig = TestRig::new(SimHbaConfig::default());
    rig.hba.attach_drive(0, SimDrive::new(4096));
    rig.ctl.reset().unwrap();
    assert!(rig.ctl.probe_port(0).unwrap());
    rig.hba.inject_command_errors(0, 1);
    let result = rig.with_pump(|| rig.ctl.enumerate_port(0));
    assert_eq!(result, Err(AhciError::DeviceIoError));
    assert!(!rig.ctl.is_attached(0));

    // The port recovers without a reset.
    assert_eq!(rig.enumerate(0), 4096);
    assert!(rig.ctl.is_attached(0));
}

#[test]
fn zero_capacity_drive_is_rejected_at_enumeration() {
    let rig = TestRig::new(SimHbaConfig::default());
    rig.hba.attach_drive(0, SimDrive::new(0));
    rig.ctl.reset().unwrap();
    assert!(rig.ctl.probe_port(0).unwrap());
    let result = rig.with_pump(|| rig.ctl.enumerate_port(0));
    assert_eq!(result, Err(AhciError::DeviceIoError));
    assert!(!rig.ctl.is_attached(0));
    assert_eq!(rig.ctl.total_sectors(0), 0);

    // The port never attached, so it takes no I/O.
    let (request, handle) = IoRequest::read(0, SECTOR_SIZE, contiguous_fragments(0x4000, SECTOR_SIZE, 1));
    assert_eq!(rig.ctl.enqueue(0, request), Err(AhciError::NoSuchDevice));
    assert_eq!(handle.wait(), (Err(AhciError::NoSuchDevice), 0));
}

#[test]
fn cold_start_discovers_drive_via_rescan() {
    let rig = TestRig::new(SimHbaConfig::default());
    rig.hba.attach_drive(0, SimDrive::new(2_097_152));
    rig.ctl.reset().unwrap();
    let present = rig.with_pump(|| rig.ctl.rescan_ports());
    assert_eq!(present, vec![0]);
    assert_eq!(rig.ctl.total_sectors(0), 2_097_152);

    // A second rescan neither re-enumerates nor loses the drive.
    rig.hba.clear_trace();
    let present = rig.with_pump(|| rig.ctl.rescan_ports());
    assert_eq!(present, vec![0]);
    assert!(rig.hba.trace().iter().all(|t| t.command != ATA_CMD_IDENTIFY));
}
