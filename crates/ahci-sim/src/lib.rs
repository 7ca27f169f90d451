//! Software AHCI HBA and drive models implementing the `ahci-driver` host
//! traits, for driving the full driver core without hardware.

mod drive;
mod hba;
mod mem;

pub use drive::SimDrive;
pub use hba::{BiosBehavior, CommandTrace, SimHba, SimHbaConfig, SimPortState};
pub use mem::SimMemory;
