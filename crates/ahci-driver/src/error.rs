use thiserror::Error;

/// Errors surfaced by the driver core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AhciError {
    /// The port has no attached device, or the device departed while the
    /// request was outstanding.
    #[error("no such device")]
    NoSuchDevice,
    /// A DMA allocation or a command-slot reservation on a control path
    /// failed.
    #[error("insufficient resources")]
    InsufficientResources,
    /// The device reported a task-file error for a submitted command.
    #[error("device I/O error")]
    DeviceIoError,
    /// A hardware handshake (BIOS handoff, port stop, PHY detect) did not
    /// complete in time.
    #[error("operation timed out")]
    Timeout,
    /// The host environment handed the driver an unusable configuration.
    #[error("invalid configuration")]
    InvalidConfiguration,
}
