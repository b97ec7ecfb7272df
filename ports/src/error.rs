//! Error taxonomy for the port runtime.
//!
//! These kinds are independent of any particular kernel's numeric error
//! codes; a [`Kernel`](crate::kernel::Kernel) implementation maps its own
//! failures onto [`ExternalIpc`](Error::ExternalIpc).

use thiserror::Error;

/// Errors produced by the port runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Target port is dead, of the wrong class/bucket, or the operation does
    /// not apply to it.
    #[error("operation not supported on this port")]
    NotSupported,

    /// A handle (protid-equivalent) refers to nothing, or to an object of
    /// the wrong class.
    #[error("bad handle")]
    BadHandle,

    /// A blocking wait was cancelled.
    #[error("interrupted")]
    Interrupted,

    /// Inhibition was requested while already inhibited, or an
    /// exclusive-use resource was already taken.
    #[error("busy")]
    Busy,

    /// Allocation of a port, notification record, or index entry failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Lookup by name failed.
    #[error("bad port name")]
    BadName,

    /// A kernel-side operation (notification arm, right modification,
    /// receive-right status) failed.
    #[error("external IPC failure: {0}")]
    ExternalIpc(String),
}

pub type Result<T> = core::result::Result<T, Error>;
