//! Error types for the account coordinator.

use std::io;

use coentro_ipc::IpcError;
use thiserror::Error;

/// Result type for account coordinator operations.
pub type AccountResult<T> = Result<T, AccountError>;

/// Error types that can occur around the account coordinator.
///
/// Backend outcomes are never reported through this type; they travel as
/// event payloads.
#[derive(Debug, Error)]
pub enum AccountError {
    /// The daemon handle was already resolved
    #[error("Daemon handle already resolved")]
    AlreadyResolved,

    /// Failed to set up process signal handling
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// IPC transport failure
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}
