//! CoentroVPN account IPC protocol library
//!
//! This crate defines the messages and transport used between the account
//! service (which owns the account session coordinator) and its clients,
//! such as the GUI frontends and `coentroctl`.

pub mod messages;
pub mod transport;

/// Re-export common types for convenience
pub use messages::{
    AccountCreationResult, AccountExpiry, AccountHistory, Event, LoginResult, Request,
};
pub use transport::{
    AccountClient, EventWriter, IpcConnection, IpcError, IpcListener, IpcResult, IpcTransport,
    RequestReader, TransportOptions,
};
