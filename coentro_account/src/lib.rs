//! CoentroVPN account session coordinator
//!
//! This crate keeps the client's view of the daemon's account session. It
//! serializes account mutations through a command actor, runs refreshes as
//! cancellable background jobs and publishes the resulting state to local
//! listeners and connected IPC peers.

pub mod cache;
pub mod daemon;
pub mod error;
pub mod expiry;
pub mod jobs;
pub mod notifier;
pub mod service;
pub mod sink;

pub use cache::{AccountCache, Command};
pub use daemon::{AccountData, AccountDaemon, DaemonHandle, GetAccountDataResult};
pub use error::{AccountError, AccountResult};
pub use expiry::{parse_expiry, ExpiryParseError};
pub use jobs::JobTracker;
pub use notifier::{EventNotifier, WriteOutcome, WriteTicket};
pub use service::{transport_options, AccountService};
pub use sink::{EventSink, PeerEvents, PeerId};
