//! Access to the VPN daemon that owns the real account state.
//!
//! The daemon may not be reachable when the coordinator starts. The enclosing
//! service creates a [`DaemonHandle`] up front and resolves it once the daemon
//! connection is established; every account operation waits on the handle.

use std::sync::Arc;

use async_trait::async_trait;
use coentro_ipc::LoginResult;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{AccountError, AccountResult};

/// Account data returned by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountData {
    /// Expiry in `YYYY-MM-DD HH:MM:SS <zone>` form
    pub expiry: String,
}

/// Outcome of an account data lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetAccountDataResult {
    Ok(AccountData),
    InvalidAccount,
    RpcError,
    OtherError,
}

/// The account surface of the daemon consumed by the coordinator.
///
/// Implementations turn transport failures into the domain variants of each
/// result instead of returning errors.
#[async_trait]
pub trait AccountDaemon: Send + Sync + 'static {
    /// Create a new account, returning its number.
    async fn create_new_account(&self) -> Option<String>;

    /// Log in with `account`.
    async fn login_account(&self, account: &str) -> LoginResult;

    /// Log out of the current account.
    async fn logout_account(&self);

    /// Look up data for `account`.
    async fn get_account_data(&self, account: &str) -> GetAccountDataResult;

    /// Most recently used account number.
    async fn get_account_history(&self) -> Option<String>;

    /// Forget the most recently used account number.
    async fn clear_account_history(&self);

    /// Current account number, updated whenever the daemon's device state changes.
    fn account_number_updates(&self) -> watch::Receiver<Option<String>>;
}

/// Lazily resolved, shareable reference to the daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    slot: Arc<watch::Sender<Option<Arc<dyn AccountDaemon>>>>,
}

impl DaemonHandle {
    /// Create an unresolved handle.
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Create a handle that is already resolved.
    pub fn resolved(daemon: Arc<dyn AccountDaemon>) -> Self {
        let (slot, _) = watch::channel(Some(daemon));
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Resolve the handle. The first resolution is final.
    pub fn resolve(&self, daemon: Arc<dyn AccountDaemon>) -> AccountResult<()> {
        let resolved = self.slot.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(daemon);
                true
            } else {
                false
            }
        });

        if resolved {
            info!("Daemon handle resolved");
            Ok(())
        } else {
            Err(AccountError::AlreadyResolved)
        }
    }

    pub fn is_ready(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Wait until the daemon is available. Never times out.
    pub async fn ready(&self) -> Arc<dyn AccountDaemon> {
        let mut slot = self.slot.subscribe();
        loop {
            let current = slot.borrow_and_update().clone();
            if let Some(daemon) = current {
                return daemon;
            }

            debug!("Waiting for daemon to become available");
            if slot.changed().await.is_err() {
                // The sender lives as long as `self`, so this cannot happen
                // while we are borrowed.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for DaemonHandle {
    fn default() -> Self {
        Self::new()
    }
}
