//! IPC Message Definitions
//!
//! This module defines the requests a client sends to the account service
//! and the events the service pushes back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request sent from a client to the account service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Create a new account and log in with it
    CreateAccount,

    /// Log in with an existing account number
    Login(String),

    /// Log out of the current account
    Logout,

    /// Refresh the expiry of the current account
    FetchAccountExpiry,

    /// Refresh the most recently used account number
    FetchAccountHistory,

    /// Forget the most recently used account number
    ClearAccountHistory,
}

/// Event pushed from the account service to its clients
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Outcome of a `CreateAccount` request
    AccountCreation(AccountCreationResult),

    /// Outcome of a `Login` request, as reported by the daemon
    Login(LoginResult),

    /// Current account expiry
    AccountExpiry(AccountExpiry),

    /// Current account history
    AccountHistory(AccountHistory),
}

/// Result of an account creation attempt
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum AccountCreationResult {
    /// The daemon created the account with this number
    Success(String),
    /// The daemon did not produce an account number
    Failure,
}

/// Result of a login attempt, as defined by the daemon
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResult {
    Ok,
    InvalidAccount,
    MaxDevicesReached,
    RpcError,
    OtherError,
}

impl LoginResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, LoginResult::Ok)
    }
}

/// Expiry of the current account
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub enum AccountExpiry {
    Available(DateTime<Utc>),
    #[default]
    NotAvailable,
}

impl AccountExpiry {
    pub fn date(&self) -> Option<DateTime<Utc>> {
        match self {
            AccountExpiry::Available(expiry) => Some(*expiry),
            AccountExpiry::NotAvailable => None,
        }
    }
}

/// Most recently used account number, if any
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub enum AccountHistory {
    WithHistory(String),
    #[default]
    WithoutHistory,
}

impl From<Option<String>> for AccountHistory {
    fn from(account: Option<String>) -> Self {
        match account {
            Some(account) => AccountHistory::WithHistory(account),
            None => AccountHistory::WithoutHistory,
        }
    }
}
