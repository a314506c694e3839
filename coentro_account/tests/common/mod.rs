#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coentro_account::{AccountCache, AccountData, AccountDaemon, DaemonHandle, GetAccountDataResult};
use coentro_ipc::{Event, LoginResult};
use shared_utils::AccountConfig;
use tokio::sync::{mpsc, oneshot, watch};

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(150);

/// Scripted daemon recording every call it receives.
pub struct FakeDaemon {
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
    new_account: Mutex<Option<String>>,
    valid_accounts: Mutex<Vec<String>>,
    history: Mutex<Option<String>>,
    account_data: Mutex<HashMap<String, GetAccountDataResult>>,
    history_hold: Mutex<Option<oneshot::Receiver<()>>>,
    account: watch::Sender<Option<String>>,
}

struct InFlight<'a>(&'a FakeDaemon);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeDaemon {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    /// Every call takes at least `delay`, widening overlap windows.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let (account, _) = watch::channel(None);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay,
            new_account: Mutex::new(None),
            valid_accounts: Mutex::new(Vec::new()),
            history: Mutex::new(None),
            account_data: Mutex::new(HashMap::new()),
            history_hold: Mutex::new(None),
            account,
        })
    }

    pub fn set_new_account(&self, account: Option<&str>) {
        *self.new_account.lock().unwrap() = account.map(str::to_string);
    }

    pub fn add_valid_account(&self, account: &str) {
        self.valid_accounts.lock().unwrap().push(account.to_string());
    }

    pub fn set_history(&self, history: Option<&str>) {
        *self.history.lock().unwrap() = history.map(str::to_string);
    }

    pub fn set_expiry(&self, account: &str, expiry: &str) {
        self.account_data.lock().unwrap().insert(
            account.to_string(),
            GetAccountDataResult::Ok(AccountData {
                expiry: expiry.to_string(),
            }),
        );
    }

    /// Change the daemon's current account, as a device event would.
    pub fn set_account(&self, account: Option<&str>) {
        self.account.send_replace(account.map(str::to_string));
    }

    /// The next history lookup reads its value, then waits until the returned
    /// sender fires or is dropped.
    pub fn hold_next_history(&self) -> oneshot::Sender<()> {
        let (release, hold) = oneshot::channel();
        *self.history_hold.lock().unwrap() = Some(hold);
        release
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until `count` calls were made.
    pub async fn wait_for_calls(&self, count: usize) -> Vec<String> {
        tokio::time::timeout(WAIT, async {
            loop {
                let calls = self.calls();
                if calls.len() >= count {
                    return calls;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} calls, got {:?}", self.calls()))
    }

    async fn enter(&self, call: String) -> InFlight<'_> {
        self.calls.lock().unwrap().push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(self);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        guard
    }
}

#[async_trait]
impl AccountDaemon for FakeDaemon {
    async fn create_new_account(&self) -> Option<String> {
        let _call = self.enter("create".to_string()).await;
        let created = self.new_account.lock().unwrap().clone();
        if let Some(account) = &created {
            *self.history.lock().unwrap() = Some(account.clone());
            self.account.send_replace(Some(account.clone()));
        }
        created
    }

    async fn login_account(&self, account: &str) -> LoginResult {
        let _call = self.enter(format!("login:{account}")).await;
        if account == "panic" {
            panic!("daemon crashed during login");
        }
        if !self.valid_accounts.lock().unwrap().iter().any(|a| a == account) {
            return LoginResult::InvalidAccount;
        }
        *self.history.lock().unwrap() = Some(account.to_string());
        self.account.send_replace(Some(account.to_string()));
        LoginResult::Ok
    }

    async fn logout_account(&self) {
        let _call = self.enter("logout".to_string()).await;
        self.account.send_replace(None);
    }

    async fn get_account_data(&self, account: &str) -> GetAccountDataResult {
        let _call = self.enter(format!("data:{account}")).await;
        self.account_data
            .lock()
            .unwrap()
            .get(account)
            .cloned()
            .unwrap_or(GetAccountDataResult::InvalidAccount)
    }

    async fn get_account_history(&self) -> Option<String> {
        let _call = self.enter("history".to_string()).await;
        let history = self.history.lock().unwrap().clone();
        let hold = self.history_hold.lock().unwrap().take();
        if let Some(hold) = hold {
            let _ = hold.await;
        }
        history
    }

    async fn clear_account_history(&self) {
        let _call = self.enter("clear-history".to_string()).await;
        *self.history.lock().unwrap() = None;
    }

    fn account_number_updates(&self) -> watch::Receiver<Option<String>> {
        self.account.subscribe()
    }
}

/// Config without the account number watcher, so only requested work runs.
pub fn manual_config() -> AccountConfig {
    AccountConfig {
        auto_fetch_expiry: false,
        ..AccountConfig::default()
    }
}

pub fn cache_with(
    daemon: &Arc<FakeDaemon>,
    config: &AccountConfig,
) -> (AccountCache, mpsc::UnboundedReceiver<Event>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel::<Event>();
    let handle = DaemonHandle::resolved(daemon.clone());
    (AccountCache::new(handle, Arc::new(events_tx), config), events_rx)
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

pub async fn assert_quiet(events: &mut mpsc::UnboundedReceiver<Event>) {
    if let Ok(Some(event)) = tokio::time::timeout(QUIET, events.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}
