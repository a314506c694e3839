//! Account session coordinator.
//!
//! [`AccountCache`] keeps the client-side view of the daemon's account state
//! and turns requests into daemon calls:
//!
//! - Mutations (create, login, logout) go through a single command actor and
//!   reach the daemon strictly one at a time, in submission order.
//! - Refreshes (expiry, history, clearing history) run as named background
//!   jobs next to the actor.
//! - Results are written to three [`EventNotifier`] fields. Expiry and history
//!   are forwarded to the [`EventSink`] on every write.
//!
//! ```text
//!  Request ──┬─ mutation ─▶ command queue ─▶ actor ──┐
//!            └─ refresh ──▶ JobTracker ─────────────┼─▶ daemon ─▶ notifiers ─▶ EventSink
//!  daemon account number ─▶ watcher job ────────────┘
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use coentro_ipc::{AccountCreationResult, AccountExpiry, AccountHistory, Event, Request};
use futures::FutureExt;
use shared_utils::AccountConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::daemon::{AccountDaemon, DaemonHandle, GetAccountDataResult};
use crate::expiry::parse_expiry;
use crate::jobs::JobTracker;
use crate::notifier::EventNotifier;
use crate::sink::EventSink;

/// Owner key of the coordinator's own listeners.
const SINK_OWNER: &str = "account-cache";

/// Job names.
pub const WATCH_ACCOUNT_NUMBER_JOB: &str = "watch-account-number";
pub const AUTO_FETCH_EXPIRY_JOB: &str = "auto-fetch-expiry";
pub const FETCH_EXPIRY_JOB: &str = "fetch-expiry";
pub const FETCH_HISTORY_JOB: &str = "fetch-history";
pub const CLEAR_HISTORY_JOB: &str = "clear-history";

/// A mutation of the daemon's account session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateAccount,
    Login(String),
    Logout,
}

impl Command {
    /// The command carried by `request`, if it is a mutation.
    pub fn from_request(request: &Request) -> Option<Self> {
        match request {
            Request::CreateAccount => Some(Command::CreateAccount),
            Request::Login(account) => Some(Command::Login(account.clone())),
            Request::Logout => Some(Command::Logout),
            _ => None,
        }
    }
}

struct CacheInner {
    daemon: DaemonHandle,
    sink: Arc<dyn EventSink>,
    jobs: JobTracker,
    shutdown: CancellationToken,
    account_number: EventNotifier<Option<String>>,
    account_expiry: EventNotifier<AccountExpiry>,
    account_history: EventNotifier<AccountHistory>,
}

/// Client-side account session state and the actor that mutates it.
///
/// Must be created inside a tokio runtime. Dropping it shuts it down.
pub struct AccountCache {
    inner: Arc<CacheInner>,
    commands: mpsc::UnboundedSender<Command>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl AccountCache {
    pub fn new(daemon: DaemonHandle, sink: Arc<dyn EventSink>, config: &AccountConfig) -> Self {
        let guard = config.stale_write_guard;
        let inner = Arc::new(CacheInner {
            daemon,
            sink,
            jobs: JobTracker::new(),
            shutdown: CancellationToken::new(),
            account_number: EventNotifier::new("account_number", None, guard),
            account_expiry: EventNotifier::new(
                "account_expiry",
                AccountExpiry::NotAvailable,
                guard,
            ),
            account_history: EventNotifier::new(
                "account_history",
                AccountHistory::WithoutHistory,
                guard,
            ),
        });

        let sink = Arc::clone(&inner.sink);
        inner.account_history.subscribe(SINK_OWNER, move |history| {
            sink.send_event(Event::AccountHistory(history.clone()))
        });
        let sink = Arc::clone(&inner.sink);
        inner.account_expiry.subscribe(SINK_OWNER, move |expiry| {
            sink.send_event(Event::AccountExpiry(expiry.clone()))
        });

        if config.auto_fetch_expiry {
            inner.watch_account_number();
        }

        let (commands, queue) = mpsc::unbounded_channel();
        let actor = tokio::spawn(run_actor(Arc::clone(&inner), queue));
        info!(
            stale_write_guard = guard,
            auto_fetch_expiry = config.auto_fetch_expiry,
            "Account cache started"
        );

        Self {
            inner,
            commands,
            actor: Mutex::new(Some(actor)),
        }
    }

    /// Queue a mutation. Returns immediately; the outcome is reported as an
    /// event. Dropped silently once the cache is shut down.
    pub fn submit(&self, command: Command) {
        if self.inner.shutdown.is_cancelled() {
            debug!(?command, "Account cache shut down, dropping command");
            return;
        }
        if let Err(rejected) = self.commands.send(command) {
            debug!(command = ?rejected.0, "Command queue closed, dropping command");
        }
    }

    pub fn create_account(&self) {
        self.submit(Command::CreateAccount);
    }

    pub fn login(&self, account: impl Into<String>) {
        self.submit(Command::Login(account.into()));
    }

    pub fn logout(&self) {
        self.submit(Command::Logout);
    }

    /// Route a request from a client.
    pub fn handle_request(&self, request: Request) {
        debug!(?request, "Handling account request");
        if let Some(command) = Command::from_request(&request) {
            self.submit(command);
            return;
        }
        match request {
            Request::FetchAccountExpiry => self.fetch_account_expiry(),
            Request::FetchAccountHistory => self.fetch_account_history(),
            Request::ClearAccountHistory => self.clear_account_history(),
            Request::CreateAccount | Request::Login(_) | Request::Logout => {}
        }
    }

    /// Refresh the expiry of the daemon's current account in the background.
    pub fn fetch_account_expiry(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.jobs.run_job(FETCH_EXPIRY_JOB, move |cancel| async move {
            let ticket = inner.account_expiry.ticket();
            let Some(daemon) = inner.ready_daemon().await else {
                return;
            };
            let account = daemon.account_number_updates().borrow().clone();
            let expiry = inner.expiry_for(daemon.as_ref(), account).await;
            inner
                .account_expiry
                .notify_unless_cancelled(ticket, &cancel, expiry);
        });
    }

    /// Refresh the account history in the background.
    pub fn fetch_account_history(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.jobs.run_job(FETCH_HISTORY_JOB, move |cancel| async move {
            let ticket = inner.account_history.ticket();
            let Some(daemon) = inner.ready_daemon().await else {
                return;
            };
            let history = AccountHistory::from(daemon.get_account_history().await);
            inner
                .account_history
                .notify_unless_cancelled(ticket, &cancel, history);
        });
    }

    /// Clear the account history on the daemon, then refresh it.
    pub fn clear_account_history(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.jobs.run_job(CLEAR_HISTORY_JOB, move |cancel| async move {
            let ticket = inner.account_history.ticket();
            let Some(daemon) = inner.ready_daemon().await else {
                return;
            };
            daemon.clear_account_history().await;
            let history = AccountHistory::from(daemon.get_account_history().await);
            inner
                .account_history
                .notify_unless_cancelled(ticket, &cancel, history);
        });
    }

    /// Cancel a background job by name.
    pub fn cancel_job(&self, name: &str) -> bool {
        self.inner.jobs.cancel_job(name)
    }

    pub fn is_job_running(&self, name: &str) -> bool {
        self.inner.jobs.is_running(name)
    }

    pub fn account_number(&self) -> &EventNotifier<Option<String>> {
        &self.inner.account_number
    }

    pub fn account_expiry(&self) -> &EventNotifier<AccountExpiry> {
        &self.inner.account_expiry
    }

    pub fn account_history(&self) -> &EventNotifier<AccountHistory> {
        &self.inner.account_history
    }

    /// Tear the cache down. Idempotent and non-blocking.
    ///
    /// Background jobs are cancelled, every listener is removed and the
    /// command queue is closed. A command whose daemon call is in flight
    /// finishes; queued commands, and a command still waiting for the daemon
    /// to become available, are discarded.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down account cache");

        self.inner.shutdown.cancel();
        // Jobs first: removing listeners takes each field's lock, which waits
        // out any write already past its cancellation check.
        self.inner.jobs.close();
        self.inner.account_number.unsubscribe_all();
        self.inner.account_expiry.unsubscribe_all();
        self.inner.account_history.unsubscribe_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait for the command actor to exit. Only meaningful after
    /// [`shutdown`](Self::shutdown).
    pub async fn wait_for_shutdown(&self) {
        let actor = self
            .actor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(actor) = actor {
            if let Err(e) = actor.await {
                error!(error = %e, "Account command actor failed");
            }
        }
    }
}

impl Drop for AccountCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_actor(inner: Arc<CacheInner>, mut queue: mpsc::UnboundedReceiver<Command>) {
    debug!("Account command actor started");
    loop {
        let command = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            command = queue.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        debug!(?command, "Executing account command");
        if let Err(panic) = AssertUnwindSafe(inner.execute(command))
            .catch_unwind()
            .await
        {
            error!(
                panic = panic_message(panic.as_ref()),
                "Account command panicked, continuing with next command"
            );
        }
    }

    queue.close();
    let mut discarded = 0usize;
    while queue.try_recv().is_ok() {
        discarded += 1;
    }
    info!(discarded, "Account command actor stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

impl CacheInner {
    /// The daemon, or `None` if the cache shut down while waiting for it.
    async fn ready_daemon(&self) -> Option<Arc<dyn AccountDaemon>> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            daemon = self.daemon.ready() => Some(daemon),
        }
    }

    async fn execute(&self, command: Command) {
        let Some(daemon) = self.ready_daemon().await else {
            debug!(?command, "Shut down before the daemon became available, dropping command");
            return;
        };

        match command {
            Command::CreateAccount => {
                let result = match daemon.create_new_account().await {
                    Some(account) => AccountCreationResult::Success(account),
                    None => AccountCreationResult::Failure,
                };
                let created = matches!(result, AccountCreationResult::Success(_));
                info!(created, "Account creation finished");

                self.sink.send_event(Event::AccountCreation(result));
                if created {
                    self.refresh_history(daemon.as_ref()).await;
                }
            }
            Command::Login(account) => {
                let result = daemon.login_account(&account).await;
                info!(?result, "Login finished");

                self.sink.send_event(Event::Login(result));
                if result.is_ok() {
                    self.refresh_history(daemon.as_ref()).await;
                }
            }
            Command::Logout => {
                daemon.logout_account().await;
                info!("Logout finished");
                self.refresh_history(daemon.as_ref()).await;
            }
        }
    }

    /// History refresh that follows a mutation. The ticket is taken before
    /// the read, so a history write issued after it (a clear, say) wins; that
    /// write then serves as the mutation's history update.
    async fn refresh_history(&self, daemon: &dyn AccountDaemon) {
        let ticket = self.account_history.ticket();
        let history = AccountHistory::from(daemon.get_account_history().await);
        if !self
            .account_history
            .notify_with_ticket(ticket, history)
            .is_applied()
        {
            debug!("Newer account history already published");
        }
    }

    async fn expiry_for(&self, daemon: &dyn AccountDaemon, account: Option<String>) -> AccountExpiry {
        let Some(account) = account else {
            return AccountExpiry::NotAvailable;
        };

        match daemon.get_account_data(&account).await {
            GetAccountDataResult::Ok(data) => match parse_expiry(&data.expiry) {
                Ok(expiry) => AccountExpiry::Available(expiry),
                Err(e) => {
                    warn!(error = %e, "Daemon reported an unparseable account expiry");
                    AccountExpiry::NotAvailable
                }
            },
            other => {
                debug!(result = ?other, "Account data unavailable");
                AccountExpiry::NotAvailable
            }
        }
    }

    /// Follow the daemon's account number, refreshing the expiry on every
    /// change. A new change supersedes an expiry fetch still in flight.
    fn watch_account_number(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.jobs
            .run_job(WATCH_ACCOUNT_NUMBER_JOB, move |cancel| async move {
                let Some(daemon) = inner.ready_daemon().await else {
                    return;
                };
                let mut updates = daemon.account_number_updates();

                loop {
                    let account = updates.borrow_and_update().clone();
                    debug!(logged_in = account.is_some(), "Account number changed");

                    let ticket = inner.account_number.ticket();
                    let outcome =
                        inner
                            .account_number
                            .notify_unless_cancelled(ticket, &cancel, account.clone());
                    if !outcome.is_applied() && cancel.is_cancelled() {
                        break;
                    }
                    inner.auto_fetch_expiry(account);

                    if updates.changed().await.is_err() {
                        debug!("Daemon closed the account number stream");
                        break;
                    }
                }
            });
    }

    fn auto_fetch_expiry(self: &Arc<Self>, account: Option<String>) {
        let inner = Arc::clone(self);
        self.jobs
            .run_job(AUTO_FETCH_EXPIRY_JOB, move |cancel| async move {
                let ticket = inner.account_expiry.ticket();
                let Some(daemon) = inner.ready_daemon().await else {
                    return;
                };
                let expiry = inner.expiry_for(daemon.as_ref(), account).await;
                inner
                    .account_expiry
                    .notify_unless_cancelled(ticket, &cancel, expiry);
            });
    }
}
