use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use coentro_ipc::{
    AccountClient, AccountCreationResult, AccountExpiry, AccountHistory, Event, IpcTransport,
    Request, TransportOptions,
};
use serde::Serialize;
use shared_utils::logging::{init_logging, LogOptions};
use shared_utils::Config;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  coentroctl account create\n  coentroctl account login 1234567890123456 --output json\n  coentroctl account expiry\n  coentroctl --socket /tmp/account.sock account history")]
struct Args {
    /// Log level
    #[arg(
        short,
        long,
        value_enum,
        default_value = "warn",
        env = "COENTRO_LOG_LEVEL"
    )]
    log_level: LogLevelArg,

    /// Emit JSON logs
    #[arg(long, env = "COENTRO_JSON_LOGS")]
    json_logs: bool,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Account service socket (default: from the configuration file)
    #[arg(long, env = "COENTRO_ACCOUNT_SOCKET")]
    socket: Option<PathBuf>,

    /// How long to wait for the service's answer
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the account session
    Account {
        #[command(subcommand)]
        action: AccountCmd,
    },
}

#[derive(Subcommand, Debug)]
enum AccountCmd {
    /// Create a new account and log in with it
    Create,
    /// Log in with an existing account number
    Login {
        /// Account number
        account: String,
    },
    /// Log out of the current account
    Logout,
    /// Show when the current account expires
    Expiry,
    /// Show the most recently used account number
    History,
    /// Forget the most recently used account number
    ClearHistory,
}

/// Which event answers a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Answer {
    Creation,
    Login,
    Expiry,
    History,
}

impl AccountCmd {
    fn request(&self) -> Request {
        match self {
            AccountCmd::Create => Request::CreateAccount,
            AccountCmd::Login { account } => Request::Login(account.clone()),
            AccountCmd::Logout => Request::Logout,
            AccountCmd::Expiry => Request::FetchAccountExpiry,
            AccountCmd::History => Request::FetchAccountHistory,
            AccountCmd::ClearHistory => Request::ClearAccountHistory,
        }
    }

    fn answer(&self) -> Answer {
        match self {
            AccountCmd::Create => Answer::Creation,
            AccountCmd::Login { .. } => Answer::Login,
            AccountCmd::Expiry => Answer::Expiry,
            AccountCmd::Logout | AccountCmd::History | AccountCmd::ClearHistory => {
                Answer::History
            }
        }
    }
}

impl Answer {
    fn matches(self, event: &Event) -> bool {
        matches!(
            (self, event),
            (Answer::Creation, Event::AccountCreation(_))
                | (Answer::Login, Event::Login(_))
                | (Answer::Expiry, Event::AccountExpiry(_))
                | (Answer::History, Event::AccountHistory(_))
        )
    }
}

#[derive(Serialize)]
struct Message<'a> {
    status: &'a str,
    detail: String,
}

fn describe(event: &Event) -> (&'static str, String) {
    match event {
        Event::AccountCreation(AccountCreationResult::Success(account)) => {
            ("ok", format!("created account {account}"))
        }
        Event::AccountCreation(AccountCreationResult::Failure) => {
            ("error", "account creation failed".to_string())
        }
        Event::Login(result) if result.is_ok() => ("ok", "logged in".to_string()),
        Event::Login(result) => ("error", format!("login failed: {result:?}")),
        Event::AccountExpiry(AccountExpiry::Available(expiry)) => {
            ("ok", format!("account expires {}", expiry.to_rfc3339()))
        }
        Event::AccountExpiry(AccountExpiry::NotAvailable) => {
            ("unknown", "account expiry not available".to_string())
        }
        Event::AccountHistory(AccountHistory::WithHistory(account)) => {
            ("ok", format!("last used account {account}"))
        }
        Event::AccountHistory(AccountHistory::WithoutHistory) => {
            ("ok", "no account history".to_string())
        }
    }
}

fn render(fmt: OutputFormat, event: &Event) -> Result<String> {
    let (status, detail) = describe(event);
    Ok(match fmt {
        OutputFormat::Table => format!("{status}: {detail}"),
        OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
            "message": Message { status, detail },
            "event": event,
        }))?,
    })
}

async fn await_answer(client: &mut AccountClient, answer: Answer, wait: Duration) -> Result<Event> {
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("no answer from the account service within {wait:?}");
        }

        match client.receive_event_timeout(remaining).await? {
            Some(event) if answer.matches(&event) => return Ok(event),
            Some(event) => debug!(?event, "Skipping unrelated event"),
            None => bail!("account service closed the connection"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level: tracing::Level = args.log_level.into();
    let _guard = init_logging(LogOptions {
        level,
        json_format: args.json_logs,
        ..Default::default()
    });

    let config = Config::load_or_default(Config::default_path())
        .context("failed to load configuration")?;
    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.ipc.socket_path));
    let options = TransportOptions {
        write_timeout: config.ipc.write_timeout(),
        max_frame_bytes: config.ipc.max_frame_bytes,
    };

    let Command::Account { action } = args.command;
    let mut client = AccountClient::connect(&socket, options)
        .await
        .with_context(|| format!("failed to reach the account service at {}", socket.display()))?;

    let request = action.request();
    info!(?request, socket = %socket.display(), "Sending account request");
    client.send_request(&request).await?;

    let event = await_answer(
        &mut client,
        action.answer(),
        Duration::from_millis(args.timeout_ms),
    )
    .await?;
    println!("{}", render(args.output, &event)?);

    client.close().await?;
    info!("coentroctl command completed");
    Ok(())
}
