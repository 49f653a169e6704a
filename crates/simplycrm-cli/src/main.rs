//! SimplyCRM CLI - a command-line front end for the SimplyCRM REST API.
//!
//! Every command goes through the resilient `ApiClient`, so authentication,
//! CSRF handling and throttling retries behave exactly as they do for any
//! other consumer of `simplycrm-core`. Notifications raised by the client
//! (session expiry, rate limiting) are printed to stderr.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use simplycrm_core::api::{LoginRequest, RequestOptions};
use simplycrm_core::{
    ApiClient, AuthApi, ClientConfig, FileTokenStore, KeyringTokenStore, Method, Notification,
    NotificationBus, SessionContext, TokenSlot,
};

/// Directory for a daily-rotated log file, in addition to stderr.
const ENV_LOG_DIR: &str = "SIMPLYCRM_LOG_DIR";

const LOG_FILE_PREFIX: &str = "simplycrm.log";

#[derive(Parser)]
#[command(name = "simplycrm", version, about = "Command-line client for the SimplyCRM REST API")]
struct Cli {
    /// Keep the session token in the OS keychain instead of the cache directory
    #[arg(long, global = true)]
    keyring: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and store the session token
    Login {
        username: String,
        /// Captcha response token, when the server requires one
        #[arg(long)]
        captcha_token: Option<String>,
    },
    /// Revoke the session token and forget it locally
    Logout,
    /// Show the signed-in user's profile
    Profile,
    /// Fetch (or reuse) a CSRF token and print it
    Csrf,
    /// Send an arbitrary request through the client
    Request {
        /// HTTP method, e.g. GET or POST
        method: String,
        /// Path relative to the API base URL, e.g. /deals/
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
        /// Query parameter as key=value (repeatable)
        #[arg(long = "query", short = 'q')]
        query: Vec<String>,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing();
    info!("SimplyCRM CLI starting");

    let config = ClientConfig::from_env();
    let tokens = if cli.keyring {
        TokenSlot::new(KeyringTokenStore::default())
    } else {
        TokenSlot::new(FileTokenStore::default_location()?)
    };
    if let Err(e) = tokens.bootstrap() {
        warn!(error = %e, "Ignoring unreadable saved session");
    }

    let notifications = NotificationBus::new();
    let printer = spawn_notification_printer(notifications.subscribe());
    let client = ApiClient::new(&config, Arc::new(SessionContext::new(tokens)), notifications)
        .context("Failed to create API client")?;

    // The printer exits once the client (and with it the bus) is dropped.
    let result = run(cli.command, client).await;
    let _ = printer.await;

    info!("SimplyCRM CLI shutting down");
    result
}

async fn run(command: Command, client: ApiClient) -> Result<()> {
    let auth = AuthApi::new(client.clone());

    match command {
        Command::Login {
            username,
            captcha_token,
        } => {
            let password = rpassword::prompt_password("Password: ")?;
            auth.login(&LoginRequest {
                username: username.clone(),
                password,
                captcha_token,
            })
            .await
            .context("Login failed")?;
            eprintln!("Logged in as {}", username);
        }
        Command::Logout => {
            if !client.session().tokens().is_authenticated() {
                eprintln!("Not logged in");
                return Ok(());
            }
            auth.logout().await.context("Token revocation failed")?;
            eprintln!("Logged out");
        }
        Command::Profile => {
            let profile = auth.profile().await.context("Failed to load profile")?;
            println!("{} <{}>", profile.display_name(), profile.email);
            if let Some(org) = &profile.organization {
                println!("Organization: {} ({})", org.name, org.slug);
            }
            for flag in &profile.feature_flags {
                println!("  [{}] {}", if flag.enabled { "x" } else { " " }, flag.code);
            }
        }
        Command::Csrf => {
            let token = client.csrf_token().await.context("Failed to obtain CSRF token")?;
            println!("{}", token);
        }
        Command::Request {
            method,
            path,
            data,
            query,
        } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;

            let mut options = RequestOptions::new();
            for pair in &query {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("Query parameter must be key=value: {}", pair))?;
                options = options.query(key, value);
            }
            if let Some(data) = data {
                let body: serde_json::Value =
                    serde_json::from_str(&data).context("Request body is not valid JSON")?;
                options = options.json(&body)?;
            }

            let response = client.request(method, &path, options).await?;
            eprintln!("{}", response.status());
            match response.json::<serde_json::Value>() {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{}", response.text()),
            }
        }
    }

    Ok(())
}

fn spawn_notification_printer(mut rx: broadcast::Receiver<Notification>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    eprintln!(
                        "[{:?}] {}: {}",
                        notification.kind, notification.title, notification.message
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Dropped notifications");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
