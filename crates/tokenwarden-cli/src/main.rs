//! tokenwarden - command-line session tool.
//!
//! Signs in against the configured identity service, keeps the credential in
//! the configured store and makes authenticated requests with it.
//!
//! ```text
//! tokenwarden login [username]
//! tokenwarden register <username> [email]
//! tokenwarden status
//! tokenwarden refresh
//! tokenwarden logout
//! tokenwarden get <path-or-url>
//! ```

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokenwarden_core::config::AuthConfig;
use tokenwarden_core::{AuthContext, LoginCredentials, Registration};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file name prefix when logging to a directory
const LOG_FILE_PREFIX: &str = "tokenwarden.log";

const USAGE: &str = "usage: tokenwarden <login [username] | register <username> [email] | status | refresh | logout | get <path>>";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr unless `log_dir` is set, in which case they are written
/// to a daily rolling file. The returned guard must live until exit.
fn init_tracing(config: &AuthConfig) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = AuthConfig::load().context("Failed to load configuration")?;
    let _guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    let context = AuthContext::from_config(&config, AuthConfig::passphrase_from_env())?;
    info!(command = %command, "tokenwarden starting");

    match command.as_str() {
        "login" => login(&context, args.get(1).cloned()).await,
        "register" => {
            let username = args.get(1).context(USAGE)?;
            register(&context, username, args.get(2).cloned()).await
        }
        "status" => {
            context.restore().await;
            print_session(&context)
        }
        "refresh" => {
            if !context.restore().await {
                bail!("Not logged in");
            }
            if !context.refresh().await {
                bail!("Session renewal failed; please log in again");
            }
            print_session(&context)
        }
        "logout" => {
            context.restore().await;
            context.logout(None);
            eprintln!("Logged out");
            Ok(())
        }
        "get" => {
            let path = args.get(1).context(USAGE)?;
            if !context.restore().await {
                bail!("Not logged in");
            }
            let client = context.resource_client(config.endpoints.base_url.clone());
            let body: Value = client.get(path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n{}", other, USAGE),
    }
}

async fn login(context: &AuthContext, username: Option<String>) -> Result<()> {
    let username = match username {
        Some(username) => username,
        None => prompt("Username: ")?,
    };
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    let snapshot = context
        .login(&LoginCredentials::new(username, password))
        .await?;
    if let Some(expires_at) = snapshot.expires_at {
        eprintln!("Logged in; access token valid until {}", expires_at.to_rfc3339());
    } else {
        eprintln!("Logged in");
    }
    Ok(())
}

async fn register(context: &AuthContext, username: &str, email: Option<String>) -> Result<()> {
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    let confirm = rpassword::prompt_password("Confirm password: ").context("Failed to read password")?;
    if password != confirm {
        bail!("Passwords do not match");
    }

    let mut registration = Registration::new(username, password);
    if let Some(email) = email {
        registration = registration.with_email(email);
    }
    context.register(&registration).await?;
    eprintln!("Account created; run `tokenwarden login {}` to sign in", username);
    Ok(())
}

fn print_session(context: &AuthContext) -> Result<()> {
    let snapshot = context.session();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{}", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("No input given");
    }
    Ok(value)
}
