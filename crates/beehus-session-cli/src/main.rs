//! beehus-session - sign in to the Beehus API and keep the session alive.
//!
//! Tokens are persisted in the configured storage, so a session started with
//! `login` is picked up by later invocations.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use beehus_session_core::auth::open_store;
use beehus_session_core::{ApiClient, AuthApi, Config, SessionError, SessionManager};

/// Password source for non-interactive use
const PASSWORD_ENV: &str = "BEEHUS_PASSWORD";

/// Email source for non-interactive use
const EMAIL_ENV: &str = "BEEHUS_EMAIL";

const USAGE: &str = "\
Usage: beehus-session <command>

Commands:
  login [email]   Sign in and store the session
  status          Show whether a stored session is still valid
  whoami          Print the signed-in user's profile
  watch           Keep the session renewed until Ctrl+C
  logout          Forget the stored session";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str);

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        }
    };

    let api = ApiClient::from_config(&config)?;
    let store = open_store(&config)?;
    let session = SessionManager::new(Arc::new(api.clone()) as Arc<dyn AuthApi>, store);

    match command {
        Some("login") => login(&session, &mut config, args.get(2).cloned()).await,
        Some("status") => status(&session).await,
        Some("whoami") => whoami(&session).await,
        Some("watch") => watch(&session, &api).await,
        Some("logout") => {
            session.logout();
            println!("Signed out.");
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            Ok(())
        }
    }
}

async fn login(session: &SessionManager, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email
        .or_else(|| std::env::var(EMAIL_ENV).ok())
        .filter(|e| !e.trim().is_empty())
    {
        Some(email) => email,
        None => prompt_email(config.last_email.as_deref())?,
    };

    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => password,
        _ => rpassword::prompt_password("Password: ")?,
    };

    println!("Signing in to {}...", config.api_base_url);
    let user = session
        .sign_in(&email, &password)
        .await
        .context("Sign-in failed")?;

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    info!(user_id = %user.id, "Login successful");
    println!("Signed in as {} ({}).", user.display_name(), user.role);
    Ok(())
}

fn prompt_email(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    match (input.is_empty(), last) {
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => Err(anyhow::anyhow!("Email required")),
        (false, _) => Ok(input.to_string()),
    }
}

/// Rehydrate and verify the stored session, reporting why it is gone if so
async fn restore(session: &SessionManager) -> Result<bool> {
    match session.restore().await {
        Ok(restored) => Ok(restored),
        Err(SessionError::ProfileLoad(e)) => {
            println!("Stored session is no longer valid ({}).", e);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

async fn status(session: &SessionManager) -> Result<()> {
    if !restore(session).await? {
        println!("Not signed in.");
        return Ok(());
    }

    let snapshot = session.snapshot();
    let name = snapshot
        .user
        .as_ref()
        .map(|u| u.display_name().to_string())
        .unwrap_or_default();
    println!("Signed in as {}{}.", name, if snapshot.is_admin() { " (admin)" } else { "" });

    match session.renewal_due_in() {
        Some(due) => println!("Next token renewal in {}s.", due.as_secs()),
        None => println!("Access token has no expiry; no renewal scheduled."),
    }
    Ok(())
}

async fn whoami(session: &SessionManager) -> Result<()> {
    if !restore(session).await? {
        println!("Not signed in.");
        return Ok(());
    }

    if let Some(user) = session.user() {
        println!("id:         {}", user.id);
        println!("email:      {}", user.email);
        println!("name:       {}", user.full_name.as_deref().unwrap_or("-"));
        println!("role:       {}", user.role);
        println!("active:     {}", user.is_active);
        println!("created:    {}", user.created_at.format("%Y-%m-%d %H:%M"));
        println!(
            "last login: {}",
            user.last_login
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

async fn watch(session: &SessionManager, api: &ApiClient) -> Result<()> {
    if !restore(session).await? {
        println!("Not signed in. Run `beehus-session login` first.");
        return Ok(());
    }

    // Follows the session's token like any other request client would
    let client = session.client(api);
    let mut feed = session.bearer();
    println!("Keeping session alive, Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopped; session left in place.");
                return Ok(());
            }
            changed = feed.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                if client.bearer_token().is_none() {
                    println!("Session ended; sign in again.");
                    return Ok(());
                }
                let due = session
                    .renewal_due_in()
                    .map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "never".to_string());
                println!("Access token renewed; next renewal in {}.", due);
            }
        }
    }
}
