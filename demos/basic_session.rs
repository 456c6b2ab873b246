//! Basic session example
//!
//! Usage:
//!   FLOWMON_API_URL=http://localhost:5000/api \
//!   FLOWMON_USERNAME=alice FLOWMON_PASSWORD=secret \
//!   cargo run --example basic_session

use flowmon_client::{ApiClient, ClientConfig, LoginRequest, Session, SessionEvent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,flowmon_client=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ClientConfig::from_env()?;
    println!("=== Flow Monitor Client Example ===");
    println!("API: {}", config.base_url);
    println!();

    let client = ApiClient::new(config)?;
    let session = Session::new(client.clone());

    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Expired { reason } => println!("! Session expired ({reason}), please log in again"),
                SessionEvent::Notice { message } => println!("! {message}"),
                other => println!("  event: {other:?}"),
            }
        }
    });

    // Reuse persisted credentials when possible
    if session.check_login_status().await {
        println!("✓ Restored stored session");
    } else {
        let username = std::env::var("FLOWMON_USERNAME").unwrap_or_else(|_| "admin".to_string());
        let password = std::env::var("FLOWMON_PASSWORD").unwrap_or_default();

        match session.login(&LoginRequest::new(username, password)).await {
            Ok(user) => println!("✓ Logged in as {}", user["username"]),
            Err(e) => {
                println!("✗ Login failed: {e}");
                return Ok(());
            }
        }
    }
    println!();

    // Fire a few requests at once; an expired token is refreshed exactly once
    let (accounts, flows, status) = tokio::join!(
        client.get("/unicom/accounts", &[]),
        client.get("/flow/query-all", &[]),
        client.get("/monitor/status", &[]),
    );
    for (name, result) in [("accounts", accounts), ("flows", flows), ("monitor status", status)] {
        match result {
            Ok(payload) => println!("✓ {name}: {payload}"),
            Err(e) => println!("✗ {name}: {e}"),
        }
    }
    println!();

    session.logout().await;
    println!("Done!");

    Ok(())
}
