use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use transport_api_harness::auth::CredentialManager;
use transport_api_harness::client::ApiClient;
use transport_api_harness::config::{CliArgs, Command, Config};
use transport_api_harness::tracker::{ResourceId, ResourceTracker};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let command = args.command.clone();

    let config = Config::from_args(args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("Target API: {}", config.base_url);
    let credentials = Arc::new(CredentialManager::from_config(&config)?);

    match command {
        Command::Token => show_token(&credentials).await,
        Command::Headers { headers, reveal } => show_headers(&credentials, headers, reveal).await,
        Command::Cleanup { kind, ids } => cleanup(credentials, &config, &kind, ids).await,
    }
}

/// Acquire a credential and print its provenance
async fn show_token(credentials: &CredentialManager) -> Result<()> {
    let credential = match credentials.get_valid_credential().await {
        Ok(credential) => credential,
        Err(e) => {
            tracing::error!("❌ Authentication failed: {}", e);
            anyhow::bail!(e);
        }
    };

    println!("  Source:   {}", credential.source());
    println!("  Acquired: {}", credential.acquired().to_rfc3339());
    match credential.expires_at() {
        Some(expires_at) => println!("  Expires:  {}", expires_at.to_rfc3339()),
        None => println!("  Expires:  unknown"),
    }
    println!("  Token:    {}", credential.masked());
    Ok(())
}

/// Print the header set a resource client would send
async fn show_headers(
    credentials: &CredentialManager,
    extra: Vec<(String, String)>,
    reveal: bool,
) -> Result<()> {
    let headers = credentials.build_headers(extra).await?;

    for (name, value) in &headers {
        if !reveal && name.eq_ignore_ascii_case("authorization") {
            println!("{}: {}", name, mask(value));
        } else {
            println!("{}: {}", name, value);
        }
    }
    Ok(())
}

/// Delete resources left behind by an interrupted run
async fn cleanup(
    credentials: Arc<CredentialManager>,
    config: &Config,
    kind: &str,
    ids: Vec<String>,
) -> Result<()> {
    let client = ApiClient::from_config(credentials, config)?;

    let mut tracker = ResourceTracker::new();
    for raw in ids {
        let identifier = match raw.parse::<i64>() {
            Ok(n) => ResourceId::Number(n),
            Err(_) => ResourceId::Text(raw),
        };
        tracker.register(kind, identifier)?;
    }

    let outcomes = tracker.flush(&client).await;
    println!("{}", serde_json::to_string_pretty(&outcomes)?);

    let failed = outcomes.iter().filter(|o| !o.succeeded).count();
    if failed > 0 {
        anyhow::bail!("{} of {} deletions failed", failed, outcomes.len());
    }
    Ok(())
}

fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(15).collect();
    format!("{}...", prefix)
}
