#![cfg_attr(not(test), warn(clippy::pedantic))]
#![allow(clippy::large_futures)]
#![cfg_attr(not(test), warn(clippy::expect_used))]

use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use gitrepublic::{config::Settings, gateway};
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut settings = Settings::from_env()?;
    if let Some(repo_root) = cli.repo_root {
        settings.repo_root = repo_root;
    }
    if let Some(domain) = cli.domain {
        settings.domain = domain;
    }
    if !cli.relays.is_empty() {
        settings.relay_default_set = cli.relays;
    }
    tokio::fs::create_dir_all(&settings.repo_root)
        .await
        .context("failed to create the repository root")?;

    let keys = match &cli.nsec {
        Some(nsec) => Some(nostr::Keys::from_str(nsec).context("invalid nsec parameter")?),
        None => None,
    };

    let ctx = gateway::AppContext::build(settings, keys)?;
    let app = gateway::router(ctx);

    let listener = tokio::net::TcpListener::bind(&cli.listen)
        .await
        .context(format!("failed to bind {}", cli.listen))?;
    tracing::info!(listen = %cli.listen, "gitrepublic serving");
    axum::serve(listener, app)
        .await
        .context("server terminated")?;
    Ok(())
}
