//! # xpsync-agent
//!
//! Operator tool over the xpsync client library:
//! - **status** of the local outboxes
//! - **flush** with the current session
//! - **purge** / **clear** for recovery
//! - **run** as a long-lived sync process fed by stdin

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xpsync_client::{hygiene, LifecycleEvent, StaticCredentials, SyncClient, SyncConfig};
use xpsync_shared::Event;

#[derive(Parser)]
#[command(name = "xpsync-agent")]
#[command(about = "Inspect and drive the local XP/quest outboxes", version)]
struct Cli {
    /// Directory holding the local stores
    #[arg(long, env = "XPSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Base URL of the sync API
    #[arg(long, env = "XPSYNC_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token of the current session
    #[arg(long, env = "XPSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Subject id of the current session
    #[arg(long, env = "XPSYNC_SUBJECT")]
    subject: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the store backend and what is pending per stream
    Status {
        /// Include the pending events themselves
        #[arg(long)]
        events: bool,
    },
    /// Purge foreign events, then flush every outbox now
    Flush,
    /// Drop every pending event not owned by SUBJECT
    Purge {
        #[arg(long)]
        subject: String,
    },
    /// Drop every pending event
    Clear,
    /// Sync in the background; stdin lines are lifecycle signals or JSON events
    Run,
}

impl Cli {
    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        config
    }

    fn credentials(&self) -> StaticCredentials {
        match (&self.subject, &self.token) {
            (Some(subject), Some(token)) => StaticCredentials::signed_in(subject.as_str(), token.as_str()),
            _ => StaticCredentials::new(),
        }
    }

    fn has_session(&self) -> bool {
        self.subject.is_some() && self.token.is_some()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("xpsync_client=debug,xpsync_store=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    info!(data_dir = %config.data_dir.display(), base_url = %config.base_url, "xpsync-agent starting");

    let client = SyncClient::connect(&config, Arc::new(cli.credentials()))
        .context("could not open the sync client")?;

    match &cli.command {
        Command::Status { events } => status(&client, *events).await?,
        Command::Flush => {
            if !cli.has_session() {
                bail!("flush needs XPSYNC_TOKEN and XPSYNC_SUBJECT");
            }
            let purged = client.start(None).await?;
            let report = client.shutdown().await;
            print_json(&json!({ "hygiene": purged, "flush": report }))?;
        }
        Command::Purge { subject } => {
            let auth = StaticCredentials::new();
            auth.set_session(subject.as_str(), String::new());
            let report = hygiene::purge_foreign_events(client.manager().outboxes(), &auth).await?;
            print_json(&report)?;
        }
        Command::Clear => {
            let removed = hygiene::clear_everything(client.manager().outboxes()).await?;
            print_json(&json!({ "removed": removed }))?;
        }
        Command::Run => run(&client).await?,
    }

    Ok(())
}

async fn status(client: &SyncClient, with_events: bool) -> anyhow::Result<()> {
    let mut streams = Vec::new();
    for outbox in client.manager().outboxes() {
        let mut status = serde_json::to_value(outbox.get_status().await?)?;
        if !with_events {
            if let Some(map) = status.as_object_mut() {
                map.remove("events");
            }
        }
        streams.push(status);
    }
    print_json(&json!({
        "backend": client.backend_kind(),
        "state": client.manager().state(),
        "streams": streams,
    }))
}

async fn run(client: &SyncClient) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel(32);
    let report = client.start(Some(rx)).await?;
    info!(purged = report.total(), skipped = report.skipped, "sync running, ctrl+c to stop");

    let mut notifications = client.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => handle_line(client, &tx, line.trim()).await,
                    None => stdin_open = false,
                }
            }
            Ok(note) = notifications.recv() => {
                print_json(&note)?;
            }
        }
    }

    let report = client.shutdown().await;
    print_json(&json!({ "shutdown": report }))
}

async fn handle_line(client: &SyncClient, tx: &mpsc::Sender<LifecycleEvent>, line: &str) {
    if line.is_empty() {
        return;
    }
    if line.starts_with('{') {
        match serde_json::from_str::<Event>(line) {
            Ok(event) => {
                if let Err(e) = client.enqueue(event).await {
                    warn!(error = %e, "event not enqueued");
                }
            }
            Err(e) => warn!(error = %e, "unreadable event"),
        }
        return;
    }
    match line.parse::<LifecycleEvent>() {
        Ok(event) => {
            if tx.send(event).await.is_err() {
                warn!("lifecycle listener is gone");
            }
        }
        Err(e) => warn!(error = %e, "ignored input line"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
