//! assistsync - command-line access to the offline-first sync engine.
//!
//! Reads come from the local cache when it is fresh, writes are queued
//! locally and pushed before the command exits (or on the next run when
//! the server is unreachable).

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use assistsync_core::config::TOKEN_ENV;
use assistsync_core::utils::{format_timestamp, payload_preview};
use assistsync_core::{
    ApiClient, CacheState, Config, FileStore, MutationKind, PendingMutation, ReconcileOutcome,
    SyncHandle, TokenStore,
};

/// Width of payload previews in listings
const PREVIEW_WIDTH: usize = 60;

#[derive(Parser)]
#[command(name = "assistsync", version, about = "Offline-first sync for assistant data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an entity (cached when fresh)
    Get { key: String },

    /// Queue an update
    Put { key: String, json: String },

    /// Queue a create
    Create { key: String, json: String },

    /// Queue a delete
    Delete { key: String },

    /// Reconcile a key now
    Sync { key: String },

    /// Print every state change of a key
    Watch { key: String },

    /// List keys with unsynced changes
    Pending,

    /// List mutations the server rejected
    Failed { key: String },

    /// Re-queue rejected mutations
    Retry { key: String },

    /// Store the API token in the OS keychain
    SetToken { token: String },

    /// Remove the token and wipe the local cache
    Logout,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Get { .. } => "get",
            Commands::Put { .. } => "put",
            Commands::Create { .. } => "create",
            Commands::Delete { .. } => "delete",
            Commands::Sync { .. } => "sync",
            Commands::Watch { .. } => "watch",
            Commands::Pending => "pending",
            Commands::Failed { .. } => "failed",
            Commands::Retry { .. } => "retry",
            Commands::SetToken { .. } => "set-token",
            Commands::Logout => "logout",
        }
    }
}

/// Initialize the tracing subscriber for logging. Events go to stderr and
/// to a daily log file in the cache directory.
fn init_tracing(log_dir: &Path) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, "assistsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
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

    let config = Config::load()?;
    let cache_dir = config.cache_dir()?;
    let _log_guard = init_tracing(&cache_dir.join("logs"));
    info!(command = cli.command.name(), "assistsync starting");

    match cli.command {
        Commands::SetToken { token } => {
            TokenStore::store(&token)?;
            println!("Token stored");
            Ok(())
        }
        Commands::Logout => {
            TokenStore::delete()?;
            let sync = start(&config, &cache_dir)?;
            sync.logout().await.context("Failed to wipe local cache")?;
            println!("Logged out; local cache removed");
            Ok(())
        }
        command => {
            let sync = start(&config, &cache_dir)?;
            let result = run(&sync, command).await;
            sync.shutdown().await;
            result
        }
    }
}

fn start(config: &Config, cache_dir: &Path) -> Result<SyncHandle> {
    let token = match std::env::var(TOKEN_ENV) {
        Ok(token) => Some(token),
        Err(_) => TokenStore::get()?,
    };
    let mut client = ApiClient::new(&config.base_url())?;
    if let Some(token) = token {
        client.set_token(token);
    }

    let store = FileStore::new(cache_dir.join("store"))
        .with_context(|| format!("Failed to open store in {}", cache_dir.display()))?;
    let sync = SyncHandle::start(config.sync.clone(), Arc::new(store), Arc::new(client))?;
    Ok(sync)
}

async fn run(sync: &SyncHandle, command: Commands) -> Result<()> {
    match command {
        Commands::Get { key } => {
            let entity = sync.fetch(&key).await?;
            println!("{}", serde_json::to_string_pretty(&entity.payload)?);
            let state = if entity.dirty { "unsynced changes" } else { "synced" };
            eprintln!(
                "version {} | {} | last synced {}",
                entity.version.as_deref().unwrap_or("-"),
                state,
                entity.age_display()
            );
        }
        Commands::Put { key, json } => mutate(sync, &key, MutationKind::Update, parse_payload(&json)?).await?,
        Commands::Create { key, json } => mutate(sync, &key, MutationKind::Create, parse_payload(&json)?).await?,
        Commands::Delete { key } => mutate(sync, &key, MutationKind::Delete, Value::Null).await?,
        Commands::Sync { key } => report(sync.force_sync(&key).await)?,
        Commands::Watch { key } => watch(sync, &key).await?,
        Commands::Pending => {
            let keys = sync.dirty_keys()?;
            if keys.is_empty() {
                println!("Nothing to sync");
            }
            for key in keys {
                let queue = sync.pending(&key)?;
                println!("{key} ({} queued)", queue.len());
                print_mutations(&queue);
            }
        }
        Commands::Failed { key } => {
            let failed = sync.failed_mutations(&key)?;
            if failed.is_empty() {
                println!("No failed mutations for {key}");
            }
            print_mutations(&failed);
        }
        Commands::Retry { key } => {
            let count = sync.resubmit_failed(&key)?;
            println!("Resubmitted {count} mutation(s)");
            if count > 0 {
                report(sync.force_sync(&key).await)?;
            }
        }
        Commands::SetToken { .. } | Commands::Logout => {
            bail!("{} runs without a sync session", command.name())
        }
    }
    Ok(())
}

fn parse_payload(json: &str) -> Result<Value> {
    serde_json::from_str(json).context("Payload is not valid JSON")
}

/// Queue the write, then try to push it right away. A failed push leaves
/// it queued for the next run.
async fn mutate(sync: &SyncHandle, key: &str, kind: MutationKind, payload: Value) -> Result<()> {
    let receipt = sync.mutate(key, kind, payload)?;
    println!("Queued {kind} #{} for {key} ({} pending)", receipt.id, receipt.queued);
    report(sync.force_sync(key).await)
}

fn report(outcome: ReconcileOutcome) -> Result<()> {
    match outcome {
        ReconcileOutcome::Applied { changed: true } => println!("Synced"),
        ReconcileOutcome::Applied { changed: false } => println!("Already up to date"),
        ReconcileOutcome::Conflict => println!("Synced; local changes were replaced by the server version"),
        ReconcileOutcome::Deferred => println!("Waiting to retry; changes stay queued"),
        ReconcileOutcome::Failed(e) if e.is_terminal() => bail!(e),
        ReconcileOutcome::Failed(e) => println!("Offline ({e}); changes stay queued"),
    }
    Ok(())
}

async fn watch(sync: &SyncHandle, key: &str) -> Result<()> {
    let mut states = sync.subscribe(key).into_stream();
    loop {
        tokio::select! {
            state = states.next() => match state {
                Some(state) => print_state(key, &state),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn print_state(key: &str, state: &CacheState) {
    match state {
        CacheState::Pending => println!("{key}: loading"),
        CacheState::Absent => println!("{key}: absent"),
        CacheState::Present(entity) => println!(
            "{key}: {}{}",
            payload_preview(&entity.payload, PREVIEW_WIDTH),
            if entity.dirty { " (unsynced)" } else { "" }
        ),
        CacheState::Failed { last, error } => {
            let shown = last
                .as_ref()
                .map(|e| payload_preview(&e.payload, PREVIEW_WIDTH))
                .unwrap_or_else(|| "-".to_string());
            println!("{key}: {shown} (error: {error})");
        }
    }
}

fn print_mutations(mutations: &[PendingMutation]) {
    for m in mutations {
        let retry = m
            .next_retry_at
            .map(|at| format!(" retry at {}", format_timestamp(&at)))
            .unwrap_or_default();
        println!(
            "  #{} {} {} attempts={}{}",
            m.id,
            m.kind,
            payload_preview(&m.payload, PREVIEW_WIDTH),
            m.attempt_count,
            retry
        );
        if let Some(ref err) = m.last_error {
            println!("    last error: {err}");
        }
    }
}
