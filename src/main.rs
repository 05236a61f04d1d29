// src/main.rs
//
// =============================================================================
// CRUCIBLE: COMMANDER & ENTRY POINT
// =============================================================================
//
// Modes:
// 1. SERVE: sweep stale sandboxes, then accept submissions over HTTP.
// 2. KEY:   manage API keys (add / list / revoke).
// 3. STATS: print service counters.
//
// Key features:
// - The sweeper runs before the listener binds, so a crashed predecessor
//   never leaks sandboxes into the new run.
// - Graceful shutdown on ctrl-c; in-flight jobs are reconciled by the
//   sweeper on the next start.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crucible::api::{self, AppState};
use crucible::{Config, DockerRuntime, JobStore, Supervisor};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "crucible", version, about = "Sandboxed code-execution service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service.
    Serve {
        #[arg(long, default_value_t = 3000)]
        port: u16,

        /// SQLite database file for jobs and API keys.
        #[arg(long, default_value = "crucible.db")]
        db: String,

        /// Container runtime socket.
        #[arg(long, default_value = "/var/run/docker.sock")]
        runtime_socket: String,

        /// Label value stamped on every sandbox; the sweeper removes by it.
        #[arg(long, default_value = "crucible")]
        project_label: String,

        /// Wall-clock limit per job, in milliseconds.
        #[arg(long, default_value_t = 10_000)]
        deadline_ms: u64,

        /// Cap on each captured output stream, in bytes.
        #[arg(long, default_value_t = 10_000)]
        output_cap_bytes: usize,

        /// Sandbox image.
        #[arg(long, default_value = "openjdk:17-alpine")]
        image: String,

        /// Sandbox memory limit, in bytes.
        #[arg(long, default_value_t = 512 * 1024 * 1024)]
        memory_limit_bytes: i64,

        /// Relative CPU share for each sandbox.
        #[arg(long, default_value_t = 512)]
        cpu_weight: i64,
    },

    /// Manage API keys.
    Key {
        #[arg(long, default_value = "crucible.db")]
        db: String,

        #[command(subcommand)]
        action: KeyAction,
    },

    /// Print service statistics.
    Stats {
        #[arg(long, default_value = "crucible.db")]
        db: String,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Register a key.
    Add {
        key: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List registered keys.
    List,
    /// Delete a key.
    Revoke { key: String },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Commands::Serve {
            port,
            db,
            runtime_socket,
            project_label,
            deadline_ms,
            output_cap_bytes,
            image,
            memory_limit_bytes,
            cpu_weight,
        } => {
            let config = Config {
                listen_port: port,
                db_path: db,
                runtime_socket,
                project_label,
                deadline_ms,
                output_cap_bytes,
                sandbox_image: image,
                memory_limit_bytes,
                cpu_weight,
            };
            serve(config).await
        }
        Commands::Key { db, action } => key_command(&db, action),
        Commands::Stats { db } => stats_command(&db),
    }
}

async fn serve(config: Config) -> Result<()> {
    let store = Arc::new(JobStore::open(&config.db_path).context("failed to open job store")?);
    let runtime = Arc::new(DockerRuntime::connect(&config.runtime_socket)?);
    let config = Arc::new(config);

    let engine = Supervisor::new(store.clone(), runtime, config.clone());

    // Reconcile leftovers from a previous process before taking traffic.
    engine.sweep().await.context("startup sweep failed")?;

    let state = AppState {
        store,
        engine,
        config: config.clone(),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.listen_port))?;
    log::info!(
        "crucible listening on port {} (image {}, deadline {} ms)",
        config.listen_port,
        config.sandbox_image,
        config.deadline_ms
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        log::info!("shutdown requested");
    }
}

// ============================================================================
// 3. ADMIN COMMANDS (pure database operations)
// ============================================================================

fn key_command(db: &str, action: KeyAction) -> Result<()> {
    let store = JobStore::open(db).context("failed to open job store")?;
    match action {
        KeyAction::Add { key, description } => {
            store.add_key(&key, &description)?;
            println!("added key {key}");
        }
        KeyAction::List => {
            let keys = store.list_keys()?;
            if keys.is_empty() {
                println!("no keys registered");
            }
            for (key, created_at, description) in keys {
                println!("{key}  created {created_at}  {description}");
            }
        }
        KeyAction::Revoke { key } => {
            if store.revoke_key(&key)? {
                println!("revoked key {key}");
            } else {
                println!("key {key} was not registered");
            }
        }
    }
    Ok(())
}

fn stats_command(db: &str) -> Result<()> {
    let store = JobStore::open(db).context("failed to open job store")?;
    let stats = store.stats()?;
    println!("jobs total:       {}", stats.total_jobs);
    println!("  not_started:    {}", stats.not_started);
    println!("  running:        {}", stats.running);
    println!("  done:           {}", stats.done);
    println!("    crashed:      {}", stats.crashed);
    println!("    timed out:    {}", stats.timed_out);
    println!("api keys:         {}", stats.api_keys);
    Ok(())
}
