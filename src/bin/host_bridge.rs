//! Headless host bridge binary for stdin/stdout JSON communication.
//!
//! This binary reads `CommandEnvelope` messages as newline-delimited JSON
//! from stdin, dispatches them to the arbiter and offline queue, and writes
//! `ResponseEnvelope` and `EventEnvelope` messages to stdout.
//!
//! Tasks and geofences live in memory; pending snoozes, the offline queue and
//! handoff keys persist in the configured state file.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use attend::arbiter::Arbiter;
use attend::collaborators::Collaborators;
use attend::config::AttendConfig;
use attend::host::handler::HostHandler;
use attend::host::stdio::run_stdio_bridge;
use attend::memory::{ChannelPresenter, InMemoryGeofenceStore, InMemoryTaskStore};
use attend::queue::{OfflineQueue, RetryPolicy};
use attend::storage::FileKeyValueStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Event broadcast channel capacity for the stdio bridge.
const EVENT_CAPACITY: usize = 128;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing to stderr only (stdout is reserved for the JSON
    // protocol).
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("attend=info")),
        )
        .init();

    let config_path = std::env::var_os("ATTEND_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(AttendConfig::default_config_path);
    let config = AttendConfig::load_or_default(&config_path)
        .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", config_path.display()))?;
    let state_file = config.storage.resolved_state_file();
    tracing::info!(
        config = %config_path.display(),
        state = %state_file.display(),
        "attend-host starting"
    );

    let kv = Arc::new(FileKeyValueStore::new(state_file));
    let tasks = Arc::new(InMemoryTaskStore::new());
    let geofences = Arc::new(InMemoryGeofenceStore::new());
    let (presenter, prompts) = ChannelPresenter::new();

    let arbiter = Arc::new(Arbiter::new(
        &config,
        Collaborators {
            tasks: tasks.clone(),
            geofences: geofences.clone(),
            presenter: Arc::new(presenter),
            kv: kv.clone(),
        },
    ));
    let queue = Arc::new(OfflineQueue::new(
        kv,
        tasks,
        geofences,
        RetryPolicy::from(&config.queue),
        false,
    ));
    queue.load().await;

    let handler = Arc::new(HostHandler::new(
        Arc::clone(&arbiter),
        Arc::clone(&queue),
        EVENT_CAPACITY,
    ));
    let forwarders = handler.forward_events(prompts);
    let _expiry = arbiter.spawn_expiry_watcher();

    // Reconcile after forwarders are up so a recovered proposal's prompt
    // reaches the frontend.
    let reconcile_arbiter = Arc::clone(&arbiter);
    tokio::spawn(async move {
        if let Err(e) = reconcile_arbiter.reconcile().await {
            tracing::warn!(error = %e, "handoff reconciliation failed");
        }
    });

    let result = run_stdio_bridge(handler).await;
    for handle in forwarders {
        handle.abort();
    }

    result.map_err(|e| {
        tracing::error!(error = %e, "attend-host exited with error");
        anyhow::anyhow!("attend-host failed: {e}")
    })?;

    tracing::info!("attend-host shut down cleanly");
    Ok(())
}
