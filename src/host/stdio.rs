//! Stdin/stdout JSON bridge for the host command handler.
//!
//! Reads newline-delimited JSON `CommandEnvelope` messages, dispatches them
//! through [`HostHandler`], and writes `ResponseEnvelope` and `EventEnvelope`
//! messages as newline-delimited JSON.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use crate::error::Result;
use crate::host::contract::{CommandEnvelope, CommandName, ResponseEnvelope};
use crate::host::handler::HostHandler;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;

/// Run the bridge on the process's stdin and stdout.
pub async fn run_stdio_bridge(handler: Arc<HostHandler>) -> Result<()> {
    run_bridge(
        handler,
        BufReader::new(tokio::io::stdin()),
        BufWriter::new(tokio::io::stdout()),
    )
    .await
}

/// Run the bridge until `input` closes or a `runtime.stop` command arrives.
///
/// Events are forwarded concurrently with command handling; both share the
/// output writer so lines never interleave.
pub async fn run_bridge<R, W>(handler: Arc<HostHandler>, input: R, output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(output));

    let event_writer = Arc::clone(&writer);
    let mut event_rx = handler.subscribe_events();
    let event_handle = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event_envelope) => match serde_json::to_string(&event_envelope) {
                    Ok(json) => {
                        let mut w = event_writer.lock().await;
                        if let Err(e) = write_line(&mut *w, &json).await {
                            tracing::warn!(
                                error = %e,
                                "failed to write event envelope; stopping event forwarder"
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize event envelope; skipping");
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::info!("event broadcast channel closed; stopping event forwarder");
                    break;
                }
            }
        }
    });

    let reader_result = run_reader(&handler, input, Arc::clone(&writer)).await;

    event_handle.abort();
    let _ = event_handle.await;

    reader_result
}

/// Read line-by-line, dispatch each command, and write responses.
async fn run_reader<R, W>(handler: &HostHandler, mut reader: R, writer: Arc<Mutex<W>>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        // EOF
        if bytes_read == 0 {
            tracing::info!("input closed (EOF); shutting down host bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw_line = %trimmed,
                    "failed to parse command envelope"
                );
                let error_response = ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                );
                let json = serde_json::to_string(&error_response)?;
                let mut w = writer.lock().await;
                write_line(&mut *w, &json).await?;
                continue;
            }
        };

        let is_stop = envelope.command == CommandName::RuntimeStop;
        let response = handler.handle(envelope).await;
        let json = serde_json::to_string(&response)?;

        {
            let mut w = writer.lock().await;
            write_line(&mut *w, &json).await?;
        }

        if is_stop {
            tracing::info!("runtime.stop received; shutting down host bridge");
            break;
        }
    }

    Ok(())
}

/// Write a single JSON line and flush.
async fn write_line<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, json: &str) -> Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::arbiter::Arbiter;
    use crate::collaborators::Collaborators;
    use crate::config::AttendConfig;
    use crate::host::contract::EVENT_VERSION;
    use crate::memory::{ChannelPresenter, InMemoryGeofenceStore, InMemoryTaskStore};
    use crate::queue::{OfflineQueue, RetryPolicy};
    use crate::storage::MemoryKeyValueStore;
    use tokio::io::AsyncReadExt;

    fn handler() -> Arc<HostHandler> {
        let tasks = Arc::new(InMemoryTaskStore::new());
        let geofences = Arc::new(InMemoryGeofenceStore::new());
        let kv = Arc::new(MemoryKeyValueStore::new());
        let (presenter, _prompts) = ChannelPresenter::new();
        let arbiter = Arbiter::new(
            &AttendConfig::default(),
            Collaborators {
                tasks: tasks.clone(),
                geofences: geofences.clone(),
                presenter: Arc::new(presenter),
                kv: kv.clone(),
            },
        );
        let queue = OfflineQueue::new(kv, tasks, geofences, RetryPolicy::default(), false);
        Arc::new(HostHandler::new(Arc::new(arbiter), Arc::new(queue), 16))
    }

    async fn run_lines(input: &'static str) -> Vec<serde_json::Value> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        run_bridge(handler(), BufReader::new(input.as_bytes()), server)
            .await
            .unwrap();
        let mut raw = String::new();
        // The bridge dropped its end; read until EOF.
        client.read_to_string(&mut raw).await.unwrap();
        raw.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn responses_follow_commands_in_order() {
        let lines = run_lines(concat!(
            r#"{"v":1,"request_id":"a","command":"runtime.status"}"#,
            "\n\n",
            r#"{"v":1,"request_id":"b","command":"slot.pause"}"#,
            "\n",
        ))
        .await;
        let ids: Vec<&str> = lines
            .iter()
            .filter_map(|l| l["request_id"].as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(lines[1]["payload"]["changed"], false);
    }

    #[tokio::test]
    async fn malformed_line_yields_parse_error() {
        let lines = run_lines("not json\n").await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["request_id"], "parse-error");
        assert_eq!(lines[0]["ok"], false);
        assert_eq!(lines[0]["v"], EVENT_VERSION);
    }

    #[tokio::test]
    async fn runtime_stop_ends_the_bridge() {
        let lines = run_lines(concat!(
            r#"{"v":1,"request_id":"s","command":"runtime.stop"}"#,
            "\n",
            r#"{"v":1,"request_id":"never","command":"runtime.status"}"#,
            "\n",
        ))
        .await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["payload"]["stopping"], true);
    }
}
