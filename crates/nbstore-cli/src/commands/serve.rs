//! Serve command: JSON lines over stdio
//!
//! Each stdin line is one request, the command fields plus a caller-chosen
//! `seq`:
//!
//! ```json
//! {"seq": 1, "method": "getDoc", "id": "@peer(local);@type(workspace);@id(ws-1);", "docId": "d1"}
//! ```
//!
//! Each request is answered by one stdout line, `{"seq": 1, "ok": ...}` or
//! `{"seq": 1, "error": "..."}`. Requests run concurrently, so answers may
//! come back out of order. Status events are written as `{"event": {...}}`
//! lines. EOF or Ctrl-C shuts the registry down.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use nbstore_core::{dispatch, Command, Response, StatusEvent, StoreRegistry};

#[derive(Deserialize)]
struct Request {
    #[serde(default)]
    seq: Option<u64>,
    #[serde(flatten)]
    command: Command,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Reply {
    Ok { seq: Option<u64>, ok: Response },
    Err { seq: Option<u64>, error: String },
}

#[derive(Serialize)]
struct EventLine<'a> {
    event: &'a StatusEvent,
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Run the protocol loop until stdin closes or Ctrl-C
pub async fn run(registry: Arc<StoreRegistry>) -> Result<()> {
    let stdout: SharedWriter = Arc::new(Mutex::new(Box::new(tokio::io::stdout())));

    let mut subscription = registry.subscribe();
    let events_out = Arc::clone(&stdout);
    let events = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            match serde_json::to_string(&EventLine { event: &event }) {
                Ok(line) => {
                    if let Err(e) = write_line(&events_out, &line).await {
                        warn!(error = %e, "failed to write status event");
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode status event"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("serving on stdio");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read request")? else {
                    debug!("stdin closed");
                    break;
                };
                let registry = Arc::clone(&registry);
                let out = Arc::clone(&stdout);
                in_flight.spawn(async move {
                    if let Some(reply) = handle_line(&registry, &line).await {
                        if let Err(e) = write_line(&out, &reply).await {
                            warn!(error = %e, "failed to write reply");
                        }
                    }
                });
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "request task failed");
        }
    }

    registry.shutdown().await;
    if let Err(e) = events.await {
        warn!(error = %e, "event writer failed");
    }
    Ok(())
}

/// Answer one request line; blank lines get no answer
async fn handle_line(registry: &StoreRegistry, line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let reply = match parse_request(line) {
        Ok(Request { seq, command }) => match dispatch(registry, command).await {
            Ok(ok) => Reply::Ok { seq, ok },
            Err(e) => Reply::Err {
                seq,
                error: e.to_string(),
            },
        },
        Err((seq, error)) => Reply::Err { seq, error },
    };

    match serde_json::to_string(&reply) {
        Ok(encoded) => Some(encoded),
        Err(e) => Some(format!("{{\"error\": \"failed to encode reply: {}\"}}", e)),
    }
}

/// Decode a request, keeping its `seq` when only the command is malformed
fn parse_request(line: &str) -> Result<Request, (Option<u64>, String)> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| (None, format!("invalid JSON: {}", e)))?;
    let seq = value.get("seq").and_then(serde_json::Value::as_u64);
    serde_json::from_value(value).map_err(|e| (seq, format!("invalid request: {}", e)))
}

async fn write_line(out: &SharedWriter, line: &str) -> std::io::Result<()> {
    let mut out = out.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
