//! Host agent — connects the desktop outbound to the relay so mobile
//! clients can reach its terminals from outside the network.
//!
//! Protocol:
//! 1. Connect to `<relay>/connect/<device_id>?type=host`
//! 2. Send `{ "type": "register", "payload": { device_id, device_name } }`
//! 3. Dispatch relayed mobile requests into the PTY manager:
//!    `session_create`, `terminal_input`, `terminal_resize`,
//!    `session_close`, `mobile_disconnect`, `workspace_list`
//! 4. Forward PTY output back as `terminal_output` addressed `to` the
//!    owning mobile; child exit becomes a `session_close` notice
//! 5. On disconnect: tear down all sessions, reconnect with exponential
//!    backoff (2s → 4s → 8s … max 60s)

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::credentials::{generate_session_id, is_valid_device_id};
use crate::room::message::{Envelope, MessageType};
use crate::terminal::{RemotePtyManager, SessionSpec};

/// Outbound frames buffered toward the relay before PTY readers stall.
const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Relay base URL, e.g. `wss://relay.example` or `ws://127.0.0.1:8787`.
    pub relay_url: String,
    pub device_id: String,
    pub device_name: String,
    /// Directories offered to mobiles as workspaces.
    pub workspaces: Vec<PathBuf>,
    /// Shell override; defaults to `$SHELL` / `/bin/sh` per session.
    pub shell: Option<String>,
}

// ─── Main loop ────────────────────────────────────────────────────────────────

/// Run the host agent until the process is stopped. Reconnects forever.
pub async fn run(config: HostConfig) -> Result<()> {
    if !is_valid_device_id(&config.device_id) {
        anyhow::bail!(
            "device id '{}' must match word-word-NN (e.g. swift-tiger-42)",
            config.device_id
        );
    }

    let url = format!(
        "{}/connect/{}?type=host",
        config.relay_url.trim_end_matches('/'),
        config.device_id
    );
    let mut backoff_secs: u64 = 2;

    loop {
        info!(url = %url, "relay: connecting");

        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                info!(device_id = %config.device_id, "relay: connected");
                backoff_secs = 2;

                let (mut sink, mut stream) = ws_stream.split();

                let register = Envelope::new(
                    MessageType::Register,
                    json!({
                        "device_id": config.device_id,
                        "device_name": config.device_name,
                    }),
                )
                .to_text();
                if let Err(e) = sink.send(Message::Text(register)).await {
                    warn!("relay: failed to send register: {e:#}");
                    sleep_backoff(&mut backoff_secs).await;
                    continue;
                }

                // PTY callbacks and the inbound dispatcher share this
                // channel toward the relay socket.
                let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
                let manager = Arc::new(session_manager(out_tx.clone()));

                tokio::select! {
                    _ = handle_inbound(&mut stream, &config, &manager, &out_tx) => {
                        warn!("relay: inbound stream closed");
                    }
                    _ = handle_outbound(&mut out_rx, &mut sink) => {
                        warn!("relay: outbound sink closed");
                    }
                }

                // Connection gone — every remote session dies with it.
                manager.close_all();
            }
            Err(e) => {
                warn!("relay: connection failed: {e:#}");
            }
        }

        sleep_backoff(&mut backoff_secs).await;
    }
}

/// Build the PTY manager whose callbacks feed the outbound channel.
///
/// The callbacks run on PTY reader threads; `blocking_send` there applies
/// backpressure to a single session's reads without touching the runtime.
fn session_manager(out_tx: mpsc::Sender<String>) -> RemotePtyManager {
    let output_tx = out_tx.clone();
    let exit_tx = out_tx;
    RemotePtyManager::new(
        Arc::new(move |session_id: &str, mobile_id: &str, bytes: &[u8]| {
            let frame = Envelope::new(
                MessageType::TerminalOutput,
                json!({
                    "to": mobile_id,
                    "session_id": session_id,
                    "data": String::from_utf8_lossy(bytes),
                }),
            )
            .to_text();
            let _ = output_tx.blocking_send(frame);
        }),
        Arc::new(move |session_id: &str, mobile_id: &str| {
            let frame = Envelope::new(
                MessageType::SessionClose,
                json!({ "session_id": session_id, "to": mobile_id }),
            )
            .to_text();
            let _ = exit_tx.blocking_send(frame);
        }),
    )
}

// ─── Inbound dispatch ─────────────────────────────────────────────────────────

async fn handle_inbound(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
         + Unpin),
    config: &HostConfig,
    manager: &Arc<RemotePtyManager>,
    out_tx: &mpsc::Sender<String>,
) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        let envelope = match Envelope::parse(&text) {
            Ok(env) => env,
            Err(e) => {
                warn!("relay: unparseable frame: {e:?}");
                continue;
            }
        };
        let payload = envelope.payload.unwrap_or(Value::Null);

        match envelope.msg_type {
            MessageType::Registered => {
                info!("relay: registered with device room");
            }
            MessageType::Pong => trace!("relay: pong"),
            MessageType::MobileConnected => {
                debug!(mobile_id = ?payload.get("mobile_id"), "relay: mobile connected");
            }
            MessageType::Error => {
                warn!(message = ?payload.get("message"), "relay: error event");
            }

            MessageType::WorkspaceList => {
                if out_tx.send(workspace_data(config, &payload)).await.is_err() {
                    break;
                }
            }

            MessageType::SessionCreate => {
                if let Some(reply) = handle_session_create(config, manager, &payload) {
                    if out_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }

            MessageType::TerminalInput => {
                let (Some(session_id), Some(data)) = (
                    payload.get("session_id").and_then(Value::as_str),
                    payload.get("data").and_then(Value::as_str),
                ) else {
                    debug!("relay: terminal_input missing session_id or data");
                    continue;
                };
                if !manager.write(session_id, data.as_bytes()) {
                    debug!(session_id, "relay: input for unknown session dropped");
                }
            }

            MessageType::TerminalResize => {
                let Some(session_id) = payload.get("session_id").and_then(Value::as_str) else {
                    continue;
                };
                let cols = payload.get("cols").and_then(Value::as_u64).unwrap_or(80) as u16;
                let rows = payload.get("rows").and_then(Value::as_u64).unwrap_or(24) as u16;
                manager.resize(session_id, cols, rows);
            }

            MessageType::SessionClose => {
                if let Some(session_id) = payload.get("session_id").and_then(Value::as_str) {
                    manager.close_session(session_id);
                }
            }

            MessageType::MobileDisconnect => {
                if let Some(mobile_id) = payload.get("mobile_id").and_then(Value::as_str) {
                    manager.close_sessions_for_mobile(mobile_id);
                }
            }

            other => debug!(msg_type = ?other, "relay: unexpected frame dropped"),
        }
    }
}

/// Drain the outbound channel and send each frame to the relay WebSocket.
async fn handle_outbound(
    rx: &mut mpsc::Receiver<String>,
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) {
    while let Some(frame) = rx.recv().await {
        if sink.send(Message::Text(frame)).await.is_err() {
            break;
        }
    }
}

// ─── Request handlers ─────────────────────────────────────────────────────────

fn handle_session_create(
    config: &HostConfig,
    manager: &Arc<RemotePtyManager>,
    payload: &Value,
) -> Option<String> {
    let Some(request_from) = payload.get("request_from").and_then(Value::as_str) else {
        warn!("relay: session_create without request_from dropped");
        return None;
    };
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("terminal");
    let cols = payload.get("cols").and_then(Value::as_u64).unwrap_or(80) as u16;
    let rows = payload.get("rows").and_then(Value::as_u64).unwrap_or(24) as u16;
    let cwd = resolve_cwd(config, payload);

    let session_id = generate_session_id();
    let spec = SessionSpec {
        session_id: session_id.clone(),
        mobile_id: request_from.to_string(),
    };
    if !manager.create_session(spec, &cwd, config.shell.as_deref(), cols, rows) {
        warn!(mobile_id = %request_from, "relay: session spawn failed");
        return None;
    }

    Some(
        Envelope::new(
            MessageType::SessionCreated,
            json!({
                "request_to": request_from,
                "session_id": session_id,
                "name": name,
            }),
        )
        .to_text(),
    )
}

/// Working directory for a new session: explicit `cwd`, else the workspace
/// named by `workspace_id`, else the first configured workspace, else home.
fn resolve_cwd(config: &HostConfig, payload: &Value) -> String {
    if let Some(cwd) = payload.get("cwd").and_then(Value::as_str) {
        return cwd.to_string();
    }
    if let Some(workspace_id) = payload.get("workspace_id").and_then(Value::as_str) {
        for path in &config.workspaces {
            if workspace_name(path) == workspace_id {
                return path.display().to_string();
            }
        }
    }
    if let Some(first) = config.workspaces.first() {
        return first.display().to_string();
    }
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

fn workspace_data(config: &HostConfig, payload: &Value) -> String {
    let request_from = payload
        .get("request_from")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let workspaces: Vec<Value> = config
        .workspaces
        .iter()
        .map(|path| {
            json!({
                "id": workspace_name(path),
                "name": workspace_name(path),
                "path": path.display().to_string(),
            })
        })
        .collect();
    Envelope::new(
        MessageType::WorkspaceData,
        json!({ "request_to": request_from, "workspaces": workspaces }),
    )
    .to_text()
}

fn workspace_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn sleep_backoff(backoff_secs: &mut u64) {
    info!("relay: reconnecting in {}s", *backoff_secs);
    tokio::time::sleep(std::time::Duration::from_secs(*backoff_secs)).await;
    *backoff_secs = (*backoff_secs * 2).min(60);
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HostConfig {
        HostConfig {
            relay_url: "ws://127.0.0.1:0".into(),
            device_id: "swift-tiger-42".into(),
            device_name: "laptop".into(),
            workspaces: vec![PathBuf::from("/tmp/projects/api"), PathBuf::from("/tmp/web")],
            shell: None,
        }
    }

    #[test]
    fn cwd_prefers_explicit_then_workspace_then_first() {
        let cfg = config();
        assert_eq!(resolve_cwd(&cfg, &json!({ "cwd": "/opt/x" })), "/opt/x");
        assert_eq!(
            resolve_cwd(&cfg, &json!({ "workspace_id": "web" })),
            "/tmp/web"
        );
        assert_eq!(resolve_cwd(&cfg, &json!({})), "/tmp/projects/api");
    }

    #[test]
    fn workspace_data_echoes_request_from_for_routing() {
        let cfg = config();
        let frame = workspace_data(&cfg, &json!({ "request_from": "m1" }));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "workspace_data");
        assert_eq!(value["payload"]["request_to"], "m1");
        assert_eq!(value["payload"]["workspaces"][1]["id"], "web");
    }

    #[test]
    fn bad_device_id_fails_fast() {
        let mut cfg = config();
        cfg.device_id = "Not A Slug".into();
        let err = tokio_test_block_on(run(cfg)).unwrap_err();
        assert!(err.to_string().contains("device id"));
    }

    fn tokio_test_block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
            .block_on(fut)
    }
}
