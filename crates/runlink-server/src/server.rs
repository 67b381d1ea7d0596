use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use librunlink::{ChunkAssembler, ChunkSplitter, RunManager, RunSettings, TransportKind};
use runlink_protocol::Envelope;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;

/// How long a closing connection waits for its last events to be written.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    settings: RunSettings,
}

/// How envelopes travel over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// One JSON envelope per text frame.
    Text,
    /// Envelopes split into chunk records, one per binary frame, paced for
    /// bridges to MTU-limited links.
    Chunked,
}

impl Framing {
    fn transport(self) -> TransportKind {
        match self {
            Framing::Text => TransportKind::WebSocket,
            Framing::Chunked => TransportKind::Bluetooth,
        }
    }
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("failed to create work dir {}", config.work_dir.display()))?;
    std::fs::create_dir_all(&config.ipc_dir)
        .with_context(|| format!("failed to create ipc dir {}", config.ipc_dir.display()))?;

    let app = router(config.run_settings());
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    info!(
        listen = %config.listen,
        max_processes = config.max_processes,
        run_as = config.run_as_user.as_deref().unwrap_or("-"),
        "runlink server started"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down...");
        })
        .await?;
    Ok(())
}

fn router(settings: RunSettings) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/exec", get(exec_text))
        .route("/exec/chunked", get(exec_chunked))
        .with_state(Arc::new(AppState { settings }))
}

async fn status() -> &'static str {
    "OK"
}

async fn exec_text(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(socket, state, Framing::Text))
}

async fn exec_chunked(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(socket, state, Framing::Chunked))
}

async fn serve_connection(socket: WebSocket, state: Arc<AppState>, framing: Framing) {
    let client_id = Uuid::new_v4().to_string();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let manager = RunManager::new(client_id.clone(), framing.transport(), &state.settings, events_tx);
    let (ws_tx, mut ws_rx) = socket.split();
    info!(client = %client_id, ?framing, "client connected");

    let mut writer = tokio::spawn(write_events(ws_tx, events_rx, framing));
    let mut assembler = ChunkAssembler::new();

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let Some(frame) = frame else {
                    break;
                };
                match frame {
                    Ok(Message::Text(text)) => manager.handle_message(text.as_str()).await,
                    Ok(Message::Binary(bytes)) if framing == Framing::Chunked => {
                        match assembler.push(&bytes) {
                            Ok(Some(text)) => manager.handle_message(&text).await,
                            Ok(None) => {}
                            Err(e) => debug!(client = %client_id, "dropped chunked message: {e}"),
                        }
                    }
                    Ok(Message::Binary(_)) => debug!(client = %client_id, "ignoring binary frame"),
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Ping(_) | Message::Pong(_)) => {}
                    Err(e) => {
                        debug!(client = %client_id, "websocket read error: {e}");
                        break;
                    }
                }
            }
            _ = manager.idle_timeout() => break,
            _ = &mut writer => {
                debug!(client = %client_id, "websocket writer closed");
                break;
            }
        }
    }

    manager.shutdown().await;
    drop(manager);
    if !writer.is_finished() && tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!(client = %client_id, "pending events not delivered before close");
        writer.abort();
    }
    info!(client = %client_id, "client disconnected");
}

/// Forward envelopes until every sender is gone or the socket fails.
async fn write_events(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut events: mpsc::UnboundedReceiver<Envelope>,
    framing: Framing,
) {
    let mut splitter = ChunkSplitter::new();
    while let Some(envelope) = events.recv().await {
        let text = envelope.encode();
        let sent = match framing {
            Framing::Text => ws_tx.send(Message::Text(text.into())).await.is_ok(),
            Framing::Chunked => {
                let mut ok = true;
                for record in splitter.split(text.as_bytes()) {
                    if ws_tx.send(Message::Binary(record.into())).await.is_err() {
                        ok = false;
                        break;
                    }
                }
                ok
            }
        };
        if !sent {
            return;
        }
    }
    let _ = ws_tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use librunlink::IdAllocator;
    use runlink_protocol::ChunkedMessage;
    use serde_json::{Value, json};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    const WAIT: Duration = Duration::from_secs(15);

    async fn spawn_server() -> (String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = RunSettings::new(
            Arc::new(IdAllocator::new(4)),
            dir.path().to_path_buf(),
            dir.path().join("scratch"),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(settings)).await.unwrap();
        });
        (addr.to_string(), dir)
    }

    fn command(kind: &str, process: Option<&str>, data: Value) -> String {
        json!({"type": kind, "data": data, "client": "web", "process": process}).to_string()
    }

    #[tokio::test]
    async fn status_reports_ok() {
        let (addr, _dir) = spawn_server().await;
        let body = reqwest::get(format!("http://{addr}/status"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn exec_runs_a_program_over_websocket() {
        let (addr, _dir) = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/exec")).await.unwrap();

        ws.send(WsMessage::Text(command("ping", None, json!({})).into()))
            .await
            .unwrap();
        ws.send(WsMessage::Text(
            command("start", Some("p1"), json!({"runner": "shell", "code": "echo hi"})).into(),
        ))
        .await
        .unwrap();

        let mut kinds = Vec::new();
        let mut stdout = String::new();
        while kinds.last().map(String::as_str) != Some("stopped") {
            let frame = tokio::time::timeout(WAIT, ws.next())
                .await
                .expect("frame before timeout")
                .unwrap()
                .unwrap();
            let envelope = Envelope::decode(frame.to_text().unwrap()).unwrap();
            assert_eq!(envelope.client, "web");
            if envelope.kind == "stdout" {
                stdout.push_str(envelope.str_field("output").unwrap());
            }
            kinds.push(envelope.kind);
        }
        assert_eq!(kinds.first().map(String::as_str), Some("pong"));
        assert!(kinds.contains(&"started".to_string()));
        assert_eq!(stdout, "hi\n");
    }

    #[tokio::test]
    async fn chunked_endpoint_reassembles_both_ways() {
        let (addr, _dir) = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/exec/chunked")).await.unwrap();

        let padding = "#".repeat(1500);
        let code = format!("echo chunked\n{padding}\n");
        let request = command("start", Some("big"), json!({"runner": "shell", "code": code}));
        let outgoing = ChunkedMessage::from_message(7, request.as_bytes());
        let mut records: Vec<_> = outgoing.chunks().map(|chunk| chunk.encode()).collect();
        assert!(records.len() > 1);
        records.reverse();
        for record in records {
            ws.send(WsMessage::Binary(record.into())).await.unwrap();
        }

        let mut assembler = ChunkAssembler::new();
        let mut stdout = String::new();
        loop {
            let frame = tokio::time::timeout(WAIT, ws.next())
                .await
                .expect("frame before timeout")
                .unwrap()
                .unwrap();
            let WsMessage::Binary(bytes) = frame else {
                continue;
            };
            let Some(text) = assembler.push(&bytes).unwrap() else {
                continue;
            };
            let envelope = Envelope::decode(&text).unwrap();
            match envelope.kind.as_str() {
                "stdout" => stdout.push_str(envelope.str_field("output").unwrap()),
                "stopped" => break,
                "error" => panic!("unexpected error event: {text}"),
                _ => {}
            }
        }
        assert_eq!(stdout, "chunked\n");
    }
}
