use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use runlink_protocol::{Envelope, command, event};
use serde_json::{Map, Value};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::display::{DisplayInfo, DisplayProvider, LocalDisplays};
use crate::error::RunError;
use crate::ids::IdAllocator;
use crate::output::PumpConfig;
use crate::privilege;
use crate::process::{ProcessCallbacks, ProcessContext, ProcessHandler, Runner, StartOptions};
use crate::watchdog::Watchdog;

/// Kind of link a run manager serves. Selects output pacing and whether an
/// idle watchdog guards the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Bluetooth,
}

impl TransportKind {
    pub fn pump_config(self) -> PumpConfig {
        match self {
            TransportKind::WebSocket => PumpConfig::websocket(),
            TransportKind::Bluetooth => PumpConfig::bluetooth(),
        }
    }

    fn uses_watchdog(self) -> bool {
        matches!(self, TransportKind::Bluetooth)
    }
}

/// Daemon-wide settings handed to every run manager.
#[derive(Clone)]
pub struct RunSettings {
    pub ids: Arc<IdAllocator>,
    pub ipc_dir: PathBuf,
    pub scratch_dir: PathBuf,
    /// User programs run as when a start command names none.
    pub run_as_user: Option<String>,
    pub display: Arc<dyn DisplayProvider>,
    pub stop_grace: Duration,
    pub watchdog_timeout: Duration,
}

impl RunSettings {
    pub fn new(ids: Arc<IdAllocator>, ipc_dir: PathBuf, scratch_dir: PathBuf) -> Self {
        Self {
            ids,
            ipc_dir,
            scratch_dir,
            run_as_user: None,
            display: Arc::new(LocalDisplays::new()),
            stop_grace: Duration::from_secs(1),
            watchdog_timeout: Duration::from_secs(30),
        }
    }
}

type HandlerMap = Mutex<HashMap<String, Arc<ProcessHandler>>>;

/// Serves one client connection: dispatches its commands to process
/// handlers and emits their events on `outbound`.
pub struct RunManager {
    client_id: String,
    transport: TransportKind,
    ctx: Arc<ProcessContext>,
    run_as_user: Option<String>,
    handlers: Arc<HandlerMap>,
    outbound: mpsc::UnboundedSender<Envelope>,
    watchdog: Option<Watchdog>,
    idle: Arc<Notify>,
}

impl RunManager {
    pub fn new(
        client_id: impl Into<String>,
        transport: TransportKind,
        settings: &RunSettings,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let mut ctx = ProcessContext::new(
            Arc::clone(&settings.ids),
            settings.ipc_dir.clone(),
            settings.scratch_dir.clone(),
        );
        ctx.display = Arc::clone(&settings.display);
        ctx.pump = transport.pump_config();
        ctx.stop_grace = settings.stop_grace;

        let handlers: Arc<HandlerMap> = Arc::new(Mutex::new(HashMap::new()));
        let idle = Arc::new(Notify::new());
        let client_id = client_id.into();

        let watchdog = transport.uses_watchdog().then(|| {
            let dog = Watchdog::new(settings.watchdog_timeout);
            let handlers = Arc::downgrade(&handlers);
            let idle = Arc::clone(&idle);
            let client = client_id.clone();
            dog.start(Arc::new(move || {
                warn!(client = %client, "no ping from client, closing");
                let handlers = handlers.clone();
                let idle = Arc::clone(&idle);
                tokio::spawn(async move {
                    if let Some(handlers) = handlers.upgrade() {
                        stop_all(&handlers).await;
                    }
                    idle.notify_one();
                });
            }));
            dog
        });

        Self {
            client_id,
            transport,
            ctx: Arc::new(ctx),
            run_as_user: settings.run_as_user.clone(),
            handlers,
            outbound,
            watchdog,
            idle,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn process_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    /// Resolves once the watchdog gave up on the client and stopped its
    /// processes. The transport should close the connection then.
    pub async fn idle_timeout(&self) {
        self.idle.notified().await;
    }

    /// Decode and dispatch one message. Every failure becomes an `error`
    /// event; nothing here ends the connection.
    pub async fn handle_message(&self, raw: &str) {
        let message = match Envelope::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(client = %self.client_id, "undecodable message: {e}");
                self.emit(Envelope::new(
                    event::ERROR,
                    error_data("Bad message"),
                    "",
                    None,
                ));
                return;
            }
        };

        if let Err(err) = self.dispatch(&message).await {
            let text = if err.is_client_error() {
                debug!(client = %message.client, process = ?message.process, kind = %message.kind, "rejected: {err}");
                "Bad message"
            } else {
                warn!(client = %message.client, process = ?message.process, kind = %message.kind, "command failed: {err}");
                "Error"
            };
            self.emit(message.reply(event::ERROR, error_data(text)));
        }
    }

    pub async fn dispatch(&self, message: &Envelope) -> Result<(), RunError> {
        match message.kind.as_str() {
            command::PING => {
                if let Some(watchdog) = &self.watchdog {
                    watchdog.restart();
                }
                self.emit(message.reply(event::PONG, Map::new()));
                Ok(())
            }
            command::START => self.start(message).await,
            command::STDIN => {
                let input = message
                    .str_field("input")
                    .ok_or_else(|| RunError::bad_message("stdin needs data.input"))?;
                self.handler(message)?.send_input(input).await
            }
            command::RESIZE => {
                let (Some(rows), Some(cols)) = (message.u16_field("rows"), message.u16_field("cols")) else {
                    return Err(RunError::bad_message("resize needs data.rows and data.cols"));
                };
                self.handler(message)?.resize_pty(rows, cols)
            }
            command::STOP => self.handler(message)?.stop().await,
            command::KEYEVENT => {
                let (Some(key), Some(key_event)) = (message.str_field("key"), message.str_field("event")) else {
                    return Err(RunError::bad_message("keyevent needs data.key and data.event"));
                };
                self.handler(message)?.send_key_event(key, key_event).await
            }
            other => Err(RunError::bad_message(format!("unknown command {other:?}"))),
        }
    }

    async fn start(&self, message: &Envelope) -> Result<(), RunError> {
        let process = process_id(message)?;
        let runner = message
            .str_field("runner")
            .and_then(Runner::parse)
            .ok_or_else(|| RunError::bad_message("start needs a known data.runner"))?;
        if lock(&self.handlers).contains_key(process) {
            return Err(RunError::bad_message(format!("process {process} already exists")));
        }

        let opts = StartOptions {
            runner,
            code: message.str_field("code").map(str::to_string),
            path: message.str_field("path").map(PathBuf::from),
            work_dir: None,
            env: Vec::new(),
            pty: message.bool_field("pty").unwrap_or(false),
            novnc: message.bool_field("novnc").unwrap_or(false),
        };
        let user = match message.str_field("user").or(self.run_as_user.as_deref()) {
            Some(name) => privilege::resolve_target_user(name)?,
            None => None,
        };

        let callbacks = Arc::new(HandlerEvents {
            client: message.client.clone(),
            process: process.to_string(),
            handler_id: OnceLock::new(),
            handlers: Arc::downgrade(&self.handlers),
            outbound: self.outbound.clone(),
        });
        let handler = Arc::new(ProcessHandler::new(
            Arc::clone(&self.ctx),
            Arc::clone(&callbacks) as Arc<dyn ProcessCallbacks>,
            user,
        )?);
        let _ = callbacks.handler_id.set(handler.id());

        {
            let mut handlers = lock(&self.handlers);
            if handlers.contains_key(process) {
                return Err(RunError::bad_message(format!("process {process} already exists")));
            }
            handlers.insert(process.to_string(), Arc::clone(&handler));
        }

        if let Err(e) = handler.start(opts).await {
            remove_handler(&self.handlers, process, handler.id());
            return Err(e);
        }
        info!(client = %message.client, process, process_id = handler.id(), "started");
        Ok(())
    }

    fn handler(&self, message: &Envelope) -> Result<Arc<ProcessHandler>, RunError> {
        let process = process_id(message)?;
        lock(&self.handlers)
            .get(process)
            .cloned()
            .ok_or_else(|| RunError::invalid_operation(format!("no process {process}")))
    }

    fn emit(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            debug!(client = %self.client_id, "connection gone, event dropped");
        }
    }

    /// Stop everything still running. Called when the connection closes.
    pub async fn shutdown(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.cancel();
        }
        stop_all(&self.handlers).await;
    }
}

fn process_id(message: &Envelope) -> Result<&str, RunError> {
    message
        .process
        .as_deref()
        .filter(|process| !process.is_empty())
        .ok_or_else(|| RunError::bad_message(format!("{} needs a process id", message.kind)))
}

async fn stop_all(handlers: &HandlerMap) {
    let running: Vec<_> = lock(handlers).values().cloned().collect();
    let results = join_all(running.iter().map(|handler| handler.stop())).await;
    for (handler, result) in running.iter().zip(results) {
        match result {
            Ok(()) | Err(RunError::InvalidOperation(_)) => {}
            Err(e) => warn!(process_id = handler.id(), "stop on shutdown failed: {e}"),
        }
    }
}

/// Remove `process` unless it has been replaced by a newer handler.
fn remove_handler(handlers: &HandlerMap, process: &str, handler_id: u32) {
    let mut handlers = lock(handlers);
    if handlers.get(process).is_some_and(|h| h.id() == handler_id) {
        handlers.remove(process);
    }
}

fn lock(handlers: &HandlerMap) -> MutexGuard<'_, HashMap<String, Arc<ProcessHandler>>> {
    handlers.lock().unwrap_or_else(|e| e.into_inner())
}

fn error_data(message: &str) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("message".to_string(), Value::from(message));
    data
}

/// Turns handler callbacks into envelopes for the handler's client.
struct HandlerEvents {
    client: String,
    process: String,
    /// Set right after the handler reserves its id, before it starts.
    handler_id: OnceLock<u32>,
    handlers: Weak<HandlerMap>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl HandlerEvents {
    fn send(&self, kind: &str, data: Map<String, Value>) {
        let envelope = Envelope::new(kind, data, self.client.clone(), Some(self.process.clone()));
        if self.outbound.send(envelope).is_err() {
            debug!(process = %self.process, kind, "connection gone, event dropped");
        }
    }
}

impl ProcessCallbacks for HandlerEvents {
    fn on_start(&self) {
        self.send(event::STARTED, Map::new());
    }

    fn on_stop(&self, exit_code: i32) {
        if let (Some(handlers), Some(id)) = (self.handlers.upgrade(), self.handler_id.get()) {
            remove_handler(&handlers, &self.process, *id);
        }
        let mut data = Map::new();
        data.insert("exitCode".to_string(), Value::from(exit_code));
        self.send(event::STOPPED, data);
    }

    fn on_output(&self, channel: &str, text: String) {
        let mut data = Map::new();
        data.insert("output".to_string(), Value::String(text));
        self.send(channel, data);
    }

    fn on_display_activity(&self, info: &DisplayInfo) {
        let mut data = Map::new();
        data.insert("port".to_string(), Value::from(info.port));
        data.insert("path".to_string(), Value::String(info.path.clone()));
        self.send(event::NOVNC, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_selects_pacing() {
        assert_eq!(TransportKind::WebSocket.pump_config(), PumpConfig::websocket());
        assert_eq!(TransportKind::Bluetooth.pump_config().max_chunks, 10);
        assert!(TransportKind::Bluetooth.uses_watchdog());
        assert!(!TransportKind::WebSocket.uses_watchdog());
    }

    #[test]
    fn empty_process_id_is_rejected() {
        let message = Envelope::new(command::STOP, Map::new(), "c", Some(String::new()));
        assert!(matches!(process_id(&message), Err(RunError::BadMessage(_))));
        let message = Envelope::new(command::STOP, Map::new(), "c", Some("p".to_string()));
        assert_eq!(process_id(&message).unwrap(), "p");
    }

    #[tokio::test]
    async fn websocket_managers_have_no_watchdog() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RunSettings::new(
            Arc::new(IdAllocator::new(2)),
            dir.path().to_path_buf(),
            dir.path().join("scratch"),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = RunManager::new("c", TransportKind::WebSocket, &settings, tx);
        assert!(manager.watchdog.is_none());
        assert_eq!(manager.client_id(), "c");
        assert_eq!(manager.transport(), TransportKind::WebSocket);
    }
}
