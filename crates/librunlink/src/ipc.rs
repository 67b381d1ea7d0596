//! Side channels between the daemon and the programs it runs.
//!
//! Each channel is a Unix socket at `{dir}/{pgid}.{channel}.sock`. Messages are
//! whitespace-separated tokens terminated by the token `end<channel>`, so a
//! message on the `video` channel is written as `<payload> endvideo `.
//! A payload that itself contains the token `end<channel>` is split there
//! into two messages; there is no escaping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use runlink_protocol::paths::ipc_socket_path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::error::RunError;

/// Callback receiving one complete message from a side channel.
pub type MessageFn = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

pub fn sentinel(channel: &str) -> String {
    format!("end{channel}")
}

/// Wire form of one message.
pub fn frame(channel: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + channel.len() + 5);
    out.extend_from_slice(payload);
    out.push(b' ');
    out.extend_from_slice(sentinel(channel).as_bytes());
    out.push(b' ');
    out
}

/// Splits a byte stream into messages. Tokens and sentinels may straddle
/// reads; an unterminated token is kept until the next read completes it.
#[derive(Debug)]
pub struct MessageSplitter {
    sentinel: Vec<u8>,
    tokens: Vec<Vec<u8>>,
    partial: Vec<u8>,
}

impl MessageSplitter {
    pub fn new(channel: &str) -> Self {
        Self {
            sentinel: sentinel(channel).into_bytes(),
            tokens: Vec::new(),
            partial: Vec::new(),
        }
    }

    /// Feed one read; returns the messages it completed, tokens joined by a
    /// single space.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        for &byte in data {
            if byte.is_ascii_whitespace() {
                self.end_token(&mut messages);
            } else {
                self.partial.push(byte);
            }
        }
        messages
    }

    fn end_token(&mut self, messages: &mut Vec<Vec<u8>>) {
        if self.partial.is_empty() {
            return;
        }
        let token = std::mem::take(&mut self.partial);
        if token == self.sentinel {
            messages.push(self.tokens.join(&b' '));
            self.tokens.clear();
        } else {
            self.tokens.push(token);
        }
    }
}

/// Listening end of one channel. Dropping it stops accepting, closes open
/// connections and removes the socket file.
#[derive(Debug)]
pub struct IpcServer {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl IpcServer {
    pub fn bind(
        dir: &Path,
        pgid: i32,
        channel: &str,
        on_message: MessageFn,
    ) -> Result<Self, RunError> {
        let path = ipc_socket_path(dir, pgid, channel);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        debug!(socket = %path.display(), channel, "side channel listening");
        let task = tokio::spawn(accept_loop(listener, channel.to_string(), on_message));
        Ok(Self { path, task })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(socket = %self.path.display(), error = %e, "could not remove socket");
            }
        }
    }
}

async fn accept_loop(listener: UnixListener, channel: String, on_message: MessageFn) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    connections.spawn(read_messages(
                        stream,
                        MessageSplitter::new(&channel),
                        Arc::clone(&on_message),
                    ));
                }
                Err(e) => {
                    warn!(channel = %channel, "side channel accept error: {e}");
                    return;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn read_messages(mut stream: UnixStream, mut splitter: MessageSplitter, on_message: MessageFn) {
    let mut buf = vec![0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                for message in splitter.feed(&buf[..n]) {
                    on_message(message);
                }
            }
            Err(e) => {
                debug!("side channel read error: {e}");
                return;
            }
        }
    }
}

/// Outgoing side-channel connections, opened lazily and reused.
#[derive(Debug)]
pub struct IpcClients {
    dir: PathBuf,
    retry_delay: Duration,
    connections: Mutex<HashMap<(i32, String), UnixStream>>,
}

impl IpcClients {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retry_delay: Duration::from_millis(100),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Send one message to `pgid`'s `channel` server. Delivery is best
    /// effort: failures are logged and the message is dropped.
    pub async fn send(&self, pgid: i32, channel: &str, payload: &[u8]) -> bool {
        let framed = frame(channel, payload);
        let key = (pgid, channel.to_string());
        let mut connections = self.connections.lock().await;

        if let Some(stream) = connections.get_mut(&key) {
            if stream.write_all(&framed).await.is_ok() {
                return true;
            }
            connections.remove(&key);
        }

        let mut stream = match self.connect(pgid, channel).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(pgid, channel, "side channel unavailable, message dropped: {e}");
                return false;
            }
        };
        if let Err(e) = stream.write_all(&framed).await {
            warn!(pgid, channel, "side channel write failed, message dropped: {e}");
            return false;
        }
        connections.insert(key, stream);
        true
    }

    /// The program may not be listening yet right after start; try once more.
    async fn connect(&self, pgid: i32, channel: &str) -> std::io::Result<UnixStream> {
        let path = ipc_socket_path(&self.dir, pgid, channel);
        match UnixStream::connect(&path).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!(socket = %path.display(), "connect failed, retrying: {e}");
                tokio::time::sleep(self.retry_delay).await;
                UnixStream::connect(&path).await
            }
        }
    }

    /// Drop cached connections to a process group that has exited.
    pub async fn forget(&self, pgid: i32) {
        self.connections
            .lock()
            .await
            .retain(|(owner, _), _| *owner != pgid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn splitter_handles_tokens_split_across_reads() {
        let mut splitter = MessageSplitter::new("video");
        assert!(splitter.feed(b"abc de").is_empty());
        assert!(splitter.feed(b"f endvi").is_empty());
        let messages = splitter.feed(b"deo next endvideo ");
        assert_eq!(messages, vec![b"abc def".to_vec(), b"next".to_vec()]);
    }

    #[test]
    fn splitter_ignores_other_channels_sentinels() {
        let mut splitter = MessageSplitter::new("keylisten");
        let messages = splitter.feed(b"a endvideo b endkeylisten\n");
        assert_eq!(messages, vec![b"a endvideo b".to_vec()]);
    }

    #[test]
    fn sentinel_inside_payload_splits_the_message() {
        let mut splitter = MessageSplitter::new("video");
        let messages = splitter.feed(&frame("video", b"left endvideo right"));
        assert_eq!(messages, vec![b"left".to_vec(), b"right".to_vec()]);
    }

    #[test]
    fn empty_message_is_delivered() {
        let mut splitter = MessageSplitter::new("video");
        assert_eq!(splitter.feed(b"  endvideo "), vec![Vec::<u8>::new()]);
    }

    #[tokio::test]
    async fn server_receives_client_messages() {
        let dir = tempfile::tempdir().unwrap();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let server = IpcServer::bind(
            dir.path(),
            77,
            "keyevent",
            Arc::new(move |msg| {
                sink.lock().unwrap().push(msg);
                let _ = tx.send(());
            }),
        )
        .unwrap();
        assert!(server.path().exists());

        let clients = IpcClients::new(dir.path());
        assert!(clients.send(77, "keyevent", b"ArrowUp keydown").await);
        assert!(clients.send(77, "keyevent", b"ArrowUp keyup").await);
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(
            *received.lock().unwrap(),
            vec![b"ArrowUp keydown".to_vec(), b"ArrowUp keyup".to_vec()]
        );

        let path = server.path().to_path_buf();
        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn send_without_listener_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let clients = IpcClients::new(dir.path());
        assert!(!clients.send(1, "keyevent", b"a keydown").await);
    }
}
