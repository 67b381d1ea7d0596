use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// How long a read may stay idle once the process has exited before the
/// stream is considered drained.
const DRAIN_IDLE: Duration = Duration::from_millis(100);

/// Callback receiving decoded text for one stream.
pub type OutputFn = Arc<dyn Fn(String) + Send + Sync>;

/// Pacing for one output stream: at most `max_chunks * chunk_size` bytes are
/// held per `buffer_time` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    pub chunk_size: usize,
    pub max_chunks: usize,
    pub buffer_time: Duration,
}

impl PumpConfig {
    pub fn websocket() -> Self {
        Self {
            chunk_size: 256,
            max_chunks: 50,
            buffer_time: Duration::from_millis(100),
        }
    }

    pub fn bluetooth() -> Self {
        Self {
            chunk_size: 256,
            max_chunks: 10,
            buffer_time: Duration::from_millis(500),
        }
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self::websocket()
    }
}

/// Fixed number of byte chunks; pushing onto a full buffer evicts the oldest.
#[derive(Debug)]
pub struct RingBuffer {
    chunks: VecDeque<Vec<u8>>,
    max_chunks: usize,
    dropped_bytes: u64,
}

impl RingBuffer {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(max_chunks.max(1)),
            max_chunks: max_chunks.max(1),
            dropped_bytes: 0,
        }
    }

    pub fn push(&mut self, data: Vec<u8>) {
        self.chunks.push_back(data);
        while self.chunks.len() > self.max_chunks {
            if let Some(evicted) = self.chunks.pop_front() {
                self.dropped_bytes = self.dropped_bytes.saturating_add(evicted.len() as u64);
            }
        }
    }

    /// Concatenate and remove everything buffered.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.chunks.iter().map(Vec::len).sum());
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes evicted since the last call.
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped_bytes)
    }
}

/// Pump `stream` into `emit` until the stream ends.
///
/// The reader side never blocks on a slow consumer: it keeps reading into the
/// ring buffer and the oldest bytes are lost once the buffer is full. The
/// writer side flushes every `buffer_time` and once more after the reader
/// finishes, so residual output produced right before exit is delivered.
pub async fn pump<R>(stream: R, finished: watch::Receiver<bool>, config: PumpConfig, emit: OutputFn)
where
    R: AsyncRead + Unpin + Send,
{
    let ring = Arc::new(Mutex::new(RingBuffer::new(config.max_chunks)));
    let (done_tx, done_rx) = oneshot::channel::<()>();

    let reader = async {
        read_loop(stream, finished, config.chunk_size, &ring).await;
        let _ = done_tx.send(());
    };
    let writer = write_loop(done_rx, config.buffer_time, &ring, &emit);
    tokio::join!(reader, writer);
}

async fn read_loop<R>(
    mut stream: R,
    mut finished: watch::Receiver<bool>,
    chunk_size: usize,
    ring: &Mutex<RingBuffer>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut draining = *finished.borrow();

    loop {
        let read = if draining {
            match tokio::time::timeout(DRAIN_IDLE, stream.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => break,
            }
        } else {
            tokio::select! {
                read = stream.read(&mut buf) => read,
                _ = finished.wait_for(|done| *done) => {
                    draining = true;
                    continue;
                }
            }
        };

        match read {
            Ok(0) => break,
            Ok(n) => lock(ring).push(buf[..n].to_vec()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // A PTY master reports EIO once the slave side is gone.
                debug!(error = %e, "output stream closed");
                break;
            }
        }
    }
}

async fn write_loop(
    mut reader_done: oneshot::Receiver<()>,
    buffer_time: Duration,
    ring: &Mutex<RingBuffer>,
    emit: &OutputFn,
) {
    let mut ticker = tokio::time::interval(buffer_time);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut carry = Vec::new();

    loop {
        let last = tokio::select! {
            _ = ticker.tick() => false,
            _ = &mut reader_done => true,
        };
        flush(ring, &mut carry, last, emit);
        if last {
            break;
        }
    }
}

fn flush(ring: &Mutex<RingBuffer>, carry: &mut Vec<u8>, last: bool, emit: &OutputFn) {
    let (fresh, dropped) = {
        let mut ring = lock(ring);
        (ring.drain(), ring.take_dropped())
    };
    if dropped > 0 {
        debug!(dropped, "output exceeded buffer, oldest bytes dropped");
    }
    if fresh.is_empty() && !(last && !carry.is_empty()) {
        return;
    }
    carry.extend_from_slice(&fresh);
    let text = take_text(carry, last);
    if !text.is_empty() {
        emit(text);
    }
}

/// Decode `bytes` as UTF-8, leaving an incomplete trailing sequence behind
/// for the next flush unless this is the last one.
fn take_text(bytes: &mut Vec<u8>, last: bool) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let text = text.to_owned();
            bytes.clear();
            text
        }
        Err(e) if e.error_len().is_none() && !last => {
            let tail = bytes.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(bytes).into_owned();
            *bytes = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            bytes.clear();
            text
        }
    }
}

fn lock(ring: &Mutex<RingBuffer>) -> std::sync::MutexGuard<'_, RingBuffer> {
    ring.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn collector() -> (OutputFn, Arc<Mutex<Vec<String>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        let emit: OutputFn = Arc::new(move |text| sink.lock().unwrap().push(text));
        (emit, out)
    }

    #[test]
    fn ring_is_bounded_and_drops_oldest() {
        let mut ring = RingBuffer::new(2);
        ring.push(vec![1]);
        ring.push(vec![2, 2]);
        ring.push(vec![3]);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.take_dropped(), 1);
        assert_eq!(ring.drain(), vec![2, 2, 3]);
        assert!(ring.is_empty());
        assert_eq!(ring.take_dropped(), 0);
    }

    #[test]
    fn partial_utf8_is_carried_between_flushes() {
        let euro = "€".as_bytes();
        let mut bytes = b"ab".to_vec();
        bytes.extend_from_slice(&euro[..2]);
        assert_eq!(take_text(&mut bytes, false), "ab");
        assert_eq!(bytes, euro[..2].to_vec());
        bytes.extend_from_slice(&euro[2..]);
        assert_eq!(take_text(&mut bytes, false), "€");
        assert!(bytes.is_empty());
    }

    #[test]
    fn last_flush_decodes_lossily() {
        let mut bytes = vec![b'x', 0xe2, 0x82];
        assert_eq!(take_text(&mut bytes, true), "x\u{fffd}");
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn overflow_keeps_most_recent_bytes() {
        let data: Vec<u8> = (0..10_000u32).map(|i| b'a' + (i % 26) as u8).collect();
        let (_tx, finished) = watch::channel(true);
        let (emit, out) = collector();
        let config = PumpConfig {
            chunk_size: 8,
            max_chunks: 4,
            buffer_time: Duration::from_secs(3600),
        };

        pump(data.as_slice(), finished, config, emit).await;

        let joined: String = out.lock().unwrap().concat();
        assert!(joined.len() <= 32);
        let expected = String::from_utf8(data[data.len() - joined.len()..].to_vec()).unwrap();
        assert_eq!(joined, expected);
        assert!(joined.ends_with(std::str::from_utf8(&data[data.len() - 8..]).unwrap()));
    }

    #[tokio::test]
    async fn flushes_on_interval_and_after_exit() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (done_tx, finished) = watch::channel(false);
        let (emit, out) = collector();
        let config = PumpConfig {
            chunk_size: 64,
            max_chunks: 8,
            buffer_time: Duration::from_millis(20),
        };

        let task = tokio::spawn(pump(reader, finished, config, emit));

        writer.write_all(b"first\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(out.lock().unwrap().concat(), "first\n");

        writer.write_all(b"second\n").await.unwrap();
        done_tx.send(true).unwrap();
        drop(writer);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("pump finishes")
            .unwrap();
        assert_eq!(out.lock().unwrap().concat(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn finished_signal_stops_idle_reader() {
        let (_writer, reader) = tokio::io::duplex(64);
        let (done_tx, finished) = watch::channel(false);
        let (emit, out) = collector();

        let task = tokio::spawn(pump(reader, finished, PumpConfig::default(), emit));
        done_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("pump stops once drained")
            .unwrap();
        assert!(out.lock().unwrap().is_empty());
    }
}
