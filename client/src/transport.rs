//! Socket ownership and line framing.

use log::{debug, error, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const READ_CHUNK: usize = 4096;

/// Splits a byte stream into trimmed, non-empty text lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    bom_checked: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes and returns every complete line now available. A partial
    /// trailing line stays buffered until its newline arrives.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        if !self.bom_checked {
            if self.buffer.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(&self.buffer) {
                return Vec::new();
            }
            if self.buffer.starts_with(UTF8_BOM) {
                self.buffer.drain(..UTF8_BOM.len());
            }
            self.bom_checked = true;
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = match String::from_utf8(raw) {
                Ok(text) => text,
                Err(e) => {
                    debug!("Invalid UTF-8 on the wire, decoding lossily");
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            };
            let line = text.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Fire-and-forget handle to the socket writer task.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
    sent: Arc<AtomicU64>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                sent: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queues one line for transmission. Failures are logged, never returned;
    /// a lost command shows up later as a waiter timeout.
    pub fn send_line(&self, line: &str) {
        if self.tx.send(line.to_string()).is_err() {
            warn!("Send failed, writer is gone: {}", line);
        } else {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Writes queued lines to the socket, newline-terminated.
pub async fn run_writer(mut socket: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        debug!("-> {}", line);
        let mut data = line.into_bytes();
        data.push(b'\n');
        if let Err(e) = socket.write_all(&data).await {
            error!("Send error: {}", e);
        }
    }
    let _ = socket.shutdown().await;
}

/// Read side of the socket, yielding framed lines. Never reconnects; that
/// decision belongs to the caller.
pub struct LineReader {
    socket: OwnedReadHalf,
    framer: LineFramer,
    chunk: Box<[u8; READ_CHUNK]>,
}

impl LineReader {
    pub fn new(socket: OwnedReadHalf) -> Self {
        Self {
            socket,
            framer: LineFramer::new(),
            chunk: Box::new([0u8; READ_CHUNK]),
        }
    }

    /// Returns the lines completed by the next read, or `None` once the peer
    /// has closed or the read failed. Cancel-safe.
    pub async fn next_lines(&mut self) -> Option<Vec<String>> {
        match self.socket.read(&mut self.chunk[..]).await {
            Ok(0) => {
                warn!("Host closed the connection");
                None
            }
            Ok(len) => Some(self.framer.push(&self.chunk[..len])),
            Err(e) => {
                error!("Receive error: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_complete_lines() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"{\"src\":\"A\"}\n{\"src\":\"B\"}\n");
        assert_eq!(lines, vec!["{\"src\":\"A\"}", "{\"src\":\"B\"}"]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_keeps_partial_line() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"{\"src\":").is_empty());
        assert_eq!(framer.push(b"\"A\"}\n"), vec!["{\"src\":\"A\"}"]);
    }

    #[test]
    fn test_trims_and_drops_empty_lines() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"  hello \r\n\n\r\n   \nworld\n");
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[test]
    fn test_strips_leading_bom_once() {
        let mut framer = LineFramer::new();
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"first\n");
        assert_eq!(framer.push(&bytes), vec!["first"]);

        // a later BOM is payload, not a stream marker
        let mut later = UTF8_BOM.to_vec();
        later.extend_from_slice(b"second\n");
        assert_eq!(framer.push(&later), vec!["\u{feff}second"]);
    }

    #[test]
    fn test_bom_split_across_reads() {
        let mut framer = LineFramer::new();
        assert!(framer.push(&UTF8_BOM[..1]).is_empty());
        assert!(framer.push(&UTF8_BOM[1..]).is_empty());
        assert_eq!(framer.push(b"x\n"), vec!["x"]);
    }

    #[test]
    fn test_invalid_utf8_decoded_lossily() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"ok \xFF bytes\n");
        assert_eq!(lines, vec!["ok \u{FFFD} bytes"]);
    }

    #[test]
    fn test_multibyte_split_across_reads() {
        let mut framer = LineFramer::new();
        let text = "Félix has connected.\n".as_bytes();
        assert!(framer.push(&text[..2]).is_empty());
        assert_eq!(framer.push(&text[2..]), vec!["Félix has connected."]);
    }

    #[tokio::test]
    async fn test_outbound_counts_queued_lines() {
        let (outbound, mut rx) = Outbound::channel();
        outbound.send_line("checkhost");
        outbound.send_line("start");
        assert_eq!(outbound.sent_count(), 2);
        assert_eq!(rx.recv().await.as_deref(), Some("checkhost"));

        drop(rx);
        outbound.send_line("skip");
        assert_eq!(outbound.sent_count(), 2);
    }
}
