//! Transport layer - Pure I/O abstraction for text exchange with the server process
//!
//! The transport moves raw UTF-8 text in both directions and knows nothing
//! about CMake server framing or JSON. Framing lives in `crate::server::framing`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Size of the read buffer for output reading operations
const READ_BUFFER_SIZE: usize = 4096;

/// Default capacity for UTF-8 accumulation buffer
const UTF8_ACCUMULATION_BUFFER_CAPACITY: usize = 8192;

/// Core transport trait for bidirectional text exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a chunk of text
    async fn send(&mut self, message: &str) -> Result<(), Self::Error>;

    /// Receive the next chunk of text. Chunk boundaries carry no meaning.
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Error types for stdio transport
#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport over a pair of byte streams, usually a child's stdin/stdout
#[derive(Debug)]
pub struct StdioTransport {
    /// Channel feeding the writer task
    writer_sender: Option<mpsc::UnboundedSender<String>>,

    /// Channel fed by the reader task
    reader_receiver: Option<mpsc::UnboundedReceiver<String>>,

    /// Connection status
    connected: bool,
}

/// Byte accumulation state for the reader task
struct Utf8Accumulator {
    byte_buffer: Vec<u8>,
    buffer_capacity: usize,
}

impl Utf8Accumulator {
    fn new() -> Self {
        Self {
            byte_buffer: Vec::with_capacity(UTF8_ACCUMULATION_BUFFER_CAPACITY),
            buffer_capacity: UTF8_ACCUMULATION_BUFFER_CAPACITY,
        }
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        self.byte_buffer.extend_from_slice(bytes);
    }

    /// Drain the longest decodable prefix, keeping a split code point for later.
    /// Bytes that can never start a valid sequence become U+FFFD.
    fn take_valid_prefix(&mut self) -> Option<String> {
        let mut text = String::new();
        let mut consumed = 0;
        let mut invalid_bytes = 0;

        loop {
            let rest = &self.byte_buffer[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    consumed = self.byte_buffer.len();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            invalid_bytes += len;
                            consumed += valid_up_to + len;
                        }
                        // Truncated sequence at the end, wait for the rest
                        None => {
                            consumed += valid_up_to;
                            break;
                        }
                    }
                }
            }
        }

        if invalid_bytes > 0 {
            warn!("StdioTransport: replaced {} invalid UTF-8 bytes", invalid_bytes);
        }

        self.byte_buffer.drain(..consumed);
        if self.byte_buffer.capacity() > self.buffer_capacity * 2 {
            self.byte_buffer.shrink_to(self.buffer_capacity);
        }

        if text.is_empty() { None } else { Some(text) }
    }

    fn pending_bytes(&self) -> usize {
        self.byte_buffer.len()
    }
}

impl StdioTransport {
    /// Create a transport from any writer/reader pair
    ///
    /// Spawns one writer and one reader task; both end when the transport is
    /// closed or the stream reports EOF.
    pub fn new<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (writer_sender, writer_receiver) = mpsc::unbounded_channel();
        let (reader_sender, reader_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(writer, writer_receiver));
        tokio::spawn(Self::reader_task(reader, reader_sender));

        Self {
            writer_sender: Some(writer_sender),
            reader_receiver: Some(reader_receiver),
            connected: true,
        }
    }

    async fn writer_task<W>(mut writer: W, mut receiver: mpsc::UnboundedReceiver<String>)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(message) = receiver.recv().await {
            trace!("StdioTransport: writing {} bytes", message.len());

            if let Err(e) = writer.write_all(message.as_bytes()).await {
                error!("Failed to write to server input: {}", e);
                break;
            }

            if let Err(e) = writer.flush().await {
                error!("Failed to flush server input: {}", e);
                break;
            }
        }

        trace!("StdioTransport: writer task finished");
    }

    async fn reader_task<R>(reader: R, sender: mpsc::UnboundedSender<String>)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut accumulator = Utf8Accumulator::new();
        let mut read_buffer = Box::new([0u8; READ_BUFFER_SIZE]);

        loop {
            match reader.read(read_buffer.as_mut()).await {
                Ok(0) => {
                    if let Some(rest) = accumulator.take_valid_prefix() {
                        let _ = sender.send(rest);
                    }
                    if accumulator.pending_bytes() > 0 {
                        error!(
                            "StdioTransport: {} incomplete UTF-8 bytes at EOF",
                            accumulator.pending_bytes()
                        );
                    }
                    trace!("StdioTransport: server output reached EOF");
                    break;
                }
                Ok(n) => {
                    accumulator.add_bytes(&read_buffer[..n]);
                    if let Some(text) = accumulator.take_valid_prefix() {
                        if sender.send(text).is_err() {
                            trace!("StdioTransport: receiver dropped, stopping reader");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to read server output: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: reader task finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = StdioTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let sender = self
            .writer_sender
            .as_ref()
            .ok_or(StdioTransportError::Disconnected)?;

        sender
            .send(message.to_string())
            .map_err(|e| StdioTransportError::Channel(e.to_string()))
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let receiver = self
            .reader_receiver
            .as_mut()
            .ok_or(StdioTransportError::Disconnected)?;

        match receiver.recv().await {
            Some(text) => Ok(text),
            None => {
                self.connected = false;
                Err(StdioTransportError::Disconnected)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.writer_sender.take();
        self.reader_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Error type for mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
    #[error("No more responses available")]
    NoMoreResponses,
}

/// Scripted transport for tests: records sent text, replays queued chunks
#[derive(Clone, Default)]
pub struct MockTransport {
    sent_messages: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<VecDeque<String>>>,
    connected: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            connected: true,
            ..Default::default()
        }
    }

    /// Create a mock transport with predefined output chunks
    pub fn with_responses(responses: Vec<String>) -> Self {
        let transport = Self::new();
        if let Ok(mut queue) = transport.responses.lock() {
            queue.extend(responses);
        }
        transport
    }

    /// All text that was sent through this transport
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent_messages
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }
        if let Ok(mut sent) = self.sent_messages.lock() {
            sent.push(message.to_string());
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        match next {
            Some(chunk) => Ok(chunk),
            None => {
                self.connected = false;
                Err(MockTransportError::NoMoreResponses)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================
