//! CMake server message framing
//!
//! Every message in either direction is wrapped in start/end markers:
//!
//! ```text
//! \n[== "CMake Server" ==[\n<json>\n]== "CMake Server" ==]\n
//! ```
//!
//! Text outside a marker pair (banner output of the server, stray newlines)
//! is dropped.

use crate::io::transport::Transport;
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::trace;

pub const START_MARKER: &str = "[== \"CMake Server\" ==[";
pub const END_MARKER: &str = "]== \"CMake Server\" ==]";

/// Maximum buffered size of one message body
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Error types for CMake server framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError<T: std::error::Error + Send + Sync + 'static> {
    #[error("Transport error: {0}")]
    Transport(T),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Transport closed before message was complete ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

/// Frame a JSON text for sending
pub fn frame(message: &str) -> String {
    format!("\n{START_MARKER}\n{message}\n{END_MARKER}\n")
}

/// Framing wrapper over any [`Transport`]
pub struct ServerFraming<T: Transport> {
    transport: T,
    receive_buffer: String,
    message_queue: VecDeque<String>,
}

impl<T: Transport> ServerFraming<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            receive_buffer: String::new(),
            message_queue: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Pull one complete message body out of the buffer, if present
    fn try_parse_message(&mut self) -> Result<Option<String>, FramingError<T::Error>> {
        let Some(start) = self.receive_buffer.find(START_MARKER) else {
            // Keep a possible partial marker at the tail
            let keep_from = self
                .receive_buffer
                .len()
                .saturating_sub(START_MARKER.len());
            let keep_from = floor_char_boundary(&self.receive_buffer, keep_from);
            if keep_from > 0 {
                trace!("ServerFraming: dropping {} bytes of noise", keep_from);
                self.receive_buffer.drain(..keep_from);
            }
            return Ok(None);
        };

        let body_start = start + START_MARKER.len();
        let Some(body_len) = self.receive_buffer[body_start..].find(END_MARKER) else {
            let buffered = self.receive_buffer.len() - body_start;
            if buffered > MAX_MESSAGE_SIZE {
                return Err(FramingError::MessageTooLarge {
                    size: buffered,
                    max: MAX_MESSAGE_SIZE,
                });
            }
            return Ok(None);
        };

        let body_end = body_start + body_len;
        let message = self.receive_buffer[body_start..body_end].trim().to_string();
        self.receive_buffer.drain(..body_end + END_MARKER.len());

        trace!("ServerFraming: parsed message ({} bytes)", message.len());
        Ok(Some(message))
    }

    async fn fill_queue(&mut self) -> Result<(), FramingError<T::Error>> {
        let chunk = match self.transport.receive().await {
            Ok(chunk) => chunk,
            Err(e) => {
                let buffered = self.receive_buffer.trim().len();
                if buffered > 0 && self.receive_buffer.contains(START_MARKER) {
                    return Err(FramingError::Truncated { buffered });
                }
                return Err(FramingError::Transport(e));
            }
        };

        self.receive_buffer.push_str(&chunk);

        while let Some(message) = self.try_parse_message()? {
            self.message_queue.push_back(message);
        }

        Ok(())
    }
}

/// Largest char boundary not greater than `index`
fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[async_trait]
impl<T: Transport> Transport for ServerFraming<T> {
    type Error = FramingError<T::Error>;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        trace!("ServerFraming: sending message ({} bytes)", message.len());
        self.transport
            .send(&frame(message))
            .await
            .map_err(FramingError::Transport)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        loop {
            if let Some(message) = self.message_queue.pop_front() {
                return Ok(message);
            }
            self.fill_queue().await?;
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.transport
            .close()
            .await
            .map_err(FramingError::Transport)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::{MockTransport, MockTransportError};

    #[tokio::test]
    async fn test_send_wraps_message_in_markers() {
        let mut framing = ServerFraming::new(MockTransport::new());

        framing.send(r#"{"type":"compute"}"#).await.unwrap();

        let sent = framing.transport().sent_messages();
        assert_eq!(
            sent,
            vec!["\n[== \"CMake Server\" ==[\n{\"type\":\"compute\"}\n]== \"CMake Server\" ==]\n"]
        );
    }

    #[tokio::test]
    async fn test_receive_skips_noise_and_splits_messages() {
        let combined = format!(
            "server banner\n{}{}",
            frame(r#"{"type":"hello"}"#),
            frame(r#"{"type":"reply"}"#)
        );
        let mut framing = ServerFraming::new(MockTransport::with_responses(vec![combined]));

        assert_eq!(framing.receive().await.unwrap(), r#"{"type":"hello"}"#);
        assert_eq!(framing.receive().await.unwrap(), r#"{"type":"reply"}"#);
    }

    #[tokio::test]
    async fn test_receive_reassembles_split_markers() {
        let framed = frame(r#"{"type":"progress"}"#);
        let (first, second) = framed.split_at(8);
        let mut framing = ServerFraming::new(MockTransport::with_responses(vec![
            first.to_string(),
            second.to_string(),
        ]));

        assert_eq!(framing.receive().await.unwrap(), r#"{"type":"progress"}"#);
    }

    #[tokio::test]
    async fn test_truncated_message_is_reported() {
        let partial = format!("\n{START_MARKER}\n{{\"type\":");
        let mut framing = ServerFraming::new(MockTransport::with_responses(vec![partial]));

        match framing.receive().await {
            Err(FramingError::Truncated { buffered }) => assert!(buffered > 0),
            other => panic!("Expected Truncated, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_eof_surfaces_transport_error() {
        let mut framing = ServerFraming::new(MockTransport::with_responses(vec![]));

        assert!(matches!(
            framing.receive().await,
            Err(FramingError::Transport(MockTransportError::NoMoreResponses))
        ));
    }
}
