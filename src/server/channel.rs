//! Connection to a running CMake server
//!
//! A pump task owns the framed transport. It forwards decoded inbound
//! messages to the reader and writes outbound requests, so the reader only
//! ever touches plain channels. Dropping the [`ServerChannel`] stops the pump.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ReaderParameters;
use crate::error::ReaderError;
use crate::io::{ChildProcessManager, ProcessManager, StderrMonitor, StopMode, Transport};
use crate::log_server_message;
use crate::server::framing::ServerFraming;
use crate::server::message::ServerMessage;

/// Arguments that put cmake into server mode over stdio
pub const SERVER_ARGS: [&str; 4] = ["-E", "server", "--experimental", "--debug"];

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(ServerMessage),
    /// A complete frame whose body is not a valid server message
    Malformed { text: String, error: String },
    Closed { reason: String },
}

pub struct ServerChannel {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    cancel: CancellationToken,
}

impl ServerChannel {
    /// Assemble a channel from its parts. The token is cancelled when the
    /// channel is dropped.
    pub fn from_parts(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<ChannelEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            cancel,
        }
    }

    /// Queue one JSON message for the server
    pub fn send(&self, text: String) -> Result<(), ReaderError> {
        self.outbound
            .send(text)
            .map_err(|_| ReaderError::Transport("server channel closed".to_string()))
    }

    /// Next inbound event; `None` once the pump has ended and the queue is drained
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.inbound.try_recv().ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ServerChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum PumpStep {
    Cancelled,
    Outgoing(String),
    Incoming(String),
    Finished(Option<String>),
}

/// Spawn the pump task over an already framed transport
pub fn spawn_pump<T>(mut transport: T) -> ServerChannel
where
    T: Transport + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ChannelEvent>();
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        loop {
            let step = tokio::select! {
                _ = token.cancelled() => PumpStep::Cancelled,
                outgoing = outbound_rx.recv() => match outgoing {
                    Some(text) => PumpStep::Outgoing(text),
                    None => PumpStep::Finished(None),
                },
                incoming = transport.receive() => match incoming {
                    Ok(text) => PumpStep::Incoming(text),
                    Err(e) => PumpStep::Finished(Some(e.to_string())),
                },
            };

            match step {
                PumpStep::Cancelled => {
                    trace!("Server pump: cancelled");
                    if let Err(e) = transport.close().await {
                        debug!("Server pump: close failed: {}", e);
                    }
                    break;
                }
                PumpStep::Outgoing(text) => {
                    log_server_message!(tracing::Level::TRACE, "outgoing", &text);
                    if let Err(e) = transport.send(&text).await {
                        let _ = inbound_tx.send(ChannelEvent::Closed {
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
                PumpStep::Incoming(text) => {
                    log_server_message!(tracing::Level::TRACE, "incoming", &text);
                    let event = match ServerMessage::decode(&text) {
                        Ok(message) => ChannelEvent::Message(message),
                        Err(e) => ChannelEvent::Malformed {
                            text,
                            error: e.to_string(),
                        },
                    };
                    if inbound_tx.send(event).is_err() {
                        break;
                    }
                }
                PumpStep::Finished(reason) => {
                    if let Some(reason) = reason {
                        info!("CMake server connection closed: {}", reason);
                        let _ = inbound_tx.send(ChannelEvent::Closed { reason });
                    }
                    break;
                }
            }
        }
        trace!("Server pump: finished");
    });

    ServerChannel::from_parts(outbound_tx, inbound_rx, cancel)
}

// ============================================================================
// Launchers
// ============================================================================

/// Starts a server for a parameter set and hands back its channel
#[async_trait]
pub trait ServerLauncher: Send {
    async fn launch(&mut self, parameters: &ReaderParameters) -> Result<ServerChannel, ReaderError>;

    /// Stop whatever the last launch started. Safe to call when nothing runs.
    async fn terminate(&mut self);
}

/// Launches `cmake -E server` in the build directory
#[derive(Default)]
pub struct CmakeServerLauncher {
    process: Option<ChildProcessManager>,
}

impl CmakeServerLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.is_running())
    }
}

#[async_trait]
impl ServerLauncher for CmakeServerLauncher {
    async fn launch(&mut self, parameters: &ReaderParameters) -> Result<ServerChannel, ReaderError> {
        self.terminate().await;

        let build_directory = parameters.build_directory.clone();
        tokio::fs::create_dir_all(&build_directory)
            .await
            .map_err(|source| ReaderError::BuildDirectory {
                path: build_directory.clone(),
                source,
            })?;

        let mut process = ChildProcessManager::new(
            parameters.cmake_executable.clone(),
            SERVER_ARGS.iter().map(|arg| arg.to_string()).collect(),
            Some(build_directory),
        );
        process.on_stderr_line(|line| debug!(target: "cmake_server::stderr", "{}", line));
        process.start().await?;

        let transport = process.take_stdio_transport()?;
        self.process = Some(process);

        Ok(spawn_pump(ServerFraming::new(transport)))
    }

    async fn terminate(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if process.is_running() {
            if let Err(e) = process.stop(StopMode::Graceful).await {
                warn!("Failed to stop CMake server: {}", e);
            }
        }
    }
}
