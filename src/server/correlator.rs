//! Request/reply correlation
//!
//! The protocol is strictly turn-based: at most one request is in flight.
//! Cookies have the form `<generation>:<sequence>`; the generation changes on
//! every `stop()` so anything the server echoes for an older session can be
//! told apart from a merely unknown cookie.

use crate::server::message::{ProgressMessage, Request, RequestKind, ServerMessage};
use serde_json::{Map, Value};
use tracing::{trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    #[error("Cannot send {requested} while {pending} is still outstanding")]
    Busy {
        pending: RequestKind,
        requested: RequestKind,
    },
}

/// Result of matching an inbound message against the outstanding request
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    /// Successful reply to the outstanding request
    Reply {
        kind: RequestKind,
        payload: Map<String, Value>,
    },
    /// Error reply to the outstanding request
    ErrorReply { kind: RequestKind, message: String },
    /// Progress report for the outstanding request
    Progress {
        kind: RequestKind,
        progress: ProgressMessage,
    },
    /// Messages not bound to a request: hello, log messages, signals
    Unsolicited(ServerMessage),
    /// Belongs to an earlier generation
    Stale,
    /// Bound to a request we are not waiting for
    Unmatched { reason: String },
}

#[derive(Debug, Clone)]
struct PendingRequest {
    kind: RequestKind,
    cookie: String,
}

#[derive(Debug, Clone)]
pub struct Correlator {
    generation: u64,
    sequence: u64,
    pending: Option<PendingRequest>,
}

fn parse_cookie(cookie: &str) -> Option<(u64, u64)> {
    let (generation, sequence) = cookie.split_once(':')?;
    Some((generation.parse().ok()?, sequence.parse().ok()?))
}

impl Correlator {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            sequence: 0,
            pending: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Kind of the request currently awaiting its reply
    pub fn pending(&self) -> Option<RequestKind> {
        self.pending.as_ref().map(|p| p.kind)
    }

    /// Drop any outstanding request and move to a new generation
    pub fn reset(&mut self, generation: u64) {
        if let Some(pending) = self.pending.take() {
            trace!(
                "Correlator: abandoning {} ({}) on reset",
                pending.kind, pending.cookie
            );
        }
        self.generation = generation;
        self.sequence = 0;
    }

    /// Build the next request and mark it outstanding
    pub fn send(
        &mut self,
        kind: RequestKind,
        params: Map<String, Value>,
    ) -> Result<Request, CorrelatorError> {
        if let Some(pending) = &self.pending {
            return Err(CorrelatorError::Busy {
                pending: pending.kind,
                requested: kind,
            });
        }

        self.sequence += 1;
        let cookie = format!("{}:{}", self.generation, self.sequence);
        self.pending = Some(PendingRequest {
            kind,
            cookie: cookie.clone(),
        });

        Ok(Request {
            kind,
            cookie,
            params,
        })
    }

    fn is_stale(&self, cookie: Option<&str>) -> bool {
        cookie
            .and_then(parse_cookie)
            .is_some_and(|(generation, _)| generation < self.generation)
    }

    /// Check `cookie`/`in_reply_to` against the outstanding request
    fn match_pending(&self, cookie: Option<&str>, in_reply_to: &str) -> Result<RequestKind, String> {
        let Some(pending) = &self.pending else {
            return Err(format!("no request outstanding (inReplyTo={in_reply_to:?})"));
        };
        if cookie != Some(pending.cookie.as_str()) {
            return Err(format!(
                "cookie {:?} does not match outstanding {} ({})",
                cookie, pending.kind, pending.cookie
            ));
        }
        if in_reply_to != pending.kind.as_str() {
            return Err(format!(
                "inReplyTo {:?} does not match outstanding {}",
                in_reply_to, pending.kind
            ));
        }
        Ok(pending.kind)
    }

    /// Classify an inbound message. Replies and errors clear the outstanding request.
    pub fn resolve(&mut self, message: ServerMessage) -> Correlation {
        if self.is_stale(message.cookie()) {
            trace!(
                "Correlator: dropping stale {} (cookie {:?})",
                message.type_name(),
                message.cookie()
            );
            return Correlation::Stale;
        }

        let cookie = message.cookie().map(str::to_string);
        let correlation = match message {
            ServerMessage::Reply(reply) => {
                match self.match_pending(cookie.as_deref(), &reply.in_reply_to) {
                    Ok(kind) => {
                        self.pending = None;
                        Correlation::Reply {
                            kind,
                            payload: reply.payload,
                        }
                    }
                    Err(reason) => Correlation::Unmatched { reason },
                }
            }
            ServerMessage::Error(error) => {
                match self.match_pending(cookie.as_deref(), &error.in_reply_to) {
                    Ok(kind) => {
                        self.pending = None;
                        Correlation::ErrorReply {
                            kind,
                            message: error.error_message,
                        }
                    }
                    Err(reason) => Correlation::Unmatched { reason },
                }
            }
            ServerMessage::Progress(progress) => {
                match self.match_pending(cookie.as_deref(), &progress.in_reply_to) {
                    Ok(kind) => Correlation::Progress { kind, progress },
                    Err(reason) => Correlation::Unmatched { reason },
                }
            }
            other => Correlation::Unsolicited(other),
        };

        if let Correlation::Unmatched { reason } = &correlation {
            warn!("Dropping unmatched server message: {}", reason);
        }
        correlation
    }
}
