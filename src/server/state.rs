//! Protocol state machine
//!
//! [`transition`] is a pure function of the current state and one event. It
//! returns the next state plus the effects the driver has to carry out
//! (send a request, extract a payload, publish, fail). Correlation has
//! already happened by the time an event reaches this module.

use crate::server::message::{ProtocolVersion, RequestKind, negotiate_protocol};
use serde::Serialize;
use serde_json::{Map, Value};

/// Total progress range, split into per-step bands
pub const MAX_PROGRESS: u32 = 1400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProtocolState {
    Unconnected,
    Connecting,
    HandshakeSent,
    ConfigureRequested,
    ComputeRequested,
    GatheringCodeModel,
    GatheringCache,
    GatheringInputs,
    Ready,
    Error,
}

impl ProtocolState {
    /// States in which a request has been sent and not yet answered
    pub fn is_busy(self) -> bool {
        !matches!(
            self,
            ProtocolState::Unconnected | ProtocolState::Ready | ProtocolState::Error
        )
    }

    /// The request whose reply this state is waiting for
    pub fn awaiting(self) -> Option<RequestKind> {
        match self {
            ProtocolState::HandshakeSent => Some(RequestKind::Handshake),
            ProtocolState::ConfigureRequested => Some(RequestKind::Configure),
            ProtocolState::ComputeRequested => Some(RequestKind::Compute),
            ProtocolState::GatheringCodeModel => Some(RequestKind::CodeModel),
            ProtocolState::GatheringCache => Some(RequestKind::Cache),
            ProtocolState::GatheringInputs => Some(RequestKind::CmakeInputs),
            _ => None,
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The server process was started and its channel is open
    Launched,
    Hello { supported: Vec<ProtocolVersion> },
    Reply {
        kind: RequestKind,
        payload: Map<String, Value>,
    },
    ErrorReply { kind: RequestKind, message: String },
    Progress {
        kind: RequestKind,
        minimum: i64,
        current: i64,
        maximum: i64,
        message: String,
    },
    ChannelClosed { reason: String },
    /// Start another configure cycle on an established connection
    Reparse,
    Stop,
}

/// Work the driver must do as a consequence of a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SendHandshake(ProtocolVersion),
    Send(RequestKind),
    Extract {
        kind: RequestKind,
        payload: Map<String, Value>,
    },
    Progress(StepProgress),
    /// All data gathered, swap in the new snapshot
    Publish,
    Fail(String),
    /// The event was not meaningful in this state
    Ignore(String),
}

/// Raw progress report for one step, before monotonic tracking
#[derive(Debug, Clone, PartialEq)]
pub struct StepProgress {
    pub step: RequestKind,
    pub fraction: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: ProtocolState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ProtocolState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(state: ProtocolState, why: String) -> Self {
        Self {
            next: state,
            effects: vec![Effect::Ignore(why)],
        }
    }
}

/// `(current - min) / (max - min)` clamped to [0, 1]; an empty range is 0
pub fn progress_fraction(minimum: i64, current: i64, maximum: i64) -> f64 {
    if maximum <= minimum {
        return 0.0;
    }
    // f64 so that server-supplied extremes cannot overflow
    let fraction = (current as f64 - minimum as f64) / (maximum as f64 - minimum as f64);
    fraction.clamp(0.0, 1.0)
}

/// Band of the overall progress range covered by each step
pub fn progress_band(step: RequestKind) -> (u32, u32) {
    match step {
        RequestKind::Handshake | RequestKind::Configure => (0, 1000),
        RequestKind::Compute => (1000, 1200),
        RequestKind::CodeModel => (1200, 1300),
        RequestKind::Cache | RequestKind::CmakeInputs => (1300, MAX_PROGRESS),
    }
}

fn step_failed(kind: RequestKind, message: &str) -> Effect {
    Effect::Fail(format!("CMake server {kind} request failed: {message}"))
}

/// The state following a successful reply, and the request to send next
fn after_reply(kind: RequestKind) -> (ProtocolState, Option<RequestKind>) {
    match kind {
        RequestKind::Handshake => (ProtocolState::ConfigureRequested, Some(RequestKind::Configure)),
        RequestKind::Configure => (ProtocolState::ComputeRequested, Some(RequestKind::Compute)),
        RequestKind::Compute => (ProtocolState::GatheringCodeModel, Some(RequestKind::CodeModel)),
        RequestKind::CodeModel => (ProtocolState::GatheringCache, Some(RequestKind::Cache)),
        RequestKind::Cache => (ProtocolState::GatheringInputs, Some(RequestKind::CmakeInputs)),
        RequestKind::CmakeInputs => (ProtocolState::Ready, None),
    }
}

fn carries_data(kind: RequestKind) -> bool {
    matches!(
        kind,
        RequestKind::CodeModel | RequestKind::Cache | RequestKind::CmakeInputs
    )
}

pub fn transition(state: ProtocolState, event: Event) -> Transition {
    use ProtocolState as S;

    match (state, event) {
        (_, Event::Stop) => Transition::to(S::Unconnected, Vec::new()),

        (S::Error, event) => Transition::stay(S::Error, format!("{event:?} after failure")),

        (S::Unconnected, Event::Launched) => Transition::to(S::Connecting, Vec::new()),

        (S::Connecting, Event::Hello { supported }) => match negotiate_protocol(&supported) {
            Some(version) => Transition::to(S::HandshakeSent, vec![Effect::SendHandshake(version)]),
            None => Transition::to(
                S::Error,
                vec![Effect::Fail(format!(
                    "CMake server does not support protocol version 1 (offered: {supported:?})"
                ))],
            ),
        },

        (S::Ready, Event::Reparse) => Transition::to(
            S::ConfigureRequested,
            vec![Effect::Send(RequestKind::Configure)],
        ),

        (state, Event::Reply { kind, payload }) if state.awaiting() == Some(kind) => {
            let (next, follow_up) = after_reply(kind);
            let mut effects = Vec::new();
            if carries_data(kind) {
                effects.push(Effect::Extract { kind, payload });
            }
            match follow_up {
                Some(request) => effects.push(Effect::Send(request)),
                None => effects.push(Effect::Publish),
            }
            Transition::to(next, effects)
        }

        (state, Event::ErrorReply { kind, message }) if state.is_busy() => {
            Transition::to(S::Error, vec![step_failed(kind, &message)])
        }

        (
            state,
            Event::Progress {
                kind,
                minimum,
                current,
                maximum,
                message,
            },
        ) if state.awaiting() == Some(kind) => Transition::to(
            state,
            vec![Effect::Progress(StepProgress {
                step: kind,
                fraction: progress_fraction(minimum, current, maximum),
                message,
            })],
        ),

        (state, Event::ChannelClosed { reason }) if state.is_busy() => Transition::to(
            S::Error,
            vec![Effect::Fail(format!("CMake server connection lost: {reason}"))],
        ),

        // Losing an idle connection only means the next parse relaunches
        (S::Ready, Event::ChannelClosed { .. }) => Transition::to(S::Unconnected, Vec::new()),

        (state, event) => Transition::stay(state, format!("{event:?} in state {state:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(kind: RequestKind) -> Event {
        Event::Reply {
            kind,
            payload: Map::new(),
        }
    }

    fn hello() -> Event {
        Event::Hello {
            supported: vec![ProtocolVersion { major: 1, minor: 0 }],
        }
    }

    #[test]
    fn test_full_sequence_reaches_ready() {
        let mut state = ProtocolState::Unconnected;
        let mut sent = Vec::new();
        let mut published = false;

        let events = vec![
            Event::Launched,
            hello(),
            reply(RequestKind::Handshake),
            reply(RequestKind::Configure),
            reply(RequestKind::Compute),
            reply(RequestKind::CodeModel),
            reply(RequestKind::Cache),
            reply(RequestKind::CmakeInputs),
        ];

        for event in events {
            assert_ne!(state, ProtocolState::Ready);
            let transition = transition(state, event);
            for effect in transition.effects {
                match effect {
                    Effect::SendHandshake(_) => sent.push(RequestKind::Handshake),
                    Effect::Send(kind) => sent.push(kind),
                    Effect::Publish => published = true,
                    Effect::Fail(message) => panic!("unexpected failure: {message}"),
                    _ => {}
                }
            }
            state = transition.next;
        }

        assert_eq!(state, ProtocolState::Ready);
        assert!(published);
        assert_eq!(
            sent,
            vec![
                RequestKind::Handshake,
                RequestKind::Configure,
                RequestKind::Compute,
                RequestKind::CodeModel,
                RequestKind::Cache,
                RequestKind::CmakeInputs,
            ]
        );
    }

    #[test]
    fn test_data_replies_produce_extract_effects() {
        let t = transition(ProtocolState::GatheringCodeModel, reply(RequestKind::CodeModel));
        assert_eq!(t.next, ProtocolState::GatheringCache);
        assert!(matches!(
            t.effects.as_slice(),
            [
                Effect::Extract {
                    kind: RequestKind::CodeModel,
                    ..
                },
                Effect::Send(RequestKind::Cache)
            ]
        ));

        let t = transition(ProtocolState::ComputeRequested, reply(RequestKind::Compute));
        assert_eq!(t.effects, vec![Effect::Send(RequestKind::CodeModel)]);
    }

    #[test]
    fn test_error_reply_is_fatal_and_absorbing() {
        let t = transition(
            ProtocolState::ConfigureRequested,
            Event::ErrorReply {
                kind: RequestKind::Configure,
                message: "Could not find CMAKE_ROOT".to_string(),
            },
        );
        assert_eq!(t.next, ProtocolState::Error);
        match t.effects.as_slice() {
            [Effect::Fail(message)] => {
                assert!(message.contains("configure"));
                assert!(message.contains("Could not find CMAKE_ROOT"));
            }
            other => panic!("Expected one failure, got {other:?}"),
        }

        let t = transition(ProtocolState::Error, reply(RequestKind::Compute));
        assert_eq!(t.next, ProtocolState::Error);
        let t = transition(ProtocolState::Error, Event::Launched);
        assert_eq!(t.next, ProtocolState::Error);
    }

    #[test]
    fn test_stop_from_any_state_is_unconnected() {
        for state in [
            ProtocolState::Unconnected,
            ProtocolState::Connecting,
            ProtocolState::HandshakeSent,
            ProtocolState::ConfigureRequested,
            ProtocolState::ComputeRequested,
            ProtocolState::GatheringCodeModel,
            ProtocolState::GatheringCache,
            ProtocolState::GatheringInputs,
            ProtocolState::Ready,
            ProtocolState::Error,
        ] {
            let t = transition(state, Event::Stop);
            assert_eq!(t.next, ProtocolState::Unconnected);
            assert!(t.effects.is_empty());
        }
    }

    #[test]
    fn test_channel_loss_while_busy_fails() {
        let t = transition(
            ProtocolState::ComputeRequested,
            Event::ChannelClosed {
                reason: "cmake exited".to_string(),
            },
        );
        assert_eq!(t.next, ProtocolState::Error);
        assert!(matches!(t.effects.as_slice(), [Effect::Fail(_)]));

        let t = transition(
            ProtocolState::Ready,
            Event::ChannelClosed {
                reason: "cmake exited".to_string(),
            },
        );
        assert_eq!(t.next, ProtocolState::Unconnected);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_hello_without_supported_major_fails() {
        let t = transition(
            ProtocolState::Connecting,
            Event::Hello {
                supported: vec![ProtocolVersion { major: 2, minor: 0 }],
            },
        );
        assert_eq!(t.next, ProtocolState::Error);
    }

    #[test]
    fn test_out_of_order_reply_is_ignored() {
        let t = transition(ProtocolState::ComputeRequested, reply(RequestKind::Cache));
        assert_eq!(t.next, ProtocolState::ComputeRequested);
        assert!(matches!(t.effects.as_slice(), [Effect::Ignore(_)]));
    }

    #[test]
    fn test_progress_stays_in_state() {
        let t = transition(
            ProtocolState::ComputeRequested,
            Event::Progress {
                kind: RequestKind::Compute,
                minimum: 0,
                current: 50,
                maximum: 200,
                message: "Generating".to_string(),
            },
        );
        assert_eq!(t.next, ProtocolState::ComputeRequested);
        assert_eq!(
            t.effects,
            vec![Effect::Progress(StepProgress {
                step: RequestKind::Compute,
                fraction: 0.25,
                message: "Generating".to_string(),
            })]
        );
    }

    #[test]
    fn test_progress_fraction_bounds() {
        assert_eq!(progress_fraction(0, 5, 10), 0.5);
        assert_eq!(progress_fraction(7, 7, 7), 0.0);
        assert_eq!(progress_fraction(10, 20, 5), 0.0);
        assert_eq!(progress_fraction(0, -3, 10), 0.0);
        assert_eq!(progress_fraction(0, 30, 10), 1.0);

        assert_eq!(progress_fraction(i64::MIN, i64::MIN, i64::MAX), 0.0);
        assert_eq!(progress_fraction(i64::MIN, i64::MAX, i64::MAX), 1.0);
        let middle = progress_fraction(i64::MIN, 0, 1);
        assert!((0.0..=1.0).contains(&middle));
        assert_eq!(progress_fraction(i64::MAX, i64::MIN, i64::MIN), 0.0);
    }

    #[test]
    fn test_ready_reparse_sends_configure() {
        let t = transition(ProtocolState::Ready, Event::Reparse);
        assert_eq!(t.next, ProtocolState::ConfigureRequested);
        assert_eq!(t.effects, vec![Effect::Send(RequestKind::Configure)]);
    }
}
