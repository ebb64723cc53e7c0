//! CMake server protocol
//!
//! - **framing**: start/end markers around every message
//! - **message**: typed requests and inbound messages
//! - **correlator**: cookie bookkeeping for the single in-flight request
//! - **state**: pure protocol state machine
//! - **progress**: monotonic progress reporting
//! - **channel**: pump task and server launchers

pub mod channel;
pub mod correlator;
pub mod framing;
pub mod message;
pub mod progress;
pub mod state;

pub use channel::{ChannelEvent, CmakeServerLauncher, ServerChannel, ServerLauncher, spawn_pump};
pub use correlator::{Correlation, Correlator, CorrelatorError};
pub use framing::{FramingError, ServerFraming};
pub use message::{ProtocolVersion, Request, RequestKind, ServerMessage};
pub use progress::{ProgressTracker, ProgressUpdate};
pub use state::{Effect, Event, ProtocolState, Transition, transition};
