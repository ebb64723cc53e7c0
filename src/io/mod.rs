//! I/O layer - Generic abstractions for process management and transport
//!
//! - **Transport**: raw text exchange with the server process
//! - **Process**: external process lifecycle with stderr draining
//!
//! Nothing in here knows about CMake server framing or messages.

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessError, ProcessManager, ProcessState, StderrMonitor, StopMode,
};
pub use transport::{MockTransport, MockTransportError, StdioTransport, StdioTransportError, Transport};
