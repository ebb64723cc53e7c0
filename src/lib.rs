//! CMake server-mode reader
//!
//! Talks to `cmake -E server` for one build directory and turns its replies
//! into a typed project model, a stable project tree and a flat code model.
//!
//! ```no_run
//! use cmake_server_reader::{CmakeServerLauncher, ReaderParameters, ServerModeReader};
//!
//! # async fn run() -> Result<(), cmake_server_reader::ReaderError> {
//! let mut reader = ServerModeReader::new(CmakeServerLauncher::new());
//! reader.set_parameters(ReaderParameters::builder("/src/app", "/src/app/build").build());
//! reader.parse(false).await?;
//! reader.wait_for_completion().await?;
//! for target in reader.build_targets() {
//!     println!("{}", target.name);
//! }
//! reader.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod logging;

pub mod codemodel;
pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod reader;
pub mod server;
pub mod tree;

#[cfg(test)]
mod test_utils;

#[cfg(all(test, feature = "test-logging"))]
setup_test_logging!();

pub use codemodel::{CodeModel, FileSettings, ProjectPart, project_code_model};
pub use config::{ConfigItem, ReaderParameters, resolve_cmake_executable};
pub use error::ReaderError;
pub use model::cache::{CacheEntry, CacheEntryType, CmakeCache};
pub use model::{Diagnostic, ProjectModel, Snapshot, TargetType};
pub use reader::{BuildTarget, ReaderEvent, ServerModeReader};
pub use server::{CmakeServerLauncher, ServerLauncher};
pub use tree::{FileKind, KnownFile, ProjectTree, ReconcileReport};
