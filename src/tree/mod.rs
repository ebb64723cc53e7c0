//! Project tree built from a parse snapshot

pub mod node;
pub mod reconcile;

pub use node::{FileKind, KnownFile, Node, NodeId, NodeKind, ProjectTree};
pub use reconcile::{ReconcileReport, reconcile};
