// SPDX-License-Identifier: MIT
//! Out-of-process TypeScript language-service bridge.
//!
//! One long-lived worker process performs the actual source analysis; this
//! crate supervises it, multiplexes many source roots and files through its
//! line-oriented wire protocol, and exposes a thread-safe, crash-resilient
//! facade to concurrent callers (editor actions, background indexing,
//! diagnostics reconciliation).
//!
//! Entry point is [`registry::ServiceRegistry`]. The worker process itself
//! is opaque — the bridge only speaks the protocol in [`protocol`].

pub mod config;
pub mod error;
pub mod observability;
pub mod process;
pub mod protocol;
pub mod registry;

pub use config::{ServiceConfig, ServiceSettings, SharedConfig};
pub use error::ServiceError;
pub use process::{WorkerLauncher, WorkerProcess};
pub use registry::reconcile::{CompileSink, Diagnostic, DiagnosticKind, DiagnosticsSink};
pub use registry::{IndexContext, ServiceRegistry, SourceFile};
