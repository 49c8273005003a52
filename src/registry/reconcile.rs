// SPDX-License-Identifier: MIT
//! Background diagnostics reconciliation.
//!
//! After a batch of changes, `post_index` schedules an asynchronous pass
//! that recomputes per-file diagnostics and republishes them to the host.
//! The pass is cooperatively cancellable: it holds the registry lock only
//! for one file at a time, and before each file it checks that its pass id
//! is still the program's current one. A superseded pass drops its
//! remaining work rather than racing to finish — responsiveness over
//! completeness.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::observability::LatencyTracker;
use crate::registry::ServiceRegistry;

// ─── Diagnostics ─────────────────────────────────────────────────────────────

/// Severity of one worker diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    Warning,
    Error,
}

/// One diagnostic reported by the worker for a tracked file.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Line number as reported by the worker.
    pub line: i64,
    pub message: String,
}

impl Diagnostic {
    /// Convert one entry of the worker's `errs` array. Category 0 is a
    /// warning; everything else is an error.
    fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            kind: if value.get("category")?.as_i64()? == 0 {
                DiagnosticKind::Warning
            } else {
                DiagnosticKind::Error
            },
            line: value.get("line")?.as_i64()?,
            message: value.get("messageText")?.as_str()?.to_string(),
        })
    }
}

/// Extract the diagnostics list from a `getDiagnostics` reply.
pub fn diagnostics_from_reply(reply: &Value) -> Vec<Diagnostic> {
    reply
        .get("errs")
        .and_then(Value::as_array)
        .map(|errs| errs.iter().filter_map(Diagnostic::from_value).collect())
        .unwrap_or_default()
}

// ─── Collaborators ───────────────────────────────────────────────────────────

/// Host-side presentation of per-file diagnostics (error badges, problem
/// lists). Called under the registry lock; implementations must be cheap.
pub trait DiagnosticsSink: Send + Sync {
    /// Replace the published diagnostics for one file. Not called when the
    /// underlying query failed — earlier diagnostics stay visible.
    fn publish(&self, root: &Path, relative_path: &str, diagnostics: Vec<Diagnostic>);
}

/// Host-side handling of compile-on-save emit output.
pub trait CompileSink: Send + Sync {
    fn write_emit_output(&self, path: &Path, output: Value);
}

/// Discards diagnostics. Default sink for hosts without a problem list.
pub struct NullDiagnosticsSink;

impl DiagnosticsSink for NullDiagnosticsSink {
    fn publish(&self, _root: &Path, _relative_path: &str, _diagnostics: Vec<Diagnostic>) {}
}

/// Discards emit output.
pub struct NullCompileSink;

impl CompileSink for NullCompileSink {
    fn write_emit_output(&self, _path: &Path, _output: Value) {}
}

// ─── Scheduling ──────────────────────────────────────────────────────────────

impl ServiceRegistry {
    /// Cancel any in-flight reconciliation for a root so it does not starve
    /// the indexing that is about to run. `post_index` restarts it.
    pub async fn pre_index(&self, root: &Path) {
        let mut guard = self.state.lock().await;
        if let Some(program) = guard.programs.get_mut(root) {
            program.current_errors_pass = None;
        }
    }

    /// Schedule a reconciliation pass for a root if any tracked file changed
    /// since the last one. Returns the pass task handle when a pass was
    /// scheduled.
    pub async fn post_index(&self, root: &Path) -> Option<JoinHandle<()>> {
        let (pass_id, files, compile_on_save) = {
            let mut guard = self.state.lock().await;
            let program = guard.programs.get_mut(root)?;
            if !program.need_errors_update {
                return None;
            }
            program.need_errors_update = false;
            let pass_id = self.pass_counter.fetch_add(1, Ordering::Relaxed) + 1;
            program.current_errors_pass = Some(pass_id);
            let mut files: Vec<String> = program.by_relative_path.keys().cloned().collect();
            files.sort();
            let compile_on_save = std::mem::take(&mut program.need_compile_on_save);
            (pass_id, files, compile_on_save)
        };

        let registry = self.clone();
        let root = root.to_path_buf();
        Some(tokio::spawn(async move {
            registry
                .run_errors_pass(root, pass_id, files, compile_on_save)
                .await;
        }))
    }

    async fn run_errors_pass(
        &self,
        root: PathBuf,
        pass_id: u64,
        files: Vec<String>,
        compile_on_save: Vec<PathBuf>,
    ) {
        self.compile_queued(&compile_on_save).await;

        let tracker = LatencyTracker::start("registry.update_errors");
        for relative_path in &files {
            // Config files carry no diagnostics of their own.
            if relative_path.ends_with(".json") {
                continue;
            }
            let mut guard = self.state.lock().await;
            let Some(program) = guard.programs.get_mut(&root) else {
                debug!(root = %root.display(), "errors pass abandoned: program removed");
                return;
            };
            if program.current_errors_pass != Some(pass_id) {
                debug!(root = %root.display(), pass_id, "errors pass superseded");
                return;
            }
            let Some(file) = program.by_relative_path.get(relative_path) else {
                continue;
            };
            let args = [json!("getDiagnostics"), file.wire_path()];
            let process = Arc::clone(&program.process);
            match process.query(&self.config, &args).await {
                Ok(reply) => {
                    self.diagnostics
                        .publish(&root, relative_path, diagnostics_from_reply(&reply));
                }
                // Leave previously published diagnostics for this file
                // unchanged.
                Err(_) => {}
            }
        }
        tracker.finish();
    }

    /// Run compile-on-save for the snapshotted files, handing each file's
    /// emit output to the compile collaborator. Failures degrade silently,
    /// like any interactive call.
    async fn compile_queued(&self, files: &[PathBuf]) {
        for path in files {
            debug!(path = %path.display(), "compile on save");
            if let Some(output) = self.call("getCompileOnSaveEmitOutput", path, &[]).await {
                self.compiler.write_emit_output(path, output);
            }
        }
    }
}
