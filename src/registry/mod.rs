// SPDX-License-Identifier: MIT
//! Thread-safe directory of source roots and tracked files, and the call
//! surface every collaborator goes through.
//!
//! All registry and program state lives behind one FIFO-fair
//! `tokio::sync::Mutex`, deliberately held across the full synchronous
//! worker round trip: the wire protocol is strictly one-request-one-reply
//! with no request ids, so concurrent writes would corrupt the stream.
//! Fairness keeps long background scans from starving interactive callers.

pub mod reconcile;

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{SharedConfig, BUILTIN_LIB_PREFIX};
use crate::error::ServiceError;
use crate::process::{WorkerLauncher, WorkerProcess};
use reconcile::{CompileSink, DiagnosticsSink, NullCompileSink, NullDiagnosticsSink};

// ─── Inputs ──────────────────────────────────────────────────────────────────

/// One file handed to the registry by the indexer: where it lives and the
/// current snapshot of its text.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the source root (unique within the root).
    pub relative_path: String,
    /// Absolute path (unique across all roots).
    pub path: PathBuf,
    /// Full text of the file at snapshot time.
    pub text: String,
}

/// What kind of indexing pass is delivering files.
#[derive(Debug, Clone)]
pub struct IndexContext {
    /// The source root the files belong to.
    pub root: PathBuf,
    /// True during a full-project scan.
    pub all_files_indexing: bool,
    /// True when the snapshot reflects unsaved editor modifications.
    pub editor_modifications: bool,
}

// ─── State ───────────────────────────────────────────────────────────────────

pub(crate) struct FileData {
    pub(crate) path: PathBuf,
}

impl FileData {
    /// The path as it appears on the wire.
    pub(crate) fn wire_path(&self) -> Value {
        Value::String(self.path.to_string_lossy().into_owned())
    }
}

/// Global-index entry: which root owns a path, and under what relative key.
struct FileKey {
    root: PathBuf,
    relative_path: String,
}

/// Per-root session state bound to a worker process.
pub(crate) struct ProgramData {
    pub(crate) process: Arc<WorkerProcess>,
    pub(crate) by_relative_path: HashMap<String, FileData>,
    pub(crate) need_compile_on_save: Vec<PathBuf>,
    pub(crate) need_errors_update: bool,
    /// Value-compared pass id of the reconciliation pass allowed to run.
    /// `None` cancels any in-flight pass at its next check.
    pub(crate) current_errors_pass: Option<u64>,
}

pub(crate) struct RegistryState {
    /// Worker shared by every program created while it is valid. Once
    /// invalid it is never resurrected mid-call; a replacement is created
    /// only when a new program is constructed.
    current_process: Option<Arc<WorkerProcess>>,
    pub(crate) programs: HashMap<PathBuf, ProgramData>,
    all_files: HashMap<PathBuf, FileKey>,
}

// ─── ServiceRegistry ─────────────────────────────────────────────────────────

/// Entry point for all collaborators. Cheap to clone.
#[derive(Clone)]
pub struct ServiceRegistry {
    pub(crate) state: Arc<Mutex<RegistryState>>,
    pub(crate) config: SharedConfig,
    launcher: Arc<WorkerLauncher>,
    pub(crate) diagnostics: Arc<dyn DiagnosticsSink>,
    pub(crate) compiler: Arc<dyn CompileSink>,
    pub(crate) pass_counter: Arc<AtomicU64>,
}

impl ServiceRegistry {
    /// Registry with no-op collaborator sinks.
    pub fn new(config: SharedConfig, launcher: WorkerLauncher) -> Self {
        Self::with_sinks(
            config,
            launcher,
            Arc::new(NullDiagnosticsSink),
            Arc::new(NullCompileSink),
        )
    }

    /// Registry publishing to the given collaborators.
    pub fn with_sinks(
        config: SharedConfig,
        launcher: WorkerLauncher,
        diagnostics: Arc<dyn DiagnosticsSink>,
        compiler: Arc<dyn CompileSink>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                current_process: None,
                programs: HashMap::new(),
                all_files: HashMap::new(),
            })),
            config,
            launcher: Arc::new(launcher),
            diagnostics,
            compiler,
            pass_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a batch of files for a root, creating the program (and, if
    /// needed, the worker process) on first contact. Content is pushed to
    /// the worker immediately; unless this is a full-project scan or a live
    /// edit, each file is also queued for compile-on-save.
    pub async fn add_files(&self, ctx: &IndexContext, files: Vec<SourceFile>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if !state.programs.contains_key(&ctx.root) {
            let process = match state.current_process.as_ref().filter(|p| p.is_valid()) {
                Some(process) => Arc::clone(process),
                None => {
                    if let Some(stale) = state.current_process.take() {
                        stale.close().await;
                    }
                    let fresh = Arc::new(WorkerProcess::launch(&self.launcher));
                    state.current_process = Some(Arc::clone(&fresh));
                    fresh
                }
            };
            state.programs.insert(
                ctx.root.clone(),
                ProgramData {
                    process,
                    by_relative_path: HashMap::new(),
                    need_compile_on_save: Vec::new(),
                    need_errors_update: false,
                    current_errors_pass: None,
                },
            );
        }
        let program = match state.programs.get_mut(&ctx.root) {
            Some(program) => program,
            None => return, // unreachable: inserted above
        };

        for file in files {
            let _ = program
                .process
                .call(
                    "updateFile",
                    &[
                        json!(file.path.to_string_lossy()),
                        json!(file.text),
                        json!(ctx.editor_modifications),
                    ],
                )
                .await;
            program.by_relative_path.insert(
                file.relative_path.clone(),
                FileData {
                    path: file.path.clone(),
                },
            );
            program.need_errors_update = true;
            state.all_files.insert(
                file.path.clone(),
                FileKey {
                    root: ctx.root.clone(),
                    relative_path: file.relative_path,
                },
            );
            if !ctx.all_files_indexing && !ctx.editor_modifications {
                program.need_compile_on_save.push(file.path);
            }
        }
    }

    /// Drop tracked files from a root and tell the worker to forget them.
    pub async fn remove_files(&self, root: &Path, relative_paths: &[String]) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(program) = state.programs.get_mut(root) else {
            return;
        };
        for relative_path in relative_paths {
            if let Some(file) = program.by_relative_path.remove(relative_path) {
                program.need_errors_update = true;
                let _ = program.process.call("deleteFile", &[file.wire_path()]).await;
                state.all_files.remove(&file.path);
            }
        }
    }

    /// Tear down a root: cancel any in-flight reconciliation, forget all its
    /// files, and close the worker process if no other program uses it.
    pub async fn remove_program(&self, root: &Path) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(mut program) = state.programs.remove(root) else {
            return;
        };
        program.current_errors_pass = None;

        state.all_files.retain(|_, key| key.root != *root);
        for file in program.by_relative_path.values() {
            let _ = program.process.call("deleteFile", &[file.wire_path()]).await;
        }
        program.by_relative_path.clear();

        let still_used = state
            .programs
            .values()
            .any(|other| Arc::ptr_eq(&other.process, &program.process));
        if !still_used {
            info!(root = %root.display(), "no programs left on worker; shutting it down");
            program.process.close().await;
            if state
                .current_process
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, &program.process))
            {
                state.current_process = None;
            }
        }
    }

    /// Fast path for live edits: push the latest text for a tracked path,
    /// flagged as modified. Untracked paths are ignored.
    pub async fn update_file(&self, path: &Path, text: &str) {
        let guard = self.state.lock().await;
        let Some(program) = Self::owning_program(&guard, path) else {
            return;
        };
        let _ = program
            .process
            .call(
                "updateFile",
                &[json!(path.to_string_lossy()), json!(text), json!(true)],
            )
            .await;
    }

    /// Forward one analysis query for a tracked file, file path prepended.
    /// Fails with `UnknownFile` for untracked paths; propagates the worker's
    /// typed errors otherwise.
    pub async fn call_ex(
        &self,
        method: &str,
        file: &Path,
        args: &[Value],
    ) -> Result<Value, ServiceError> {
        let guard = self.state.lock().await;
        let unknown = || ServiceError::UnknownFile(file.display().to_string());
        let key = guard.all_files.get(file).ok_or_else(unknown)?;
        let program = guard.programs.get(&key.root).ok_or_else(unknown)?;
        let data = program
            .by_relative_path
            .get(&key.relative_path)
            .ok_or_else(unknown)?;

        let mut full_args = Vec::with_capacity(args.len() + 2);
        full_args.push(json!(method));
        full_args.push(data.wire_path());
        full_args.extend(args.iter().cloned());
        program.process.query(&self.config, &full_args).await
    }

    /// Like [`call_ex`], but every failure degrades to `None` — for
    /// interactive features that must not error on every keystroke.
    ///
    /// [`call_ex`]: ServiceRegistry::call_ex
    pub async fn call(&self, method: &str, file: &Path, args: &[Value]) -> Option<Value> {
        self.call_ex(method, file, args).await.ok()
    }

    /// Handle of the worker currently shared by new programs, if any. Hosts
    /// use it for health reporting; `is_valid` turning false means the next
    /// added root gets a fresh process.
    pub async fn current_worker(&self) -> Option<Arc<WorkerProcess>> {
        self.state.lock().await.current_process.clone()
    }

    /// Resolve a tracked path to its concrete file handle.
    pub async fn find_indexed_file(&self, path: &Path) -> Option<PathBuf> {
        let guard = self.state.lock().await;
        let key = guard.all_files.get(path)?;
        let program = guard.programs.get(&key.root)?;
        program
            .by_relative_path
            .get(&key.relative_path)
            .map(|file| file.path.clone())
    }

    /// Resolve any path the worker may report, including paths under the
    /// built-in library namespace (relative to the configured lib
    /// directory). Returns `None` when no such file exists on disk.
    pub fn find_any_file(&self, path: &str) -> Option<PathBuf> {
        let resolved = match path.strip_prefix(BUILTIN_LIB_PREFIX) {
            Some(relative) => self.config.builtin_lib_file(relative),
            None => PathBuf::from(path),
        };
        resolved.exists().then_some(resolved)
    }

    fn owning_program<'a>(state: &'a RegistryState, path: &Path) -> Option<&'a ProgramData> {
        let key = state.all_files.get(path)?;
        state.programs.get(&key.root)
    }
}
