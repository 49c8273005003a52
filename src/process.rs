// SPDX-License-Identifier: MIT
//! Worker process supervision.
//!
//! `WorkerProcess` owns exactly one child process implementing the analysis
//! service and exposes a synchronous call/response primitive over its stdio
//! pipes. Failure detection is terminal per instance: any launch failure,
//! stream desync, closed pipe, or malformed reply marks the supervisor
//! invalid forever; a replacement is created only when a new program is
//! constructed for a root. The child's stderr is drained by a background
//! task into a bounded buffer that backs later error messages.

use anyhow::{bail, Context, Result};
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::protocol::{self, Reply};

/// How much captured stderr text is kept for error messages.
const STDERR_CAPTURE_BYTES: usize = 1000;

/// How many characters of wire traffic are logged per line.
const WIRE_LOG_CHARS: usize = 120;

// ─── Launcher ────────────────────────────────────────────────────────────────

/// Ordered list of candidate command lines for starting the worker.
///
/// The stock launcher mirrors the runtimes the worker script is known to run
/// under; the first candidate that spawns wins. Node installs to
/// `/usr/local/bin` on macOS, which GUI-started applications do not have on
/// their `PATH`, hence the absolute-path fallback.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    script: Option<PathBuf>,
    attempts: Vec<Vec<String>>,
}

impl WorkerLauncher {
    /// Launcher for a Node.js worker script, trying `nodejs`, `node`, and
    /// `/usr/local/bin/node` in order.
    pub fn node(script: impl Into<PathBuf>) -> Self {
        let script = script.into();
        let attempts = ["nodejs", "node", "/usr/local/bin/node"]
            .iter()
            .map(|runtime| {
                vec![
                    (*runtime).to_string(),
                    "--harmony".to_string(),
                    script.to_string_lossy().into_owned(),
                ]
            })
            .collect();
        Self {
            script: Some(script),
            attempts,
        }
    }

    /// Launcher for a single explicit command line (used by embedders that
    /// run a non-Node worker, and by the test suite).
    pub fn from_argv(argv: Vec<String>) -> Self {
        Self {
            script: None,
            attempts: vec![argv],
        }
    }
}

// ─── WorkerProcess ───────────────────────────────────────────────────────────

/// Marker for a failed `call`: the supervisor has recorded a terminal
/// communication error and will never carry another request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommFailure;

struct WorkerIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// One supervised worker process.
///
/// Shared (via `Arc`) by every program created while it is valid. The io
/// mutex is held across the full write-then-read round trip, so concurrent
/// callers can never interleave request lines on the worker's stdin.
pub struct WorkerProcess {
    io: Mutex<Option<WorkerIo>>,
    child: Arc<Mutex<Option<Child>>>,
    stderr: std::sync::Mutex<Option<ChildStderr>>,
    capture_started: AtomicBool,
    /// Terminal communication error, recorded once.
    comm_error: OnceCell<String>,
    /// Captured stderr text plus exit status, written by the capture task.
    proc_error: Arc<OnceCell<String>>,
    /// Last configuration generation this worker was configured against.
    config_gen: AtomicU64,
    config_error: std::sync::Mutex<Option<String>>,
}

impl WorkerProcess {
    /// Try each launcher candidate in order. Never fails: when the script is
    /// missing or no candidate starts, the supervisor is permanently invalid
    /// from creation and no request is ever attempted.
    pub fn launch(launcher: &WorkerLauncher) -> Self {
        let mut process = Self {
            io: Mutex::new(None),
            child: Arc::new(Mutex::new(None)),
            stderr: std::sync::Mutex::new(None),
            capture_started: AtomicBool::new(false),
            comm_error: OnceCell::new(),
            proc_error: Arc::new(OnceCell::new()),
            config_gen: AtomicU64::new(0),
            config_error: std::sync::Mutex::new(None),
        };

        if let Some(script) = &launcher.script {
            if !script.exists() {
                let _ = process
                    .comm_error
                    .set(format!("worker script missing: {}", script.display()));
                return process;
            }
        }

        let mut failed_attempts = String::new();
        for argv in &launcher.attempts {
            match Self::spawn_argv(argv) {
                Ok((child, io, stderr)) => {
                    info!(command = %argv.join(" "), "started worker process");
                    process.child = Arc::new(Mutex::new(Some(child)));
                    process.io = Mutex::new(Some(io));
                    process.stderr = std::sync::Mutex::new(Some(stderr));
                    return process;
                }
                Err(err) => {
                    failed_attempts.push('\n');
                    failed_attempts.push_str(&format!("{err:#}"));
                }
            }
        }
        let _ = process.comm_error.set(format!(
            "error creating worker process:{failed_attempts}\n\n\
             Make sure the worker runtime is installed and on your PATH."
        ));
        process
    }

    fn spawn_argv(argv: &[String]) -> Result<(Child, WorkerIo, ChildStderr)> {
        let (program, args) = argv
            .split_first()
            .context("empty worker command line")?;
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn '{program}'"))?;
        let stdin = child.stdin.take().context("worker stdin not available")?;
        let stdout = child.stdout.take().context("worker stdout not available")?;
        let stderr = child.stderr.take().context("worker stderr not available")?;
        Ok((
            child,
            WorkerIo {
                stdin,
                stdout: BufReader::new(stdout),
            },
            stderr,
        ))
    }

    /// True iff no terminal communication error has been recorded.
    pub fn is_valid(&self) -> bool {
        self.comm_error.get().is_none()
    }

    /// Send one request and block for its reply.
    ///
    /// There is deliberately no read timeout: the protocol has no request
    /// ids, so a timed-out reply could never be matched to a later request.
    /// A hung worker therefore stalls callers until it is replaced.
    pub async fn call(&self, func: &str, args: &[Value]) -> Result<Value, CommFailure> {
        if self.comm_error.get().is_some() {
            return Err(CommFailure);
        }
        self.ensure_capture();

        let line = protocol::encode_request(func, args);
        trace!(
            len = line.len(),
            "OUT: {}",
            protocol::truncate_for_log(&line, WIRE_LOG_CHARS)
        );
        let started = Instant::now();

        let mut io = self.io.lock().await;
        let Some(io) = io.as_mut() else {
            return Err(CommFailure);
        };
        match Self::exchange(io, &line, started).await {
            Ok(value) => Ok(value),
            Err(err) => {
                let message = format!("error communicating with worker: {err:#}");
                warn!("{message}");
                let _ = self.comm_error.set(message);
                Err(CommFailure)
            }
        }
    }

    /// One write-then-read round trip. Any error here is terminal.
    async fn exchange(io: &mut WorkerIo, line: &str, started: Instant) -> Result<Value> {
        // The protocol is strictly one-request-one-reply; data already
        // buffered on stdout means a previous reply was not fully consumed.
        if !io.stdout.buffer().is_empty() {
            bail!("unexpected data on stdout");
        }
        io.stdin
            .write_all(line.as_bytes())
            .await
            .context("write to worker stdin")?;
        io.stdin.flush().await.context("flush worker stdin")?;

        let mut received = String::new();
        loop {
            received.clear();
            let n = io
                .stdout
                .read_line(&mut received)
                .await
                .context("read from worker stdout")?;
            if n == 0 {
                bail!("worker closed stdout");
            }
            let stripped = received.trim_end_matches(|c| c == '\n' || c == '\r');
            match protocol::decode_line(stripped)
                .with_context(|| format!("malformed reply: {}", protocol::truncate_for_log(stripped, WIRE_LOG_CHARS)))?
            {
                Reply::Log(record) => debug!(worker_log = %record),
                Reply::Result(value) => {
                    trace!(
                        len = stripped.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "IN: {}",
                        protocol::truncate_for_log(stripped, WIRE_LOG_CHARS)
                    );
                    return Ok(value);
                }
            }
        }
    }

    /// Issue one analysis query, reapplying configuration first when the
    /// generation counter says it is stale.
    ///
    /// `args` is the full query argument list: method name, file path, then
    /// any method-specific arguments.
    pub async fn query(&self, config: &ServiceConfig, args: &[Value]) -> Result<Value, ServiceError> {
        let generation = config.generation();
        if self.config_gen.load(Ordering::Acquire) < generation {
            self.config_gen.store(generation, Ordering::Release);
            let settings = config.settings();
            let error = if settings.lib_dir.is_empty() {
                Some("TypeScript lib directory not set".to_string())
            } else {
                match self
                    .call("configure", &[json!(settings.lib_dir), json!(settings.locale)])
                    .await
                {
                    Ok(Value::String(message)) => Some(format!(
                        "failed to load TypeScript from {}\n\n{message}",
                        settings.lib_dir
                    )),
                    // A communication failure surfaces on the query call
                    // below; any other value means configure succeeded.
                    _ => None,
                }
            };
            *self.config_error.lock().expect("config error lock poisoned") = error;
        }
        let config_error = self
            .config_error
            .lock()
            .expect("config error lock poisoned")
            .clone();
        if let Some(message) = config_error {
            return Err(ServiceError::Configuration(format!(
                "{message}\n\nPlease check the bridge configuration (lib directory and locale)."
            )));
        }

        match self.call("query", args).await {
            Err(CommFailure) => {
                let detail = self
                    .proc_error
                    .get()
                    .or_else(|| self.comm_error.get())
                    .cloned()
                    .unwrap_or_else(|| "worker unavailable".to_string());
                Err(ServiceError::Communication(format!(
                    "{detail}\n\nRemove and re-add the project root to retry."
                )))
            }
            Ok(Value::String(message)) => {
                warn!(error = %message, "caught exception in worker");
                Err(ServiceError::Worker(message))
            }
            Ok(value) => Ok(value),
        }
    }

    /// Terminate the process and all streams. Idempotent; the supervisor
    /// reads invalid afterwards.
    pub async fn close(&self) {
        let _ = self.comm_error.set("worker process closed".to_string());
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.start_kill();
        }
    }

    /// Start the stderr capture task on the first call.
    fn ensure_capture(&self) {
        if self.capture_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mut stderr) = self
            .stderr
            .lock()
            .expect("stderr lock poisoned")
            .take()
        else {
            return;
        };
        let child = Arc::clone(&self.child);
        let proc_error = Arc::clone(&self.proc_error);
        tokio::spawn(async move {
            let mut captured: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let room = STDERR_CAPTURE_BYTES.saturating_sub(captured.len());
                        captured.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
            // stderr hit EOF; the process is exiting (or closed the stream).
            // Reap it so the exit status can back later error messages.
            let taken = child.lock().await.take();
            let exit_status = match taken {
                Some(mut child) => match child.wait().await {
                    Ok(status) => format!("[exit status {}]", status.code().unwrap_or(-1)),
                    Err(err) => format!("[{err}]"),
                },
                None => "[exit status unknown]".to_string(),
            };
            let text = String::from_utf8_lossy(&captured).into_owned();
            let _ = proc_error.set(format!("error in worker process:\n{text}{exit_status}"));
        });
    }
}
