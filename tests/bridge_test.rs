//! Full-stack tests against scripted fake workers.
//!
//! Each fake worker is a small `sh` script speaking the real wire protocol:
//! it journals every request line it receives to a file (so tests can assert
//! exactly what reached the worker's stdin, in what shape) and replies with
//! one JSON value per line.

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use tsbridge::{
    CompileSink, Diagnostic, DiagnosticKind, DiagnosticsSink, IndexContext, ServiceConfig,
    ServiceRegistry, ServiceSettings, SharedConfig, SourceFile, WorkerLauncher,
};

// ─── Fake workers ────────────────────────────────────────────────────────────

/// A scripted worker plus the journal its request lines land in.
struct FakeWorker {
    _dir: TempDir,
    journal: PathBuf,
    launcher: WorkerLauncher,
}

/// Build a worker from a shell `case` body handling one request line `$l`.
/// The default arm must reply with one JSON line.
fn scripted_worker(case_arms: &str) -> FakeWorker {
    let dir = TempDir::new().expect("temp dir");
    let journal = dir.path().join("journal.txt");
    let script = format!(
        r#"while IFS= read -r l; do
  printf '%s\n' "$l" >> "{journal}"
  case "$l" in
{case_arms}
    *) echo null ;;
  esac
done
"#,
        journal = journal.display(),
    );
    let script_path = dir.path().join("worker.sh");
    fs::write(&script_path, script).expect("write worker script");
    let launcher = WorkerLauncher::from_argv(vec![
        "sh".to_string(),
        script_path.to_string_lossy().into_owned(),
    ]);
    FakeWorker {
        _dir: dir,
        journal,
        launcher,
    }
}

/// Worker answering `null` to everything, with an `echo` query that returns
/// its own argument verbatim.
fn echo_worker() -> FakeWorker {
    // The reply is wrapped in an array: a bare string reply would read as a
    // worker-raised exception.
    scripted_worker(
        r#"    'query("echo"'*) r=${l#*,}; r=${r#*,}; printf '[%s]\n' "${r%)}" ;;"#,
    )
}

fn journal_lines(worker: &FakeWorker) -> Vec<String> {
    fs::read_to_string(&worker.journal)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn count_with_prefix(worker: &FakeWorker, prefix: &str) -> usize {
    journal_lines(worker)
        .iter()
        .filter(|line| line.starts_with(prefix))
        .count()
}

// ─── Test scaffolding ────────────────────────────────────────────────────────

fn configured(lib_dir: &str) -> SharedConfig {
    ServiceConfig::with_settings(ServiceSettings {
        lib_dir: lib_dir.to_string(),
        locale: String::new(),
    })
}

fn index_ctx(root: &Path) -> IndexContext {
    IndexContext {
        root: root.to_path_buf(),
        all_files_indexing: false,
        editor_modifications: false,
    }
}

fn source_file(root: &Path, relative: &str, text: &str) -> SourceFile {
    SourceFile {
        relative_path: relative.to_string(),
        path: root.join(relative),
        text: text.to_string(),
    }
}

#[derive(Default)]
struct RecordingDiagnostics(Mutex<Vec<(String, Vec<Diagnostic>)>>);

impl DiagnosticsSink for RecordingDiagnostics {
    fn publish(&self, _root: &Path, relative_path: &str, diagnostics: Vec<Diagnostic>) {
        self.0
            .lock()
            .unwrap()
            .push((relative_path.to_string(), diagnostics));
    }
}

#[derive(Default)]
struct RecordingCompiles(Mutex<Vec<PathBuf>>);

impl CompileSink for RecordingCompiles {
    fn write_emit_output(&self, path: &Path, _output: Value) {
        self.0.lock().unwrap().push(path.to_path_buf());
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn removed_files_leave_the_map_and_reach_the_worker() {
    let worker = echo_worker();
    let registry = ServiceRegistry::new(configured("/opt/ts/lib"), worker.launcher.clone());
    let root = PathBuf::from("/proj");

    registry
        .add_files(
            &index_ctx(&root),
            vec![
                source_file(&root, "src/a.ts", "let a = 1;"),
                source_file(&root, "src/b.ts", "let b = 2;"),
            ],
        )
        .await;
    assert!(registry
        .find_indexed_file(Path::new("/proj/src/a.ts"))
        .await
        .is_some());

    registry
        .remove_files(&root, &["src/a.ts".to_string(), "src/b.ts".to_string()])
        .await;

    assert!(registry
        .find_indexed_file(Path::new("/proj/src/a.ts"))
        .await
        .is_none());
    assert!(registry
        .find_indexed_file(Path::new("/proj/src/b.ts"))
        .await
        .is_none());

    let lines = journal_lines(&worker);
    assert!(lines.contains(&"deleteFile(\"/proj/src/a.ts\")".to_string()));
    assert!(lines.contains(&"deleteFile(\"/proj/src/b.ts\")".to_string()));
}

#[tokio::test]
async fn concurrent_calls_never_interleave_request_lines() {
    let worker = echo_worker();
    let registry = ServiceRegistry::new(configured("/opt/ts/lib"), worker.launcher.clone());
    let root = PathBuf::from("/proj");

    let files: Vec<SourceFile> = (0..8)
        .map(|i| source_file(&root, &format!("src/f{i}.ts"), &format!("let x{i} = {i};")))
        .collect();
    registry.add_files(&index_ctx(&root), files).await;

    let mut tasks = Vec::new();
    for i in 0..32 {
        let registry = registry.clone();
        let path = root.join(format!("src/f{}.ts", i % 8));
        tasks.push(tokio::spawn(async move {
            registry
                .call(
                    "getQuickInfo",
                    &path,
                    &[json!(format!("marker-{i}-with,comma and (parens)"))],
                )
                .await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_some());
    }

    // Every journaled line must be one complete, well-formed request.
    let lines = journal_lines(&worker);
    assert_eq!(count_with_prefix(&worker, "query(\"getQuickInfo\""), 32);
    for line in &lines {
        assert!(
            line.ends_with(')'),
            "interleaved or truncated request line: {line:?}"
        );
        let open = line.find('(').expect("request line has no '('");
        assert!(
            line[..open].chars().all(|c| c.is_ascii_alphanumeric()),
            "garbled function name: {line:?}"
        );
    }
}

#[tokio::test]
async fn configure_is_sent_once_per_generation() {
    let worker = echo_worker();
    let config = configured("/opt/ts/lib");
    let registry = ServiceRegistry::new(Arc::clone(&config), worker.launcher.clone());
    let root = PathBuf::from("/proj");
    let file = root.join("src/a.ts");

    registry
        .add_files(&index_ctx(&root), vec![source_file(&root, "src/a.ts", "")])
        .await;

    registry.call_ex("getQuickInfo", &file, &[]).await.unwrap();
    registry.call_ex("getQuickInfo", &file, &[]).await.unwrap();
    assert_eq!(count_with_prefix(&worker, "configure("), 1);

    // Generation bump: exactly one more configure before the next query.
    config.update(config.settings());
    registry.call_ex("getQuickInfo", &file, &[]).await.unwrap();
    registry.call_ex("getQuickInfo", &file, &[]).await.unwrap();
    assert_eq!(count_with_prefix(&worker, "configure("), 2);
    assert_eq!(count_with_prefix(&worker, "query("), 4);
}

#[tokio::test]
async fn unconfigured_query_reaches_no_process() {
    let worker = echo_worker();
    let registry = ServiceRegistry::new(ServiceConfig::new(), worker.launcher.clone());
    let root = PathBuf::from("/proj");
    let file = root.join("src/a.ts");

    registry
        .add_files(&index_ctx(&root), vec![source_file(&root, "src/a.ts", "")])
        .await;
    let before = journal_lines(&worker).len();

    let err = registry.call_ex("getQuickInfo", &file, &[]).await.unwrap_err();
    assert!(matches!(err, tsbridge::ServiceError::Configuration(_)));
    assert_eq!(
        journal_lines(&worker).len(),
        before,
        "a blocked query must perform zero process calls"
    );
}

#[tokio::test]
async fn crash_is_terminal_until_the_root_is_readded() {
    let worker = scripted_worker(r#"    'query("crash"'*) exit 1 ;;"#);
    let registry = ServiceRegistry::new(configured("/opt/ts/lib"), worker.launcher.clone());
    let root = PathBuf::from("/proj");
    let file = root.join("src/a.ts");

    registry
        .add_files(&index_ctx(&root), vec![source_file(&root, "src/a.ts", "")])
        .await;
    registry.call_ex("getQuickInfo", &file, &[]).await.unwrap();

    // Worker exits mid-request: the reply never comes.
    let err = registry.call_ex("crash", &file, &[]).await.unwrap_err();
    assert!(matches!(err, tsbridge::ServiceError::Communication(_)));

    // Terminal per supervisor instance — every later query fails the same
    // way, no retry.
    let err = registry.call_ex("getQuickInfo", &file, &[]).await.unwrap_err();
    assert!(matches!(err, tsbridge::ServiceError::Communication(_)));

    // Recovery is by replacing the process: remove and re-add the root.
    registry.remove_program(&root).await;
    registry
        .add_files(&index_ctx(&root), vec![source_file(&root, "src/a.ts", "")])
        .await;
    let reply = registry.call_ex("getQuickInfo", &file, &[]).await.unwrap();
    assert_eq!(reply, Value::Null);
}

#[tokio::test]
async fn snapshot_text_round_trips_exactly() {
    let worker = echo_worker();
    let registry = ServiceRegistry::new(configured("/opt/ts/lib"), worker.launcher.clone());
    let root = PathBuf::from("/proj");
    let file = root.join("src/a.ts");

    let text = "héllo 世界\n\"quoted\", \\back\\slash, (parens)\n\ttab\u{1}\u{1f} end";
    registry
        .add_files(&index_ctx(&root), vec![source_file(&root, "src/a.ts", text)])
        .await;

    // The journaled updateFile line must carry the text as one escaped JSON
    // literal that decodes back to the original.
    let update_line = journal_lines(&worker)
        .into_iter()
        .find(|line| line.starts_with("updateFile("))
        .expect("updateFile reached the worker");
    let args = update_line
        .strip_prefix("updateFile(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap();
    let first_comma = args.find(',').unwrap();
    let last_comma = args.rfind(',').unwrap();
    let journaled: String = serde_json::from_str(&args[first_comma + 1..last_comma]).unwrap();
    assert_eq!(journaled, text);

    // And the worker echoing the literal back must yield the exact text.
    let reply = registry
        .call_ex("echo", &file, &[json!(text)])
        .await
        .unwrap();
    assert_eq!(reply, json!([text]));
}

#[tokio::test]
async fn last_program_closes_the_shared_process() {
    let worker = echo_worker();
    let registry = ServiceRegistry::new(configured("/opt/ts/lib"), worker.launcher.clone());
    let root_a = PathBuf::from("/proj-a");
    let root_b = PathBuf::from("/proj-b");

    registry
        .add_files(&index_ctx(&root_a), vec![source_file(&root_a, "a.ts", "")])
        .await;
    registry
        .add_files(&index_ctx(&root_b), vec![source_file(&root_b, "b.ts", "")])
        .await;

    let process = registry.current_worker().await.expect("worker running");
    assert!(process.is_valid());

    // Still used by the other program: stays open.
    registry.remove_program(&root_a).await;
    assert!(process.is_valid());

    registry.remove_program(&root_b).await;
    assert!(!process.is_valid());
    assert!(registry.current_worker().await.is_none());
}

#[tokio::test]
async fn reconciliation_publishes_diagnostics_and_compiles_queued_files() {
    let worker = scripted_worker(
        r#"    'query("getDiagnostics"'*) echo '{"errs":[{"category":1,"line":2,"messageText":"oops"},{"category":0,"line":9,"messageText":"meh"}]}' ;;"#,
    );
    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let compiles = Arc::new(RecordingCompiles::default());
    let registry = ServiceRegistry::with_sinks(
        configured("/opt/ts/lib"),
        worker.launcher.clone(),
        Arc::clone(&diagnostics) as Arc<dyn DiagnosticsSink>,
        Arc::clone(&compiles) as Arc<dyn CompileSink>,
    );
    let root = PathBuf::from("/proj");

    registry
        .add_files(
            &index_ctx(&root),
            vec![
                source_file(&root, "src/a.ts", "let a;"),
                source_file(&root, "tsconfig.json", "{}"),
            ],
        )
        .await;

    let pass = registry.post_index(&root).await.expect("pass scheduled");
    pass.await.unwrap();

    // Config files are skipped; the .ts file gets its diagnostics published.
    let published = diagnostics.0.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    let (relative_path, diags) = &published[0];
    assert_eq!(relative_path, "src/a.ts");
    assert_eq!(diags.len(), 2);
    assert_eq!(diags[0].kind, DiagnosticKind::Error);
    assert_eq!(diags[0].line, 2);
    assert_eq!(diags[0].message, "oops");
    assert_eq!(diags[1].kind, DiagnosticKind::Warning);

    // Both files were queued for compile-on-save (not a full scan, not a
    // live edit) and their emit output reached the compile collaborator.
    let compiled = compiles.0.lock().unwrap().clone();
    assert_eq!(compiled.len(), 2);
    assert_eq!(
        count_with_prefix(&worker, "query(\"getCompileOnSaveEmitOutput\""),
        2
    );

    // Nothing pending: a second post_index schedules nothing.
    assert!(registry.post_index(&root).await.is_none());
}

#[tokio::test]
async fn superseded_pass_stops_querying_and_publishing() {
    let worker = scripted_worker(
        r#"    'query("getDiagnostics"'*) sleep 0.3; echo '{"errs":[]}' ;;"#,
    );
    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let registry = ServiceRegistry::with_sinks(
        configured("/opt/ts/lib"),
        worker.launcher.clone(),
        Arc::clone(&diagnostics) as Arc<dyn DiagnosticsSink>,
        Arc::new(RecordingCompiles::default()),
    );
    let root = PathBuf::from("/proj");

    let files: Vec<SourceFile> = (0..5)
        .map(|i| source_file(&root, &format!("src/f{i}.ts"), "let x;"))
        .collect();
    let ctx = IndexContext {
        root: root.clone(),
        all_files_indexing: true, // nothing queued for compile-on-save
        editor_modifications: false,
    };
    registry.add_files(&ctx, files).await;

    let pass = registry.post_index(&root).await.expect("pass scheduled");
    // Let the pass finish a file or two, then supersede it.
    tokio::time::sleep(Duration::from_millis(450)).await;
    registry.pre_index(&root).await;
    pass.await.unwrap();

    let published = diagnostics.0.lock().unwrap().len();
    assert!(
        published < 5,
        "superseded pass must drop its remaining files (published {published})"
    );
    let queried = count_with_prefix(&worker, "query(\"getDiagnostics\"");
    assert!(queried < 5, "superseded pass kept querying ({queried} files)");

    // And it stays stopped: no further queries arrive later.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        count_with_prefix(&worker, "query(\"getDiagnostics\""),
        queried
    );
}

#[tokio::test]
async fn update_file_pushes_modified_snapshot() {
    let worker = echo_worker();
    let registry = ServiceRegistry::new(configured("/opt/ts/lib"), worker.launcher.clone());
    let root = PathBuf::from("/proj");

    registry
        .add_files(&index_ctx(&root), vec![source_file(&root, "src/a.ts", "old")])
        .await;
    registry
        .update_file(Path::new("/proj/src/a.ts"), "let fresh = true;")
        .await;

    let lines = journal_lines(&worker);
    assert!(lines
        .iter()
        .any(|l| l == "updateFile(\"/proj/src/a.ts\",\"let fresh = true;\",true)"));
}
