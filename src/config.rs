// SPDX-License-Identifier: MIT
//! Bridge configuration — library directory, locale, and the generation
//! counter the supervisor polls to know when to resend `configure`.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Prefix under which the worker reports files belonging to the built-in
/// library, resolved relative to the configured lib directory.
pub const BUILTIN_LIB_PREFIX: &str = "(builtin)/";

// ─── Settings ────────────────────────────────────────────────────────────────

/// Externally supplied worker configuration (`lib_dir` + `locale` in
/// `tsbridge.toml`, or set programmatically by the host).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Directory containing `typescript.js`. Empty means not configured;
    /// every query fails with a configuration error until it is set.
    pub lib_dir: String,
    /// Diagnostics locale identifier (e.g. `"de"`, `"zh-cn"`). Empty means
    /// the worker's default (English).
    pub locale: String,
}

impl ServiceSettings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let settings: ServiceSettings = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(settings)
    }
}

// ─── ServiceConfig ───────────────────────────────────────────────────────────

/// Shared configuration handle.
///
/// The generation counter increases monotonically on every [`update`]; the
/// supervisor compares it against its last-applied generation and lazily
/// resends `configure(lib_dir, locale)` on the next query.
///
/// [`update`]: ServiceConfig::update
pub struct ServiceConfig {
    generation: AtomicU64,
    settings: RwLock<ServiceSettings>,
}

/// Thread-safe shared configuration.
pub type SharedConfig = Arc<ServiceConfig>;

impl ServiceConfig {
    /// Create a handle with empty (unconfigured) settings at generation 1.
    pub fn new() -> SharedConfig {
        Self::with_settings(ServiceSettings::default())
    }

    /// Create a handle with the given initial settings.
    pub fn with_settings(settings: ServiceSettings) -> SharedConfig {
        Arc::new(Self {
            generation: AtomicU64::new(1),
            settings: RwLock::new(settings),
        })
    }

    /// Current configuration generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> ServiceSettings {
        self.settings.read().expect("config lock poisoned").clone()
    }

    /// Replace the settings and bump the generation. The new configuration
    /// is applied lazily: the next query on each worker reissues `configure`.
    pub fn update(&self, settings: ServiceSettings) {
        *self.settings.write().expect("config lock poisoned") = settings;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Resolve a path under the built-in library namespace against the
    /// configured lib directory.
    pub fn builtin_lib_file(&self, relative: &str) -> PathBuf {
        Path::new(&self.settings().lib_dir).join(relative)
    }
}

// ─── Version inference ───────────────────────────────────────────────────────

// Matches both assignment styles found in typescript.js:
//   old:  ts.version = "x.y.z";
//   2.5+: ts.versionMajorMinor = "x.y"; ts.version = ts.versionMajorMinor + ".z";
static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"ts\.version(\w*)\s*=\s*(?:ts\.version(\w*)\s*\+\s*)?"(.*?)""#)
        .expect("version regex must compile")
});

/// Infer the TypeScript version shipped in `lib_dir` by scanning
/// `typescript.js` for `ts.version` assignments.
///
/// Returns `"<unknown>"` when the file exists but no full version is found;
/// errors when `typescript.js` cannot be read at all.
pub fn infer_version(lib_dir: &Path) -> Result<String> {
    let path = lib_dir.join("typescript.js");
    let file = fs::File::open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut vars: HashMap<String, String> = HashMap::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        for caps in VERSION_RE.captures_iter(&line) {
            let dst = caps.get(1).map_or("", |m| m.as_str()).to_string();
            let prefix = match caps.get(2) {
                Some(src) => vars
                    .get(src.as_str())
                    .cloned()
                    .unwrap_or_else(|| "<unknown>".to_string()),
                None => String::new(),
            };
            let value = format!("{prefix}{}", &caps[3]);
            let done = dst.is_empty();
            vars.insert(dst, value);
            if done {
                return Ok(vars[""].clone());
            }
        }
    }
    Ok("<unknown>".to_string())
}
