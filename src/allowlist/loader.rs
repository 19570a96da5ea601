//! Allowlist loading and hot-reload.
//!
//! The allowlist file is either a top-level sequence of entries or a mapping
//! with an `allowlist:` key. Invalid entries are skipped with a warning;
//! invalid `pattern` fields are discarded (the entry stays as a rule-id-only
//! match). A parse failure leaves the previous entry set untouched, which is
//! what makes hot-reload safe.
//!
//! Readers take an `Arc` snapshot of the entry list — a reload swaps the
//! whole list atomically, so a reader can never observe a half-parsed state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{RecursiveMode, Watcher};
use regex::Regex;

use crate::dashboard::ReloadNotifier;

const VALID_SCOPES: [&str; 2] = ["global", "upstream_path"];

/// A single suppression rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowlistEntry {
    /// The scanner rule id to suppress (e.g. `CREDENTIAL_DETECTED`).
    pub rule_id: String,
    /// Operator documentation.
    pub note: Option<String>,
    /// Optional content pattern. Validated at load time against the
    /// linear-time engine; an invalid pattern is dropped, not the entry.
    pub pattern: Option<String>,
    /// `global` in v1. Unknown scopes downgrade to `global` with a warning.
    pub scope: String,
}

/// Snapshot-swapping allowlist store.
#[derive(Debug, Default)]
pub struct AllowlistLoader {
    entries: RwLock<Arc<Vec<AllowlistEntry>>>,
}

impl AllowlistLoader {
    /// Current entry snapshot. Cheap — clones an `Arc`, never blocks a
    /// concurrent reload for longer than the pointer swap.
    pub fn entries(&self) -> Arc<Vec<AllowlistEntry>> {
        match self.entries.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the entry set wholesale.
    pub fn install_entries(&self, entries: Vec<AllowlistEntry>) {
        let snapshot = Arc::new(entries);
        match self.entries.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// Load entries from a YAML file.
    ///
    /// - missing file → empty allowlist, `Ok(0)` (not an error)
    /// - parse/read failure → `Err`, prior entries kept
    /// - otherwise → entries swapped in, `Ok(count)`
    pub fn load(&self, path: &Path) -> anyhow::Result<usize> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "allowlist file not found — empty allowlist");
                self.install_entries(Vec::new());
                return Ok(0);
            }
            Err(e) => {
                anyhow::bail!("failed to read allowlist {}: {e}", path.display());
            }
        };

        let value: serde_yaml::Value = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("allowlist YAML parse error: {e}"))?;

        let entries = parse_allowlist_value(&value);
        let count = entries.len();
        self.install_entries(entries);
        tracing::debug!(count, path = %path.display(), "allowlist loaded");
        Ok(count)
    }

    /// Spawn the hot-reload watcher. Watches the file's parent directory
    /// (editors replace files atomically) and reloads on any event touching
    /// the allowlist path. Survives parse errors: prior entries stay active.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        path: PathBuf,
        notifier: Arc<dyn ReloadNotifier>,
    ) -> tokio::task::JoinHandle<()> {
        let loader = self.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let mut watcher =
                match notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
                    let _ = tx.send(event);
                }) {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::error!(error = %e, "allowlist watcher failed to start — hot-reload disabled");
                        return;
                    }
                };

            let watch_dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf();
            if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
                tracing::error!(
                    error = %e,
                    dir = %watch_dir.display(),
                    "allowlist watcher failed to register — hot-reload disabled"
                );
                return;
            }
            tracing::info!(path = %path.display(), "allowlist file watcher started");

            while let Some(event) = rx.recv().await {
                match event {
                    Ok(event) => {
                        // Events without paths are reloaded conservatively.
                        let touches_file = event.paths.is_empty()
                            || event
                                .paths
                                .iter()
                                .any(|p| p == &path || p.file_name() == path.file_name());
                        if !touches_file {
                            continue;
                        }
                        match loader.load(&path) {
                            Ok(count) => notifier.notify_config_reloaded(count),
                            Err(e) => {
                                tracing::error!(
                                    error = %e,
                                    "allowlist reload failed — keeping prior entries"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "allowlist watch error (non-fatal)");
                    }
                }
            }
        })
    }
}

/// Parse the YAML root: a bare sequence or a mapping with `allowlist:`.
fn parse_allowlist_value(value: &serde_yaml::Value) -> Vec<AllowlistEntry> {
    if value.is_null() {
        return Vec::new();
    }
    if let Some(items) = value.as_sequence() {
        return parse_entries(items);
    }
    if value.is_mapping() {
        return match value.get("allowlist") {
            Some(inner) if inner.is_null() => Vec::new(),
            Some(inner) => match inner.as_sequence() {
                Some(items) => parse_entries(items),
                None => {
                    tracing::warn!("allowlist key is not a list — ignoring");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
    }
    tracing::warn!("allowlist root is neither list nor mapping — empty");
    Vec::new()
}

fn parse_entries(items: &[serde_yaml::Value]) -> Vec<AllowlistEntry> {
    let mut entries = Vec::new();
    for (index, item) in items.iter().enumerate() {
        if !item.is_mapping() {
            tracing::warn!(index, "allowlist entry is not a mapping — skipping");
            continue;
        }

        let Some(rule_id) = item.get("rule_id").and_then(|v| v.as_str()) else {
            tracing::warn!(index, "allowlist entry missing rule_id — skipping");
            continue;
        };

        let mut scope = item
            .get("scope")
            .and_then(|v| v.as_str())
            .unwrap_or("global")
            .to_string();
        if !VALID_SCOPES.contains(&scope.as_str()) {
            tracing::warn!(rule_id, %scope, "unknown scope — treating as global");
            scope = "global".to_string();
        } else if scope == "upstream_path" {
            tracing::warn!(rule_id, "scope 'upstream_path' not enforced in v1 — treated as global");
            scope = "global".to_string();
        }

        let pattern = match item.get("pattern") {
            None => None,
            Some(p) if p.is_null() => None,
            Some(p) => match p.as_str() {
                Some(p) => match Regex::new(p) {
                    Ok(_) => Some(p.to_string()),
                    Err(e) => {
                        tracing::warn!(
                            rule_id,
                            pattern = %p,
                            error = %e,
                            "allowlist pattern is not a valid regex — ignoring pattern"
                        );
                        None
                    }
                },
                None => {
                    tracing::warn!(rule_id, "allowlist pattern is not a string — ignoring");
                    None
                }
            },
        };

        entries.push(AllowlistEntry {
            rule_id: rule_id.to_string(),
            note: item.get("note").and_then(|v| v.as_str()).map(String::from),
            pattern,
            scope,
        });
    }
    entries
}
