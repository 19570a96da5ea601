//! Configuration loading.
//!
//! Reads `.ongarde/config.yaml` (or `~/.ongarde/config.yaml`), merges env
//! overrides on top, and falls back to full defaults when no file exists —
//! OnGarde is safe to run with zero configuration.
//!
//! Search order:
//!   1. explicit path (`--config` flag)
//!   2. `ONGARDE_CONFIG` environment variable
//!   3. `.ongarde/config.yaml` (working directory)
//!   4. `~/.ongarde/config.yaml` (home directory)
//!
//! Env overrides: `ONGARDE_PORT`, `ONGARDE_API_KEY`, `ONGARDE_OPENAI_URL`,
//! `ONGARDE_ANTHROPIC_URL`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

fn default_openai_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_anthropic_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_entity_set() -> Vec<String> {
    ["CREDIT_CARD", "CRYPTO", "EMAIL_ADDRESS", "PHONE_NUMBER", "US_SSN"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_audit_path() -> String {
    "~/.ongarde/audit.jsonl".to_string()
}

fn default_retention_days() -> u32 {
    90
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4242
}

fn default_scanner_mode() -> ScannerMode {
    ScannerMode::Full
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerMode {
    /// Regex fast path + out-of-process NLP scanning.
    Full,
    /// Regex fast path only — no NLP worker is spawned.
    Lite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL for OpenAI-compatible endpoints.
    pub openai: String,
    /// Base URL for the Anthropic Messages API.
    pub anthropic: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            openai: default_openai_url(),
            anthropic: default_anthropic_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub mode: ScannerMode,
    /// Entity types the NLP worker detects.
    pub entity_set: Vec<String>,
    /// PERSON detection is opt-in — it is the noisiest entity type.
    pub enable_person_detection: bool,
    /// Operator override for the calibrated sync cap (chars). Explicit
    /// overrides always win over measurements.
    pub sync_cap_override: Option<usize>,
    /// Operator override for the calibrated per-operation NLP timeout (ms).
    pub timeout_ms_override: Option<u64>,
    /// argv for the NLP worker subprocess. Empty disables the worker,
    /// equivalent to `mode: lite`.
    pub worker_cmd: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            mode: default_scanner_mode(),
            entity_set: default_entity_set(),
            enable_person_detection: false,
            sync_cap_override: None,
            timeout_ms_override: None,
            worker_cmd: Vec::new(),
        }
    }
}

impl ScannerConfig {
    /// Effective entity set, with PERSON appended when opted in.
    pub fn effective_entity_set(&self) -> Vec<String> {
        let mut set = self.entity_set.clone();
        if self.enable_person_detection && !set.iter().any(|e| e == "PERSON") {
            set.push("PERSON".to_string());
        }
        set
    }

    /// True when the NLP worker should be spawned at startup.
    pub fn nlp_enabled(&self) -> bool {
        self.mode == ScannerMode::Full && !self.worker_cmd.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSONL file the audit backend appends to. `~` expands to the home dir.
    pub path: String,
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// OnGarde API key (`ong-…`). Unset disables authentication — local,
    /// single-machine deployments run without a key.
    pub api_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { api_key: None }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub scanner: ScannerConfig,
    pub audit: AuditConfig,
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
    /// Allowlist file path. Watched for hot-reload when present.
    pub allowlist_path: Option<String>,
}

impl Config {
    /// Expanded audit path (`~` → home directory).
    pub fn audit_path(&self) -> PathBuf {
        expand_tilde(&self.audit.path)
    }

    /// Allowlist path, defaulting to `.ongarde/allowlist.yaml`.
    pub fn allowlist_path(&self) -> PathBuf {
        self.allowlist_path
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from(".ongarde/allowlist.yaml"))
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Load configuration: YAML file (if any) + env overrides.
pub fn load(explicit_path: Option<&str>) -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let mut config = match find_config_file(explicit_path) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
            let config: Config = serde_yaml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
            tracing::info!(path = %path.display(), "configuration loaded");
            config
        }
        None => {
            tracing::info!("no config file found — using defaults");
            Config::default()
        }
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

fn find_config_file(explicit_path: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = explicit_path {
        return Some(PathBuf::from(p));
    }
    if let Ok(p) = std::env::var("ONGARDE_CONFIG") {
        if !p.is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    let cwd = PathBuf::from(".ongarde/config.yaml");
    if cwd.exists() {
        return Some(cwd);
    }
    let home = expand_tilde("~/.ongarde/config.yaml");
    if home.exists() {
        return Some(home);
    }
    None
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(port) = std::env::var("ONGARDE_PORT") {
        match port.parse() {
            Ok(p) => config.proxy.port = p,
            Err(_) => tracing::warn!(value = %port, "ONGARDE_PORT is not a valid port — ignoring"),
        }
    }
    if let Ok(key) = std::env::var("ONGARDE_API_KEY") {
        if !key.is_empty() {
            config.auth.api_key = Some(key);
        }
    }
    if let Ok(url) = std::env::var("ONGARDE_OPENAI_URL") {
        if !url.is_empty() {
            config.upstream.openai = url;
        }
    }
    if let Ok(url) = std::env::var("ONGARDE_ANTHROPIC_URL") {
        if !url.is_empty() {
            config.upstream.anthropic = url;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_safe() {
        let config = Config::default();
        assert_eq!(config.upstream.openai, "https://api.openai.com");
        assert_eq!(config.upstream.anthropic, "https://api.anthropic.com");
        assert_eq!(config.proxy.port, 4242);
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.scanner.mode, ScannerMode::Full);
        assert!(config.auth.api_key.is_none());
        assert!(!config.scanner.nlp_enabled()); // no worker_cmd configured
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
upstream:
  openai: "http://localhost:8080"
  anthropic: "http://localhost:8081"
scanner:
  mode: full
  entity_set: [CREDIT_CARD, US_SSN]
  enable_person_detection: true
  sync_cap_override: 1000
  timeout_ms_override: 40
  worker_cmd: ["python3", "-m", "ongarde_worker"]
audit:
  path: "/tmp/audit.jsonl"
  retention_days: 30
proxy:
  host: "0.0.0.0"
  port: 9000
auth:
  api_key: "ong-secret"
allowlist_path: "/tmp/allowlist.yaml"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.upstream.openai, "http://localhost:8080");
        assert_eq!(config.scanner.sync_cap_override, Some(1000));
        assert_eq!(config.scanner.timeout_ms_override, Some(40));
        assert!(config.scanner.nlp_enabled());
        assert_eq!(
            config.scanner.effective_entity_set(),
            vec!["CREDIT_CARD", "US_SSN", "PERSON"]
        );
        assert_eq!(config.proxy.port, 9000);
        assert_eq!(config.auth.api_key.as_deref(), Some("ong-secret"));
    }

    #[test]
    fn test_lite_mode_disables_nlp_even_with_worker_cmd() {
        let yaml = r#"
scanner:
  mode: lite
  worker_cmd: ["python3", "worker.py"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.scanner.nlp_enabled());
    }

    #[test]
    fn test_invalid_scanner_mode_is_rejected() {
        let yaml = "scanner:\n  mode: turbo\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_partial_yaml_merges_defaults() {
        let yaml = "proxy:\n  port: 5555\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.proxy.port, 5555);
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.upstream.openai, "https://api.openai.com");
    }
}
