//! Dashboard reload notifier.
//!
//! The allowlist watcher calls `notify_config_reloaded` after every
//! successful hot-reload. The default implementation only logs; a dashboard
//! deployment swaps in its own notifier.

use std::sync::Arc;

pub trait ReloadNotifier: Send + Sync {
    fn notify_config_reloaded(&self, entry_count: usize);
}

/// Notifier that records reloads in the log stream.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl ReloadNotifier for LogNotifier {
    fn notify_config_reloaded(&self, entry_count: usize) {
        tracing::info!(entries = entry_count, "allowlist reloaded");
    }
}

pub fn log_notifier() -> Arc<dyn ReloadNotifier> {
    Arc::new(LogNotifier)
}
