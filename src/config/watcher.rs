//! Hot reload of ledger limits from the config file.
//!
//! A running [`UsageAccountant`](crate::accountant::UsageAccountant) can
//! only take new `daily_limit` and `warning_threshold` values. The backend,
//! store path, and day zone are bound when the store is opened, so edits to
//! them are reported and left for the next restart.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::LedgerConfig;

/// What one look at the config file produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Reload {
    /// File untouched, missing, or its limits match the running ones.
    Unchanged,
    /// New limits. Store settings are those of the running config.
    Limits(LedgerConfig),
    /// File changed but failed to load; running limits stay.
    Rejected(String),
}

/// Polls the config file's mtime and turns edits into limit updates.
pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    running: LedgerConfig,
    seen: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Watch `path` on behalf of a process started with `running`.
    ///
    /// The file's current mtime counts as already applied.
    pub fn new(path: impl Into<PathBuf>, running: LedgerConfig, poll_interval: Duration) -> Self {
        let path = path.into();
        let seen = modified_at(&path);
        Self {
            path,
            poll_interval,
            running,
            seen,
        }
    }

    /// The configuration the ledger is currently running with.
    pub fn running(&self) -> &LedgerConfig {
        &self.running
    }

    /// Check the file once.
    pub fn poll(&mut self) -> Reload {
        let modified = modified_at(&self.path);
        if modified.is_none() || modified == self.seen {
            return Reload::Unchanged;
        }
        self.seen = modified;

        let next = match LedgerConfig::reload_from_path(&self.path) {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "Config reload rejected; keeping running limits"
                );
                return Reload::Rejected(err.to_string());
            }
        };

        let pinned = restart_only_changes(&self.running, &next);
        if !pinned.is_empty() {
            warn!(
                path = %self.path.display(),
                fields = %pinned.join(", "),
                "Config change needs a restart to take effect; ignoring it"
            );
        }

        if next.daily_limit == self.running.daily_limit
            && next.warning_threshold == self.running.warning_threshold
        {
            return Reload::Unchanged;
        }

        self.running = LedgerConfig {
            daily_limit: next.daily_limit,
            warning_threshold: next.warning_threshold,
            ..self.running.clone()
        };
        Reload::Limits(self.running.clone())
    }

    /// Forward limit changes on `tx` until `shutdown_rx` flips to `true`,
    /// its sender goes away, or `tx`'s receiver is dropped.
    pub async fn watch(
        mut self,
        tx: mpsc::UnboundedSender<LedgerConfig>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(path = %self.path.display(), "Config watcher stopped");
                        return;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if let Reload::Limits(config) = self.poll() {
                info!(
                    daily_limit = config.daily_limit,
                    warning_threshold = config.warning_threshold,
                    "Ledger limits changed on disk"
                );
                if tx.send(config).is_err() {
                    debug!("Limit receiver dropped; config watcher stopped");
                    return;
                }
            }
        }
    }
}

/// Fields that differ between `running` and `next` but cannot be applied to
/// an open store.
fn restart_only_changes(running: &LedgerConfig, next: &LedgerConfig) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if running.backend != next.backend {
        fields.push("backend");
    }
    if running.path != next.path {
        fields.push("path");
    }
    if running.utc_offset.trim() != next.utc_offset.trim() {
        fields.push("utc_offset");
    }
    fields
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::UsageAccountant;
    use crate::config::BackendKind;
    use crate::ledger::{DayClock, LedgerStore, MemoryBackend};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Write `contents` and stamp an mtime `bump` seconds ahead, so
    /// successive edits are distinguishable on any filesystem.
    fn write_config(path: &Path, contents: &str, bump: u64) {
        std::fs::write(path, contents).unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(bump))
            .unwrap();
    }

    fn running(limit: i64) -> LedgerConfig {
        LedgerConfig {
            daily_limit: limit,
            backend: BackendKind::Memory,
            ..Default::default()
        }
    }

    fn watcher_on(tmp: &TempDir, limit: i64) -> (ConfigWatcher, PathBuf) {
        let path = tmp.path().join("config.json");
        write_config(&path, &format!(r#"{{"daily_limit": {limit}, "backend": "memory"}}"#), 0);
        (
            ConfigWatcher::new(&path, running(limit), Duration::from_millis(20)),
            path,
        )
    }

    #[test]
    fn test_untouched_file_is_unchanged() {
        let tmp = TempDir::new().unwrap();
        let (mut watcher, _) = watcher_on(&tmp, 100);
        assert_eq!(watcher.poll(), Reload::Unchanged);
    }

    #[test]
    fn test_limit_edit_is_forwarded() {
        let tmp = TempDir::new().unwrap();
        let (mut watcher, path) = watcher_on(&tmp, 100);
        write_config(
            &path,
            r#"{"daily_limit": 250, "warning_threshold": 0.5, "backend": "memory"}"#,
            5,
        );

        match watcher.poll() {
            Reload::Limits(config) => {
                assert_eq!(config.daily_limit, 250);
                assert_eq!(config.warning_threshold, 0.5);
            }
            other => panic!("expected Limits, got {other:?}"),
        }
        assert_eq!(watcher.running().daily_limit, 250);
        assert_eq!(watcher.poll(), Reload::Unchanged, "same mtime is not re-read");
    }

    #[test]
    fn test_store_settings_are_not_forwarded() {
        let tmp = TempDir::new().unwrap();
        let (mut watcher, path) = watcher_on(&tmp, 100);
        write_config(
            &path,
            r#"{"daily_limit": 100, "backend": "sqlite", "utc_offset": "+09:00"}"#,
            5,
        );

        assert_eq!(watcher.poll(), Reload::Unchanged);
        assert_eq!(watcher.running().backend, BackendKind::Memory);
        assert_eq!(watcher.running().utc_offset, "+00:00");
    }

    #[test]
    fn test_mixed_edit_forwards_limits_with_running_store_settings() {
        let tmp = TempDir::new().unwrap();
        let (mut watcher, path) = watcher_on(&tmp, 100);
        write_config(
            &path,
            r#"{"daily_limit": 40, "backend": "json", "path": "/elsewhere/usage.json"}"#,
            5,
        );

        match watcher.poll() {
            Reload::Limits(config) => {
                assert_eq!(config.daily_limit, 40);
                assert_eq!(config.backend, BackendKind::Memory);
                assert_eq!(config.path, None);
            }
            other => panic!("expected Limits, got {other:?}"),
        }
    }

    #[test]
    fn test_restart_only_changes_lists_fields() {
        let base = running(100);
        let next = LedgerConfig {
            backend: BackendKind::Sqlite,
            path: Some(PathBuf::from("/tmp/u.sqlite")),
            utc_offset: "-05:00".into(),
            ..base.clone()
        };
        assert_eq!(
            restart_only_changes(&base, &next),
            vec!["backend", "path", "utc_offset"]
        );
        assert!(restart_only_changes(&base, &base.clone()).is_empty());
    }

    #[test]
    fn test_invalid_edit_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (mut watcher, path) = watcher_on(&tmp, 100);
        write_config(&path, r#"{"utc_offset": "nowhere"}"#, 5);

        assert!(matches!(watcher.poll(), Reload::Rejected(_)));
        assert_eq!(watcher.running().daily_limit, 100);
    }

    #[test]
    fn test_deleted_file_keeps_running_limits() {
        let tmp = TempDir::new().unwrap();
        let (mut watcher, path) = watcher_on(&tmp, 100);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(watcher.poll(), Reload::Unchanged);
    }

    #[tokio::test]
    async fn test_reload_reaches_accountant() {
        let tmp = TempDir::new().unwrap();
        let (watcher, path) = watcher_on(&tmp, 100);

        let store = LedgerStore::new(Arc::new(MemoryBackend::new()), DayClock::utc());
        let acct = UsageAccountant::new(store, watcher.running());
        acct.record_consumption("u1", 60, None).await.unwrap();
        assert!(acct.check_quota("u1", None).await.unwrap().allowed);

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let follower = acct.follow_config(rx);
        let watching = tokio::spawn(watcher.watch(tx, shutdown_rx));

        write_config(&path, r#"{"daily_limit": 50, "backend": "memory"}"#, 5);

        tokio::time::timeout(Duration::from_secs(2), async {
            while acct.default_limit() != 50 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("limit reloaded");

        let status = acct.check_quota("u1", None).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.daily_limit, 50);

        shutdown_tx.send(true).unwrap();
        watching.await.unwrap();
        follower.await.unwrap();
    }
}
