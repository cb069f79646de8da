//! Configuration file watcher for hot reload.
//!
//! Reloads on changes to the config file and on SIGHUP. A file that fails to
//! load or validate is logged and ignored; the running configuration stays.

use crate::config::{load_config, Config, ConfigError};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Editors often write a file in several steps; events closer together than
/// this are handled as one change.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Applies a loaded configuration. An error leaves the old one in place.
pub type ReloadCallback = Box<dyn Fn(Config) -> Result<(), ConfigError> + Send + Sync>;

/// Configuration file watcher.
pub struct ConfigWatcher {
    config_path: PathBuf,
    reload_callback: ReloadCallback,
}

impl ConfigWatcher {
    pub fn new(config_path: PathBuf, reload_callback: ReloadCallback) -> Self {
        Self {
            config_path,
            reload_callback,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Watch for file changes and SIGHUP until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(path = %self.config_path.display(), "config watcher starting");

        let (tx, mut rx) = mpsc::unbounded_channel();

        // Kept alive for the duration of the loop; dropping it stops events.
        let _watcher = match self.watch_file(tx) {
            Ok(w) => Some(w),
            Err(e) => {
                error!(error = %e, "failed to watch config file, only SIGHUP will reload");
                None
            }
        };

        #[cfg(unix)]
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "failed to setup SIGHUP handler");
                    None
                }
            };

        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    if !self.should_reload(&event) {
                        continue;
                    }
                    sleep(DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}
                    self.try_reload();
                }

                _ = async {
                    #[cfg(unix)]
                    {
                        match sighup.as_mut() {
                            Some(sig) => sig.recv().await,
                            None => std::future::pending::<Option<()>>().await,
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("received SIGHUP, reloading configuration");
                    self.try_reload();
                }

                _ = shutdown.recv() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }

    fn watch_file(&self, tx: mpsc::UnboundedSender<Event>) -> notify::Result<RecommendedWatcher> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;

        // Watch the directory: editors that replace the file would otherwise
        // leave us watching a deleted inode.
        let dir = match self.config_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    /// Check if this event should trigger a reload.
    fn should_reload(&self, event: &Event) -> bool {
        let is_our_file = event
            .paths
            .iter()
            .any(|p| p.file_name() == self.config_path.file_name());

        let is_modify_or_create = matches!(
            event.kind,
            notify::EventKind::Modify(_) | notify::EventKind::Create(_)
        );

        is_our_file && is_modify_or_create
    }

    /// Load the file and hand it to the callback.
    fn try_reload(&self) {
        info!(path = %self.config_path.display(), "attempting config reload");

        let new_config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to load new config, keeping current");
                return;
            }
        };

        let frontends = new_config.frontends.len();
        let upstreams = new_config.upstreams.len();
        match (self.reload_callback)(new_config) {
            Ok(()) => info!(frontends, upstreams, "configuration reloaded successfully"),
            Err(e) => error!(error = %e, "failed to apply new config, keeping current"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    const VALID: &str = r#"
frontends:
  - name: edge
    listen: "127.0.0.1:7000"
    upstream: pool
upstreams:
  - name: pool
    servers:
      - address: "127.0.0.1:9001"
"#;

    fn watcher(path: &str) -> ConfigWatcher {
        ConfigWatcher::new(PathBuf::from(path), Box::new(|_| Ok(())))
    }

    fn event(kind: notify::EventKind, path: &str) -> Event {
        Event {
            kind,
            paths: vec![PathBuf::from(path)],
            attrs: Default::default(),
        }
    }

    fn modify() -> notify::EventKind {
        notify::EventKind::Modify(notify::event::ModifyKind::Data(
            notify::event::DataChange::Content,
        ))
    }

    #[test]
    fn test_should_reload_modify_and_create() {
        let w = watcher("/test/config.yaml");
        assert!(w.should_reload(&event(modify(), "/test/config.yaml")));
        assert!(w.should_reload(&event(
            notify::EventKind::Create(notify::event::CreateKind::File),
            "/test/config.yaml"
        )));
    }

    #[test]
    fn test_should_reload_wrong_file() {
        let w = watcher("/test/config.yaml");
        assert!(!w.should_reload(&event(modify(), "/test/other.yaml")));
    }

    #[test]
    fn test_should_reload_delete_ignored() {
        let w = watcher("/test/config.yaml");
        assert!(!w.should_reload(&event(
            notify::EventKind::Remove(notify::event::RemoveKind::File),
            "/test/config.yaml"
        )));
    }

    #[test]
    fn test_try_reload_calls_back_only_for_valid_files() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let w = ConfigWatcher::new(
            file.path().to_path_buf(),
            Box::new(move |config| {
                assert_eq!(config.upstreams[0].name, "pool");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        w.try_reload();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        std::fs::write(file.path(), "upstreams: [").unwrap();
        w.try_reload();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
