use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::PluginLoader;

const WATCHED_EXTENSIONS: &[&str] = &["rs", "json", "toml"];

type Fingerprint = BTreeMap<PathBuf, (SystemTime, u64)>;

/// Polls plugin directories and reloads a plugin when one of its source,
/// manifest or config files changes.
pub struct PluginWatcher {
    loader: Arc<PluginLoader>,
    interval: Duration,
    fingerprints: HashMap<String, Fingerprint>,
}

pub struct WatcherHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!("Plugin watcher ended abnormally: {}", e);
        }
    }
}

impl PluginWatcher {
    pub fn new(loader: Arc<PluginLoader>, interval: Duration) -> Self {
        Self {
            loader,
            interval,
            fingerprints: HashMap::new(),
        }
    }

    /// Plugins whose files changed since the previous scan. The first scan
    /// of a plugin only records its baseline.
    pub async fn scan(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, dir) in self.loader.plugin_dirs().await {
            let fingerprint = fingerprint(&dir).await;
            match self.fingerprints.insert(name.clone(), fingerprint) {
                Some(previous) if previous != self.fingerprints[&name] => changed.push(name),
                _ => {}
            }
        }
        changed
    }

    /// One scan plus a reload of every changed plugin
    pub async fn poll_once(&mut self) -> Vec<String> {
        let changed = self.scan().await;
        for name in &changed {
            tracing::info!("Plugin files modified, reloading {}", name);
            if let Err(e) = self.loader.reload_plugin(name).await {
                tracing::error!("Hot reload of {} failed: {}", name, e);
            }
        }
        changed
    }

    pub fn spawn(mut self) -> WatcherHandle {
        let (shutdown, mut stop) = oneshot::channel();
        let task = tokio::spawn(async move {
            self.scan().await;
            tracing::info!(
                "Started plugin file watcher on {} (every {:?})",
                self.loader.directory().display(),
                self.interval
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }
            tracing::info!("Plugin file watcher stopped");
        });

        WatcherHandle { shutdown, task }
    }
}

async fn fingerprint(dir: &Path) -> Fingerprint {
    let mut files = Fingerprint::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Cannot read {}: {}", current.display(), e);
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(path);
                continue;
            }
            let watched = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| WATCHED_EXTENSIONS.contains(&ext));
            if watched {
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                files.insert(path, (modified, metadata.len()));
            }
        }
    }

    files
}
