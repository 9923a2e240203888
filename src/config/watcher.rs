//! Routing file watcher.
//!
//! Publishes the latest valid routing table on a `watch` channel. The parent
//! directory is watched so that editors replacing the file through a rename
//! are still picked up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::config::loader::load_routing;
use crate::config::schema::RoutingConfig;

/// Keeps the routing table in sync with a file on disk.
pub struct RoutingWatcher {
    path: PathBuf,
    routes: watch::Sender<RoutingConfig>,
}

impl RoutingWatcher {
    /// Start from `current`, usually the table loaded at startup.
    pub fn new(path: &Path, current: RoutingConfig) -> (Self, watch::Receiver<RoutingConfig>) {
        let (routes, receiver) = watch::channel(current);
        let watcher = Self {
            path: path.to_path_buf(),
            routes,
        };
        (watcher, receiver)
    }

    /// Re-read the file and publish it if it differs from the current table.
    ///
    /// Invalid revisions are logged and dropped. Returns whether receivers
    /// were notified.
    pub fn reload(&self) -> bool {
        let routing = match load_routing(&self.path) {
            Ok(routing) => routing,
            Err(err) => {
                tracing::error!(path = ?self.path, error = %err, "Invalid routing file, keeping current routes");
                return false;
            }
        };

        let changed = self.routes.send_if_modified(|current| {
            if *current == routing {
                false
            } else {
                *current = routing;
                true
            }
        });
        if changed {
            tracing::info!(path = ?self.path, "Routing file changed");
        }
        changed
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn watch(self) -> Result<RecommendedWatcher, notify::Error> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let this = Arc::new(self);

        let handler = this.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if handler.concerns(&event) {
                    handler.reload();
                }
            }
            Err(err) => tracing::error!(error = %err, "Routing watch error"),
        })?;
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?this.path, "Routing watcher started");
        Ok(watcher)
    }

    fn concerns(&self, event: &notify::Event) -> bool {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return false;
        }
        let name = self.path.file_name();
        event.paths.iter().any(|path| path.file_name() == name)
    }
}
