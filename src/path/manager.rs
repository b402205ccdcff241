//! Path manager
//!
//! Owns the mapping from path name to path. Lookups take the read lock;
//! creation and removal take the write lock and re-check, so concurrent
//! requests for the same new name end up sharing one path (and one source).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::{Protocol, RelayConfig};
use crate::error::Result;
use crate::source::{Publisher, SourceSettings};

use super::entry::PathHandle;
use super::error::PathError;
use super::fanout::Reader;

/// Central registry of all paths
///
/// Must be created inside a Tokio runtime: every path runs as a task.
pub struct PathManager {
    /// Map of path name to path
    paths: RwLock<HashMap<String, Arc<PathHandle>>>,

    /// Current configuration
    config: RwLock<Arc<RelayConfig>>,

    closed: AtomicBool,
}

impl PathManager {
    /// Validate the configuration and create every always-on path
    pub fn new(config: RelayConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let mut paths = HashMap::new();
        for name in eager_paths(&config) {
            if let Some(path_config) = config.find_path(&name) {
                let handle = PathHandle::spawn(
                    name.clone(),
                    path_config.clone(),
                    SourceSettings::from(&config),
                );
                paths.insert(name, Arc::new(handle));
            }
        }

        tracing::info!(
            configured = config.paths.len(),
            created = paths.len(),
            "Path manager started"
        );

        Ok(Arc::new(Self {
            paths: RwLock::new(paths),
            config: RwLock::new(Arc::new(config)),
            closed: AtomicBool::new(false),
        }))
    }

    /// Current configuration
    pub async fn config(&self) -> Arc<RelayConfig> {
        Arc::clone(&*self.config.read().await)
    }

    /// Get the path for a name, creating it from its configuration entry
    pub async fn resolve_path(&self, name: &str) -> std::result::Result<Arc<PathHandle>, PathError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PathError::Closed);
        }

        if let Some(path) = self.paths.read().await.get(name) {
            return Ok(Arc::clone(path));
        }

        let config = self.config().await;
        let path_config = config
            .find_path(name)
            .ok_or_else(|| PathError::NotConfigured(name.to_string()))?;

        let mut paths = self.paths.write().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(PathError::Closed);
        }
        // another request may have created it meanwhile
        if let Some(path) = paths.get(name) {
            return Ok(Arc::clone(path));
        }

        let handle = Arc::new(PathHandle::spawn(
            name.to_string(),
            path_config.clone(),
            SourceSettings::from(config.as_ref()),
        ));
        paths.insert(name.to_string(), Arc::clone(&handle));

        tracing::info!(
            path = %name,
            config = %path_config.name,
            on_demand = path_config.source_on_demand,
            "Path created"
        );

        Ok(handle)
    }

    /// Get an existing path without creating it
    pub async fn get_path(&self, name: &str) -> Option<Arc<PathHandle>> {
        self.paths.read().await.get(name).cloned()
    }

    /// Attach a reader for a downstream protocol session
    pub async fn read(
        &self,
        name: &str,
        protocol: Protocol,
    ) -> std::result::Result<Reader, PathError> {
        self.check_protocol(protocol).await?;
        let path = self.resolve_path(name).await?;
        path.attach().await
    }

    /// Become the publisher of a push-only path
    pub async fn publish(
        &self,
        name: &str,
        protocol: Protocol,
    ) -> std::result::Result<Publisher, PathError> {
        self.check_protocol(protocol).await?;
        let path = self.resolve_path(name).await?;
        path.publish().await
    }

    async fn check_protocol(&self, protocol: Protocol) -> std::result::Result<(), PathError> {
        if self.config.read().await.protocol_enabled(protocol) {
            Ok(())
        } else {
            Err(PathError::ProtocolDisabled(protocol))
        }
    }

    /// Tear down a path and its readers
    ///
    /// Returns false if no such path exists. A path that is still configured
    /// is recreated on its next reference.
    pub async fn remove_path(&self, name: &str) -> bool {
        let removed = self.paths.write().await.remove(name);
        match removed {
            Some(path) => {
                path.remove().await;
                true
            }
            None => false,
        }
    }

    /// Apply a new configuration
    ///
    /// Paths whose entry vanished or changed are removed; new always-on
    /// paths are created. Unchanged paths keep running.
    pub async fn reload(&self, config: RelayConfig) -> Result<()> {
        config.validate()?;

        let mut stale = Vec::new();
        {
            let mut paths = self.paths.write().await;
            paths.retain(|name, path| {
                let keep = config.find_path(name) == Some(path.config());
                if !keep {
                    stale.push(Arc::clone(path));
                }
                keep
            });

            for name in eager_paths(&config) {
                if paths.contains_key(&name) {
                    continue;
                }
                if let Some(path_config) = config.find_path(&name) {
                    let handle = PathHandle::spawn(
                        name.clone(),
                        path_config.clone(),
                        SourceSettings::from(&config),
                    );
                    paths.insert(name, Arc::new(handle));
                }
            }

            *self.config.write().await = Arc::new(config);
        }

        for path in stale {
            tracing::info!(path = %path.name(), "Path configuration changed, removing");
            path.remove().await;
        }

        Ok(())
    }

    /// Names of all current paths
    pub async fn path_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.paths.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of current paths
    pub async fn path_count(&self) -> usize {
        self.paths.read().await.len()
    }

    /// Remove every path, stopping all sources and closing all readers
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let paths: Vec<Arc<PathHandle>> = self.paths.write().await.drain().map(|(_, p)| p).collect();
        for path in &paths {
            path.remove().await;
        }

        tracing::info!(paths = paths.len(), "Path manager closed");
    }
}

impl std::fmt::Debug for PathManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathManager")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Exact-name entries that start without a reader
fn eager_paths(config: &RelayConfig) -> Vec<String> {
    config
        .paths
        .iter()
        .filter(|p| !p.is_pattern() && !p.is_catch_all() && !p.source_on_demand)
        .map(|p| p.name.clone())
        .collect()
}
