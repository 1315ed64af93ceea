//! Manifest-driven plugin discovery
//!
//! Each candidate directory is scanned for subdirectories containing a
//! `plugin.toml`. A valid manifest is bound to its implementation through
//! the [`PluginRegistry`]; anything malformed or unknown is logged and
//! skipped without affecting the rest of the scan.

use super::{Plugin, PluginManifest, PluginRegistry};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Manifest file expected inside each plugin directory.
const MANIFEST_FILE: &str = "plugin.toml";

/// A manifest successfully bound to a registered implementation.
pub struct DiscoveredPlugin {
    pub manifest: PluginManifest,
    pub instance: Arc<dyn Plugin>,
}

/// Scan `dirs` for plugin manifests and bind them against `registry`.
///
/// Individual failures are logged and skipped; the returned list preserves
/// scan order, which later acts as the discovery-order tie-break during
/// resolution.
pub async fn discover_plugins(
    dirs: &[PathBuf],
    registry: &PluginRegistry,
) -> Vec<DiscoveredPlugin> {
    let mut discovered = Vec::new();

    for dir in dirs {
        if !dir.exists() {
            debug!(dir = %dir.display(), "plugin directory does not exist, skipping");
            continue;
        }

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "failed to read plugin directory");
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "failed to enumerate plugin directory");
                    break;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match bind_plugin(&path, registry).await {
                Ok(plugin) => {
                    debug!(
                        name = %plugin.manifest.name,
                        version = %plugin.manifest.version,
                        "discovered plugin"
                    );
                    discovered.push(plugin);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping plugin");
                }
            }
        }
    }

    discovered
}

/// Read and validate one plugin directory, binding its manifest to a
/// registered implementation.
async fn bind_plugin(path: &Path, registry: &PluginRegistry) -> Result<DiscoveredPlugin> {
    let manifest_path = path.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(Error::InvalidManifest(format!(
            "no {MANIFEST_FILE} in {}",
            path.display()
        )));
    }

    let content = tokio::fs::read_to_string(&manifest_path).await?;
    let manifest: PluginManifest = toml::from_str(&content)?;
    manifest.validate()?;

    let instance = registry
        .bind(&manifest.name)
        .ok_or_else(|| Error::PluginNotFound(manifest.name.clone()))?;

    // The manifest activates exactly the implementation it names.
    if instance.name() != manifest.name {
        return Err(Error::InvalidManifest(format!(
            "manifest {} bound an implementation named {}",
            manifest.name,
            instance.name()
        )));
    }

    Ok(DiscoveredPlugin { manifest, instance })
}
