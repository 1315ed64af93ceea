//! Built-in persistence adapter
//!
//! Forwards every record event into a [`BatchQueue`] whose handler writes
//! to the configured [`RecordStore`](crate::storage::RecordStore). This is
//! the plugin that turns the live stream into durable records.

use super::{Plugin, PluginContext, PluginManifest};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::queue::BatchQueue;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub const RECORDER_PLUGIN_NAME: &str = "recorder";

/// Manifest activating the built-in recorder. High priority value so it
/// runs after any enriching plugins in the same dispatch.
pub fn recorder_manifest() -> PluginManifest {
    let mut manifest = PluginManifest::new(RECORDER_PLUGIN_NAME, env!("CARGO_PKG_VERSION"));
    manifest.priority = 100;
    manifest.capabilities = vec!["persistence".to_string()];
    manifest
}

pub struct RecorderPlugin {
    queue: Arc<BatchQueue<Value>>,
}

impl RecorderPlugin {
    pub fn new(queue: Arc<BatchQueue<Value>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Plugin for RecorderPlugin {
    fn name(&self) -> &str {
        RECORDER_PLUGIN_NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&self, _context: &PluginContext) -> Result<()> {
        Ok(())
    }

    async fn on_event(&self, event: &Event, _context: &PluginContext) -> Result<()> {
        let Some(record) = event.as_record() else {
            return Ok(());
        };
        self.queue
            .add(record.clone())
            .await
            .map_err(|err| Error::Plugin(format!("recorder enqueue failed: {err}")))
    }

    async fn shutdown(&self) -> Result<()> {
        // Push anything still accumulated before the queue itself stops.
        self.queue.flush().await
    }
}
