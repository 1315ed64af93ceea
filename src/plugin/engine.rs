//! Plugin execution engine
//!
//! Dispatches events to loaded plugins in ascending priority groups:
//! every plugin in a group runs concurrently, and the next group starts
//! only once the whole group has finished. Each call is raced against the
//! plugin's manifest timeout; a call that exceeds it is abandoned, not
//! cancelled, so its side effects may still land later.
//!
//! Repeated failures open a per-plugin circuit breaker. A disabled plugin
//! is skipped until its cooldown elapses, at which point the next dispatch
//! re-enables it with a clean failure counter.

use super::{resolve_order, DiscoveredPlugin, Plugin, PluginContext};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventMetadata, EventPayload, Subject, SubscriptionId};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

/// Circuit-breaker policy shared by every plugin in the engine.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// Consecutive failures before a plugin is disabled.
    pub failure_threshold: u32,
    /// How long a disabled plugin stays out of dispatch.
    pub cooldown: Duration,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Per-plugin execution counters.
#[derive(Debug, Clone, Default)]
pub struct PluginMetrics {
    pub executions: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub avg_duration_ms: f64,
    pub last_error: Option<String>,
}

/// Breaker state visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginHealth {
    pub disabled: bool,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
}

#[derive(Default)]
struct RuntimeState {
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    disabled: bool,
    /// `None` while disabled means permanently disabled (failed
    /// initialization); the cooldown never re-enables it.
    disabled_at: Option<Instant>,
}

struct PluginEntry {
    manifest: super::PluginManifest,
    instance: Arc<dyn Plugin>,
    state: RuntimeState,
    metrics: PluginMetrics,
}

struct DispatchTarget {
    index: usize,
    name: String,
    instance: Arc<dyn Plugin>,
    timeout: Duration,
    priority: i32,
}

/// Owns the plugin registry state; all mutation goes through dispatch,
/// initialization, and shutdown.
pub struct PluginEngine {
    context: PluginContext,
    policy: EnginePolicy,
    entries: Mutex<Vec<PluginEntry>>,
}

impl PluginEngine {
    pub fn new(context: PluginContext) -> Self {
        Self::with_policy(context, EnginePolicy::default())
    }

    pub fn with_policy(context: PluginContext, policy: EnginePolicy) -> Self {
        Self {
            context,
            policy,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Resolve the dependency graph of `discovered` and store the plugins
    /// in execution order. Fails as a whole on a missing dependency or a
    /// cycle.
    pub async fn load(&self, discovered: Vec<DiscoveredPlugin>) -> Result<usize> {
        let order = resolve_order(&discovered)?;
        let mut slots: Vec<Option<DiscoveredPlugin>> = discovered.into_iter().map(Some).collect();

        let mut entries = self.entries.lock().await;
        entries.clear();
        for index in order {
            if let Some(plugin) = slots[index].take() {
                debug!(
                    name = %plugin.manifest.name,
                    priority = plugin.manifest.priority,
                    "loaded plugin"
                );
                entries.push(PluginEntry {
                    manifest: plugin.manifest,
                    instance: plugin.instance,
                    state: RuntimeState::default(),
                    metrics: PluginMetrics::default(),
                });
            }
        }
        info!(count = entries.len(), "plugin set loaded");
        Ok(entries.len())
    }

    /// Initialize every plugin sequentially in execution order, each raced
    /// against its manifest timeout. A failure disables that plugin alone;
    /// the list of failures is returned to the caller.
    pub async fn initialize_all(&self) -> Vec<(String, Error)> {
        let targets = self.snapshot(false).await;
        let mut failures = Vec::new();

        for target in targets {
            let instance = target.instance.clone();
            let context = self.context.clone();
            let result = call_with_timeout(&target.name, target.timeout, async move {
                instance.initialize(&context).await
            })
            .await;

            if let Err(err) = result {
                error!(plugin = %target.name, error = %err, "plugin initialization failed");
                let mut entries = self.entries.lock().await;
                let entry = &mut entries[target.index];
                entry.state.disabled = true;
                entry.state.disabled_at = None;
                entry.metrics.last_error = Some(err.to_string());
                failures.push((target.name, err));
            } else {
                debug!(plugin = %target.name, "plugin initialized");
            }
        }

        failures
    }

    /// Dispatch one event to every enabled plugin, in ascending priority
    /// groups. A group's members run concurrently; the next group waits
    /// for all of them.
    pub async fn execute_plugins(&self, event: &Event) {
        let targets = self.snapshot(true).await;
        if targets.is_empty() {
            return;
        }

        let mut groups: BTreeMap<i32, Vec<DispatchTarget>> = BTreeMap::new();
        for target in targets {
            groups.entry(target.priority).or_default().push(target);
        }

        for (priority, group) in groups {
            trace!(priority, size = group.len(), "dispatching priority group");
            let results = join_all(group.into_iter().map(|target| {
                let event = event.clone();
                let context = self.context.clone();
                let instance = target.instance.clone();
                async move {
                    let started = Instant::now();
                    let result = call_with_timeout(&target.name, target.timeout, async move {
                        instance.on_event(&event, &context).await
                    })
                    .await;
                    (target, result, started.elapsed())
                }
            }))
            .await;

            let mut newly_disabled = Vec::new();
            {
                let mut entries = self.entries.lock().await;
                for (target, result, duration) in results {
                    let entry = &mut entries[target.index];
                    entry.metrics.executions += 1;
                    entry.metrics.total_duration += duration;
                    let n = entry.metrics.executions as f64;
                    entry.metrics.avg_duration_ms +=
                        (duration.as_secs_f64() * 1000.0 - entry.metrics.avg_duration_ms) / n;

                    match result {
                        Ok(()) => {
                            entry.state.consecutive_failures = 0;
                        }
                        Err(err) => {
                            warn!(plugin = %target.name, error = %err, "plugin event handler failed");
                            entry.metrics.failures += 1;
                            entry.metrics.last_error = Some(err.to_string());
                            entry.state.consecutive_failures += 1;
                            entry.state.last_failure_at = Some(Instant::now());

                            if entry.state.consecutive_failures >= self.policy.failure_threshold
                                && !entry.state.disabled
                            {
                                entry.state.disabled = true;
                                entry.state.disabled_at = Some(Instant::now());
                                warn!(
                                    plugin = %target.name,
                                    failures = entry.state.consecutive_failures,
                                    "circuit breaker opened"
                                );
                                newly_disabled.push(target.name.clone());
                            }
                        }
                    }
                }
            }
            for name in newly_disabled {
                self.notify_status(&name, "disabled");
            }
        }
    }

    /// Shut down every plugin concurrently and clear all engine state.
    /// Individual failures are logged and do not block the others.
    pub async fn shutdown(&self) {
        let entries: Vec<PluginEntry> = {
            let mut guard = self.entries.lock().await;
            guard.drain(..).collect()
        };

        let results = join_all(entries.iter().map(|entry| {
            let name = entry.manifest.name.clone();
            let instance = entry.instance.clone();
            async move { (name, instance.shutdown().await) }
        }))
        .await;

        for (name, result) in results {
            if let Err(err) = result {
                warn!(plugin = %name, error = %err, "plugin shutdown failed");
            }
        }
        info!("plugin engine shut down");
    }

    /// Subscribe this engine as a wildcard listener on `bus`; every
    /// published event is dispatched to the plugin set.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriptionId {
        let engine = Arc::clone(self);
        bus.on(
            Subject::Any,
            crate::events::listener(move |event| {
                let engine = engine.clone();
                async move {
                    engine.execute_plugins(&event).await;
                    Ok(())
                }
            }),
        )
    }

    /// Snapshot of per-plugin counters.
    pub async fn metrics(&self) -> HashMap<String, PluginMetrics> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|entry| (entry.manifest.name.clone(), entry.metrics.clone()))
            .collect()
    }

    /// Breaker state for one plugin.
    pub async fn health(&self, name: &str) -> Option<PluginHealth> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|entry| entry.manifest.name == name)
            .map(|entry| PluginHealth {
                disabled: entry.state.disabled,
                consecutive_failures: entry.state.consecutive_failures,
                last_failure_at: entry.state.last_failure_at,
            })
    }

    /// Re-enable cooled-down plugins, then snapshot dispatch targets.
    /// With `enabled_only` false, disabled plugins are included (used by
    /// initialization, which runs before any breaker can open).
    async fn snapshot(&self, enabled_only: bool) -> Vec<DispatchTarget> {
        let mut reenabled = Vec::new();
        let targets = {
            let mut entries = self.entries.lock().await;
            for entry in entries.iter_mut() {
                if entry.state.disabled {
                    if let Some(disabled_at) = entry.state.disabled_at {
                        if disabled_at.elapsed() >= self.policy.cooldown {
                            entry.state.disabled = false;
                            entry.state.disabled_at = None;
                            entry.state.consecutive_failures = 0;
                            info!(plugin = %entry.manifest.name, "circuit breaker closed after cooldown");
                            reenabled.push(entry.manifest.name.clone());
                        }
                    }
                }
            }

            entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| !enabled_only || !entry.state.disabled)
                .map(|(index, entry)| DispatchTarget {
                    index,
                    name: entry.manifest.name.clone(),
                    instance: entry.instance.clone(),
                    timeout: Duration::from_millis(entry.manifest.timeout_ms),
                    priority: entry.manifest.priority,
                })
                .collect()
        };

        for name in reenabled {
            self.notify_status(&name, "re_enabled");
        }
        targets
    }

    fn notify_status(&self, plugin: &str, status: &str) {
        let bus = self.context.bus.clone();
        let event = Event::new(
            EventPayload::PluginStatus {
                plugin: plugin.to_string(),
                status: status.to_string(),
            },
            EventMetadata::new("", "plugin_engine"),
        );
        tokio::spawn(async move {
            bus.publish(event).await;
        });
    }
}

/// Race `future` against `timeout`. The future runs on its own task: on
/// timeout it is abandoned, not cancelled, and may still complete in the
/// background.
async fn call_with_timeout<F>(name: &str, timeout: Duration, future: F) -> Result<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(future);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(Error::PluginExecution(format!("{name}: {join_err}"))),
        Err(_) => Err(Error::PluginTimeout(format!(
            "{name} exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}
