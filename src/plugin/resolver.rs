//! Dependency resolution for discovered plugins
//!
//! Produces an execution order in which every dependency precedes its
//! dependents. Ties are broken by manifest priority (ascending), then by
//! discovery order. A dependency on a name that was not discovered, or a
//! reachable cycle, fails the whole resolution.

use super::DiscoveredPlugin;
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap};

/// Resolve a topological order over `plugins`, returned as indexes into
/// the input slice. The slice position is the discovery order.
pub fn resolve_order(plugins: &[DiscoveredPlugin]) -> Result<Vec<usize>> {
    let mut index_by_name: HashMap<&str, usize> = HashMap::new();
    for (index, plugin) in plugins.iter().enumerate() {
        if index_by_name
            .insert(plugin.manifest.name.as_str(), index)
            .is_some()
        {
            return Err(Error::PluginAlreadyExists(plugin.manifest.name.clone()));
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plugins.len()];
    let mut indegree: Vec<usize> = vec![0; plugins.len()];
    for (index, plugin) in plugins.iter().enumerate() {
        for dependency in &plugin.manifest.dependencies {
            let Some(&dep_index) = index_by_name.get(dependency.as_str()) else {
                return Err(Error::MissingDependency(format!(
                    "plugin {} depends on {dependency}, which is not loaded",
                    plugin.manifest.name
                )));
            };
            dependents[dep_index].push(index);
            indegree[index] += 1;
        }
    }

    // Kahn's algorithm with a (priority, discovery-order) ready set.
    let mut ready: BTreeSet<(i32, usize)> = plugins
        .iter()
        .enumerate()
        .filter(|(index, _)| indegree[*index] == 0)
        .map(|(index, plugin)| (plugin.manifest.priority, index))
        .collect();

    let mut order = Vec::with_capacity(plugins.len());
    while let Some(&(priority, index)) = ready.iter().next() {
        ready.remove(&(priority, index));
        order.push(index);
        for &dependent in &dependents[index] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert((plugins[dependent].manifest.priority, dependent));
            }
        }
    }

    if order.len() != plugins.len() {
        let stuck: Vec<&str> = plugins
            .iter()
            .enumerate()
            .filter(|(index, _)| indegree[*index] > 0)
            .map(|(_, plugin)| plugin.manifest.name.as_str())
            .collect();
        return Err(Error::CircularDependency(format!(
            "dependency cycle involving: {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}
