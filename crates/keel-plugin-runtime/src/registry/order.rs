//! Dependency ordering and cycle detection

use crate::error::{Result, RuntimeError};
use keel_plugin_api::{LoadPriority, PluginMetadata, PluginVersion};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// One plugin in a computed load order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadOrderEntry {
    /// Plugin name
    pub name: String,
    /// Bucket derived from the plugin's tags
    pub priority: LoadPriority,
}

/// Plugins in the order they must load.
///
/// Dependencies always precede their dependents. Among plugins whose
/// dependencies are already satisfied, higher buckets go first, then names
/// alphabetically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadOrder {
    entries: Vec<LoadOrderEntry>,
}

impl LoadOrder {
    /// Entries in load order
    pub fn entries(&self) -> &[LoadOrderEntry] {
        &self.entries
    }

    /// Names in load order
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Names in one bucket, in load order
    pub fn bucket(&self, priority: LoadPriority) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.priority == priority)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Position of `name`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Number of plugins
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is to be loaded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// Find a dependency cycle among `plugins`.
///
/// Returns the offending chain with its first plugin repeated at the end,
/// e.g. `["a", "b", "a"]`. Dependencies on plugins outside the set are
/// ignored.
pub fn has_circular_dependency(plugins: &[PluginMetadata]) -> Option<Vec<String>> {
    let graph: HashMap<&str, Vec<&str>> = plugins
        .iter()
        .map(|p| {
            (
                p.name.as_str(),
                p.dependencies.iter().map(|d| d.name.as_str()).collect(),
            )
        })
        .collect();

    let mut marks: HashMap<&str, Mark> = graph.keys().map(|k| (*k, Mark::White)).collect();
    let mut roots: Vec<&str> = graph.keys().copied().collect();
    roots.sort_unstable();

    for root in roots {
        if marks.get(root) != Some(&Mark::White) {
            continue;
        }
        let mut path = Vec::new();
        if let Some(chain) = visit(root, &graph, &mut marks, &mut path) {
            return Some(chain);
        }
    }
    None
}

fn visit<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(node, Mark::Grey);
    path.push(node);

    for &dep in graph.get(node).map(Vec::as_slice).unwrap_or_default() {
        match marks.get(dep) {
            Some(Mark::Grey) => {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut chain: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                chain.push(dep.to_string());
                return Some(chain);
            }
            Some(Mark::White) => {
                if let Some(chain) = visit(dep, graph, marks, path) {
                    return Some(chain);
                }
            }
            Some(Mark::Black) | None => {}
        }
    }

    path.pop();
    marks.insert(node, Mark::Black);
    None
}

/// Order `plugins` so every dependency loads before its dependents.
///
/// `available` holds plugins already loaded elsewhere; they satisfy
/// dependencies without appearing in the result. Fails with
/// `DependencyCycle` or `DependencyMissing` before anything is loaded.
pub fn calculate_load_order(
    plugins: &[PluginMetadata],
    available: &HashMap<String, PluginVersion>,
) -> Result<LoadOrder> {
    if let Some(chain) = has_circular_dependency(plugins) {
        return Err(RuntimeError::DependencyCycle { chain });
    }

    let by_name: HashMap<&str, &PluginMetadata> =
        plugins.iter().map(|p| (p.name.as_str(), p)).collect();
    let mut pending: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for plugin in plugins {
        let mut waiting = 0;
        for dep in &plugin.dependencies {
            let version = match by_name.get(dep.name.as_str()) {
                Some(meta) => Some(&meta.version),
                None => available.get(&dep.name),
            };
            match version {
                Some(version) if dep.is_satisfied_by(version) => {}
                Some(version) if !dep.optional => {
                    return Err(RuntimeError::dependency_missing(format!(
                        "{} requires {} >= {}, found {version}",
                        plugin.name, dep.name, dep.min_version
                    )));
                }
                None if !dep.optional => {
                    return Err(RuntimeError::dependency_missing(format!(
                        "{} requires {} >= {}",
                        plugin.name, dep.name, dep.min_version
                    )));
                }
                _ => {}
            }
            if by_name.contains_key(dep.name.as_str()) {
                waiting += 1;
                dependents
                    .entry(dep.name.as_str())
                    .or_default()
                    .push(plugin.name.as_str());
            }
        }
        pending.insert(plugin.name.as_str(), waiting);
    }

    let key = |name: &str| {
        let priority = by_name
            .get(name)
            .map_or(LoadPriority::Normal, |p| p.load_priority());
        (priority, name.to_string())
    };

    let mut ready: BTreeSet<(LoadPriority, String)> = pending
        .iter()
        .filter(|(_, waiting)| **waiting == 0)
        .map(|(name, _)| key(name))
        .collect();
    let mut entries = Vec::with_capacity(plugins.len());

    while let Some((priority, name)) = ready.pop_first() {
        if let Some(children) = dependents.get(name.as_str()) {
            for child in children {
                if let Some(waiting) = pending.get_mut(child) {
                    *waiting -= 1;
                    if *waiting == 0 {
                        ready.insert(key(child));
                    }
                }
            }
        }
        entries.push(LoadOrderEntry { name, priority });
    }

    Ok(LoadOrder { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_plugin_api::PluginDependency;

    fn v(s: &str) -> PluginVersion {
        s.parse().unwrap()
    }

    fn plugin(name: &str, deps: &[&str]) -> PluginMetadata {
        deps.iter().fold(PluginMetadata::new(name, v("1.0.0")), |m, d| {
            m.with_dependency(PluginDependency::required(*d, v("1.0.0")))
        })
    }

    #[test]
    fn test_detects_cycle_with_chain() {
        let plugins = vec![
            plugin("a", &["b"]),
            plugin("b", &["c"]),
            plugin("c", &["a"]),
            plugin("d", &[]),
        ];
        let chain = has_circular_dependency(&plugins).unwrap();
        assert_eq!(chain, vec!["a", "b", "c", "a"]);

        let err = calculate_load_order(&plugins, &HashMap::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::DependencyCycle { .. }));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let chain = has_circular_dependency(&[plugin("solo", &["solo"])]).unwrap();
        assert_eq!(chain, vec!["solo", "solo"]);
    }

    #[test]
    fn test_acyclic_graph() {
        let plugins = vec![plugin("a", &[]), plugin("b", &["a"]), plugin("c", &["a", "b"])];
        assert!(has_circular_dependency(&plugins).is_none());
    }

    #[test]
    fn test_dependencies_before_dependents() {
        let plugins = vec![
            plugin("render", &["core"]),
            plugin("core", &[]),
            plugin("ui", &["render", "core"]),
        ];
        let order = calculate_load_order(&plugins, &HashMap::new()).unwrap();
        assert_eq!(order.names(), vec!["core", "render", "ui"]);
    }

    #[test]
    fn test_priority_buckets_break_ties() {
        let plugins = vec![
            plugin("zeta", &[]).with_tag("critical"),
            plugin("alpha", &[]).with_tag("low"),
            plugin("mid", &[]),
            plugin("beta", &[]).with_tag("high"),
            plugin("needs-alpha", &["alpha"]).with_tag("critical"),
        ];
        let order = calculate_load_order(&plugins, &HashMap::new()).unwrap();

        assert_eq!(order.names(), vec!["zeta", "beta", "mid", "alpha", "needs-alpha"]);
        assert_eq!(order.bucket(LoadPriority::Critical), vec!["zeta", "needs-alpha"]);
        assert_eq!(order.bucket(LoadPriority::Low), vec!["alpha"]);
        assert!(order.position("alpha") < order.position("needs-alpha"));
    }

    #[test]
    fn test_missing_and_outdated_dependencies() {
        let plugins = vec![plugin("b", &["a"])];
        let err = calculate_load_order(&plugins, &HashMap::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::DependencyMissing(_)));

        let mut available = HashMap::new();
        available.insert("a".to_string(), v("0.9.0"));
        assert!(calculate_load_order(&plugins, &available).is_err());

        available.insert("a".to_string(), v("1.2.0"));
        let order = calculate_load_order(&plugins, &available).unwrap();
        assert_eq!(order.names(), vec!["b"]);
    }

    #[test]
    fn test_optional_dependency_may_be_absent() {
        let meta = PluginMetadata::new("extra", v("1.0.0"))
            .with_dependency(PluginDependency::optional("telemetry", v("1.0.0")));
        let order = calculate_load_order(&[meta], &HashMap::new()).unwrap();
        assert_eq!(order.len(), 1);
    }
}
