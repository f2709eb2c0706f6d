//! Generic name→plugin registry used for both volume and NIC plugins.
//!
//! Threaded explicitly through construction rather than built from a
//! global default set — the default `isolated`/`providernet` registry is
//! assembled by a factory function in `main.rs`, not by module init.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{ProviderError, Result};

/// Anything a registry can look up by spec: plugins implement
/// `can_support` over whatever spec type they're registered for.
pub trait SupportsSpec<S> {
    fn can_support(&self, spec: &S) -> bool;
}

struct Entry<P> {
    plugin: P,
    priority: i32,
}

/// Read-mostly name→(plugin, priority) table, guarded by a
/// readers/writer lock so every plugin method invocation remains
/// concurrency-safe and callable from any worker.
pub struct PluginRegistry<P> {
    entries: RwLock<HashMap<String, Entry<P>>>,
}

impl<P> Default for PluginRegistry<P> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<P: Clone> PluginRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, priority: i32, plugin: P) -> Result<()> {
        let name = name.into();
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&name) {
            return Err(ProviderError::already_exists(name, "registry.register"));
        }
        entries.insert(name, Entry { plugin, priority });
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Result<P> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .map(|e| e.plugin.clone())
            .ok_or_else(|| ProviderError::not_found(name, "registry.find_by_name"))
    }

    /// Returns the unique plugin whose `can_support(spec)` is true; zero
    /// or multiple matches are errors.
    pub fn find_by_spec<S>(&self, spec: &S) -> Result<P>
    where
        P: SupportsSpec<S>,
    {
        let entries = self.entries.read().unwrap();
        let mut matches: Vec<(&String, &Entry<P>)> = entries
            .iter()
            .filter(|(_, e)| e.plugin.can_support(spec))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(b.0));
        match matches.len() {
            0 => Err(ProviderError::not_found("spec", "registry.find_by_spec")),
            1 => Ok(matches[0].1.plugin.clone()),
            _ => Err(ProviderError::ambiguous(
                "spec",
                "registry.find_by_spec",
                matches.into_iter().map(|(n, _)| n.clone()).collect(),
            )),
        }
    }

    /// Lowest-priority (numerically smallest) plugin, ties broken by name.
    pub fn default_plugin(&self) -> Result<P> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .min_by(|(name_a, a), (name_b, b)| {
                a.priority.cmp(&b.priority).then_with(|| name_a.cmp(name_b))
            })
            .map(|(_, e)| e.plugin.clone())
            .ok_or_else(|| ProviderError::not_found("default", "registry.default_plugin"))
    }

    /// Names in ascending priority order, ties broken lexicographically.
    pub fn plugin_names(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        let mut names: Vec<(String, i32)> =
            entries.iter().map(|(n, e)| (n.clone(), e.priority)).collect();
        names.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        names.into_iter().map(|(n, _)| n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Dummy(&'static str);

    impl SupportsSpec<&'static str> for Dummy {
        fn can_support(&self, spec: &&'static str) -> bool {
            self.0 == *spec
        }
    }

    #[test]
    fn register_duplicate_name_is_already_exists() {
        let reg: PluginRegistry<Dummy> = PluginRegistry::new();
        reg.register("a", 1, Dummy("a")).unwrap();
        assert!(matches!(
            reg.register("a", 2, Dummy("a")),
            Err(ProviderError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn default_plugin_is_numerically_smallest_priority() {
        let reg: PluginRegistry<Dummy> = PluginRegistry::new();
        reg.register("b", 10, Dummy("b")).unwrap();
        reg.register("a", 5, Dummy("a")).unwrap();
        assert_eq!(reg.plugin_names(), vec!["a", "b"]);
    }

    #[test]
    fn find_by_spec_ambiguous_when_multiple_match() {
        let reg: PluginRegistry<Dummy> = PluginRegistry::new();
        reg.register("a", 1, Dummy("x")).unwrap();
        reg.register("b", 2, Dummy("x")).unwrap();
        assert!(matches!(
            reg.find_by_spec(&"x"),
            Err(ProviderError::PluginAmbiguous { .. })
        ));
    }

    #[test]
    fn find_by_spec_not_found_when_no_match() {
        let reg: PluginRegistry<Dummy> = PluginRegistry::new();
        reg.register("a", 1, Dummy("x")).unwrap();
        assert!(matches!(
            reg.find_by_spec(&"y"),
            Err(ProviderError::NotFound { .. })
        ));
    }
}
