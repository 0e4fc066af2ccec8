use std::collections::{HashMap, HashSet};

use super::PluginError;

/// Orders plugins so every plugin comes after the plugins it depends on.
#[derive(Debug, Default, Clone)]
pub struct PluginDependencyManager {
    order: Vec<String>,
    graph: HashMap<String, Vec<String>>,
}

impl PluginDependencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a plugin's dependency list
    pub fn add_plugin(&mut self, name: impl Into<String>, dependencies: Vec<String>) {
        let name = name.into();
        if !self.graph.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.graph.insert(name, dependencies);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.graph.contains_key(name)
    }

    /// Depth-first topological sort, roots in insertion order.
    ///
    /// Dependencies that were never added are skipped and do not appear in
    /// the output; see [`missing_dependencies`](Self::missing_dependencies).
    pub fn resolve_dependencies(&self) -> Result<Vec<String>, PluginError> {
        let mut resolved = Vec::with_capacity(self.order.len());
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();

        for name in &self.order {
            self.visit(name, &mut visited, &mut in_progress, &mut resolved)?;
        }
        Ok(resolved)
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        visited: &mut HashSet<&'a str>,
        in_progress: &mut HashSet<&'a str>,
        resolved: &mut Vec<String>,
    ) -> Result<(), PluginError> {
        if in_progress.contains(name) {
            return Err(PluginError::CircularDependency(name.to_string()));
        }
        if visited.contains(name) {
            return Ok(());
        }
        let Some(dependencies) = self.graph.get(name) else {
            return Ok(());
        };

        in_progress.insert(name);
        for dependency in dependencies {
            self.visit(dependency, visited, in_progress, resolved)?;
        }
        in_progress.remove(name);

        visited.insert(name);
        resolved.push(name.to_string());
        Ok(())
    }

    /// `(plugin, dependency)` pairs whose dependency was never added
    pub fn missing_dependencies(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for name in &self.order {
            for dependency in &self.graph[name] {
                if !self.graph.contains_key(dependency) {
                    missing.push((name.clone(), dependency.clone()));
                }
            }
        }
        missing
    }

    /// Plugins that list `name` as a direct dependency, in insertion order
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|plugin| self.graph[plugin.as_str()].iter().any(|d| d == name))
            .cloned()
            .collect()
    }
}
