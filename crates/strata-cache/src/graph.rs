//! Dependency graph with a reverse index
//!
//! Keys depend on dependency IDs. The forward map answers "what does this key depend
//! on" and the reverse map answers "which keys depend on this ID". Both maps are always
//! mutated together so invalidation costs O(affected keys).

use std::collections::{HashMap, HashSet, VecDeque};

/// Forward and reverse dependency maps
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    forward: HashMap<String, HashSet<String>>,
    reverse: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dependency set of `key`
    pub fn insert(&mut self, key: &str, dependencies: HashSet<String>) {
        self.unlink(key);
        for dependency in &dependencies {
            self.reverse
                .entry(dependency.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.forward.insert(key.to_string(), dependencies);
    }

    /// Add one edge: `key` depends on `dependency`
    pub fn add_edge(&mut self, key: &str, dependency: &str) {
        self.forward
            .entry(key.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.reverse
            .entry(dependency.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Remove `key` and all of its edges
    pub fn remove(&mut self, key: &str) -> Option<HashSet<String>> {
        let dependencies = self.unlink(key);
        self.forward.remove(key);
        dependencies
    }

    fn unlink(&mut self, key: &str) -> Option<HashSet<String>> {
        let dependencies = self.forward.get(key)?.clone();
        for dependency in &dependencies {
            if let Some(dependents) = self.reverse.get_mut(dependency) {
                dependents.remove(key);
                if dependents.is_empty() {
                    self.reverse.remove(dependency);
                }
            }
        }
        Some(dependencies)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.forward.contains_key(key)
    }

    pub fn dependencies_of(&self, key: &str) -> Option<&HashSet<String>> {
        self.forward.get(key)
    }

    /// Keys that directly depend on `dependency`
    pub fn dependents_of(&self, dependency: &str) -> Vec<String> {
        self.reverse
            .get(dependency)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every key reachable from `dependency` through the reverse index
    ///
    /// A key that gets invalidated is itself treated as a dependency ID, so derived
    /// values built on other derived values are included. The result is in
    /// breadth-first order and never contains `dependency` itself.
    pub fn cascade(&self, dependency: &str) -> Vec<String> {
        let mut affected = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        seen.insert(dependency);
        queue.push_back(dependency);

        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.reverse.get(current) {
                for key in dependents {
                    if seen.insert(key.as_str()) {
                        affected.push(key.clone());
                        queue.push_back(key.as_str());
                    }
                }
            }
        }
        affected
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Number of distinct dependency IDs referenced by any key
    pub fn dependency_count(&self) -> usize {
        self.reverse.len()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }
}
