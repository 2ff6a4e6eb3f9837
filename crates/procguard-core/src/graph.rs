//! Dependency graph over process names.
//!
//! Edges point from a process to the processes it requires. The graph is
//! kept acyclic: registrations that would introduce a cycle are rejected.
//! Cascade shutdown walks the reverse edges (who depends on the origin,
//! transitively).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{GuardError, GuardResult};

#[derive(Debug, Default)]
pub struct DepGraph {
    requires: HashMap<String, Vec<String>>,
}

impl DepGraph {
    /// Build a graph from a whole set of declarations at once, so the
    /// declaration order does not matter. Fails on unknown dependency
    /// names, self-dependencies and cycles.
    pub fn build(entries: impl IntoIterator<Item = (String, Vec<String>)>) -> GuardResult<Self> {
        let requires: HashMap<String, Vec<String>> = entries.into_iter().collect();
        for (name, deps) in &requires {
            for dep in deps {
                if dep == name {
                    return Err(GuardError::Config(format!(
                        "process {name} cannot depend on itself"
                    )));
                }
                if !requires.contains_key(dep) {
                    return Err(GuardError::Config(format!(
                        "process {name} depends on unknown process {dep}"
                    )));
                }
            }
        }
        if topo_sort(&requires).is_none() {
            return Err(GuardError::Config(
                "process dependencies form a cycle".to_string(),
            ));
        }
        Ok(Self { requires })
    }

    /// Register a node with its dependencies. Fails when a dependency is
    /// unknown or the edge set would form a cycle.
    pub fn insert(&mut self, name: &str, deps: &[String]) -> GuardResult<()> {
        for dep in deps {
            if dep == name {
                return Err(GuardError::Config(format!(
                    "process {name} cannot depend on itself"
                )));
            }
            if !self.requires.contains_key(dep) {
                return Err(GuardError::Config(format!(
                    "process {name} depends on unknown process {dep}"
                )));
            }
        }

        let mut probe = self.requires.clone();
        probe.insert(name.to_string(), deps.to_vec());
        if topo_sort(&probe).is_none() {
            return Err(GuardError::Config(format!(
                "dependency cycle introduced by process {name}"
            )));
        }

        self.requires = probe;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) {
        self.requires.remove(name);
        for deps in self.requires.values_mut() {
            deps.retain(|d| d != name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.requires.contains_key(name)
    }

    /// Direct dependencies of `name`.
    pub fn requires(&self, name: &str) -> &[String] {
        self.requires.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Everything whose transitive dependency closure contains `origin`,
    /// i.e. the victims of a cascade shutdown. Excludes `origin` itself.
    pub fn dependents_closure(&self, origin: &str) -> Vec<String> {
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, deps) in &self.requires {
            for dep in deps {
                reverse.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(origin);
        let mut out = Vec::new();
        while let Some(cur) = queue.pop_front() {
            for dep in reverse.get(cur).into_iter().flatten() {
                if seen.insert(dep) {
                    out.push(dep.to_string());
                    queue.push_back(dep);
                }
            }
        }
        out.sort();
        out
    }

    /// All nodes, dependencies before dependents. Used for ordered
    /// auto-start on boot.
    pub fn topo_order(&self) -> Vec<String> {
        topo_sort(&self.requires).unwrap_or_else(|| {
            // The graph is kept acyclic by insert(); an arbitrary order is
            // still a safe fallback.
            self.requires.keys().cloned().collect()
        })
    }
}

/// Kahn's algorithm; `None` when the graph has a cycle.
fn topo_sort(requires: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = requires
        .keys()
        .map(|name| (name.as_str(), 0usize))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, deps) in requires {
        for dep in deps {
            if dep == name || !requires.contains_key(dep) {
                continue;
            }
            *in_degree.get_mut(name.as_str())? += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(name.as_str());
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(requires.len());
    while let Some(cur) = ready.pop() {
        order.push(cur.to_string());
        for dep in dependents.get(cur).into_iter().flatten() {
            let d = in_degree.get_mut(dep)?;
            *d -= 1;
            if *d == 0 {
                ready.push(dep);
            }
        }
    }

    if order.len() == requires.len() {
        Some(order)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> DepGraph {
        // web -> api -> db
        let mut g = DepGraph::default();
        g.insert("db", &[]).unwrap();
        g.insert("api", &["db".to_string()]).unwrap();
        g.insert("web", &["api".to_string()]).unwrap();
        g
    }

    #[test]
    fn rejects_unknown_dependency() {
        let mut g = DepGraph::default();
        let err = g.insert("api", &["db".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn rejects_cycles() {
        let mut g = chain();
        // db -> web closes the loop
        let err = g.insert("db", &["web".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "config_error");
        // and the failed insert must not have mutated the graph
        assert!(g.requires("db").is_empty());
    }

    #[test]
    fn closure_walks_reverse_edges_transitively() {
        let g = chain();
        assert_eq!(g.dependents_closure("db"), vec!["api", "web"]);
        assert_eq!(g.dependents_closure("api"), vec!["web"]);
        assert!(g.dependents_closure("web").is_empty());
    }

    #[test]
    fn topo_order_puts_dependencies_first() {
        let g = chain();
        let order = g.topo_order();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("db") < pos("api"));
        assert!(pos("api") < pos("web"));
    }

    #[test]
    fn remove_drops_edges_to_node() {
        let mut g = chain();
        g.remove("db");
        assert!(g.requires("api").is_empty());
        assert!(g.dependents_closure("db").is_empty());
    }
}
