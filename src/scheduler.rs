//! Dependency/mutex DAG construction, cycle detection, and wave scheduling.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::EngineError;
use crate::models::PluginDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// The execution DAG: plugin names as nodes, edges from dependency
/// declarations and shared-mutex conflicts (tie-broken lexicographically).
#[derive(Debug, Clone)]
pub struct ExecutionDag {
    nodes: BTreeSet<String>,
    /// node -> direct predecessors (nodes that must complete first)
    predecessors: HashMap<String, BTreeSet<String>>,
    /// node -> direct successors
    successors: HashMap<String, BTreeSet<String>>,
}

impl ExecutionDag {
    pub fn build(descriptors: &[PluginDescriptor]) -> Result<Self, EngineError> {
        let mut nodes = BTreeSet::new();
        let mut predecessors: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut successors: HashMap<String, BTreeSet<String>> = HashMap::new();

        for d in descriptors {
            nodes.insert(d.name.clone());
            predecessors.entry(d.name.clone()).or_default();
            successors.entry(d.name.clone()).or_default();
        }

        for d in descriptors {
            for dep in &d.dependencies {
                if !nodes.contains(dep) {
                    return Err(EngineError::configuration(format!(
                        "plugin '{}' depends on unknown plugin '{}'",
                        d.name, dep
                    )));
                }
                predecessors.get_mut(&d.name).unwrap().insert(dep.clone());
                successors.get_mut(dep).unwrap().insert(d.name.clone());
            }
        }

        for i in 0..descriptors.len() {
            for j in (i + 1)..descriptors.len() {
                let a = &descriptors[i];
                let b = &descriptors[j];
                if a.mutexes.iter().any(|m| b.mutexes.contains(m)) {
                    let (first, second) = if a.name < b.name { (&a.name, &b.name) } else { (&b.name, &a.name) };
                    predecessors.get_mut(second).unwrap().insert(first.clone());
                    successors.get_mut(first).unwrap().insert(second.clone());
                }
            }
        }

        let dag = Self { nodes, predecessors, successors };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<(), EngineError> {
        let mut color: HashMap<&str, Color> = self.nodes.iter().map(|n| (n.as_str(), Color::White)).collect();
        let mut stack_path: Vec<String> = Vec::new();

        for start in &self.nodes {
            if color[start.as_str()] == Color::White {
                self.visit(start, &mut color, &mut stack_path)?;
            }
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        color: &mut HashMap<&'a str, Color>,
        path: &mut Vec<String>,
    ) -> Result<(), EngineError> {
        color.insert(node, Color::Gray);
        path.push(node.to_string());
        if let Some(succs) = self.successors.get(node) {
            for succ in succs {
                match color.get(succ.as_str()) {
                    Some(Color::White) | None => self.visit(succ, color, path)?,
                    Some(Color::Gray) => {
                        let mut cycle = path.clone();
                        cycle.push(succ.clone());
                        return Err(EngineError::CyclicDependency { cycle: cycle.join(" -> ") });
                    }
                    Some(Color::Black) => {}
                }
            }
        }
        path.pop();
        color.insert(node, Color::Black);
        Ok(())
    }

    /// Builds execution waves: each wave is every node whose predecessors
    /// are all already scheduled in an earlier wave, sorted lexicographically
    /// for determinism.
    pub fn waves(&self) -> Result<Vec<Vec<String>>, EngineError> {
        let mut completed: HashSet<String> = HashSet::new();
        let mut waves = Vec::new();

        while completed.len() < self.nodes.len() {
            let mut ready: Vec<String> = self
                .nodes
                .iter()
                .filter(|n| !completed.contains(n.as_str()))
                .filter(|n| self.predecessors[n.as_str()].iter().all(|p| completed.contains(p)))
                .cloned()
                .collect();

            if ready.is_empty() {
                return Err(EngineError::SchedulerDeadlock { remaining: self.nodes.len() - completed.len() });
            }
            ready.sort();
            for n in &ready {
                completed.insert(n.clone());
            }
            waves.push(ready);
        }
        Ok(waves)
    }

    fn ancestors(&self, node: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = self.predecessors.get(node).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        while let Some(n) = stack.pop() {
            if seen.insert(n.clone()) {
                if let Some(preds) = self.predecessors.get(&n) {
                    stack.extend(preds.iter().cloned());
                }
            }
        }
        seen
    }

    /// `false` iff `a` is an ancestor of `b`, `b` is an ancestor of `a`, or
    /// they share a mutex edge (covered by the transitive ancestor check,
    /// since mutex edges are themselves DAG edges). Uses full transitive
    /// ancestry, not just direct predecessors.
    pub fn can_run_parallel(&self, a: &str, b: &str) -> bool {
        if a == b {
            return false;
        }
        let ancestors_of_b = self.ancestors(b);
        let ancestors_of_a = self.ancestors(a);
        !ancestors_of_b.contains(a) && !ancestors_of_a.contains(b)
    }

    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, deps: &[&str], mutexes: &[&str]) -> PluginDescriptor {
        PluginDescriptor {
            name: name.to_string(),
            mutexes: mutexes.iter().map(|s| s.to_string()).collect(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            requires_sudo: false,
            executable: None,
            phase_commands: None,
        }
    }

    #[test]
    fn scenario_a_mutex_serialization() {
        let descriptors = vec![descriptor("dpkg", &[], &["pkgmgr:dpkg"]), descriptor("apt", &[], &["pkgmgr:dpkg"])];
        let dag = ExecutionDag::build(&descriptors).unwrap();
        let waves = dag.waves().unwrap();
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0], vec!["apt".to_string()]);
        assert_eq!(waves[1], vec!["dpkg".to_string()]);
    }

    #[test]
    fn scenario_b_dependency_chain() {
        let descriptors = vec![
            descriptor("conda-self", &[], &[]),
            descriptor("conda-packages", &["conda-self"], &[]),
            descriptor("conda-clean", &["conda-packages"], &[]),
        ];
        let dag = ExecutionDag::build(&descriptors).unwrap();
        let waves = dag.waves().unwrap();
        assert_eq!(waves, vec![vec!["conda-self"], vec!["conda-packages"], vec!["conda-clean"]]);
    }

    #[test]
    fn detects_cycles() {
        let descriptors = vec![descriptor("a", &["b"], &[]), descriptor("b", &["a"], &[])];
        let err = ExecutionDag::build(&descriptors).unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency { .. }));
    }

    #[test]
    fn can_run_parallel_respects_transitive_ancestry() {
        let descriptors = vec![descriptor("a", &[], &[]), descriptor("b", &["a"], &[]), descriptor("c", &["b"], &[])];
        let dag = ExecutionDag::build(&descriptors).unwrap();
        assert!(!dag.can_run_parallel("a", "c"));
        assert!(!dag.can_run_parallel("a", "b"));
    }

    #[test]
    fn independent_plugins_can_run_parallel() {
        let descriptors = vec![descriptor("a", &[], &[]), descriptor("b", &[], &[])];
        let dag = ExecutionDag::build(&descriptors).unwrap();
        assert!(dag.can_run_parallel("a", "b"));
    }

    #[test]
    fn wave_schedule_is_deterministic() {
        let descriptors = vec![descriptor("z", &[], &[]), descriptor("a", &[], &[]), descriptor("m", &[], &[])];
        let dag1 = ExecutionDag::build(&descriptors).unwrap();
        let dag2 = ExecutionDag::build(&descriptors).unwrap();
        assert_eq!(dag1.waves().unwrap(), dag2.waves().unwrap());
        assert_eq!(dag1.waves().unwrap()[0], vec!["a", "m", "z"]);
    }
}
