//! Batch scheduling over the recipe graph.
//!
//! Nodes are recipes, edges are build plus runtime dependencies with
//! self-edges dropped. Cycles are broken by removing every out-edge of
//! each non-trivial strongly connected component; those nodes form the
//! *bootstrap* round and are rebuilt in a second round against the first
//! round's outputs. A fixed-size worker pool consumes nodes whose
//! dependencies are satisfied; a failure marks all transitive dependents
//! failed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::meta::Recipe;

#[derive(Debug)]
pub struct Node {
    pub pkg: String,
    pub pkg_dir: PathBuf,
    /// Indices of nodes this one depends on (after self-edge removal).
    pub deps: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
    by_name: HashMap<String, usize>,
}

impl Graph {
    /// Build the graph from every `<pkgs_dir>/<pkg>/build.textproto`.
    /// Dependencies on packages without a recipe (e.g. prebuilt
    /// bootstrap binaries) are ignored.
    pub fn from_recipes(pkgs_dir: &Path) -> Result<Self, Error> {
        let mut recipes: Vec<(String, PathBuf, Recipe)> = vec![];
        for entry in std::fs::read_dir(pkgs_dir)? {
            let entry = entry?;
            let recipe_path = entry.path().join("build.textproto");
            if !recipe_path.exists() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match Recipe::read_from(&recipe_path) {
                Ok(recipe) => recipes.push((name, entry.path(), recipe)),
                Err(e) => warn!(pkg = name, error = %e, "skipping unparseable recipe"),
            }
        }
        recipes.sort_by(|a, b| a.0.cmp(&b.0));

        let by_name: HashMap<String, usize> =
            recipes.iter().enumerate().map(|(i, (name, _, _))| (name.clone(), i)).collect();

        let mut nodes = vec![];
        for (name, dir, recipe) in &recipes {
            let mut deps = vec![];
            let mut all: Vec<&str> = recipe.deps.iter().map(String::as_str).collect();
            all.extend(recipe.runtime_deps.iter().map(String::as_str));
            all.extend(crate::resolve::builder_deps(recipe.builder.as_ref()));
            for dep in all {
                // deps may be partials; the graph is keyed by name
                let dep_name = crate::pkg::PackageId::parse(dep)
                    .map(|id| id.name)
                    .unwrap_or_else(|_| dep.to_string());
                if dep_name == *name {
                    continue;
                }
                if let Some(&idx) = by_name.get(&dep_name) {
                    if !deps.contains(&idx) {
                        deps.push(idx);
                    }
                }
            }
            nodes.push(Node { pkg: name.clone(), pkg_dir: dir.clone(), deps });
        }
        Ok(Self { nodes, by_name })
    }

    pub fn node_index(&self, pkg: &str) -> Option<usize> {
        self.by_name.get(pkg).copied()
    }

    /// Tarjan's strongly connected components, returned in reverse
    /// topological order.
    pub fn sccs(&self) -> Vec<Vec<usize>> {
        struct Tarjan<'a> {
            graph: &'a Graph,
            index: usize,
            indices: Vec<Option<usize>>,
            lowlink: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            sccs: Vec<Vec<usize>>,
        }
        impl Tarjan<'_> {
            fn visit(&mut self, v: usize) {
                self.indices[v] = Some(self.index);
                self.lowlink[v] = self.index;
                self.index += 1;
                self.stack.push(v);
                self.on_stack[v] = true;

                for &w in &self.graph.nodes[v].deps {
                    if self.indices[w].is_none() {
                        self.visit(w);
                        self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                    } else if self.on_stack[w] {
                        self.lowlink[v] = self.lowlink[v].min(self.indices[w].unwrap());
                    }
                }

                if self.lowlink[v] == self.indices[v].unwrap() {
                    let mut scc = vec![];
                    loop {
                        let w = self.stack.pop().unwrap();
                        self.on_stack[w] = false;
                        scc.push(w);
                        if w == v {
                            break;
                        }
                    }
                    self.sccs.push(scc);
                }
            }
        }

        let n = self.nodes.len();
        let mut t = Tarjan {
            graph: self,
            index: 0,
            indices: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: vec![],
            sccs: vec![],
        };
        for v in 0..n {
            if t.indices[v].is_none() {
                t.visit(v);
            }
        }
        t.sccs
    }

    /// The build plan: effective edges with cycles broken, and the set
    /// of bootstrap nodes that must be rebuilt in a second round.
    pub fn plan(&self) -> Plan {
        let mut effective: Vec<Vec<usize>> =
            self.nodes.iter().map(|n| n.deps.clone()).collect();
        let mut bootstrap = vec![];
        for scc in self.sccs() {
            if scc.len() > 1 {
                for &v in &scc {
                    effective[v].clear();
                    bootstrap.push(v);
                }
            }
        }
        bootstrap.sort_unstable();
        if !bootstrap.is_empty() {
            info!(
                bootstrap = ?bootstrap.iter().map(|&v| &self.nodes[v].pkg).collect::<Vec<_>>(),
                "breaking dependency cycles"
            );
        }
        Plan { effective, bootstrap }
    }
}

#[derive(Debug)]
pub struct Plan {
    /// Per-node dependency lists with cycle edges dropped.
    pub effective: Vec<Vec<usize>>,
    /// Nodes whose out-edges were dropped; rebuilt in round two.
    pub bootstrap: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

struct Scheduler {
    state: Mutex<SchedulerState>,
    cond: Condvar,
}

struct SchedulerState {
    node_state: Vec<NodeState>,
    deps: Vec<Vec<usize>>,
    failures: Vec<(usize, String)>,
}

impl Scheduler {
    /// Pop the next ready node, or `None` when everything is terminal.
    fn next_ready(&self) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            let mut all_terminal = true;
            for v in 0..state.node_state.len() {
                match state.node_state[v] {
                    NodeState::Pending => {
                        all_terminal = false;
                        if state.deps[v]
                            .iter()
                            .all(|&d| state.node_state[d] == NodeState::Done)
                        {
                            state.node_state[v] = NodeState::Running;
                            return Some(v);
                        }
                        // a failed dependency fails the dependent
                        if state.deps[v]
                            .iter()
                            .any(|&d| state.node_state[d] == NodeState::Failed)
                        {
                            state.node_state[v] = NodeState::Failed;
                            state.failures.push((v, "dependency failed".to_string()));
                            self.cond.notify_all();
                        }
                    }
                    NodeState::Running => all_terminal = false,
                    NodeState::Done | NodeState::Failed => {}
                }
            }
            if all_terminal {
                return None;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    fn mark(&self, v: usize, result: Result<(), String>) {
        let mut state = self.state.lock().unwrap();
        match result {
            Ok(()) => state.node_state[v] = NodeState::Done,
            Err(msg) => {
                state.node_state[v] = NodeState::Failed;
                state.failures.push((v, msg));
            }
        }
        self.cond.notify_all();
    }
}

/// Run one scheduling round over `deps` with `workers` threads.
fn run_round<F>(graph: &Graph, deps: Vec<Vec<usize>>, workers: usize, job: &F) -> BatchResult
where
    F: Fn(&Node) -> Result<(), Error> + Sync,
{
    let scheduler = Scheduler {
        state: Mutex::new(SchedulerState {
            node_state: vec![NodeState::Pending; graph.nodes.len()],
            deps,
            failures: vec![],
        }),
        cond: Condvar::new(),
    };

    let total = graph.nodes.len();
    std::thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            scope.spawn(|| {
                while let Some(v) = scheduler.next_ready() {
                    let node = &graph.nodes[v];
                    debug!(pkg = node.pkg, "building");
                    let result = job(node).map_err(|e| e.to_string());
                    if let Err(msg) = &result {
                        warn!(pkg = node.pkg, error = msg, "build failed");
                    }
                    scheduler.mark(v, result);
                    let state = scheduler.state.lock().unwrap();
                    let done = state
                        .node_state
                        .iter()
                        .filter(|s| matches!(s, NodeState::Done | NodeState::Failed))
                        .count();
                    let failed = state
                        .node_state
                        .iter()
                        .filter(|s| matches!(s, NodeState::Failed))
                        .count();
                    info!("{}/{} built, {} failed", done - failed, total, failed);
                }
            });
        }
    });

    let state = scheduler.state.into_inner().unwrap();
    let mut result = BatchResult::default();
    for (v, s) in state.node_state.iter().enumerate() {
        if *s == NodeState::Done {
            result.succeeded.push(graph.nodes[v].pkg.clone());
        }
    }
    for (v, msg) in state.failures {
        result.failed.push((graph.nodes[v].pkg.clone(), msg));
    }
    result
}

/// Build every node: the cycle-broken round first, then rebuild the
/// bootstrap set against the first round's outputs.
pub fn run<F>(graph: &Graph, workers: usize, job: F) -> BatchResult
where
    F: Fn(&Node) -> Result<(), Error> + Sync,
{
    let plan = graph.plan();
    let mut result = run_round(graph, plan.effective, workers, &job);

    if !plan.bootstrap.is_empty() && result.failed.is_empty() {
        info!(count = plan.bootstrap.len(), "rebuilding bootstrap packages");
        for &v in &plan.bootstrap {
            let node = &graph.nodes[v];
            match job(node) {
                Ok(()) => {}
                Err(e) => {
                    warn!(pkg = node.pkg, error = %e, "bootstrap rebuild failed");
                    result.succeeded.retain(|p| p != &node.pkg);
                    result.failed.push((node.pkg.clone(), e.to_string()));
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn graph(edges: &[(&str, &[&str])]) -> Graph {
        let by_name: HashMap<String, usize> =
            edges.iter().enumerate().map(|(i, (n, _))| (n.to_string(), i)).collect();
        let nodes = edges
            .iter()
            .map(|(name, deps)| Node {
                pkg: name.to_string(),
                pkg_dir: PathBuf::new(),
                deps: deps.iter().map(|d| by_name[*d]).collect(),
            })
            .collect();
        Graph { nodes, by_name }
    }

    #[test]
    fn test_sccs_detect_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &[])]);
        let sccs = g.sccs();
        let big: Vec<_> = sccs.iter().filter(|s| s.len() > 1).collect();
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].len(), 3);
    }

    #[test]
    fn test_plan_breaks_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let plan = g.plan();
        assert_eq!(plan.bootstrap, vec![0, 1, 2]);
        assert!(plan.effective.iter().all(|deps| deps.is_empty()));
    }

    #[test]
    fn test_run_respects_topological_order() {
        let g = graph(&[("lib", &[]), ("app", &["lib"])]);
        let order = Mutex::new(vec![]);
        let result = run(&g, 2, |node| {
            order.lock().unwrap().push(node.pkg.clone());
            Ok(())
        });
        assert_eq!(result.succeeded.len(), 2);
        assert!(result.failed.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["lib".to_string(), "app".to_string()]);
    }

    #[test]
    fn test_failure_propagates() {
        let g = graph(&[("bad", &[]), ("child", &["bad"]), ("other", &[])]);
        let result = run(&g, 2, |node| {
            if node.pkg == "bad" {
                return Err(Error::Recipe("boom".into()));
            }
            Ok(())
        });
        assert_eq!(result.succeeded, vec!["other".to_string()]);
        let failed: Vec<_> = result.failed.iter().map(|(p, _)| p.as_str()).collect();
        assert!(failed.contains(&"bad"));
        assert!(failed.contains(&"child"));
    }

    #[test]
    fn test_cycle_builds_twice() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let builds = AtomicUsize::new(0);
        let result = run(&g, 2, |_| {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(result.succeeded.len(), 2);
        // round one builds both, round two rebuilds both
        assert_eq!(builds.load(Ordering::SeqCst), 4);
    }
}
