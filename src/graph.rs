use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::Artifact;
use crate::error::ConfigError;
use crate::fingerprint::Inputs;
use crate::task::{Action, TaskContext, TaskNode};

/// The task graph of a build.
///
/// Tasks are stored as nodes of a [`petgraph::Graph`], edges point from a
/// dependency to its dependent. Node indices follow insertion order, which is
/// what every deterministic ordering in this crate breaks ties with.
///
/// # Example
///
/// ```rust
/// use tsumiki::{Artifact, TaskGraph};
///
/// let mut graph = TaskGraph::new();
///
/// graph
///     .task("compileJava")
///     .run(|_| Ok(Artifact::from_text("classes")))?;
///
/// graph
///     .task("shadowJar")
///     .depends_on(["compileJava"])
///     .run(|ctx| {
///         let classes = ctx.dependency("compileJava").unwrap();
///         Ok(Artifact::from_bytes(classes.bytes()))
///     })?;
///
/// assert_eq!(graph.topological_order()?, ["compileJava", "shadowJar"]);
/// # Ok::<(), tsumiki::ConfigError>(())
/// ```
#[derive(Default)]
pub struct TaskGraph {
    pub(crate) graph: Graph<TaskNode, ()>,
    names: HashMap<Arc<str>, NodeIndex>,
    /// Allow dependencies on tasks which are registered later.
    lazy: bool,
    /// Edges waiting for their dependency to be registered.
    unresolved: Vec<(NodeIndex, Arc<str>)>,
}

impl TaskGraph {
    /// Creates a new, empty graph. Every dependency has to be registered before
    /// the tasks that depend on it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new, empty graph which accepts dependencies on tasks that are
    /// not registered yet. Anything still missing is reported by
    /// [`validate`](Self::validate).
    pub fn lazy() -> Self {
        Self {
            lazy: true,
            ..Self::default()
        }
    }

    /// Starts defining a task with the builder API.
    pub fn task(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef {
            graph: self,
            name: name.into(),
            dependencies: Vec::new(),
            inputs: None,
            timeout: None,
        }
    }

    /// Registers a task.
    ///
    /// Duplicate dependencies collapse into a single edge. Fails if the name
    /// is taken, if the task depends on itself, or, unless the graph is lazy,
    /// if a dependency is not registered yet.
    pub fn add_task<I, S, A>(&mut self, name: &str, dependencies: I, action: A) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        A: Action + 'static,
    {
        let dependencies = dependencies
            .into_iter()
            .map(|dep| dep.as_ref().to_string())
            .collect();

        self.insert(name.to_string(), dependencies, Arc::new(action), None, None)
    }

    pub(crate) fn insert(
        &mut self,
        name: String,
        dependencies: Vec<String>,
        action: Arc<dyn Action>,
        inputs: Option<Inputs>,
        timeout: Option<Duration>,
    ) -> Result<(), ConfigError> {
        if self.names.contains_key(name.as_str()) {
            return Err(ConfigError::DuplicateTask(name));
        }

        let mut seen = HashSet::new();
        let mut deps: Vec<Arc<str>> = Vec::with_capacity(dependencies.len());

        for dep in dependencies {
            if dep == name {
                return Err(ConfigError::SelfDependency(name));
            }
            if !self.lazy && !self.names.contains_key(dep.as_str()) {
                return Err(ConfigError::UnknownDependency {
                    task: name,
                    dependency: dep,
                });
            }
            if seen.insert(dep.clone()) {
                deps.push(dep.into());
            }
        }

        let name: Arc<str> = name.into();
        let index = self.graph.add_node(TaskNode {
            name: name.clone(),
            dependencies: deps.clone(),
            action,
            inputs,
            timeout,
        });

        for dep in deps {
            match self.names.get(&dep) {
                Some(&source) => {
                    self.graph.update_edge(source, index, ());
                }
                None => self.unresolved.push((index, dep)),
            }
        }

        // Wire up the tasks that were waiting for this one.
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.unresolved)
            .into_iter()
            .partition(|(_, dep)| *dep == name);
        self.unresolved = waiting;

        for (dependent, _) in ready {
            self.graph.update_edge(index, dependent, ());
        }

        self.names.insert(name, index);

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Task names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_indices().map(|i| self.graph[i].name.as_ref())
    }

    /// Declared dependencies of a task, in declaration order.
    pub fn dependencies_of(&self, name: &str) -> Option<Vec<&str>> {
        let index = *self.names.get(name)?;
        Some(
            self.graph[index]
                .dependencies
                .iter()
                .map(AsRef::as_ref)
                .collect(),
        )
    }

    /// Tasks that directly depend on the given task, in insertion order.
    pub fn dependents_of(&self, name: &str) -> Option<Vec<&str>> {
        let index = *self.names.get(name)?;
        let mut dependents: Vec<_> = self.dependents(index).collect();
        dependents.sort();
        Some(
            dependents
                .into_iter()
                .map(|i| self.graph[i].name.as_ref())
                .collect(),
        )
    }

    /// Resolved dependencies of a node, in declaration order. Names which were
    /// never registered are left out, `validate` reports them.
    pub(crate) fn dependency_indices(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph[index]
            .dependencies
            .iter()
            .filter_map(|dep| self.names.get(dep).copied())
    }

    pub(crate) fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }

    /// Checks that every dependency is registered and that the graph is acyclic.
    ///
    /// Cycle detection is a depth-first traversal started from every task in
    /// insertion order, following dependencies in declaration order. The
    /// reported cycle is the first one found, listed from the task closest to
    /// the traversal root.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some((index, dep)) = self.unresolved.iter().min_by_key(|(index, _)| *index) {
            return Err(ConfigError::UnknownDependency {
                task: self.graph[*index].name.to_string(),
                dependency: dep.to_string(),
            });
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Open,
            Done,
        }

        let mut marks = vec![Mark::New; self.graph.node_count()];

        for root in self.graph.node_indices() {
            if marks[root.index()] != Mark::New {
                continue;
            }

            // (node, dependencies of the node, position of the next dependency)
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();
            marks[root.index()] = Mark::Open;
            stack.push((root, self.dependency_indices(root).collect(), 0));

            while let Some((_, deps, next)) = stack.last_mut() {
                let Some(&dep) = deps.get(*next) else {
                    if let Some((node, _, _)) = stack.pop() {
                        marks[node.index()] = Mark::Done;
                    }
                    continue;
                };
                *next += 1;

                match marks[dep.index()] {
                    Mark::Done => {}
                    Mark::Open => {
                        let start = stack
                            .iter()
                            .position(|(node, _, _)| *node == dep)
                            .unwrap_or_default();

                        let cycle = stack[start..]
                            .iter()
                            .map(|(node, _, _)| self.graph[*node].name.to_string())
                            .collect();

                        return Err(ConfigError::Cycle(cycle));
                    }
                    Mark::New => {
                        marks[dep.index()] = Mark::Open;
                        stack.push((dep, self.dependency_indices(dep).collect(), 0));
                    }
                }
            }
        }

        Ok(())
    }

    /// Returns the task names ordered so that every dependency precedes its
    /// dependents. Among tasks that are ready at the same time, the one
    /// registered first comes first.
    pub fn topological_order(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self
            .order()?
            .into_iter()
            .map(|index| self.graph[index].name.to_string())
            .collect())
    }

    /// Kahn's algorithm with a min-heap over node indices.
    pub(crate) fn order(&self) -> Result<Vec<NodeIndex>, ConfigError> {
        self.validate()?;

        let mut indegree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|i| indegree[i.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            for dependent in self.dependents(index) {
                indegree[dependent.index()] -= 1;
                if indegree[dependent.index()] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        Ok(order)
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.graph.node_indices().map(|i| &self.graph[i]))
            .finish()
    }
}

/// Renders the graph as a Mermaid flowchart.
impl std::fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].name.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

/// Builder for a single task, returned by [`TaskGraph::task`].
pub struct TaskDef<'a> {
    graph: &'a mut TaskGraph,
    name: String,
    dependencies: Vec<String>,
    inputs: Option<Inputs>,
    timeout: Option<Duration>,
}

impl<'a> TaskDef<'a> {
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(|dep| dep.as_ref().to_string()));
        self
    }

    /// Declares the inputs the task's fingerprint is derived from. Tasks
    /// without declared inputs are never cached.
    pub fn inputs(mut self, inputs: Inputs) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Overrides the run-wide timeout for this task.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Registers the task with a closure as its action.
    pub fn run<F>(self, callback: F) -> Result<(), ConfigError>
    where
        F: Fn(&TaskContext) -> anyhow::Result<Artifact> + Send + Sync + 'static,
    {
        self.action(callback)
    }

    /// Registers the task with any [`Action`].
    pub fn action<A>(self, action: A) -> Result<(), ConfigError>
    where
        A: Action + 'static,
    {
        self.graph.insert(
            self.name,
            self.dependencies,
            Arc::new(action),
            self.inputs,
            self.timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> impl Action + 'static {
        crate::action(|_| Ok(Artifact::empty()))
    }

    fn graph(edges: &[(&str, &[&str])]) -> TaskGraph {
        let mut graph = TaskGraph::lazy();
        for (name, deps) in edges {
            graph.add_task(name, deps.iter(), noop()).unwrap();
        }
        graph
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_duplicate_task() {
        let mut graph = TaskGraph::new();
        graph.add_task("jar", [] as [&str; 0], noop()).unwrap();
        let err = graph.add_task("jar", [] as [&str; 0], noop()).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateTask("jar".into()));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_unknown_dependency_when_strict() {
        let mut graph = TaskGraph::new();
        let err = graph.add_task("jar", ["compileJava"], noop()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownDependency {
                task: "jar".into(),
                dependency: "compileJava".into()
            }
        );
        assert!(graph.is_empty());
    }

    #[test]
    fn test_lazy_registration_resolves_later() {
        let mut graph = TaskGraph::lazy();
        graph.add_task("jar", ["compileJava"], noop()).unwrap();
        assert!(graph.validate().is_err());

        graph.add_task("compileJava", [] as [&str; 0], noop()).unwrap();
        graph.validate().unwrap();
        assert_eq!(graph.topological_order().unwrap(), ["compileJava", "jar"]);
    }

    #[test]
    fn test_lazy_unresolved_reported_by_validate() {
        let mut graph = TaskGraph::lazy();
        graph.add_task("jar", ["compileJava"], noop()).unwrap();
        assert_eq!(
            graph.validate().unwrap_err(),
            ConfigError::UnknownDependency {
                task: "jar".into(),
                dependency: "compileJava".into()
            }
        );
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut graph = TaskGraph::lazy();
        let err = graph.add_task("jar", ["jar"], noop()).unwrap_err();
        assert_eq!(err, ConfigError::SelfDependency("jar".into()));
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let graph = graph(&[("a", &[]), ("b", &["a", "a", "a"])]);
        assert_eq!(graph.graph.edge_count(), 1);
        assert_eq!(graph.dependencies_of("b").unwrap(), ["a"]);
    }

    #[test]
    fn test_cycle_names_all_members() {
        // A depends on B, B on C, C on A.
        let graph = graph(&[("A", &["B"]), ("B", &["C"]), ("C", &["A"])]);

        match graph.validate().unwrap_err() {
            ConfigError::Cycle(cycle) => assert_eq!(cycle, ["A", "B", "C"]),
            other => panic!("expected a cycle, got {other:?}"),
        }

        let message = graph.topological_order().unwrap_err().to_string();
        for name in ["A", "B", "C"] {
            assert!(message.contains(name), "{message}");
        }
    }

    #[test]
    fn test_cycle_reported_from_first_inserted_task() {
        let graph = graph(&[
            ("root", &["x"]),
            ("x", &["y"]),
            ("y", &["x"]),
            ("other", &["other2"]),
            ("other2", &["other"]),
        ]);

        assert_eq!(
            graph.validate().unwrap_err(),
            ConfigError::Cycle(vec!["x".into(), "y".into()])
        );
    }

    #[test]
    fn test_topological_order_respects_every_edge() {
        let graph = graph(&[
            ("processResources", &[]),
            ("compileJava", &[]),
            ("classes", &["compileJava", "processResources"]),
            ("javadoc", &["compileJava"]),
            ("jar", &["classes"]),
            ("shadowJar", &["classes"]),
            ("reobfJar", &["shadowJar"]),
            ("assemble", &["jar", "reobfJar", "javadoc"]),
        ]);

        let order = graph.topological_order().unwrap();
        assert_eq!(order.len(), graph.len());

        for name in graph.names() {
            for dep in graph.dependencies_of(name).unwrap() {
                assert!(position(&order, dep) < position(&order, name));
            }
        }
    }

    #[test]
    fn test_topological_order_ties_follow_insertion() {
        let graph = graph(&[("c", &[]), ("a", &[]), ("b", &[]), ("d", &["b"])]);
        assert_eq!(graph.topological_order().unwrap(), ["c", "a", "b", "d"]);
    }

    #[test]
    fn test_dependents_of() {
        let graph = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        assert_eq!(graph.dependents_of("a").unwrap(), ["b", "c"]);
        assert!(graph.dependents_of("missing").is_none());
    }

    #[test]
    fn test_mermaid_output() {
        let graph = graph(&[("a", &[]), ("b", &["a"])]);
        let text = graph.to_string();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains("0[\"a\"]"));
        assert!(text.contains("0 --> 1"));
    }
}
