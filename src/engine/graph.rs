use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::EngineError;
use crate::task::{Task, TaskId, TaskRef};

/// Snapshot of the registered tasks of one scope and their dependency edges.
///
/// Edges point from a dependency to its dependent. Tasks of other scopes show
/// up as external nodes without dependencies of their own.
pub struct TaskGraph {
    graph: DiGraph<Node, ()>,
}

enum Node {
    Local(Arc<Task>),
    External(TaskRef),
    Missing(TaskRef),
}

impl Node {
    fn id(&self) -> TaskId {
        match self {
            Node::Local(task) => task.id().clone(),
            Node::External(task) | Node::Missing(task) => task.id().clone(),
        }
    }

    fn label(&self) -> String {
        match self {
            Node::Local(task) => task.id().to_string(),
            Node::External(task) => task.to_string(),
            Node::Missing(task) => format!("{} (missing)", task.id()),
        }
    }
}

impl TaskGraph {
    pub(crate) fn build(scope: &str, tasks: Vec<Arc<Task>>) -> Self {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::<TaskRef, NodeIndex>::new();

        let mut tasks = tasks;
        tasks.sort_by(|a, b| a.id().cmp(b.id()));

        for task in &tasks {
            let index = graph.add_node(Node::Local(task.clone()));
            indices.insert(task.task_ref(), index);
        }

        for task in &tasks {
            let target = indices[&task.task_ref()];

            for dependency in task.dependencies() {
                let source = *indices.entry(dependency.clone()).or_insert_with(|| {
                    if dependency.scope() == scope {
                        graph.add_node(Node::Missing(dependency.clone()))
                    } else {
                        graph.add_node(Node::External(dependency.clone()))
                    }
                });

                graph.add_edge(source, target, ());
            }
        }

        Self { graph }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Fails on the first cycle or dangling local dependency.
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(missing) = self.graph.node_weights().find_map(|node| match node {
            Node::Missing(task) => Some(task.id().clone()),
            _ => None,
        }) {
            return Err(EngineError::UnknownTask(missing));
        }

        toposort(&self.graph, None)
            .map(|_| ())
            .map_err(|cycle| EngineError::Cycle(self.graph[cycle.node_id()].id()))
    }

    /// Local task ids in an order where dependencies come first.
    pub fn execution_order(&self) -> Result<Vec<String>, EngineError> {
        self.validate()?;

        let order = toposort(&self.graph, None)
            .map_err(|cycle| EngineError::Cycle(self.graph[cycle.node_id()].id()))?;

        Ok(order
            .into_iter()
            .filter_map(|index| match &self.graph[index] {
                Node::Local(task) => Some(task.id().to_string()),
                _ => None,
            })
            .collect())
    }
}

/// Renders the graph as a Mermaid flowchart.
impl fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let label = node.label().replace('"', "\\\"");

            match node {
                Node::Local(_) => writeln!(f, "    {}[\"{}\"]", index.index(), label)?,
                Node::External(_) => writeln!(f, "    {}[[\"{}\"]]", index.index(), label)?,
                Node::Missing(_) => writeln!(f, "    {}{{\"{}\"}}", index.index(), label)?,
            }
        }

        for edge in self.graph.edge_indices() {
            if let Some((source, target)) = self.graph.edge_endpoints(edge) {
                writeln!(f, "    {} --> {}", source.index(), target.index())?;
            }
        }

        Ok(())
    }
}
