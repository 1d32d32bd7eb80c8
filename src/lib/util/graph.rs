//! A validated execution plan over a DAG.
//!
//! Nodes carry per-node `deps_left` counters; a node becomes eligible when
//! its counter hits zero, and every completion releases its dependents from
//! inside the worker that finished it. Nodes whose dependencies failed are
//! never released, and stay in the unprocessed set. A non-empty unprocessed
//! set without a task failure means the graph had a cycle; the caller is
//! responsible for the diagnostic dump.

use petgraph::{graph::NodeIndex, Direction, Graph};
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};

use crate::util::{errors::Res, executor::Executor};

pub trait PlanNode: Copy + Eq + Ord + Hash + Send + Sync + 'static {}
impl<T: Copy + Eq + Ord + Hash + Send + Sync + 'static> PlanNode for T {}

#[derive(Debug, Clone)]
pub struct DagPlan<K: PlanNode> {
    graph: Graph<K, ()>,
    indices: HashMap<K, NodeIndex>,
}

struct ExecState {
    deps_left: HashMap<NodeIndex, usize>,
    unprocessed: Vec<NodeIndex>,
}

struct ExecCtx<K: PlanNode, F> {
    graph: Graph<K, ()>,
    state: Mutex<ExecState>,
    run: F,
    executor: Executor,
}

impl<K: PlanNode> DagPlan<K> {
    /// Builds a plan from nodes and their dependencies. Edges pointing at
    /// keys outside the node set are dropped: those dependencies are already
    /// satisfied and don't gate anything.
    pub fn new(nodes: &[(K, Vec<K>)]) -> Self {
        let mut graph = Graph::new();
        let mut indices = HashMap::new();
        for (k, _) in nodes {
            indices.insert(*k, graph.add_node(*k));
        }
        for (k, deps) in nodes {
            for d in deps {
                if let Some(&di) = indices.get(d) {
                    // edge direction: node -> its dependency
                    graph.add_edge(indices[k], di, ());
                }
            }
        }
        DagPlan { graph, indices }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Runs every node through the executor, respecting dependency order.
    /// Returns the unprocessed keys: empty on success, the cyclic residue
    /// otherwise. The first task failure is re-raised instead.
    pub fn execute<F>(&self, executor: &Executor, run: F) -> Res<Vec<K>>
    where
        F: Fn(K) -> Res<()> + Send + Sync + 'static,
    {
        if self.is_empty() {
            return Ok(vec![]);
        }

        let deps_left: HashMap<_, _> = self
            .graph
            .node_indices()
            .map(|i| (i, self.graph.neighbors_directed(i, Direction::Outgoing).count()))
            .collect();

        let mut eligible: Vec<NodeIndex> = deps_left
            .iter()
            .filter(|(_, left)| **left == 0)
            .map(|(i, _)| *i)
            .collect();
        self.sort_eligible(&mut eligible);

        let ctx = Arc::new(ExecCtx {
            graph: self.graph.clone(),
            state: Mutex::new(ExecState {
                deps_left,
                unprocessed: self.graph.node_indices().collect(),
            }),
            run,
            executor: executor.clone(),
        });

        executor.set_throw_on_error(true);
        for i in eligible {
            schedule(&ctx, i);
        }
        executor.wait()?;

        let state = ctx.state.lock().unwrap();
        let mut left: Vec<K> = state.unprocessed.iter().map(|i| self.graph[*i]).collect();
        left.sort();
        Ok(left)
    }

    /// Fewer dependencies first; ties broken by more dependents; then key
    /// order, so the schedule is deterministic.
    fn sort_eligible(&self, nodes: &mut Vec<NodeIndex>) {
        let graph = &self.graph;
        nodes.sort_by_key(|&i| {
            (
                graph.neighbors_directed(i, Direction::Outgoing).count(),
                std::cmp::Reverse(graph.neighbors_directed(i, Direction::Incoming).count()),
                graph[i],
            )
        });
    }
}

fn schedule<K, F>(ctx: &Arc<ExecCtx<K, F>>, node: NodeIndex)
where
    K: PlanNode,
    F: Fn(K) -> Res<()> + Send + Sync + 'static,
{
    let ctx2 = ctx.clone();
    ctx.executor.submit(move || {
        let key = ctx2.graph[node];
        (ctx2.run)(key)?;

        // release dependents; failed nodes never get here, so their
        // dependents stay unprocessed
        let mut released = vec![];
        {
            let mut state = ctx2.state.lock().unwrap();
            state.unprocessed.retain(|i| *i != node);
            for parent in ctx2.graph.neighbors_directed(node, Direction::Incoming) {
                let left = state
                    .deps_left
                    .get_mut(&parent)
                    .expect("dependent not in plan");
                *left -= 1;
                if *left == 0 {
                    released.push(parent);
                }
            }
        }
        released.sort_by_key(|&i| {
            (
                ctx2.graph.neighbors_directed(i, Direction::Outgoing).count(),
                std::cmp::Reverse(ctx2.graph.neighbors_directed(i, Direction::Incoming).count()),
                ctx2.graph[i],
            )
        });
        for i in released {
            schedule(&ctx2, i);
        }
        Ok(())
    });
}
