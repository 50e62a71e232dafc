//! Directed acyclic graph of variables and operations.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};

use crate::error::{GraphError, Result};
use crate::node::{GraphId, NodeKey, OpId, Variable};

/// A set of nodes plus producer/consumer edges.
///
/// Edges run `input variable -> operation -> output variable`. Node indices are
/// stable across deletion; insertion order is tracked separately because loop
/// tracing compares two passes by the order operations were recorded in.
#[derive(Debug)]
pub struct Graph {
    id: GraphId,
    parent: Option<GraphId>,
    pub(crate) children: Vec<GraphId>,
    dag: StableDiGraph<NodeKey, ()>,
    index: HashMap<NodeKey, NodeIndex>,
    order: Vec<NodeKey>,
    boundary_inputs: Vec<Variable>,
    auto_admit: bool,
    topo_cache: RefCell<Option<Rc<[OpId]>>>,
}

impl Graph {
    pub(crate) fn new(id: GraphId, parent: Option<GraphId>, auto_admit: bool) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            dag: StableDiGraph::new(),
            index: HashMap::new(),
            order: Vec::new(),
            boundary_inputs: Vec::new(),
            auto_admit,
            topo_cache: RefCell::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> GraphId {
        self.id
    }

    #[inline]
    pub fn parent(&self) -> Option<GraphId> {
        self.parent
    }

    #[inline]
    pub fn children(&self) -> &[GraphId] {
        &self.children
    }

    /// Whether unregistered inputs are admitted as boundary inputs.
    #[inline]
    pub fn auto_admit(&self) -> bool {
        self.auto_admit
    }

    #[inline]
    pub fn contains(&self, key: impl Into<NodeKey>) -> bool {
        self.index.contains_key(&key.into())
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Register a node. Registering an existing node is a no-op.
    pub fn add_node(&mut self, key: impl Into<NodeKey>) {
        let key = key.into();
        if self.index.contains_key(&key) {
            return;
        }
        let idx = self.dag.add_node(key);
        self.index.insert(key, idx);
        self.order.push(key);
        self.invalidate();
    }

    /// Add a dependency edge between two registered nodes.
    pub fn add_edge(&mut self, from: impl Into<NodeKey>, to: impl Into<NodeKey>) -> Result<()> {
        let a = self.node_index(from.into())?;
        let b = self.node_index(to.into())?;
        self.dag.update_edge(a, b, ());
        self.invalidate();
        Ok(())
    }

    /// Remove nodes and every incident edge. Unknown nodes are ignored.
    pub fn delete_nodes(&mut self, keys: &[NodeKey]) {
        let mut removed = false;
        for key in keys {
            if let Some(idx) = self.index.remove(key) {
                self.dag.remove_node(idx);
                removed = true;
            }
        }
        if removed {
            self.order.retain(|k| self.index.contains_key(k));
            self.boundary_inputs.retain(|v| self.index.contains_key(&NodeKey::Variable(*v)));
            self.invalidate();
        }
    }

    /// Record `v` as referenced here but produced outside.
    pub(crate) fn admit_boundary_input(&mut self, v: Variable) {
        self.add_node(v);
        if !self.boundary_inputs.contains(&v) {
            self.boundary_inputs.push(v);
        }
    }

    /// Variables referenced but not produced inside this graph, in admission order.
    pub fn boundary_inputs(&self) -> &[Variable] {
        &self.boundary_inputs
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.order.iter().copied()
    }

    /// Operations in insertion order.
    pub fn operations(&self) -> impl Iterator<Item = OpId> + '_ {
        self.order.iter().filter_map(|k| match k {
            NodeKey::Operation(op) => Some(*op),
            NodeKey::Variable(_) => None,
        })
    }

    /// Variables in insertion order.
    pub fn variables(&self) -> impl Iterator<Item = Variable> + '_ {
        self.order.iter().filter_map(|k| match k {
            NodeKey::Variable(v) => Some(*v),
            NodeKey::Operation(_) => None,
        })
    }

    /// Number of edges entering a node, `0` for unknown nodes.
    pub fn in_degree(&self, key: impl Into<NodeKey>) -> usize {
        self.index.get(&key.into()).map_or(0, |&idx| {
            self.dag.neighbors_directed(idx, Direction::Incoming).count()
        })
    }

    /// The operation producing `v` inside this graph, if any.
    pub fn producer(&self, v: Variable) -> Option<OpId> {
        let idx = *self.index.get(&NodeKey::Variable(v))?;
        self.dag
            .neighbors_directed(idx, Direction::Incoming)
            .find_map(|n| match self.dag[n] {
                NodeKey::Operation(op) => Some(op),
                NodeKey::Variable(_) => None,
            })
    }

    /// Operations consuming `v` inside this graph.
    pub fn consumers(&self, v: Variable) -> Vec<OpId> {
        let Some(&idx) = self.index.get(&NodeKey::Variable(v)) else {
            return Vec::new();
        };
        self.dag
            .neighbors_directed(idx, Direction::Outgoing)
            .filter_map(|n| match self.dag[n] {
                NodeKey::Operation(op) => Some(op),
                NodeKey::Variable(_) => None,
            })
            .collect()
    }

    /// Operations in dependency order.
    ///
    /// The order is cached until the next mutation of this graph.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::InvalidArgument` if the edges form a cycle.
    pub fn operation_order(&self) -> Result<Rc<[OpId]>> {
        if let Some(cached) = self.topo_cache.borrow().as_ref() {
            return Ok(Rc::clone(cached));
        }
        let sorted = toposort(&self.dag, None).map_err(|cycle| {
            GraphError::InvalidArgument(format!(
                "graph contains a cycle through {}",
                self.dag[cycle.node_id()]
            ))
        })?;
        let ops: Rc<[OpId]> = sorted
            .into_iter()
            .filter_map(|idx| match self.dag[idx] {
                NodeKey::Operation(op) => Some(op),
                NodeKey::Variable(_) => None,
            })
            .collect();
        *self.topo_cache.borrow_mut() = Some(Rc::clone(&ops));
        Ok(ops)
    }

    fn node_index(&self, key: NodeKey) -> Result<NodeIndex> {
        self.index.get(&key).copied().ok_or_else(|| GraphError::NotInGraph {
            node: key.to_string(),
        })
    }

    fn invalidate(&mut self) {
        self.topo_cache.get_mut().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> Graph {
        Graph::new(GraphId(0), None, false)
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut g = graph();
        g.add_node(Variable(0));
        g.add_node(Variable(0));
        assert_eq!(g.len(), 1);
        assert_eq!(g.nodes().count(), 1);
    }

    #[test]
    fn test_add_edge_requires_registered_nodes() {
        let mut g = graph();
        g.add_node(Variable(0));
        let err = g.add_edge(Variable(0), OpId(0)).unwrap_err();
        assert!(matches!(err, GraphError::NotInGraph { .. }));
    }

    #[test]
    fn test_producer_and_consumers() {
        let mut g = graph();
        let (x, y, z) = (Variable(0), Variable(1), Variable(2));
        let (f, h) = (OpId(0), OpId(1));
        let keys: [NodeKey; 5] = [x.into(), f.into(), y.into(), h.into(), z.into()];
        for key in keys {
            g.add_node(key);
        }
        g.add_edge(x, f).unwrap();
        g.add_edge(f, y).unwrap();
        g.add_edge(y, h).unwrap();
        g.add_edge(h, z).unwrap();

        assert_eq!(g.producer(y), Some(f));
        assert_eq!(g.producer(x), None);
        assert_eq!(g.consumers(y), vec![h]);
        assert_eq!(g.in_degree(x), 0);
        assert_eq!(g.in_degree(z), 1);
        assert_eq!(&*g.operation_order().unwrap(), &[f, h]);
    }

    #[test]
    fn test_delete_nodes_cleans_edges_and_order() {
        let mut g = graph();
        let (x, y) = (Variable(0), Variable(1));
        let f = OpId(0);
        g.admit_boundary_input(x);
        g.add_node(f);
        g.add_node(y);
        g.add_edge(x, f).unwrap();
        g.add_edge(f, y).unwrap();

        g.delete_nodes(&[f.into(), x.into()]);
        assert!(!g.contains(f));
        assert_eq!(g.in_degree(y), 0);
        assert!(g.boundary_inputs().is_empty());
        assert_eq!(g.nodes().collect::<Vec<_>>(), vec![NodeKey::Variable(y)]);
        assert!(g.operation_order().unwrap().is_empty());
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut g = graph();
        let x = Variable(0);
        let f = OpId(0);
        g.add_node(x);
        g.add_node(f);
        g.add_edge(x, f).unwrap();
        g.add_edge(f, x).unwrap();
        assert!(g.operation_order().is_err());
    }
}
