//! The recorder: arenas for every node plus the active graph and namespace.
//!
//! All graph construction goes through a [`Recorder`]. It can be passed
//! explicitly as `&mut Recorder`, or installed as the thread's current recorder
//! with [`Recorder::start`] and reached through [`with_recorder`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use log::{debug, trace};

use crate::error::{GraphError, Result};
use crate::graph::Graph;
use crate::node::{GraphId, NodeInfo, NodeKey, OpId, Variable, VariableData, VariableKind};
use crate::operation::{Operation, OperationData};
use crate::tensor::{Shape, Tensor, shape_of};

/// Recorder-wide switches.
#[derive(Debug, Clone, Default)]
pub struct RecorderConfig {
    /// Evaluate operations as soon as they are admitted.
    pub inline: bool,
    /// Log every admission at `debug` level.
    pub debug: bool,
    /// Record the namespace depth of each variable.
    pub auto_hierarchy: bool,
}

impl RecorderConfig {
    pub fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn auto_hierarchy(mut self, auto_hierarchy: bool) -> Self {
        self.auto_hierarchy = auto_hierarchy;
        self
    }
}

/// Optional bounds and scaling attached to a design variable or constraint.
#[derive(Debug, Clone, Default)]
pub struct Bounds {
    pub lower: Option<Tensor>,
    pub upper: Option<Tensor>,
    pub scaler: Option<f64>,
}

#[derive(Debug)]
struct Namespace {
    name: String,
    path: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Owner of every variable, operation and graph of one trace.
pub struct Recorder {
    config: RecorderConfig,
    variables: Vec<VariableData>,
    operations: Vec<OperationData>,
    graphs: Vec<Graph>,
    active_graph: GraphId,
    namespaces: Vec<Namespace>,
    active_namespace: usize,
    loop_depth: usize,
    design_variables: Vec<(Variable, Bounds)>,
    constraints: Vec<(Variable, Bounds)>,
    objectives: Vec<(Variable, Option<f64>)>,
}

impl Recorder {
    /// Create a recorder holding an empty root graph.
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            variables: Vec::new(),
            operations: Vec::new(),
            graphs: vec![Graph::new(GraphId(0), None, false)],
            active_graph: GraphId(0),
            namespaces: vec![Namespace {
                name: String::new(),
                path: String::new(),
                parent: None,
                children: Vec::new(),
            }],
            active_namespace: 0,
            loop_depth: 0,
            design_variables: Vec::new(),
            constraints: Vec::new(),
            objectives: Vec::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    #[inline]
    pub fn root(&self) -> GraphId {
        GraphId(0)
    }

    #[inline]
    pub fn active_graph(&self) -> GraphId {
        self.active_graph
    }

    #[inline]
    pub fn graph(&self, id: GraphId) -> &Graph {
        &self.graphs[id.0]
    }

    #[inline]
    pub(crate) fn graph_mut(&mut self, id: GraphId) -> &mut Graph {
        &mut self.graphs[id.0]
    }

    #[inline]
    pub fn variable(&self, v: Variable) -> &VariableData {
        &self.variables[v.0]
    }

    #[inline]
    pub fn operation(&self, op: OpId) -> &OperationData {
        &self.operations[op.0]
    }

    #[inline]
    pub fn shape(&self, v: Variable) -> &[usize] {
        &self.variables[v.0].shape
    }

    #[inline]
    pub fn value(&self, v: Variable) -> Option<&Tensor> {
        self.variables[v.0].value.as_ref()
    }

    /// Number of loop bodies currently being traced.
    #[inline]
    pub fn loop_depth(&self) -> usize {
        self.loop_depth
    }

    /// Value of `v`, or `MissingValue` if it is symbolic.
    pub fn require_value(&self, v: Variable) -> Result<&Tensor> {
        self.value(v).ok_or_else(|| GraphError::MissingValue {
            variable: self.variables[v.0].info.name.clone(),
        })
    }

    /// Assign a value, checking it against the variable's fixed shape.
    pub fn set_value(&mut self, v: Variable, value: Tensor) -> Result<()> {
        let data = &mut self.variables[v.0];
        if data.shape.as_slice() != value.shape() {
            return Err(GraphError::shape_mismatch(
                format!("value of {}", data.info.name),
                &data.shape,
                value.shape(),
            ));
        }
        data.value = Some(value);
        Ok(())
    }

    pub(crate) fn clear_value(&mut self, v: Variable) {
        self.variables[v.0].value = None;
    }

    pub fn set_name(&mut self, v: Variable, name: impl Into<String>) {
        self.variables[v.0].info.name = name.into();
    }

    pub fn add_tag(&mut self, v: Variable, tag: impl Into<String>) {
        self.variables[v.0].info.tags.push(tag.into());
    }

    /// Create a free variable in the active graph.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::ShapeMismatch` if `value` does not match `shape`.
    pub fn create_variable(
        &mut self,
        shape: &[usize],
        value: Option<Tensor>,
        is_input: bool,
    ) -> Result<Variable> {
        if let Some(t) = &value {
            if t.shape() != shape {
                return Err(GraphError::shape_mismatch("create_variable", shape, t.shape()));
            }
        }
        Ok(self.new_variable(shape_of(shape), value, VariableKind::Free, is_input))
    }

    /// Create an input variable holding `value`.
    pub fn input(&mut self, value: Tensor) -> Variable {
        let shape = shape_of(value.shape());
        self.new_variable(shape, Some(value), VariableKind::Free, true)
    }

    /// Create a constant.
    pub fn constant(&mut self, value: Tensor) -> Variable {
        let shape = shape_of(value.shape());
        self.new_variable(shape, Some(value), VariableKind::Constant, false)
    }

    /// Create a loop iteration variable holding its first value.
    pub fn declare_iteration(&mut self, first: usize) -> Variable {
        self.new_variable(
            shape_of(&[1]),
            Some(Tensor::scalar(first as f64)),
            VariableKind::Iteration,
            false,
        )
    }

    /// Allocate a variable and register it in the active graph.
    pub(crate) fn new_variable(
        &mut self,
        shape: Shape,
        value: Option<Tensor>,
        kind: VariableKind,
        is_input: bool,
    ) -> Variable {
        let v = Variable(self.variables.len());
        let ns = &self.namespaces[self.active_namespace];
        let name = if ns.path.is_empty() {
            v.to_string()
        } else {
            format!("{}.{v}", ns.path)
        };
        let hierarchy = self
            .config
            .auto_hierarchy
            .then(|| self.namespace_depth(self.active_namespace));
        self.variables.push(VariableData {
            info: NodeInfo {
                name,
                tags: Vec::new(),
                namespace: ns.path.clone(),
            },
            shape,
            value,
            is_input,
            kind,
            hierarchy,
        });
        self.graphs[self.active_graph.0].add_node(v);
        v
    }

    /// Record an operation with freshly allocated outputs of the given shapes.
    ///
    /// In inline mode the operation is evaluated right away when every input
    /// has a value.
    pub fn add_operation(
        &mut self,
        kind: Rc<dyn Operation>,
        inputs: &[Variable],
        output_shapes: &[Shape],
    ) -> Result<OpId> {
        self.check_inputs(inputs)?;
        let outputs = output_shapes
            .iter()
            .map(|s| self.new_variable(s.clone(), None, VariableKind::Computed, false))
            .collect();
        let op = self.admit_operation(kind, inputs.to_vec(), outputs)?;
        if self.config.inline && inputs.iter().all(|v| self.value(*v).is_some()) {
            self.execute_operation(op)?;
        }
        Ok(op)
    }

    /// Record a single-output operation and return its output.
    pub fn apply(&mut self, kind: Rc<dyn Operation>, inputs: &[Variable], shape: &[usize]) -> Result<Variable> {
        let op = self.add_operation(kind, inputs, &[shape_of(shape)])?;
        Ok(self.operations[op.0].outputs[0])
    }

    fn check_inputs(&self, inputs: &[Variable]) -> Result<()> {
        let graph = &self.graphs[self.active_graph.0];
        if graph.auto_admit() {
            return Ok(());
        }
        match inputs.iter().find(|v| !graph.contains(**v)) {
            Some(v) => Err(GraphError::NotInGraph {
                node: self.variables[v.0].info.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Register an operation with pre-existing outputs in the active graph.
    pub(crate) fn admit_operation(
        &mut self,
        kind: Rc<dyn Operation>,
        inputs: Vec<Variable>,
        outputs: Vec<Variable>,
    ) -> Result<OpId> {
        self.check_inputs(&inputs)?;
        let gid = self.active_graph;
        {
            let graph = &self.graphs[gid.0];
            for out in &outputs {
                if graph.producer(*out).is_some() || inputs.contains(out) {
                    return Err(GraphError::AlreadyProduced {
                        variable: self.variables[out.0].info.name.clone(),
                    });
                }
            }
        }
        let op = OpId(self.operations.len());
        if self.config.debug {
            debug!(
                "admit {}_{} into graph {}: {} inputs, {} outputs",
                kind.name(),
                op.0,
                gid.0,
                inputs.len(),
                outputs.len()
            );
        }
        let ns = &self.namespaces[self.active_namespace];
        self.operations.push(OperationData {
            info: NodeInfo {
                name: format!("{}_{}", kind.name(), op.0),
                tags: Vec::new(),
                namespace: ns.path.clone(),
            },
            kind,
            inputs: inputs.clone(),
            outputs: outputs.clone(),
        });
        self.link_operation(gid, op, &inputs, &outputs)?;
        Ok(op)
    }

    /// Add an existing operation and its wiring to `gid`.
    pub(crate) fn link_operation(
        &mut self,
        gid: GraphId,
        op: OpId,
        inputs: &[Variable],
        outputs: &[Variable],
    ) -> Result<()> {
        let graph = &mut self.graphs[gid.0];
        for input in inputs {
            if !graph.contains(*input) {
                graph.admit_boundary_input(*input);
            }
        }
        graph.add_node(op);
        for input in inputs {
            graph.add_edge(*input, op)?;
        }
        for output in outputs {
            graph.add_node(*output);
            graph.add_edge(op, *output)?;
        }
        Ok(())
    }

    /// Evaluate one operation from the current values of its inputs.
    pub fn execute_operation(&mut self, op: OpId) -> Result<()> {
        let (kind, node) = {
            let data = &self.operations[op.0];
            (Rc::clone(&data.kind), data.node(op))
        };
        let inputs = node
            .inputs
            .iter()
            .map(|v| self.require_value(*v).cloned())
            .collect::<Result<Vec<_>>>()?;
        trace!("interpret {}", self.operations[op.0].info.name);
        let outputs = kind.interpret(self, &node, &inputs)?;
        if outputs.len() != node.outputs.len() {
            return Err(GraphError::InvalidArgument(format!(
                "operation {} returned {} values for {} outputs",
                kind.name(),
                outputs.len(),
                node.outputs.len()
            )));
        }
        for (v, value) in node.outputs.iter().zip(outputs) {
            match value {
                Some(t) => self.set_value(*v, t)?,
                None => self.clear_value(*v),
            }
        }
        Ok(())
    }

    /// Execute every operation of `graph` in dependency order.
    pub fn run_interpretation(&mut self, graph: GraphId) -> Result<()> {
        let order = self.graphs[graph.0].operation_order()?;
        for op in order.iter() {
            self.execute_operation(*op)?;
        }
        Ok(())
    }

    /// Variables of `graph` with no producer inside it.
    pub fn graph_inputs(&self, graph: GraphId) -> Vec<Variable> {
        let g = &self.graphs[graph.0];
        g.variables().filter(|v| g.producer(*v).is_none()).collect()
    }

    /// Push a child graph and make it active.
    pub fn enter_subgraph(&mut self, auto_admit: bool) -> GraphId {
        let id = self.new_graph(self.active_graph, auto_admit);
        self.active_graph = id;
        id
    }

    /// Allocate an empty child graph of `parent` without making it active.
    pub(crate) fn new_graph(&mut self, parent: GraphId, auto_admit: bool) -> GraphId {
        let id = GraphId(self.graphs.len());
        self.graphs.push(Graph::new(id, Some(parent), auto_admit));
        self.graphs[parent.0].children.push(id);
        id
    }

    /// Detach `graph` from its parent. Its nodes stay in the arenas but are
    /// no longer reachable from any graph walk.
    pub(crate) fn discard_graph(&mut self, graph: GraphId) {
        if let Some(parent) = self.graphs[graph.0].parent() {
            self.graphs[parent.0].children.retain(|c| *c != graph);
        }
    }

    /// Pop back to the parent of the active graph and return the exited graph.
    pub fn exit_subgraph(&mut self) -> Result<GraphId> {
        let current = self.active_graph;
        let parent = self.graphs[current.0].parent().ok_or(GraphError::SubgraphUnderflow)?;
        self.active_graph = parent;
        Ok(current)
    }

    /// Enter a loop body graph.
    pub fn enter_loop_body(&mut self) -> GraphId {
        self.loop_depth += 1;
        self.enter_subgraph(true)
    }

    pub fn exit_loop_body(&mut self) -> Result<GraphId> {
        let body = self.exit_subgraph()?;
        self.loop_depth = self.loop_depth.saturating_sub(1);
        Ok(body)
    }

    /// Enter a new child namespace of the active one.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::DuplicateNamespace` if the name is already taken.
    pub fn enter_scope(&mut self, name: &str) -> Result<()> {
        let parent = self.active_namespace;
        if self.namespaces[parent]
            .children
            .iter()
            .any(|&c| self.namespaces[c].name == name)
        {
            return Err(GraphError::DuplicateNamespace { name: name.into() });
        }
        let path = if self.namespaces[parent].path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.namespaces[parent].path)
        };
        let id = self.namespaces.len();
        self.namespaces.push(Namespace {
            name: name.into(),
            path,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.namespaces[parent].children.push(id);
        self.active_namespace = id;
        Ok(())
    }

    pub fn exit_scope(&mut self) -> Result<()> {
        self.active_namespace = self.namespaces[self.active_namespace]
            .parent
            .ok_or(GraphError::NamespaceUnderflow)?;
        Ok(())
    }

    /// Dotted path of the active namespace; empty at the root.
    pub fn namespace_path(&self) -> &str {
        &self.namespaces[self.active_namespace].path
    }

    fn namespace_depth(&self, mut ns: usize) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.namespaces[ns].parent {
            depth += 1;
            ns = parent;
        }
        depth
    }

    /// Mark `v` as a design variable.
    pub fn add_design_variable(&mut self, v: Variable, bounds: Bounds) -> Result<()> {
        if self.variables[v.0].kind != VariableKind::Free {
            return Err(GraphError::InvalidArgument(format!(
                "design variable {} must be a free variable",
                self.variables[v.0].info.name
            )));
        }
        self.variables[v.0].is_input = true;
        self.design_variables.push((v, bounds));
        Ok(())
    }

    pub fn add_constraint(&mut self, v: Variable, bounds: Bounds) {
        self.constraints.push((v, bounds));
    }

    pub fn add_objective(&mut self, v: Variable, scaler: Option<f64>) -> Result<()> {
        if self.shape(v) != [1] {
            return Err(GraphError::shape_mismatch("objective", &[1], self.shape(v)));
        }
        self.objectives.push((v, scaler));
        Ok(())
    }

    pub fn design_variables(&self) -> &[(Variable, Bounds)] {
        &self.design_variables
    }

    pub fn constraints(&self) -> &[(Variable, Bounds)] {
        &self.constraints
    }

    pub fn objectives(&self) -> &[(Variable, Option<f64>)] {
        &self.objectives
    }

    /// Copy the values of every variable in `graph` and its nested graphs.
    pub(crate) fn snapshot_values(&self, graph: GraphId) -> Vec<(Variable, Option<Tensor>)> {
        let mut out = Vec::new();
        let mut stack = vec![graph];
        while let Some(gid) = stack.pop() {
            let g = &self.graphs[gid.0];
            out.extend(g.variables().map(|v| (v, self.variables[v.0].value.clone())));
            stack.extend_from_slice(g.children());
        }
        out
    }

    pub(crate) fn restore_values(&mut self, snapshot: Vec<(Variable, Option<Tensor>)>) {
        for (v, value) in snapshot {
            self.variables[v.0].value = value;
        }
    }

    /// Copy every operation of `source` into the active graph in dependency
    /// order, rewiring inputs through `map` and recording each copied output
    /// in it.
    ///
    /// Unmapped inputs without a producer in `source` are copied as constants.
    pub(crate) fn replay_graph(&mut self, source: GraphId, map: &mut HashMap<Variable, Variable>) -> Result<()> {
        let order = self.graphs[source.0].operation_order()?;
        for op in order.iter() {
            let (kind, inputs, outputs) = {
                let data = &self.operations[op.0];
                (Rc::clone(&data.kind), data.inputs.clone(), data.outputs.clone())
            };
            let mut new_inputs = Vec::with_capacity(inputs.len());
            for v in inputs {
                let mapped = match map.get(&v) {
                    Some(m) => *m,
                    None if self.graphs[source.0].producer(v).is_none() => {
                        let value = self.require_value(v)?.clone();
                        let c = self.constant(value);
                        map.insert(v, c);
                        c
                    }
                    None => v,
                };
                new_inputs.push(mapped);
            }
            let new_outputs: Vec<Variable> = outputs
                .iter()
                .map(|v| {
                    let fresh = self.new_variable(self.variables[v.0].shape.clone(), None, VariableKind::Computed, false);
                    map.insert(*v, fresh);
                    fresh
                })
                .collect();
            self.admit_operation(kind, new_inputs, new_outputs)?;
        }
        Ok(())
    }

    pub(crate) fn delete_from_graph(&mut self, gid: GraphId, keys: &[NodeKey]) {
        self.graphs[gid.0].delete_nodes(keys);
    }

    /// Install this recorder as the thread's current recorder.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::RecorderAlreadyActive` if one is already installed.
    pub fn start(self) -> Result<()> {
        CURRENT.with(|slot| {
            let mut slot = slot.try_borrow_mut().map_err(|_| GraphError::RecorderBusy)?;
            if slot.is_some() {
                return Err(GraphError::RecorderAlreadyActive);
            }
            *slot = Some(self);
            Ok(())
        })
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(RecorderConfig::default())
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("num_variables", &self.variables.len())
            .field("num_operations", &self.operations.len())
            .field("num_graphs", &self.graphs.len())
            .field("active_graph", &self.active_graph)
            .finish()
    }
}

// Thread-local current recorder
thread_local! {
    static CURRENT: RefCell<Option<Recorder>> = const { RefCell::new(None) };
}

/// Create a recorder and install it as the current one.
pub fn start_trace(config: RecorderConfig) -> Result<()> {
    Recorder::new(config).start()
}

/// Uninstall and return the current recorder.
pub fn stop_trace() -> Result<Recorder> {
    CURRENT.with(|slot| {
        let mut slot = slot.try_borrow_mut().map_err(|_| GraphError::RecorderBusy)?;
        slot.take().ok_or(GraphError::NoActiveRecorder)
    })
}

/// Whether a recorder is installed on this thread.
pub fn is_tracing() -> bool {
    CURRENT.with(|slot| slot.try_borrow().map(|s| s.is_some()).unwrap_or(true))
}

/// Run `f` with the current recorder.
///
/// Calls do not nest: a `with_recorder` inside `f` fails with
/// `GraphError::RecorderBusy`. Pass the `&mut Recorder` down instead.
///
/// # Example
///
/// ```
/// use symtrace::{RecorderConfig, Tensor, start_trace, stop_trace, with_recorder};
///
/// start_trace(RecorderConfig::default()).unwrap();
/// let x = with_recorder(|rec| Ok(rec.input(Tensor::scalar(2.0)))).unwrap();
/// let rec = stop_trace().unwrap();
/// assert_eq!(rec.value(x).unwrap().item(), 2.0);
/// ```
pub fn with_recorder<R>(f: impl FnOnce(&mut Recorder) -> Result<R>) -> Result<R> {
    CURRENT.with(|slot| {
        let mut slot = slot.try_borrow_mut().map_err(|_| GraphError::RecorderBusy)?;
        let rec = slot.as_mut().ok_or(GraphError::NoActiveRecorder)?;
        f(rec)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;

    #[test]
    fn test_create_variable_checks_shape() {
        let mut rec = Recorder::default();
        let err = rec
            .create_variable(&[2], Some(Tensor::zeros(&[3])), false)
            .unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));

        let v = rec.create_variable(&[2], None, true).unwrap();
        assert!(rec.value(v).is_none());
        assert!(rec.variable(v).is_input);
        assert!(rec.graph(rec.root()).contains(v));
    }

    #[test]
    fn test_set_value_keeps_shape() {
        let mut rec = Recorder::default();
        let v = rec.input(Tensor::zeros(&[2]));
        assert!(rec.set_value(v, Tensor::zeros(&[3])).is_err());
        rec.set_value(v, Tensor::ones(&[2])).unwrap();
        assert_eq!(rec.value(v).unwrap().data(), &[1.0, 1.0]);
    }

    #[test]
    fn test_input_from_other_graph_is_rejected() {
        let mut rec = Recorder::default();
        rec.enter_subgraph(false);
        let inner = rec.input(Tensor::scalar(1.0));
        rec.exit_subgraph().unwrap();
        let err = ops::sin(&mut rec, inner).unwrap_err();
        assert!(matches!(err, GraphError::NotInGraph { .. }));
    }

    #[test]
    fn test_auto_admit_records_boundary_inputs() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::scalar(1.0));
        let body = rec.enter_loop_body();
        let y = ops::sin(&mut rec, x).unwrap();
        rec.exit_loop_body().unwrap();
        assert_eq!(rec.graph(body).boundary_inputs(), &[x]);
        assert!(rec.graph(body).contains(y));
        assert!(!rec.graph(rec.root()).contains(y));
        assert_eq!(rec.loop_depth(), 0);
    }

    #[test]
    fn test_new_graph_keeps_active_graph() {
        let mut rec = Recorder::default();
        let root = rec.root();
        let child = rec.new_graph(root, true);
        assert_eq!(rec.active_graph(), root);
        assert_eq!(rec.graph(child).parent(), Some(root));
        assert_eq!(rec.graph(root).children(), &[child]);

        rec.discard_graph(child);
        assert!(rec.graph(root).children().is_empty());
        assert_eq!(rec.active_graph(), root);
    }

    #[test]
    fn test_exit_root_graph_fails() {
        let mut rec = Recorder::default();
        assert!(matches!(rec.exit_subgraph(), Err(GraphError::SubgraphUnderflow)));
    }

    #[test]
    fn test_namespaces() {
        let mut rec = Recorder::new(RecorderConfig::default().auto_hierarchy(true));
        rec.enter_scope("wing").unwrap();
        rec.enter_scope("spar").unwrap();
        let v = rec.input(Tensor::scalar(1.0));
        assert_eq!(rec.namespace_path(), "wing.spar");
        assert!(rec.variable(v).info.name.starts_with("wing.spar."));
        assert_eq!(rec.variable(v).hierarchy, Some(2));
        rec.exit_scope().unwrap();
        assert!(matches!(
            rec.enter_scope("spar"),
            Err(GraphError::DuplicateNamespace { .. })
        ));
        rec.exit_scope().unwrap();
        assert!(matches!(rec.exit_scope(), Err(GraphError::NamespaceUnderflow)));
    }

    #[test]
    fn test_inline_evaluates_on_admission() {
        let mut rec = Recorder::new(RecorderConfig::default().inline(true));
        let x = rec.input(Tensor::scalar(2.0));
        let y = ops::mul(&mut rec, x, x).unwrap();
        assert_eq!(rec.value(y).unwrap().item(), 4.0);

        let mut lazy = Recorder::default();
        let x = lazy.input(Tensor::scalar(2.0));
        let y = ops::mul(&mut lazy, x, x).unwrap();
        assert!(lazy.value(y).is_none());
        lazy.run_interpretation(lazy.root()).unwrap();
        assert_eq!(lazy.value(y).unwrap().item(), 4.0);
    }

    #[test]
    fn test_graph_inputs_lists_unproduced_variables() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::scalar(2.0));
        let c = rec.constant(Tensor::scalar(3.0));
        let y = ops::mul(&mut rec, x, c).unwrap();
        let inputs = rec.graph_inputs(rec.root());
        assert_eq!(inputs, vec![x, c]);
        assert!(!inputs.contains(&y));
    }

    #[test]
    fn test_design_variables() {
        let mut rec = Recorder::default();
        let x = rec.create_variable(&[1], Some(Tensor::scalar(0.0)), false).unwrap();
        rec.add_design_variable(
            x,
            Bounds {
                lower: Some(Tensor::scalar(-1.0)),
                upper: Some(Tensor::scalar(1.0)),
                scaler: None,
            },
        )
        .unwrap();
        assert!(rec.variable(x).is_input);
        assert_eq!(rec.design_variables().len(), 1);

        let c = rec.constant(Tensor::scalar(1.0));
        assert!(rec.add_design_variable(c, Bounds::default()).is_err());
        rec.add_objective(x, Some(2.0)).unwrap();
        assert_eq!(rec.objectives().len(), 1);

        let g = ops::mul(&mut rec, x, x).unwrap();
        rec.add_constraint(
            g,
            Bounds {
                upper: Some(Tensor::scalar(0.5)),
                ..Bounds::default()
            },
        );
        assert_eq!(rec.constraints().len(), 1);
        assert_eq!(rec.constraints()[0].0, g);
        assert!(rec.constraints()[0].1.lower.is_none());
        let wide = rec.input(Tensor::zeros(&[2]));
        assert!(rec.add_objective(wide, None).is_err());
    }

    #[test]
    fn test_rename_and_tag() {
        let mut rec = Recorder::default();
        let v = rec.input(Tensor::scalar(1.0));
        rec.set_name(v, "thickness");
        rec.add_tag(v, "geometry");
        rec.add_tag(v, "design");
        let info = &rec.variable(v).info;
        assert_eq!(info.name, "thickness");
        assert_eq!(info.tags, vec!["geometry".to_string(), "design".to_string()]);
    }

    #[test]
    fn test_thread_local_recorder_is_exclusive() {
        start_trace(RecorderConfig::default()).unwrap();
        assert!(is_tracing());
        assert!(matches!(
            start_trace(RecorderConfig::default()),
            Err(GraphError::RecorderAlreadyActive)
        ));

        let nested = with_recorder(|_| with_recorder(|_| Ok(())));
        assert!(matches!(nested, Err(GraphError::RecorderBusy)));

        let x = with_recorder(|rec| Ok(rec.input(Tensor::scalar(1.0)))).unwrap();
        let rec = stop_trace().unwrap();
        assert!(rec.value(x).is_some());
        assert!(!is_tracing());
        assert!(matches!(stop_trace(), Err(GraphError::NoActiveRecorder)));
        assert!(matches!(
            with_recorder(|_| Ok(())),
            Err(GraphError::NoActiveRecorder)
        ));
    }
}
