//! Implicit operations: states defined by residual equations.
//!
//! A solver collects `(state, residual)` pairs traced in the active graph.
//! [`run`](GaussSeidel::run) moves every operation between the states and
//! the residuals into a child graph and replaces them with one
//! [`ImplicitOperation`] whose outputs are the states and every intermediate
//! of that child graph. Interpreting the operation drives the residuals to
//! zero; differentiating it uses the implicit function theorem.

mod adjoint;
mod bracketed;
mod gauss_seidel;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::backend::Kernel;
use crate::cotangent::Cotangents;
use crate::error::{GraphError, Result};
use crate::node::{GraphId, NodeKey, OpId, Variable, VariableKind};
use crate::operation::{LowerContext, OpNode, Operation};
use crate::recorder::Recorder;
use crate::tensor::{Shape, Tensor, shape_of};

pub use adjoint::ImplicitAdjoint;
pub use bracketed::{BracketOptions, BracketedSearch};
pub use gauss_seidel::{GaussSeidel, StateOptions};

/// A value given as a number, a concrete tensor or a graph variable.
///
/// Tensors and variables must be shaped `(1,)` or like the state they
/// parametrise; all forms are broadcast to the state shape before solving.
#[derive(Debug, Clone)]
pub enum VariableLike {
    Scalar(f64),
    Tensor(Tensor),
    Variable(Variable),
}

impl From<f64> for VariableLike {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<Tensor> for VariableLike {
    fn from(value: Tensor) -> Self {
        Self::Tensor(value)
    }
}

impl From<Variable> for VariableLike {
    fn from(value: Variable) -> Self {
        Self::Variable(value)
    }
}

impl VariableLike {
    fn variable(&self) -> Option<Variable> {
        match self {
            Self::Variable(v) => Some(*v),
            _ => None,
        }
    }

    /// Check that this value can be broadcast to `shape`.
    fn check(&self, rec: &Recorder, shape: &[usize], what: &str) -> Result<()> {
        let actual: &[usize] = match self {
            Self::Scalar(_) => return Ok(()),
            Self::Tensor(t) => t.shape(),
            Self::Variable(v) => rec.shape(*v),
        };
        if actual == [1] || actual == shape {
            Ok(())
        } else {
            Err(GraphError::shape_mismatch(what, shape, actual))
        }
    }
}

/// Options shared by every solver.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Default elementwise bound on `|residual|`.
    pub tolerance: f64,
    pub max_iter: usize,
    /// Log a status line after every solve.
    pub print_status: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iter: 100,
            print_status: false,
        }
    }
}

impl SolverOptions {
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn print_status(mut self, print_status: bool) -> Self {
        self.print_status = print_status;
        self
    }
}

/// Outcome of one solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    pub converged: bool,
    pub iterations: usize,
    /// Largest `|residual|` at the returned states.
    pub max_residual: f64,
    /// Largest remaining bracket width, for bracketing solvers.
    pub bracket_width: Option<f64>,
}

/// Residual values (and explicit updates, where declared) at given states.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub residuals: Vec<Tensor>,
    pub updates: Vec<Option<Tensor>>,
}

impl Evaluation {
    /// Whether every residual element is within its tolerance.
    pub fn within(&self, tolerances: &[Tensor]) -> bool {
        self.residuals
            .iter()
            .zip(tolerances)
            .all(|(r, tol)| r.data().iter().zip(tol.data()).all(|(r, t)| r.abs() <= *t))
    }

    pub fn max_residual(&self) -> f64 {
        self.residuals.iter().map(Tensor::max_abs).fold(0.0, f64::max)
    }
}

/// Input values available to a solve, keyed by formal variable.
#[derive(Debug, Default)]
pub struct Bindings {
    values: HashMap<Variable, Tensor>,
}

impl Bindings {
    fn new(vars: &[Variable], values: &[Tensor]) -> Self {
        Self {
            values: vars.iter().copied().zip(values.iter().cloned()).collect(),
        }
    }

    /// Concrete value of `like`, broadcast to `shape`.
    pub fn resolve(&self, like: &VariableLike, shape: &[usize]) -> Result<Tensor> {
        match like {
            VariableLike::Scalar(x) => Ok(Tensor::full(shape, *x)),
            VariableLike::Tensor(t) => t.broadcast_to(shape),
            VariableLike::Variable(v) => self
                .values
                .get(v)
                .ok_or_else(|| GraphError::MissingValue {
                    variable: v.to_string(),
                })?
                .broadcast_to(shape),
        }
    }
}

/// Everything a strategy needs for one solve.
pub struct SolveContext<'a> {
    pub shapes: &'a [Shape],
    pub options: &'a SolverOptions,
    pub bindings: &'a Bindings,
    eval: &'a mut dyn FnMut(&[Tensor]) -> Result<Evaluation>,
}

impl SolveContext<'_> {
    /// Residuals at `states`.
    pub fn evaluate(&mut self, states: &[Tensor]) -> Result<Evaluation> {
        (self.eval)(states)
    }
}

/// An iteration scheme driving residuals to zero.
pub trait SolverStrategy: Debug {
    /// Variables the strategy reads parameters from.
    fn parameters(&self) -> Vec<Variable>;

    /// Run to convergence or until the iteration budget is spent.
    fn solve(&self, ctx: &mut SolveContext<'_>) -> Result<(Vec<Tensor>, SolveReport)>;
}

/// States, residuals and optional explicit updates declared so far.
#[derive(Debug, Clone, Default)]
pub(crate) struct ImplicitSystem {
    pub states: Vec<Variable>,
    pub residuals: Vec<Variable>,
    pub updates: Vec<Option<Variable>>,
}

impl ImplicitSystem {
    pub fn add(&mut self, rec: &Recorder, state: Variable, residual: Variable, update: Option<Variable>) -> Result<()> {
        let name = |v: Variable| rec.variable(v).info.name.clone();
        if self.states.contains(&state) {
            return Err(GraphError::InvalidArgument(format!("state {} declared twice", name(state))));
        }
        if rec.variable(state).kind != VariableKind::Free {
            return Err(GraphError::InvalidArgument(format!(
                "state {} must be a free variable",
                name(state)
            )));
        }
        if rec.shape(residual) != rec.shape(state) {
            return Err(GraphError::shape_mismatch(
                format!("residual of {}", name(state)),
                rec.shape(state),
                rec.shape(residual),
            ));
        }
        if let Some(u) = update {
            if rec.shape(u) != rec.shape(state) {
                return Err(GraphError::shape_mismatch(
                    format!("update of {}", name(state)),
                    rec.shape(state),
                    rec.shape(u),
                ));
            }
        }
        self.states.push(state);
        self.residuals.push(residual);
        self.updates.push(update);
        Ok(())
    }
}

/// A solved block of residual equations.
#[derive(Debug)]
pub struct ImplicitOperation {
    name: String,
    graph: GraphId,
    states: Vec<Variable>,
    residuals: Vec<Variable>,
    updates: Vec<Option<Variable>>,
    inputs: Vec<Variable>,
    intermediates: Vec<Variable>,
    strategy: Rc<dyn SolverStrategy>,
    options: SolverOptions,
    report: Rc<RefCell<Option<SolveReport>>>,
}

impl ImplicitOperation {
    /// The child graph holding the residual computation.
    #[inline]
    pub fn residual_graph(&self) -> GraphId {
        self.graph
    }

    #[inline]
    pub fn states(&self) -> &[Variable] {
        &self.states
    }

    #[inline]
    pub fn residuals(&self) -> &[Variable] {
        &self.residuals
    }

    /// Formal inputs: boundary inputs of the residual graph, then parameter variables.
    #[inline]
    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    /// Every variable computed inside the residual graph.
    #[inline]
    pub fn intermediates(&self) -> &[Variable] {
        &self.intermediates
    }

    /// Report of the most recent solve.
    pub fn report(&self) -> Option<SolveReport> {
        self.report.borrow().clone()
    }

    fn state_shapes(&self, rec: &Recorder) -> Vec<Shape> {
        self.states.iter().map(|s| shape_of(rec.shape(*s))).collect()
    }

    fn finish(&self, report: SolveReport) {
        if !report.converged {
            warn!(
                "{} did not converge after {} iterations (max |residual| {:e})",
                self.name, report.iterations, report.max_residual
            );
        } else if self.options.print_status {
            info!(
                "{} converged in {} iterations (max |residual| {:e})",
                self.name, report.iterations, report.max_residual
            );
        }
        *self.report.borrow_mut() = Some(report);
    }
}

impl Operation for ImplicitOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> Vec<f64> {
        vec![self.options.tolerance, self.options.max_iter as f64]
    }

    fn interpret(
        &self,
        rec: &mut Recorder,
        _node: &OpNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Option<Tensor>>> {
        for (v, value) in self.inputs.iter().zip(inputs) {
            rec.set_value(*v, value.clone())?;
        }
        let bindings = Bindings::new(&self.inputs, inputs);
        let shapes = self.state_shapes(rec);
        let graph = self.graph;

        let mut eval = |states: &[Tensor]| -> Result<Evaluation> {
            for (v, value) in self.states.iter().zip(states) {
                rec.set_value(*v, value.clone())?;
            }
            rec.run_interpretation(graph)?;
            let residuals = self
                .residuals
                .iter()
                .map(|r| rec.require_value(*r).cloned())
                .collect::<Result<Vec<_>>>()?;
            let updates = self
                .updates
                .iter()
                .map(|u| u.map(|u| rec.require_value(u).cloned()).transpose())
                .collect::<Result<Vec<_>>>()?;
            Ok(Evaluation { residuals, updates })
        };
        let (states, report) = self.strategy.solve(&mut SolveContext {
            shapes: &shapes,
            options: &self.options,
            bindings: &bindings,
            eval: &mut eval,
        })?;
        // Leave the residual graph evaluated at the returned states.
        eval(&states)?;
        self.finish(report);

        let mut out: Vec<Option<Tensor>> = states.into_iter().map(Some).collect();
        for v in &self.intermediates {
            out.push(Some(rec.require_value(*v)?.clone()));
        }
        Ok(out)
    }

    fn vjp(&self, rec: &mut Recorder, node: &OpNode, cotangents: &mut Cotangents) -> Result<()> {
        adjoint::implicit_vjp(self, rec, node, cotangents)
    }

    fn lower(&self, ctx: &LowerContext<'_>) -> Result<Kernel> {
        let rec = ctx.recorder;
        let mut fn_inputs = self.inputs.clone();
        fn_inputs.extend_from_slice(&self.states);
        let declared: Vec<Variable> = self.updates.iter().flatten().copied().collect();
        let mut fn_outputs = self.residuals.clone();
        fn_outputs.extend_from_slice(&declared);
        fn_outputs.extend_from_slice(&self.intermediates);
        let residual_fn = ctx.backend.compile(rec, self.graph, &fn_outputs, &fn_inputs)?;

        let formal = self.inputs.clone();
        let shapes = self.state_shapes(rec);
        let has_update: Vec<bool> = self.updates.iter().map(Option::is_some).collect();
        let num_residuals = self.residuals.len();
        let num_updates = declared.len();
        let strategy = Rc::clone(&self.strategy);
        let options = self.options.clone();
        let report = Rc::clone(&self.report);
        let name = self.name.clone();

        Ok(Rc::new(move |args: &[Tensor]| {
            let bindings = Bindings::new(&formal, args);
            let call = |states: &[Tensor]| -> Result<Vec<Tensor>> {
                let mut call_args = args.to_vec();
                call_args.extend_from_slice(states);
                residual_fn.call(&call_args)
            };
            let mut eval = |states: &[Tensor]| -> Result<Evaluation> {
                let out = call(states)?;
                let mut updates = out[num_residuals..num_residuals + num_updates].iter();
                Ok(Evaluation {
                    residuals: out[..num_residuals].to_vec(),
                    updates: has_update
                        .iter()
                        .map(|has| if *has { updates.next().cloned() } else { None })
                        .collect(),
                })
            };
            let (states, solved) = strategy.solve(&mut SolveContext {
                shapes: &shapes,
                options: &options,
                bindings: &bindings,
                eval: &mut eval,
            })?;
            if !solved.converged {
                warn!("{name} did not converge after {} iterations", solved.iterations);
            }
            *report.borrow_mut() = Some(solved);

            let out = call(&states)?;
            let mut result = states;
            result.extend_from_slice(&out[num_residuals + num_updates..]);
            Ok(result)
        }))
    }

    fn subgraph(&self) -> Option<GraphId> {
        Some(self.graph)
    }
}

/// Handle to an admitted implicit operation.
#[derive(Debug, Clone)]
pub struct ImplicitHandle {
    op: OpId,
    kind: Rc<ImplicitOperation>,
}

impl ImplicitHandle {
    #[inline]
    pub fn op(&self) -> OpId {
        self.op
    }

    pub fn kind(&self) -> &Rc<ImplicitOperation> {
        &self.kind
    }

    /// Report of the most recent solve, `None` before the first.
    pub fn report(&self) -> Option<SolveReport> {
        self.kind.report()
    }
}

/// Extract the residual graph of `system` and admit the implicit operation.
pub(crate) fn build(
    rec: &mut Recorder,
    name: &str,
    system: ImplicitSystem,
    strategy: Rc<dyn SolverStrategy>,
    options: SolverOptions,
) -> Result<ImplicitHandle> {
    if system.states.is_empty() {
        return Err(GraphError::InvalidArgument(format!("{name} has no states")));
    }
    let gid = rec.active_graph();
    let order = rec.graph(gid).operation_order()?;

    let mut downstream: HashSet<Variable> = system.states.iter().copied().collect();
    let mut depends_on_state: HashSet<OpId> = HashSet::new();
    for op in order.iter() {
        let data = rec.operation(*op);
        if data.inputs().iter().any(|v| downstream.contains(v)) {
            downstream.extend(data.outputs().iter().copied());
            depends_on_state.insert(*op);
        }
    }
    let targets = system.residuals.iter().chain(system.updates.iter().flatten());
    if let Some(t) = targets.clone().find(|t| !downstream.contains(*t)) {
        return Err(GraphError::InvalidArgument(format!(
            "{} does not depend on any state of {name}",
            rec.variable(*t).info.name
        )));
    }
    let mut upstream: HashSet<Variable> = targets.copied().collect();
    let mut moved = Vec::new();
    for op in order.iter().rev() {
        let data = rec.operation(*op);
        if data.outputs().iter().any(|v| upstream.contains(v)) {
            upstream.extend(data.inputs().iter().copied());
            if depends_on_state.contains(op) {
                moved.push(*op);
            }
        }
    }
    moved.reverse();

    let graph = rec.new_graph(gid, true);
    for s in &system.states {
        rec.graph_mut(graph).add_node(*s);
    }
    let mut intermediates = Vec::new();
    for op in &moved {
        let (inputs, outputs) = {
            let data = rec.operation(*op);
            (data.inputs().to_vec(), data.outputs().to_vec())
        };
        rec.link_operation(graph, *op, &inputs, &outputs)?;
        intermediates.extend(outputs);
    }
    let owned: Vec<GraphId> = moved
        .iter()
        .filter_map(|op| rec.operation(*op).kind().subgraph())
        .collect();
    rec.graph_mut(gid).children.retain(|c| !owned.contains(c));
    rec.graph_mut(graph).children.extend(owned);
    let keys: Vec<NodeKey> = moved.iter().map(|op| NodeKey::Operation(*op)).collect();
    rec.delete_from_graph(gid, &keys);

    let mut inputs = rec.graph(graph).boundary_inputs().to_vec();
    for p in strategy.parameters() {
        if !inputs.contains(&p) {
            inputs.push(p);
        }
    }
    let mut outputs = system.states.clone();
    outputs.extend_from_slice(&intermediates);
    debug!(
        "{name}: {} states, {} residual operations, {} inputs",
        system.states.len(),
        moved.len(),
        inputs.len()
    );

    let kind = Rc::new(ImplicitOperation {
        name: name.to_string(),
        graph,
        states: system.states,
        residuals: system.residuals,
        updates: system.updates,
        inputs: inputs.clone(),
        intermediates,
        strategy,
        options,
        report: Rc::new(RefCell::new(None)),
    });
    let op = rec.admit_operation(Rc::clone(&kind) as Rc<dyn Operation>, inputs, outputs)?;
    let ready = rec.operation(op).inputs().iter().all(|v| rec.value(*v).is_some());
    if rec.config().inline && rec.loop_depth() == 0 && ready {
        rec.execute_operation(op)?;
    }
    Ok(ImplicitHandle { op, kind })
}
