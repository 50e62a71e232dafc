//! Two-pass loop tracing.
//!
//! The host body runs twice into one child graph. Iteration one is recorded
//! and its operations dropped; iteration two is recorded on top. Wherever an
//! operation of iteration two reads a variable that iteration one produced,
//! that variable is loop-carried state, and the iteration-one input at the
//! same position is its initial value.

use std::collections::HashSet;
use std::rc::Rc;

use log::debug;

use crate::error::{GraphError, Result};
use crate::node::{GraphId, NodeKey, OpId, Variable};
use crate::recorder::Recorder;
use crate::tensor::{Shape, Tensor, shape_of};

use super::loop_op::{Feedback, LoopOp, LoopParts, delete_operations};

/// Per-loop switches.
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Skip filling stacked histories during interpretation until one is read.
    pub inline_lazy_stack: bool,
    /// Record the history of every body output, not only loop-carried state.
    pub stack_all: bool,
}

impl LoopOptions {
    pub fn inline_lazy_stack(mut self, lazy: bool) -> Self {
        self.inline_lazy_stack = lazy;
        self
    }

    pub fn stack_all(mut self, stack_all: bool) -> Self {
        self.stack_all = stack_all;
        self
    }
}

/// Declares the iteration values of a loop and traces its body.
///
/// # Example
///
/// ```
/// use symtrace::{LoopBuilder, Recorder, RecorderConfig, Tensor, ops};
///
/// let mut rec = Recorder::new(RecorderConfig::default().inline(true));
/// let mut b = rec.input(Tensor::scalar(1.0));
/// LoopBuilder::range(0, 4)
///     .unwrap()
///     .trace(&mut rec, |rec, _| {
///         b = ops::scale(rec, b, 2.0)?;
///         Ok(())
///     })
///     .unwrap();
/// assert_eq!(rec.value(b).unwrap().item(), 16.0);
/// ```
#[derive(Debug, Clone)]
pub struct LoopBuilder {
    vals: Vec<Vec<usize>>,
    options: LoopOptions,
}

impl LoopBuilder {
    /// Iterate over `lo..hi`.
    pub fn range(lo: usize, hi: usize) -> Result<Self> {
        Self::range_step(lo, hi, 1)
    }

    /// Iterate over `lo..hi` in steps of `step`.
    pub fn range_step(lo: usize, hi: usize, step: usize) -> Result<Self> {
        if lo > hi {
            return Err(GraphError::InvalidArgument(format!(
                "loop range lower bound {lo} exceeds upper bound {hi}"
            )));
        }
        if step == 0 {
            return Err(GraphError::InvalidArgument("loop step must be positive".into()));
        }
        Ok(Self::values((lo..hi).step_by(step).collect()))
    }

    /// Iterate over explicit values.
    pub fn values(vals: Vec<usize>) -> Self {
        Self {
            vals: vec![vals],
            options: LoopOptions::default(),
        }
    }

    /// Iterate over several value lists in lockstep, one iteration variable each.
    pub fn zip(vals: Vec<Vec<usize>>) -> Result<Self> {
        let Some(first) = vals.first() else {
            return Err(GraphError::InvalidArgument("zip needs at least one value list".into()));
        };
        if let Some(bad) = vals.iter().find(|v| v.len() != first.len()) {
            return Err(GraphError::InvalidArgument(format!(
                "zipped value lists differ in length: {} and {}",
                first.len(),
                bad.len()
            )));
        }
        Ok(Self {
            vals,
            options: LoopOptions::default(),
        })
    }

    pub fn options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    /// Trace `body` and replace it with a single loop operation.
    ///
    /// `body` receives the recorder and one iteration variable per value list.
    /// Any host variable it reassigns to a value computed in the body refers,
    /// after tracing, to that value at the end of the last iteration.
    ///
    /// # Errors
    ///
    /// - `GraphError::EmptyLoop` if there are no iteration values.
    /// - `GraphError::TraceInvariance` or `GraphError::ShapeMismatch` if the
    ///   two passes record different operations.
    pub fn trace<F>(self, rec: &mut Recorder, mut body: F) -> Result<Loop>
    where
        F: FnMut(&mut Recorder, &[Variable]) -> Result<()>,
    {
        let length = self.vals.first().map_or(0, Vec::len);
        if length == 0 {
            return Err(GraphError::EmptyLoop);
        }
        let graph = rec.enter_loop_body();
        let traced = self.trace_passes(rec, graph, &mut body);
        rec.exit_loop_body()?;
        let (iter_vars, triples, outputs) = match traced {
            Ok(parts) => parts,
            Err(e) => {
                rec.discard_graph(graph);
                return Err(e);
            }
        };

        let finalized = LoopOp::finalize(
            rec,
            LoopParts {
                body: graph,
                iter_vars,
                vals: self.vals,
                triples,
                outputs,
                stack_all: self.options.stack_all,
                lazy: self.options.inline_lazy_stack,
                parent: None,
            },
        );
        let (op, kind) = match finalized {
            Ok(loop_op) => loop_op,
            Err(e) => {
                rec.discard_graph(graph);
                return Err(e);
            }
        };
        let ready = rec.operation(op).inputs().iter().all(|v| rec.value(*v).is_some());
        if rec.config().inline && rec.loop_depth() == 0 && ready {
            rec.execute_operation(op)?;
        }
        Ok(Loop { op, kind })
    }

    #[allow(clippy::type_complexity)]
    fn trace_passes<F>(
        &self,
        rec: &mut Recorder,
        graph: GraphId,
        body: &mut F,
    ) -> Result<(Vec<Variable>, Vec<(Variable, Variable, Variable)>, Vec<Variable>)>
    where
        F: FnMut(&mut Recorder, &[Variable]) -> Result<()>,
    {
        let iter_vars: Vec<Variable> = self.vals.iter().map(|v| rec.declare_iteration(v[0])).collect();

        body(rec, &iter_vars)?;
        let first = Pass::record(rec, graph);
        delete_operations(rec, graph, &first.ops);

        let second_index = if self.vals[0].len() > 1 { 1 } else { 0 };
        for (iv, vals) in iter_vars.iter().zip(&self.vals) {
            rec.set_value(*iv, Tensor::scalar(vals[second_index] as f64))?;
        }
        body(rec, &iter_vars)?;
        let second = Pass::record(rec, graph);
        first.check_same_structure(&second)?;

        let mut triples: Vec<(Variable, Variable, Variable)> = Vec::new();
        let mut stale: Vec<Variable> = Vec::new();
        for (&in1, &in2) in first.inputs.iter().zip(&second.inputs) {
            if in1 == in2 {
                continue;
            }
            if let Some(j) = first.outputs.iter().position(|v| *v == in2) {
                let triple = (in2, in1, second.outputs[j]);
                if !triples.contains(&triple) {
                    triples.push(triple);
                }
            }
            if !second.inputs.contains(&in1) {
                stale.push(in1);
            }
        }

        let keep: HashSet<Variable> = second
            .inputs
            .iter()
            .chain(&second.outputs)
            .chain(&iter_vars)
            .copied()
            .collect();
        let discard: Vec<NodeKey> = first
            .scratch
            .iter()
            .chain(&first.outputs)
            .chain(&stale)
            .filter(|v| !keep.contains(v))
            .map(|v| NodeKey::Variable(*v))
            .collect();
        rec.delete_from_graph(graph, &discard);
        debug!(
            "traced loop body graph {}: {} operations, {} feedback variables",
            graph.index(),
            second.ops.len(),
            triples.len()
        );

        let mut outputs = Vec::with_capacity(second.outputs.len());
        for v in second.outputs {
            if !outputs.contains(&v) {
                outputs.push(v);
            }
        }
        Ok((iter_vars, triples, outputs))
    }
}

/// What one tracing pass recorded.
struct Pass {
    ops: Vec<OpId>,
    names: Vec<String>,
    attributes: Vec<Vec<f64>>,
    /// Operation inputs with no producer in the body, in discovery order.
    inputs: Vec<Variable>,
    outputs: Vec<Variable>,
    output_shapes: Vec<Shape>,
    /// Body variables that are neither.
    scratch: Vec<Variable>,
}

impl Pass {
    fn record(rec: &Recorder, graph: GraphId) -> Self {
        let g = rec.graph(graph);
        let mut pass = Pass {
            ops: Vec::new(),
            names: Vec::new(),
            attributes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_shapes: Vec::new(),
            scratch: Vec::new(),
        };
        for op in g.operations() {
            let data = rec.operation(op);
            pass.ops.push(op);
            pass.names.push(data.kind().name().to_string());
            pass.attributes.push(data.kind().attributes());
            pass.inputs
                .extend(data.inputs().iter().filter(|v| g.in_degree(**v) == 0).copied());
            pass.outputs.extend_from_slice(data.outputs());
            pass.output_shapes
                .extend(data.outputs().iter().map(|v| shape_of(rec.shape(*v))));
        }
        let seen: HashSet<Variable> = pass.inputs.iter().chain(&pass.outputs).copied().collect();
        pass.scratch = g.variables().filter(|v| !seen.contains(v)).collect();
        pass
    }

    fn check_same_structure(&self, other: &Pass) -> Result<()> {
        if self.names != other.names {
            return Err(GraphError::TraceInvariance {
                message: format!(
                    "first pass recorded [{}], second pass recorded [{}]",
                    self.names.join(", "),
                    other.names.join(", ")
                ),
            });
        }
        if let Some(k) = (0..self.names.len()).find(|&k| self.attributes[k] != other.attributes[k]) {
            return Err(GraphError::TraceInvariance {
                message: format!(
                    "{} operation {k} has attributes {:?} in the first pass and {:?} in the second",
                    self.names[k], self.attributes[k], other.attributes[k]
                ),
            });
        }
        if self.inputs.len() != other.inputs.len() || self.outputs.len() != other.outputs.len() {
            return Err(GraphError::TraceInvariance {
                message: format!(
                    "first pass has {} inputs and {} outputs, second pass has {} and {}",
                    self.inputs.len(),
                    self.outputs.len(),
                    other.inputs.len(),
                    other.outputs.len()
                ),
            });
        }
        for (a, b) in self.output_shapes.iter().zip(&other.output_shapes) {
            if a != b {
                return Err(GraphError::shape_mismatch("loop body output", a, b));
            }
        }
        Ok(())
    }
}

/// Handle to a traced loop.
#[derive(Debug, Clone)]
pub struct Loop {
    op: OpId,
    kind: Rc<LoopOp>,
}

impl Loop {
    #[inline]
    pub fn op(&self) -> OpId {
        self.op
    }

    #[inline]
    pub fn body(&self) -> GraphId {
        self.kind.body()
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.kind.length()
    }

    pub fn feedbacks(&self) -> &[Feedback] {
        self.kind.feedbacks()
    }

    pub fn kind(&self) -> &Rc<LoopOp> {
        &self.kind
    }

    /// Stacked history of a loop-carried (or, with `stack_all`, any) body output.
    ///
    /// The first request turns off `inline_lazy_stack` for good. A deferred
    /// history is filled in immediately when the loop's inputs have values,
    /// otherwise on the next interpretation.
    pub fn stacked_output(&self, rec: &mut Recorder, body_output: Variable) -> Result<Variable> {
        let stack = self.kind.stack_of(body_output).ok_or_else(|| {
            GraphError::InvalidArgument(format!(
                "{} has no stacked history in this loop",
                rec.variable(body_output).info.name
            ))
        })?;
        if self.kind.lazy_stack.replace(false) && rec.value(stack).is_none() {
            let ready = rec.operation(self.op).inputs().iter().all(|v| rec.value(*v).is_some());
            if ready {
                rec.execute_operation(self.op)?;
            }
        }
        Ok(stack)
    }
}
