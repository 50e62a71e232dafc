//! The loop operation: one node standing for every iteration of a traced body.

use std::cell::Cell;
use std::rc::Rc;

use log::debug;

use crate::backend::Kernel;
use crate::cotangent::Cotangents;
use crate::error::{GraphError, Result};
use crate::node::{GraphId, NodeKey, OpId, Variable, VariableKind};
use crate::operation::{LowerContext, OpNode, Operation};
use crate::recorder::Recorder;
use crate::tensor::{Shape, Tensor, shape_of};

/// Loop-carried state: `body_input` starts as `external_initial` and takes the
/// value of `body_output` after every iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feedback {
    pub body_input: Variable,
    pub external_initial: Variable,
    pub body_output: Variable,
    /// History of `body_input` at the start of each iteration, shape `(L,) + shape`.
    pub stack: Variable,
}

/// What a stacked output records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackSource {
    /// `feedbacks[k].body_input` at the start of each iteration.
    Feedback(usize),
    /// A body output at the end of each iteration.
    Output(Variable),
}

/// A loop over a body graph.
///
/// `inputs` and `outputs` are the formal variables the body was traced with.
/// Outputs are the body outputs followed by one stacked history per entry of
/// `stack_sources`.
#[derive(Debug)]
pub struct LoopOp {
    pub(crate) body: GraphId,
    pub(crate) iter_vars: Vec<Variable>,
    pub(crate) vals: Vec<Vec<usize>>,
    pub(crate) feedbacks: Vec<Feedback>,
    pub(crate) inputs: Vec<Variable>,
    pub(crate) outputs: Vec<Variable>,
    pub(crate) num_body_outputs: usize,
    pub(crate) stack_sources: Vec<StackSource>,
    pub(crate) lazy_stack: Cell<bool>,
    pub(crate) parent: Option<GraphId>,
}

/// Everything needed to splice a traced body into the active graph.
pub(crate) struct LoopParts {
    pub body: GraphId,
    pub iter_vars: Vec<Variable>,
    pub vals: Vec<Vec<usize>>,
    /// `(body_input, external_initial, body_output)`
    pub triples: Vec<(Variable, Variable, Variable)>,
    pub outputs: Vec<Variable>,
    pub stack_all: bool,
    pub lazy: bool,
    pub parent: Option<GraphId>,
}

impl LoopOp {
    /// Build the loop node and admit it into the active graph.
    pub(crate) fn finalize(rec: &mut Recorder, parts: LoopParts) -> Result<(OpId, Rc<LoopOp>)> {
        let length = parts.vals.first().map_or(0, Vec::len);
        if length == 0 {
            return Err(GraphError::EmptyLoop);
        }
        for &(bi, ei, bo) in &parts.triples {
            if rec.shape(bi) != rec.shape(bo) {
                return Err(GraphError::shape_mismatch(
                    "loop feedback output",
                    rec.shape(bi),
                    rec.shape(bo),
                ));
            }
            if rec.shape(bi) != rec.shape(ei) {
                return Err(GraphError::shape_mismatch(
                    "loop feedback initial value",
                    rec.shape(bi),
                    rec.shape(ei),
                ));
            }
        }

        let mut outputs: Vec<Variable> = Vec::with_capacity(parts.outputs.len());
        for v in parts.outputs.iter().chain(parts.triples.iter().map(|t| &t.2)) {
            if !outputs.contains(v) {
                outputs.push(*v);
            }
        }

        let mut inputs: Vec<Variable> = rec.graph(parts.body).boundary_inputs().to_vec();
        let active = rec.active_graph();
        for &(_, ei, _) in &parts.triples {
            if !inputs.contains(&ei) {
                inputs.push(ei);
            }
            let graph = rec.graph(active);
            if !graph.contains(ei) && !graph.auto_admit() && rec.variable(ei).kind == VariableKind::Constant {
                rec.graph_mut(active).add_node(ei);
            }
        }

        let mut stack_sources: Vec<StackSource> = (0..parts.triples.len()).map(StackSource::Feedback).collect();
        if parts.stack_all {
            let carried: Vec<Variable> = parts.triples.iter().map(|t| t.2).collect();
            stack_sources.extend(
                outputs
                    .iter()
                    .filter(|v| !carried.contains(v))
                    .map(|v| StackSource::Output(*v)),
            );
        }
        let mut stacks = Vec::with_capacity(stack_sources.len());
        for source in &stack_sources {
            let inner = match *source {
                StackSource::Feedback(k) => parts.triples[k].0,
                StackSource::Output(v) => v,
            };
            let shape = stacked_shape(length, rec.shape(inner));
            let value = (!parts.lazy).then(|| Tensor::zeros(&shape));
            stacks.push(rec.new_variable(shape, value, VariableKind::Computed, false));
        }

        let feedbacks: Vec<Feedback> = parts
            .triples
            .iter()
            .zip(&stacks)
            .map(|(&(body_input, external_initial, body_output), &stack)| Feedback {
                body_input,
                external_initial,
                body_output,
                stack,
            })
            .collect();
        for f in &feedbacks {
            debug!(
                "loop feedback: {} <- {} (initial {})",
                rec.variable(f.body_input).info.name,
                rec.variable(f.body_output).info.name,
                rec.variable(f.external_initial).info.name
            );
        }

        let num_body_outputs = outputs.len();
        outputs.extend(stacks);
        let kind = Rc::new(LoopOp {
            body: parts.body,
            iter_vars: parts.iter_vars,
            vals: parts.vals,
            feedbacks,
            inputs: inputs.clone(),
            outputs: outputs.clone(),
            num_body_outputs,
            stack_sources,
            lazy_stack: Cell::new(parts.lazy),
            parent: parts.parent,
        });
        let op = rec.admit_operation(Rc::clone(&kind) as Rc<dyn Operation>, inputs, outputs)?;
        Ok((op, kind))
    }

    /// Number of iterations.
    #[inline]
    pub fn length(&self) -> usize {
        self.vals.first().map_or(0, Vec::len)
    }

    #[inline]
    pub fn body(&self) -> GraphId {
        self.body
    }

    #[inline]
    pub fn feedbacks(&self) -> &[Feedback] {
        &self.feedbacks
    }

    #[inline]
    pub fn iteration_variables(&self) -> &[Variable] {
        &self.iter_vars
    }

    /// Formal inputs: boundary inputs of the body, then external initials.
    #[inline]
    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    /// Formal outputs: body outputs, then stacked histories.
    #[inline]
    pub fn outputs(&self) -> &[Variable] {
        &self.outputs
    }

    pub(crate) fn body_outputs(&self) -> &[Variable] {
        &self.outputs[..self.num_body_outputs]
    }

    pub(crate) fn stacks(&self) -> &[Variable] {
        &self.outputs[self.num_body_outputs..]
    }

    /// The stacked history recording `v`, either a feedback body output or,
    /// with `stack_all`, any body output.
    pub fn stack_of(&self, v: Variable) -> Option<Variable> {
        self.stack_sources
            .iter()
            .zip(self.stacks())
            .find(|(source, _)| match **source {
                StackSource::Feedback(k) => {
                    self.feedbacks[k].body_output == v || self.feedbacks[k].body_input == v
                }
                StackSource::Output(o) => o == v,
            })
            .map(|(_, stack)| *stack)
    }

    fn run_sequential(&self, rec: &mut Recorder, inputs: &[Tensor]) -> Result<Vec<Option<Tensor>>> {
        for (v, value) in self.inputs.iter().zip(inputs) {
            rec.set_value(*v, value.clone())?;
        }
        let lazy = self.lazy_stack.get();
        let length = self.length();
        let mut stacks: Vec<Tensor> = if lazy {
            Vec::new()
        } else {
            self.stacks().iter().map(|s| Tensor::zeros(rec.shape(*s))).collect()
        };

        for i in 0..length {
            for (iv, vals) in self.iter_vars.iter().zip(&self.vals) {
                rec.set_value(*iv, Tensor::scalar(vals[i] as f64))?;
            }
            if i == 0 {
                for f in &self.feedbacks {
                    let initial = rec.require_value(f.external_initial)?.clone();
                    rec.set_value(f.body_input, initial)?;
                }
            }
            if !lazy {
                for (k, source) in self.stack_sources.iter().enumerate() {
                    if let StackSource::Feedback(j) = *source {
                        stacks[k].set_axis0(i, rec.require_value(self.feedbacks[j].body_input)?)?;
                    }
                }
            }
            rec.run_interpretation(self.body)?;
            if !lazy {
                for (k, source) in self.stack_sources.iter().enumerate() {
                    if let StackSource::Output(v) = *source {
                        stacks[k].set_axis0(i, rec.require_value(v)?)?;
                    }
                }
            }
            for f in &self.feedbacks {
                let next = rec.require_value(f.body_output)?.clone();
                rec.set_value(f.body_input, next)?;
            }
        }

        let mut out = self
            .body_outputs()
            .iter()
            .map(|v| rec.require_value(*v).cloned().map(Some))
            .collect::<Result<Vec<_>>>()?;
        if lazy {
            out.extend(self.stacks().iter().map(|_| None));
        } else {
            out.extend(stacks.into_iter().map(Some));
        }
        Ok(out)
    }
}

impl Operation for LoopOp {
    fn name(&self) -> &str {
        "loop"
    }

    fn attributes(&self) -> Vec<f64> {
        self.vals.iter().flatten().map(|&v| v as f64).collect()
    }

    fn interpret(
        &self,
        rec: &mut Recorder,
        _node: &OpNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Option<Tensor>>> {
        let snapshot = self.parent.map(|g| rec.snapshot_values(g));
        let result = self.run_sequential(rec, inputs);
        if let Some(snapshot) = snapshot {
            rec.restore_values(snapshot);
        }
        result
    }

    fn vjp(&self, rec: &mut Recorder, node: &OpNode, cotangents: &mut Cotangents) -> Result<()> {
        super::reverse::loop_vjp(self, rec, node, cotangents)
    }

    fn lower(&self, ctx: &LowerContext<'_>) -> Result<Kernel> {
        let rec = ctx.recorder;
        let body = rec.graph(self.body);
        let true_outputs = self.body_outputs().to_vec();

        let fixed: Vec<usize> = (0..self.inputs.len())
            .filter(|&k| body.contains(self.inputs[k]))
            .collect();
        let mut fn_inputs: Vec<Variable> = fixed.iter().map(|&k| self.inputs[k]).collect();
        fn_inputs.extend(self.feedbacks.iter().map(|f| f.body_input));
        fn_inputs.extend(self.iter_vars.iter().copied());
        let body_fn = ctx.backend.compile(rec, self.body, &true_outputs, &fn_inputs)?;

        let position = |list: &[Variable], v: Variable| {
            list.iter().position(|x| *x == v).ok_or_else(|| GraphError::NotInGraph {
                node: rec.variable(v).info.name.clone(),
            })
        };
        let fb_in = self
            .feedbacks
            .iter()
            .map(|f| position(&self.inputs, f.external_initial))
            .collect::<Result<Vec<_>>>()?;
        let fb_out = self
            .feedbacks
            .iter()
            .map(|f| position(&true_outputs, f.body_output))
            .collect::<Result<Vec<_>>>()?;
        let end_stacks = self
            .stack_sources
            .iter()
            .filter_map(|s| match *s {
                StackSource::Output(v) => Some(position(&true_outputs, v)),
                StackSource::Feedback(_) => None,
            })
            .collect::<Result<Vec<_>>>()?;
        let zero_carry: Vec<Tensor> = true_outputs.iter().map(|v| Tensor::zeros(rec.shape(*v))).collect();
        let xs: Vec<Vec<Tensor>> = (0..self.length())
            .map(|i| self.vals.iter().map(|v| Tensor::scalar(v[i] as f64)).collect())
            .collect();
        let backend = ctx.backend.shared();

        Ok(Rc::new(move |args: &[Tensor]| {
            let fixed_args: Vec<Tensor> = fixed.iter().map(|&k| args[k].clone()).collect();
            let mut init = zero_carry.clone();
            for (&j, &k) in fb_out.iter().zip(&fb_in) {
                init[j] = args[k].clone();
            }
            let mut step = |carry: &[Tensor], x: &[Tensor]| -> Result<(Vec<Tensor>, Vec<Tensor>)> {
                let mut call_args = fixed_args.clone();
                call_args.extend(fb_out.iter().map(|&j| carry[j].clone()));
                call_args.extend_from_slice(x);
                let next = body_fn.call(&call_args)?;
                let mut per_step: Vec<Tensor> = fb_out.iter().map(|&j| carry[j].clone()).collect();
                per_step.extend(end_stacks.iter().map(|&j| next[j].clone()));
                Ok((next, per_step))
            };
            let (mut out, stacked) = backend.scan(&mut step, init, &xs)?;
            out.extend(stacked);
            Ok(out)
        }))
    }

    fn subgraph(&self) -> Option<GraphId> {
        Some(self.body)
    }
}

/// `(length,) + shape`
pub(crate) fn stacked_shape(length: usize, shape: &[usize]) -> Shape {
    let mut s = shape_of(&[length]);
    s.extend_from_slice(shape);
    s
}

/// Delete `ops` from `graph`, forgetting the nested graphs they own.
pub(crate) fn delete_operations(rec: &mut Recorder, graph: GraphId, ops: &[OpId]) {
    let owned: Vec<GraphId> = ops
        .iter()
        .filter_map(|op| rec.operation(*op).kind().subgraph())
        .collect();
    let keys: Vec<NodeKey> = ops.iter().map(|op| NodeKey::Operation(*op)).collect();
    rec.delete_from_graph(graph, &keys);
    rec.graph_mut(graph).children.retain(|c| !owned.contains(c));
}
