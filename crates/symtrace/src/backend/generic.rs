//! Generic (closure-composing) backend implementation.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::backend::{Backend, CompiledFn, Kernel, ScanStep};
use crate::error::{GraphError, Result};
use crate::node::{GraphId, Variable};
use crate::operation::LowerContext;
use crate::recorder::Recorder;
use crate::tensor::{Shape, Tensor, shape_of};

/// Generic backend composing per-operation kernels into one closure.
///
/// This backend is always available and serves as the reference lowering.
/// Scans run sequentially.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericBackend;

struct Step {
    kernel: Kernel,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

/// A straight-line program over value slots.
struct Program {
    num_slots: usize,
    input_shapes: Vec<Shape>,
    constants: Vec<(usize, Tensor)>,
    steps: Vec<Step>,
    outputs: Vec<usize>,
}

impl Program {
    fn run(&self, xs: &[Tensor]) -> Result<Vec<Tensor>> {
        let mut slots: Vec<Option<Tensor>> = vec![None; self.num_slots];
        for (k, (x, shape)) in xs.iter().zip(&self.input_shapes).enumerate() {
            if x.shape() != shape.as_slice() {
                return Err(GraphError::shape_mismatch(
                    format!("compiled input {k}"),
                    shape,
                    x.shape(),
                ));
            }
            slots[k] = Some(x.clone());
        }
        for (slot, value) in &self.constants {
            slots[*slot] = Some(value.clone());
        }
        for step in &self.steps {
            let args = step
                .inputs
                .iter()
                .map(|&s| slots[s].clone().ok_or_else(|| unfilled(s)))
                .collect::<Result<Vec<_>>>()?;
            let outs = (step.kernel)(&args)?;
            for (&s, value) in step.outputs.iter().zip(outs) {
                slots[s] = Some(value);
            }
        }
        self.outputs
            .iter()
            .map(|&s| slots[s].clone().ok_or_else(|| unfilled(s)))
            .collect()
    }
}

fn unfilled(slot: usize) -> GraphError {
    GraphError::InvalidArgument(format!("compiled slot {slot} was never written"))
}

impl Backend for GenericBackend {
    fn compile(
        &self,
        rec: &Recorder,
        graph: GraphId,
        outputs: &[Variable],
        inputs: &[Variable],
    ) -> Result<CompiledFn> {
        let order = rec.graph(graph).operation_order()?;
        let given: HashSet<Variable> = inputs.iter().copied().collect();

        // Keep only operations that feed an output and aren't cut off by an input.
        let mut needed: HashSet<Variable> = outputs.iter().copied().collect();
        let mut live = Vec::new();
        for op in order.iter().rev() {
            let data = rec.operation(*op);
            if data
                .outputs()
                .iter()
                .any(|v| needed.contains(v) && !given.contains(v))
            {
                needed.extend(data.inputs().iter().copied());
                live.push(*op);
            }
        }
        live.reverse();

        let mut slots: HashMap<Variable, usize> = HashMap::new();
        let mut input_shapes = Vec::with_capacity(inputs.len());
        for (k, v) in inputs.iter().enumerate() {
            slots.entry(*v).or_insert(k);
            input_shapes.push(shape_of(rec.shape(*v)));
        }
        let mut num_slots = inputs.len();
        let mut constants = Vec::new();
        let mut capture = |v: Variable, slots: &mut HashMap<Variable, usize>, num_slots: &mut usize| -> Result<usize> {
            if let Some(&s) = slots.get(&v) {
                return Ok(s);
            }
            let value = rec.require_value(v)?.clone();
            let s = *num_slots;
            *num_slots += 1;
            slots.insert(v, s);
            constants.push((s, value));
            Ok(s)
        };

        let mut steps = Vec::with_capacity(live.len());
        for op in live {
            let data = rec.operation(op);
            let node = data.node(op);
            let step_inputs = node
                .inputs
                .iter()
                .map(|v| capture(*v, &mut slots, &mut num_slots))
                .collect::<Result<Vec<_>>>()?;
            let step_outputs = node
                .outputs
                .iter()
                .map(|v| {
                    let s = num_slots;
                    num_slots += 1;
                    slots.insert(*v, s);
                    s
                })
                .collect();
            let ctx = LowerContext {
                recorder: rec,
                node: &node,
                kind: Rc::clone(data.kind()),
                backend: self,
            };
            steps.push(Step {
                kernel: data.kind().lower(&ctx)?,
                inputs: step_inputs,
                outputs: step_outputs,
            });
        }
        let output_slots = outputs
            .iter()
            .map(|v| capture(*v, &mut slots, &mut num_slots))
            .collect::<Result<Vec<_>>>()?;

        let program = Rc::new(Program {
            num_slots,
            input_shapes,
            constants,
            steps,
            outputs: output_slots,
        });
        let kernel: Kernel = Rc::new(move |xs: &[Tensor]| program.run(xs));
        Ok(CompiledFn::new(kernel, inputs.len(), outputs.len()))
    }

    fn scan(
        &self,
        step: &mut ScanStep<'_>,
        init: Vec<Tensor>,
        xs: &[Vec<Tensor>],
    ) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let mut carry = init;
        let mut history: Vec<Vec<Tensor>> = Vec::new();
        for x in xs {
            let (next, per_step) = step(&carry, x)?;
            if history.is_empty() {
                history = per_step.iter().map(|_| Vec::with_capacity(xs.len())).collect();
            }
            for (h, y) in history.iter_mut().zip(per_step) {
                h.push(y);
            }
            carry = next;
        }
        let stacked = history
            .iter()
            .map(|h| Tensor::stack(h))
            .collect::<Result<Vec<_>>>()?;
        Ok((carry, stacked))
    }

    fn shared(&self) -> Rc<dyn Backend> {
        Rc::new(*self)
    }
}
