//! Reverse mode through an implicit operation.
//!
//! With states `y` solving `R(y, x) = 0` and intermediates `z = h(y, x)`,
//! the cotangent of the inputs is
//!
//! ```text
//! (dR/dy)^T lambda = ybar + (dh/dy)^T zbar
//! xbar = (dh/dx)^T zbar - (dR/dx)^T lambda
//! ```
//!
//! Both products come from one local reverse-mode graph of the residual
//! computation seeded with `w` on the residuals and `zbar` on the
//! intermediates, which yields `(dR/dy)^T w + (dh/dy)^T zbar` for the states
//! and `(dR/dx)^T w + (dh/dx)^T zbar` for the inputs. The transposed
//! Jacobian is assembled column by column at unit seeds and solved by LU.

use std::collections::HashMap;
use std::rc::Rc;

use faer::mat::Mat;
use faer::linalg::solvers::Solve;

use crate::backend::Kernel;
use crate::cotangent::Cotangents;
use crate::error::{GraphError, Result};
use crate::node::{GraphId, Variable, VariableKind};
use crate::operation::{LowerContext, OpNode, Operation};
use crate::recorder::Recorder;
use crate::reverse::vjp;
use crate::tensor::{Shape, Tensor, numel, shape_of};

use super::ImplicitOperation;

type AdjointEval<'a> = dyn FnMut(&[Tensor], &[Tensor]) -> Result<(Vec<Tensor>, Vec<Tensor>)> + 'a;

/// Input cotangents of an [`ImplicitOperation`].
///
/// Node inputs are the implicit operation's inputs, its solved states, the
/// cotangents of seeded intermediates, then the cotangents of seeded states.
/// Outputs are the cotangents of the requested inputs.
#[derive(Debug)]
pub struct ImplicitAdjoint {
    graph: GraphId,
    inputs: Vec<Variable>,
    states: Vec<Variable>,
    residual_seeds: Vec<Variable>,
    intermediate_seeds: Vec<Variable>,
    seeded_states: Vec<bool>,
    state_grads: Vec<Option<Variable>>,
    input_grads: Vec<Option<Variable>>,
    /// Formal inputs whose cotangents are produced.
    wanted: Vec<Variable>,
}

pub(crate) fn implicit_vjp(
    op: &ImplicitOperation,
    rec: &mut Recorder,
    node: &OpNode,
    cotangents: &mut Cotangents,
) -> Result<()> {
    let wanted: Vec<usize> = (0..op.inputs.len())
        .filter(|&k| cotangents.wants(node.inputs[k]))
        .collect();
    if wanted.is_empty() {
        return Ok(());
    }
    let num_states = op.states.len();
    let state_cots: Vec<Option<Variable>> = node.outputs[..num_states]
        .iter()
        .map(|v| cotangents.get(*v))
        .collect();
    let seeded: Vec<(usize, Variable)> = node.outputs[num_states..]
        .iter()
        .enumerate()
        .filter_map(|(k, v)| cotangents.get(*v).map(|c| (k, c)))
        .collect();

    let graph = rec.enter_subgraph(true);
    let recorded = record(op, rec, &wanted, &seeded, &state_cots);
    rec.exit_subgraph()?;
    let adjoint = recorded?;
    debug_assert_eq!(adjoint.graph, graph);

    let mut inputs = node.inputs.clone();
    inputs.extend_from_slice(&node.outputs[..num_states]);
    inputs.extend(seeded.iter().map(|(_, c)| *c));
    inputs.extend(state_cots.iter().flatten());
    let outputs: Vec<Variable> = wanted
        .iter()
        .map(|&k| {
            let shape = shape_of(rec.shape(node.inputs[k]));
            rec.new_variable(shape, None, VariableKind::Computed, false)
        })
        .collect();
    let id = rec.admit_operation(Rc::new(adjoint) as Rc<dyn Operation>, inputs, outputs.clone())?;
    let ready = rec.operation(id).inputs().iter().all(|v| rec.value(*v).is_some());
    if rec.config().inline && rec.loop_depth() == 0 && ready {
        rec.execute_operation(id)?;
    }

    for (&k, out) in wanted.iter().zip(outputs) {
        cotangents.accumulate(rec, node.inputs[k], out)?;
    }
    Ok(())
}

/// Replay the residual graph into the active graph and differentiate the replay.
fn record(
    op: &ImplicitOperation,
    rec: &mut Recorder,
    wanted: &[usize],
    seeded: &[(usize, Variable)],
    state_cots: &[Option<Variable>],
) -> Result<ImplicitAdjoint> {
    let mut map: HashMap<Variable, Variable> = op.inputs.iter().map(|v| (*v, *v)).collect();
    let states: Vec<Variable> = op
        .states
        .iter()
        .map(|s| {
            let y = rec.new_variable(shape_of(rec.shape(*s)), None, VariableKind::Free, false);
            map.insert(*s, y);
            y
        })
        .collect();
    rec.replay_graph(op.graph, &mut map)?;
    let replayed = |v: Variable| map.get(&v).copied().unwrap_or(v);

    let mut seeds = Vec::new();
    let mut residual_seeds = Vec::with_capacity(op.residuals.len());
    for r in &op.residuals {
        let w = rec.new_variable(shape_of(rec.shape(*r)), None, VariableKind::Free, false);
        seeds.push((replayed(*r), w));
        residual_seeds.push(w);
    }
    let mut intermediate_seeds = Vec::with_capacity(seeded.len());
    for &(k, _) in seeded {
        let z = op.intermediates[k];
        let zbar = rec.new_variable(shape_of(rec.shape(z)), None, VariableKind::Free, false);
        seeds.push((replayed(z), zbar));
        intermediate_seeds.push(zbar);
    }

    let formal: Vec<Variable> = wanted.iter().map(|&k| op.inputs[k]).collect();
    let mut wrts = states.clone();
    wrts.extend_from_slice(&formal);
    let graph = rec.active_graph();
    let local = vjp(rec, &seeds, &wrts, graph)?;

    Ok(ImplicitAdjoint {
        graph,
        inputs: op.inputs.clone(),
        residual_seeds,
        intermediate_seeds,
        seeded_states: state_cots.iter().map(Option::is_some).collect(),
        state_grads: states.iter().map(|y| local.get(*y)).collect(),
        input_grads: formal.iter().map(|x| local.get(*x)).collect(),
        states,
        wanted: formal,
    })
}

impl ImplicitAdjoint {
    /// Place the state cotangent inputs at the positions of the seeded states.
    fn spread(&self, ybar: &[Tensor]) -> Vec<Option<Tensor>> {
        let mut given = ybar.iter();
        self.seeded_states
            .iter()
            .map(|seeded| if *seeded { given.next().cloned() } else { None })
            .collect()
    }

    fn shapes(rec: &Recorder, vars: &[Variable]) -> Vec<Shape> {
        vars.iter().map(|v| shape_of(rec.shape(*v))).collect()
    }
}

impl Operation for ImplicitAdjoint {
    fn name(&self) -> &str {
        "implicit_adjoint"
    }

    fn interpret(
        &self,
        rec: &mut Recorder,
        _node: &OpNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Option<Tensor>>> {
        let (xs, rest) = inputs.split_at(self.inputs.len());
        let (ys, rest) = rest.split_at(self.states.len());
        let (zbar, ybar) = rest.split_at(self.intermediate_seeds.len());
        for (v, value) in self.inputs.iter().zip(xs).chain(self.states.iter().zip(ys)) {
            rec.set_value(*v, value.clone())?;
        }
        let state_shapes = Self::shapes(rec, &self.states);
        let input_shapes = Self::shapes(rec, &self.wanted);
        let residual_shapes = Self::shapes(rec, &self.residual_seeds);
        let graph = self.graph;

        let mut eval = |w: &[Tensor], z: &[Tensor]| -> Result<(Vec<Tensor>, Vec<Tensor>)> {
            for (v, value) in self
                .residual_seeds
                .iter()
                .zip(w)
                .chain(self.intermediate_seeds.iter().zip(z))
            {
                rec.set_value(*v, value.clone())?;
            }
            rec.run_interpretation(graph)?;
            let read = |grads: &[Option<Variable>], shapes: &[Shape]| -> Result<Vec<Tensor>> {
                grads
                    .iter()
                    .zip(shapes)
                    .map(|(g, shape)| match g {
                        Some(g) => rec.require_value(*g).cloned(),
                        None => Ok(Tensor::zeros(shape)),
                    })
                    .collect()
            };
            Ok((read(&self.state_grads, &state_shapes)?, read(&self.input_grads, &input_shapes)?))
        };
        let xbar = solve_adjoint(&mut eval, &residual_shapes, zbar, &self.spread(ybar))?;
        Ok(xbar.into_iter().map(Some).collect())
    }

    fn vjp(&self, _rec: &mut Recorder, _node: &OpNode, _cotangents: &mut Cotangents) -> Result<()> {
        Err(GraphError::NotDifferentiable {
            operation: self.name().to_string(),
        })
    }

    fn lower(&self, ctx: &LowerContext<'_>) -> Result<Kernel> {
        let rec = ctx.recorder;
        let outputs: Vec<Variable> = self
            .state_grads
            .iter()
            .chain(&self.input_grads)
            .flatten()
            .copied()
            .collect();
        let mut fn_inputs = self.inputs.clone();
        fn_inputs.extend_from_slice(&self.states);
        fn_inputs.extend_from_slice(&self.residual_seeds);
        fn_inputs.extend_from_slice(&self.intermediate_seeds);
        let adjoint_fn = ctx.backend.compile(rec, self.graph, &outputs, &fn_inputs)?;

        let state_shapes = Self::shapes(rec, &self.states);
        let input_shapes = Self::shapes(rec, &self.wanted);
        let residual_shapes = Self::shapes(rec, &self.residual_seeds);
        let state_present: Vec<bool> = self.state_grads.iter().map(Option::is_some).collect();
        let input_present: Vec<bool> = self.input_grads.iter().map(Option::is_some).collect();
        let seeded_states = self.seeded_states.clone();
        let num_fixed = self.inputs.len() + self.states.len();
        let num_seeded = self.intermediate_seeds.len();

        Ok(Rc::new(move |args: &[Tensor]| {
            let (fixed, rest) = args.split_at(num_fixed);
            let (zbar, ybar) = rest.split_at(num_seeded);
            let mut eval = |w: &[Tensor], z: &[Tensor]| -> Result<(Vec<Tensor>, Vec<Tensor>)> {
                let mut call_args = fixed.to_vec();
                call_args.extend_from_slice(w);
                call_args.extend_from_slice(z);
                let mut out = adjoint_fn.call(&call_args)?.into_iter();
                let through_states = fill(&state_present, &state_shapes, &mut out);
                let through_inputs = fill(&input_present, &input_shapes, &mut out);
                Ok((through_states, through_inputs))
            };
            let mut given = ybar.iter();
            let ybar: Vec<Option<Tensor>> = seeded_states
                .iter()
                .map(|seeded| if *seeded { given.next().cloned() } else { None })
                .collect();
            solve_adjoint(&mut eval, &residual_shapes, zbar, &ybar)
        }))
    }

    fn subgraph(&self) -> Option<GraphId> {
        Some(self.graph)
    }
}

fn fill(present: &[bool], shapes: &[Shape], out: &mut impl Iterator<Item = Tensor>) -> Vec<Tensor> {
    present
        .iter()
        .zip(shapes)
        .map(|(p, shape)| match *p {
            true => out.next().unwrap_or_else(|| Tensor::zeros(shape)),
            false => Tensor::zeros(shape),
        })
        .collect()
}

/// Solve for the input cotangents given the local vector-Jacobian product `eval`.
fn solve_adjoint(
    eval: &mut AdjointEval<'_>,
    residual_shapes: &[Shape],
    zbar: &[Tensor],
    ybar: &[Option<Tensor>],
) -> Result<Vec<Tensor>> {
    let zero_w: Vec<Tensor> = residual_shapes.iter().map(|s| Tensor::zeros(s)).collect();
    let zero_z: Vec<Tensor> = zbar.iter().map(|z| Tensor::zeros(z.shape())).collect();

    let (through_states, _) = eval(&zero_w, zbar)?;
    let mut rhs = Tensor::concat_flat(&through_states);
    let mut offset = 0;
    for (s, seed) in through_states.iter().zip(ybar) {
        if let Some(seed) = seed {
            for (r, g) in rhs[offset..offset + s.len()].iter_mut().zip(seed.data()) {
                *r += g;
            }
        }
        offset += s.len();
    }

    let n = rhs.len();
    debug_assert_eq!(n, residual_shapes.iter().map(|s| numel(s)).sum::<usize>());
    let mut jt = Mat::<f64>::zeros(n, n);
    let mut unit = vec![0.0; n];
    for j in 0..n {
        unit[j] = 1.0;
        let (column, _) = eval(&Tensor::split_flat(&unit, residual_shapes)?, &zero_z)?;
        unit[j] = 0.0;
        for (i, v) in Tensor::concat_flat(&column).into_iter().enumerate() {
            jt[(i, j)] = v;
        }
    }

    let mut lambda = Mat::<f64>::from_fn(n, 1, |i, _| rhs[i]);
    let lu = jt.as_ref().partial_piv_lu();
    lu.solve_in_place(&mut lambda);
    let neg_lambda: Vec<f64> = (0..n).map(|i| -lambda[(i, 0)]).collect();
    if neg_lambda.iter().any(|v| !v.is_finite()) {
        return Err(GraphError::SingularJacobian);
    }
    let (_, xbar) = eval(&Tensor::split_flat(&neg_lambda, residual_shapes)?, zbar)?;
    Ok(xbar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::implicit::{BracketOptions, BracketedSearch, GaussSeidel, SolverOptions, StateOptions};
    use crate::recorder::RecorderConfig;
    use crate::{derivative, ops};
    use approx::assert_relative_eq;

    #[test]
    fn test_scalar_root_derivative() {
        // y^2 = a, dy/da = 1 / (2 y)
        let mut rec = Recorder::new(RecorderConfig::default().inline(true));
        let a = rec.input(Tensor::scalar(3.0));
        let y = rec.create_variable(&[1], None, false).unwrap();
        let y2 = ops::mul(&mut rec, y, y).unwrap();
        let r = ops::sub(&mut rec, y2, a).unwrap();
        let mut solver = BracketedSearch::new(SolverOptions::default().tolerance(1e-13));
        solver.add_state(&rec, y, r, BracketOptions::new(0.0, 4.0)).unwrap();
        solver.run(&mut rec).unwrap();

        let dy = derivative(&mut rec, y, &[a]).unwrap()[0].unwrap();
        let root = 3f64.sqrt();
        assert_relative_eq!(rec.value(y).unwrap().item(), root, epsilon = 1e-12);
        assert_relative_eq!(rec.value(dy).unwrap().item(), 0.5 / root, epsilon = 1e-10);
    }

    #[test]
    fn test_coupled_states_and_intermediates() {
        // x = 0.5 y + a, y = 0.25 x + 2; seed through the intermediate q = 0.25 x.
        let mut rec = Recorder::new(RecorderConfig::default().inline(true));
        let a = rec.input(Tensor::scalar(1.0));
        let two = rec.constant(Tensor::scalar(2.0));
        let x = rec.create_variable(&[1], Some(Tensor::scalar(0.0)), false).unwrap();
        let y = rec.create_variable(&[1], Some(Tensor::scalar(0.0)), false).unwrap();
        let hy = ops::scale(&mut rec, y, 0.5).unwrap();
        let fx = ops::add(&mut rec, hy, a).unwrap();
        let rx = ops::sub(&mut rec, x, fx).unwrap();
        let q = ops::scale(&mut rec, x, 0.25).unwrap();
        let fy = ops::add(&mut rec, q, two).unwrap();
        let ry = ops::sub(&mut rec, y, fy).unwrap();
        let mut solver = GaussSeidel::new(SolverOptions::default().tolerance(1e-13));
        solver.add_state(&rec, x, rx, StateOptions::default()).unwrap();
        solver.add_state(&rec, y, ry, StateOptions::default()).unwrap();
        solver.run(&mut rec).unwrap();

        // x = (a + 1) / 0.875, y = 0.25 x + 2, q = 0.25 x
        let total = ops::add(&mut rec, y, q).unwrap();
        let d = derivative(&mut rec, total, &[a]).unwrap()[0].unwrap();
        assert_relative_eq!(rec.value(d).unwrap().item(), 0.5 / 0.875, epsilon = 1e-10);
    }

    #[test]
    fn test_adjoint_is_not_differentiable_again() {
        let mut rec = Recorder::new(RecorderConfig::default().inline(true));
        let a = rec.input(Tensor::scalar(2.0));
        let y = rec.create_variable(&[1], Some(Tensor::scalar(0.0)), false).unwrap();
        let ay = ops::mul(&mut rec, a, y).unwrap();
        let one = rec.constant(Tensor::scalar(1.0));
        let r = ops::sub(&mut rec, ay, one).unwrap();
        let r = ops::scale(&mut rec, r, 0.4).unwrap();
        let mut solver = GaussSeidel::new(SolverOptions::default());
        solver.add_state(&rec, y, r, StateOptions::default()).unwrap();
        solver.run(&mut rec).unwrap();

        let dy = derivative(&mut rec, y, &[a]).unwrap()[0].unwrap();
        assert_relative_eq!(rec.value(dy).unwrap().item(), -0.25, epsilon = 1e-8);
        let err = derivative(&mut rec, dy, &[a]).unwrap_err();
        assert!(matches!(err, GraphError::NotDifferentiable { .. }));
    }
}
