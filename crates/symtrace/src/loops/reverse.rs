//! Reverse mode through a loop: the derivative of a loop is another loop.
//!
//! The reverse loop runs the iteration indices backwards. Each step replays
//! the forward body once, with loop-carried inputs read from the forward
//! stacked histories, differentiates that single replay, and carries the
//! resulting cotangents to the previous step as its own loop-carried state.

use std::collections::HashMap;

use crate::cotangent::Cotangents;
use crate::error::Result;
use crate::node::{Variable, VariableKind};
use crate::operation::OpNode;
use crate::ops;
use crate::recorder::Recorder;
use crate::reverse::vjp;
use crate::tensor::shape_of;

use super::loop_op::{LoopOp, LoopParts, StackSource};

/// A cotangent carried across reverse iterations.
struct Carried {
    body_input: Variable,
    initial: Variable,
    body_output: Option<Variable>,
}

pub(crate) fn loop_vjp(
    lp: &LoopOp,
    rec: &mut Recorder,
    node: &OpNode,
    cotangents: &mut Cotangents,
) -> Result<()> {
    let actual_in: HashMap<Variable, Variable> = lp.inputs.iter().copied().zip(node.inputs.iter().copied()).collect();
    let actual_out: HashMap<Variable, Variable> = lp.outputs.iter().copied().zip(node.outputs.iter().copied()).collect();
    let outer = |v: Variable, map: &HashMap<Variable, Variable>| map.get(&v).copied().unwrap_or(v);

    let body_graph = lp.body;
    let accumulating: Vec<Variable> = lp
        .inputs
        .iter()
        .filter(|v| rec.graph(body_graph).contains(**v) && cotangents.wants(outer(**v, &actual_in)))
        .copied()
        .collect();
    let wants_initial = lp
        .feedbacks
        .iter()
        .any(|f| cotangents.wants(outer(f.external_initial, &actual_in)));
    if accumulating.is_empty() && !wants_initial {
        return Ok(());
    }

    // The reverse loop reads the forward histories.
    if lp.lazy_stack.replace(false) {
        let stacks_missing = lp.feedbacks.iter().any(|f| rec.value(outer(f.stack, &actual_out)).is_none());
        let ready = node.inputs.iter().all(|v| rec.value(*v).is_some());
        if stacks_missing && ready && rec.config().inline && rec.loop_depth() == 0 {
            rec.execute_operation(node.id)?;
        }
    }

    let feedback_outputs: Vec<Variable> = lp.feedbacks.iter().map(|f| f.body_output).collect();
    let seeded_outputs: Vec<(Variable, Variable)> = lp
        .body_outputs()
        .iter()
        .filter(|v| !feedback_outputs.contains(v))
        .filter_map(|v| cotangents.get(outer(*v, &actual_out)).map(|c| (*v, c)))
        .collect();

    // Initial values of the carried cotangents live in the outer graph.
    let feedback_initials: Vec<Variable> = lp
        .feedbacks
        .iter()
        .map(|f| match cotangents.get(outer(f.body_output, &actual_out)) {
            Some(c) => c,
            None => ops::zeros_like(rec, f.body_output),
        })
        .collect();
    let input_initials: Vec<Variable> = accumulating.iter().map(|v| ops::zeros_like(rec, *v)).collect();

    let length = lp.length();
    let mut vals: Vec<Vec<usize>> = vec![(0..length).rev().collect()];
    vals.extend(lp.vals.iter().map(|v| v.iter().rev().copied().collect::<Vec<_>>()));

    let graph = rec.enter_loop_body();
    let built = build_reverse_body(
        lp,
        rec,
        &vals,
        &actual_in,
        &actual_out,
        cotangents,
        &accumulating,
        &seeded_outputs,
        &feedback_initials,
        &input_initials,
    );
    rec.exit_loop_body()?;
    let (iter_vars, carried) = match built {
        Ok(parts) => parts,
        Err(e) => {
            rec.discard_graph(graph);
            return Err(e);
        }
    };

    let triples: Vec<(Variable, Variable, Variable)> = carried
        .iter()
        .filter_map(|c| c.body_output.map(|bo| (c.body_input, c.initial, bo)))
        .collect();
    let outputs: Vec<Variable> = triples.iter().map(|t| t.2).collect();
    let (op, _) = LoopOp::finalize(
        rec,
        LoopParts {
            body: graph,
            iter_vars,
            vals,
            triples,
            outputs,
            stack_all: false,
            lazy: true,
            parent: Some(lp.body),
        },
    )?;
    let ready = rec.operation(op).inputs().iter().all(|v| rec.value(*v).is_some());
    if rec.config().inline && rec.loop_depth() == 0 && ready {
        rec.execute_operation(op)?;
    }

    // The carried cotangent after the last reverse step belongs to the
    // external initial value (feedbacks) or the input itself (accumulators).
    let n = lp.feedbacks.len();
    for (f, c) in lp.feedbacks.iter().zip(&carried[..n]) {
        if let Some(total) = c.body_output {
            cotangents.accumulate(rec, outer(f.external_initial, &actual_in), total)?;
        }
    }
    for (v, c) in accumulating.iter().zip(&carried[n..n + accumulating.len()]) {
        if let Some(total) = c.body_output {
            cotangents.accumulate(rec, outer(*v, &actual_in), total)?;
        }
    }
    Ok(())
}

/// Record the reverse body in the active graph.
///
/// Returns the iteration variables and the carried cotangents: feedbacks
/// first, then accumulating inputs, then seeded pass-through outputs.
#[allow(clippy::too_many_arguments)]
fn build_reverse_body(
    lp: &LoopOp,
    rec: &mut Recorder,
    vals: &[Vec<usize>],
    actual_in: &HashMap<Variable, Variable>,
    actual_out: &HashMap<Variable, Variable>,
    cotangents: &Cotangents,
    accumulating: &[Variable],
    seeded_outputs: &[(Variable, Variable)],
    feedback_initials: &[Variable],
    input_initials: &[Variable],
) -> Result<(Vec<Variable>, Vec<Carried>)> {
    let outer = |v: Variable, map: &HashMap<Variable, Variable>| map.get(&v).copied().unwrap_or(v);

    let iter_vars: Vec<Variable> = vals.iter().map(|v| rec.declare_iteration(v[0])).collect();
    let rev_index = iter_vars[0];

    let mut map: HashMap<Variable, Variable> = HashMap::new();
    for (orig, rev) in lp.iter_vars.iter().zip(&iter_vars[1..]) {
        map.insert(*orig, *rev);
    }
    for v in &lp.inputs {
        map.insert(*v, outer(*v, actual_in));
    }
    let mut replayed_inputs = Vec::with_capacity(lp.feedbacks.len());
    for f in &lp.feedbacks {
        let at_step = ops::index(rec, outer(f.stack, actual_out), rev_index)?;
        map.insert(f.body_input, at_step);
        replayed_inputs.push(at_step);
    }
    rec.replay_graph(lp.body, &mut map)?;
    let replayed = |v: Variable| map.get(&v).copied().unwrap_or(v);

    let mut seeds = Vec::new();
    let mut carried = Vec::new();
    for (f, &initial) in lp.feedbacks.iter().zip(feedback_initials) {
        let shape = shape_of(rec.shape(f.body_output));
        let cot = rec.new_variable(shape, None, VariableKind::Free, false);
        seeds.push((replayed(f.body_output), cot));
        carried.push(Carried {
            body_input: cot,
            initial,
            body_output: None,
        });
    }
    for (v, &initial) in accumulating.iter().zip(input_initials) {
        let shape = shape_of(rec.shape(*v));
        let cot = rec.new_variable(shape, None, VariableKind::Free, false);
        carried.push(Carried {
            body_input: cot,
            initial,
            body_output: None,
        });
    }
    for &(v, outer_cot) in seeded_outputs {
        let shape = shape_of(rec.shape(v));
        let cot = rec.new_variable(shape, None, VariableKind::Free, false);
        seeds.push((replayed(v), cot));
        carried.push(Carried {
            body_input: cot,
            initial: outer_cot,
            body_output: None,
        });
    }
    for (source, stack) in lp.stack_sources.iter().zip(lp.stacks()) {
        if let (StackSource::Output(v), Some(stack_cot)) = (*source, cotangents.get(outer(*stack, actual_out))) {
            let at_step = ops::index(rec, stack_cot, rev_index)?;
            seeds.push((replayed(v), at_step));
        }
    }

    let mut wrts: Vec<Variable> = replayed_inputs.clone();
    wrts.extend(accumulating.iter().map(|v| outer(*v, actual_in)));
    let graph = rec.active_graph();
    let local = vjp(rec, &seeds, &wrts, graph)?;

    let n = lp.feedbacks.len();
    for (k, f) in lp.feedbacks.iter().enumerate() {
        let mut parts: Vec<Variable> = local.get(replayed_inputs[k]).into_iter().collect();
        if let Some(stack_cot) = cotangents.get(outer(f.stack, actual_out)) {
            parts.push(ops::index(rec, stack_cot, rev_index)?);
        }
        carried[k].body_output = Some(sum_or_zero(rec, &parts, carried[k].body_input)?);
    }
    for (j, v) in accumulating.iter().enumerate() {
        let c = &mut carried[n + j];
        c.body_output = match local.get(outer(*v, actual_in)) {
            Some(contribution) => Some(ops::add(rec, contribution, c.body_input)?),
            None => None,
        };
    }
    for c in carried[n + accumulating.len()..].iter_mut() {
        c.body_output = Some(ops::scale(rec, c.body_input, 0.0)?);
    }
    Ok((iter_vars, carried))
}

fn sum_or_zero(rec: &mut Recorder, parts: &[Variable], like: Variable) -> Result<Variable> {
    match parts {
        [] => ops::scale(rec, like, 0.0),
        [only] => Ok(*only),
        [first, rest @ ..] => {
            let mut total = *first;
            for p in rest {
                total = ops::add(rec, total, *p)?;
            }
            Ok(total)
        }
    }
}
