//! Reverse-mode differentiation over a recorded graph.

use std::collections::HashSet;
use std::rc::Rc;

use log::trace;

use crate::cotangent::Cotangents;
use crate::error::{GraphError, Result};
use crate::node::{GraphId, Variable};
use crate::recorder::Recorder;
use crate::tensor::Tensor;

/// Propagate seed cotangents backwards through `graph`.
///
/// `seeds` pairs each seeded variable with the variable holding its
/// cotangent. Derivative operations are recorded in the active graph of `rec`,
/// which may differ from `graph`. Operations are visited in reverse
/// topological order of `graph`, so every consumer of a variable contributes
/// before the variable's own producer propagates further.
///
/// Only variables that depend on some `wrts` entry and feed some seed receive
/// cotangents; any `wrts` entry left unreached is absent from the result.
///
/// # Errors
///
/// Returns `GraphError::ShapeMismatch` if a seed is not shaped like its
/// variable, or any error raised by an operation's derivative rule.
pub fn vjp(
    rec: &mut Recorder,
    seeds: &[(Variable, Variable)],
    wrts: &[Variable],
    graph: GraphId,
) -> Result<Cotangents> {
    let order = rec.graph(graph).operation_order()?;

    let mut descendants: HashSet<Variable> = wrts.iter().copied().collect();
    for op in order.iter() {
        let data = rec.operation(*op);
        if data.inputs().iter().any(|v| descendants.contains(v)) {
            descendants.extend(data.outputs().iter().copied());
        }
    }
    let mut ancestors: HashSet<Variable> = seeds.iter().map(|(v, _)| *v).collect();
    for op in order.iter().rev() {
        let data = rec.operation(*op);
        if data.outputs().iter().any(|v| ancestors.contains(v)) {
            ancestors.extend(data.inputs().iter().copied());
        }
    }
    let wanted = descendants.intersection(&ancestors).copied().collect();
    let mut cotangents = Cotangents::new(wanted);

    for &(v, seed) in seeds {
        if rec.shape(v) != rec.shape(seed) {
            return Err(GraphError::shape_mismatch(
                format!("seed of {}", rec.variable(v).info.name),
                rec.shape(v),
                rec.shape(seed),
            ));
        }
        cotangents.accumulate(rec, v, seed)?;
    }

    for op in order.iter().rev() {
        let (kind, node) = {
            let data = rec.operation(*op);
            (Rc::clone(data.kind()), data.node(*op))
        };
        if !node.outputs.iter().any(|v| cotangents.check(*v))
            || !node.inputs.iter().any(|v| cotangents.wants(*v))
        {
            continue;
        }
        trace!("vjp {}", rec.operation(*op).info.name);
        kind.vjp(rec, &node, &mut cotangents)?;
    }
    Ok(cotangents)
}

/// Cotangents of `wrts` in the active graph, `None` for unreached entries.
pub fn differentiate(
    rec: &mut Recorder,
    seeds: &[(Variable, Variable)],
    wrts: &[Variable],
) -> Result<Vec<Option<Variable>>> {
    let graph = rec.active_graph();
    let cotangents = vjp(rec, seeds, wrts, graph)?;
    Ok(wrts.iter().map(|w| cotangents.get(*w)).collect())
}

/// Derivative of the sum of `of` with respect to each of `wrts`.
///
/// # Example
///
/// ```
/// use symtrace::{Recorder, Tensor, derivative, ops};
///
/// let mut rec = Recorder::default();
/// let x = rec.input(Tensor::scalar(3.0));
/// let y = ops::mul(&mut rec, x, x).unwrap();
/// let dx = derivative(&mut rec, y, &[x]).unwrap()[0].unwrap();
/// rec.run_interpretation(rec.root()).unwrap();
/// assert_eq!(rec.value(dx).unwrap().item(), 6.0);
/// ```
pub fn derivative(rec: &mut Recorder, of: Variable, wrts: &[Variable]) -> Result<Vec<Option<Variable>>> {
    let seed = rec.constant(Tensor::ones(rec.shape(of)));
    differentiate(rec, &[(of, seed)], wrts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use approx::assert_relative_eq;

    #[test]
    fn test_chain_rule() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::scalar(0.5));
        let s = ops::sin(&mut rec, x).unwrap();
        let y = ops::mul(&mut rec, s, x).unwrap();
        let dx = derivative(&mut rec, y, &[x]).unwrap()[0].unwrap();
        rec.run_interpretation(rec.root()).unwrap();
        let expected = 0.5_f64.cos() * 0.5 + 0.5_f64.sin();
        assert_relative_eq!(rec.value(dx).unwrap().item(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_disconnected_wrt_is_none() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::scalar(1.0));
        let z = rec.input(Tensor::scalar(1.0));
        let y = ops::exp(&mut rec, x).unwrap();
        let d = derivative(&mut rec, y, &[x, z]).unwrap();
        assert!(d[0].is_some());
        assert!(d[1].is_none());
    }

    #[test]
    fn test_fan_out_accumulates() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap());
        let a = ops::scale(&mut rec, x, 3.0).unwrap();
        let b = ops::mul(&mut rec, x, x).unwrap();
        let c = ops::add(&mut rec, a, b).unwrap();
        let y = ops::sum(&mut rec, c).unwrap();
        let dx = derivative(&mut rec, y, &[x]).unwrap()[0].unwrap();
        rec.run_interpretation(rec.root()).unwrap();
        assert_eq!(rec.value(dx).unwrap().data(), &[5.0, 7.0]);
    }

    #[test]
    fn test_broadcast_operand_is_reduced() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap());
        let k = rec.input(Tensor::scalar(2.0));
        let y = ops::mul(&mut rec, x, k).unwrap();
        let s = ops::sum(&mut rec, y).unwrap();
        let d = derivative(&mut rec, s, &[x, k]).unwrap();
        rec.run_interpretation(rec.root()).unwrap();
        assert_eq!(rec.value(d[0].unwrap()).unwrap().data(), &[2.0, 2.0, 2.0]);
        assert_eq!(rec.value(d[1].unwrap()).unwrap().item(), 6.0);
    }

    #[test]
    fn test_second_derivative() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::scalar(0.3));
        let y = ops::sin(&mut rec, x).unwrap();
        let dx = derivative(&mut rec, y, &[x]).unwrap()[0].unwrap();
        let ddx = derivative(&mut rec, dx, &[x]).unwrap()[0].unwrap();
        rec.run_interpretation(rec.root()).unwrap();
        assert_relative_eq!(rec.value(ddx).unwrap().item(), -(0.3_f64.sin()), epsilon = 1e-12);
    }

    #[test]
    fn test_seed_shape_is_checked() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::zeros(&[2]));
        let y = ops::sin(&mut rec, x).unwrap();
        let seed = rec.constant(Tensor::scalar(1.0));
        assert!(matches!(
            differentiate(&mut rec, &[(y, seed)], &[x]),
            Err(GraphError::ShapeMismatch { .. })
        ));
    }
}
