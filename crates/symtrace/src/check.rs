//! Finite-difference checks of reverse-mode derivatives.

use crate::error::Result;
use crate::node::Variable;
use crate::recorder::Recorder;
use crate::reverse::derivative;
use crate::tensor::Tensor;

/// Reverse-mode and central-difference derivatives of one input.
#[derive(Debug, Clone)]
pub struct DerivativeCheck {
    pub wrt: Variable,
    pub analytic: Tensor,
    pub numerical: Tensor,
    /// `|analytic - numerical| / max(|analytic|, |numerical|)`, or the
    /// absolute difference when both vanish.
    pub relative_error: f64,
}

/// Compare the derivative of `sum(of)` with respect to each of `wrts` against
/// central differences with step `step`.
///
/// The derivative graph is recorded in the active graph, which is then
/// re-interpreted once per perturbed element. Every input value is restored
/// afterwards. A `wrts` entry that `of` does not depend on gets a zero
/// analytic derivative.
///
/// # Errors
///
/// Returns `GraphError::MissingValue` if interpreting the active graph
/// reaches a variable without a value.
pub fn check_derivatives(
    rec: &mut Recorder,
    of: Variable,
    wrts: &[Variable],
    step: f64,
) -> Result<Vec<DerivativeCheck>> {
    let graph = rec.active_graph();
    let derivatives = derivative(rec, of, wrts)?;
    rec.run_interpretation(graph)?;

    let mut checks = Vec::with_capacity(wrts.len());
    for (&wrt, d) in wrts.iter().zip(derivatives) {
        let analytic = match d {
            Some(d) => rec.require_value(d)?.clone(),
            None => Tensor::zeros(rec.shape(wrt)),
        };
        let base = rec.require_value(wrt)?.clone();
        let mut numerical = Tensor::zeros(base.shape());
        for k in 0..base.len() {
            let mut perturbed = |delta: f64| -> Result<f64> {
                let mut shifted = base.clone();
                shifted.data_mut()[k] += delta;
                rec.set_value(wrt, shifted)?;
                rec.run_interpretation(graph)?;
                Ok(rec.require_value(of)?.sum())
            };
            let plus = perturbed(step)?;
            let minus = perturbed(-step)?;
            numerical.data_mut()[k] = (plus - minus) / (2.0 * step);
        }
        rec.set_value(wrt, base)?;
        rec.run_interpretation(graph)?;

        let diff = analytic.zip_with(&numerical, |a, b| a - b)?.norm();
        let scale = analytic.norm().max(numerical.norm());
        checks.push(DerivativeCheck {
            wrt,
            relative_error: if scale > 0.0 { diff / scale } else { diff },
            analytic,
            numerical,
        });
    }
    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;

    #[test]
    fn test_check_elementwise_chain() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::from_vec(vec![0.3, -0.7, 1.1], &[3]).unwrap());
        let y = rec.input(Tensor::from_vec(vec![1.5, 2.0, 0.5], &[3]).unwrap());
        let s = ops::sin(&mut rec, x).unwrap();
        let e = ops::exp(&mut rec, y).unwrap();
        let p = ops::mul(&mut rec, s, e).unwrap();
        let q = ops::div(&mut rec, p, y).unwrap();
        let checks = check_derivatives(&mut rec, q, &[x, y], 1e-6).unwrap();
        for c in &checks {
            assert!(c.relative_error < 1e-7, "{:?}", c);
        }
        assert_eq!(rec.value(x).unwrap().data(), &[0.3, -0.7, 1.1]);
    }

    #[test]
    fn test_check_disconnected_input() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::scalar(1.0));
        let unused = rec.input(Tensor::scalar(2.0));
        let y = ops::cos(&mut rec, x).unwrap();
        let checks = check_derivatives(&mut rec, y, &[unused], 1e-6).unwrap();
        assert_eq!(checks[0].analytic.item(), 0.0);
        assert_eq!(checks[0].relative_error, 0.0);
    }
}
