//! Elementwise bisection over brackets.

use std::rc::Rc;

use crate::error::{GraphError, Result};
use crate::node::Variable;
use crate::recorder::Recorder;
use crate::tensor::{Shape, Tensor};

use super::{
    ImplicitHandle, ImplicitSystem, SolveContext, SolveReport, SolverOptions, SolverStrategy, VariableLike, build,
};

/// Bracket and tolerance of one state.
#[derive(Debug, Clone)]
pub struct BracketOptions {
    pub lower: VariableLike,
    pub upper: VariableLike,
    /// Elementwise tolerance; defaults to the solver tolerance.
    pub tolerance: Option<VariableLike>,
}

impl BracketOptions {
    pub fn new(lower: impl Into<VariableLike>, upper: impl Into<VariableLike>) -> Self {
        Self {
            lower: lower.into(),
            upper: upper.into(),
            tolerance: None,
        }
    }

    pub fn tolerance(mut self, tolerance: impl Into<VariableLike>) -> Self {
        self.tolerance = Some(tolerance.into());
        self
    }
}

#[derive(Debug, Clone)]
struct StateParams {
    lower: VariableLike,
    upper: VariableLike,
    tolerance: VariableLike,
}

/// Bisection on every state element at once.
///
/// The sign of the residual at the lower bracket is recorded once; each
/// iteration evaluates all residuals at the bracket midpoints and moves,
/// per element, the bound whose residual sign the midpoint shares. The
/// returned states are the last midpoints.
#[derive(Debug, Clone)]
pub struct BracketedSearch {
    name: String,
    options: SolverOptions,
    system: ImplicitSystem,
    params: Vec<StateParams>,
}

impl BracketedSearch {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            name: "bracketed_search".into(),
            options,
            system: ImplicitSystem::default(),
            params: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Declare that `state` solves `residual == 0` inside `bracket`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::ShapeMismatch` if a bracket end or the tolerance
    /// is neither `(1,)` nor shaped like the state.
    pub fn add_state(
        &mut self,
        rec: &Recorder,
        state: Variable,
        residual: Variable,
        bracket: BracketOptions,
    ) -> Result<()> {
        let shape = rec.shape(state);
        bracket.lower.check(rec, shape, "lower bracket")?;
        bracket.upper.check(rec, shape, "upper bracket")?;
        let tolerance = bracket
            .tolerance
            .unwrap_or(VariableLike::Scalar(self.options.tolerance));
        tolerance.check(rec, shape, "tolerance")?;
        self.system.add(rec, state, residual, None)?;
        self.params.push(StateParams {
            lower: bracket.lower,
            upper: bracket.upper,
            tolerance,
        });
        Ok(())
    }

    /// Replace the declared residual computation by one implicit operation.
    pub fn run(self, rec: &mut Recorder) -> Result<ImplicitHandle> {
        let strategy = Rc::new(BisectionStrategy { params: self.params });
        build(rec, &self.name, self.system, strategy, self.options)
    }
}

#[derive(Debug)]
struct BisectionStrategy {
    params: Vec<StateParams>,
}

impl BisectionStrategy {
    fn flatten(
        &self,
        ctx: &SolveContext<'_>,
        pick: impl Fn(&StateParams) -> &VariableLike,
    ) -> Result<Vec<f64>> {
        let mut out = Vec::new();
        for (p, shape) in self.params.iter().zip(ctx.shapes) {
            out.extend_from_slice(ctx.bindings.resolve(pick(p), shape)?.data());
        }
        Ok(out)
    }
}

fn unflatten(x: &[f64], shapes: &[Shape]) -> Result<Vec<Tensor>> {
    Tensor::split_flat(x, shapes)
}

impl SolverStrategy for BisectionStrategy {
    fn parameters(&self) -> Vec<Variable> {
        self.params
            .iter()
            .flat_map(|p| [p.lower.variable(), p.upper.variable(), p.tolerance.variable()])
            .flatten()
            .collect()
    }

    fn solve(&self, ctx: &mut SolveContext<'_>) -> Result<(Vec<Tensor>, SolveReport)> {
        let mut lower = self.flatten(ctx, |p| &p.lower)?;
        let mut upper = self.flatten(ctx, |p| &p.upper)?;
        let tolerance = self.flatten(ctx, |p| &p.tolerance)?;
        if let Some(k) = (0..lower.len()).find(|&k| lower[k] > upper[k]) {
            return Err(GraphError::InvalidArgument(format!(
                "bracket element {k} is inverted: [{}, {}]",
                lower[k], upper[k]
            )));
        }
        let shapes = ctx.shapes.to_vec();

        let at_lower = ctx.evaluate(&unflatten(&lower, &shapes)?)?;
        let negative_at_lower: Vec<bool> = Tensor::concat_flat(&at_lower.residuals)
            .iter()
            .map(|r| *r < 0.0)
            .collect();

        let mut iterations = 0;
        loop {
            let mid: Vec<f64> = lower.iter().zip(&upper).map(|(l, u)| 0.5 * (l + u)).collect();
            let states = unflatten(&mid, &shapes)?;
            let eval = ctx.evaluate(&states)?;
            let residual = Tensor::concat_flat(&eval.residuals);
            for k in 0..mid.len() {
                if (residual[k] < 0.0) == negative_at_lower[k] {
                    lower[k] = mid[k];
                } else {
                    upper[k] = mid[k];
                }
            }
            iterations += 1;

            let converged = residual.iter().zip(&tolerance).all(|(r, t)| r.abs() <= *t);
            if converged || iterations >= ctx.options.max_iter {
                let width = lower
                    .iter()
                    .zip(&upper)
                    .map(|(l, u)| u - l)
                    .fold(0.0, f64::max);
                let report = SolveReport {
                    converged,
                    iterations,
                    max_residual: eval.max_residual(),
                    bracket_width: Some(width),
                };
                return Ok((states, report));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use crate::recorder::RecorderConfig;
    use approx::assert_relative_eq;

    #[test]
    fn test_bisection_halves_bracket() {
        // r = 0.5 (x - 0.3) on [0, 1]
        let mut rec = Recorder::new(RecorderConfig::default().inline(true));
        let x = rec.create_variable(&[1], None, false).unwrap();
        let c = rec.constant(Tensor::scalar(0.3));
        let d = ops::sub(&mut rec, x, c).unwrap();
        let r = ops::scale(&mut rec, d, 0.5).unwrap();

        let tol = 1e-8;
        let max_iter = 7;
        let mut solver = BracketedSearch::new(SolverOptions::default().tolerance(tol).max_iter(max_iter));
        solver.add_state(&rec, x, r, BracketOptions::new(0.0, 1.0)).unwrap();
        let handle = solver.run(&mut rec).unwrap();

        let report = handle.report().unwrap();
        assert!(!report.converged);
        assert_eq!(report.iterations, max_iter);
        assert_relative_eq!(report.bracket_width.unwrap(), 1.0 / 2f64.powi(max_iter as i32), epsilon = 1e-15);
    }

    #[test]
    fn test_bisection_iteration_bound() {
        let mut rec = Recorder::new(RecorderConfig::default().inline(true));
        let x = rec.create_variable(&[3], None, false).unwrap();
        let roots = rec.constant(Tensor::from_vec(vec![-1.3, 0.25, 2.9], &[3]).unwrap());
        let r = ops::sub(&mut rec, x, roots).unwrap();

        let (lo, hi, tol) = (-4.0, 4.0, 1e-9);
        let mut solver = BracketedSearch::new(SolverOptions::default().tolerance(tol));
        solver.add_state(&rec, x, r, BracketOptions::new(lo, hi)).unwrap();
        let handle = solver.run(&mut rec).unwrap();

        let report = handle.report().unwrap();
        assert!(report.converged);
        let bound = ((hi - lo) / tol).log2().ceil() as usize;
        assert!(report.iterations <= bound, "{} > {bound}", report.iterations);
        for (got, want) in rec.value(x).unwrap().data().iter().zip([-1.3, 0.25, 2.9]) {
            assert!((got - want).abs() <= tol);
        }
    }

    #[test]
    fn test_decreasing_residual() {
        // r = 2 - exp(x), root ln 2
        let mut rec = Recorder::new(RecorderConfig::default().inline(true));
        let x = rec.create_variable(&[1], None, false).unwrap();
        let two = rec.constant(Tensor::scalar(2.0));
        let e = ops::exp(&mut rec, x).unwrap();
        let r = ops::sub(&mut rec, two, e).unwrap();
        let lower = rec.input(Tensor::scalar(0.0));
        let mut solver = BracketedSearch::new(SolverOptions::default().tolerance(1e-12));
        solver
            .add_state(&rec, x, r, BracketOptions::new(lower, 3.0))
            .unwrap();
        let handle = solver.run(&mut rec).unwrap();
        assert!(handle.report().unwrap().converged);
        assert!(rec.operation(handle.op()).inputs().contains(&lower));
        assert_relative_eq!(rec.value(x).unwrap().item(), 2f64.ln(), epsilon = 1e-11);
    }

    #[test]
    fn test_bracket_shape_is_checked() {
        let mut rec = Recorder::default();
        let x = rec.create_variable(&[2], None, false).unwrap();
        let r = ops::scale(&mut rec, x, 1.0).unwrap();
        let mut solver = BracketedSearch::new(SolverOptions::default());
        let bad = Tensor::zeros(&[3]);
        assert!(solver.add_state(&rec, x, r, BracketOptions::new(bad, 1.0)).is_err());
    }
}
