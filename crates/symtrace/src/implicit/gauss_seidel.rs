//! Nonlinear block Gauss-Seidel.

use std::rc::Rc;

use crate::error::Result;
use crate::node::Variable;
use crate::recorder::Recorder;
use crate::tensor::Tensor;

use super::{
    ImplicitHandle, ImplicitSystem, SolveContext, SolveReport, SolverOptions, SolverStrategy, VariableLike, build,
};

/// Per-state settings for [`GaussSeidel`].
#[derive(Debug, Clone, Default)]
pub struct StateOptions {
    /// Explicit update: the state takes this value instead of `state - residual`.
    pub update: Option<Variable>,
    /// Starting value; defaults to the state's value when declared, or zero.
    pub initial_value: Option<VariableLike>,
    /// Elementwise tolerance; defaults to the solver tolerance.
    pub tolerance: Option<VariableLike>,
}

impl StateOptions {
    pub fn update(mut self, update: Variable) -> Self {
        self.update = Some(update);
        self
    }

    pub fn initial_value(mut self, value: impl Into<VariableLike>) -> Self {
        self.initial_value = Some(value.into());
        self
    }

    pub fn tolerance(mut self, tolerance: impl Into<VariableLike>) -> Self {
        self.tolerance = Some(tolerance.into());
        self
    }
}

#[derive(Debug, Clone)]
struct StateParams {
    initial: VariableLike,
    tolerance: VariableLike,
}

/// Fixed-point iteration updating the states one after another.
///
/// Within one sweep each state is updated from residuals evaluated at the
/// latest values of every state before it:
///
/// ```text
/// x0 <- x0 - r0(x0, x1, ..., xn)
/// x1 <- x1 - r1(x0', x1, ..., xn)
/// ...
/// ```
///
/// # Example
///
/// ```
/// use symtrace::{GaussSeidel, Recorder, SolverOptions, StateOptions, Tensor, ops};
///
/// let mut rec = Recorder::default();
/// let a = rec.input(Tensor::scalar(4.0));
/// let x = rec.create_variable(&[1], Some(Tensor::scalar(0.0)), false).unwrap();
/// // x = a / 2
/// let half = ops::scale(&mut rec, x, 2.0).unwrap();
/// let r = ops::sub(&mut rec, half, a).unwrap();
/// let r = ops::scale(&mut rec, r, 0.5).unwrap();
///
/// let mut solver = GaussSeidel::new(SolverOptions::default());
/// solver.add_state(&rec, x, r, StateOptions::default()).unwrap();
/// let solved = solver.run(&mut rec).unwrap();
/// rec.run_interpretation(rec.root()).unwrap();
/// assert!(solved.report().unwrap().converged);
/// assert!((rec.value(x).unwrap().item() - 2.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone)]
pub struct GaussSeidel {
    name: String,
    options: SolverOptions,
    system: ImplicitSystem,
    params: Vec<StateParams>,
}

impl GaussSeidel {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            name: "gauss_seidel".into(),
            options,
            system: ImplicitSystem::default(),
            params: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Declare that `state` solves `residual == 0`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::ShapeMismatch` if the residual, update, initial
    /// value or tolerance cannot be shaped like the state.
    pub fn add_state(
        &mut self,
        rec: &Recorder,
        state: Variable,
        residual: Variable,
        options: StateOptions,
    ) -> Result<()> {
        let shape = rec.shape(state);
        let initial = match options.initial_value {
            Some(v) => v,
            None => VariableLike::Tensor(rec.value(state).cloned().unwrap_or_else(|| Tensor::zeros(shape))),
        };
        initial.check(rec, shape, "initial value")?;
        let tolerance = options
            .tolerance
            .unwrap_or(VariableLike::Scalar(self.options.tolerance));
        tolerance.check(rec, shape, "tolerance")?;
        self.system.add(rec, state, residual, options.update)?;
        self.params.push(StateParams { initial, tolerance });
        Ok(())
    }

    /// Replace the declared residual computation by one implicit operation.
    pub fn run(self, rec: &mut Recorder) -> Result<ImplicitHandle> {
        let strategy = Rc::new(GaussSeidelStrategy { params: self.params });
        build(rec, &self.name, self.system, strategy, self.options)
    }
}

#[derive(Debug)]
struct GaussSeidelStrategy {
    params: Vec<StateParams>,
}

impl SolverStrategy for GaussSeidelStrategy {
    fn parameters(&self) -> Vec<Variable> {
        self.params
            .iter()
            .flat_map(|p| [p.initial.variable(), p.tolerance.variable()])
            .flatten()
            .collect()
    }

    fn solve(&self, ctx: &mut SolveContext<'_>) -> Result<(Vec<Tensor>, SolveReport)> {
        let mut states = Vec::with_capacity(self.params.len());
        let mut tolerances = Vec::with_capacity(self.params.len());
        for (p, shape) in self.params.iter().zip(ctx.shapes) {
            states.push(ctx.bindings.resolve(&p.initial, shape)?);
            tolerances.push(ctx.bindings.resolve(&p.tolerance, shape)?);
        }

        let mut iterations = 0;
        loop {
            let eval = ctx.evaluate(&states)?;
            if eval.within(&tolerances) || iterations >= ctx.options.max_iter {
                let report = SolveReport {
                    converged: eval.within(&tolerances),
                    iterations,
                    max_residual: eval.max_residual(),
                    bracket_width: None,
                };
                return Ok((states, report));
            }
            for k in 0..states.len() {
                let current = if k == 0 { eval.clone() } else { ctx.evaluate(&states)? };
                states[k] = match &current.updates[k] {
                    Some(update) => update.clone(),
                    None => states[k].zip_with(&current.residuals[k], |x, r| x - r)?,
                };
            }
            iterations += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::ops;
    use crate::recorder::RecorderConfig;
    use approx::assert_relative_eq;

    #[test]
    fn test_coupled_linear_system() {
        // x = 0.5 y + 1, y = 0.25 x + 2
        let mut rec = Recorder::new(RecorderConfig::default().inline(true));
        let x = rec.create_variable(&[1], Some(Tensor::scalar(0.0)), false).unwrap();
        let y = rec.create_variable(&[1], Some(Tensor::scalar(0.0)), false).unwrap();
        let one = rec.constant(Tensor::scalar(1.0));
        let two = rec.constant(Tensor::scalar(2.0));
        let hy = ops::scale(&mut rec, y, 0.5).unwrap();
        let fx = ops::add(&mut rec, hy, one).unwrap();
        let rx = ops::sub(&mut rec, x, fx).unwrap();
        let qx = ops::scale(&mut rec, x, 0.25).unwrap();
        let fy = ops::add(&mut rec, qx, two).unwrap();
        let ry = ops::sub(&mut rec, y, fy).unwrap();

        let mut solver = GaussSeidel::new(SolverOptions::default().tolerance(1e-12));
        solver.add_state(&rec, x, rx, StateOptions::default()).unwrap();
        solver.add_state(&rec, y, ry, StateOptions::default()).unwrap();
        let handle = solver.run(&mut rec).unwrap();

        let report = handle.report().unwrap();
        assert!(report.converged);
        assert!(report.iterations <= 20);
        assert_relative_eq!(rec.value(x).unwrap().item(), 16.0 / 7.0, epsilon = 1e-10);
        assert_relative_eq!(rec.value(y).unwrap().item(), 18.0 / 7.0, epsilon = 1e-10);
        // Residual operations moved into the child graph.
        let graph = handle.kind().residual_graph();
        assert_eq!(rec.graph(graph).operations().count(), 6);
        assert_eq!(rec.graph(rec.root()).operations().count(), 1);
    }

    #[test]
    fn test_explicit_update() {
        // x = cos(x), updated as x <- cos(x)
        let mut rec = Recorder::new(RecorderConfig::default().inline(true));
        let x = rec.create_variable(&[1], Some(Tensor::scalar(1.0)), false).unwrap();
        let c = ops::cos(&mut rec, x).unwrap();
        let r = ops::sub(&mut rec, x, c).unwrap();
        let mut solver = GaussSeidel::new(SolverOptions::default().tolerance(1e-12).max_iter(500));
        solver.add_state(&rec, x, r, StateOptions::default().update(c)).unwrap();
        let handle = solver.run(&mut rec).unwrap();
        assert!(handle.report().unwrap().converged);
        let v = rec.value(x).unwrap().item();
        assert_relative_eq!(v, v.cos(), epsilon = 1e-11);
    }

    #[test]
    fn test_non_convergence_is_reported() {
        // x <- x - (x - 1) * 3 diverges
        let mut rec = Recorder::new(RecorderConfig::default().inline(true));
        let x = rec.create_variable(&[1], Some(Tensor::scalar(0.0)), false).unwrap();
        let one = rec.constant(Tensor::scalar(1.0));
        let d = ops::sub(&mut rec, x, one).unwrap();
        let r = ops::scale(&mut rec, d, 3.0).unwrap();
        let mut solver = GaussSeidel::new(SolverOptions::default().max_iter(5));
        solver
            .add_state(&rec, x, r, StateOptions::default().initial_value(0.5))
            .unwrap();
        let handle = solver.run(&mut rec).unwrap();
        let report = handle.report().unwrap();
        assert!(!report.converged);
        assert_eq!(report.iterations, 5);
        assert!(rec.value(x).is_some());
    }

    #[test]
    fn test_tolerance_shape_is_checked() {
        let mut rec = Recorder::default();
        let x = rec.create_variable(&[2], None, false).unwrap();
        let r = ops::scale(&mut rec, x, 1.0).unwrap();
        let mut solver = GaussSeidel::new(SolverOptions::default());
        let err = solver
            .add_state(&rec, x, r, StateOptions::default().tolerance(Tensor::zeros(&[3])))
            .unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_residual_must_depend_on_state() {
        let mut rec = Recorder::default();
        let x = rec.create_variable(&[1], None, false).unwrap();
        let a = rec.input(Tensor::scalar(1.0));
        let r = ops::scale(&mut rec, a, 2.0).unwrap();
        let mut solver = GaussSeidel::new(SolverOptions::default());
        solver.add_state(&rec, x, r, StateOptions::default()).unwrap();
        assert!(solver.run(&mut rec).is_err());
    }
}
