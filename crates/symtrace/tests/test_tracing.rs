//! End-to-end tracing through the thread's current recorder.

use approx::assert_relative_eq;
use symtrace::{
    BracketOptions, BracketedSearch, LoopBuilder, RecorderConfig, SolverOptions, Tensor, derivative, ops, start_trace,
    stop_trace, with_recorder,
};

#[test]
fn test_trace_loop_and_solve_in_scopes() {
    let _ = env_logger::builder().is_test(true).try_init();
    start_trace(RecorderConfig::default().inline(true)).unwrap();

    // s = x^4 by repeated squaring, then solve y^2 = s for y in [0, 10]
    let (x, s, y) = with_recorder(|rec| {
        let x = rec.input(Tensor::scalar(1.5));
        rec.enter_scope("power")?;
        let mut s = x;
        LoopBuilder::range(0, 2)?.trace(rec, |rec, _| {
            s = ops::mul(rec, s, s)?;
            Ok(())
        })?;
        rec.exit_scope()?;

        rec.enter_scope("root")?;
        let y = rec.create_variable(&[1], None, false)?;
        let y2 = ops::mul(rec, y, y)?;
        let r = ops::sub(rec, y2, s)?;
        let mut solver = BracketedSearch::new(SolverOptions::default().tolerance(1e-12));
        solver.add_state(rec, y, r, BracketOptions::new(0.0, 10.0))?;
        solver.run(rec)?;
        rec.exit_scope()?;
        Ok((x, s, y))
    })
    .unwrap();
    let mut rec = stop_trace().unwrap();

    assert_eq!(rec.value(s).unwrap().item(), 1.5f64.powi(4));
    assert!(rec.variable(y).info.name.starts_with("root."));
    assert_relative_eq!(rec.value(y).unwrap().item(), 2.25, epsilon = 1e-12);

    // y = x^2
    let dx = derivative(&mut rec, y, &[x]).unwrap()[0].unwrap();
    assert_relative_eq!(rec.value(dx).unwrap().item(), 3.0, epsilon = 1e-10);
}
