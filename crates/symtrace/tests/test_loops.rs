//! Integration tests for traced loops.
//!
//! Covers feedback discovery, sequential vs lowered execution, and reverse
//! mode through (nested) loops.

use approx::assert_relative_eq;
use rand::{Rng, SeedableRng};
use symtrace::{
    Backend, GenericBackend, LoopBuilder, LoopOptions, Recorder, RecorderConfig, Result, Tensor, Variable,
    derivative, ops,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `b <- (b + c[i]) * 2` over `length` iterations.
fn doubling_loop(rec: &mut Recorder, length: usize) -> Result<(Variable, Variable, Variable)> {
    let c = rec.input(Tensor::ones(&[length]));
    let b0 = rec.input(Tensor::scalar(0.0));
    let mut b = b0;
    LoopBuilder::range(0, length)?.trace(rec, |rec, i| {
        let ci = ops::index(rec, c, i[0])?;
        let s = ops::add(rec, b, ci)?;
        b = ops::scale(rec, s, 2.0)?;
        Ok(())
    })?;
    Ok((c, b0, b))
}

#[test]
fn test_feedback_regression() {
    init_logger();
    let mut rec = Recorder::default();
    let (_, _, b) = doubling_loop(&mut rec, 10).unwrap();
    rec.run_interpretation(rec.root()).unwrap();

    let mut expected = 0.0f64;
    for _ in 0..10 {
        expected = (expected + 1.0) * 2.0;
    }
    assert_eq!(rec.value(b).unwrap().item(), expected);
}

#[test]
fn test_inline_matches_deferred_interpretation() {
    let mut deferred = Recorder::default();
    let (_, _, b_deferred) = doubling_loop(&mut deferred, 10).unwrap();
    deferred.run_interpretation(deferred.root()).unwrap();

    let mut inline = Recorder::new(RecorderConfig::default().inline(true));
    let (_, _, b_inline) = doubling_loop(&mut inline, 10).unwrap();
    assert_eq!(
        inline.value(b_inline).unwrap(),
        deferred.value(b_deferred).unwrap()
    );
}

#[test]
fn test_loop_sum_derivative_is_length() {
    init_logger();
    for length in [1, 2, 7] {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::scalar(0.37));
        let mut acc = rec.input(Tensor::scalar(0.0));
        LoopBuilder::range(0, length)
            .unwrap()
            .trace(&mut rec, |rec, _| {
                acc = ops::add(rec, acc, x)?;
                Ok(())
            })
            .unwrap();
        let dx = derivative(&mut rec, acc, &[x]).unwrap()[0].unwrap();
        rec.run_interpretation(rec.root()).unwrap();
        assert_eq!(rec.value(dx).unwrap().item(), length as f64);
    }
}

#[test]
fn test_two_pass_trace_structure() {
    for length in [2, 3, 8] {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::from_vec(vec![0.1, 0.2, 0.3], &[3]).unwrap());
        let b0 = rec.input(Tensor::zeros(&[3]));
        let mut b = b0;
        let mut passes: Vec<(Variable, Variable)> = Vec::new();
        let lp = LoopBuilder::range(0, length)
            .unwrap()
            .trace(&mut rec, |rec, _| {
                let s = ops::sin(rec, b)?;
                b = ops::add(rec, s, x)?;
                passes.push((s, b));
                Ok(())
            })
            .unwrap();

        assert_eq!(passes.len(), 2);
        let ((s1, b1), (s2, b2)) = (passes[0], passes[1]);
        assert_eq!(b, b2);

        // b1 is read by the second pass, so it becomes the carried input
        let f = lp.feedbacks();
        assert_eq!(f.len(), 1);
        assert_eq!((f[0].body_input, f[0].external_initial, f[0].body_output), (b1, b0, b2));
        assert_eq!(rec.shape(f[0].stack), &[length, 3]);

        let body = rec.graph(lp.body());
        assert_eq!(body.boundary_inputs(), &[x]);
        assert!(!body.contains(s1));
        assert!(!body.contains(b0));
        let mut vars: Vec<Variable> = body.variables().collect();
        vars.sort();
        let mut expected = vec![x, lp.kind().iteration_variables()[0], b1, s2, b2];
        expected.sort();
        assert_eq!(vars, expected);

        let names: Vec<&str> = body
            .operations()
            .map(|op| rec.operation(op).kind().name())
            .collect();
        assert_eq!(names, ["sin", "add"]);
        assert_eq!(rec.operation(lp.op()).inputs(), &[x, b0]);
        assert_eq!(rec.operation(lp.op()).outputs(), &[s2, b2, f[0].stack]);
    }
}

#[test]
fn test_sequential_and_lowered_loop_agree() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(11);
    let length = 6;
    let data: Vec<f64> = (0..length * 2).map(|_| rng.random_range(-1.0..1.0)).collect();

    let mut rec = Recorder::default();
    let c = rec.input(Tensor::from_vec(data, &[length, 2]).unwrap());
    let b0 = rec.input(Tensor::from_vec(vec![0.5, -0.25], &[2]).unwrap());
    let mut b = b0;
    let mut y = b0;
    let lp = LoopBuilder::range(0, length)
        .unwrap()
        .options(LoopOptions::default().stack_all(true))
        .trace(&mut rec, |rec, i| {
            let ci = ops::index(rec, c, i[0])?;
            let s = ops::cos(rec, b)?;
            b = ops::mul(rec, s, ci)?;
            y = ops::exp(rec, ci)?;
            Ok(())
        })
        .unwrap();
    let b_stack = lp.stacked_output(&mut rec, b).unwrap();
    let y_stack = lp.stacked_output(&mut rec, y).unwrap();
    let root = rec.root();
    rec.run_interpretation(root).unwrap();

    let outputs = [b, y, b_stack, y_stack];
    let f = GenericBackend.compile(&rec, root, &outputs, &[c, b0]).unwrap();
    let lowered = f
        .call(&[rec.value(c).unwrap().clone(), rec.value(b0).unwrap().clone()])
        .unwrap();
    for (v, got) in outputs.iter().zip(&lowered) {
        let want = rec.value(*v).unwrap();
        assert_eq!(got.shape(), want.shape());
        for (g, w) in got.data().iter().zip(want.data()) {
            assert_relative_eq!(*g, *w, epsilon = 1e-14);
        }
    }
    assert_eq!(rec.shape(b_stack), &[length, 2]);
}

#[test]
fn test_interpretation_is_idempotent() {
    let mut rec = Recorder::default();
    let (_, _, b) = doubling_loop(&mut rec, 5).unwrap();
    let root = rec.root();
    rec.run_interpretation(root).unwrap();
    let first = rec.value(b).unwrap().clone();
    rec.run_interpretation(root).unwrap();
    assert_eq!(rec.value(b).unwrap(), &first);
}

#[test]
fn test_nested_loops() {
    init_logger();
    let mut rec = Recorder::default();
    let x = rec.input(Tensor::scalar(0.9));
    let mut b = rec.input(Tensor::scalar(1.0));
    LoopBuilder::range(0, 3)
        .unwrap()
        .trace(&mut rec, |rec, _| {
            LoopBuilder::range(0, 2)?.trace(rec, |rec, _| {
                b = ops::mul(rec, b, x)?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
    let dx = derivative(&mut rec, b, &[x]).unwrap()[0].unwrap();
    rec.run_interpretation(rec.root()).unwrap();

    // b = x^6
    assert_relative_eq!(rec.value(b).unwrap().item(), 0.9f64.powi(6), epsilon = 1e-14);
    assert_relative_eq!(rec.value(dx).unwrap().item(), 6.0 * 0.9f64.powi(5), epsilon = 1e-13);
}

#[test]
fn test_second_derivative_through_loop() {
    let mut rec = Recorder::default();
    let x = rec.input(Tensor::scalar(1.3));
    let mut b = rec.input(Tensor::scalar(1.0));
    LoopBuilder::range(0, 3)
        .unwrap()
        .trace(&mut rec, |rec, _| {
            b = ops::mul(rec, b, x)?;
            Ok(())
        })
        .unwrap();
    let dx = derivative(&mut rec, b, &[x]).unwrap()[0].unwrap();
    let dxx = derivative(&mut rec, dx, &[x]).unwrap()[0].unwrap();
    rec.run_interpretation(rec.root()).unwrap();

    // b = x^3
    assert_relative_eq!(rec.value(dx).unwrap().item(), 3.0 * 1.3 * 1.3, epsilon = 1e-13);
    assert_relative_eq!(rec.value(dxx).unwrap().item(), 6.0 * 1.3, epsilon = 1e-12);
}

#[test]
fn test_gradient_of_stacked_history() {
    // sum of the history of b <- b * x starting from 1: 1 + x + x^2
    let mut rec = Recorder::new(RecorderConfig::default().inline(true));
    let x = rec.input(Tensor::scalar(2.0));
    let mut b = rec.input(Tensor::scalar(1.0));
    let lp = LoopBuilder::range(0, 3)
        .unwrap()
        .trace(&mut rec, |rec, _| {
            b = ops::mul(rec, b, x)?;
            Ok(())
        })
        .unwrap();
    let stack = lp.stacked_output(&mut rec, b).unwrap();
    let total = ops::sum(&mut rec, stack).unwrap();
    assert_eq!(rec.value(total).unwrap().item(), 7.0);
    let dx = derivative(&mut rec, total, &[x]).unwrap()[0].unwrap();
    assert_eq!(rec.value(dx).unwrap().item(), 5.0);
}

/// `sum` of the lazily stacked history of `b <- b * x` from `b = 1`, and its
/// derivative with respect to `x`.
fn lazy_history_sum(rec: &mut Recorder) -> Result<(Variable, Variable, Variable, Variable)> {
    let x = rec.input(Tensor::scalar(2.0));
    let mut b = rec.input(Tensor::scalar(1.0));
    let lp = LoopBuilder::range(0, 3)?
        .options(LoopOptions::default().inline_lazy_stack(true))
        .trace(rec, |rec, _| {
            b = ops::mul(rec, b, x)?;
            Ok(())
        })?;
    let stack = lp.stacked_output(rec, b)?;
    let total = ops::sum(rec, stack)?;
    let dx = derivative(rec, total, &[x])?[0].unwrap();
    Ok((x, stack, total, dx))
}

#[test]
fn test_lazy_history_in_deferred_graph() {
    let mut rec = Recorder::default();
    let (x, stack, total, dx) = lazy_history_sum(&mut rec).unwrap();
    assert!(rec.value(stack).is_none());

    let root = rec.root();
    for _ in 0..2 {
        rec.run_interpretation(root).unwrap();
        assert_eq!(rec.value(stack).unwrap().data(), &[1.0, 2.0, 4.0]);
        assert_eq!(rec.value(total).unwrap().item(), 7.0);
        // d/dx (1 + x + x^2)
        assert_eq!(rec.value(dx).unwrap().item(), 5.0);
    }

    rec.set_value(x, Tensor::scalar(3.0)).unwrap();
    rec.run_interpretation(root).unwrap();
    assert_eq!(rec.value(total).unwrap().item(), 13.0);
    assert_eq!(rec.value(dx).unwrap().item(), 7.0);
}

#[test]
fn test_lazy_history_inline_then_reinterpreted() {
    let mut rec = Recorder::new(RecorderConfig::default().inline(true));
    let (x, stack, total, dx) = lazy_history_sum(&mut rec).unwrap();
    assert_eq!(rec.value(stack).unwrap().data(), &[1.0, 2.0, 4.0]);
    assert_eq!(rec.value(total).unwrap().item(), 7.0);
    assert_eq!(rec.value(dx).unwrap().item(), 5.0);

    let root = rec.root();
    rec.run_interpretation(root).unwrap();
    assert_eq!(rec.value(stack).unwrap().data(), &[1.0, 2.0, 4.0]);
    assert_eq!(rec.value(total).unwrap().item(), 7.0);

    rec.set_value(x, Tensor::scalar(0.5)).unwrap();
    rec.run_interpretation(root).unwrap();
    assert_eq!(rec.value(stack).unwrap().data(), &[1.0, 0.5, 0.25]);
    assert_eq!(rec.value(total).unwrap().item(), 1.75);
    assert_eq!(rec.value(dx).unwrap().item(), 2.0);
}
