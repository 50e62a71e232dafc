//! Leaf operations.
//!
//! Each builder records one operation in the active graph of `rec` and returns
//! its output variable. Derivative rules are themselves built from these
//! builders, so derivatives can be differentiated again.

mod elementwise;
mod index;
mod reduce;

pub use elementwise::{Binary, BinaryFn, Scale, Unary, UnaryFn};
pub use index::{Index, Scatter};
pub use reduce::{Expand, Sum};

use std::rc::Rc;

use crate::error::{GraphError, Result};
use crate::node::Variable;
use crate::recorder::Recorder;
use crate::tensor::{Shape, Tensor, shape_of};

fn binary(rec: &mut Recorder, func: BinaryFn, x: Variable, y: Variable) -> Result<Variable> {
    let shape = broadcast_shape(rec.shape(x), rec.shape(y))?;
    rec.apply(Rc::new(Binary { func }), &[x, y], &shape)
}

fn unary(rec: &mut Recorder, func: UnaryFn, x: Variable) -> Result<Variable> {
    let shape = shape_of(rec.shape(x));
    rec.apply(Rc::new(Unary { func }), &[x], &shape)
}

pub fn add(rec: &mut Recorder, x: Variable, y: Variable) -> Result<Variable> {
    binary(rec, BinaryFn::Add, x, y)
}

pub fn sub(rec: &mut Recorder, x: Variable, y: Variable) -> Result<Variable> {
    binary(rec, BinaryFn::Sub, x, y)
}

pub fn mul(rec: &mut Recorder, x: Variable, y: Variable) -> Result<Variable> {
    binary(rec, BinaryFn::Mul, x, y)
}

pub fn div(rec: &mut Recorder, x: Variable, y: Variable) -> Result<Variable> {
    binary(rec, BinaryFn::Div, x, y)
}

/// Multiply by a constant factor.
pub fn scale(rec: &mut Recorder, x: Variable, factor: f64) -> Result<Variable> {
    let shape = shape_of(rec.shape(x));
    rec.apply(Rc::new(Scale { factor }), &[x], &shape)
}

pub fn neg(rec: &mut Recorder, x: Variable) -> Result<Variable> {
    scale(rec, x, -1.0)
}

pub fn sin(rec: &mut Recorder, x: Variable) -> Result<Variable> {
    unary(rec, UnaryFn::Sin, x)
}

pub fn cos(rec: &mut Recorder, x: Variable) -> Result<Variable> {
    unary(rec, UnaryFn::Cos, x)
}

pub fn exp(rec: &mut Recorder, x: Variable) -> Result<Variable> {
    unary(rec, UnaryFn::Exp, x)
}

pub fn log(rec: &mut Recorder, x: Variable) -> Result<Variable> {
    unary(rec, UnaryFn::Log, x)
}

/// Sum every element into a shape `(1,)` variable.
pub fn sum(rec: &mut Recorder, x: Variable) -> Result<Variable> {
    rec.apply(Rc::new(Sum), &[x], &[1])
}

/// Broadcast a shape `(1,)` variable to `shape`.
pub fn expand(rec: &mut Recorder, x: Variable, shape: &[usize]) -> Result<Variable> {
    if rec.shape(x) != [1] {
        return Err(GraphError::shape_mismatch("expand", &[1], rec.shape(x)));
    }
    rec.apply(
        Rc::new(Expand {
            shape: shape_of(shape),
        }),
        &[x],
        shape,
    )
}

/// Select slice `i` of `x` along its leading axis; `i` holds the position.
pub fn index(rec: &mut Recorder, x: Variable, i: Variable) -> Result<Variable> {
    if rec.shape(x).is_empty() {
        return Err(GraphError::InvalidArgument("cannot index a rank-0 variable".into()));
    }
    let shape = Tensor::slice_shape(rec.shape(x));
    rec.apply(Rc::new(Index), &[x, i], &shape)
}

/// Place `v` at slice `i` of a zero tensor of `shape`.
pub fn scatter(rec: &mut Recorder, v: Variable, i: Variable, shape: &[usize]) -> Result<Variable> {
    let slot = Tensor::slice_shape(shape);
    if rec.shape(v) != slot.as_slice() {
        return Err(GraphError::shape_mismatch("scatter", &slot, rec.shape(v)));
    }
    rec.apply(
        Rc::new(Scatter {
            shape: shape_of(shape),
        }),
        &[v, i],
        shape,
    )
}

/// A zero constant shaped like `x`.
pub fn zeros_like(rec: &mut Recorder, x: Variable) -> Variable {
    let t = Tensor::zeros(rec.shape(x));
    rec.constant(t)
}

/// Reduce a broadcast contribution back to `target`.
pub(crate) fn reduce_to(rec: &mut Recorder, c: Variable, target: &[usize]) -> Result<Variable> {
    if rec.shape(c) == target {
        Ok(c)
    } else if target == [1] {
        sum(rec, c)
    } else {
        Err(GraphError::shape_mismatch("cotangent", target, rec.shape(c)))
    }
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Shape> {
    if a == b || b == [1] {
        Ok(shape_of(a))
    } else if a == [1] {
        Ok(shape_of(b))
    } else {
        Err(GraphError::shape_mismatch("elementwise operands", a, b))
    }
}

/// Position encoded in an index value.
pub(crate) fn position(i: &Tensor) -> Result<usize> {
    let p = i.item().round();
    if p < 0.0 || !p.is_finite() {
        return Err(GraphError::InvalidArgument(format!("invalid index value {}", i.item())));
    }
    Ok(p as usize)
}
