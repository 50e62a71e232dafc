//! Elementwise arithmetic and transcendental functions.

use crate::cotangent::Cotangents;
use crate::error::Result;
use crate::operation::{OpNode, Operation};
use crate::recorder::Recorder;
use crate::tensor::Tensor;

use super::{cos, div, mul, neg, reduce_to, scale, sin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFn {
    Add,
    Sub,
    Mul,
    Div,
}

/// Binary elementwise operation; a shape `(1,)` operand broadcasts.
#[derive(Debug, Clone)]
pub struct Binary {
    pub func: BinaryFn,
}

impl Operation for Binary {
    fn name(&self) -> &str {
        match self.func {
            BinaryFn::Add => "add",
            BinaryFn::Sub => "sub",
            BinaryFn::Mul => "mul",
            BinaryFn::Div => "div",
        }
    }

    fn compute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let (x, y) = (&inputs[0], &inputs[1]);
        let out = match self.func {
            BinaryFn::Add => x.zip_with(y, |a, b| a + b)?,
            BinaryFn::Sub => x.zip_with(y, |a, b| a - b)?,
            BinaryFn::Mul => x.zip_with(y, |a, b| a * b)?,
            BinaryFn::Div => x.zip_with(y, |a, b| a / b)?,
        };
        Ok(vec![out])
    }

    fn vjp(&self, rec: &mut Recorder, node: &OpNode, cotangents: &mut Cotangents) -> Result<()> {
        let Some(g) = cotangents.get(node.outputs[0]) else {
            return Ok(());
        };
        let (x, y) = (node.inputs[0], node.inputs[1]);
        if cotangents.wants(x) {
            let c = match self.func {
                BinaryFn::Add | BinaryFn::Sub => g,
                BinaryFn::Mul => mul(rec, g, y)?,
                BinaryFn::Div => div(rec, g, y)?,
            };
            let shape = rec.shape(x).to_vec();
            let c = reduce_to(rec, c, &shape)?;
            cotangents.accumulate(rec, x, c)?;
        }
        if cotangents.wants(y) {
            let c = match self.func {
                BinaryFn::Add => g,
                BinaryFn::Sub => neg(rec, g)?,
                BinaryFn::Mul => mul(rec, g, x)?,
                // d(x/y)/dy = -(x/y)/y
                BinaryFn::Div => {
                    let q = div(rec, node.outputs[0], y)?;
                    let gq = mul(rec, g, q)?;
                    neg(rec, gq)?
                }
            };
            let shape = rec.shape(y).to_vec();
            let c = reduce_to(rec, c, &shape)?;
            cotangents.accumulate(rec, y, c)?;
        }
        Ok(())
    }
}

/// Multiplication by a constant.
#[derive(Debug, Clone)]
pub struct Scale {
    pub factor: f64,
}

impl Operation for Scale {
    fn name(&self) -> &str {
        if self.factor == -1.0 { "neg" } else { "scale" }
    }

    fn attributes(&self) -> Vec<f64> {
        vec![self.factor]
    }

    fn compute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let f = self.factor;
        Ok(vec![inputs[0].map(|a| a * f)])
    }

    fn vjp(&self, rec: &mut Recorder, node: &OpNode, cotangents: &mut Cotangents) -> Result<()> {
        let x = node.inputs[0];
        if let Some(g) = cotangents.get(node.outputs[0]) {
            if cotangents.wants(x) {
                let c = scale(rec, g, self.factor)?;
                cotangents.accumulate(rec, x, c)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Sin,
    Cos,
    Exp,
    Log,
}

#[derive(Debug, Clone)]
pub struct Unary {
    pub func: UnaryFn,
}

impl Operation for Unary {
    fn name(&self) -> &str {
        match self.func {
            UnaryFn::Sin => "sin",
            UnaryFn::Cos => "cos",
            UnaryFn::Exp => "exp",
            UnaryFn::Log => "log",
        }
    }

    fn compute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let x = &inputs[0];
        let out = match self.func {
            UnaryFn::Sin => x.map(f64::sin),
            UnaryFn::Cos => x.map(f64::cos),
            UnaryFn::Exp => x.map(f64::exp),
            UnaryFn::Log => x.map(f64::ln),
        };
        Ok(vec![out])
    }

    fn vjp(&self, rec: &mut Recorder, node: &OpNode, cotangents: &mut Cotangents) -> Result<()> {
        let (x, y) = (node.inputs[0], node.outputs[0]);
        let Some(g) = cotangents.get(y) else {
            return Ok(());
        };
        if !cotangents.wants(x) {
            return Ok(());
        }
        let c = match self.func {
            UnaryFn::Sin => {
                let d = cos(rec, x)?;
                mul(rec, g, d)?
            }
            UnaryFn::Cos => {
                let d = sin(rec, x)?;
                let gd = mul(rec, g, d)?;
                neg(rec, gd)?
            }
            UnaryFn::Exp => mul(rec, g, y)?,
            UnaryFn::Log => div(rec, g, x)?,
        };
        cotangents.accumulate(rec, x, c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use approx::assert_relative_eq;

    #[test]
    fn test_binary_compute() {
        let x = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let y = Tensor::from_vec(vec![4.0, 8.0], &[2]).unwrap();
        let out = Binary { func: BinaryFn::Div }.compute(&[x.clone(), y]).unwrap();
        assert_eq!(out[0].data(), &[0.25, 0.25]);

        let s = Tensor::scalar(3.0);
        let out = Binary { func: BinaryFn::Mul }.compute(&[x, s]).unwrap();
        assert_eq!(out[0].data(), &[3.0, 6.0]);
    }

    #[test]
    fn test_unary_compute() {
        let x = Tensor::scalar(0.0);
        assert_relative_eq!(Unary { func: UnaryFn::Cos }.compute(&[x.clone()]).unwrap()[0].item(), 1.0);
        assert_relative_eq!(Unary { func: UnaryFn::Exp }.compute(&[x]).unwrap()[0].item(), 1.0);
    }

    #[test]
    fn test_scale_name() {
        let mut rec = Recorder::default();
        let x = rec.input(Tensor::scalar(1.0));
        let y = ops::neg(&mut rec, x).unwrap();
        let z = ops::scale(&mut rec, x, 2.0).unwrap();
        let root = rec.root();
        let order = rec.graph(root).operation_order().unwrap();
        let mut names: Vec<_> = order
            .iter()
            .map(|op| rec.operation(*op).kind().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["neg", "scale"]);
        rec.run_interpretation(root).unwrap();
        assert_eq!(rec.value(y).unwrap().item(), -1.0);
        assert_eq!(rec.value(z).unwrap().item(), 2.0);
    }
}
