use crate::cotangent::Cotangents;
use crate::error::Result;
use crate::operation::{OpNode, Operation};
use crate::recorder::Recorder;
use crate::tensor::{Shape, Tensor};

use super::{expand, sum};

/// Sum of every element, shape `(1,)`.
#[derive(Debug, Clone)]
pub struct Sum;

impl Operation for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn compute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        Ok(vec![Tensor::scalar(inputs[0].sum())])
    }

    fn vjp(&self, rec: &mut Recorder, node: &OpNode, cotangents: &mut Cotangents) -> Result<()> {
        let x = node.inputs[0];
        if let (Some(g), true) = (cotangents.get(node.outputs[0]), cotangents.wants(x)) {
            let shape = rec.shape(x).to_vec();
            let c = expand(rec, g, &shape)?;
            cotangents.accumulate(rec, x, c)?;
        }
        Ok(())
    }
}

/// Broadcast of a shape `(1,)` value.
#[derive(Debug, Clone)]
pub struct Expand {
    pub shape: Shape,
}

impl Operation for Expand {
    fn name(&self) -> &str {
        "expand"
    }

    fn attributes(&self) -> Vec<f64> {
        self.shape.iter().map(|&d| d as f64).collect()
    }

    fn compute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        Ok(vec![inputs[0].broadcast_to(&self.shape)?])
    }

    fn vjp(&self, rec: &mut Recorder, node: &OpNode, cotangents: &mut Cotangents) -> Result<()> {
        let x = node.inputs[0];
        if let (Some(g), true) = (cotangents.get(node.outputs[0]), cotangents.wants(x)) {
            let c = sum(rec, g)?;
            cotangents.accumulate(rec, x, c)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::shape_of;

    #[test]
    fn test_sum_and_expand() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();
        assert_eq!(Sum.compute(&[x]).unwrap()[0].item(), 6.0);

        let e = Expand {
            shape: shape_of(&[2, 2]),
        };
        let out = e.compute(&[Tensor::scalar(1.5)]).unwrap();
        assert_eq!(out[0].shape(), &[2, 2]);
        assert_eq!(out[0].sum(), 6.0);
    }
}
