use crate::cotangent::Cotangents;
use crate::error::Result;
use crate::operation::{OpNode, Operation};
use crate::recorder::Recorder;
use crate::tensor::{Shape, Tensor};

use super::{index, position, scatter};

/// `x[i]` along the leading axis. The index input carries no cotangent.
#[derive(Debug, Clone)]
pub struct Index;

impl Operation for Index {
    fn name(&self) -> &str {
        "index"
    }

    fn compute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let i = position(&inputs[1])?;
        Ok(vec![inputs[0].index_axis0(i)?])
    }

    fn vjp(&self, rec: &mut Recorder, node: &OpNode, cotangents: &mut Cotangents) -> Result<()> {
        let (x, i) = (node.inputs[0], node.inputs[1]);
        if let (Some(g), true) = (cotangents.get(node.outputs[0]), cotangents.wants(x)) {
            let shape = rec.shape(x).to_vec();
            let c = scatter(rec, g, i, &shape)?;
            cotangents.accumulate(rec, x, c)?;
        }
        Ok(())
    }
}

/// Zeros of `shape` with slice `i` set to the input.
#[derive(Debug, Clone)]
pub struct Scatter {
    pub shape: Shape,
}

impl Operation for Scatter {
    fn name(&self) -> &str {
        "scatter"
    }

    fn attributes(&self) -> Vec<f64> {
        self.shape.iter().map(|&d| d as f64).collect()
    }

    fn compute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let i = position(&inputs[1])?;
        let mut out = Tensor::zeros(&self.shape);
        out.set_axis0(i, &inputs[0])?;
        Ok(vec![out])
    }

    fn vjp(&self, rec: &mut Recorder, node: &OpNode, cotangents: &mut Cotangents) -> Result<()> {
        let (v, i) = (node.inputs[0], node.inputs[1]);
        if let (Some(g), true) = (cotangents.get(node.outputs[0]), cotangents.wants(v)) {
            let c = index(rec, g, i)?;
            cotangents.accumulate(rec, v, c)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::shape_of;

    #[test]
    fn test_index_rows() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let out = Index.compute(&[x.clone(), Tensor::scalar(1.0)]).unwrap();
        assert_eq!(out[0].data(), &[3.0, 4.0]);
        assert!(Index.compute(&[x, Tensor::scalar(2.0)]).is_err());
    }

    #[test]
    fn test_scatter_places_slice() {
        let s = Scatter {
            shape: shape_of(&[3]),
        };
        let out = s.compute(&[Tensor::scalar(5.0), Tensor::scalar(2.0)]).unwrap();
        assert_eq!(out[0].data(), &[0.0, 0.0, 5.0]);
    }
}
