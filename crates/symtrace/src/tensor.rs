//! Dense `f64` values carried by variables.
//!
//! Values are stored row-major so that the leading axis, which loop histories
//! stack along, is contiguous.

use smallvec::SmallVec;

use crate::error::{GraphError, Result};

/// Shape of a variable or tensor. Immutable once a variable is created.
pub type Shape = SmallVec<[usize; 4]>;

/// Build a [`Shape`] from a slice.
#[inline]
pub fn shape_of(dims: &[usize]) -> Shape {
    SmallVec::from_slice(dims)
}

/// A dense row-major `f64` array.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f64>,
    shape: Shape,
}

impl Tensor {
    /// Create a zero-filled tensor.
    ///
    /// # Examples
    ///
    /// ```
    /// use symtrace::Tensor;
    ///
    /// let t = Tensor::zeros(&[2, 3]);
    /// assert_eq!(t.shape(), &[2, 3]);
    /// assert_eq!(t.len(), 6);
    /// ```
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    /// Create a tensor with every element set to `value`.
    pub fn full(shape: &[usize], value: f64) -> Self {
        Self {
            data: vec![value; numel(shape)],
            shape: shape_of(shape),
        }
    }

    /// Create a shape `(1,)` tensor.
    pub fn scalar(value: f64) -> Self {
        Self {
            data: vec![value],
            shape: shape_of(&[1]),
        }
    }

    /// Create a tensor from row-major data.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::ShapeMismatch` if `data.len()` doesn't match `shape`.
    ///
    /// # Examples
    ///
    /// ```
    /// use symtrace::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// assert_eq!(t.index_axis0(1).unwrap().data(), &[4.0, 5.0, 6.0]);
    /// ```
    pub fn from_vec(data: Vec<f64>, shape: &[usize]) -> Result<Self> {
        let expected = numel(shape);
        if data.len() != expected {
            return Err(GraphError::shape_mismatch(
                "Tensor::from_vec",
                &[expected],
                &[data.len()],
            ));
        }
        Ok(Self {
            data,
            shape: shape_of(shape),
        })
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    #[inline]
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// First element, used for shape `(1,)` values such as iteration indices.
    #[inline]
    pub fn item(&self) -> f64 {
        self.data.first().copied().unwrap_or(0.0)
    }

    /// Apply `f` to every element.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            data: self.data.iter().map(|&x| f(x)).collect(),
            shape: self.shape.clone(),
        }
    }

    /// Combine two tensors elementwise.
    ///
    /// A shape `(1,)` operand is broadcast against the other one.
    pub fn zip_with(&self, other: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Ok(Self {
                data,
                shape: self.shape.clone(),
            });
        }
        if other.is_unit() {
            let b = other.item();
            return Ok(self.map(|a| f(a, b)));
        }
        if self.is_unit() {
            let a = self.item();
            return Ok(other.map(|b| f(a, b)));
        }
        Err(GraphError::shape_mismatch(
            "elementwise operands",
            &self.shape,
            &other.shape,
        ))
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Largest absolute element, `0.0` for an empty tensor.
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0_f64, |m, x| m.max(x.abs()))
    }

    /// Euclidean norm of the flattened data.
    pub fn norm(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum::<f64>().sqrt()
    }

    /// Return a tensor with the same data and a different shape.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        Self::from_vec(self.data.clone(), shape)
    }

    /// Broadcast a shape `(1,)` tensor, or return a copy if shapes already agree.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Self> {
        if self.shape.as_slice() == shape {
            Ok(self.clone())
        } else if self.is_unit() {
            Ok(Self::full(shape, self.item()))
        } else {
            Err(GraphError::shape_mismatch("broadcast", shape, &self.shape))
        }
    }

    /// Shape of a slice along axis 0. A rank-1 tensor slices to shape `(1,)`.
    pub fn slice_shape(shape: &[usize]) -> Shape {
        if shape.len() <= 1 {
            shape_of(&[1])
        } else {
            shape_of(&shape[1..])
        }
    }

    /// Copy out slice `i` along the leading axis.
    pub fn index_axis0(&self, i: usize) -> Result<Self> {
        let (rows, width) = self.axis0_layout()?;
        if i >= rows {
            return Err(GraphError::InvalidArgument(format!(
                "index {i} out of range for leading dimension {rows}"
            )));
        }
        Ok(Self {
            data: self.data[i * width..(i + 1) * width].to_vec(),
            shape: Self::slice_shape(&self.shape),
        })
    }

    /// Overwrite slice `i` along the leading axis.
    pub fn set_axis0(&mut self, i: usize, value: &Tensor) -> Result<()> {
        let (rows, width) = self.axis0_layout()?;
        if i >= rows {
            return Err(GraphError::InvalidArgument(format!(
                "index {i} out of range for leading dimension {rows}"
            )));
        }
        if value.len() != width {
            return Err(GraphError::shape_mismatch(
                "set_axis0",
                &Self::slice_shape(&self.shape),
                value.shape(),
            ));
        }
        self.data[i * width..(i + 1) * width].copy_from_slice(&value.data);
        Ok(())
    }

    /// Stack equally shaped tensors along a new leading axis.
    pub fn stack(items: &[Tensor]) -> Result<Self> {
        let Some(first) = items.first() else {
            return Err(GraphError::InvalidArgument("cannot stack zero tensors".into()));
        };
        let mut data = Vec::with_capacity(first.len() * items.len());
        for t in items {
            if t.shape != first.shape {
                return Err(GraphError::shape_mismatch("stack", &first.shape, &t.shape));
            }
            data.extend_from_slice(&t.data);
        }
        let mut shape = shape_of(&[items.len()]);
        shape.extend_from_slice(&first.shape);
        Ok(Self { data, shape })
    }

    /// Concatenate the flattened data of several tensors.
    pub fn concat_flat(items: &[Tensor]) -> Vec<f64> {
        items.iter().flat_map(|t| t.data.iter().copied()).collect()
    }

    /// Split flat data back into tensors of the given shapes.
    pub fn split_flat(data: &[f64], shapes: &[Shape]) -> Result<Vec<Self>> {
        let total: usize = shapes.iter().map(|s| numel(s)).sum();
        if total != data.len() {
            return Err(GraphError::shape_mismatch("split_flat", &[total], &[data.len()]));
        }
        let mut offset = 0;
        shapes
            .iter()
            .map(|s| {
                let n = numel(s);
                let t = Self::from_vec(data[offset..offset + n].to_vec(), s);
                offset += n;
                t
            })
            .collect()
    }

    #[inline]
    fn is_unit(&self) -> bool {
        self.shape.as_slice() == [1]
    }

    fn axis0_layout(&self) -> Result<(usize, usize)> {
        match self.shape.first() {
            Some(&rows) if rows > 0 => Ok((rows, self.data.len() / rows)),
            _ => Err(GraphError::InvalidArgument(
                "tensor has no leading axis to index".into(),
            )),
        }
    }
}

/// Number of elements of a shape. The empty shape holds one element.
#[inline]
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}
