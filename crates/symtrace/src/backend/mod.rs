//! Backend abstraction for lowering graphs to pure functions.
//!
//! A backend turns a recorded graph into a [`CompiledFn`]: a closure over input
//! values that never touches the recorder's arenas. Loops lower onto the
//! backend's [`scan`](Backend::scan) primitive.
//!
//! # Backends
//!
//! - `GenericBackend`: closure-composing reference implementation (always available)

mod generic;

pub use generic::GenericBackend;

use std::fmt;
use std::rc::Rc;

use crate::error::{GraphError, Result};
use crate::node::{GraphId, Variable};
use crate::recorder::Recorder;
use crate::tensor::Tensor;

/// A lowered operation or graph: input values in, output values out.
pub type Kernel = Rc<dyn Fn(&[Tensor]) -> Result<Vec<Tensor>>>;

/// One scan step: `(carry, x) -> (next carry, per-step outputs)`.
pub type ScanStep<'a> = dyn FnMut(&[Tensor], &[Tensor]) -> Result<(Vec<Tensor>, Vec<Tensor>)> + 'a;

/// Compilation and sequencing primitives a graph lowers onto.
pub trait Backend {
    /// Compile the part of `graph` needed for `outputs` into a function of `inputs`.
    ///
    /// Variables read by the graph that are neither inputs nor produced inside
    /// it are captured with their current values.
    fn compile(
        &self,
        rec: &Recorder,
        graph: GraphId,
        outputs: &[Variable],
        inputs: &[Variable],
    ) -> Result<CompiledFn>;

    /// Fold `step` over `xs`, returning the final carry and, for each per-step
    /// output, the history stacked along a new leading axis.
    fn scan(
        &self,
        step: &mut ScanStep<'_>,
        init: Vec<Tensor>,
        xs: &[Vec<Tensor>],
    ) -> Result<(Vec<Tensor>, Vec<Tensor>)>;

    /// An owned handle to this backend, for kernels that call back into it.
    fn shared(&self) -> Rc<dyn Backend>;
}

/// A compiled graph function.
#[derive(Clone)]
pub struct CompiledFn {
    kernel: Kernel,
    num_inputs: usize,
    num_outputs: usize,
}

impl CompiledFn {
    pub(crate) fn new(kernel: Kernel, num_inputs: usize, num_outputs: usize) -> Self {
        Self {
            kernel,
            num_inputs,
            num_outputs,
        }
    }

    /// Evaluate with one value per declared input.
    pub fn call(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        if inputs.len() != self.num_inputs {
            return Err(GraphError::InvalidArgument(format!(
                "compiled function takes {} inputs, got {}",
                self.num_inputs,
                inputs.len()
            )));
        }
        (self.kernel)(inputs)
    }

    #[inline]
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    #[inline]
    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// The underlying kernel.
    pub fn kernel(&self) -> Kernel {
        Rc::clone(&self.kernel)
    }
}

impl fmt::Debug for CompiledFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFn")
            .field("num_inputs", &self.num_inputs)
            .field("num_outputs", &self.num_outputs)
            .finish()
    }
}
