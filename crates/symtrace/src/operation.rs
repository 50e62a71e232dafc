//! The contract every computation node implements.

use std::fmt::Debug;
use std::rc::Rc;

use crate::backend::{Backend, Kernel};
use crate::cotangent::Cotangents;
use crate::error::{GraphError, Result};
use crate::node::{GraphId, NodeInfo, OpId, Variable};
use crate::recorder::Recorder;
use crate::tensor::Tensor;

/// Polymorphic behaviour of an operation node.
///
/// Leaf operations only need [`compute`](Operation::compute) and
/// [`vjp`](Operation::vjp): interpretation and lowering default to the pure
/// `compute`. Operations owning a nested graph (loops, implicit solves)
/// override `interpret` and `lower` as well.
pub trait Operation: Debug {
    /// Short kind name, e.g. `"add"` or `"loop"`.
    fn name(&self) -> &str;

    /// Numeric parameters fixed when the operation was recorded, such as a
    /// scale factor or a target shape. Operations of the same name with
    /// different attributes compute different functions.
    fn attributes(&self) -> Vec<f64> {
        Vec::new()
    }

    /// Evaluate outputs from input values without touching any graph.
    fn compute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let _ = inputs;
        Err(GraphError::InvalidArgument(format!(
            "operation {} has no pure evaluation",
            self.name()
        )))
    }

    /// Evaluate outputs during interpretation.
    ///
    /// A `None` output keeps the variable symbolic (e.g. a lazily stacked
    /// loop history).
    fn interpret(
        &self,
        rec: &mut Recorder,
        node: &OpNode,
        inputs: &[Tensor],
    ) -> Result<Vec<Option<Tensor>>> {
        let _ = (rec, node);
        Ok(self.compute(inputs)?.into_iter().map(Some).collect())
    }

    /// Build graph operations that push output cotangents back to inputs.
    ///
    /// Implementations read output cotangents from `cotangents` and call
    /// [`Cotangents::accumulate`] for every input that [`Cotangents::wants`].
    fn vjp(&self, rec: &mut Recorder, node: &OpNode, cotangents: &mut Cotangents) -> Result<()>;

    /// Lower to a pure kernel for a backend.
    fn lower(&self, ctx: &LowerContext<'_>) -> Result<Kernel> {
        let kind = Rc::clone(&ctx.kind);
        Ok(Rc::new(move |xs: &[Tensor]| kind.compute(xs)))
    }

    /// The nested graph this operation owns, if any.
    fn subgraph(&self) -> Option<GraphId> {
        None
    }
}

/// Snapshot of an operation's identity and wiring, passed to [`Operation`] methods.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub id: OpId,
    pub inputs: Vec<Variable>,
    pub outputs: Vec<Variable>,
}

/// Arena entry for an operation.
#[derive(Debug, Clone)]
pub struct OperationData {
    pub info: NodeInfo,
    pub(crate) kind: Rc<dyn Operation>,
    pub(crate) inputs: Vec<Variable>,
    pub(crate) outputs: Vec<Variable>,
}

impl OperationData {
    #[inline]
    pub fn kind(&self) -> &Rc<dyn Operation> {
        &self.kind
    }

    #[inline]
    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    #[inline]
    pub fn outputs(&self) -> &[Variable] {
        &self.outputs
    }

    pub(crate) fn node(&self, id: OpId) -> OpNode {
        OpNode {
            id,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

/// Everything an operation may consult while lowering itself.
pub struct LowerContext<'a> {
    pub recorder: &'a Recorder,
    pub node: &'a OpNode,
    /// The operation being lowered, shareable into the kernel closure.
    pub kind: Rc<dyn Operation>,
    pub backend: &'a dyn Backend,
}
