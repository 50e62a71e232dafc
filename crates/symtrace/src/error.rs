//! Error types for symtrace.

use thiserror::Error;

/// Errors raised while tracing, interpreting, lowering or differentiating a graph.
///
/// Structural and shape errors abort the current trace before any numeric work
/// happens. Non-convergence of an implicit solve is not an error; it is reported
/// through [`SolveReport`](crate::implicit::SolveReport).
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node was referenced by a graph that never admitted it.
    #[error("node {node} is not in graph")]
    NotInGraph { node: String },

    /// A second operation tried to produce an already-produced variable.
    #[error("variable {variable} already has a producing operation in this graph")]
    AlreadyProduced { variable: String },

    /// Two shapes that must agree do not.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A loop body produced a different graph on its second tracing pass.
    #[error("loop body is not invariant across iterations: {message}")]
    TraceInvariance { message: String },

    /// A loop was declared with no iteration values.
    #[error("loop has no iterations")]
    EmptyLoop,

    /// A thread-local recorder operation ran with no recorder started.
    #[error("no active recorder; start one with Recorder::start")]
    NoActiveRecorder,

    /// `start` was called while another recorder is active on this thread.
    #[error("a recorder is already active on this thread")]
    RecorderAlreadyActive,

    /// The thread-local recorder is already borrowed by an enclosing call.
    #[error("the active recorder is already borrowed")]
    RecorderBusy,

    /// A namespace with the same name already exists under the active one.
    #[error("namespace {name} already exists in the active namespace")]
    DuplicateNamespace { name: String },

    /// `exit_scope` was called at the root namespace.
    #[error("cannot exit the root namespace")]
    NamespaceUnderflow,

    /// `exit_subgraph` was called at the root graph.
    #[error("cannot exit the root graph")]
    SubgraphUnderflow,

    /// Interpretation needed the value of a variable that has none.
    #[error("variable {variable} has no value")]
    MissingValue { variable: String },

    /// An argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation has no reverse-mode rule.
    #[error("operation {operation} cannot be differentiated")]
    NotDifferentiable { operation: String },

    /// The implicit adjoint system could not be solved.
    #[error("residual jacobian is singular at the converged state")]
    SingularJacobian,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    pub(crate) fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
