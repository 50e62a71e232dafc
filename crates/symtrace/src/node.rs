//! Node identities shared by variables and operations.
//!
//! Variables, operations and graphs live in arenas owned by the
//! [`Recorder`](crate::Recorder); the handles below are plain indices into those
//! arenas, so they are `Copy` and never dangle while the recorder is alive.

use std::fmt;

use crate::tensor::{Shape, Tensor};

/// Handle to a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(pub(crate) usize);

impl Variable {
    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Handle to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) usize);

impl OpId {
    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Handle to a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub(crate) usize);

impl GraphId {
    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A node as stored in a graph: either a variable or an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Variable(Variable),
    Operation(OpId),
}

impl From<Variable> for NodeKey {
    fn from(v: Variable) -> Self {
        NodeKey::Variable(v)
    }
}

impl From<OpId> for NodeKey {
    fn from(op: OpId) -> Self {
        NodeKey::Operation(op)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Variable(v) => v.fmt(f),
            NodeKey::Operation(op) => op.fmt(f),
        }
    }
}

/// Identity data every node carries.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub name: String,
    pub tags: Vec<String>,
    /// Dotted path of the namespace the node was created in.
    pub namespace: String,
}

/// What created a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// Created by host code; may be a design variable.
    Free,
    /// A fixed value.
    Constant,
    /// Allocated as the output of an operation.
    Computed,
    /// The index variable of a loop.
    Iteration,
}

/// Arena entry for a variable.
#[derive(Debug, Clone)]
pub struct VariableData {
    pub info: NodeInfo,
    pub(crate) shape: Shape,
    pub(crate) value: Option<Tensor>,
    pub is_input: bool,
    pub kind: VariableKind,
    /// Namespace depth at creation, recorded when `auto_hierarchy` is enabled.
    pub hierarchy: Option<usize>,
}

impl VariableData {
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }
}
