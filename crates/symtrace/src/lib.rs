//! symtrace - traced computation graphs with static loops, implicit solves
//! and reverse-mode differentiation.
//!
//! Host code runs once against a [`Recorder`]; every operation it calls is
//! recorded as a node instead of (or in addition to) being evaluated. The
//! resulting graph can be interpreted, lowered to a pure function by a
//! [`Backend`], or differentiated into another graph.
//!
//! # Architecture
//!
//! ```text
//! Recorder (arenas: variables, operations, graphs)
//!     → Graph: petgraph DAG of variable and operation nodes
//!     → Operation: interpret / vjp / lower
//!
//! Leaf operations (ops)        add, mul, sin, sum, index, ...
//! Loops (loops)                body traced twice, loop-carried state discovered
//! Implicit operations          Gauss-Seidel, bracketed bisection, adjoint solve
//! Reverse mode (reverse)       derivatives recorded as graph operations
//! Backends (backend)           compile + scan
//! ```
//!
//! # Example
//!
//! ```
//! use symtrace::{LoopBuilder, Recorder, Tensor, derivative, ops};
//!
//! let mut rec = Recorder::default();
//! let x = rec.input(Tensor::scalar(0.5));
//! let mut b = rec.input(Tensor::scalar(1.0));
//!
//! // b <- b * x, three times
//! LoopBuilder::range(0, 3)
//!     .unwrap()
//!     .trace(&mut rec, |rec, _| {
//!         b = ops::mul(rec, b, x)?;
//!         Ok(())
//!     })
//!     .unwrap();
//! let db = derivative(&mut rec, b, &[x]).unwrap()[0].unwrap();
//!
//! rec.run_interpretation(rec.root()).unwrap();
//! assert_eq!(rec.value(b).unwrap().item(), 0.125);
//! assert_eq!(rec.value(db).unwrap().item(), 0.75);
//! ```

pub mod backend;
pub mod check;
pub mod cotangent;
pub mod error;
pub mod graph;
pub mod implicit;
pub mod loops;
pub mod node;
pub mod operation;
pub mod ops;
pub mod recorder;
pub mod reverse;
pub mod tensor;

pub use backend::{Backend, CompiledFn, GenericBackend, Kernel};
pub use check::{DerivativeCheck, check_derivatives};
pub use cotangent::Cotangents;
pub use error::{GraphError, Result};
pub use graph::Graph;
pub use implicit::{
    BracketOptions, BracketedSearch, GaussSeidel, ImplicitHandle, ImplicitOperation, SolveReport, SolverOptions,
    StateOptions, VariableLike,
};
pub use loops::{Feedback, Loop, LoopBuilder, LoopOp, LoopOptions};
pub use node::{GraphId, NodeKey, OpId, Variable, VariableKind};
pub use operation::{OpNode, Operation};
pub use recorder::{Bounds, Recorder, RecorderConfig, is_tracing, start_trace, stop_trace, with_recorder};
pub use reverse::{derivative, differentiate, vjp};
pub use tensor::{Shape, Tensor};
