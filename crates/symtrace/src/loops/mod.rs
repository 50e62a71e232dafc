//! Static-length loops traced into a single graph node.

mod builder;
mod loop_op;
mod reverse;

pub use builder::{Loop, LoopBuilder, LoopOptions};
pub use loop_op::{Feedback, LoopOp};
