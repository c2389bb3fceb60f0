//! Stackless three-address IR: representation, construction from bytecode,
//! control-flow graph, and SSA conversion.

pub mod bc2ir;
pub mod cfg;
pub mod ssa;
pub mod types;

pub use bc2ir::{transform, TransformError, TransformOptions};
pub use ssa::{ssa_transform, Phi, SsaMethod};
pub use types::{
    Basic, Binop, Check, Comp, Expr, Handler, Instr, MethodIr, Unop, Var, VarDict, VarOrigin,
    VirtualKind,
};
