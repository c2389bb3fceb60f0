//! Static analysis for [Java bytecode](https://docs.oracle.com/javase/specs/jvms/se10/html/jvms-6.html):
//! a stackless three-address IR built by abstract symbolic execution, SSA
//! conversion over the exception-aware CFG, a Rapid Type Analysis call-graph
//! driver, and abstract domains plus a fixed-point solver for a class-flow
//! (points-to) analysis.

pub mod callgraph;
pub mod classfile;
pub mod classpath;
pub mod flow;
pub mod hierarchy;
pub mod ir;
pub mod rta;
pub mod snapshot;

pub use callgraph::{callgraph, CallEdge};
pub use classfile::{ClassData, ClassError, ClassName, MethodSignature};
pub use classpath::{ClassPath, ClassSource, MemorySource};
pub use hierarchy::{Program, ResolveError};
pub use ir::{ssa_transform, transform, MethodIr, SsaMethod, TransformError, TransformOptions};
pub use rta::{default_entry_points, NativeStubs, RtaOptions};
pub use snapshot::Snapshot;
