//! Call-graph export.

use crate::classfile::{ClassMethodSig, Op};
use crate::hierarchy::Program;

/// One resolved call edge: the invoke site and one possible callee.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallEdge {
    pub caller: ClassMethodSig,
    pub pc: usize,
    pub callee: ClassMethodSig,
}

/// Every call edge recorded in the dispatch caches, one per
/// `(site, possible callee)` pair, in deterministic order.
pub fn callgraph(program: &Program) -> Vec<CallEdge> {
    let mut edges = Vec::new();
    for caller in &program.parsed {
        let Some(idx) = program.class_idx(&caller.0) else { continue };
        let Some(method) = program.class(idx).data.method(&caller.1) else { continue };
        let Some(code) = &method.code else { continue };
        for (pc, op) in code.ops.iter().enumerate() {
            if !matches!(
                op,
                Op::InvokeVirtual(..)
                    | Op::InvokeInterface(..)
                    | Op::InvokeStatic(..)
                    | Op::InvokeSpecial(..)
            ) {
                continue;
            }
            if let Some(targets) = program.static_lookup_method(&caller.0, &caller.1, pc) {
                for callee in targets.keys() {
                    edges.push(CallEdge {
                        caller: caller.clone(),
                        pc,
                        callee: callee.clone(),
                    });
                }
            }
        }
    }
    edges.sort();
    edges
}
