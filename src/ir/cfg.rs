//! Control-flow graph over the IR, including exception edges.
//!
//! Each IR pc is a node. Successors of `pc` are `pc + 1` (unless the
//! instruction is a `Goto`, `Throw` or `Return`), the branch target of a
//! `Goto`/`Ifd`, and the entry of every handler whose protected range
//! covers `pc`. The artificial predecessor of pc 0 is `-1` (entry).

use super::types::{Instr, MethodIr};

/// The virtual entry predecessor of pc 0.
pub const ENTRY_PRED: isize = -1;

/// Normal (non-exceptional) successors of `pc`.
pub fn normal_successors(ir: &MethodIr, pc: usize) -> Vec<usize> {
    match &ir.code[pc] {
        Instr::Goto(t) => vec![*t],
        Instr::Ifd { target, .. } => {
            if pc + 1 < ir.code.len() {
                vec![pc + 1, *target]
            } else {
                vec![*target]
            }
        }
        Instr::Throw(_) | Instr::Return(_) => vec![],
        _ => {
            if pc + 1 < ir.code.len() {
                vec![pc + 1]
            } else {
                vec![]
            }
        }
    }
}

/// Handler entries reachable from `pc` through exception edges.
pub fn exception_successors(ir: &MethodIr, pc: usize) -> Vec<usize> {
    ir.exc_tbl
        .iter()
        .filter(|h| h.e_start <= pc && pc < h.e_end)
        .map(|h| h.e_handler)
        .collect()
}

/// All successors of `pc`, exception edges included.
pub fn successors(ir: &MethodIr, pc: usize) -> Vec<usize> {
    let mut succs = normal_successors(ir, pc);
    for h in exception_successors(ir, pc) {
        if !succs.contains(&h) {
            succs.push(h);
        }
    }
    succs
}

/// Predecessor lists for every pc. `preds[0]` leads with [`ENTRY_PRED`].
pub fn predecessors(ir: &MethodIr) -> Vec<Vec<isize>> {
    let mut preds: Vec<Vec<isize>> = vec![Vec::new(); ir.code.len()];
    if !ir.code.is_empty() {
        preds[0].push(ENTRY_PRED);
    }
    for pc in 0..ir.code.len() {
        for s in successors(ir, pc) {
            preds[s].push(pc as isize);
        }
    }
    preds
}

/// Pcs reachable from the entry (through exception edges too).
pub fn reachable(ir: &MethodIr) -> Vec<bool> {
    let mut seen = vec![false; ir.code.len()];
    if ir.code.is_empty() {
        return seen;
    }
    let mut stack = vec![0usize];
    seen[0] = true;
    while let Some(pc) = stack.pop() {
        for s in successors(ir, pc) {
            if !seen[s] {
                seen[s] = true;
                stack.push(s);
            }
        }
    }
    seen
}
