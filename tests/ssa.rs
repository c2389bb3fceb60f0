//! SSA conversion tests: φ-placement on a diamond, renaming uniqueness,
//! and the liveness filter.

mod common;

use std::collections::BTreeMap;
use std::collections::HashSet;

use classflow::classfile::{Const, ValueType};
use classflow::ir::{
    ssa_transform, Basic, Comp, Expr, Instr, MethodIr, Var, VarOrigin,
};

/// A diamond: `0: if (x<0) goto 3; 1: y=1; 2: goto 4; 3: y=2;
/// 4: return y` (or `return x` when `ret_y` is false).
fn diamond(ret_y: bool) -> MethodIr {
    let x = Var(0);
    let y = Var(1);
    let ret = if ret_y { y } else { x };
    MethodIr {
        vars: vec![VarOrigin::Original(0, None), VarOrigin::Original(1, None)],
        params: vec![(ValueType::Int, x)],
        code: vec![
            Instr::Ifd {
                cmp: Comp::Lt,
                lhs: Basic::Var(ValueType::Int, x),
                rhs: Basic::Const(Const::Int(0)),
                target: 3,
            },
            Instr::AffectVar(y, Expr::Basic(Basic::Const(Const::Int(1)))),
            Instr::Goto(4),
            Instr::AffectVar(y, Expr::Basic(Basic::Const(Const::Int(2)))),
            Instr::Return(Some(Basic::Var(ValueType::Int, ret))),
        ],
        exc_tbl: Vec::new(),
        line_number_table: None,
        pc_bc2ir: (0..5).map(|i| (i, i)).collect::<BTreeMap<_, _>>(),
        pc_ir2bc: (0..5).collect(),
        jump_target: vec![false, false, false, true, true],
    }
}

#[test]
fn diamond_gets_exactly_one_phi() {
    let ssa = ssa_transform(diamond(true));

    assert_eq!(ssa.preds[4], vec![2, 3]);
    assert_eq!(ssa.phi_nodes[4].len(), 1);
    let phi = &ssa.phi_nodes[4][0];
    assert_eq!(phi.uses.len(), ssa.preds[4].len());

    // The two incoming values are the distinct renamed defs of y.
    assert_ne!(phi.uses[0], phi.uses[1]);
    assert_eq!(ssa.base_of(phi.uses[0]), Var(1));
    assert_eq!(ssa.base_of(phi.uses[1]), Var(1));
    assert_eq!(ssa.base_of(phi.def), Var(1));

    // uses[k] comes from the k-th predecessor.
    let def_at = |pc: usize| match &ssa.ir.code[pc] {
        Instr::AffectVar(v, _) => *v,
        other => panic!("expected a def at pc {pc}, got {other:?}"),
    };
    assert_eq!(phi.uses[0], def_at(1)); // via the goto at pc 2
    assert_eq!(phi.uses[1], def_at(3)); // via fallthrough from pc 3

    // The return reads the phi's def.
    assert!(matches!(
        &ssa.ir.code[4],
        Instr::Return(Some(Basic::Var(_, v))) if *v == phi.def
    ));

    // No phis anywhere else.
    for pc in 0..4 {
        assert!(ssa.phi_nodes[pc].is_empty(), "unexpected phi at {pc}");
    }
}

#[test]
fn dead_phi_is_dropped() {
    let ssa = ssa_transform(diamond(false));
    assert!(ssa.phi_nodes[4].is_empty());
    assert!(matches!(
        &ssa.ir.code[4],
        Instr::Return(Some(Basic::Var(_, v))) if *v == Var(0)
    ));
}

#[test]
fn ssa_defs_are_unique_method_wide() {
    let ssa = ssa_transform(diamond(true));

    let mut defs: Vec<Var> = ssa.ir.params.iter().map(|(_, v)| *v).collect();
    for h in &ssa.ir.exc_tbl {
        defs.push(h.e_catch_var);
    }
    for instr in &ssa.ir.code {
        if let Some(v) = instr.def() {
            defs.push(v);
        }
    }
    for phis in &ssa.phi_nodes {
        for phi in phis {
            defs.push(phi.def);
        }
    }

    let unique: HashSet<Var> = defs.iter().copied().collect();
    assert_eq!(unique.len(), defs.len(), "duplicate SSA definition");
}

#[test]
fn single_definition_variables_keep_their_names() {
    let ssa = ssa_transform(diamond(true));
    // x (the parameter) is defined once and is never renamed.
    assert!(matches!(
        &ssa.ir.code[0],
        Instr::Ifd { lhs: Basic::Var(_, v), .. } if *v == Var(0)
    ));
    assert_eq!(ssa.base_of(Var(0)), Var(0));
}

#[test]
fn entry_predecessor_is_minus_one() {
    let ssa = ssa_transform(diamond(true));
    assert_eq!(ssa.preds[0], vec![-1]);
}

#[test]
fn straight_line_reassignment_needs_no_phi() {
    // x = 1; x = 2; return x
    let x = Var(0);
    let ir = MethodIr {
        vars: vec![VarOrigin::Original(0, None)],
        params: Vec::new(),
        code: vec![
            Instr::AffectVar(x, Expr::Basic(Basic::Const(Const::Int(1)))),
            Instr::AffectVar(x, Expr::Basic(Basic::Const(Const::Int(2)))),
            Instr::Return(Some(Basic::Var(ValueType::Int, x))),
        ],
        exc_tbl: Vec::new(),
        line_number_table: None,
        pc_bc2ir: (0..3).map(|i| (i, i)).collect::<BTreeMap<_, _>>(),
        pc_ir2bc: (0..3).collect(),
        jump_target: vec![false; 3],
    };
    let ssa = ssa_transform(ir);

    assert!(ssa.phi_nodes.iter().all(|p| p.is_empty()));
    // Renamed: the two defs are distinct and the return reads the second.
    let d0 = ssa.ir.code[0].def().unwrap();
    let d1 = ssa.ir.code[1].def().unwrap();
    assert_ne!(d0, d1);
    assert!(matches!(
        &ssa.ir.code[2],
        Instr::Return(Some(Basic::Var(_, v))) if *v == d1
    ));
}
