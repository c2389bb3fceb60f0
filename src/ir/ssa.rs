//! SSA conversion: dominance-based φ-placement and renaming over the IR
//! control-flow graph, exception edges included.
//!
//! Fresh SSA names are minted through the method's variable table as `Temp`
//! origins; `base_var` maps every name back to the variable it versions.
//! Only variables with more than one definition are renamed, so
//! single-definition temporaries keep their names. After renaming, φ-nodes
//! whose definition is dead at the join point are dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::cfg::{self, ENTRY_PRED};
use super::types::{Basic, Check, Expr, Instr, MethodIr, Var, VarOrigin};

/// A φ-node: `uses[k]` is the incoming value from the k-th predecessor.
#[derive(Clone, Debug, PartialEq)]
pub struct Phi {
    pub def: Var,
    pub uses: Vec<Var>,
}

/// A method in SSA form: the renamed IR plus φ-nodes and predecessors.
#[derive(Clone, Debug)]
pub struct SsaMethod {
    pub ir: MethodIr,
    pub preds: Vec<Vec<isize>>,
    /// φ-nodes per IR pc, conceptually executed before the instruction.
    pub phi_nodes: Vec<Vec<Phi>>,
    /// For every variable index, the variable it is an SSA version of
    /// (identity for unrenamed variables).
    pub base_var: Vec<Var>,
}

impl SsaMethod {
    pub fn base_of(&self, v: Var) -> Var {
        self.base_var[v.index()]
    }
}

/// Convert a method into SSA form.
pub fn ssa_transform(ir: MethodIr) -> SsaMethod {
    let mut ir = ir;
    let n = ir.code.len();
    let preds = cfg::predecessors(&ir);
    let reachable = cfg::reachable(&ir);
    let succs: Vec<Vec<usize>> = (0..n).map(|pc| cfg::successors(&ir, pc)).collect();

    let mut base_var: Vec<Var> = (0..ir.vars.len() as u32).map(Var).collect();

    if n == 0 {
        return SsaMethod {
            ir,
            preds,
            phi_nodes: Vec::new(),
            base_var,
        };
    }

    // -- dominators ----------------------------------------------------

    let rpo = reverse_postorder(&succs, 0);
    let mut rpo_num = vec![usize::MAX; n];
    for (i, &pc) in rpo.iter().enumerate() {
        rpo_num[pc] = i;
    }

    let idom = compute_idoms(&rpo, &rpo_num, &preds);

    // Dominator-tree children, in rpo order for a deterministic walk.
    let mut dom_children: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &pc in rpo.iter().skip(1) {
        if let Some(d) = idom[pc] {
            dom_children[d].push(pc);
        }
    }

    // -- dominance frontiers -------------------------------------------

    let mut df: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for &pc in &rpo {
        let real_preds: Vec<usize> = preds[pc]
            .iter()
            .filter(|&&p| p >= 0)
            .map(|&p| p as usize)
            .filter(|&p| reachable[p])
            .collect();
        if real_preds.len() < 2 {
            continue;
        }
        let Some(dom) = idom[pc] else { continue };
        for p in real_preds {
            let mut runner = p;
            while runner != dom {
                df[runner].insert(pc);
                let Some(next) = idom[runner] else { break };
                if next == runner {
                    break;
                }
                runner = next;
            }
        }
    }

    // -- definition sites ----------------------------------------------

    // Parameters are defs at the (virtual) entry, attributed to pc 0.
    let mut defs: BTreeMap<Var, BTreeSet<usize>> = BTreeMap::new();
    for (_, v) in &ir.params {
        defs.entry(*v).or_default().insert(0);
    }
    for h in &ir.exc_tbl {
        defs.entry(h.e_catch_var).or_default().insert(h.e_handler);
    }
    for (pc, instr) in ir.code.iter().enumerate() {
        if let Some(v) = instr.def() {
            defs.entry(v).or_default().insert(pc);
        }
    }

    let multi_def: BTreeSet<Var> = defs
        .iter()
        .filter(|(_, sites)| sites.len() > 1)
        .map(|(v, _)| *v)
        .collect();

    // -- φ-placement (iterated dominance frontier) ---------------------

    // phi_vars[pc] is the set of base variables needing a φ there.
    let mut phi_vars: Vec<BTreeSet<Var>> = vec![BTreeSet::new(); n];
    for &v in &multi_def {
        let mut work: Vec<usize> = defs[&v].iter().copied().collect();
        let mut placed = BTreeSet::new();
        while let Some(d) = work.pop() {
            if !reachable[d] {
                continue;
            }
            for &j in &df[d] {
                if placed.insert(j) {
                    phi_vars[j].insert(v);
                    work.push(j);
                }
            }
        }
    }

    struct PhiBuild {
        base: Var,
        def: Var,
        uses: Vec<Var>,
    }

    let mut phis: Vec<Vec<PhiBuild>> = (0..n)
        .map(|pc| {
            phi_vars[pc]
                .iter()
                .map(|&v| PhiBuild {
                    base: v,
                    def: v,
                    uses: vec![v; preds[pc].len()],
                })
                .collect()
        })
        .collect();

    // -- renaming ------------------------------------------------------

    let mut next_temp = ir
        .vars
        .iter()
        .filter_map(|o| match o {
            VarOrigin::Temp(k) => Some(k + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);

    let mut stacks: HashMap<Var, Vec<Var>> = HashMap::new();
    for (_, v) in &ir.params {
        stacks.insert(*v, vec![*v]);
    }

    // Handlers by entry pc, for catch-variable renaming.
    let handler_indices: Vec<Vec<usize>> = {
        let mut by_pc: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, h) in ir.exc_tbl.iter().enumerate() {
            by_pc[h.e_handler].push(i);
        }
        by_pc
    };

    // The edge from the virtual entry into pc 0.
    for phi in phis[0].iter_mut() {
        for (k, &p) in preds[0].iter().enumerate() {
            if p == ENTRY_PRED {
                phi.uses[k] = phi.base;
            }
        }
    }

    // Explicit-stack preorder walk of the dominator tree.
    enum Step {
        Enter(usize),
        Leave(usize, Vec<Var>),
    }
    let mut walk = vec![Step::Enter(0)];
    while let Some(step) = walk.pop() {
        match step {
            Step::Leave(_, pushed) => {
                for v in pushed {
                    if let Some(stack) = stacks.get_mut(&v) {
                        stack.pop();
                    }
                }
            }
            Step::Enter(pc) => {
                let mut pushed = Vec::new();

                // φ defs first.
                for phi in phis[pc].iter_mut() {
                    let fresh = mint(&mut ir.vars, &mut base_var, &mut next_temp, phi.base);
                    phi.def = fresh;
                    stacks.entry(phi.base).or_default().push(fresh);
                    pushed.push(phi.base);
                }

                // Catch-variable defs at handler entries.
                for &hi in &handler_indices[pc] {
                    let base = base_of(&base_var, ir.exc_tbl[hi].e_catch_var);
                    if multi_def.contains(&base) {
                        let fresh = mint(&mut ir.vars, &mut base_var, &mut next_temp, base);
                        ir.exc_tbl[hi].e_catch_var = fresh;
                        stacks.entry(base).or_default().push(fresh);
                        pushed.push(base);
                    }
                }

                // Uses, then the def, of the instruction itself.
                {
                    let instr = &mut ir.code[pc];
                    map_instr_uses(instr, &mut |v| current(&stacks, v));
                    if let Some(v) = instr.def() {
                        if multi_def.contains(&v) {
                            let fresh = mint(&mut ir.vars, &mut base_var, &mut next_temp, v);
                            set_instr_def(instr, fresh);
                            stacks.entry(v).or_default().push(fresh);
                            pushed.push(v);
                        }
                    }
                }

                // Feed φ uses of the successors.
                for &s in &succs[pc] {
                    for phi in phis[s].iter_mut() {
                        let cur = current(&stacks, phi.base);
                        for (k, &p) in preds[s].iter().enumerate() {
                            if p == pc as isize {
                                phi.uses[k] = cur;
                            }
                        }
                    }
                }

                walk.push(Step::Leave(pc, pushed));
                for &child in dom_children[pc].iter().rev() {
                    walk.push(Step::Enter(child));
                }
            }
        }
    }

    let mut phi_nodes: Vec<Vec<Phi>> = phis
        .into_iter()
        .map(|list| {
            list.into_iter()
                .map(|p| Phi {
                    def: p.def,
                    uses: p.uses,
                })
                .collect()
        })
        .collect();

    // -- liveness filter -----------------------------------------------

    loop {
        let live_in = liveness(&ir, &succs, &preds, &phi_nodes);
        let mut dropped = false;
        for pc in 0..n {
            let keep: Vec<bool> = phi_nodes[pc]
                .iter()
                .map(|phi| {
                    // Live at the join point: used by the instruction there
                    // or live out of it.
                    let mut after: HashSet<Var> = live_in[pc].clone();
                    for other in &phi_nodes[pc] {
                        after.remove(&other.def);
                    }
                    instr_uses(&ir.code[pc]).contains(&phi.def) || after.contains(&phi.def) || {
                        let mut out = false;
                        for &s in &succs[pc] {
                            if live_in_via_edge(&phi_nodes, &preds, &live_in, s, pc)
                                .contains(&phi.def)
                            {
                                out = true;
                                break;
                            }
                        }
                        out
                    }
                })
                .collect();
            if keep.iter().any(|k| !k) {
                dropped = true;
                let mut it = keep.iter();
                phi_nodes[pc].retain(|_| *it.next().unwrap());
            }
        }
        if !dropped {
            break;
        }
    }

    SsaMethod {
        ir,
        preds,
        phi_nodes,
        base_var,
    }
}

fn base_of(base_var: &[Var], v: Var) -> Var {
    base_var[v.index()]
}

fn current(stacks: &HashMap<Var, Vec<Var>>, v: Var) -> Var {
    stacks.get(&v).and_then(|s| s.last()).copied().unwrap_or(v)
}

fn mint(vars: &mut Vec<VarOrigin>, base_var: &mut Vec<Var>, next_temp: &mut u32, base: Var) -> Var {
    let fresh = Var(vars.len() as u32);
    vars.push(VarOrigin::Temp(*next_temp));
    *next_temp += 1;
    base_var.push(base);
    fresh
}

// ---------------------------------------------------------------------------
// Graph helpers
// ---------------------------------------------------------------------------

fn reverse_postorder(succs: &[Vec<usize>], start: usize) -> Vec<usize> {
    let mut visited = vec![false; succs.len()];
    let mut order = Vec::new();
    let mut stack = vec![(start, 0usize)];
    visited[start] = true;
    while let Some((node, i)) = stack.pop() {
        if i < succs[node].len() {
            stack.push((node, i + 1));
            let s = succs[node][i];
            if !visited[s] {
                visited[s] = true;
                stack.push((s, 0));
            }
        } else {
            order.push(node);
        }
    }
    order.reverse();
    order
}

/// Iterative immediate-dominator computation over reverse postorder.
fn compute_idoms(rpo: &[usize], rpo_num: &[usize], preds: &[Vec<isize>]) -> Vec<Option<usize>> {
    let n = preds.len();
    let mut idom: Vec<Option<usize>> = vec![None; n];
    if rpo.is_empty() {
        return idom;
    }
    let start = rpo[0];
    idom[start] = Some(start);

    let intersect = |idom: &[Option<usize>], mut a: usize, mut b: usize| -> usize {
        while a != b {
            while rpo_num[a] > rpo_num[b] {
                a = idom[a].unwrap();
            }
            while rpo_num[b] > rpo_num[a] {
                b = idom[b].unwrap();
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &node in rpo.iter().skip(1) {
            let mut new_idom: Option<usize> = None;
            for &p in &preds[node] {
                if p < 0 {
                    continue;
                }
                let p = p as usize;
                if rpo_num[p] == usize::MAX || idom[p].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, p, cur),
                });
            }
            if let Some(d) = new_idom {
                if idom[node] != Some(d) {
                    idom[node] = Some(d);
                    changed = true;
                }
            }
        }
    }
    idom
}

// ---------------------------------------------------------------------------
// Variable substitution
// ---------------------------------------------------------------------------

fn map_basic(b: &mut Basic, f: &mut impl FnMut(Var) -> Var) {
    if let Basic::Var(_, v) = b {
        *v = f(*v);
    }
}

fn map_expr(e: &mut Expr, f: &mut impl FnMut(Var) -> Var) {
    match e {
        Expr::Basic(b) | Expr::Unop(_, b) => map_basic(b, f),
        Expr::Binop(_, a, b) => {
            map_basic(a, f);
            map_basic(b, f);
        }
        Expr::Field(obj, _, _) => map_basic(obj, f),
        Expr::StaticField(_, _) => {}
    }
}

/// Apply `f` to every variable read by the instruction.
pub(crate) fn map_instr_uses(instr: &mut Instr, f: &mut impl FnMut(Var) -> Var) {
    match instr {
        Instr::Nop | Instr::Goto(_) | Instr::MayInit(_) => {}
        Instr::AffectVar(_, e) | Instr::AffectStaticField(_, _, e) => map_expr(e, f),
        Instr::AffectArray(a, i, v) => {
            map_basic(a, f);
            map_basic(i, f);
            map_basic(v, f);
        }
        Instr::AffectField(o, _, _, v) => {
            map_basic(o, f);
            map_basic(v, f);
        }
        Instr::Ifd { lhs, rhs, .. } => {
            map_basic(lhs, f);
            map_basic(rhs, f);
        }
        Instr::Throw(b) | Instr::MonitorEnter(b) | Instr::MonitorExit(b) => map_basic(b, f),
        Instr::Return(opt) => {
            if let Some(b) = opt {
                map_basic(b, f);
            }
        }
        Instr::New(_, _, _, args) => {
            for a in args {
                map_basic(a, f);
            }
        }
        Instr::NewArray(_, _, dims) => {
            for d in dims {
                map_basic(d, f);
            }
        }
        Instr::InvokeStatic(_, _, _, args) => {
            for a in args {
                map_basic(a, f);
            }
        }
        Instr::InvokeVirtual(_, recv, _, _, args) | Instr::InvokeNonVirtual(_, recv, _, _, args) => {
            map_basic(recv, f);
            for a in args {
                map_basic(a, f);
            }
        }
        Instr::Check(check) => match check {
            Check::NullPointer(b) | Check::NegativeArraySize(b) | Check::Arithmetic(b) => {
                map_basic(b, f)
            }
            Check::ArrayBound(a, b) | Check::ArrayStore(a, b) => {
                map_basic(a, f);
                map_basic(b, f);
            }
            Check::Cast(b, _) => map_basic(b, f),
            Check::Link(_) => {}
        },
    }
}

fn set_instr_def(instr: &mut Instr, fresh: Var) {
    match instr {
        Instr::AffectVar(v, _) | Instr::New(v, ..) | Instr::NewArray(v, ..) => *v = fresh,
        Instr::InvokeStatic(res, ..)
        | Instr::InvokeVirtual(res, ..)
        | Instr::InvokeNonVirtual(res, ..) => *res = Some(fresh),
        _ => {}
    }
}

/// Variables read by an instruction.
pub(crate) fn instr_uses(instr: &Instr) -> Vec<Var> {
    let mut out = Vec::new();
    let mut clone = instr.clone();
    map_instr_uses(&mut clone, &mut |v| {
        out.push(v);
        v
    });
    out
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// φ uses flowing along the edge `p -> s`.
fn live_in_via_edge(
    phi_nodes: &[Vec<Phi>],
    preds: &[Vec<isize>],
    live_in: &[HashSet<Var>],
    s: usize,
    p: usize,
) -> HashSet<Var> {
    let mut set: HashSet<Var> = live_in[s].clone();
    for phi in &phi_nodes[s] {
        set.remove(&phi.def);
    }
    for phi in &phi_nodes[s] {
        for (k, &pred) in preds[s].iter().enumerate() {
            if pred == p as isize {
                set.insert(phi.uses[k]);
            }
        }
    }
    set
}

/// Backward liveness over the renamed program. Catch variables are defs at
/// their handler entry.
fn liveness(
    ir: &MethodIr,
    succs: &[Vec<usize>],
    preds: &[Vec<isize>],
    phi_nodes: &[Vec<Phi>],
) -> Vec<HashSet<Var>> {
    let n = ir.code.len();
    let mut live_in: Vec<HashSet<Var>> = vec![HashSet::new(); n];

    let mut catch_defs: Vec<Vec<Var>> = vec![Vec::new(); n];
    for h in &ir.exc_tbl {
        catch_defs[h.e_handler].push(h.e_catch_var);
    }

    let mut changed = true;
    while changed {
        changed = false;
        for pc in (0..n).rev() {
            let mut out: HashSet<Var> = HashSet::new();
            for &s in &succs[pc] {
                out.extend(live_in_via_edge(phi_nodes, preds, &live_in, s, pc));
            }
            if let Some(v) = ir.code[pc].def() {
                out.remove(&v);
            }
            for v in &catch_defs[pc] {
                out.remove(v);
            }
            out.extend(instr_uses(&ir.code[pc]));
            // φ defs are killed above the instruction; their uses belong to
            // the incoming edges, not to this pc.
            for phi in &phi_nodes[pc] {
                out.remove(&phi.def);
            }
            if out != live_in[pc] {
                live_in[pc] = out;
                changed = true;
            }
        }
    }
    live_in
}
