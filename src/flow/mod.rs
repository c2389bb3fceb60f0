//! Class-flow (points-to) analysis.
//!
//! Generates a constraint system from the IR of every reachable method and
//! the RTA dispatch map, then drives the solver to a fixpoint. Tracked
//! state: per-pc local environments, per-field heaps keyed by allocation
//! site, static-field values, and per-method argument/return summaries.
//! Array contents are pooled into a single pseudo-field.

pub mod domains;
pub mod sites;
pub mod solver;

use std::collections::HashMap;

use crate::classfile::{
    ClassMethodSig, ClassName, Const, FieldSignature, MethodSignature, ObjectType, ValueType,
};
use crate::hierarchy::Program;
use crate::ir::{
    transform, Basic, Binop, Check, Expr, Instr, MethodIr, TransformOptions, Unop, Var,
};

pub use domains::{AbFSet, AbLocals, AbMethod, AbVSet};
pub use sites::{ProgramPoint, Site, SiteId, SiteTable};
pub use solver::{AbVal, Constraint, Context, NoContext, SolveEnv, Solver, State, StateVar};

/// Result of the class-flow analysis.
pub struct ClassFlowResult {
    pub state: State<NoContext>,
    pub sites: SiteTable,
    pub irs: HashMap<ClassMethodSig, MethodIr>,
}

impl ClassFlowResult {
    /// The local environment on entry to `pc` of the given method.
    pub fn locals_at(&self, cms: &ClassMethodSig, pc: usize) -> AbLocals {
        self.state.pc(&NoContext, cms, pc)
    }

    /// The abstract value of `v` on entry to `pc`.
    pub fn value_of(&self, cms: &ClassMethodSig, pc: usize, v: Var) -> AbVSet {
        self.locals_at(cms, pc).get_var(v)
    }
}

/// The pooled pseudo-field holding every array's elements.
fn array_field() -> (ClassName, FieldSignature) {
    (
        "<arrays>".to_string(),
        FieldSignature {
            name: "elements".to_string(),
            ty: ValueType::object(),
        },
    )
}

/// Abstract value of a call with no analysable body.
fn opaque_value(ret: &Option<ValueType>) -> AbVSet {
    match ret {
        Some(t) if t.is_reference() => AbVSet::Top,
        Some(_) => AbVSet::Primitive,
        None => AbVSet::Bot,
    }
}

fn eval_basic(env: &AbLocals, b: &Basic) -> AbVSet {
    match b {
        Basic::Var(_, v) => env.get_var(*v),
        Basic::Const(c) => match c {
            Const::Null => AbVSet::empty(),
            // String and class literals are not allocation sites.
            Const::Str(_) | Const::Class(_) => AbVSet::empty(),
            _ => AbVSet::Primitive,
        },
    }
}

fn eval_expr(st: &State<NoContext>, senv: &SolveEnv, env: &AbLocals, e: &Expr) -> AbVSet {
    match e {
        Expr::Basic(b) => eval_basic(env, b),
        Expr::Unop(op, b) => match op {
            Unop::Cast(t) => {
                eval_basic(env, b).filter_with_compatible(senv.program, senv.sites, t)
            }
            Unop::Neg(_) | Unop::Conv(_) | Unop::ArrayLength | Unop::InstanceOf(_) => {
                AbVSet::Primitive
            }
        },
        Expr::Binop(op, a, _) => match op {
            Binop::ArrayLoad(t) if t.is_reference() => {
                let (c, fs) = array_field();
                st.field(&c, &fs).fset2var(&eval_basic(env, a))
            }
            _ => AbVSet::Primitive,
        },
        Expr::Field(obj, c, fs) => {
            if fs.ty.is_reference() {
                st.field(c, fs).fset2var(&eval_basic(env, obj))
            } else {
                AbVSet::Primitive
            }
        }
        Expr::StaticField(c, fs) => {
            if fs.ty.is_reference() {
                st.static_field(c, fs)
            } else {
                AbVSet::Primitive
            }
        }
    }
}

/// State variables an expression reads besides the local environment.
fn expr_sources(e: &Expr) -> Vec<StateVar<NoContext>> {
    match e {
        Expr::Field(_, c, fs) if fs.ty.is_reference() => {
            vec![StateVar::Field(c.clone(), fs.clone())]
        }
        Expr::StaticField(c, fs) if fs.ty.is_reference() => {
            vec![StateVar::StaticField(c.clone(), fs.clone())]
        }
        Expr::Binop(Binop::ArrayLoad(t), _, _) if t.is_reference() => {
            let (c, fs) = array_field();
            vec![StateVar::Field(c, fs)]
        }
        _ => Vec::new(),
    }
}

/// Run the class-flow analysis over a program produced by RTA.
///
/// `entries` are the externally-callable roots; their reference parameters
/// are seeded with `Top`.
pub fn analyze(
    program: &Program,
    entries: &[ClassMethodSig],
    topts: TransformOptions,
) -> ClassFlowResult {
    let ctx = NoContext;

    // IR for every parsed method with a body. A method that fails to
    // transform is skipped with a warning; the analysis continues without
    // it (its summary degrades to opaque at call sites).
    let mut irs: HashMap<ClassMethodSig, MethodIr> = HashMap::new();
    for cms in &program.parsed {
        let Some(idx) = program.class_idx(&cms.0) else { continue };
        let class = &program.class(idx).data;
        let Some(method) = class.method(&cms.1) else { continue };
        let Some(code) = &method.code else { continue };
        match transform(class, method, code, topts) {
            Ok(ir) => {
                irs.insert(cms.clone(), ir);
            }
            Err(e) => log::warn!("skipping {}.{}: {e}", cms.0, cms.1.name),
        }
    }

    // Intern one allocation site per New/NewArray instruction.
    let mut sites = SiteTable::new();
    let mut site_ids: HashMap<(ClassMethodSig, usize), SiteId> = HashMap::new();
    for (cms, ir) in &irs {
        for (pc, instr) in ir.code.iter().enumerate() {
            let ty = match instr {
                Instr::New(_, c, _, _) => Some(ObjectType::Class(c.clone())),
                Instr::NewArray(_, elem, dims) => {
                    let mut ty = elem.clone();
                    for _ in 0..dims.len() {
                        ty = ValueType::Object(ObjectType::Array(Box::new(ty)));
                    }
                    match ty {
                        ValueType::Object(o) => Some(o),
                        _ => None,
                    }
                }
                _ => None,
            };
            if let Some(ty) = ty {
                let id = sites.intern(Site {
                    context: Vec::new(),
                    ty,
                });
                site_ids.insert((cms.clone(), pc), id);
            }
        }
    }

    let mut constraints: Vec<Constraint<NoContext>> = Vec::new();
    for (cms, ir) in &irs {
        gen_method(program, &irs, &site_ids, cms, ir, &mut constraints);
    }

    let mut solver = Solver::new(constraints);
    for cms in entries {
        let Some(ir) = irs.get(cms) else { continue };
        let mut args = std::collections::BTreeMap::new();
        for (ty, v) in &ir.params {
            let val = if ty.is_reference() {
                AbVSet::Top
            } else {
                AbVSet::Primitive
            };
            args.insert(v.0, val);
        }
        solver.seed(
            StateVar::Method(ctx, cms.clone()),
            AbVal::Method(AbMethod::Reachable {
                args: AbLocals::Env(args),
                ret: AbVSet::Bot,
                exc_ret: AbVSet::Bot,
            }),
        );
    }

    let state = solver.solve(&SolveEnv {
        program,
        sites: &sites,
    });
    ClassFlowResult { state, sites, irs }
}

// ---------------------------------------------------------------------------
// Constraint generation
// ---------------------------------------------------------------------------

type Cns = Vec<Constraint<NoContext>>;

fn pc_var(cms: &ClassMethodSig, pc: usize) -> StateVar<NoContext> {
    StateVar::Pc(NoContext, cms.clone(), pc)
}

fn gen_method(
    program: &Program,
    irs: &HashMap<ClassMethodSig, MethodIr>,
    site_ids: &HashMap<(ClassMethodSig, usize), SiteId>,
    cms: &ClassMethodSig,
    ir: &MethodIr,
    out: &mut Cns,
) {
    let ctx = NoContext;
    let n = ir.code.len();
    if n == 0 {
        return;
    }

    // Entry: the joined argument abstraction becomes the pc-0 environment.
    {
        let cms = cms.clone();
        let params: Vec<Var> = ir.params.iter().map(|(_, v)| *v).collect();
        out.push(Constraint {
            sources: vec![StateVar::Method(ctx, cms.clone())],
            target: pc_var(&cms, 0),
            transfer: Box::new(move |st, _| {
                AbVal::Locals(st.method(&ctx, &cms).init_locals(&params))
            }),
        });
    }

    // Exception edges: the handler entry sees the environment of every
    // covered pc, with the catch variable opaque.
    for handler in &ir.exc_tbl {
        for pc in handler.e_start..handler.e_end.min(n) {
            let cms = cms.clone();
            let catch_var = handler.e_catch_var;
            out.push(Constraint {
                sources: vec![pc_var(&cms, pc)],
                target: pc_var(&cms, handler.e_handler),
                transfer: Box::new(move |st, _| {
                    let env = st.pc(&ctx, &cms, pc);
                    if env.is_bot() {
                        return AbVal::Locals(AbLocals::Bot);
                    }
                    AbVal::Locals(env.set_var(catch_var, AbVSet::Top))
                }),
            });
        }
    }

    for (pc, instr) in ir.code.iter().enumerate() {
        gen_instr(program, irs, site_ids, cms, ir, pc, instr, out);
    }
}

/// Propagate the environment unchanged from `pc` to `to`.
fn propagate(cms: &ClassMethodSig, pc: usize, to: usize, out: &mut Cns) {
    let ctx = NoContext;
    let cms = cms.clone();
    out.push(Constraint {
        sources: vec![pc_var(&cms, pc)],
        target: pc_var(&cms, to),
        transfer: Box::new(move |st, _| AbVal::Locals(st.pc(&ctx, &cms, pc))),
    });
}

#[allow(clippy::too_many_arguments)]
fn gen_instr(
    program: &Program,
    irs: &HashMap<ClassMethodSig, MethodIr>,
    site_ids: &HashMap<(ClassMethodSig, usize), SiteId>,
    cms: &ClassMethodSig,
    ir: &MethodIr,
    pc: usize,
    instr: &Instr,
    out: &mut Cns,
) {
    let ctx = NoContext;
    let n = ir.code.len();
    let next = pc + 1;

    match instr {
        Instr::Nop
        | Instr::MayInit(_)
        | Instr::MonitorEnter(_)
        | Instr::MonitorExit(_) => {
            if next < n {
                propagate(cms, pc, next, out);
            }
        }

        Instr::Check(check) => {
            match check {
                // A passed cast refines the checked variable.
                Check::Cast(Basic::Var(_, v), ty) => {
                    let cms2 = cms.clone();
                    let v = *v;
                    let ty = ty.clone();
                    out.push(Constraint {
                        sources: vec![pc_var(cms, pc)],
                        target: pc_var(cms, next),
                        transfer: Box::new(move |st, senv| {
                            let env = st.pc(&ctx, &cms2, pc);
                            if env.is_bot() {
                                return AbVal::Locals(AbLocals::Bot);
                            }
                            let refined = env.get_var(v).filter_with_compatible(
                                senv.program,
                                senv.sites,
                                &ty,
                            );
                            AbVal::Locals(env.set_var(v, refined))
                        }),
                    });
                }
                _ => {
                    if next < n {
                        propagate(cms, pc, next, out);
                    }
                }
            }
        }

        Instr::Goto(t) => propagate(cms, pc, *t, out),

        Instr::Ifd { target, .. } => {
            if next < n {
                propagate(cms, pc, next, out);
            }
            propagate(cms, pc, *target, out);
        }

        Instr::AffectVar(v, e) => {
            if next >= n {
                return;
            }
            let cms2 = cms.clone();
            let v = *v;
            let e = e.clone();
            let mut sources = vec![pc_var(cms, pc)];
            sources.extend(expr_sources(&e));
            out.push(Constraint {
                sources,
                target: pc_var(cms, next),
                transfer: Box::new(move |st, senv| {
                    let env = st.pc(&ctx, &cms2, pc);
                    if env.is_bot() {
                        return AbVal::Locals(AbLocals::Bot);
                    }
                    let val = eval_expr(st, senv, &env, &e);
                    AbVal::Locals(env.set_var(v, val))
                }),
            });
        }

        Instr::AffectArray(arr, _, val) => {
            if next < n {
                propagate(cms, pc, next, out);
            }
            if MethodIr::type_of_basic(val).is_reference() {
                let cms2 = cms.clone();
                let arr = arr.clone();
                let val = val.clone();
                let (c, fs) = array_field();
                out.push(Constraint {
                    sources: vec![pc_var(cms, pc)],
                    target: StateVar::Field(c, fs),
                    transfer: Box::new(move |st, _| {
                        let env = st.pc(&ctx, &cms2, pc);
                        if env.is_bot() {
                            return AbVal::FSet(AbFSet::Bot);
                        }
                        AbVal::FSet(AbFSet::var2fset(
                            &eval_basic(&env, &arr),
                            &eval_basic(&env, &val),
                        ))
                    }),
                });
            }
        }

        Instr::AffectField(obj, class, fs, val) => {
            if next < n {
                propagate(cms, pc, next, out);
            }
            if fs.ty.is_reference() {
                let cms2 = cms.clone();
                let obj = obj.clone();
                let val = val.clone();
                out.push(Constraint {
                    sources: vec![pc_var(cms, pc)],
                    target: StateVar::Field(class.clone(), fs.clone()),
                    transfer: Box::new(move |st, _| {
                        let env = st.pc(&ctx, &cms2, pc);
                        if env.is_bot() {
                            return AbVal::FSet(AbFSet::Bot);
                        }
                        AbVal::FSet(AbFSet::var2fset(
                            &eval_basic(&env, &obj),
                            &eval_basic(&env, &val),
                        ))
                    }),
                });
            }
        }

        Instr::AffectStaticField(class, fs, e) => {
            if next < n {
                propagate(cms, pc, next, out);
            }
            if fs.ty.is_reference() {
                let cms2 = cms.clone();
                let e = e.clone();
                let mut sources = vec![pc_var(cms, pc)];
                sources.extend(expr_sources(&e));
                out.push(Constraint {
                    sources,
                    target: StateVar::StaticField(class.clone(), fs.clone()),
                    transfer: Box::new(move |st, senv| {
                        let env = st.pc(&ctx, &cms2, pc);
                        if env.is_bot() {
                            return AbVal::VSet(AbVSet::Bot);
                        }
                        AbVal::VSet(eval_expr(st, senv, &env, &e))
                    }),
                });
            }
        }

        Instr::New(v, class, params, args) => {
            let site = site_ids[&(cms.clone(), pc)];
            if next < n {
                let cms2 = cms.clone();
                let v = *v;
                out.push(Constraint {
                    sources: vec![pc_var(cms, pc)],
                    target: pc_var(cms, next),
                    transfer: Box::new(move |st, _| {
                        let env = st.pc(&ctx, &cms2, pc);
                        if env.is_bot() {
                            return AbVal::Locals(AbLocals::Bot);
                        }
                        AbVal::Locals(env.set_var(v, AbVSet::singleton(site)))
                    }),
                });
            }
            let init = (
                class.clone(),
                MethodSignature {
                    name: "<init>".to_string(),
                    params: params.clone(),
                    ret: None,
                },
            );
            gen_call_args(
                irs,
                cms,
                pc,
                Some(CallReceiver::Site(site)),
                args,
                &init,
                out,
            );
            gen_exc_flow(cms, &init, irs, out);
        }

        Instr::NewArray(v, _, _) => {
            if next >= n {
                return;
            }
            let site = site_ids[&(cms.clone(), pc)];
            let cms2 = cms.clone();
            let v = *v;
            out.push(Constraint {
                sources: vec![pc_var(cms, pc)],
                target: pc_var(cms, next),
                transfer: Box::new(move |st, _| {
                    let env = st.pc(&ctx, &cms2, pc);
                    if env.is_bot() {
                        return AbVal::Locals(AbLocals::Bot);
                    }
                    AbVal::Locals(env.set_var(v, AbVSet::singleton(site)))
                }),
            });
        }

        Instr::InvokeStatic(res, _, ms, args) => {
            let callees = callees_at(program, cms, ir, pc);
            gen_invoke(irs, cms, pc, n, *res, None, args, ms, &callees, out);
        }
        Instr::InvokeVirtual(res, recv, _, ms, args) => {
            let callees = callees_at(program, cms, ir, pc);
            gen_invoke(
                irs,
                cms,
                pc,
                n,
                *res,
                Some(CallReceiver::Value(recv.clone())),
                args,
                ms,
                &callees,
                out,
            );
        }
        Instr::InvokeNonVirtual(res, recv, _, ms, args) => {
            let callees = callees_at(program, cms, ir, pc);
            gen_invoke(
                irs,
                cms,
                pc,
                n,
                *res,
                Some(CallReceiver::Value(recv.clone())),
                args,
                ms,
                &callees,
                out,
            );
        }

        Instr::Return(value) => {
            if let Some(b) = value {
                let cms2 = cms.clone();
                let b = b.clone();
                out.push(Constraint {
                    sources: vec![pc_var(cms, pc)],
                    target: StateVar::Method(ctx, cms.clone()),
                    transfer: Box::new(move |st, _| {
                        let env = st.pc(&ctx, &cms2, pc);
                        if env.is_bot() {
                            return AbVal::Method(AbMethod::Bot);
                        }
                        AbVal::Method(AbMethod::Reachable {
                            args: AbLocals::Bot,
                            ret: eval_basic(&env, &b),
                            exc_ret: AbVSet::Bot,
                        })
                    }),
                });
            }
        }

        Instr::Throw(b) => {
            let cms2 = cms.clone();
            let b = b.clone();
            out.push(Constraint {
                sources: vec![pc_var(cms, pc)],
                target: StateVar::Method(ctx, cms.clone()),
                transfer: Box::new(move |st, _| {
                    let env = st.pc(&ctx, &cms2, pc);
                    if env.is_bot() {
                        return AbVal::Method(AbMethod::Bot);
                    }
                    AbVal::Method(AbMethod::Reachable {
                        args: AbLocals::Bot,
                        ret: AbVSet::Bot,
                        exc_ret: eval_basic(&env, &b),
                    })
                }),
            });
        }
    }
}

/// What flows into the callee's `this`.
enum CallReceiver {
    /// A freshly allocated object (constructor fold).
    Site(SiteId),
    Value(Basic),
}

fn callees_at(
    program: &Program,
    cms: &ClassMethodSig,
    ir: &MethodIr,
    pc: usize,
) -> Vec<ClassMethodSig> {
    let bc_pc = ir.pc_ir2bc[pc];
    program
        .static_lookup_method(&cms.0, &cms.1, bc_pc)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

/// Bind caller values to the callee's parameter variables.
fn gen_call_args(
    irs: &HashMap<ClassMethodSig, MethodIr>,
    cms: &ClassMethodSig,
    pc: usize,
    receiver: Option<CallReceiver>,
    args: &[Basic],
    callee: &ClassMethodSig,
    out: &mut Cns,
) {
    let ctx = NoContext;
    let Some(callee_ir) = irs.get(callee) else { return };
    let callee_params: Vec<Var> = callee_ir.params.iter().map(|(_, v)| *v).collect();
    let cms2 = cms.clone();
    let args: Vec<Basic> = args.to_vec();
    out.push(Constraint {
        sources: vec![pc_var(cms, pc)],
        target: StateVar::Method(ctx, callee.clone()),
        transfer: Box::new(move |st, _| {
            let env = st.pc(&ctx, &cms2, pc);
            if env.is_bot() {
                return AbVal::Method(AbMethod::Bot);
            }
            let mut values = Vec::with_capacity(args.len() + 1);
            match &receiver {
                Some(CallReceiver::Site(site)) => values.push(AbVSet::singleton(*site)),
                Some(CallReceiver::Value(b)) => values.push(eval_basic(&env, b)),
                None => {}
            }
            for a in &args {
                values.push(eval_basic(&env, a));
            }
            let mut map = std::collections::BTreeMap::new();
            for (v, val) in callee_params.iter().zip(values) {
                if !val.is_bot() {
                    map.insert(v.0, val);
                }
            }
            AbVal::Method(AbMethod::Reachable {
                args: AbLocals::Env(map),
                ret: AbVSet::Bot,
                exc_ret: AbVSet::Bot,
            })
        }),
    });
}

/// The callee's exceptional return joins into the caller's.
fn gen_exc_flow(
    cms: &ClassMethodSig,
    callee: &ClassMethodSig,
    irs: &HashMap<ClassMethodSig, MethodIr>,
    out: &mut Cns,
) {
    let ctx = NoContext;
    if !irs.contains_key(callee) {
        return;
    }
    let callee = callee.clone();
    out.push(Constraint {
        sources: vec![StateVar::Method(ctx, callee.clone())],
        target: StateVar::Method(ctx, cms.clone()),
        transfer: Box::new(move |st, _| {
            let exc = st.method(&ctx, &callee).exc_ret();
            if exc.is_bot() {
                return AbVal::Method(AbMethod::Bot);
            }
            AbVal::Method(AbMethod::Reachable {
                args: AbLocals::Bot,
                ret: AbVSet::Bot,
                exc_ret: exc,
            })
        }),
    });
}

/// Argument, return-value, and exception plumbing for one invoke site.
#[allow(clippy::too_many_arguments)]
fn gen_invoke(
    irs: &HashMap<ClassMethodSig, MethodIr>,
    cms: &ClassMethodSig,
    pc: usize,
    n: usize,
    res: Option<Var>,
    receiver: Option<CallReceiver>,
    args: &[Basic],
    ms: &MethodSignature,
    callees: &[ClassMethodSig],
    out: &mut Cns,
) {
    let ctx = NoContext;

    for callee in callees {
        let recv = match &receiver {
            Some(CallReceiver::Value(b)) => Some(CallReceiver::Value(b.clone())),
            Some(CallReceiver::Site(s)) => Some(CallReceiver::Site(*s)),
            None => None,
        };
        gen_call_args(irs, cms, pc, recv, args, callee, out);
        gen_exc_flow(cms, callee, irs, out);
    }

    // After the call: the result variable receives the joined returns;
    // callees without an analysable body contribute an opaque value.
    let next = pc + 1;
    if next >= n {
        return;
    }
    let with_ir: Vec<(ClassMethodSig, bool)> = callees
        .iter()
        .map(|c| (c.clone(), irs.contains_key(c)))
        .collect();
    let opaque = opaque_value(&ms.ret);
    let cms2 = cms.clone();
    let mut sources = vec![pc_var(cms, pc)];
    for (c, has_ir) in &with_ir {
        if *has_ir {
            sources.push(StateVar::Method(ctx, c.clone()));
        }
    }
    out.push(Constraint {
        sources,
        target: pc_var(cms, next),
        transfer: Box::new(move |st, _| {
            let env = st.pc(&ctx, &cms2, pc);
            if env.is_bot() {
                return AbVal::Locals(AbLocals::Bot);
            }
            match res {
                None => AbVal::Locals(env),
                Some(v) => {
                    let mut val = AbVSet::Bot;
                    if with_ir.is_empty() {
                        val = opaque.clone();
                    }
                    for (callee, has_ir) in &with_ir {
                        if *has_ir {
                            val.join_into(&st.method(&ctx, callee).ret());
                        } else {
                            val.join_into(&opaque);
                        }
                    }
                    AbVal::Locals(env.set_var(v, val))
                }
            }
        }),
    });
}
