//! Bytecode to IR transformation.
//!
//! A single forward pass of abstract symbolic execution over the bytecode.
//! Expression trees build up on a symbolic stack; instructions that write
//! memory or may side-effect flush every non-basic slot into fresh
//! temporaries, so every operand of an emitted [`Instr`] is a [`Basic`].
//! Implicit JVM exceptions become explicit [`Check`] instructions, emitted
//! in exactly the order the JVM performs the checks. `new`/`<init>` pairs
//! fold into a single [`Instr::New`].
//!
//! The bytecode-verifier property (a unique stack shape per reachable pc)
//! is what makes the single pass sound: a pc reached with two incompatible
//! shapes is invalid input and reported as such. Joins with a non-empty
//! stack are canonicalised into `Branch` variables so both incoming paths
//! agree on the stack contents.

use std::collections::{BTreeMap, BTreeSet};

use crate::classfile::opcode::{Cond, JvmKind, LoadKind, Op};
use crate::classfile::{
    Bytecode, ClassData, Const, MethodData, ObjectType, ValueType,
};

use super::types::{
    Basic, Binop, Check, Comp, Expr, Handler, Instr, MethodIr, Unop, Var, VarDict, VarOrigin,
    VirtualKind,
};

// ---------------------------------------------------------------------------
// Options and errors
// ---------------------------------------------------------------------------

/// Options for the bytecode-to-IR transformation.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransformOptions {
    /// Typecheck stack slots during the transformation.
    pub bcv: bool,
    /// Emit `CheckLink` before opcodes whose resolution may load classes.
    pub ch_link: bool,
}

/// Reasons a method cannot be transformed. These abort the method; the
/// caller decides whether to skip it or abort the whole analysis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransformError {
    /// JSR/RET present; legacy subroutines are rejected outright.
    Subroutine,
    BadMultiarrayDimension,
    /// Invalid bytecode: stack shape violation or malformed structure.
    BadStack(String),
    NonemptyStackBackwardJump {
        pc: usize,
        target: usize,
    },
    /// An uninitialised reference was used as an expression.
    UninitIsNotExpr {
        pc: usize,
    },
    /// An uninitialised reference survived to a join point.
    TypeConstraintOnUninit {
        pc: usize,
    },
    /// The stack around an `<init>` call did not match `(Uninit, args...)`.
    ContentConstraintOnUninit {
        pc: usize,
    },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::Subroutine => write!(f, "method uses jsr/ret subroutines"),
            TransformError::BadMultiarrayDimension => {
                write!(f, "multianewarray with dimension 0")
            }
            TransformError::BadStack(msg) => write!(f, "invalid bytecode: {msg}"),
            TransformError::NonemptyStackBackwardJump { pc, target } => {
                write!(f, "backward jump {pc} -> {target} with non-empty stack")
            }
            TransformError::UninitIsNotExpr { pc } => {
                write!(f, "uninitialised reference used as expression at pc {pc}")
            }
            TransformError::TypeConstraintOnUninit { pc } => {
                write!(f, "uninitialised reference at a join point at pc {pc}")
            }
            TransformError::ContentConstraintOnUninit { pc } => {
                write!(f, "constructor call stack shape mismatch at pc {pc}")
            }
        }
    }
}

impl std::error::Error for TransformError {}

type Res<T> = Result<T, TransformError>;

// ---------------------------------------------------------------------------
// Symbolic stack
// ---------------------------------------------------------------------------

/// Expression tree living on the symbolic stack. Unlike [`Expr`], operands
/// may nest arbitrarily; trees are flattened into temporaries on demand.
#[derive(Clone, Debug, PartialEq)]
enum SExpr {
    Basic(Basic),
    Unop(Unop, Box<SExpr>),
    Binop(Binop, Box<SExpr>, Box<SExpr>),
    Field(Box<SExpr>, String, crate::classfile::FieldSignature),
    StaticField(String, crate::classfile::FieldSignature),
}

impl SExpr {
    fn ty(&self) -> ValueType {
        match self {
            SExpr::Basic(b) => MethodIr::type_of_basic(b),
            SExpr::Unop(op, _) => MethodIr::type_of_expr(&Expr::Unop(
                op.clone(),
                Basic::Const(Const::Null),
            )),
            SExpr::Binop(op, _, _) => MethodIr::type_of_expr(&Expr::Binop(
                op.clone(),
                Basic::Const(Const::Null),
                Basic::Const(Const::Null),
            )),
            SExpr::Field(_, _, fs) | SExpr::StaticField(_, fs) => fs.ty.clone(),
        }
    }

    fn uses_var(&self, v: Var) -> bool {
        match self {
            SExpr::Basic(Basic::Var(_, w)) => *w == v,
            SExpr::Basic(Basic::Const(_)) => false,
            SExpr::Unop(_, a) => a.uses_var(v),
            SExpr::Binop(_, a, b) => a.uses_var(v) || b.uses_var(v),
            SExpr::Field(obj, _, _) => obj.uses_var(v),
            SExpr::StaticField(_, _) => false,
        }
    }

    /// True if the expression reads any `Branch`/`Branch2` variable attached
    /// to the join at `target`.
    fn uses_branch_var_of(&self, vars: &[VarOrigin], target: usize) -> bool {
        match self {
            SExpr::Basic(Basic::Var(_, v)) => matches!(
                vars.get(v.index()),
                Some(VarOrigin::Branch(_, t) | VarOrigin::Branch2(_, t)) if *t == target
            ),
            SExpr::Basic(Basic::Const(_)) => false,
            SExpr::Unop(_, a) => a.uses_branch_var_of(vars, target),
            SExpr::Binop(_, a, b) => {
                a.uses_branch_var_of(vars, target) || b.uses_branch_var_of(vars, target)
            }
            SExpr::Field(obj, _, _) => obj.uses_branch_var_of(vars, target),
            SExpr::StaticField(_, _) => false,
        }
    }
}

/// A symbolic stack slot: an expression, or the marker left by `new` before
/// its constructor has run.
#[derive(Clone, Debug, PartialEq)]
enum Slot {
    Expr(SExpr),
    Uninit { pc: usize, class: String },
}

impl Slot {
    fn is_wide(&self) -> bool {
        match self {
            Slot::Expr(e) => e.ty().is_wide(),
            Slot::Uninit { .. } => false,
        }
    }
}

/// Coarse type kind used for BCV-mode checks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TyKind {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

fn ty_kind(ty: &ValueType) -> TyKind {
    match ty {
        ValueType::Byte
        | ValueType::Char
        | ValueType::Short
        | ValueType::Boolean
        | ValueType::Int => TyKind::Int,
        ValueType::Long => TyKind::Long,
        ValueType::Float => TyKind::Float,
        ValueType::Double => TyKind::Double,
        ValueType::Object(_) => TyKind::Ref,
    }
}

fn jvm_kind(k: JvmKind) -> TyKind {
    match k {
        JvmKind::Int => TyKind::Int,
        JvmKind::Long => TyKind::Long,
        JvmKind::Float => TyKind::Float,
        JvmKind::Double => TyKind::Double,
    }
}

fn load_kind(k: LoadKind) -> TyKind {
    match k {
        LoadKind::Int => TyKind::Int,
        LoadKind::Long => TyKind::Long,
        LoadKind::Float => TyKind::Float,
        LoadKind::Double => TyKind::Double,
        LoadKind::Ref => TyKind::Ref,
    }
}

fn comp_of(c: Cond) -> Comp {
    match c {
        Cond::Eq => Comp::Eq,
        Cond::Ne => Comp::Ne,
        Cond::Lt => Comp::Lt,
        Cond::Ge => Comp::Ge,
        Cond::Gt => Comp::Gt,
        Cond::Le => Comp::Le,
    }
}

/// Whether control falls through to the next instruction.
enum Flow {
    Fall,
    Stop,
}

// ---------------------------------------------------------------------------
// Transformer
// ---------------------------------------------------------------------------

struct Transformer<'a> {
    ops: &'a [Op],
    opts: TransformOptions,
    dict: VarDict,
    /// Declared types of parameter slots (best type information available).
    slot_types: BTreeMap<u16, ValueType>,
    local_names: &'a BTreeMap<u16, String>,
    code: Vec<Instr>,
    ir2bc: Vec<usize>,
    cur_bc: usize,
    /// Bytecode pc -> first IR pc emitted for it (sparse).
    bc_emitted: BTreeMap<usize, usize>,
    /// IR length at the moment each bytecode pc was reached; used to remap
    /// branch targets. Index `ops.len()` is the final IR length.
    bc_entry: Vec<usize>,
    /// Canonical entry stacks recorded at forward-jump targets.
    entry_stacks: BTreeMap<usize, Vec<Slot>>,
    /// Entry stack heights of already-processed pcs.
    seen: BTreeMap<usize, usize>,
    handler_entries: BTreeSet<usize>,
}

const UNREACHED: usize = usize::MAX;

impl<'a> Transformer<'a> {
    fn bad(msg: impl Into<String>) -> TransformError {
        TransformError::BadStack(msg.into())
    }

    fn emit(&mut self, instr: Instr) {
        self.bc_emitted.entry(self.cur_bc).or_insert(self.code.len());
        self.code.push(instr);
        self.ir2bc.push(self.cur_bc);
    }

    fn fresh(&mut self) -> Var {
        self.dict.fresh_temp()
    }

    // -- expression lowering --

    /// One-level lowering: operands of the produced [`Expr`] are flattened
    /// into basics, the top-level structure is kept.
    fn expr1(&mut self, e: SExpr) -> Expr {
        match e {
            SExpr::Basic(b) => Expr::Basic(b),
            SExpr::Unop(op, a) => {
                let a = self.flatten(*a);
                Expr::Unop(op, a)
            }
            SExpr::Binop(op, a, b) => {
                let a = self.flatten(*a);
                let b = self.flatten(*b);
                Expr::Binop(op, a, b)
            }
            SExpr::Field(obj, class, fs) => {
                let obj = self.flatten(*obj);
                Expr::Field(obj, class, fs)
            }
            SExpr::StaticField(class, fs) => Expr::StaticField(class, fs),
        }
    }

    /// Reduce a tree to a basic expression, materialising through a fresh
    /// temporary when it is not one already.
    fn flatten(&mut self, e: SExpr) -> Basic {
        match e {
            SExpr::Basic(b) => b,
            other => {
                let expr = self.expr1(other);
                let ty = MethodIr::type_of_expr(&expr);
                let t = self.fresh();
                self.emit(Instr::AffectVar(t, expr));
                Basic::Var(ty, t)
            }
        }
    }

    /// Copy a tree into a fresh temporary even when it is already basic.
    fn force_flatten(&mut self, e: SExpr) -> Basic {
        let expr = self.expr1(e);
        let ty = MethodIr::type_of_expr(&expr);
        let t = self.fresh();
        self.emit(Instr::AffectVar(t, expr));
        Basic::Var(ty, t)
    }

    // -- stack helpers --

    fn pop(&self, stack: &mut Vec<Slot>) -> Res<Slot> {
        stack.pop().ok_or_else(|| Self::bad("stack underflow"))
    }

    fn pop_expr(&self, stack: &mut Vec<Slot>, pc: usize) -> Res<SExpr> {
        match self.pop(stack)? {
            Slot::Expr(e) => Ok(e),
            Slot::Uninit { .. } => Err(TransformError::UninitIsNotExpr { pc }),
        }
    }

    /// Flush every stack slot that is not already a basic expression into a
    /// fresh temporary. Called before any instruction that writes memory.
    fn flush_stack(&mut self, stack: &mut [Slot]) {
        for slot in stack.iter_mut() {
            if let Slot::Expr(e) = slot {
                if !matches!(e, SExpr::Basic(_)) {
                    let b = self.flatten(e.clone());
                    *slot = Slot::Expr(SExpr::Basic(b));
                }
            }
        }
    }

    /// Flush every stack slot whose expression reads `v`; a following write
    /// to `v` must not change what those slots evaluate to.
    fn flush_uses_of(&mut self, stack: &mut [Slot], v: Var) {
        for slot in stack.iter_mut() {
            if let Slot::Expr(e) = slot {
                if e.uses_var(v) {
                    let b = self.force_flatten(e.clone());
                    *slot = Slot::Expr(SExpr::Basic(b));
                }
            }
        }
    }

    fn local_var(&mut self, slot: u16) -> Var {
        let name = self.local_names.get(&slot).cloned();
        self.dict.var(VarOrigin::Original(slot, name))
    }

    fn local_type(&self, slot: u16, kind: LoadKind) -> ValueType {
        match self.slot_types.get(&slot) {
            Some(ty) if ty_kind(ty) == load_kind(kind) => ty.clone(),
            _ => kind.value_type(),
        }
    }

    fn check_kind(&self, e: &SExpr, expected: TyKind, what: &str) -> Res<()> {
        if self.opts.bcv && ty_kind(&e.ty()) != expected {
            return Err(Self::bad(format!(
                "{what}: expected {expected:?} operand, found {:?}",
                e.ty()
            )));
        }
        Ok(())
    }

    fn check_link(&mut self, op: &Op) {
        if self.opts.ch_link {
            self.emit(Instr::Check(Check::Link(op.clone())));
        }
    }

    // -- joins --

    /// Verify a branch target lands on an instruction start.
    fn check_target(&self, target: usize) -> Res<()> {
        match self.ops.get(target) {
            Some(Op::Invalid) | None => Err(Self::bad(format!(
                "branch target {target} is not an instruction start"
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Canonicalise the stack for the join at `target`: every slot becomes
    /// the interned `Branch(k, target)` variable, with saves emitted for
    /// slots that do not already hold it. Saves that would clobber a branch
    /// variable another slot still reads are staged through `Branch2`.
    fn canonicalize(&mut self, stack: &mut Vec<Slot>, target: usize, pc: usize) -> Res<()> {
        if stack.is_empty() {
            return Ok(());
        }
        for slot in stack.iter() {
            if matches!(slot, Slot::Uninit { .. }) {
                return Err(TransformError::TypeConstraintOnUninit { pc });
            }
        }

        // Stage slots that read branch variables of this join before any
        // save can overwrite them.
        for k in 0..stack.len() {
            let Slot::Expr(e) = &stack[k] else { unreachable!() };
            let bv = self.dict.var(VarOrigin::Branch(k as u32, target));
            let is_already = matches!(e, SExpr::Basic(Basic::Var(_, v)) if *v == bv);
            if !is_already && e.uses_branch_var_of(self.dict.origins(), target) {
                let staged = self.dict.var(VarOrigin::Branch2(k as u32, target));
                let expr = self.expr1(e.clone());
                let ty = MethodIr::type_of_expr(&expr);
                self.emit(Instr::AffectVar(staged, expr));
                stack[k] = Slot::Expr(SExpr::Basic(Basic::Var(ty, staged)));
            }
        }

        for k in 0..stack.len() {
            let Slot::Expr(e) = stack[k].clone() else { unreachable!() };
            let bv = self.dict.var(VarOrigin::Branch(k as u32, target));
            if matches!(&e, SExpr::Basic(Basic::Var(_, v)) if *v == bv) {
                continue;
            }
            let expr = self.expr1(e);
            let ty = MethodIr::type_of_expr(&expr);
            self.emit(Instr::AffectVar(bv, expr));
            stack[k] = Slot::Expr(SExpr::Basic(Basic::Var(ty, bv)));
        }

        // Reuse the first recorded canonical stack so shapes compare equal,
        // checking kinds in BCV mode.
        if let Some(recorded) = self.entry_stacks.get(&target).cloned() {
            if recorded.len() != stack.len() {
                return Err(Self::bad(format!(
                    "stack heights differ at join {target}: {} vs {}",
                    recorded.len(),
                    stack.len()
                )));
            }
            if self.opts.bcv {
                for (a, b) in recorded.iter().zip(stack.iter()) {
                    if let (Slot::Expr(ea), Slot::Expr(eb)) = (a, b) {
                        if ty_kind(&ea.ty()) != ty_kind(&eb.ty()) {
                            return Err(Self::bad(format!(
                                "stack type mismatch at join {target}"
                            )));
                        }
                    }
                }
            }
            *stack = recorded;
        } else {
            self.entry_stacks.insert(target, stack.clone());
        }
        Ok(())
    }

    /// Account for a control transfer to `target` from `pc`.
    fn branch_to(&mut self, stack: &mut Vec<Slot>, target: usize, pc: usize) -> Res<()> {
        self.check_target(target)?;
        if target <= pc {
            if !stack.is_empty() {
                return Err(TransformError::NonemptyStackBackwardJump { pc, target });
            }
            if let Some(&height) = self.seen.get(&target) {
                if height != 0 {
                    return Err(Self::bad(format!(
                        "empty-stack jump to {target} which was entered with height {height}"
                    )));
                }
            }
            return Ok(());
        }
        if stack.is_empty() {
            match self.entry_stacks.get(&target) {
                Some(existing) if !existing.is_empty() => Err(Self::bad(format!(
                    "stack heights differ at join {target}"
                ))),
                Some(_) => Ok(()),
                None => {
                    self.entry_stacks.insert(target, Vec::new());
                    Ok(())
                }
            }
        } else {
            self.canonicalize(stack, target, pc)
        }
    }

    // -- invoke helpers --

    fn pop_args(&mut self, stack: &mut Vec<Slot>, count: usize) -> Res<Vec<Slot>> {
        if stack.len() < count {
            return Err(Self::bad("stack underflow in call arguments"));
        }
        Ok(stack.split_off(stack.len() - count))
    }

    fn args_to_basics(&mut self, args: Vec<Slot>, pc: usize) -> Res<Vec<Basic>> {
        let mut out = Vec::with_capacity(args.len());
        for a in args {
            match a {
                Slot::Expr(e) => out.push(self.flatten(e)),
                Slot::Uninit { .. } => return Err(TransformError::UninitIsNotExpr { pc }),
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Transform one method's bytecode into [`MethodIr`].
pub fn transform(
    class: &ClassData,
    method: &MethodData,
    bytecode: &Bytecode,
    opts: TransformOptions,
) -> Result<MethodIr, TransformError> {
    // Subroutines are a hard rejection, wherever they appear.
    for op in &bytecode.ops {
        if matches!(op, Op::Jsr(_) | Op::Ret(_)) {
            return Err(TransformError::Subroutine);
        }
    }

    let mut tr = Transformer {
        ops: &bytecode.ops,
        opts,
        dict: VarDict::new(),
        slot_types: BTreeMap::new(),
        local_names: &bytecode.local_names,
        code: Vec::new(),
        ir2bc: Vec::new(),
        cur_bc: 0,
        bc_emitted: BTreeMap::new(),
        bc_entry: vec![UNREACHED; bytecode.ops.len() + 1],
        entry_stacks: BTreeMap::new(),
        seen: BTreeMap::new(),
        handler_entries: BTreeSet::new(),
    };

    // Parameters are defs at entry: `this` first for instance methods, then
    // the declared parameters, wide types occupying two slots.
    let mut params = Vec::new();
    let mut slot = 0u16;
    if !method.is_static() {
        let this_ty = ValueType::Object(ObjectType::Class(class.name.clone()));
        let v = tr.local_var(slot);
        tr.slot_types.insert(slot, this_ty.clone());
        params.push((this_ty, v));
        slot += 1;
    }
    for ty in &method.signature.params {
        let v = tr.local_var(slot);
        tr.slot_types.insert(slot, ty.clone());
        params.push((ty.clone(), v));
        slot += if ty.is_wide() { 2 } else { 1 };
    }

    // Handler entries start with an empty symbolic stack; the exception
    // lands in the handler's catch variable.
    let mut catch_vars = Vec::with_capacity(bytecode.exception_table.len());
    for (i, entry) in bytecode.exception_table.iter().enumerate() {
        let v = tr.dict.var(VarOrigin::Catch(i as u32));
        catch_vars.push(v);
        tr.handler_entries.insert(entry.handler_pc);
        tr.entry_stacks.entry(entry.handler_pc).or_default();
    }

    let starts: Vec<usize> = (0..bytecode.ops.len())
        .filter(|&pc| !matches!(bytecode.ops[pc], Op::Invalid))
        .collect();

    let mut current: Option<Vec<Slot>> = Some(Vec::new());
    for (i, &pc) in starts.iter().enumerate() {
        let fall = current.take();
        let recorded = tr.entry_stacks.get(&pc).cloned();
        let mut stack = match (fall, recorded) {
            (Some(s), Some(c)) => {
                if !stacks_agree(&s, &c) {
                    return Err(Transformer::bad(format!(
                        "incompatible stack shapes at pc {pc}"
                    )));
                }
                c
            }
            (Some(s), None) => s,
            (None, Some(c)) => c,
            // Dead bytecode: transformed with an empty entry stack so the
            // pc maps stay total.
            (None, None) => Vec::new(),
        };

        tr.seen.insert(pc, stack.len());
        tr.cur_bc = pc;
        tr.bc_entry[pc] = tr.code.len();

        let flow = tr.step(&bytecode.ops[pc], pc, &mut stack)?;

        if let Flow::Fall = flow {
            match starts.get(i + 1) {
                None => return Err(Transformer::bad("control falls off the end of the code")),
                Some(&next) => {
                    if tr.handler_entries.contains(&next) && !stack.is_empty() {
                        return Err(Transformer::bad(format!(
                            "non-empty stack falls into handler entry {next}"
                        )));
                    }
                    let expected_empty = tr.entry_stacks.get(&next).map(|c| c.is_empty());
                    if let Some(expected_empty) = expected_empty {
                        if expected_empty && !stack.is_empty() {
                            return Err(Transformer::bad(format!(
                                "stack heights differ at join {next}"
                            )));
                        }
                        if !stack.is_empty() {
                            tr.canonicalize(&mut stack, next, pc)?;
                        }
                    }
                    current = Some(stack);
                }
            }
        }
    }
    tr.bc_entry[bytecode.ops.len()] = tr.code.len();

    // Remap bytecode branch targets onto IR pcs. A goto that now lands on
    // the next IR pc is kept as a Nop so pc arithmetic stays meaningful.
    let bc_entry = tr.bc_entry.clone();
    let remap = |t: usize| -> Res<usize> {
        match bc_entry.get(t) {
            Some(&ir) if ir != UNREACHED => Ok(ir),
            _ => Err(Transformer::bad(format!("dangling branch target {t}"))),
        }
    };
    for i in 0..tr.code.len() {
        let patched = match &tr.code[i] {
            Instr::Goto(t) => {
                let nt = remap(*t)?;
                Some(if nt == i + 1 { Instr::Nop } else { Instr::Goto(nt) })
            }
            Instr::Ifd {
                cmp,
                lhs,
                rhs,
                target,
            } => Some(Instr::Ifd {
                cmp: *cmp,
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                target: remap(*target)?,
            }),
            _ => None,
        };
        if let Some(instr) = patched {
            tr.code[i] = instr;
        }
    }

    let mut exc_tbl = Vec::with_capacity(bytecode.exception_table.len());
    for (i, entry) in bytecode.exception_table.iter().enumerate() {
        exc_tbl.push(Handler {
            e_start: remap(entry.start_pc)?,
            e_end: remap(entry.end_pc)?,
            e_handler: remap(entry.handler_pc)?,
            e_catch_type: entry.catch_type.clone(),
            e_catch_var: catch_vars[i],
        });
    }

    let mut jump_target = vec![false; tr.code.len()];
    for instr in &tr.code {
        match instr {
            Instr::Goto(t) | Instr::Ifd { target: t, .. } => {
                if let Some(flag) = jump_target.get_mut(*t) {
                    *flag = true;
                }
            }
            _ => {}
        }
    }
    for handler in &exc_tbl {
        if let Some(flag) = jump_target.get_mut(handler.e_handler) {
            *flag = true;
        }
    }

    Ok(MethodIr {
        vars: tr.dict.into_origins(),
        params,
        code: tr.code,
        exc_tbl,
        line_number_table: bytecode.line_numbers.clone(),
        pc_bc2ir: tr.bc_emitted,
        pc_ir2bc: tr.ir2bc,
        jump_target,
    })
}

/// Two entry stacks agree when they pair the same variables slot by slot
/// (types may differ in precision between paths).
fn stacks_agree(a: &[Slot], b: &[Slot]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|(x, y)| match (x, y) {
            (Slot::Expr(SExpr::Basic(Basic::Var(_, v))), Slot::Expr(SExpr::Basic(Basic::Var(_, w)))) => {
                v == w
            }
            _ => x == y,
        })
}

// ---------------------------------------------------------------------------
// Per-opcode step
// ---------------------------------------------------------------------------

impl<'a> Transformer<'a> {
    fn step(&mut self, op: &Op, pc: usize, stack: &mut Vec<Slot>) -> Res<Flow> {
        match op {
            Op::Nop => {}

            // ============================================================
            // Constants, loads, stores
            // ============================================================
            Op::Const(c) => {
                stack.push(Slot::Expr(SExpr::Basic(Basic::Const(c.clone()))));
            }
            Op::Load(kind, slot) => {
                let ty = self.local_type(*slot, *kind);
                let v = self.local_var(*slot);
                stack.push(Slot::Expr(SExpr::Basic(Basic::Var(ty, v))));
            }
            Op::Store(kind, slot) => {
                let e = self.pop_expr(stack, pc)?;
                self.check_kind(&e, load_kind(*kind), "store")?;
                let v = self.local_var(*slot);
                self.flush_uses_of(stack, v);
                let expr = self.expr1(e);
                self.emit(Instr::AffectVar(v, expr));
            }
            Op::Iinc(slot, amount) => {
                let v = self.local_var(*slot);
                self.flush_uses_of(stack, v);
                self.emit(Instr::AffectVar(
                    v,
                    Expr::Binop(
                        Binop::Add(JvmKind::Int),
                        Basic::Var(ValueType::Int, v),
                        Basic::Const(Const::Int(*amount as i32)),
                    ),
                ));
            }

            // ============================================================
            // Stack manipulation
            // ============================================================
            Op::Pop => {
                self.pop(stack)?;
            }
            Op::Pop2 => {
                let top = self.pop(stack)?;
                if !top.is_wide() {
                    self.pop(stack)?;
                }
            }
            Op::Dup => {
                let top = self.pop(stack)?;
                stack.push(top.clone());
                stack.push(top);
            }
            Op::DupX1 => {
                let v1 = self.pop(stack)?;
                let v2 = self.pop(stack)?;
                stack.push(v1.clone());
                stack.push(v2);
                stack.push(v1);
            }
            Op::DupX2 => {
                let v1 = self.pop(stack)?;
                let v2 = self.pop(stack)?;
                if v2.is_wide() {
                    stack.push(v1.clone());
                    stack.push(v2);
                    stack.push(v1);
                } else {
                    let v3 = self.pop(stack)?;
                    stack.push(v1.clone());
                    stack.push(v3);
                    stack.push(v2);
                    stack.push(v1);
                }
            }
            Op::Dup2 => {
                let v1 = self.pop(stack)?;
                if v1.is_wide() {
                    stack.push(v1.clone());
                    stack.push(v1);
                } else {
                    let v2 = self.pop(stack)?;
                    stack.push(v2.clone());
                    stack.push(v1.clone());
                    stack.push(v2);
                    stack.push(v1);
                }
            }
            Op::Dup2X1 => {
                let v1 = self.pop(stack)?;
                if v1.is_wide() {
                    let v2 = self.pop(stack)?;
                    stack.push(v1.clone());
                    stack.push(v2);
                    stack.push(v1);
                } else {
                    let v2 = self.pop(stack)?;
                    let v3 = self.pop(stack)?;
                    stack.push(v2.clone());
                    stack.push(v1.clone());
                    stack.push(v3);
                    stack.push(v2);
                    stack.push(v1);
                }
            }
            Op::Dup2X2 => {
                let v1 = self.pop(stack)?;
                if v1.is_wide() {
                    let v2 = self.pop(stack)?;
                    if v2.is_wide() {
                        stack.push(v1.clone());
                        stack.push(v2);
                        stack.push(v1);
                    } else {
                        let v3 = self.pop(stack)?;
                        stack.push(v1.clone());
                        stack.push(v3);
                        stack.push(v2);
                        stack.push(v1);
                    }
                } else {
                    let v2 = self.pop(stack)?;
                    let v3 = self.pop(stack)?;
                    if v3.is_wide() {
                        stack.push(v2.clone());
                        stack.push(v1.clone());
                        stack.push(v3);
                        stack.push(v2);
                        stack.push(v1);
                    } else {
                        let v4 = self.pop(stack)?;
                        stack.push(v2.clone());
                        stack.push(v1.clone());
                        stack.push(v4);
                        stack.push(v3);
                        stack.push(v2);
                        stack.push(v1);
                    }
                }
            }
            Op::Swap => {
                let v1 = self.pop(stack)?;
                let v2 = self.pop(stack)?;
                stack.push(v1);
                stack.push(v2);
            }

            // ============================================================
            // Arrays
            // ============================================================
            Op::ArrayLoad(elem) => {
                let idx = self.pop_expr(stack, pc)?;
                let arr = self.pop_expr(stack, pc)?;
                self.check_kind(&idx, TyKind::Int, "array index")?;
                self.check_kind(&arr, TyKind::Ref, "array load")?;
                let arr = self.flatten(arr);
                let idx = self.flatten(idx);
                self.emit(Instr::Check(Check::NullPointer(arr.clone())));
                self.emit(Instr::Check(Check::ArrayBound(arr.clone(), idx.clone())));
                let t = self.fresh();
                self.emit(Instr::AffectVar(
                    t,
                    Expr::Binop(Binop::ArrayLoad(elem.clone()), arr, idx),
                ));
                stack.push(Slot::Expr(SExpr::Basic(Basic::Var(elem.clone(), t))));
            }
            Op::ArrayStore(elem) => {
                let val = self.pop_expr(stack, pc)?;
                let idx = self.pop_expr(stack, pc)?;
                let arr = self.pop_expr(stack, pc)?;
                self.check_kind(&idx, TyKind::Int, "array index")?;
                self.flush_stack(stack);
                let arr = self.flatten(arr);
                let idx = self.flatten(idx);
                let val = self.flatten(val);
                self.emit(Instr::Check(Check::NullPointer(arr.clone())));
                self.emit(Instr::Check(Check::ArrayBound(arr.clone(), idx.clone())));
                if elem.is_reference() {
                    self.emit(Instr::Check(Check::ArrayStore(arr.clone(), val.clone())));
                }
                self.emit(Instr::AffectArray(arr, idx, val));
            }
            Op::ArrayLength => {
                let arr = self.pop_expr(stack, pc)?;
                let arr = self.flatten(arr);
                self.emit(Instr::Check(Check::NullPointer(arr.clone())));
                stack.push(Slot::Expr(SExpr::Unop(
                    Unop::ArrayLength,
                    Box::new(SExpr::Basic(arr)),
                )));
            }

            // ============================================================
            // Arithmetic
            // ============================================================
            Op::Add(k) | Op::Sub(k) | Op::Mul(k) | Op::And(k) | Op::Or(k) | Op::Xor(k) => {
                let b = self.pop_expr(stack, pc)?;
                let a = self.pop_expr(stack, pc)?;
                self.check_kind(&a, jvm_kind(*k), "arithmetic")?;
                self.check_kind(&b, jvm_kind(*k), "arithmetic")?;
                let binop = match op {
                    Op::Add(_) => Binop::Add(*k),
                    Op::Sub(_) => Binop::Sub(*k),
                    Op::Mul(_) => Binop::Mul(*k),
                    Op::And(_) => Binop::And(*k),
                    Op::Or(_) => Binop::Or(*k),
                    _ => Binop::Xor(*k),
                };
                stack.push(Slot::Expr(SExpr::Binop(binop, Box::new(a), Box::new(b))));
            }
            Op::Shl(k) | Op::Shr(k) | Op::Ushr(k) => {
                let amount = self.pop_expr(stack, pc)?;
                let value = self.pop_expr(stack, pc)?;
                self.check_kind(&amount, TyKind::Int, "shift amount")?;
                self.check_kind(&value, jvm_kind(*k), "shift")?;
                let binop = match op {
                    Op::Shl(_) => Binop::Shl(*k),
                    Op::Shr(_) => Binop::Shr(*k),
                    _ => Binop::Ushr(*k),
                };
                stack.push(Slot::Expr(SExpr::Binop(
                    binop,
                    Box::new(value),
                    Box::new(amount),
                )));
            }
            Op::Div(k) | Op::Rem(k) => {
                let b = self.pop_expr(stack, pc)?;
                let a = self.pop_expr(stack, pc)?;
                self.check_kind(&a, jvm_kind(*k), "division")?;
                self.check_kind(&b, jvm_kind(*k), "division")?;
                let binop = if matches!(op, Op::Div(_)) {
                    Binop::Div(*k)
                } else {
                    Binop::Rem(*k)
                };
                if matches!(k, JvmKind::Int | JvmKind::Long) {
                    // The division is pinned right after its check so the
                    // exception point cannot drift.
                    let a = self.flatten(a);
                    let b = self.flatten(b);
                    self.emit(Instr::Check(Check::Arithmetic(b.clone())));
                    let t = self.fresh();
                    let expr = Expr::Binop(binop, a, b);
                    let ty = MethodIr::type_of_expr(&expr);
                    self.emit(Instr::AffectVar(t, expr));
                    stack.push(Slot::Expr(SExpr::Basic(Basic::Var(ty, t))));
                } else {
                    stack.push(Slot::Expr(SExpr::Binop(binop, Box::new(a), Box::new(b))));
                }
            }
            Op::Neg(k) => {
                let a = self.pop_expr(stack, pc)?;
                self.check_kind(&a, jvm_kind(*k), "negation")?;
                stack.push(Slot::Expr(SExpr::Unop(Unop::Neg(*k), Box::new(a))));
            }
            Op::Conv(c) => {
                let a = self.pop_expr(stack, pc)?;
                stack.push(Slot::Expr(SExpr::Unop(Unop::Conv(*c), Box::new(a))));
            }
            Op::Cmp(k) => {
                let b = self.pop_expr(stack, pc)?;
                let a = self.pop_expr(stack, pc)?;
                stack.push(Slot::Expr(SExpr::Binop(
                    Binop::Cmp(*k),
                    Box::new(a),
                    Box::new(b),
                )));
            }

            // ============================================================
            // Branches
            // ============================================================
            Op::If0(cond, target) => {
                let e = self.pop_expr(stack, pc)?;
                // A three-way comparison consumed by an if folds into a
                // direct two-operand comparison.
                let (lhs, rhs) = match e {
                    SExpr::Binop(Binop::Cmp(_), a, b) => {
                        (self.flatten(*a), self.flatten(*b))
                    }
                    other => {
                        self.check_kind(&other, TyKind::Int, "branch")?;
                        (self.flatten(other), Basic::Const(Const::Int(0)))
                    }
                };
                self.branch_to(stack, *target, pc)?;
                self.emit(Instr::Ifd {
                    cmp: comp_of(*cond),
                    lhs,
                    rhs,
                    target: *target,
                });
            }
            Op::IfCmp(cond, target) => {
                let b = self.pop_expr(stack, pc)?;
                let a = self.pop_expr(stack, pc)?;
                self.check_kind(&a, TyKind::Int, "branch")?;
                self.check_kind(&b, TyKind::Int, "branch")?;
                let lhs = self.flatten(a);
                let rhs = self.flatten(b);
                self.branch_to(stack, *target, pc)?;
                self.emit(Instr::Ifd {
                    cmp: comp_of(*cond),
                    lhs,
                    rhs,
                    target: *target,
                });
            }
            Op::IfACmp(cond, target) => {
                let b = self.pop_expr(stack, pc)?;
                let a = self.pop_expr(stack, pc)?;
                let lhs = self.flatten(a);
                let rhs = self.flatten(b);
                self.branch_to(stack, *target, pc)?;
                self.emit(Instr::Ifd {
                    cmp: comp_of(*cond),
                    lhs,
                    rhs,
                    target: *target,
                });
            }
            Op::IfNull(cond, target) => {
                let a = self.pop_expr(stack, pc)?;
                let lhs = self.flatten(a);
                self.branch_to(stack, *target, pc)?;
                self.emit(Instr::Ifd {
                    cmp: comp_of(*cond),
                    lhs,
                    rhs: Basic::Const(Const::Null),
                    target: *target,
                });
            }
            Op::Goto(target) => {
                self.branch_to(stack, *target, pc)?;
                self.emit(Instr::Goto(*target));
                return Ok(Flow::Stop);
            }
            Op::Jsr(_) | Op::Ret(_) => return Err(TransformError::Subroutine),

            // Switches lower to a comparison chain on the (pinned) key.
            Op::TableSwitch {
                default,
                low,
                targets,
                ..
            } => {
                let key = self.pop_expr(stack, pc)?;
                self.check_kind(&key, TyKind::Int, "switch key")?;
                if !stack.is_empty() {
                    return Err(Self::bad("non-empty stack at switch"));
                }
                let key = self.flatten(key);
                for (i, t) in targets.iter().enumerate() {
                    self.branch_to(stack, *t, pc)?;
                    self.emit(Instr::Ifd {
                        cmp: Comp::Eq,
                        lhs: key.clone(),
                        rhs: Basic::Const(Const::Int(*low + i as i32)),
                        target: *t,
                    });
                }
                self.branch_to(stack, *default, pc)?;
                self.emit(Instr::Goto(*default));
                return Ok(Flow::Stop);
            }
            Op::LookupSwitch { default, pairs } => {
                let key = self.pop_expr(stack, pc)?;
                self.check_kind(&key, TyKind::Int, "switch key")?;
                if !stack.is_empty() {
                    return Err(Self::bad("non-empty stack at switch"));
                }
                let key = self.flatten(key);
                for (value, t) in pairs {
                    self.branch_to(stack, *t, pc)?;
                    self.emit(Instr::Ifd {
                        cmp: Comp::Eq,
                        lhs: key.clone(),
                        rhs: Basic::Const(Const::Int(*value)),
                        target: *t,
                    });
                }
                self.branch_to(stack, *default, pc)?;
                self.emit(Instr::Goto(*default));
                return Ok(Flow::Stop);
            }

            Op::Return(kind) => {
                let value = match kind {
                    None => None,
                    Some(k) => {
                        let e = self.pop_expr(stack, pc)?;
                        self.check_kind(&e, load_kind(*k), "return")?;
                        Some(self.flatten(e))
                    }
                };
                self.emit(Instr::Return(value));
                return Ok(Flow::Stop);
            }
            Op::Throw => {
                let e = self.pop_expr(stack, pc)?;
                let e = self.flatten(e);
                self.emit(Instr::Check(Check::NullPointer(e.clone())));
                self.emit(Instr::Throw(e));
                return Ok(Flow::Stop);
            }

            // ============================================================
            // Fields
            // ============================================================
            Op::GetField(class, fs) => {
                let obj = self.pop_expr(stack, pc)?;
                self.check_kind(&obj, TyKind::Ref, "field read")?;
                let obj = self.flatten(obj);
                self.check_link(op);
                self.emit(Instr::Check(Check::NullPointer(obj.clone())));
                stack.push(Slot::Expr(SExpr::Field(
                    Box::new(SExpr::Basic(obj)),
                    class.clone(),
                    fs.clone(),
                )));
            }
            Op::PutField(class, fs) => {
                let val = self.pop_expr(stack, pc)?;
                let obj = self.pop_expr(stack, pc)?;
                self.check_kind(&obj, TyKind::Ref, "field write")?;
                self.flush_stack(stack);
                let obj = self.flatten(obj);
                let val = self.flatten(val);
                self.check_link(op);
                self.emit(Instr::Check(Check::NullPointer(obj.clone())));
                self.emit(Instr::AffectField(obj, class.clone(), fs.clone(), val));
            }
            Op::GetStatic(class, fs) => {
                self.check_link(op);
                self.emit(Instr::MayInit(class.clone()));
                stack.push(Slot::Expr(SExpr::StaticField(class.clone(), fs.clone())));
            }
            Op::PutStatic(class, fs) => {
                let val = self.pop_expr(stack, pc)?;
                self.flush_stack(stack);
                self.check_link(op);
                self.emit(Instr::MayInit(class.clone()));
                let expr = self.expr1(val);
                self.emit(Instr::AffectStaticField(class.clone(), fs.clone(), expr));
            }

            // ============================================================
            // Calls
            // ============================================================
            Op::InvokeVirtual(recv_ty, ms) => {
                let args = self.pop_args(stack, ms.params.len())?;
                let recv = self.pop_expr(stack, pc)?;
                self.flush_stack(stack);
                let recv = self.flatten(recv);
                let args = self.args_to_basics(args, pc)?;
                self.emit(Instr::Check(Check::NullPointer(recv.clone())));
                self.check_link(op);
                let result = self.call_result(ms.ret.as_ref(), stack);
                self.emit(Instr::InvokeVirtual(
                    result,
                    recv,
                    VirtualKind::Virtual(recv_ty.clone()),
                    ms.clone(),
                    args,
                ));
            }
            Op::InvokeInterface(iface, ms) => {
                let args = self.pop_args(stack, ms.params.len())?;
                let recv = self.pop_expr(stack, pc)?;
                self.flush_stack(stack);
                let recv = self.flatten(recv);
                let args = self.args_to_basics(args, pc)?;
                self.emit(Instr::Check(Check::NullPointer(recv.clone())));
                self.check_link(op);
                let result = self.call_result(ms.ret.as_ref(), stack);
                self.emit(Instr::InvokeVirtual(
                    result,
                    recv,
                    VirtualKind::Interface(iface.clone()),
                    ms.clone(),
                    args,
                ));
            }
            Op::InvokeStatic(class, ms) => {
                let args = self.pop_args(stack, ms.params.len())?;
                self.flush_stack(stack);
                let args = self.args_to_basics(args, pc)?;
                self.check_link(op);
                self.emit(Instr::MayInit(class.clone()));
                let result = self.call_result(ms.ret.as_ref(), stack);
                self.emit(Instr::InvokeStatic(result, class.clone(), ms.clone(), args));
            }
            Op::InvokeSpecial(class, ms) => {
                let args = self.pop_args(stack, ms.params.len())?;
                let recv = self.pop(stack)?;
                if ms.name == "<init>" {
                    match recv {
                        Slot::Uninit { pc: alloc_pc, class: uninit_class } => {
                            if &uninit_class != class
                                || args.iter().any(|a| matches!(a, Slot::Uninit { .. }))
                            {
                                return Err(TransformError::ContentConstraintOnUninit { pc });
                            }
                            self.flush_stack(stack);
                            let args = self.args_to_basics(args, pc)?;
                            self.check_link(op);
                            let t = self.fresh();
                            self.emit(Instr::New(
                                t,
                                class.clone(),
                                ms.params.clone(),
                                args,
                            ));
                            // Every surviving copy of the marker (the usual
                            // dup'd reference) now denotes the built object.
                            let built = Slot::Expr(SExpr::Basic(Basic::Var(
                                ValueType::Object(ObjectType::Class(class.clone())),
                                t,
                            )));
                            for slot in stack.iter_mut() {
                                if matches!(slot, Slot::Uninit { pc: p, class: c }
                                    if *p == alloc_pc && c == &uninit_class)
                                {
                                    *slot = built.clone();
                                }
                            }
                        }
                        Slot::Expr(recv) => {
                            // super(...) / this(...) constructor call.
                            self.flush_stack(stack);
                            let recv = self.flatten(recv);
                            let args = self.args_to_basics(args, pc)?;
                            self.emit(Instr::Check(Check::NullPointer(recv.clone())));
                            self.check_link(op);
                            self.emit(Instr::InvokeNonVirtual(
                                None,
                                recv,
                                class.clone(),
                                ms.clone(),
                                args,
                            ));
                        }
                    }
                } else {
                    let recv = match recv {
                        Slot::Expr(e) => e,
                        Slot::Uninit { .. } => {
                            return Err(TransformError::UninitIsNotExpr { pc })
                        }
                    };
                    self.flush_stack(stack);
                    let recv = self.flatten(recv);
                    let args = self.args_to_basics(args, pc)?;
                    self.emit(Instr::Check(Check::NullPointer(recv.clone())));
                    self.check_link(op);
                    let result = self.call_result(ms.ret.as_ref(), stack);
                    self.emit(Instr::InvokeNonVirtual(
                        result,
                        recv,
                        class.clone(),
                        ms.clone(),
                        args,
                    ));
                }
            }

            // ============================================================
            // Allocation
            // ============================================================
            Op::New(class) => {
                self.check_link(op);
                stack.push(Slot::Uninit {
                    pc,
                    class: class.clone(),
                });
            }
            Op::NewArray(elem) => {
                let len = self.pop_expr(stack, pc)?;
                self.check_kind(&len, TyKind::Int, "array length")?;
                self.check_link(op);
                let len = self.flatten(len);
                self.emit(Instr::Check(Check::NegativeArraySize(len.clone())));
                let t = self.fresh();
                let arr_ty = ValueType::Object(ObjectType::Array(Box::new(elem.clone())));
                self.emit(Instr::NewArray(t, elem.clone(), vec![len]));
                stack.push(Slot::Expr(SExpr::Basic(Basic::Var(arr_ty, t))));
            }
            Op::MultiNewArray(arr_ty, dims) => {
                if *dims == 0 {
                    return Err(TransformError::BadMultiarrayDimension);
                }
                self.check_link(op);
                let mut dim_exprs = Vec::with_capacity(*dims as usize);
                for _ in 0..*dims {
                    dim_exprs.push(self.pop_expr(stack, pc)?);
                }
                dim_exprs.reverse();
                let mut dim_basics = Vec::with_capacity(dim_exprs.len());
                for d in dim_exprs {
                    self.check_kind(&d, TyKind::Int, "array dimension")?;
                    dim_basics.push(self.flatten(d));
                }
                for d in &dim_basics {
                    self.emit(Instr::Check(Check::NegativeArraySize(d.clone())));
                }
                let elem = strip_dims(arr_ty, *dims)?;
                let t = self.fresh();
                self.emit(Instr::NewArray(t, elem, dim_basics));
                stack.push(Slot::Expr(SExpr::Basic(Basic::Var(
                    ValueType::Object(arr_ty.clone()),
                    t,
                ))));
            }

            // ============================================================
            // Casts, monitors
            // ============================================================
            Op::CheckCast(ty) => {
                let e = self.pop_expr(stack, pc)?;
                let e = self.flatten(e);
                self.check_link(op);
                self.emit(Instr::Check(Check::Cast(e.clone(), ty.clone())));
                stack.push(Slot::Expr(SExpr::Unop(
                    Unop::Cast(ty.clone()),
                    Box::new(SExpr::Basic(e)),
                )));
            }
            Op::InstanceOf(ty) => {
                let e = self.pop_expr(stack, pc)?;
                self.check_link(op);
                stack.push(Slot::Expr(SExpr::Unop(
                    Unop::InstanceOf(ty.clone()),
                    Box::new(e),
                )));
            }
            Op::MonitorEnter => {
                let e = self.pop_expr(stack, pc)?;
                self.flush_stack(stack);
                let e = self.flatten(e);
                self.emit(Instr::Check(Check::NullPointer(e.clone())));
                self.emit(Instr::MonitorEnter(e));
            }
            Op::MonitorExit => {
                let e = self.pop_expr(stack, pc)?;
                self.flush_stack(stack);
                let e = self.flatten(e);
                self.emit(Instr::Check(Check::NullPointer(e.clone())));
                self.emit(Instr::MonitorExit(e));
            }

            Op::Invalid => return Err(Self::bad(format!("execution of padding byte at {pc}"))),
        }
        Ok(Flow::Fall)
    }

    fn call_result(&mut self, ret: Option<&ValueType>, stack: &mut Vec<Slot>) -> Option<Var> {
        match ret {
            None => None,
            Some(ty) => {
                let t = self.fresh();
                stack.push(Slot::Expr(SExpr::Basic(Basic::Var(ty.clone(), t))));
                Some(t)
            }
        }
    }
}

/// Element type of a `multianewarray` result: the array type with `dims`
/// dimensions stripped.
fn strip_dims(arr_ty: &ObjectType, dims: u8) -> Res<ValueType> {
    let mut ty = ValueType::Object(arr_ty.clone());
    for _ in 0..dims {
        match ty {
            ValueType::Object(ObjectType::Array(inner)) => ty = *inner,
            _ => {
                return Err(Transformer::bad(
                    "multianewarray dimension exceeds array depth",
                ))
            }
        }
    }
    Ok(ty)
}
