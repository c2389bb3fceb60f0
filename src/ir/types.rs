//! The three-address intermediate representation.
//!
//! Instructions are stored in a dense array; the successor of `pc` is
//! `pc + 1` unless the instruction is a `Goto`, `Ifd`, `Throw` or `Return`.
//! Every operand position takes a [`Basic`] expression, so the "operands are
//! side-effect-free and syntactically small" invariant is enforced by the
//! type system rather than by a checker.

use std::collections::{BTreeMap, HashMap};

use crate::classfile::opcode::{CmpKind, Conversion, JvmKind, Op};
use crate::classfile::{ClassName, Const, FieldSignature, MethodSignature, ObjectType, ValueType};

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// A variable; equality and ordering are index equality.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Var(pub u32);

impl Var {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a variable came from. The per-method dictionary interns origins,
/// so within a method no two distinct origins share an index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VarOrigin {
    /// A bytecode local slot, with its debug name when available.
    Original(u16, Option<String>),
    /// Transformer-introduced temporary.
    Temp(u32),
    /// The variable bound by the k-th exception handler.
    Catch(u32),
    /// Stack slot `k` canonicalised at a jump to `pc`.
    Branch(u32, usize),
    /// Staging twin of `Branch(k, pc)` used when saves would clobber.
    Branch2(u32, usize),
}

/// Per-method variable dictionary.
#[derive(Clone, Debug, Default)]
pub struct VarDict {
    by_origin: HashMap<VarOrigin, Var>,
    origins: Vec<VarOrigin>,
    next_temp: u32,
}

impl VarDict {
    pub fn new() -> VarDict {
        VarDict::default()
    }

    /// Intern an origin, returning its stable variable.
    pub fn var(&mut self, origin: VarOrigin) -> Var {
        if let Some(&v) = self.by_origin.get(&origin) {
            return v;
        }
        if let VarOrigin::Temp(k) = origin {
            self.next_temp = self.next_temp.max(k + 1);
        }
        let v = Var(self.origins.len() as u32);
        self.by_origin.insert(origin.clone(), v);
        self.origins.push(origin);
        v
    }

    /// A fresh temporary, never seen before in this method.
    pub fn fresh_temp(&mut self) -> Var {
        let k = self.next_temp;
        self.var(VarOrigin::Temp(k))
    }

    pub fn origins(&self) -> &[VarOrigin] {
        &self.origins
    }

    pub fn into_origins(self) -> Vec<VarOrigin> {
        self.origins
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// A basic expression: a constant or a variable. The only thing allowed in
/// operand position.
#[derive(Clone, Debug, PartialEq)]
pub enum Basic {
    Const(Const),
    Var(ValueType, Var),
}

impl Basic {
    pub fn var(&self) -> Option<Var> {
        match self {
            Basic::Var(_, v) => Some(*v),
            Basic::Const(_) => None,
        }
    }
}

/// Unary operators.
#[derive(Clone, Debug, PartialEq)]
pub enum Unop {
    Neg(JvmKind),
    Conv(Conversion),
    ArrayLength,
    InstanceOf(ObjectType),
    Cast(ObjectType),
}

/// Binary operators. `ArrayLoad` carries the element type; `Cmp` is the
/// three-way comparison family.
#[derive(Clone, Debug, PartialEq)]
pub enum Binop {
    Add(JvmKind),
    Sub(JvmKind),
    Mul(JvmKind),
    Div(JvmKind),
    Rem(JvmKind),
    Shl(JvmKind),
    Shr(JvmKind),
    Ushr(JvmKind),
    And(JvmKind),
    Or(JvmKind),
    Xor(JvmKind),
    ArrayLoad(ValueType),
    Cmp(CmpKind),
}

/// An expression: reads memory, never writes, never throws (the conditions
/// under which it could throw are materialised as separate [`Check`]s).
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Basic(Basic),
    Unop(Unop, Basic),
    Binop(Binop, Basic, Basic),
    Field(Basic, ClassName, FieldSignature),
    StaticField(ClassName, FieldSignature),
}

/// Comparison used by [`Instr::Ifd`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Comp {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// Dispatch kind of a virtual call site.
#[derive(Clone, Debug, PartialEq)]
pub enum VirtualKind {
    Virtual(ObjectType),
    Interface(ClassName),
}

/// An explicit runtime guard, emitted in JVM exception order.
#[derive(Clone, Debug, PartialEq)]
pub enum Check {
    NullPointer(Basic),
    ArrayBound(Basic, Basic),
    ArrayStore(Basic, Basic),
    NegativeArraySize(Basic),
    Cast(Basic, ObjectType),
    Arithmetic(Basic),
    Link(Op),
}

/// A three-address instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    Nop,
    AffectVar(Var, Expr),
    /// `array[index] = value`
    AffectArray(Basic, Basic, Basic),
    /// `object.field = value`
    AffectField(Basic, ClassName, FieldSignature, Basic),
    AffectStaticField(ClassName, FieldSignature, Expr),
    Goto(usize),
    Ifd {
        cmp: Comp,
        lhs: Basic,
        rhs: Basic,
        target: usize,
    },
    Throw(Basic),
    Return(Option<Basic>),
    /// Folded object construction: allocation plus `<init>` call.
    New(Var, ClassName, Vec<ValueType>, Vec<Basic>),
    /// Array allocation; one dimension expression per dimension.
    NewArray(Var, ValueType, Vec<Basic>),
    InvokeStatic(Option<Var>, ClassName, MethodSignature, Vec<Basic>),
    InvokeVirtual(Option<Var>, Basic, VirtualKind, MethodSignature, Vec<Basic>),
    InvokeNonVirtual(Option<Var>, Basic, ClassName, MethodSignature, Vec<Basic>),
    MonitorEnter(Basic),
    MonitorExit(Basic),
    /// The named class may run its `<clinit>` here.
    MayInit(ClassName),
    Check(Check),
}

impl Instr {
    /// The variable this instruction defines, if any.
    pub fn def(&self) -> Option<Var> {
        match self {
            Instr::AffectVar(v, _) => Some(*v),
            Instr::New(v, ..) | Instr::NewArray(v, ..) => Some(*v),
            Instr::InvokeStatic(res, ..)
            | Instr::InvokeVirtual(res, ..)
            | Instr::InvokeNonVirtual(res, ..) => *res,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Method IR
// ---------------------------------------------------------------------------

/// An exception handler over IR pcs. `e_catch_type == None` is a catch-all.
#[derive(Clone, Debug, PartialEq)]
pub struct Handler {
    pub e_start: usize,
    pub e_end: usize,
    pub e_handler: usize,
    pub e_catch_type: Option<ClassName>,
    pub e_catch_var: Var,
}

/// The IR of one method.
#[derive(Clone, Debug)]
pub struct MethodIr {
    /// Origin of every interned variable, indexed by `Var`.
    pub vars: Vec<VarOrigin>,
    /// Parameter variables in slot order (`this` first for instance methods).
    pub params: Vec<(ValueType, Var)>,
    pub code: Vec<Instr>,
    pub exc_tbl: Vec<Handler>,
    pub line_number_table: Option<Vec<(u16, u16)>>,
    /// Bytecode pc to the first IR pc emitted for it. Sparse: bytecode pcs
    /// that emitted nothing have no entry.
    pub pc_bc2ir: BTreeMap<usize, usize>,
    /// IR pc back to its originating bytecode pc.
    pub pc_ir2bc: Vec<usize>,
    /// `jump_target[pc]` iff `pc` is targeted by a `Goto`, an `Ifd`, or a
    /// handler entry.
    pub jump_target: Vec<bool>,
}

impl MethodIr {
    pub fn origin(&self, v: Var) -> &VarOrigin {
        &self.vars[v.index()]
    }

    /// The source line of an IR pc, through the bytecode pc mapping.
    pub fn line_of(&self, ir_pc: usize) -> Option<u16> {
        let bc = *self.pc_ir2bc.get(ir_pc)?;
        let table = self.line_number_table.as_ref()?;
        table
            .iter()
            .rev()
            .find(|(start, _)| *start as usize <= bc)
            .map(|(_, line)| *line)
    }

    /// Static type of an expression, derived from operand types.
    pub fn type_of_expr(expr: &Expr) -> ValueType {
        match expr {
            Expr::Basic(b) => Self::type_of_basic(b),
            Expr::Unop(op, b) => match op {
                Unop::Neg(k) => kind_type(*k),
                Unop::Conv(c) => c.target_type(),
                Unop::ArrayLength => ValueType::Int,
                Unop::InstanceOf(_) => ValueType::Int,
                Unop::Cast(t) => ValueType::Object(t.clone()),
            },
            Expr::Binop(op, _, _) => match op {
                Binop::Add(k) | Binop::Sub(k) | Binop::Mul(k) | Binop::Div(k) | Binop::Rem(k)
                | Binop::Shl(k) | Binop::Shr(k) | Binop::Ushr(k) | Binop::And(k) | Binop::Or(k)
                | Binop::Xor(k) => kind_type(*k),
                Binop::ArrayLoad(t) => t.clone(),
                Binop::Cmp(_) => ValueType::Int,
            },
            Expr::Field(_, _, fs) | Expr::StaticField(_, fs) => fs.ty.clone(),
        }
    }

    pub fn type_of_basic(b: &Basic) -> ValueType {
        match b {
            Basic::Var(t, _) => t.clone(),
            Basic::Const(c) => match c {
                Const::Null => ValueType::object(),
                Const::Byte(_) => ValueType::Byte,
                Const::Short(_) => ValueType::Short,
                Const::Int(_) => ValueType::Int,
                Const::Long(_) => ValueType::Long,
                Const::Float(_) => ValueType::Float,
                Const::Double(_) => ValueType::Double,
                Const::Str(_) => {
                    ValueType::Object(ObjectType::Class("java/lang/String".to_string()))
                }
                Const::Class(_) => {
                    ValueType::Object(ObjectType::Class("java/lang/Class".to_string()))
                }
            },
        }
    }
}

fn kind_type(kind: JvmKind) -> ValueType {
    match kind {
        JvmKind::Int => ValueType::Int,
        JvmKind::Long => ValueType::Long,
        JvmKind::Float => ValueType::Float,
        JvmKind::Double => ValueType::Double,
    }
}
