//! Decoded JVM instructions.
//!
//! The `Code` byte array is decoded into a pc-indexed `Vec<Op>`: the slot at
//! a bytecode offset holds the instruction starting there, and the slots
//! covered by its operand bytes hold [`Op::Invalid`]. Branch targets are
//! absolute bytecode pcs. Family opcodes (`iload_0`, `iconst_2`, ...) are
//! collapsed into their parameterised forms.

use serde::{Deserialize, Serialize};

use super::descriptor::{ClassName, FieldSignature, MethodSignature, ObjectType, ValueType};
use super::reader::{ClassError, ConstantPool};
use super::Const;

/// Computational kind of an arithmetic instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JvmKind {
    Int,
    Long,
    Float,
    Double,
}

/// Kind of a load/store/return instruction (arithmetic kinds plus references).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LoadKind {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl LoadKind {
    /// The value type a load of this kind produces, absent better information.
    pub fn value_type(self) -> ValueType {
        match self {
            LoadKind::Int => ValueType::Int,
            LoadKind::Long => ValueType::Long,
            LoadKind::Float => ValueType::Float,
            LoadKind::Double => ValueType::Double,
            LoadKind::Ref => ValueType::object(),
        }
    }
}

/// Primitive conversion opcodes (`i2l`, `d2f`, ...).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Conversion {
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
}

impl Conversion {
    /// The type the conversion produces.
    pub fn target_type(self) -> ValueType {
        use Conversion::*;
        match self {
            L2I | F2I | D2I => ValueType::Int,
            I2L | F2L | D2L => ValueType::Long,
            I2F | L2F | D2F => ValueType::Float,
            I2D | L2D | F2D => ValueType::Double,
            I2B => ValueType::Byte,
            I2C => ValueType::Char,
            I2S => ValueType::Short,
        }
    }
}

/// Three-way comparison opcodes (`lcmp`, `fcmpl`, `fcmpg`, `dcmpl`, `dcmpg`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CmpKind {
    L,
    FL,
    FG,
    DL,
    DG,
}

/// Branch comparison condition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// A decoded instruction. Branch operands are absolute bytecode pcs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Nop,
    Const(Const),
    Load(LoadKind, u16),
    Store(LoadKind, u16),
    Iinc(u16, i16),
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    /// Array read; the payload is the element type.
    ArrayLoad(ValueType),
    ArrayStore(ValueType),
    Add(JvmKind),
    Sub(JvmKind),
    Mul(JvmKind),
    Div(JvmKind),
    Rem(JvmKind),
    Neg(JvmKind),
    Shl(JvmKind),
    Shr(JvmKind),
    Ushr(JvmKind),
    And(JvmKind),
    Or(JvmKind),
    Xor(JvmKind),
    Conv(Conversion),
    Cmp(CmpKind),
    /// `ifeq` .. `ifle`: compare the top int against zero.
    If0(Cond, usize),
    /// `if_icmpXX`: compare the top two ints.
    IfCmp(Cond, usize),
    /// `if_acmpeq` / `if_acmpne`.
    IfACmp(Cond, usize),
    /// `ifnull` (`Eq`) / `ifnonnull` (`Ne`).
    IfNull(Cond, usize),
    Goto(usize),
    Jsr(usize),
    Ret(u16),
    TableSwitch {
        default: usize,
        low: i32,
        high: i32,
        targets: Vec<usize>,
    },
    LookupSwitch {
        default: usize,
        pairs: Vec<(i32, usize)>,
    },
    Return(Option<LoadKind>),
    GetStatic(ClassName, FieldSignature),
    PutStatic(ClassName, FieldSignature),
    GetField(ClassName, FieldSignature),
    PutField(ClassName, FieldSignature),
    /// The receiver type may be an array (`clone()` on arrays).
    InvokeVirtual(ObjectType, MethodSignature),
    InvokeSpecial(ClassName, MethodSignature),
    InvokeStatic(ClassName, MethodSignature),
    InvokeInterface(ClassName, MethodSignature),
    New(ClassName),
    /// `newarray` / `anewarray`; the payload is the element type.
    NewArray(ValueType),
    /// `multianewarray`: the full array type and the dimension count.
    MultiNewArray(ObjectType, u8),
    ArrayLength,
    Throw,
    CheckCast(ObjectType),
    InstanceOf(ObjectType),
    MonitorEnter,
    MonitorExit,
    /// Padding slot inside a multi-byte instruction; never an instruction start.
    Invalid,
}

impl Op {
    /// True for opcodes whose resolution may trigger class loading.
    pub fn may_link(&self) -> bool {
        matches!(
            self,
            Op::New(_)
                | Op::NewArray(_)
                | Op::MultiNewArray(..)
                | Op::CheckCast(_)
                | Op::InstanceOf(_)
                | Op::GetStatic(..)
                | Op::PutStatic(..)
                | Op::GetField(..)
                | Op::PutField(..)
                | Op::InvokeVirtual(..)
                | Op::InvokeSpecial(..)
                | Op::InvokeStatic(..)
                | Op::InvokeInterface(..)
        )
    }
}

/// Element type of a `newarray` type code.
fn newarray_type(atype: u8) -> Result<ValueType, ClassError> {
    match atype {
        4 => Ok(ValueType::Boolean),
        5 => Ok(ValueType::Char),
        6 => Ok(ValueType::Float),
        7 => Ok(ValueType::Double),
        8 => Ok(ValueType::Byte),
        9 => Ok(ValueType::Short),
        10 => Ok(ValueType::Int),
        11 => Ok(ValueType::Long),
        _ => Err(ClassError::Malformed(format!(
            "bad newarray type code {atype}"
        ))),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, ClassError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| ClassError::Malformed("truncated code array".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i8, ClassError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, ClassError> {
        Ok(((self.u8()? as u16) << 8) | self.u8()? as u16)
    }

    fn i16(&mut self) -> Result<i16, ClassError> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32, ClassError> {
        Ok(((self.u16()? as i32) << 16) | self.u16()? as i32)
    }
}

/// Absolute branch target from an instruction pc and a relative offset.
fn target(pc: usize, offset: i64) -> usize {
    (pc as i64 + offset) as usize
}

/// Decode a `Code` byte array into a pc-indexed instruction vector.
pub fn decode_code(bytes: &[u8], pool: &ConstantPool) -> Result<Vec<Op>, ClassError> {
    let mut ops = vec![Op::Invalid; bytes.len()];
    let mut r = Reader { bytes, pos: 0 };

    while r.pos < bytes.len() {
        let pc = r.pos;
        let opcode = r.u8()?;
        let op = decode_one(opcode, pc, &mut r, pool)?;
        ops[pc] = op;
    }
    Ok(ops)
}

fn decode_one(
    opcode: u8,
    pc: usize,
    r: &mut Reader,
    pool: &ConstantPool,
) -> Result<Op, ClassError> {
    use LoadKind as K;
    let op = match opcode {
        0x00 => Op::Nop,
        0x01 => Op::Const(Const::Null),
        0x02..=0x08 => Op::Const(Const::Int(opcode as i32 - 3)),
        0x09 | 0x0a => Op::Const(Const::Long((opcode - 0x09) as i64)),
        0x0b..=0x0d => Op::Const(Const::Float((opcode - 0x0b) as f32)),
        0x0e | 0x0f => Op::Const(Const::Double((opcode - 0x0e) as f64)),
        0x10 => Op::Const(Const::Byte(r.i8()?)),
        0x11 => Op::Const(Const::Short(r.i16()?)),
        0x12 => Op::Const(pool.loadable_const(r.u8()? as u16)?),
        0x13 | 0x14 => Op::Const(pool.loadable_const(r.u16()?)?),

        0x15 => Op::Load(K::Int, r.u8()? as u16),
        0x16 => Op::Load(K::Long, r.u8()? as u16),
        0x17 => Op::Load(K::Float, r.u8()? as u16),
        0x18 => Op::Load(K::Double, r.u8()? as u16),
        0x19 => Op::Load(K::Ref, r.u8()? as u16),
        0x1a..=0x1d => Op::Load(K::Int, (opcode - 0x1a) as u16),
        0x1e..=0x21 => Op::Load(K::Long, (opcode - 0x1e) as u16),
        0x22..=0x25 => Op::Load(K::Float, (opcode - 0x22) as u16),
        0x26..=0x29 => Op::Load(K::Double, (opcode - 0x26) as u16),
        0x2a..=0x2d => Op::Load(K::Ref, (opcode - 0x2a) as u16),

        0x2e => Op::ArrayLoad(ValueType::Int),
        0x2f => Op::ArrayLoad(ValueType::Long),
        0x30 => Op::ArrayLoad(ValueType::Float),
        0x31 => Op::ArrayLoad(ValueType::Double),
        0x32 => Op::ArrayLoad(ValueType::object()),
        0x33 => Op::ArrayLoad(ValueType::Byte),
        0x34 => Op::ArrayLoad(ValueType::Char),
        0x35 => Op::ArrayLoad(ValueType::Short),

        0x36 => Op::Store(K::Int, r.u8()? as u16),
        0x37 => Op::Store(K::Long, r.u8()? as u16),
        0x38 => Op::Store(K::Float, r.u8()? as u16),
        0x39 => Op::Store(K::Double, r.u8()? as u16),
        0x3a => Op::Store(K::Ref, r.u8()? as u16),
        0x3b..=0x3e => Op::Store(K::Int, (opcode - 0x3b) as u16),
        0x3f..=0x42 => Op::Store(K::Long, (opcode - 0x3f) as u16),
        0x43..=0x46 => Op::Store(K::Float, (opcode - 0x43) as u16),
        0x47..=0x4a => Op::Store(K::Double, (opcode - 0x47) as u16),
        0x4b..=0x4e => Op::Store(K::Ref, (opcode - 0x4b) as u16),

        0x4f => Op::ArrayStore(ValueType::Int),
        0x50 => Op::ArrayStore(ValueType::Long),
        0x51 => Op::ArrayStore(ValueType::Float),
        0x52 => Op::ArrayStore(ValueType::Double),
        0x53 => Op::ArrayStore(ValueType::object()),
        0x54 => Op::ArrayStore(ValueType::Byte),
        0x55 => Op::ArrayStore(ValueType::Char),
        0x56 => Op::ArrayStore(ValueType::Short),

        0x57 => Op::Pop,
        0x58 => Op::Pop2,
        0x59 => Op::Dup,
        0x5a => Op::DupX1,
        0x5b => Op::DupX2,
        0x5c => Op::Dup2,
        0x5d => Op::Dup2X1,
        0x5e => Op::Dup2X2,
        0x5f => Op::Swap,

        0x60..=0x63 => Op::Add(arith_kind(opcode - 0x60)),
        0x64..=0x67 => Op::Sub(arith_kind(opcode - 0x64)),
        0x68..=0x6b => Op::Mul(arith_kind(opcode - 0x68)),
        0x6c..=0x6f => Op::Div(arith_kind(opcode - 0x6c)),
        0x70..=0x73 => Op::Rem(arith_kind(opcode - 0x70)),
        0x74..=0x77 => Op::Neg(arith_kind(opcode - 0x74)),
        0x78 => Op::Shl(JvmKind::Int),
        0x79 => Op::Shl(JvmKind::Long),
        0x7a => Op::Shr(JvmKind::Int),
        0x7b => Op::Shr(JvmKind::Long),
        0x7c => Op::Ushr(JvmKind::Int),
        0x7d => Op::Ushr(JvmKind::Long),
        0x7e => Op::And(JvmKind::Int),
        0x7f => Op::And(JvmKind::Long),
        0x80 => Op::Or(JvmKind::Int),
        0x81 => Op::Or(JvmKind::Long),
        0x82 => Op::Xor(JvmKind::Int),
        0x83 => Op::Xor(JvmKind::Long),

        0x84 => Op::Iinc(r.u8()? as u16, r.i8()? as i16),

        0x85 => Op::Conv(Conversion::I2L),
        0x86 => Op::Conv(Conversion::I2F),
        0x87 => Op::Conv(Conversion::I2D),
        0x88 => Op::Conv(Conversion::L2I),
        0x89 => Op::Conv(Conversion::L2F),
        0x8a => Op::Conv(Conversion::L2D),
        0x8b => Op::Conv(Conversion::F2I),
        0x8c => Op::Conv(Conversion::F2L),
        0x8d => Op::Conv(Conversion::F2D),
        0x8e => Op::Conv(Conversion::D2I),
        0x8f => Op::Conv(Conversion::D2L),
        0x90 => Op::Conv(Conversion::D2F),
        0x91 => Op::Conv(Conversion::I2B),
        0x92 => Op::Conv(Conversion::I2C),
        0x93 => Op::Conv(Conversion::I2S),

        0x94 => Op::Cmp(CmpKind::L),
        0x95 => Op::Cmp(CmpKind::FL),
        0x96 => Op::Cmp(CmpKind::FG),
        0x97 => Op::Cmp(CmpKind::DL),
        0x98 => Op::Cmp(CmpKind::DG),

        0x99..=0x9e => Op::If0(cond(opcode - 0x99), target(pc, r.i16()? as i64)),
        0x9f..=0xa4 => Op::IfCmp(cond(opcode - 0x9f), target(pc, r.i16()? as i64)),
        0xa5 => Op::IfACmp(Cond::Eq, target(pc, r.i16()? as i64)),
        0xa6 => Op::IfACmp(Cond::Ne, target(pc, r.i16()? as i64)),

        0xa7 => Op::Goto(target(pc, r.i16()? as i64)),
        0xa8 => Op::Jsr(target(pc, r.i16()? as i64)),
        0xa9 => Op::Ret(r.u8()? as u16),

        0xaa => {
            while r.pos % 4 != 0 {
                r.u8()?;
            }
            let default = target(pc, r.i32()? as i64);
            let low = r.i32()?;
            let high = r.i32()?;
            if high < low {
                return Err(ClassError::Malformed("tableswitch high < low".into()));
            }
            let count = (high - low + 1) as usize;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(target(pc, r.i32()? as i64));
            }
            Op::TableSwitch {
                default,
                low,
                high,
                targets,
            }
        }
        0xab => {
            while r.pos % 4 != 0 {
                r.u8()?;
            }
            let default = target(pc, r.i32()? as i64);
            let npairs = r.i32()?;
            if npairs < 0 {
                return Err(ClassError::Malformed("lookupswitch npairs < 0".into()));
            }
            let mut pairs = Vec::with_capacity(npairs as usize);
            for _ in 0..npairs {
                let key = r.i32()?;
                pairs.push((key, target(pc, r.i32()? as i64)));
            }
            Op::LookupSwitch { default, pairs }
        }

        0xac => Op::Return(Some(K::Int)),
        0xad => Op::Return(Some(K::Long)),
        0xae => Op::Return(Some(K::Float)),
        0xaf => Op::Return(Some(K::Double)),
        0xb0 => Op::Return(Some(K::Ref)),
        0xb1 => Op::Return(None),

        0xb2 => {
            let (class, field) = pool.field_ref(r.u16()?)?;
            Op::GetStatic(class, field)
        }
        0xb3 => {
            let (class, field) = pool.field_ref(r.u16()?)?;
            Op::PutStatic(class, field)
        }
        0xb4 => {
            let (class, field) = pool.field_ref(r.u16()?)?;
            Op::GetField(class, field)
        }
        0xb5 => {
            let (class, field) = pool.field_ref(r.u16()?)?;
            Op::PutField(class, field)
        }

        0xb6 => {
            let (recv, sig) = pool.method_ref(r.u16()?)?;
            Op::InvokeVirtual(recv, sig)
        }
        0xb7 => {
            let (recv, sig) = pool.method_ref(r.u16()?)?;
            Op::InvokeSpecial(recv.dispatch_class().to_string(), sig)
        }
        0xb8 => {
            let (recv, sig) = pool.method_ref(r.u16()?)?;
            Op::InvokeStatic(recv.dispatch_class().to_string(), sig)
        }
        0xb9 => {
            let (recv, sig) = pool.method_ref(r.u16()?)?;
            r.u8()?; // count
            r.u8()?; // reserved zero
            Op::InvokeInterface(recv.dispatch_class().to_string(), sig)
        }
        0xba => return Err(ClassError::UnsupportedOpcode(0xba)),

        0xbb => Op::New(pool.class_name(r.u16()?)?),
        0xbc => Op::NewArray(newarray_type(r.u8()?)?),
        0xbd => {
            let elem = pool.object_type(r.u16()?)?;
            Op::NewArray(ValueType::Object(elem))
        }

        0xbe => Op::ArrayLength,
        0xbf => Op::Throw,
        0xc0 => Op::CheckCast(pool.object_type(r.u16()?)?),
        0xc1 => Op::InstanceOf(pool.object_type(r.u16()?)?),
        0xc2 => Op::MonitorEnter,
        0xc3 => Op::MonitorExit,

        0xc4 => {
            let sub = r.u8()?;
            let index = r.u16()?;
            match sub {
                0x15 => Op::Load(K::Int, index),
                0x16 => Op::Load(K::Long, index),
                0x17 => Op::Load(K::Float, index),
                0x18 => Op::Load(K::Double, index),
                0x19 => Op::Load(K::Ref, index),
                0x36 => Op::Store(K::Int, index),
                0x37 => Op::Store(K::Long, index),
                0x38 => Op::Store(K::Float, index),
                0x39 => Op::Store(K::Double, index),
                0x3a => Op::Store(K::Ref, index),
                0x84 => Op::Iinc(index, r.i16()?),
                0xa9 => Op::Ret(index),
                _ => {
                    return Err(ClassError::Malformed(format!(
                        "bad wide sub-opcode 0x{sub:02x}"
                    )))
                }
            }
        }

        0xc5 => {
            let ty = pool.object_type(r.u16()?)?;
            Op::MultiNewArray(ty, r.u8()?)
        }
        0xc6 => Op::IfNull(Cond::Eq, target(pc, r.i16()? as i64)),
        0xc7 => Op::IfNull(Cond::Ne, target(pc, r.i16()? as i64)),
        0xc8 => Op::Goto(target(pc, r.i32()? as i64)),
        0xc9 => Op::Jsr(target(pc, r.i32()? as i64)),

        other => return Err(ClassError::UnsupportedOpcode(other)),
    };
    Ok(op)
}

fn arith_kind(index: u8) -> JvmKind {
    match index {
        0 => JvmKind::Int,
        1 => JvmKind::Long,
        2 => JvmKind::Float,
        _ => JvmKind::Double,
    }
}

fn cond(index: u8) -> Cond {
    match index {
        0 => Cond::Eq,
        1 => Cond::Ne,
        2 => Cond::Lt,
        3 => Cond::Ge,
        4 => Cond::Gt,
        _ => Cond::Le,
    }
}

