//! Decoded class-file model.
//!
//! Unlike the raw class-file format, everything here is resolved: constant
//! pool indices are replaced by names, descriptors are parsed, and bytecode
//! is decoded into a pc-indexed [`Op`] array.

pub mod descriptor;
pub mod opcode;
pub mod reader;

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use descriptor::{
    ClassMethodSig, ClassName, FieldSignature, MethodSignature, ObjectType, ValueType, OBJECT,
};
pub use opcode::Op;
pub use reader::{parse_class, ClassError};

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
    pub struct ClassFlags: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
    pub struct MethodFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const BRIDGE = 0x0040;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
    }
}

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
    pub struct FieldFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const SYNTHETIC = 0x1000;
        const ENUM = 0x4000;
    }
}

/// A loadable constant (`ldc` family, `aconst_null`, `iconst_*`, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Null,
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Class(ObjectType),
}

/// An entry of the exception table, with the catch type resolved.
/// `catch_type == None` is a catch-all (`finally`-equivalent) handler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub start_pc: usize,
    pub end_pc: usize,
    pub handler_pc: usize,
    pub catch_type: Option<ClassName>,
}

/// Decoded `Code` attribute: a pc-indexed opcode array plus its tables.
///
/// `ops[pc]` is the instruction starting at bytecode offset `pc`, or
/// [`Op::Invalid`] if `pc` falls inside a multi-byte instruction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bytecode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub ops: Vec<Op>,
    pub exception_table: Vec<ExceptionEntry>,
    /// `(start_pc, line_number)` pairs from the LineNumberTable, if present.
    pub line_numbers: Option<Vec<(u16, u16)>>,
    /// Local slot index to debug name, from the LocalVariableTable.
    pub local_names: BTreeMap<u16, String>,
}

/// A method of a decoded class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MethodData {
    pub signature: MethodSignature,
    pub flags: MethodFlags,
    pub code: Option<Bytecode>,
}

impl MethodData {
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodFlags::ABSTRACT)
    }

    /// A method is concrete if it can be a dispatch target.
    pub fn is_concrete(&self) -> bool {
        !self.is_abstract()
    }
}

/// A field of a decoded class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldData {
    pub signature: FieldSignature,
    pub flags: FieldFlags,
}

impl FieldData {
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }
}

/// A decoded class or interface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassData {
    pub name: ClassName,
    pub super_class: Option<ClassName>,
    pub interfaces: Vec<ClassName>,
    pub flags: ClassFlags,
    pub fields: Vec<FieldData>,
    pub methods: Vec<MethodData>,
}

impl ClassData {
    pub fn is_interface(&self) -> bool {
        self.flags.contains(ClassFlags::INTERFACE)
    }

    /// Find a method by its full signature.
    pub fn method(&self, sig: &MethodSignature) -> Option<&MethodData> {
        self.methods.iter().find(|m| &m.signature == sig)
    }

    /// Find a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldData> {
        self.fields.iter().find(|f| f.signature.name == name)
    }
}
