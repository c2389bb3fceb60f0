//! Class-file reader.
//!
//! A single pass over the `.class` bytes that resolves the constant pool
//! eagerly and produces the decoded [`ClassData`] model. Only the attributes
//! the analysis consumes are decoded (`Code`, `LineNumberTable`,
//! `LocalVariableTable`); everything else is skipped.

use std::collections::BTreeMap;
use std::io::Cursor;

use binrw::{BinRead, Endian};

use super::descriptor::{
    parse_object_type, parse_type_descriptor, ClassName, FieldSignature, MethodSignature,
    ObjectType,
};
use super::opcode::decode_code;
use super::{
    Bytecode, ClassData, ClassFlags, Const, ExceptionEntry, FieldData, FieldFlags, MethodData,
    MethodFlags,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ClassError {
    Io(std::io::Error),
    Zip(zip::result::ZipError),
    Read(binrw::Error),
    Malformed(String),
    UnsupportedOpcode(u8),
    NotFound(ClassName),
}

impl std::fmt::Display for ClassError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassError::Io(e) => write!(f, "I/O error: {e}"),
            ClassError::Zip(e) => write!(f, "ZIP error: {e}"),
            ClassError::Read(e) => write!(f, "class read error: {e}"),
            ClassError::Malformed(msg) => write!(f, "malformed class file: {msg}"),
            ClassError::UnsupportedOpcode(op) => write!(f, "unsupported opcode 0x{op:02x}"),
            ClassError::NotFound(name) => write!(f, "class not found: {name}"),
        }
    }
}

impl std::error::Error for ClassError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClassError::Io(e) => Some(e),
            ClassError::Zip(e) => Some(e),
            ClassError::Read(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClassError {
    fn from(e: std::io::Error) -> Self {
        ClassError::Io(e)
    }
}

impl From<zip::result::ZipError> for ClassError {
    fn from(e: zip::result::ZipError) -> Self {
        ClassError::Zip(e)
    }
}

impl From<binrw::Error> for ClassError {
    fn from(e: binrw::Error) -> Self {
        ClassError::Read(e)
    }
}

pub type ClassResult<T> = Result<T, ClassError>;

// ---------------------------------------------------------------------------
// Constant pool
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum CpEntry {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    Str(u16),
    FieldRef { class: u16, nat: u16 },
    MethodRef { class: u16, nat: u16 },
    NameAndType { name: u16, desc: u16 },
    /// MethodHandle, MethodType, Dynamic, InvokeDynamic, Module, Package:
    /// present in the pool but never consulted by the analysis.
    Other,
    /// Second slot of a Long or Double entry.
    Unusable,
}

/// The resolved constant pool of one class file.
#[derive(Clone, Debug, Default)]
pub struct ConstantPool {
    entries: Vec<CpEntry>,
}

impl ConstantPool {
    fn get(&self, index: u16) -> ClassResult<&CpEntry> {
        self.entries
            .get((index as usize).wrapping_sub(1))
            .ok_or_else(|| ClassError::Malformed(format!("constant pool index {index} out of range")))
    }

    pub fn utf8(&self, index: u16) -> ClassResult<&str> {
        match self.get(index)? {
            CpEntry::Utf8(s) => Ok(s),
            other => Err(ClassError::Malformed(format!(
                "expected Utf8 at cp#{index}, found {other:?}"
            ))),
        }
    }

    /// The raw name of a `CONSTANT_Class` entry (may be an array descriptor).
    pub fn class_name(&self, index: u16) -> ClassResult<ClassName> {
        match self.get(index)? {
            CpEntry::Class(name_index) => Ok(self.utf8(*name_index)?.to_string()),
            other => Err(ClassError::Malformed(format!(
                "expected Class at cp#{index}, found {other:?}"
            ))),
        }
    }

    /// A `CONSTANT_Class` entry resolved to an object type.
    pub fn object_type(&self, index: u16) -> ClassResult<ObjectType> {
        let name = self.class_name(index)?;
        parse_object_type(&name)
            .ok_or_else(|| ClassError::Malformed(format!("bad class constant '{name}'")))
    }

    fn name_and_type(&self, index: u16) -> ClassResult<(&str, &str)> {
        match self.get(index)? {
            CpEntry::NameAndType { name, desc } => Ok((self.utf8(*name)?, self.utf8(*desc)?)),
            other => Err(ClassError::Malformed(format!(
                "expected NameAndType at cp#{index}, found {other:?}"
            ))),
        }
    }

    pub fn field_ref(&self, index: u16) -> ClassResult<(ClassName, FieldSignature)> {
        match self.get(index)? {
            CpEntry::FieldRef { class, nat } => {
                let class_name = self.class_name(*class)?;
                let (name, desc) = self.name_and_type(*nat)?;
                let ty = parse_type_descriptor(desc).ok_or_else(|| {
                    ClassError::Malformed(format!("bad field descriptor '{desc}'"))
                })?;
                Ok((
                    class_name,
                    FieldSignature {
                        name: name.to_string(),
                        ty,
                    },
                ))
            }
            other => Err(ClassError::Malformed(format!(
                "expected FieldRef at cp#{index}, found {other:?}"
            ))),
        }
    }

    pub fn method_ref(&self, index: u16) -> ClassResult<(ObjectType, MethodSignature)> {
        match self.get(index)? {
            CpEntry::MethodRef { class, nat } => {
                let receiver = self.object_type(*class)?;
                let (name, desc) = self.name_and_type(*nat)?;
                let sig = MethodSignature::parse(name, desc).ok_or_else(|| {
                    ClassError::Malformed(format!("bad method descriptor '{desc}'"))
                })?;
                Ok((receiver, sig))
            }
            other => Err(ClassError::Malformed(format!(
                "expected MethodRef at cp#{index}, found {other:?}"
            ))),
        }
    }

    /// Resolve an `ldc`/`ldc_w`/`ldc2_w` operand.
    pub fn loadable_const(&self, index: u16) -> ClassResult<Const> {
        match self.get(index)? {
            CpEntry::Integer(v) => Ok(Const::Int(*v)),
            CpEntry::Float(v) => Ok(Const::Float(*v)),
            CpEntry::Long(v) => Ok(Const::Long(*v)),
            CpEntry::Double(v) => Ok(Const::Double(*v)),
            CpEntry::Str(utf8) => Ok(Const::Str(self.utf8(*utf8)?.to_string())),
            CpEntry::Class(_) => Ok(Const::Class(self.object_type(index)?)),
            other => Err(ClassError::Malformed(format!(
                "cp#{index} is not a loadable constant: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

const MAGIC: u32 = 0xcafe_babe;

fn u8(r: &mut Cursor<&[u8]>) -> ClassResult<u8> {
    Ok(u8::read_options(r, Endian::Big, ())?)
}

fn u16(r: &mut Cursor<&[u8]>) -> ClassResult<u16> {
    Ok(u16::read_options(r, Endian::Big, ())?)
}

fn u32(r: &mut Cursor<&[u8]>) -> ClassResult<u32> {
    Ok(u32::read_options(r, Endian::Big, ())?)
}

fn bytes(r: &mut Cursor<&[u8]>, len: usize) -> ClassResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    std::io::Read::read_exact(r, &mut buf)?;
    Ok(buf)
}

fn skip(r: &mut Cursor<&[u8]>, len: usize) -> ClassResult<()> {
    let pos = r.position() + len as u64;
    if pos > r.get_ref().len() as u64 {
        return Err(ClassError::Malformed("attribute overruns class file".into()));
    }
    r.set_position(pos);
    Ok(())
}

fn read_pool(r: &mut Cursor<&[u8]>) -> ClassResult<ConstantPool> {
    let count = u16(r)?;
    let mut entries = Vec::with_capacity(count.saturating_sub(1) as usize);
    let mut i = 1;
    while i < count {
        let tag = u8(r)?;
        let entry = match tag {
            1 => {
                let len = u16(r)? as usize;
                let raw = bytes(r, len)?;
                CpEntry::Utf8(String::from_utf8_lossy(&raw).into_owned())
            }
            3 => CpEntry::Integer(u32(r)? as i32),
            4 => CpEntry::Float(f32::from_bits(u32(r)?)),
            5 => CpEntry::Long(((u32(r)? as u64) << 32 | u32(r)? as u64) as i64),
            6 => CpEntry::Double(f64::from_bits((u32(r)? as u64) << 32 | u32(r)? as u64)),
            7 => CpEntry::Class(u16(r)?),
            8 => CpEntry::Str(u16(r)?),
            9 => CpEntry::FieldRef {
                class: u16(r)?,
                nat: u16(r)?,
            },
            10 | 11 => CpEntry::MethodRef {
                class: u16(r)?,
                nat: u16(r)?,
            },
            12 => CpEntry::NameAndType {
                name: u16(r)?,
                desc: u16(r)?,
            },
            15 => {
                skip(r, 3)?;
                CpEntry::Other
            }
            16 | 19 | 20 => {
                skip(r, 2)?;
                CpEntry::Other
            }
            17 | 18 => {
                skip(r, 4)?;
                CpEntry::Other
            }
            other => {
                return Err(ClassError::Malformed(format!(
                    "unknown constant pool tag {other}"
                )))
            }
        };
        let two_slots = matches!(entry, CpEntry::Long(_) | CpEntry::Double(_));
        entries.push(entry);
        if two_slots {
            entries.push(CpEntry::Unusable);
            i += 1;
        }
        i += 1;
    }
    Ok(ConstantPool { entries })
}

fn read_exception_table(
    r: &mut Cursor<&[u8]>,
    pool: &ConstantPool,
) -> ClassResult<Vec<ExceptionEntry>> {
    let count = u16(r)?;
    let mut table = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start_pc = u16(r)? as usize;
        let end_pc = u16(r)? as usize;
        let handler_pc = u16(r)? as usize;
        let catch_index = u16(r)?;
        let catch_type = if catch_index == 0 {
            None
        } else {
            Some(pool.class_name(catch_index)?)
        };
        table.push(ExceptionEntry {
            start_pc,
            end_pc,
            handler_pc,
            catch_type,
        });
    }
    Ok(table)
}

fn read_code_attribute(r: &mut Cursor<&[u8]>, pool: &ConstantPool) -> ClassResult<Bytecode> {
    let max_stack = u16(r)?;
    let max_locals = u16(r)?;
    let code_len = u32(r)? as usize;
    let code = bytes(r, code_len)?;
    let exception_table = read_exception_table(r, pool)?;

    let mut line_numbers = None;
    let mut local_names = BTreeMap::new();

    let attr_count = u16(r)?;
    for _ in 0..attr_count {
        let name_index = u16(r)?;
        let len = u32(r)? as usize;
        match pool.utf8(name_index)? {
            "LineNumberTable" => {
                let entries = u16(r)?;
                let mut table = Vec::with_capacity(entries as usize);
                for _ in 0..entries {
                    table.push((u16(r)?, u16(r)?));
                }
                line_numbers = Some(table);
            }
            "LocalVariableTable" => {
                let entries = u16(r)?;
                for _ in 0..entries {
                    let _start = u16(r)?;
                    let _length = u16(r)?;
                    let name_idx = u16(r)?;
                    let _desc_idx = u16(r)?;
                    let slot = u16(r)?;
                    local_names
                        .entry(slot)
                        .or_insert_with(|| pool.utf8(name_idx).unwrap_or("").to_string());
                }
            }
            _ => skip(r, len)?,
        }
    }

    let ops = decode_code(&code, pool)?;
    Ok(Bytecode {
        max_stack,
        max_locals,
        ops,
        exception_table,
        line_numbers,
        local_names,
    })
}

fn read_field(r: &mut Cursor<&[u8]>, pool: &ConstantPool) -> ClassResult<FieldData> {
    let flags = FieldFlags::from_bits_retain(u16(r)?);
    let name = pool.utf8(u16(r)?)?.to_string();
    let desc = pool.utf8(u16(r)?)?.to_string();
    let ty = parse_type_descriptor(&desc)
        .ok_or_else(|| ClassError::Malformed(format!("bad field descriptor '{desc}'")))?;
    let attr_count = u16(r)?;
    for _ in 0..attr_count {
        let _name = u16(r)?;
        let len = u32(r)? as usize;
        skip(r, len)?;
    }
    Ok(FieldData {
        signature: FieldSignature { name, ty },
        flags,
    })
}

fn read_method(r: &mut Cursor<&[u8]>, pool: &ConstantPool) -> ClassResult<MethodData> {
    let flags = MethodFlags::from_bits_retain(u16(r)?);
    let name = pool.utf8(u16(r)?)?.to_string();
    let desc = pool.utf8(u16(r)?)?.to_string();
    let signature = MethodSignature::parse(&name, &desc)
        .ok_or_else(|| ClassError::Malformed(format!("bad method descriptor '{desc}'")))?;

    let mut code = None;
    let attr_count = u16(r)?;
    for _ in 0..attr_count {
        let name_index = u16(r)?;
        let len = u32(r)? as usize;
        if pool.utf8(name_index)? == "Code" {
            let end = r.position() + len as u64;
            match read_code_attribute(r, pool) {
                Ok(bytecode) => code = Some(bytecode),
                Err(ClassError::UnsupportedOpcode(op)) => {
                    // Keep the method, lose its body: downstream treats it
                    // like a native method.
                    log::warn!(
                        "method {name}{desc} uses unsupported opcode 0x{op:02x}, dropping body"
                    );
                    r.set_position(end);
                }
                Err(e) => return Err(e),
            }
        } else {
            skip(r, len)?;
        }
    }
    Ok(MethodData {
        signature,
        flags,
        code,
    })
}

/// Parse a `.class` file into the decoded model.
pub fn parse_class(data: &[u8]) -> ClassResult<ClassData> {
    let mut r = Cursor::new(data);
    let magic = u32(&mut r)?;
    if magic != MAGIC {
        return Err(ClassError::Malformed(format!("bad magic 0x{magic:08x}")));
    }
    let _minor = u16(&mut r)?;
    let _major = u16(&mut r)?;

    let pool = read_pool(&mut r)?;

    let flags = ClassFlags::from_bits_retain(u16(&mut r)?);
    let this_class = pool.class_name(u16(&mut r)?)?;
    let super_index = u16(&mut r)?;
    let super_class = if super_index == 0 {
        None
    } else {
        Some(pool.class_name(super_index)?)
    };

    let interface_count = u16(&mut r)?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        interfaces.push(pool.class_name(u16(&mut r)?)?);
    }

    let field_count = u16(&mut r)?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(read_field(&mut r, &pool)?);
    }

    let method_count = u16(&mut r)?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        methods.push(read_method(&mut r, &pool)?);
    }

    // Class-level attributes are not consulted.

    Ok(ClassData {
        name: this_class,
        super_class,
        interfaces,
        flags,
        fields,
        methods,
    })
}
