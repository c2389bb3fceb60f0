//! JVM type descriptors, field and method signatures.

use serde::{Deserialize, Serialize};

/// Internal (slash-separated) class name, e.g. `java/lang/Object`.
pub type ClassName = String;

pub const OBJECT: &str = "java/lang/Object";

/// A JVM value type, as denoted by a field descriptor.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Byte,
    Char,
    Short,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Object(ObjectType),
}

/// A reference type: a class or an array.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Class(ClassName),
    Array(Box<ValueType>),
}

impl ValueType {
    /// Returns true if this type occupies two local-variable slots.
    pub fn is_wide(&self) -> bool {
        matches!(self, ValueType::Long | ValueType::Double)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, ValueType::Object(_))
    }

    /// The JVM descriptor string for this type.
    pub fn descriptor(&self) -> String {
        match self {
            ValueType::Byte => "B".into(),
            ValueType::Char => "C".into(),
            ValueType::Short => "S".into(),
            ValueType::Boolean => "Z".into(),
            ValueType::Int => "I".into(),
            ValueType::Long => "J".into(),
            ValueType::Float => "F".into(),
            ValueType::Double => "D".into(),
            ValueType::Object(o) => o.descriptor(),
        }
    }

    /// A reference to `java/lang/Object`, the fallback type for untyped slots.
    pub fn object() -> ValueType {
        ValueType::Object(ObjectType::Class(OBJECT.to_string()))
    }
}

impl ObjectType {
    pub fn descriptor(&self) -> String {
        match self {
            ObjectType::Class(name) => format!("L{};", name),
            ObjectType::Array(inner) => format!("[{}", inner.descriptor()),
        }
    }

    /// The class a method call on this receiver type resolves against
    /// (arrays dispatch through `java/lang/Object`).
    pub fn dispatch_class(&self) -> &str {
        match self {
            ObjectType::Class(name) => name,
            ObjectType::Array(_) => OBJECT,
        }
    }
}

/// Parse a single type descriptor starting at byte `pos`.
/// Returns the type and the position of the next unread byte.
pub fn parse_type_at(desc: &str, pos: usize) -> Option<(ValueType, usize)> {
    let bytes = desc.as_bytes();
    match bytes.get(pos)? {
        b'B' => Some((ValueType::Byte, pos + 1)),
        b'C' => Some((ValueType::Char, pos + 1)),
        b'S' => Some((ValueType::Short, pos + 1)),
        b'Z' => Some((ValueType::Boolean, pos + 1)),
        b'I' => Some((ValueType::Int, pos + 1)),
        b'J' => Some((ValueType::Long, pos + 1)),
        b'F' => Some((ValueType::Float, pos + 1)),
        b'D' => Some((ValueType::Double, pos + 1)),
        b'L' => {
            let semi = desc[pos + 1..].find(';')?;
            let name = &desc[pos + 1..pos + 1 + semi];
            Some((
                ValueType::Object(ObjectType::Class(name.to_string())),
                pos + semi + 2,
            ))
        }
        b'[' => {
            let (inner, next) = parse_type_at(desc, pos + 1)?;
            Some((ValueType::Object(ObjectType::Array(Box::new(inner))), next))
        }
        _ => None,
    }
}

/// Parse a full field descriptor.
pub fn parse_type_descriptor(desc: &str) -> Option<ValueType> {
    let (ty, next) = parse_type_at(desc, 0)?;
    if next == desc.len() {
        Some(ty)
    } else {
        None
    }
}

/// Parse an object-type descriptor as it appears in a `CONSTANT_Class`:
/// either an internal class name or an array descriptor.
pub fn parse_object_type(name: &str) -> Option<ObjectType> {
    if name.starts_with('[') {
        match parse_type_descriptor(name)? {
            ValueType::Object(o) => Some(o),
            _ => None,
        }
    } else {
        Some(ObjectType::Class(name.to_string()))
    }
}

/// Parse a method descriptor, e.g. `(II)V` -> ([Int, Int], None).
pub fn parse_method_descriptor(desc: &str) -> Option<(Vec<ValueType>, Option<ValueType>)> {
    if !desc.starts_with('(') {
        return None;
    }
    let close = desc.find(')')?;
    let mut params = Vec::new();
    let mut pos = 1;
    while pos < close {
        let (ty, next) = parse_type_at(desc, pos)?;
        params.push(ty);
        pos = next;
    }
    let ret = if &desc[close + 1..] == "V" {
        None
    } else {
        Some(parse_type_descriptor(&desc[close + 1..])?)
    };
    Some((params, ret))
}

/// A method name together with its parsed descriptor.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<ValueType>,
    pub ret: Option<ValueType>,
}

impl MethodSignature {
    pub fn parse(name: &str, descriptor: &str) -> Option<MethodSignature> {
        let (params, ret) = parse_method_descriptor(descriptor)?;
        Some(MethodSignature {
            name: name.to_string(),
            params,
            ret,
        })
    }

    pub fn descriptor(&self) -> String {
        let mut out = String::from("(");
        for p in &self.params {
            out.push_str(&p.descriptor());
        }
        out.push(')');
        match &self.ret {
            Some(t) => out.push_str(&t.descriptor()),
            None => out.push('V'),
        }
        out
    }
}

/// A field name together with its parsed type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldSignature {
    pub name: String,
    pub ty: ValueType,
}

/// A `(class, method signature)` pair identifying a concrete method.
pub type ClassMethodSig = (ClassName, MethodSignature);
