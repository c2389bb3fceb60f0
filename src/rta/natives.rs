//! Native-method stub tables.
//!
//! Native methods are opaque to bytecode analysis. A stub file supplies, per
//! native method, the classes it may allocate and the methods it may call,
//! so RTA can follow through. The format:
//!
//! ```text
//! method "java/lang/System" "arraycopy(Ljava/lang/Object;ILjava/lang/Object;II)V" {
//!   alloc "java/lang/Object"
//!   call "java/lang/Thread" "init()V"
//! }
//! ```
//!
//! `alloc` takes an internal class name or an array descriptor; `call` takes
//! a class name and a `name(descriptor)` method reference.

use std::collections::HashMap;
use std::path::Path;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
    multi::many0,
    sequence::{delimited, preceded, tuple},
    IResult,
};

use crate::classfile::descriptor::parse_object_type;
use crate::classfile::{ClassName, MethodSignature, ObjectType};

/// What one native method may do.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NativeInfo {
    pub allocated: Vec<ObjectType>,
    pub calls: Vec<(ClassName, MethodSignature)>,
}

/// The stub table: native method to its effects.
#[derive(Clone, Debug, Default)]
pub struct NativeStubs {
    stubs: HashMap<(ClassName, MethodSignature), NativeInfo>,
}

#[derive(Debug)]
pub enum StubError {
    Io(std::io::Error),
    Syntax(String),
}

impl std::fmt::Display for StubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StubError::Io(e) => write!(f, "I/O error: {e}"),
            StubError::Syntax(msg) => write!(f, "stub file syntax error: {msg}"),
        }
    }
}

impl std::error::Error for StubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StubError::Io(e) => Some(e),
            StubError::Syntax(_) => None,
        }
    }
}

impl From<std::io::Error> for StubError {
    fn from(e: std::io::Error) -> Self {
        StubError::Io(e)
    }
}

impl NativeStubs {
    pub fn parse(input: &str) -> Result<NativeStubs, StubError> {
        let (rest, entries) = many0(stub_entry)(input)
            .map_err(|e| StubError::Syntax(e.to_string()))?;
        let (rest, _) = multispace0::<_, nom::error::Error<&str>>(rest)
            .map_err(|e| StubError::Syntax(e.to_string()))?;
        if !rest.is_empty() {
            return Err(StubError::Syntax(format!(
                "trailing input near '{}'",
                &rest[..rest.len().min(40)]
            )));
        }
        let mut stubs = HashMap::new();
        for (key, info) in entries {
            stubs.insert(key, info);
        }
        Ok(NativeStubs { stubs })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<NativeStubs, StubError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn lookup(&self, class: &str, ms: &MethodSignature) -> Option<&NativeInfo> {
        self.stubs.get(&(class.to_string(), ms.clone()))
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Grammar
// ---------------------------------------------------------------------------

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while1(|c| c != '"'), char('"'))(input)
}

enum Effect {
    Alloc(ObjectType),
    Call(ClassName, MethodSignature),
}

fn alloc_entry(input: &str) -> IResult<&str, Effect> {
    let (input, name) = preceded(ws(tag("alloc")), quoted)(input)?;
    match parse_object_type(name) {
        Some(ty) => Ok((input, Effect::Alloc(ty))),
        None => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

fn call_entry(input: &str) -> IResult<&str, Effect> {
    let (input, (class, method)) =
        preceded(ws(tag("call")), tuple((quoted, ws(quoted))))(input)?;
    match parse_method_ref(method) {
        Some(sig) => Ok((input, Effect::Call(class.to_string(), sig))),
        None => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

fn stub_entry(input: &str) -> IResult<&str, ((ClassName, MethodSignature), NativeInfo)> {
    let (input, (_, class, method, effects)) = tuple((
        ws(tag("method")),
        quoted,
        ws(quoted),
        delimited(ws(char('{')), many0(alt((alloc_entry, call_entry))), ws(char('}'))),
    ))(input)?;

    let Some(sig) = parse_method_ref(method) else {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    };

    let mut info = NativeInfo::default();
    for effect in effects {
        match effect {
            Effect::Alloc(ty) => info.allocated.push(ty),
            Effect::Call(c, m) => info.calls.push((c, m)),
        }
    }
    Ok((input, ((class.to_string(), sig), info)))
}

/// Parse `name(descriptor)` into a method signature.
fn parse_method_ref(s: &str) -> Option<MethodSignature> {
    let open = s.find('(')?;
    MethodSignature::parse(&s[..open], &s[open..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ValueType;

    #[test]
    fn parse_stub_table() {
        let text = r#"
            method "java/lang/System" "arraycopy(Ljava/lang/Object;ILjava/lang/Object;II)V" {
              alloc "java/lang/Object"
              alloc "[I"
              call "java/lang/Thread" "start()V"
            }
            method "java/lang/Object" "hashCode()I" { }
        "#;
        let stubs = NativeStubs::parse(text).unwrap();
        assert_eq!(stubs.len(), 2);

        let sig = MethodSignature::parse(
            "arraycopy",
            "(Ljava/lang/Object;ILjava/lang/Object;II)V",
        )
        .unwrap();
        let info = stubs.lookup("java/lang/System", &sig).unwrap();
        assert_eq!(info.allocated.len(), 2);
        assert_eq!(
            info.allocated[1],
            ObjectType::Array(Box::new(ValueType::Int))
        );
        assert_eq!(info.calls.len(), 1);
        assert_eq!(info.calls[0].0, "java/lang/Thread");
    }

    #[test]
    fn reject_garbage() {
        assert!(NativeStubs::parse("method oops").is_err());
        assert!(NativeStubs::parse(r#"method "A" "m()V" { alloc }"#).is_err());
    }

    #[test]
    fn empty_table() {
        assert!(NativeStubs::parse("  \n ").unwrap().is_empty());
    }
}
