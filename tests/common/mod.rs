//! Shared fixtures: synthetic bytecode, synthetic classes, and a minimal
//! class-file assembler for reader tests.
#![allow(dead_code)]

use std::collections::BTreeMap;

use classflow::classfile::{
    Bytecode, ClassData, ClassFlags, ExceptionEntry, FieldData, FieldFlags, MethodData,
    MethodFlags, MethodSignature, Op,
};

/// Route `log` output through the test harness.
pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Lay out instructions at explicit bytecode pcs, padding with `Invalid`.
pub fn bytecode(ops: &[(usize, Op)]) -> Bytecode {
    bytecode_with_handlers(ops, &[])
}

pub fn bytecode_with_handlers(ops: &[(usize, Op)], handlers: &[ExceptionEntry]) -> Bytecode {
    let len = ops.iter().map(|(pc, _)| pc + 1).max().unwrap_or(0);
    let mut vec = vec![Op::Invalid; len];
    for (pc, op) in ops {
        vec[*pc] = op.clone();
    }
    Bytecode {
        max_stack: 16,
        max_locals: 16,
        ops: vec,
        exception_table: handlers.to_vec(),
        line_numbers: None,
        local_names: BTreeMap::new(),
    }
}

pub fn sig(name: &str, desc: &str) -> MethodSignature {
    MethodSignature::parse(name, desc).expect("valid test descriptor")
}

pub fn static_method(name: &str, desc: &str, code: Bytecode) -> MethodData {
    MethodData {
        signature: sig(name, desc),
        flags: MethodFlags::PUBLIC | MethodFlags::STATIC,
        code: Some(code),
    }
}

pub fn instance_method(name: &str, desc: &str, code: Bytecode) -> MethodData {
    MethodData {
        signature: sig(name, desc),
        flags: MethodFlags::PUBLIC,
        code: Some(code),
    }
}

pub fn abstract_method(name: &str, desc: &str) -> MethodData {
    MethodData {
        signature: sig(name, desc),
        flags: MethodFlags::PUBLIC | MethodFlags::ABSTRACT,
        code: None,
    }
}

pub fn native_method(name: &str, desc: &str) -> MethodData {
    MethodData {
        signature: sig(name, desc),
        flags: MethodFlags::PUBLIC | MethodFlags::STATIC | MethodFlags::NATIVE,
        code: None,
    }
}

pub fn field(name: &str, desc: &str) -> FieldData {
    FieldData {
        signature: classflow::classfile::FieldSignature {
            name: name.to_string(),
            ty: classflow::classfile::descriptor::parse_type_descriptor(desc)
                .expect("valid test descriptor"),
        },
        flags: FieldFlags::PUBLIC,
    }
}

pub fn class(
    name: &str,
    super_class: Option<&str>,
    interfaces: &[&str],
    methods: Vec<MethodData>,
) -> ClassData {
    ClassData {
        name: name.to_string(),
        super_class: super_class.map(|s| s.to_string()),
        interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        flags: ClassFlags::PUBLIC | ClassFlags::SUPER,
        fields: Vec::new(),
        methods,
    }
}

pub fn interface(name: &str, methods: Vec<MethodData>) -> ClassData {
    ClassData {
        name: name.to_string(),
        super_class: Some("java/lang/Object".to_string()),
        interfaces: Vec::new(),
        flags: ClassFlags::PUBLIC | ClassFlags::INTERFACE | ClassFlags::ABSTRACT,
        fields: Vec::new(),
        methods,
    }
}

/// The root class: `java/lang/Object` with an empty constructor.
pub fn object_class() -> ClassData {
    class(
        "java/lang/Object",
        None,
        &[],
        vec![instance_method("<init>", "()V", bytecode(&[(0, Op::Return(None))]))],
    )
}

// ---------------------------------------------------------------------------
// Minimal class-file assembler
// ---------------------------------------------------------------------------

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    fn utf8(&mut self, s: &str) {
        self.u8(1);
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }
}

/// Assemble a class file declaring `name` (super `java/lang/Object`) with a
/// single void no-arg method `method_name` whose body is `code` (raw
/// bytecode, e.g. `[0xb1]` for `return`).
///
/// The pool also carries an unused Long constant so the two-slot rule is
/// exercised on every parse.
pub fn assemble_class(name: &str, method_name: &str, code: &[u8]) -> Vec<u8> {
    let mut w = Writer { buf: Vec::new() };
    w.u32(0xcafe_babe);
    w.u16(0); // minor
    w.u16(52); // major (Java 8)

    // Constant pool:
    //   1: Utf8 name           2: Class #1
    //   3: Utf8 "java/lang/Object"  4: Class #3
    //   5: Utf8 method_name    6: Utf8 "()V"
    //   7: Utf8 "Code"         8: Long (two slots)
    w.u16(10); // count = entries + 1 (Long takes slots 8 and 9)
    w.utf8(name);
    w.u8(7);
    w.u16(1);
    w.utf8("java/lang/Object");
    w.u8(7);
    w.u16(3);
    w.utf8(method_name);
    w.utf8("()V");
    w.utf8("Code");
    w.u8(5);
    w.u32(0);
    w.u32(42);

    w.u16(0x0021); // ACC_PUBLIC | ACC_SUPER
    w.u16(2); // this
    w.u16(4); // super
    w.u16(0); // interfaces
    w.u16(0); // fields

    w.u16(1); // methods
    w.u16(0x0009); // ACC_PUBLIC | ACC_STATIC
    w.u16(5); // name
    w.u16(6); // descriptor
    w.u16(1); // one attribute
    w.u16(7); // "Code"
    w.u32(12 + code.len() as u32);
    w.u16(4); // max_stack
    w.u16(4); // max_locals
    w.u32(code.len() as u32);
    w.buf.extend_from_slice(code);
    w.u16(0); // exception table
    w.u16(0); // code attributes

    w.u16(0); // class attributes
    w.buf
}
