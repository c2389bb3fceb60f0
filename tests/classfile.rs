//! Class-file reader and opcode decoder tests, over hand-assembled classes.

mod common;

use classflow::classfile::opcode::{decode_code, Cond, LoadKind, Op};
use classflow::classfile::reader::ConstantPool;
use classflow::classfile::{parse_class, ClassError, Const, MethodFlags};

use common::assemble_class;

#[test]
fn parse_minimal_class() {
    // iconst_0; ifne +4 (-> 5); nop; return
    let bytes = assemble_class("p/A", "run", &[0x03, 0x9a, 0x00, 0x04, 0x00, 0xb1]);
    let class = parse_class(&bytes).unwrap();

    assert_eq!(class.name, "p/A");
    assert_eq!(class.super_class.as_deref(), Some("java/lang/Object"));
    assert!(!class.is_interface());

    let method = &class.methods[0];
    assert_eq!(method.signature.name, "run");
    assert_eq!(method.signature.descriptor(), "()V");
    assert!(method.flags.contains(MethodFlags::STATIC));

    let code = method.code.as_ref().expect("Code attribute decoded");
    assert_eq!(code.max_stack, 4);
    assert_eq!(code.ops.len(), 6);
    assert_eq!(code.ops[0], Op::Const(Const::Int(0)));
    assert_eq!(code.ops[1], Op::If0(Cond::Ne, 5));
    assert_eq!(code.ops[2], Op::Invalid);
    assert_eq!(code.ops[3], Op::Invalid);
    assert_eq!(code.ops[4], Op::Nop);
    assert_eq!(code.ops[5], Op::Return(None));
}

#[test]
fn decode_families_collapse() {
    // iload_1; aload_0; istore_2; lconst_1; lstore 4; return
    let pool = ConstantPool::default();
    let ops = decode_code(&[0x1b, 0x2a, 0x3d, 0x0a, 0x37, 0x04, 0xb1], &pool).unwrap();
    assert_eq!(ops[0], Op::Load(LoadKind::Int, 1));
    assert_eq!(ops[1], Op::Load(LoadKind::Ref, 0));
    assert_eq!(ops[2], Op::Store(LoadKind::Int, 2));
    assert_eq!(ops[3], Op::Const(Const::Long(1)));
    assert_eq!(ops[4], Op::Store(LoadKind::Long, 4));
    assert_eq!(ops[5], Op::Invalid);
    assert_eq!(ops[6], Op::Return(None));
}

#[test]
fn decode_tableswitch_with_padding() {
    let mut bytes = vec![0xaa, 0, 0, 0]; // opcode at pc 0, 3 padding bytes
    bytes.extend_from_slice(&28i32.to_be_bytes()); // default
    bytes.extend_from_slice(&0i32.to_be_bytes()); // low
    bytes.extend_from_slice(&1i32.to_be_bytes()); // high
    bytes.extend_from_slice(&20i32.to_be_bytes());
    bytes.extend_from_slice(&24i32.to_be_bytes());

    let pool = ConstantPool::default();
    let ops = decode_code(&bytes, &pool).unwrap();
    assert_eq!(
        ops[0],
        Op::TableSwitch {
            default: 28,
            low: 0,
            high: 1,
            targets: vec![20, 24],
        }
    );
    assert!(ops[1..].iter().all(|op| *op == Op::Invalid));
}

#[test]
fn decode_wide_iinc() {
    let pool = ConstantPool::default();
    let ops = decode_code(&[0xc4, 0x84, 0x01, 0x00, 0xff, 0x38, 0xb1], &pool).unwrap();
    assert_eq!(ops[0], Op::Iinc(256, -200));
    assert_eq!(ops[6], Op::Return(None));
}

#[test]
fn invokedynamic_drops_the_method_body() {
    // invokedynamic #1 0 0; return -- unsupported, the body is dropped.
    let bytes = assemble_class("p/A", "run", &[0xba, 0x00, 0x01, 0x00, 0x00, 0xb1]);
    let class = parse_class(&bytes).unwrap();
    assert!(class.methods[0].code.is_none());
}

#[test]
fn bad_magic_is_rejected() {
    match parse_class(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0]) {
        Err(ClassError::Malformed(msg)) => assert!(msg.contains("magic")),
        other => panic!("expected malformed-class error, got {other:?}"),
    }
}

#[test]
fn truncated_file_is_rejected() {
    let mut bytes = assemble_class("p/A", "run", &[0xb1]);
    bytes.truncate(bytes.len() - 6);
    assert!(parse_class(&bytes).is_err());
}
