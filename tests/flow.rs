//! Class-flow analysis: the points-to fixpoint over a small heap program.

mod common;

use std::collections::BTreeSet;

use classflow::classfile::opcode::{LoadKind, Op};
use classflow::classfile::{FieldSignature, ObjectType, ValueType};
use classflow::classpath::MemorySource;
use classflow::flow::{self, AbVSet};
use classflow::ir::{Instr, TransformOptions, VarOrigin};
use classflow::rta::{self, RtaOptions};

use common::{bytecode, class, field, instance_method, object_class, sig, static_method};

fn b_field() -> FieldSignature {
    FieldSignature {
        name: "f".into(),
        ty: ValueType::Object(ObjectType::Class("B".into())),
    }
}

/// `A a = new A(); a.f = new B(); x = a.f;`
fn heap_program() -> MemorySource {
    let mut source = MemorySource::new();
    source.add(object_class());

    let ctor = |super_name: &str| {
        instance_method(
            "<init>",
            "()V",
            bytecode(&[
                (0, Op::Load(LoadKind::Ref, 0)),
                (
                    1,
                    Op::InvokeSpecial(super_name.to_string(), sig("<init>", "()V")),
                ),
                (4, Op::Return(None)),
            ]),
        )
    };

    let mut a = class(
        "A",
        Some("java/lang/Object"),
        &[],
        vec![ctor("java/lang/Object")],
    );
    a.fields.push(field("f", "LB;"));
    source.add(a);
    source.add(class(
        "B",
        Some("java/lang/Object"),
        &[],
        vec![ctor("java/lang/Object")],
    ));

    source.add(class(
        "Main",
        Some("java/lang/Object"),
        &[],
        vec![static_method(
            "main",
            "()V",
            bytecode(&[
                (0, Op::New("A".into())),
                (3, Op::Dup),
                (4, Op::InvokeSpecial("A".into(), sig("<init>", "()V"))),
                (7, Op::Store(LoadKind::Ref, 1)),
                (8, Op::Load(LoadKind::Ref, 1)),
                (9, Op::New("B".into())),
                (12, Op::Dup),
                (13, Op::InvokeSpecial("B".into(), sig("<init>", "()V"))),
                (16, Op::PutField("A".into(), b_field())),
                (19, Op::Load(LoadKind::Ref, 1)),
                (20, Op::GetField("A".into(), b_field())),
                (23, Op::Store(LoadKind::Ref, 2)),
                (24, Op::Return(None)),
            ]),
        )],
    ));
    source
}

#[test]
fn field_flow_reaches_the_single_allocation_site() {
    let mut source = heap_program();
    let main = ("Main".to_string(), sig("main", "()V"));
    let program = rta::run(&mut source, &[main.clone()], None, RtaOptions::default()).unwrap();

    let result = flow::analyze(&program, &[main.clone()], TransformOptions::default());

    // The allocation site of B.
    let site_b = (0..result.sites.len() as u32)
        .map(flow::SiteId)
        .find(|&id| result.sites.get(id).ty == ObjectType::Class("B".into()))
        .expect("site for B interned");

    // x is the local in slot 2; its assignment is the last def before return.
    let ir = &result.irs[&main];
    let (pc, x) = ir
        .code
        .iter()
        .enumerate()
        .find_map(|(pc, instr)| match instr {
            Instr::AffectVar(v, _) if ir.vars[v.index()] == VarOrigin::Original(2, None) => {
                Some((pc, *v))
            }
            _ => None,
        })
        .expect("store to x");

    let value = result.value_of(&main, pc + 1, x);
    assert_eq!(value, AbVSet::Set(BTreeSet::from([site_b])));
}

#[test]
fn constructor_receiver_flows_into_the_callee() {
    let mut source = heap_program();
    let main = ("Main".to_string(), sig("main", "()V"));
    let program = rta::run(&mut source, &[main.clone()], None, RtaOptions::default()).unwrap();
    let result = flow::analyze(&program, &[main.clone()], TransformOptions::default());

    let a_init = ("A".to_string(), sig("<init>", "()V"));
    let ir = &result.irs[&a_init];
    let this = ir.params[0].1;

    let site_a = (0..result.sites.len() as u32)
        .map(flow::SiteId)
        .find(|&id| result.sites.get(id).ty == ObjectType::Class("A".into()))
        .unwrap();

    // On entry to A.<init>, `this` holds exactly the A allocation site.
    let value = result.value_of(&a_init, 0, this);
    assert_eq!(value, AbVSet::Set(BTreeSet::from([site_a])));
}

#[test]
fn heap_state_records_the_field_points_to() {
    let mut source = heap_program();
    let main = ("Main".to_string(), sig("main", "()V"));
    let program = rta::run(&mut source, &[main.clone()], None, RtaOptions::default()).unwrap();
    let result = flow::analyze(&program, &[main.clone()], TransformOptions::default());

    let heap = result.state.field("A", &b_field());
    let site_a = (0..result.sites.len() as u32)
        .map(flow::SiteId)
        .find(|&id| result.sites.get(id).ty == ObjectType::Class("A".into()))
        .unwrap();
    let site_b = (0..result.sites.len() as u32)
        .map(flow::SiteId)
        .find(|&id| result.sites.get(id).ty == ObjectType::Class("B".into()))
        .unwrap();

    assert_eq!(
        heap.fset2var(&AbVSet::singleton(site_a)),
        AbVSet::singleton(site_b)
    );
}
