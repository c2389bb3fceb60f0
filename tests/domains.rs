//! Lattice laws and domain operations for the abstract values.

mod common;

use std::collections::BTreeSet;

use classflow::classfile::ObjectType;
use classflow::flow::{AbFSet, AbLocals, AbMethod, AbVSet, Site, SiteId, SiteTable};
use classflow::hierarchy::{ClassNode, Program};
use classflow::ir::Var;

use common::class;

fn set(ids: &[u32]) -> AbVSet {
    AbVSet::Set(ids.iter().map(|&i| SiteId(i)).collect())
}

fn samples() -> Vec<AbVSet> {
    vec![
        AbVSet::Bot,
        AbVSet::Primitive,
        set(&[]),
        set(&[0]),
        set(&[1]),
        set(&[0, 1]),
        AbVSet::Top,
    ]
}

// ---- Lattice laws ----

#[test]
fn join_is_commutative_associative_idempotent() {
    let elems = samples();
    for a in &elems {
        assert_eq!(a.join(a).0, *a, "idempotence failed for {a:?}");
        for b in &elems {
            assert_eq!(a.join(b).0, b.join(a).0, "commutativity {a:?} {b:?}");
            for c in &elems {
                assert_eq!(
                    a.join(&b.join(c).0).0,
                    a.join(b).0.join(c).0,
                    "associativity {a:?} {b:?} {c:?}"
                );
            }
        }
    }
}

#[test]
fn bot_is_the_join_identity() {
    for a in &samples() {
        assert_eq!(AbVSet::Bot.join(a).0, *a);
        assert_eq!(a.join(&AbVSet::Bot).0, *a);
    }
}

#[test]
fn equality_matches_mutual_absorption() {
    let elems = samples();
    for a in &elems {
        for b in &elems {
            let mutual = a.join(b).0 == *a && b.join(a).0 == *b;
            assert_eq!(a.equal(b), mutual, "order mismatch for {a:?} {b:?}");
        }
    }
}

#[test]
fn join_reports_change_iff_result_differs() {
    let elems = samples();
    for a in &elems {
        for b in &elems {
            let (result, changed) = a.join(b);
            assert_eq!(changed, result != *a, "modifies flag wrong for {a:?} {b:?}");
        }
    }
}

#[test]
fn primitive_and_reference_sets_widen_to_top() {
    assert_eq!(AbVSet::Primitive.join(&set(&[0])).0, AbVSet::Top);
    assert_eq!(set(&[0]).join(&AbVSet::Primitive).0, AbVSet::Top);
    // But meet of the incomparable pair is Bot.
    assert_eq!(AbVSet::Primitive.inter(&set(&[0])), AbVSet::Bot);
}

#[test]
fn inter_is_the_meet() {
    assert_eq!(set(&[0, 1]).inter(&set(&[1])), set(&[1]));
    assert_eq!(AbVSet::Top.inter(&set(&[1])), set(&[1]));
    assert_eq!(AbVSet::Bot.inter(&AbVSet::Top), AbVSet::Bot);
}

// ---- Concretisation and filters ----

fn tiny_hierarchy() -> (Program, SiteTable, SiteId, SiteId) {
    let mut program = Program::default();
    let object = ClassNode::new(class("java/lang/Object", None, &[], vec![]));
    program.by_name.insert("java/lang/Object".into(), 0);
    program.classes.push(object);

    let mut a = ClassNode::new(class("A", Some("java/lang/Object"), &[], vec![]));
    a.superclass = Some(0);
    program.by_name.insert("A".into(), 1);
    program.classes.push(a);

    let mut b = ClassNode::new(class("B", Some("A"), &[], vec![]));
    b.superclass = Some(1);
    program.by_name.insert("B".into(), 2);
    program.classes.push(b);

    let mut sites = SiteTable::new();
    let site_a = sites.intern(Site {
        context: Vec::new(),
        ty: ObjectType::Class("A".into()),
    });
    let site_b = sites.intern(Site {
        context: Vec::new(),
        ty: ObjectType::Class("B".into()),
    });
    (program, sites, site_a, site_b)
}

#[test]
fn concretize_drops_context() {
    let (_, sites, site_a, site_b) = tiny_hierarchy();
    let v = AbVSet::Set(BTreeSet::from([site_a, site_b]));
    let types = v.concretize(&sites);
    assert_eq!(
        types,
        BTreeSet::from([
            ObjectType::Class("A".into()),
            ObjectType::Class("B".into())
        ])
    );
}

#[test]
fn subtype_filters_partition_a_set() {
    let (program, sites, site_a, site_b) = tiny_hierarchy();
    let v = AbVSet::Set(BTreeSet::from([site_a, site_b]));

    let a_ty = ObjectType::Class("A".into());
    let b_ty = ObjectType::Class("B".into());

    // Everything is compatible with A; only the B site with B.
    assert_eq!(v.filter_with_compatible(&program, &sites, &a_ty), v);
    assert_eq!(
        v.filter_with_compatible(&program, &sites, &b_ty),
        AbVSet::singleton(site_b)
    );
    assert_eq!(
        v.filter_with_uncompatible(&program, &sites, &b_ty),
        AbVSet::singleton(site_a)
    );
}

// ---- AbFSet ----

#[test]
fn field_store_then_read_round_trips() {
    let objs = set(&[0, 1]);
    let val = set(&[7]);
    let heap = AbFSet::var2fset(&objs, &val);
    assert_eq!(heap.fset2var(&set(&[0])), val);
    assert_eq!(heap.fset2var(&set(&[1])), val);
    // Reading through an unrelated site sees nothing.
    assert_eq!(heap.fset2var(&set(&[2])), AbVSet::Bot);
}

#[test]
fn fset_join_is_pointwise_with_bot_identity() {
    let h1 = AbFSet::var2fset(&set(&[0]), &set(&[5]));
    let h2 = AbFSet::var2fset(&set(&[0]), &set(&[6]));
    let (joined, changed) = h1.join(&h2);
    assert!(changed);
    assert_eq!(joined.fset2var(&set(&[0])), set(&[5, 6]));

    assert_eq!(AbFSet::Bot.join(&h1).0, h1);
    assert_eq!(h1.join(&AbFSet::Bot).0, h1);
}

#[test]
fn top_objects_read_top() {
    let heap = AbFSet::var2fset(&set(&[0]), &set(&[5]));
    assert_eq!(heap.fset2var(&AbVSet::Top), AbVSet::Top);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic]
fn field_store_through_primitive_is_a_caller_bug() {
    let _ = AbFSet::var2fset(&AbVSet::Primitive, &set(&[0]));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic]
fn field_read_through_primitive_is_a_caller_bug() {
    let heap = AbFSet::var2fset(&set(&[0]), &set(&[5]));
    let _ = heap.fset2var(&AbVSet::Primitive);
}

// ---- AbLocals ----

#[test]
fn locals_bot_absorbs() {
    let env = AbLocals::empty().set_var(Var(0), set(&[1]));
    assert_eq!(env.get_var(Var(0)), set(&[1]));
    assert_eq!(env.get_var(Var(9)), AbVSet::Bot);

    // Storing Bot poisons the whole environment.
    assert_eq!(env.set_var(Var(1), AbVSet::Bot), AbLocals::Bot);
    // And Bot environments stay Bot.
    assert_eq!(AbLocals::Bot.set_var(Var(0), set(&[1])), AbLocals::Bot);
}

#[test]
fn locals_join_is_pointwise() {
    let e1 = AbLocals::empty().set_var(Var(0), set(&[1]));
    let e2 = AbLocals::empty().set_var(Var(0), set(&[2]));
    let (joined, changed) = e1.join(&e2);
    assert!(changed);
    assert_eq!(joined.get_var(Var(0)), set(&[1, 2]));

    assert_eq!(AbLocals::Bot.join(&e1).0, e1);
    let (same, changed) = e1.join(&e1);
    assert_eq!(same, e1);
    assert!(!changed);
}

// ---- AbMethod ----

#[test]
fn method_summary_joins_componentwise() {
    let m1 = AbMethod::Reachable {
        args: AbLocals::empty().set_var(Var(0), set(&[1])),
        ret: set(&[3]),
        exc_ret: AbVSet::Bot,
    };
    let m2 = AbMethod::Reachable {
        args: AbLocals::empty().set_var(Var(0), set(&[2])),
        ret: set(&[4]),
        exc_ret: set(&[9]),
    };
    let (joined, changed) = m1.join(&m2);
    assert!(changed);
    match &joined {
        AbMethod::Reachable { args, ret, exc_ret } => {
            assert_eq!(args.get_var(Var(0)), set(&[1, 2]));
            assert_eq!(*ret, set(&[3, 4]));
            assert_eq!(*exc_ret, set(&[9]));
        }
        AbMethod::Bot => panic!("join lost reachability"),
    }

    assert_eq!(AbMethod::Bot.join(&m1).0, m1);
    assert_eq!(joined.ret(), set(&[3, 4]));
}

#[test]
fn init_locals_projects_onto_parameters() {
    let args = AbLocals::empty()
        .set_var(Var(0), set(&[1]))
        .set_var(Var(5), set(&[2]));
    let m = AbMethod::Reachable {
        args,
        ret: AbVSet::Bot,
        exc_ret: AbVSet::Bot,
    };
    let locals = m.init_locals(&[Var(0)]);
    assert_eq!(locals.get_var(Var(0)), set(&[1]));
    assert_eq!(locals.get_var(Var(5)), AbVSet::Bot);

    assert_eq!(AbMethod::Bot.init_locals(&[Var(0)]), AbLocals::Bot);
}
