//! Abstract value domains: complete lattices with change-reporting joins.
//!
//! Every join returns `(result, changed)` where `changed` is true iff the
//! result differs from the left argument; the solver uses it to decide
//! re-enqueueing. Mixing `Primitive` with a reference set is coerced to
//! `Top` (with a warning) rather than asserted away: the solver detects
//! type-unsound mixing, it does not crash on it.

use std::collections::{BTreeMap, BTreeSet};

use crate::classfile::ObjectType;
use crate::hierarchy::Program;
use crate::ir::Var;

use super::sites::{SiteId, SiteTable};

// ---------------------------------------------------------------------------
// AbVSet
// ---------------------------------------------------------------------------

/// Abstract value: which allocation sites a value may denote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbVSet {
    Bot,
    /// A primitive (non-reference) value.
    Primitive,
    Set(BTreeSet<SiteId>),
    Top,
}

impl AbVSet {
    pub fn empty() -> AbVSet {
        AbVSet::Set(BTreeSet::new())
    }

    pub fn singleton(site: SiteId) -> AbVSet {
        AbVSet::Set(BTreeSet::from([site]))
    }

    pub fn is_bot(&self) -> bool {
        matches!(self, AbVSet::Bot)
    }

    /// Least upper bound; `changed` is true iff the result differs from
    /// `self`.
    pub fn join(&self, other: &AbVSet) -> (AbVSet, bool) {
        let result = match (self, other) {
            (AbVSet::Bot, x) => x.clone(),
            (x, AbVSet::Bot) => x.clone(),
            (AbVSet::Top, _) | (_, AbVSet::Top) => AbVSet::Top,
            (AbVSet::Primitive, AbVSet::Primitive) => AbVSet::Primitive,
            (AbVSet::Primitive, AbVSet::Set(_)) | (AbVSet::Set(_), AbVSet::Primitive) => {
                log::warn!("joining Primitive with a reference set; widening to Top");
                AbVSet::Top
            }
            (AbVSet::Set(a), AbVSet::Set(b)) => AbVSet::Set(a.union(b).copied().collect()),
        };
        let changed = &result != self;
        (result, changed)
    }

    pub fn join_into(&mut self, other: &AbVSet) -> bool {
        let (result, changed) = self.join(other);
        *self = result;
        changed
    }

    /// Greatest lower bound.
    pub fn inter(&self, other: &AbVSet) -> AbVSet {
        match (self, other) {
            (AbVSet::Bot, _) | (_, AbVSet::Bot) => AbVSet::Bot,
            (AbVSet::Top, x) | (x, AbVSet::Top) => x.clone(),
            (AbVSet::Primitive, AbVSet::Primitive) => AbVSet::Primitive,
            (AbVSet::Primitive, AbVSet::Set(_)) | (AbVSet::Set(_), AbVSet::Primitive) => {
                AbVSet::Bot
            }
            (AbVSet::Set(a), AbVSet::Set(b)) => {
                AbVSet::Set(a.intersection(b).copied().collect())
            }
        }
    }

    pub fn equal(&self, other: &AbVSet) -> bool {
        self == other
    }

    /// Drop the allocation contexts, keeping only the object types.
    pub fn concretize(&self, sites: &SiteTable) -> BTreeSet<ObjectType> {
        match self {
            AbVSet::Set(s) => s.iter().map(|&id| sites.get(id).ty.clone()).collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Keep only the sites whose type is compatible with (a subtype of)
    /// `ty`. `Top` and `Primitive` pass through unchanged.
    pub fn filter_with_compatible(
        &self,
        prog: &Program,
        sites: &SiteTable,
        ty: &ObjectType,
    ) -> AbVSet {
        match self {
            AbVSet::Set(s) => AbVSet::Set(
                s.iter()
                    .copied()
                    .filter(|&id| prog.is_subtype(&sites.get(id).ty, ty))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Keep only the sites whose type is **not** compatible with `ty`.
    pub fn filter_with_uncompatible(
        &self,
        prog: &Program,
        sites: &SiteTable,
        ty: &ObjectType,
    ) -> AbVSet {
        match self {
            AbVSet::Set(s) => AbVSet::Set(
                s.iter()
                    .copied()
                    .filter(|&id| !prog.is_subtype(&sites.get(id).ty, ty))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn sites(&self) -> Option<&BTreeSet<SiteId>> {
        match self {
            AbVSet::Set(s) => Some(s),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// AbFSet
// ---------------------------------------------------------------------------

/// Abstract heap for one field: allocation site of the holder to the
/// abstract value stored. Missing keys are `Bot`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbFSet {
    Bot,
    Map(BTreeMap<SiteId, AbVSet>),
}

impl AbFSet {
    pub fn empty() -> AbFSet {
        AbFSet::Map(BTreeMap::new())
    }

    pub fn join(&self, other: &AbFSet) -> (AbFSet, bool) {
        let result = match (self, other) {
            (AbFSet::Bot, x) => x.clone(),
            (x, AbFSet::Bot) => x.clone(),
            (AbFSet::Map(a), AbFSet::Map(b)) => {
                let mut merged = a.clone();
                for (site, val) in b {
                    merged
                        .entry(*site)
                        .or_insert(AbVSet::Bot)
                        .join_into(val);
                }
                AbFSet::Map(merged)
            }
        };
        let changed = &result != self;
        (result, changed)
    }

    pub fn join_into(&mut self, other: &AbFSet) -> bool {
        let (result, changed) = self.join(other);
        *self = result;
        changed
    }

    /// Field store: every site the object abstraction may denote now maps
    /// to `value`. Reading objects out of `Primitive` is a caller bug,
    /// checked in debug builds; `Top` objects cannot be enumerated and
    /// degrade to `Bot` with a warning.
    pub fn var2fset(objects: &AbVSet, value: &AbVSet) -> AbFSet {
        match objects {
            AbVSet::Bot => AbFSet::Bot,
            AbVSet::Primitive => {
                debug_assert!(false, "field store through a primitive value");
                log::warn!("field store through a primitive value; ignoring");
                AbFSet::Bot
            }
            AbVSet::Top => {
                log::warn!("field store through Top; contents are lost");
                AbFSet::Bot
            }
            AbVSet::Set(sites) => {
                AbFSet::Map(sites.iter().map(|&s| (s, value.clone())).collect())
            }
        }
    }

    /// Field read: the union of the field abstraction at every site the
    /// object abstraction may denote.
    pub fn fset2var(&self, objects: &AbVSet) -> AbVSet {
        match objects {
            AbVSet::Bot => AbVSet::Bot,
            AbVSet::Primitive => {
                debug_assert!(false, "field read through a primitive value");
                log::warn!("field read through a primitive value");
                AbVSet::Bot
            }
            AbVSet::Top => AbVSet::Top,
            AbVSet::Set(sites) => {
                let mut out = AbVSet::Bot;
                if let AbFSet::Map(map) = self {
                    for site in sites {
                        if let Some(val) = map.get(site) {
                            out.join_into(val);
                        }
                    }
                }
                out
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AbLocals
// ---------------------------------------------------------------------------

/// Per-pc environment: variable index to abstract value. `Bot` is the
/// unreachable environment; storing a `Bot` value propagates
/// unreachability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbLocals {
    Bot,
    Env(BTreeMap<u32, AbVSet>),
}

impl AbLocals {
    pub fn empty() -> AbLocals {
        AbLocals::Env(BTreeMap::new())
    }

    pub fn is_bot(&self) -> bool {
        matches!(self, AbLocals::Bot)
    }

    pub fn get_var(&self, v: Var) -> AbVSet {
        match self {
            AbLocals::Bot => AbVSet::Bot,
            AbLocals::Env(map) => map.get(&v.0).cloned().unwrap_or(AbVSet::Bot),
        }
    }

    pub fn set_var(&self, v: Var, value: AbVSet) -> AbLocals {
        match self {
            AbLocals::Bot => AbLocals::Bot,
            AbLocals::Env(map) => {
                if value.is_bot() {
                    return AbLocals::Bot;
                }
                let mut map = map.clone();
                map.insert(v.0, value);
                AbLocals::Env(map)
            }
        }
    }

    pub fn join(&self, other: &AbLocals) -> (AbLocals, bool) {
        let result = match (self, other) {
            (AbLocals::Bot, x) => x.clone(),
            (x, AbLocals::Bot) => x.clone(),
            (AbLocals::Env(a), AbLocals::Env(b)) => {
                let mut merged = a.clone();
                for (idx, val) in b {
                    merged.entry(*idx).or_insert(AbVSet::Bot).join_into(val);
                }
                AbLocals::Env(merged)
            }
        };
        let changed = &result != self;
        (result, changed)
    }

    pub fn join_into(&mut self, other: &AbLocals) -> bool {
        let (result, changed) = self.join(other);
        *self = result;
        changed
    }
}

// ---------------------------------------------------------------------------
// AbMethod
// ---------------------------------------------------------------------------

/// Per-method summary. `Bot` means "not yet reached".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbMethod {
    Bot,
    Reachable {
        args: AbLocals,
        ret: AbVSet,
        exc_ret: AbVSet,
    },
}

impl AbMethod {
    pub fn join(&self, other: &AbMethod) -> (AbMethod, bool) {
        let result = match (self, other) {
            (AbMethod::Bot, x) => x.clone(),
            (x, AbMethod::Bot) => x.clone(),
            (
                AbMethod::Reachable {
                    args: a1,
                    ret: r1,
                    exc_ret: e1,
                },
                AbMethod::Reachable {
                    args: a2,
                    ret: r2,
                    exc_ret: e2,
                },
            ) => AbMethod::Reachable {
                args: a1.join(a2).0,
                ret: r1.join(r2).0,
                exc_ret: e1.join(e2).0,
            },
        };
        let changed = &result != self;
        (result, changed)
    }

    pub fn join_into(&mut self, other: &AbMethod) -> bool {
        let (result, changed) = self.join(other);
        *self = result;
        changed
    }

    /// The entry environment of a method with the given parameter
    /// variables, projected from the joined argument abstraction.
    pub fn init_locals(&self, params: &[Var]) -> AbLocals {
        match self {
            AbMethod::Bot => AbLocals::Bot,
            AbMethod::Reachable { args, .. } => match args {
                AbLocals::Bot => AbLocals::Bot,
                AbLocals::Env(map) => AbLocals::Env(
                    params
                        .iter()
                        .filter_map(|v| map.get(&v.0).map(|val| (v.0, val.clone())))
                        .collect(),
                ),
            },
        }
    }

    pub fn ret(&self) -> AbVSet {
        match self {
            AbMethod::Bot => AbVSet::Bot,
            AbMethod::Reachable { ret, .. } => ret.clone(),
        }
    }

    pub fn exc_ret(&self) -> AbVSet {
        match self {
            AbMethod::Bot => AbVSet::Bot,
            AbMethod::Reachable { exc_ret, .. } => exc_ret.clone(),
        }
    }
}
