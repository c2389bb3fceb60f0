//! The constraint system and its fixed-point solver.
//!
//! A constraint is a monotone transfer from a set of source state variables
//! to a single destination. The solver keeps a dirty set; popping a dirty
//! variable re-evaluates every constraint that reads it and joins the
//! result into the destination, re-enqueueing the destination only when the
//! join actually changed it. Iteration order is deterministic (`BTreeSet`),
//! but the fixpoint is order-independent by monotonicity.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;

use crate::classfile::{ClassMethodSig, ClassName, FieldSignature};
use crate::hierarchy::Program;

use super::domains::{AbFSet, AbLocals, AbMethod, AbVSet};
use super::sites::SiteTable;

/// Call-site-sensitivity tag. The default is the empty, context-insensitive
/// tag; a k-CFA-style implementation plugs in here.
pub trait Context: Clone + Eq + Ord + Hash + Debug {
    fn entry() -> Self;
}

/// The context-insensitive context.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NoContext;

impl Context for NoContext {
    fn entry() -> NoContext {
        NoContext
    }
}

/// A state variable of the constraint system.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateVar<C: Context> {
    /// Instance-field heap, per declaring class and field.
    Field(ClassName, FieldSignature),
    /// Static-field value, per declaring class and field.
    StaticField(ClassName, FieldSignature),
    /// Per-method summary.
    Method(C, ClassMethodSig),
    /// Per-pc local environment.
    Pc(C, ClassMethodSig, usize),
}

/// A value of one of the four domains, matching the state-variable kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbVal {
    FSet(AbFSet),
    VSet(AbVSet),
    Method(AbMethod),
    Locals(AbLocals),
}

/// Read-only context handed to transfer functions.
pub struct SolveEnv<'a> {
    pub program: &'a Program,
    pub sites: &'a SiteTable,
}

/// A single monotone constraint.
pub struct Constraint<C: Context> {
    pub sources: Vec<StateVar<C>>,
    pub target: StateVar<C>,
    pub transfer: Box<dyn Fn(&State<C>, &SolveEnv) -> AbVal>,
}

/// The analysis state: one map per state-variable kind. Missing entries
/// are `Bot`.
#[derive(Clone, Debug)]
pub struct State<C: Context> {
    pub fields: HashMap<(ClassName, FieldSignature), AbFSet>,
    pub statics: HashMap<(ClassName, FieldSignature), AbVSet>,
    pub methods: HashMap<(C, ClassMethodSig), AbMethod>,
    pub pcs: HashMap<(C, ClassMethodSig, usize), AbLocals>,
}

impl<C: Context> Default for State<C> {
    fn default() -> State<C> {
        State::new()
    }
}

impl<C: Context> State<C> {
    pub fn new() -> State<C> {
        State {
            fields: HashMap::new(),
            statics: HashMap::new(),
            methods: HashMap::new(),
            pcs: HashMap::new(),
        }
    }

    pub fn field(&self, class: &str, fs: &FieldSignature) -> AbFSet {
        self.fields
            .get(&(class.to_string(), fs.clone()))
            .cloned()
            .unwrap_or(AbFSet::Bot)
    }

    pub fn static_field(&self, class: &str, fs: &FieldSignature) -> AbVSet {
        self.statics
            .get(&(class.to_string(), fs.clone()))
            .cloned()
            .unwrap_or(AbVSet::Bot)
    }

    pub fn method(&self, ctx: &C, cms: &ClassMethodSig) -> AbMethod {
        self.methods
            .get(&(ctx.clone(), cms.clone()))
            .cloned()
            .unwrap_or(AbMethod::Bot)
    }

    pub fn pc(&self, ctx: &C, cms: &ClassMethodSig, pc: usize) -> AbLocals {
        self.pcs
            .get(&(ctx.clone(), cms.clone(), pc))
            .cloned()
            .unwrap_or(AbLocals::Bot)
    }

    /// Join `value` into `var`; returns whether the state changed.
    fn join_into(&mut self, var: &StateVar<C>, value: &AbVal) -> bool {
        match (var, value) {
            (StateVar::Field(c, fs), AbVal::FSet(v)) => self
                .fields
                .entry((c.clone(), fs.clone()))
                .or_insert(AbFSet::Bot)
                .join_into(v),
            (StateVar::StaticField(c, fs), AbVal::VSet(v)) => self
                .statics
                .entry((c.clone(), fs.clone()))
                .or_insert(AbVSet::Bot)
                .join_into(v),
            (StateVar::Method(ctx, cms), AbVal::Method(v)) => self
                .methods
                .entry((ctx.clone(), cms.clone()))
                .or_insert(AbMethod::Bot)
                .join_into(v),
            (StateVar::Pc(ctx, cms, pc), AbVal::Locals(v)) => self
                .pcs
                .entry((ctx.clone(), cms.clone(), *pc))
                .or_insert(AbLocals::Bot)
                .join_into(v),
            _ => {
                debug_assert!(false, "constraint produced a value of the wrong domain");
                log::warn!("discarding constraint result of mismatched domain");
                false
            }
        }
    }
}

/// The worklist solver.
pub struct Solver<C: Context> {
    state: State<C>,
    constraints: Vec<Constraint<C>>,
    by_source: HashMap<StateVar<C>, Vec<usize>>,
    dirty: BTreeSet<StateVar<C>>,
}

impl<C: Context> Solver<C> {
    pub fn new(constraints: Vec<Constraint<C>>) -> Solver<C> {
        let mut by_source: HashMap<StateVar<C>, Vec<usize>> = HashMap::new();
        for (i, c) in constraints.iter().enumerate() {
            for s in &c.sources {
                by_source.entry(s.clone()).or_default().push(i);
            }
        }
        Solver {
            state: State::new(),
            constraints,
            by_source,
            dirty: BTreeSet::new(),
        }
    }

    /// Seed a state variable with an initial value and mark it dirty.
    pub fn seed(&mut self, var: StateVar<C>, value: AbVal) {
        if self.state.join_into(&var, &value) {
            self.dirty.insert(var);
        }
    }

    /// Run to the fixpoint. Every constraint is evaluated at least once.
    pub fn solve(mut self, env: &SolveEnv) -> State<C> {
        for i in 0..self.constraints.len() {
            self.eval(i, env);
        }
        while let Some(var) = self.dirty.pop_first() {
            if let Some(indices) = self.by_source.get(&var).cloned() {
                for i in indices {
                    self.eval(i, env);
                }
            }
        }
        log::debug!(
            "solver fixpoint: {} fields, {} statics, {} methods, {} pcs",
            self.state.fields.len(),
            self.state.statics.len(),
            self.state.methods.len(),
            self.state.pcs.len()
        );
        self.state
    }

    fn eval(&mut self, index: usize, env: &SolveEnv) {
        let value = (self.constraints[index].transfer)(&self.state, env);
        let target = self.constraints[index].target.clone();
        if self.state.join_into(&target, &value) {
            self.dirty.insert(target);
        }
    }
}
