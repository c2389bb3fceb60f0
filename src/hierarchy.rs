//! Class hierarchy arena and JVM resolution rules.
//!
//! Every loaded class or interface lives in `Program::classes`; edges
//! (superclass, interfaces, children) are indices into that vector, which
//! keeps the naturally cyclic parent/child relation representable without
//! back-pointers. Nodes are mutated only during RTA, and only monotonically.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::classfile::{
    ClassData, ClassMethodSig, ClassName, FieldSignature, MethodSignature, ObjectType, Op, OBJECT,
};

/// Index of a class node in the program arena.
pub type ClassIdx = usize;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Resolution failures mandated by the JVM specification. The RTA driver
/// records these per call site and proceeds with no edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveError {
    IncompatibleClassChange(ClassName),
    NoSuchMethod(ClassName, MethodSignature),
    NoSuchField(ClassName, String),
    NoClassDefFound(ClassName),
    AbstractMethod(ClassName, MethodSignature),
    IllegalAccess(ClassName, MethodSignature),
    InvokeNotFound {
        caller_class: ClassName,
        caller_ms: MethodSignature,
        callee_class: ClassName,
        callee_ms: MethodSignature,
    },
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::IncompatibleClassChange(c) => {
                write!(f, "IncompatibleClassChangeError: {c}")
            }
            ResolveError::NoSuchMethod(c, ms) => {
                write!(f, "NoSuchMethodError: {c}.{}{}", ms.name, ms.descriptor())
            }
            ResolveError::NoSuchField(c, name) => write!(f, "NoSuchFieldError: {c}.{name}"),
            ResolveError::NoClassDefFound(c) => write!(f, "NoClassDefFoundError: {c}"),
            ResolveError::AbstractMethod(c, ms) => {
                write!(f, "AbstractMethodError: {c}.{}{}", ms.name, ms.descriptor())
            }
            ResolveError::IllegalAccess(c, ms) => {
                write!(f, "IllegalAccessError: {c}.{}{}", ms.name, ms.descriptor())
            }
            ResolveError::InvokeNotFound {
                caller_class,
                caller_ms,
                callee_class,
                callee_ms,
            } => write!(
                f,
                "no receiver found for {callee_class}.{}{} called from {caller_class}.{}{}",
                callee_ms.name,
                callee_ms.descriptor(),
                caller_ms.name,
                caller_ms.descriptor()
            ),
        }
    }
}

impl std::error::Error for ResolveError {}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A class or interface in the arena, with the state RTA mutates in place.
#[derive(Clone, Debug)]
pub struct ClassNode {
    pub data: ClassData,
    pub superclass: Option<ClassIdx>,
    pub interfaces: Vec<ClassIdx>,
    pub children_classes: Vec<ClassIdx>,
    pub children_interfaces: Vec<ClassIdx>,
    pub is_instantiated: bool,
    /// Instantiated classes at or below this node, keyed by name.
    pub instantiated_subclasses: BTreeMap<ClassName, ClassIdx>,
    /// Virtual call signatures memoised on this class, replayed when a new
    /// subclass becomes instantiated.
    pub memo_virtual_calls: BTreeSet<MethodSignature>,
    /// Interface call signatures memoised on this interface.
    pub memo_interface_calls: BTreeSet<MethodSignature>,
    /// Methods already pushed on the RTA workset (`has_been_parsed`).
    pub parsed_methods: BTreeSet<MethodSignature>,
}

impl ClassNode {
    pub fn new(data: ClassData) -> ClassNode {
        ClassNode {
            data,
            superclass: None,
            interfaces: Vec::new(),
            children_classes: Vec::new(),
            children_interfaces: Vec::new(),
            is_instantiated: false,
            instantiated_subclasses: BTreeMap::new(),
            memo_virtual_calls: BTreeSet::new(),
            memo_interface_calls: BTreeSet::new(),
            parsed_methods: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn is_interface(&self) -> bool {
        self.data.is_interface()
    }
}

/// A recorded per-site resolution failure.
#[derive(Clone, Debug)]
pub struct SiteFailure {
    pub caller: ClassMethodSig,
    pub pc: usize,
    pub error: ResolveError,
}

/// Monotone dispatch caches filled by RTA.
///
/// Each cache maps a call site key `(class, method signature)` to the set of
/// possible concrete callees, keyed by `(defining class, signature)`.
#[derive(Clone, Debug, Default)]
pub struct DispatchCaches {
    pub virtual_lookup: HashMap<(ClassName, MethodSignature), BTreeMap<ClassMethodSig, ClassIdx>>,
    pub interface_lookup: HashMap<(ClassName, MethodSignature), BTreeMap<ClassMethodSig, ClassIdx>>,
    pub static_lookup: HashMap<(ClassName, MethodSignature), BTreeMap<ClassMethodSig, ClassIdx>>,
    /// Keyed first by the class containing the call site.
    pub special_lookup:
        HashMap<ClassName, HashMap<(ClassName, MethodSignature), BTreeMap<ClassMethodSig, ClassIdx>>>,
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// The whole-program view built by RTA: hierarchy, reachable methods,
/// instantiation state, and dispatch caches.
#[derive(Debug, Default)]
pub struct Program {
    pub classes: Vec<ClassNode>,
    pub by_name: HashMap<ClassName, ClassIdx>,
    /// Interface name to the set of loaded classes transitively implementing it.
    pub interfaces: HashMap<ClassName, BTreeSet<ClassName>>,
    pub caches: DispatchCaches,
    /// Reachable concrete methods.
    pub parsed: BTreeSet<ClassMethodSig>,
    /// Classes whose `<clinit>` has been scheduled.
    pub clinits: BTreeSet<ClassName>,
    /// Native methods encountered without a stub entry.
    pub native_methods: BTreeSet<ClassMethodSig>,
    /// Per-site resolution failures (analysis proceeds with no edge).
    pub failures: Vec<SiteFailure>,
}

impl Program {
    pub fn class_idx(&self, name: &str) -> Option<ClassIdx> {
        self.by_name.get(name).copied()
    }

    pub fn class(&self, idx: ClassIdx) -> &ClassNode {
        &self.classes[idx]
    }

    /// The chain of superclasses starting at `idx` (inclusive).
    pub fn ancestors(&self, idx: ClassIdx) -> Vec<ClassIdx> {
        let mut chain = vec![idx];
        let mut cur = idx;
        while let Some(sup) = self.classes[cur].superclass {
            chain.push(sup);
            cur = sup;
        }
        chain
    }

    /// All interfaces implemented by `idx`, transitively (through
    /// superinterfaces and superclasses).
    pub fn interface_closure(&self, idx: ClassIdx) -> BTreeSet<ClassIdx> {
        let mut closure = BTreeSet::new();
        let mut stack: Vec<ClassIdx> = self.ancestors(idx);
        while let Some(c) = stack.pop() {
            for &i in &self.classes[c].interfaces {
                if closure.insert(i) {
                    stack.push(i);
                }
            }
        }
        closure
    }

    pub fn is_subclass_of(&self, sub: ClassIdx, sup: ClassIdx) -> bool {
        self.ancestors(sub).contains(&sup)
    }

    /// Conservative subtyping over object types, used by the abstract-domain
    /// filters. Unknown (unloaded) classes are not subtypes of anything but
    /// `java/lang/Object`.
    pub fn is_subtype(&self, sub: &ObjectType, sup: &ObjectType) -> bool {
        match (sub, sup) {
            (_, ObjectType::Class(s)) if s == OBJECT => true,
            (ObjectType::Class(a), ObjectType::Class(b)) => {
                if a == b {
                    return true;
                }
                let (Some(ai), Some(bi)) = (self.class_idx(a), self.class_idx(b)) else {
                    return false;
                };
                self.is_subclass_of(ai, bi) || self.interface_closure(ai).contains(&bi)
            }
            (ObjectType::Array(_), ObjectType::Class(s)) => {
                s == "java/lang/Cloneable" || s == "java/io/Serializable"
            }
            (ObjectType::Array(a), ObjectType::Array(b)) => match (a.as_ref(), b.as_ref()) {
                (t1, t2) if t1 == t2 => true,
                (crate::classfile::ValueType::Object(o1), crate::classfile::ValueType::Object(o2)) => {
                    self.is_subtype(o1, o2)
                }
                _ => false,
            },
            (ObjectType::Class(_), ObjectType::Array(_)) => false,
        }
    }

    // -- JVM lookup rules --

    /// Virtual method lookup: walk up from the receiver class to the first
    /// class declaring a matching signature.
    pub fn lookup_virtual(
        &self,
        receiver: ClassIdx,
        ms: &MethodSignature,
    ) -> Result<ClassIdx, ResolveError> {
        for idx in self.ancestors(receiver) {
            if let Some(m) = self.classes[idx].data.method(ms) {
                if m.is_abstract() {
                    return Err(ResolveError::AbstractMethod(
                        self.classes[idx].name().to_string(),
                        ms.clone(),
                    ));
                }
                return Ok(idx);
            }
        }
        Err(ResolveError::NoSuchMethod(
            self.classes[receiver].name().to_string(),
            ms.clone(),
        ))
    }

    /// Static method lookup: walk up the superclass chain.
    pub fn lookup_static(
        &self,
        class: ClassIdx,
        ms: &MethodSignature,
    ) -> Result<ClassIdx, ResolveError> {
        for idx in self.ancestors(class) {
            if self.classes[idx].data.method(ms).is_some() {
                return Ok(idx);
            }
        }
        Err(ResolveError::NoSuchMethod(
            self.classes[class].name().to_string(),
            ms.clone(),
        ))
    }

    /// Field resolution per JVMS §5.4.3.2: the class itself, then its
    /// direct superinterfaces (recursively), then its superclass. Returns
    /// the successful lookup chain (for `<clinit>` scheduling) with the
    /// defining class last; dead-end branches are backtracked out.
    pub fn resolve_field(
        &self,
        class: ClassIdx,
        field: &FieldSignature,
    ) -> Result<Vec<ClassIdx>, ResolveError> {
        let mut path = Vec::new();
        if self.resolve_field_from(class, field, &mut path) {
            Ok(path)
        } else {
            Err(ResolveError::NoSuchField(
                self.classes[class].name().to_string(),
                field.name.clone(),
            ))
        }
    }

    fn resolve_field_from(
        &self,
        idx: ClassIdx,
        field: &FieldSignature,
        path: &mut Vec<ClassIdx>,
    ) -> bool {
        path.push(idx);
        if self.classes[idx].data.field(&field.name).is_some() {
            return true;
        }
        for &iface in &self.classes[idx].interfaces {
            if self.resolve_field_from(iface, field, path) {
                return true;
            }
        }
        if let Some(sup) = self.classes[idx].superclass {
            if self.resolve_field_from(sup, field, path) {
                return true;
            }
        }
        path.pop();
        false
    }

    // -- Dispatch-cache queries --

    /// The possible callees of the invoke instruction at bytecode `pc` of
    /// `class.ms`, per the caches built during RTA.
    pub fn static_lookup_method(
        &self,
        class: &str,
        ms: &MethodSignature,
        pc: usize,
    ) -> Option<&BTreeMap<ClassMethodSig, ClassIdx>> {
        let idx = self.class_idx(class)?;
        let method = self.classes[idx].data.method(ms)?;
        let code = method.code.as_ref()?;
        match code.ops.get(pc)? {
            Op::InvokeVirtual(recv, callee_ms) => self
                .caches
                .virtual_lookup
                .get(&(recv.dispatch_class().to_string(), callee_ms.clone())),
            Op::InvokeInterface(iface, callee_ms) => self
                .caches
                .interface_lookup
                .get(&(iface.clone(), callee_ms.clone())),
            Op::InvokeStatic(callee_class, callee_ms) => self
                .caches
                .static_lookup
                .get(&(callee_class.clone(), callee_ms.clone())),
            Op::InvokeSpecial(callee_class, callee_ms) => self
                .caches
                .special_lookup
                .get(class)?
                .get(&(callee_class.clone(), callee_ms.clone())),
            _ => None,
        }
    }
}
