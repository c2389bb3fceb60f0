//! Rapid Type Analysis.
//!
//! A worklist over concrete methods discovers reachable code, instantiated
//! classes, and per-site dispatch targets, loading classes lazily from the
//! class source. Every state update is monotone (sets grow, flags flip
//! `false -> true`); methods enter the workset at most once, guarded by the
//! per-class `parsed_methods` flag, so the loop terminates.

pub mod natives;

use std::collections::{BTreeSet, VecDeque};

use crate::classfile::{
    ClassError, ClassMethodSig, ClassName, Const, FieldSignature, MethodSignature, ObjectType, Op,
};
use crate::classpath::ClassSource;
use crate::hierarchy::{ClassIdx, ClassNode, Program, ResolveError, SiteFailure};

pub use natives::{NativeInfo, NativeStubs, StubError};

/// Options for the RTA driver.
#[derive(Clone, Copy, Debug, Default)]
pub struct RtaOptions {
    /// Follow native stubs. Implied by supplying a stub table to [`run`].
    pub parse_natives: bool,
}

/// The JVM bootstrap entry points (HotSpot thread bootstrap sequence plus
/// the principal runtime-exception initialisers).
pub fn default_entry_points() -> Vec<(ClassName, MethodSignature)> {
    let clinit = MethodSignature {
        name: "<clinit>".to_string(),
        params: Vec::new(),
        ret: None,
    };
    let mut entries: Vec<(ClassName, MethodSignature)> = [
        "java/lang/Object",
        "java/lang/System",
        "java/lang/ThreadGroup",
        "java/lang/Thread",
        "java/lang/ref/Finalizer",
        "java/lang/Class",
        "java/lang/OutOfMemoryError",
        "java/lang/NullPointerException",
        "java/lang/ArithmeticException",
        "java/lang/ArrayIndexOutOfBoundsException",
        "java/lang/ClassCastException",
        "java/lang/StackOverflowError",
    ]
    .iter()
    .map(|c| (c.to_string(), clinit.clone()))
    .collect();
    entries.push((
        "java/lang/System".to_string(),
        MethodSignature {
            name: "initializeSystemClass".to_string(),
            params: Vec::new(),
            ret: None,
        },
    ));
    entries
}

/// Run RTA from the given entry points.
///
/// Entry points naming classes or methods the source cannot provide are
/// skipped with a warning, so the default bootstrap set can be used against
/// partial class paths. Supplying `stubs` implies `parse_natives`.
pub fn run(
    source: &mut dyn ClassSource,
    entry_points: &[(ClassName, MethodSignature)],
    stubs: Option<&NativeStubs>,
    opts: RtaOptions,
) -> Result<Program, ClassError> {
    let opts = RtaOptions {
        parse_natives: opts.parse_natives || stubs.is_some(),
    };
    let mut rta = Rta {
        source,
        program: Program::default(),
        workset: VecDeque::new(),
        loading: BTreeSet::new(),
        stubs,
        opts,
    };

    for (class, ms) in entry_points {
        match rta.ensure_class(class) {
            Err(e) => log::warn!("entry point class {class} unavailable: {e}"),
            Ok(idx) => match rta.program.lookup_static(idx, ms) {
                Ok(def) => rta.enqueue(def, ms),
                Err(e) => log::warn!("entry point {class}.{}: {e}", ms.name),
            },
        }
    }

    while let Some((class, ms)) = rta.workset.pop_front() {
        rta.process_method(class, &ms);
    }

    Ok(rta.program)
}

struct Rta<'a> {
    source: &'a mut dyn ClassSource,
    program: Program,
    workset: VecDeque<(ClassIdx, MethodSignature)>,
    /// Classes currently being loaded, to cut hierarchy cycles.
    loading: BTreeSet<ClassName>,
    stubs: Option<&'a NativeStubs>,
    opts: RtaOptions,
}

impl<'a> Rta<'a> {
    // -- class loading --------------------------------------------------

    /// Load `name` with all superclasses and interfaces, wiring hierarchy
    /// edges and the interface-implementers map.
    fn load_class(&mut self, name: &str) -> Result<ClassIdx, ClassError> {
        if let Some(idx) = self.program.class_idx(name) {
            return Ok(idx);
        }
        if !self.loading.insert(name.to_string()) {
            return Err(ClassError::Malformed(format!(
                "cyclic class hierarchy through {name}"
            )));
        }
        let result = self.load_class_inner(name);
        self.loading.remove(name);
        result
    }

    fn load_class_inner(&mut self, name: &str) -> Result<ClassIdx, ClassError> {
        let data = self.source.find_class(name)?;

        let superclass = match &data.super_class {
            Some(sup) => Some(self.load_class(sup)?),
            None => None,
        };
        let mut interface_idxs = Vec::with_capacity(data.interfaces.len());
        for iface in &data.interfaces {
            interface_idxs.push(self.load_class(iface)?);
        }

        let idx = self.program.classes.len();
        let is_interface = data.is_interface();
        let mut node = ClassNode::new(data);
        node.superclass = superclass;
        node.interfaces = interface_idxs.clone();
        self.program.classes.push(node);
        self.program.by_name.insert(name.to_string(), idx);

        if let Some(sup) = superclass {
            if is_interface {
                self.program.classes[sup].children_interfaces.push(idx);
            } else {
                self.program.classes[sup].children_classes.push(idx);
            }
        }
        for &iface in &interface_idxs {
            if is_interface {
                self.program.classes[iface].children_interfaces.push(idx);
            } else {
                self.program.classes[iface].children_classes.push(idx);
            }
        }

        // Register a class under every interface it transitively implements.
        if !is_interface {
            let closure = self.program.interface_closure(idx);
            for iface in closure {
                let iface_name = self.program.classes[iface].name().to_string();
                self.program
                    .interfaces
                    .entry(iface_name)
                    .or_default()
                    .insert(name.to_string());
            }
        } else {
            self.program.interfaces.entry(name.to_string()).or_default();
        }

        Ok(idx)
    }

    /// Recoverable class lookup: failures degrade to `NoClassDefFoundError`.
    fn ensure_class(&mut self, name: &str) -> Result<ClassIdx, ResolveError> {
        self.load_class(name).map_err(|e| {
            log::warn!("failed to load {name}: {e}");
            ResolveError::NoClassDefFound(name.to_string())
        })
    }

    // -- workset --------------------------------------------------------

    fn enqueue(&mut self, class: ClassIdx, ms: &MethodSignature) {
        let node = &mut self.program.classes[class];
        if node.data.method(ms).is_none() {
            return;
        }
        if node.parsed_methods.insert(ms.clone()) {
            let name = node.name().to_string();
            self.program.parsed.insert((name, ms.clone()));
            self.workset.push_back((class, ms.clone()));
        }
    }

    fn schedule_clinit(&mut self, class: ClassIdx) {
        let name = self.program.classes[class].name().to_string();
        if self.program.clinits.insert(name) {
            let clinit = MethodSignature {
                name: "<clinit>".to_string(),
                params: Vec::new(),
                ret: None,
            };
            self.enqueue(class, &clinit);
        }
    }

    /// Schedule `<clinit>` for a class and all its superclasses.
    fn schedule_clinit_chain(&mut self, class: ClassIdx) {
        for idx in self.program.ancestors(class) {
            self.schedule_clinit(idx);
        }
    }

    // -- instantiation --------------------------------------------------

    /// Mark a class instantiated: flip the flag, extend every ancestor's
    /// instantiated-subclass map, schedule initialisers, and replay the
    /// memoised virtual and interface call sites that now gain a target.
    fn instantiate(&mut self, class: ClassIdx) {
        if self.program.classes[class].is_instantiated || self.program.classes[class].is_interface()
        {
            return;
        }
        self.program.classes[class].is_instantiated = true;
        let name = self.program.classes[class].name().to_string();

        let ancestors = self.program.ancestors(class);
        for &anc in &ancestors {
            self.program.classes[anc]
                .instantiated_subclasses
                .insert(name.clone(), class);
        }
        self.schedule_clinit_chain(class);

        for &anc in &ancestors {
            let anc_name = self.program.classes[anc].name().to_string();
            let memo: Vec<MethodSignature> = self.program.classes[anc]
                .memo_virtual_calls
                .iter()
                .cloned()
                .collect();
            for ms in memo {
                self.add_dispatch_target(DispatchKind::Virtual, &anc_name, &ms, class, None);
            }
        }

        let ifaces: Vec<ClassIdx> = self.program.interface_closure(class).into_iter().collect();
        for iface in ifaces {
            let iface_name = self.program.classes[iface].name().to_string();
            let memo: Vec<MethodSignature> = self.program.classes[iface]
                .memo_interface_calls
                .iter()
                .cloned()
                .collect();
            for ms in memo {
                self.add_dispatch_target(DispatchKind::Interface, &iface_name, &ms, class, None);
            }
        }
    }

    // -- dispatch -------------------------------------------------------

    /// Resolve `ms` against the concrete receiver class and record the edge
    /// in the cache keyed by `(site_class, ms)`.
    fn add_dispatch_target(
        &mut self,
        kind: DispatchKind,
        site_class: &str,
        ms: &MethodSignature,
        receiver: ClassIdx,
        site: Option<(&ClassMethodSig, usize)>,
    ) {
        match self.program.lookup_virtual(receiver, ms) {
            Ok(def) => {
                let def_name = self.program.classes[def].name().to_string();
                let cache = match kind {
                    DispatchKind::Virtual => &mut self.program.caches.virtual_lookup,
                    DispatchKind::Interface => &mut self.program.caches.interface_lookup,
                };
                cache
                    .entry((site_class.to_string(), ms.clone()))
                    .or_default()
                    .insert((def_name, ms.clone()), def);
                self.enqueue(def, ms);
            }
            Err(e) => self.record_failure(site, e),
        }
    }

    fn record_failure(&mut self, site: Option<(&ClassMethodSig, usize)>, error: ResolveError) {
        match site {
            Some((caller, pc)) => {
                log::warn!(
                    "resolution failure in {}.{} at pc {pc}: {error}",
                    caller.0,
                    caller.1.name
                );
                self.program.failures.push(SiteFailure {
                    caller: caller.clone(),
                    pc,
                    error,
                });
            }
            None => log::warn!("resolution failure while replaying memoised site: {error}"),
        }
    }

    // -- opcode handlers ------------------------------------------------

    fn process_method(&mut self, class: ClassIdx, ms: &MethodSignature) {
        let caller: ClassMethodSig = (self.program.classes[class].name().to_string(), ms.clone());
        let body = self.program.classes[class]
            .data
            .method(ms)
            .map(|m| match &m.code {
                Some(code) if !m.is_native() => Some(code.ops.clone()),
                _ => None,
            });
        match body {
            None => {}
            Some(None) => self.process_opaque(class, ms, &caller),
            Some(Some(ops)) => {
                for (pc, op) in ops.iter().enumerate() {
                    self.process_op(class, op, (&caller, pc));
                }
            }
        }
    }

    /// A native (or body-less) method: follow the stub table when enabled,
    /// otherwise record it as opaque.
    fn process_opaque(&mut self, _class: ClassIdx, ms: &MethodSignature, caller: &ClassMethodSig) {
        if self.opts.parse_natives {
            if let Some(info) = self.stubs.and_then(|s| s.lookup(&caller.0, ms)).cloned() {
                for ty in &info.allocated {
                    if let ObjectType::Class(c) = ty {
                        match self.ensure_class(c) {
                            Ok(idx) => self.instantiate(idx),
                            Err(e) => log::warn!("native stub allocation of {c}: {e}"),
                        }
                    }
                }
                for (callee_class, callee_ms) in &info.calls {
                    match self.ensure_class(callee_class) {
                        Ok(idx) => match self.program.lookup_virtual(idx, callee_ms) {
                            Ok(def) => self.enqueue(def, callee_ms),
                            Err(e) => log::warn!("native stub callee: {e}"),
                        },
                        Err(e) => log::warn!("native stub callee class: {e}"),
                    }
                }
                return;
            }
        }
        log::warn!(
            "native method {}.{}{} has no stub; treating as opaque",
            caller.0,
            ms.name,
            ms.descriptor()
        );
        self.program.native_methods.insert(caller.clone());
    }

    fn process_op(&mut self, class: ClassIdx, op: &Op, site: (&ClassMethodSig, usize)) {
        match op {
            Op::New(c) => match self.ensure_class(c) {
                Ok(idx) => self.instantiate(idx),
                Err(e) => self.record_failure(Some(site), e),
            },
            // A class literal materialises a java/lang/Class instance.
            Op::Const(Const::Class(_)) => {
                if let Ok(idx) = self.ensure_class("java/lang/Class") {
                    self.instantiate(idx);
                }
            }
            Op::GetStatic(c, fs) | Op::PutStatic(c, fs) => {
                self.static_field_access(c, fs, site);
            }
            Op::InvokeVirtual(recv, ms) => {
                self.invoke_virtual(recv.dispatch_class().to_string(), ms, site);
            }
            Op::InvokeInterface(iface, ms) => {
                self.invoke_interface(iface.clone(), ms, site);
            }
            Op::InvokeStatic(c, ms) => {
                self.invoke_static(c.clone(), ms, site);
            }
            Op::InvokeSpecial(c, ms) => {
                self.invoke_special(class, c.clone(), ms, site);
            }
            _ => {}
        }
    }

    /// `getstatic`/`putstatic`: resolve the field and schedule `<clinit>`
    /// for every class on the resolution path (interfaces trigger only
    /// their own initialiser).
    fn static_field_access(
        &mut self,
        class: &str,
        field: &FieldSignature,
        site: (&ClassMethodSig, usize),
    ) {
        let idx = match self.ensure_class(class) {
            Ok(idx) => idx,
            Err(e) => return self.record_failure(Some(site), e),
        };
        match self.program.resolve_field(idx, field) {
            Ok(path) => {
                for step in path {
                    self.schedule_clinit(step);
                }
            }
            Err(e) => self.record_failure(Some(site), e),
        }
    }

    /// `invokevirtual C.m`: memoise the site on `C` and resolve against
    /// every currently-instantiated subclass of `C`.
    fn invoke_virtual(
        &mut self,
        recv_class: String,
        ms: &MethodSignature,
        site: (&ClassMethodSig, usize),
    ) {
        let idx = match self.ensure_class(&recv_class) {
            Ok(idx) => idx,
            Err(e) => return self.record_failure(Some(site), e),
        };
        self.program.classes[idx].memo_virtual_calls.insert(ms.clone());
        let receivers: Vec<ClassIdx> = self.program.classes[idx]
            .instantiated_subclasses
            .values()
            .copied()
            .collect();
        for receiver in receivers {
            self.add_dispatch_target(
                DispatchKind::Virtual,
                &recv_class,
                ms,
                receiver,
                Some(site),
            );
        }
    }

    /// `invokeinterface I.m`: memoise on `I` and defer to virtual lookup
    /// for every instantiated implementer.
    fn invoke_interface(
        &mut self,
        iface: ClassName,
        ms: &MethodSignature,
        site: (&ClassMethodSig, usize),
    ) {
        let idx = match self.ensure_class(&iface) {
            Ok(idx) => idx,
            Err(e) => return self.record_failure(Some(site), e),
        };
        if !self.program.classes[idx].is_interface() {
            return self.record_failure(Some(site), ResolveError::IncompatibleClassChange(iface));
        }
        self.program.classes[idx].memo_interface_calls.insert(ms.clone());

        let implementers: Vec<ClassName> = self
            .program
            .interfaces
            .get(&iface)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for implementer in implementers {
            let Some(impl_idx) = self.program.class_idx(&implementer) else {
                continue;
            };
            if self.program.classes[impl_idx].is_instantiated {
                self.add_dispatch_target(DispatchKind::Interface, &iface, ms, impl_idx, Some(site));
            }
        }
    }

    fn invoke_static(&mut self, callee: ClassName, ms: &MethodSignature, site: (&ClassMethodSig, usize)) {
        let idx = match self.ensure_class(&callee) {
            Ok(idx) => idx,
            Err(e) => return self.record_failure(Some(site), e),
        };
        match self.program.lookup_static(idx, ms) {
            Ok(def) => {
                let def_name = self.program.classes[def].name().to_string();
                self.schedule_clinit(def);
                self.program
                    .caches
                    .static_lookup
                    .entry((callee, ms.clone()))
                    .or_default()
                    .insert((def_name, ms.clone()), def);
                self.enqueue(def, ms);
            }
            Err(e) => self.record_failure(Some(site), e),
        }
    }

    /// `invokespecial`: for non-constructor calls on a proper superclass the
    /// search starts at the current class's superclass (`ACC_SUPER`
    /// semantics); otherwise at the named class.
    fn invoke_special(
        &mut self,
        current: ClassIdx,
        callee: ClassName,
        ms: &MethodSignature,
        site: (&ClassMethodSig, usize),
    ) {
        let callee_idx = match self.ensure_class(&callee) {
            Ok(idx) => idx,
            Err(e) => return self.record_failure(Some(site), e),
        };
        let start = if ms.name != "<init>"
            && callee_idx != current
            && self.program.is_subclass_of(current, callee_idx)
        {
            self.program.classes[current].superclass.unwrap_or(callee_idx)
        } else {
            callee_idx
        };
        match self.program.lookup_virtual(start, ms) {
            Ok(def) => {
                let def_name = self.program.classes[def].name().to_string();
                let current_name = self.program.classes[current].name().to_string();
                self.program
                    .caches
                    .special_lookup
                    .entry(current_name)
                    .or_default()
                    .entry((callee, ms.clone()))
                    .or_default()
                    .insert((def_name, ms.clone()), def);
                self.enqueue(def, ms);
            }
            Err(e) => self.record_failure(Some(site), e),
        }
    }
}

#[derive(Copy, Clone)]
enum DispatchKind {
    Virtual,
    Interface,
}
