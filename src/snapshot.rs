//! Program persistence.
//!
//! A [`Snapshot`] is a serde-friendly mirror of [`Program`]: arena indices
//! survive as-is, maps with structured keys flatten into pair lists (JSON
//! map keys must be strings). The round trip is lossless for the
//! hierarchy, the parsed-method set, and the dispatch caches, so
//! `static_lookup_method` works identically on a reloaded program.
//! Per-site resolution failures are diagnostics and are not persisted.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::classfile::{ClassData, ClassMethodSig, ClassName, MethodSignature};
use crate::hierarchy::{ClassIdx, ClassNode, DispatchCaches, Program};

type CacheEntry = ((ClassName, MethodSignature), Vec<(ClassMethodSig, ClassIdx)>);

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ClassSnapshot {
    data: ClassData,
    superclass: Option<ClassIdx>,
    interfaces: Vec<ClassIdx>,
    children_classes: Vec<ClassIdx>,
    children_interfaces: Vec<ClassIdx>,
    is_instantiated: bool,
    instantiated_subclasses: Vec<(ClassName, ClassIdx)>,
    memo_virtual_calls: Vec<MethodSignature>,
    memo_interface_calls: Vec<MethodSignature>,
    parsed_methods: Vec<MethodSignature>,
}

/// Serialisable image of an analysed program.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    classes: Vec<ClassSnapshot>,
    interfaces: Vec<(ClassName, Vec<ClassName>)>,
    virtual_lookup: Vec<CacheEntry>,
    interface_lookup: Vec<CacheEntry>,
    static_lookup: Vec<CacheEntry>,
    special_lookup: Vec<(ClassName, Vec<CacheEntry>)>,
    parsed: Vec<ClassMethodSig>,
    clinits: Vec<ClassName>,
    native_methods: Vec<ClassMethodSig>,
}

impl Snapshot {
    pub fn of(program: &Program) -> Snapshot {
        let classes = program
            .classes
            .iter()
            .map(|node| ClassSnapshot {
                data: node.data.clone(),
                superclass: node.superclass,
                interfaces: node.interfaces.clone(),
                children_classes: node.children_classes.clone(),
                children_interfaces: node.children_interfaces.clone(),
                is_instantiated: node.is_instantiated,
                instantiated_subclasses: node
                    .instantiated_subclasses
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect(),
                memo_virtual_calls: node.memo_virtual_calls.iter().cloned().collect(),
                memo_interface_calls: node.memo_interface_calls.iter().cloned().collect(),
                parsed_methods: node.parsed_methods.iter().cloned().collect(),
            })
            .collect();

        let flatten = |cache: &std::collections::HashMap<
            (ClassName, MethodSignature),
            BTreeMap<ClassMethodSig, ClassIdx>,
        >|
         -> Vec<CacheEntry> {
            let mut entries: Vec<CacheEntry> = cache
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().map(|(k2, v2)| (k2.clone(), *v2)).collect()))
                .collect();
            entries.sort();
            entries
        };

        let mut special: Vec<(ClassName, Vec<CacheEntry>)> = program
            .caches
            .special_lookup
            .iter()
            .map(|(class, cache)| (class.clone(), flatten(cache)))
            .collect();
        special.sort();

        let mut interfaces: Vec<(ClassName, Vec<ClassName>)> = program
            .interfaces
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect();
        interfaces.sort();

        Snapshot {
            classes,
            interfaces,
            virtual_lookup: flatten(&program.caches.virtual_lookup),
            interface_lookup: flatten(&program.caches.interface_lookup),
            static_lookup: flatten(&program.caches.static_lookup),
            special_lookup: special,
            parsed: program.parsed.iter().cloned().collect(),
            clinits: program.clinits.iter().cloned().collect(),
            native_methods: program.native_methods.iter().cloned().collect(),
        }
    }

    pub fn restore(self) -> Program {
        let mut program = Program::default();
        for (idx, snap) in self.classes.into_iter().enumerate() {
            program.by_name.insert(snap.data.name.clone(), idx);
            let mut node = ClassNode::new(snap.data);
            node.superclass = snap.superclass;
            node.interfaces = snap.interfaces;
            node.children_classes = snap.children_classes;
            node.children_interfaces = snap.children_interfaces;
            node.is_instantiated = snap.is_instantiated;
            node.instantiated_subclasses = snap.instantiated_subclasses.into_iter().collect();
            node.memo_virtual_calls = snap.memo_virtual_calls.into_iter().collect();
            node.memo_interface_calls = snap.memo_interface_calls.into_iter().collect();
            node.parsed_methods = snap.parsed_methods.into_iter().collect();
            program.classes.push(node);
        }

        fn unflatten(
            entries: Vec<CacheEntry>,
        ) -> std::collections::HashMap<(ClassName, MethodSignature), BTreeMap<ClassMethodSig, ClassIdx>>
        {
            entries
                .into_iter()
                .map(|(k, v)| (k, v.into_iter().collect()))
                .collect()
        }

        program.interfaces = self
            .interfaces
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect();
        program.caches = DispatchCaches {
            virtual_lookup: unflatten(self.virtual_lookup),
            interface_lookup: unflatten(self.interface_lookup),
            static_lookup: unflatten(self.static_lookup),
            special_lookup: self
                .special_lookup
                .into_iter()
                .map(|(class, cache)| (class, unflatten(cache)))
                .collect(),
        };
        program.parsed = self.parsed.into_iter().collect();
        program.clinits = self.clinits.into_iter().collect();
        program.native_methods = self.native_methods.into_iter().collect();
        program
    }

    pub fn save_json<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer(writer, self)
    }

    pub fn load_json<R: Read>(reader: R) -> serde_json::Result<Snapshot> {
        serde_json::from_reader(reader)
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        self.save_json(std::io::BufWriter::new(file))
            .map_err(std::io::Error::from)
    }

    pub fn load_file(path: impl AsRef<Path>) -> std::io::Result<Snapshot> {
        let file = std::fs::File::open(path)?;
        Self::load_json(std::io::BufReader::new(file)).map_err(std::io::Error::from)
    }
}
