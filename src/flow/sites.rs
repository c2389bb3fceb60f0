//! Allocation sites and their program-wide interner.

use std::collections::HashMap;

use crate::classfile::{ClassMethodSig, ObjectType};

/// A program point: a method and a pc inside it.
pub type ProgramPoint = (ClassMethodSig, usize);

/// An allocation site: the call stack of the allocation (possibly empty,
/// for context-insensitive analyses) paired with the allocated type.
/// Identity is structural.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Site {
    pub context: Vec<ProgramPoint>,
    pub ty: ObjectType,
}

/// Stable integer handle for an interned site.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SiteId(pub u32);

/// Interns sites to [`SiteId`]s so sets and maps key on integers.
#[derive(Clone, Debug, Default)]
pub struct SiteTable {
    by_site: HashMap<Site, SiteId>,
    sites: Vec<Site>,
}

impl SiteTable {
    pub fn new() -> SiteTable {
        SiteTable::default()
    }

    pub fn intern(&mut self, site: Site) -> SiteId {
        if let Some(&id) = self.by_site.get(&site) {
            return id;
        }
        let id = SiteId(self.sites.len() as u32);
        self.by_site.insert(site.clone(), id);
        self.sites.push(site);
        id
    }

    pub fn get(&self, id: SiteId) -> &Site {
        &self.sites[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
