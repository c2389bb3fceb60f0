//! Class lookup over a search path of directories and archives.
//!
//! A classpath string is a `:`- or `;`-separated list of directories and
//! `.jar`/`.zip` archives. Archives are opened once and kept open for the
//! lifetime of the [`ClassPath`] value; dropping it releases them on both
//! success and failure paths.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::classfile::{parse_class, ClassData, ClassError, ClassName};

/// Anything that can produce decoded classes by name.
///
/// The production implementation is [`ClassPath`]; tests use
/// [`MemorySource`] to analyse synthetic classes without touching the
/// filesystem.
pub trait ClassSource {
    fn find_class(&mut self, name: &str) -> Result<ClassData, ClassError>;
}

enum Entry {
    Dir(PathBuf),
    Archive(ZipArchive<BufReader<File>>),
}

pub struct ClassPath {
    entries: Vec<Entry>,
}

impl ClassPath {
    /// Build a classpath from a `:`/`;`-separated specification.
    ///
    /// Missing directories are kept (they may appear later); archives are
    /// opened eagerly so format errors surface here.
    pub fn new(spec: &str) -> Result<ClassPath, ClassError> {
        let mut entries = Vec::new();
        for part in spec.split([':', ';']).filter(|p| !p.is_empty()) {
            let path = Path::new(part);
            let is_archive = path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("jar") || e.eq_ignore_ascii_case("zip"));
            if is_archive {
                let file = File::open(path)?;
                entries.push(Entry::Archive(ZipArchive::new(BufReader::new(file))?));
            } else {
                entries.push(Entry::Dir(path.to_path_buf()));
            }
        }
        Ok(ClassPath { entries })
    }

    /// Locate the raw bytes of `name` (internal form, e.g. `java/lang/Object`).
    pub fn read_class_bytes(&mut self, name: &str) -> Result<Vec<u8>, ClassError> {
        let entry_name = format!("{name}.class");
        for entry in &mut self.entries {
            match entry {
                Entry::Dir(dir) => {
                    let path = dir.join(&entry_name);
                    if path.is_file() {
                        return Ok(std::fs::read(path)?);
                    }
                }
                Entry::Archive(archive) => match archive.by_name(&entry_name) {
                    Ok(mut file) => {
                        let mut data = Vec::with_capacity(file.size() as usize);
                        file.read_to_end(&mut data)?;
                        return Ok(data);
                    }
                    Err(zip::result::ZipError::FileNotFound) => continue,
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Err(ClassError::NotFound(name.to_string()))
    }
}

impl ClassSource for ClassPath {
    fn find_class(&mut self, name: &str) -> Result<ClassData, ClassError> {
        let bytes = self.read_class_bytes(name)?;
        let class = parse_class(&bytes)?;
        if class.name != name {
            return Err(ClassError::Malformed(format!(
                "file for '{name}' declares class '{}'",
                class.name
            )));
        }
        Ok(class)
    }
}

/// An in-memory class table.
#[derive(Default)]
pub struct MemorySource {
    classes: HashMap<ClassName, ClassData>,
}

impl MemorySource {
    pub fn new() -> MemorySource {
        MemorySource::default()
    }

    pub fn add(&mut self, class: ClassData) -> &mut Self {
        self.classes.insert(class.name.clone(), class);
        self
    }
}

impl ClassSource for MemorySource {
    fn find_class(&mut self, name: &str) -> Result<ClassData, ClassError> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| ClassError::NotFound(name.to_string()))
    }
}
