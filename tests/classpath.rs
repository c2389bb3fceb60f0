//! Classpath tests: directories, archives, and mixed search paths.

mod common;

use std::fs;
use std::io::Write;

use classflow::classfile::ClassError;
use classflow::classpath::{ClassPath, ClassSource};

use common::assemble_class;

#[test]
fn finds_classes_in_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("p")).unwrap();
    fs::write(
        dir.path().join("p/A.class"),
        assemble_class("p/A", "m", &[0xb1]),
    )
    .unwrap();

    let mut cp = ClassPath::new(dir.path().to_str().unwrap()).unwrap();
    let class = cp.find_class("p/A").unwrap();
    assert_eq!(class.name, "p/A");

    match cp.find_class("p/Missing") {
        Err(ClassError::NotFound(name)) => assert_eq!(name, "p/Missing"),
        other => panic!("expected not-found, got {other:?}"),
    }
}

#[test]
fn finds_classes_in_a_jar() {
    let dir = tempfile::tempdir().unwrap();
    let jar_path = dir.path().join("lib.jar");
    {
        let file = fs::File::create(&jar_path).unwrap();
        let mut jar = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        jar.start_file("q/B.class", options).unwrap();
        jar.write_all(&assemble_class("q/B", "m", &[0xb1])).unwrap();
        jar.finish().unwrap();
    }

    let mut cp = ClassPath::new(jar_path.to_str().unwrap()).unwrap();
    let class = cp.find_class("q/B").unwrap();
    assert_eq!(class.name, "q/B");
    assert!(cp.find_class("q/C").is_err());
}

#[test]
fn searches_entries_in_order() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("p")).unwrap();
    fs::write(
        dir.path().join("p/A.class"),
        assemble_class("p/A", "m", &[0xb1]),
    )
    .unwrap();

    let jar_path = dir.path().join("lib.jar");
    {
        let file = fs::File::create(&jar_path).unwrap();
        let mut jar = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        jar.start_file("q/B.class", options).unwrap();
        jar.write_all(&assemble_class("q/B", "m", &[0xb1])).unwrap();
        jar.finish().unwrap();
    }

    let spec = format!(
        "{}:{}",
        dir.path().to_str().unwrap(),
        jar_path.to_str().unwrap()
    );
    let mut cp = ClassPath::new(&spec).unwrap();
    assert!(cp.find_class("p/A").is_ok());
    assert!(cp.find_class("q/B").is_ok());
}

#[test]
fn declared_name_must_match_the_path() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("p")).unwrap();
    // The file claims to be p/X but sits at p/A.class.
    fs::write(
        dir.path().join("p/A.class"),
        assemble_class("p/X", "m", &[0xb1]),
    )
    .unwrap();

    let mut cp = ClassPath::new(dir.path().to_str().unwrap()).unwrap();
    assert!(matches!(
        cp.find_class("p/A"),
        Err(ClassError::Malformed(_))
    ));
}

#[test]
fn missing_archive_fails_eagerly() {
    assert!(ClassPath::new("/nonexistent/lib.jar").is_err());
}
