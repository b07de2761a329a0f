//! FileCheck-style tests for `.mir` files
//!
//! Each file under `tests/filetests` carries its own RUN and CHECK
//! directives as `//` comments.

use mlc::ir::check::{TestRunner, TestSpec};
use std::fs;
use std::path::{Path, PathBuf};

fn filetest_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/filetests")
}

/// Test helper that runs a `.mir` file through FileCheck validation
fn run_filecheck_test(file: &str) {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = filetest_dir().join(file);
    let contents = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));

    let spec = TestSpec::parse(&contents)
        .unwrap_or_else(|e| panic!("Failed to parse test spec from {}: {}", file, e));

    let runner = TestRunner::new(false);
    runner
        .run_test(&spec)
        .unwrap_or_else(|e| panic!("Test {} failed: {}", file, e));
}

#[test]
fn test_add_filecheck() {
    run_filecheck_test("add.mir");
}

#[test]
fn test_fold_filecheck() {
    run_filecheck_test("fold.mir");
}

#[test]
fn test_alloc_filecheck() {
    run_filecheck_test("alloc.mir");
}

#[test]
fn test_merge_filecheck() {
    run_filecheck_test("merge.mir");
}

#[test]
fn test_no_tail_calls_filecheck() {
    run_filecheck_test("no_tail_calls.mir");
}

#[test]
fn test_destroys_filecheck() {
    run_filecheck_test("destroys.mir");
}

#[test]
fn test_classes_filecheck() {
    run_filecheck_test("classes.mir");
}

#[test]
fn test_print_ir_filecheck() {
    run_filecheck_test("print_ir.mir");
}

/// Every file in the directory parses and passes, including ones without a
/// dedicated test above.
#[test]
fn test_all_filetests() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut entries: Vec<PathBuf> = fs::read_dir(filetest_dir())
        .expect("Failed to read filetest directory")
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "mir"))
        .collect();
    entries.sort();
    assert!(!entries.is_empty());

    let mut failures = Vec::new();
    for path in &entries {
        let contents = fs::read_to_string(path).unwrap();
        let result = TestSpec::parse(&contents)
            .and_then(|spec| TestRunner::new(false).run_test(&spec));
        if let Err(e) = result {
            failures.push(format!("{}: {}", path.display(), e));
        }
    }
    assert!(failures.is_empty(), "failing filetests:\n{}", failures.join("\n"));
}
