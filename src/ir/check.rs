//! FileCheck-style test validation for `.mir` files.
//!
//! This module provides functionality to parse CHECK directives from IR files
//! and validate output against expected patterns, similar to LLVM's FileCheck
//! tool but implemented in a Rust-native way. Directives are `//` comments, so
//! a test file is also valid input for the IR parser.

use bumpalo::Bump;

use super::{Module, Printer};
use crate::analysis;
use crate::core::{CodegenOptions, CompilationSession};

/// A CHECK directive extracted from an IR file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDirective {
    /// CHECK: pattern - Match exact pattern
    Check(String),
    /// CHECK-LABEL: pattern - Label for a section
    CheckLabel(String),
    /// CHECK-NEXT: pattern - Match on the next line
    CheckNext(String),
    /// CHECK-NOT: pattern - Must not occur before the next positive match
    CheckNot(String),
    /// CHECK-EMPTY - Match empty line
    CheckEmpty,
    /// COM: comment - Comment, ignored
    Comment(String),
}

/// A RUN directive specifying how to execute the test
#[derive(Debug, Clone)]
pub struct RunDirective {
    pub command: String,
    pub args: Vec<String>,
}

/// Test specification extracted from an IR file
#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    pub ir_content: String,
}

impl TestSpec {
    /// Parse an IR file to extract test specifications
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();
        let mut ir_lines = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();

            if let Some(run_cmd) = trimmed.strip_prefix("// RUN:") {
                let parts: Vec<&str> = run_cmd.split_whitespace().collect();
                if let Some((command, args)) = parts.split_first() {
                    run_directives.push(RunDirective {
                        command: command.to_string(),
                        args: args.iter().map(|s| s.to_string()).collect(),
                    });
                }
            } else if let Some(pattern) = trimmed.strip_prefix("// CHECK-LABEL:") {
                check_directives.push(CheckDirective::CheckLabel(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("// CHECK-NEXT:") {
                check_directives.push(CheckDirective::CheckNext(pattern.trim().to_string()));
            } else if let Some(pattern) = trimmed.strip_prefix("// CHECK-NOT:") {
                check_directives.push(CheckDirective::CheckNot(pattern.trim().to_string()));
            } else if trimmed.starts_with("// CHECK-EMPTY") {
                check_directives.push(CheckDirective::CheckEmpty);
            } else if let Some(pattern) = trimmed.strip_prefix("// CHECK:") {
                check_directives.push(CheckDirective::Check(pattern.trim().to_string()));
            } else if let Some(comment) = trimmed.strip_prefix("// COM:") {
                check_directives.push(CheckDirective::Comment(comment.trim().to_string()));
            } else if trimmed.starts_with("// CHECK") {
                return Err(format!("unknown check directive: {trimmed}"));
            } else {
                ir_lines.push(line);
            }
        }

        if run_directives.is_empty() {
            return Err("no RUN directive".to_string());
        }

        Ok(TestSpec {
            run_directives,
            check_directives,
            ir_content: ir_lines.join("\n"),
        })
    }
}

/// Fails if a pending CHECK-NOT pattern occurs in `lines[from..end]`.
fn check_forbidden(
    lines: &[&str],
    forbidden: &mut Vec<&str>,
    from: usize,
    end: usize,
) -> Result<(), String> {
    for pattern in forbidden.drain(..) {
        if let Some(line) = lines[from..end].iter().find(|l| l.contains(pattern)) {
            return Err(format!("CHECK-NOT: pattern '{pattern}' found in '{line}'"));
        }
    }
    Ok(())
}

/// Test runner that executes IR tests
pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Run an IR test and validate output
    pub fn run_test(&self, spec: &TestSpec) -> Result<(), String> {
        for run_dir in &spec.run_directives {
            let output = self.execute_command(&spec.ir_content, run_dir)?;
            if self.verbose {
                println!("{output}");
            }
            self.validate_output(&output, &spec.check_directives)?;
        }

        Ok(())
    }

    /// Execute a test command and return the output
    pub fn execute_command(&self, ir: &str, run_dir: &RunDirective) -> Result<String, String> {
        let mut module = Module::parse(ir).map_err(|e| e.to_string())?;
        let mut options = CodegenOptions {
            check_consistency: true,
            ..CodegenOptions::default()
        };
        let mut print_ir = false;
        let mut print_destroys = false;
        let mut print_classes = false;
        let mut emit_asm = false;

        for arg in &run_dir.args {
            match arg.as_str() {
                "--print-ir" => print_ir = true,
                "--print-destroys" => print_destroys = true,
                "--print-classes" => print_classes = true,
                "--emit-asm" => emit_asm = true,
                "--no-tail-calls" => options.tail_calls = false,
                "--no-fold" => options.fold_constants = false,
                "%s" => {}
                other => return Err(format!("unknown RUN argument {other}")),
            }
        }

        let mut output = Vec::new();

        if print_ir {
            output.push("Printing IR".to_string());
            output.push(module.to_string());
        }

        if print_destroys || print_classes {
            let mut analyzed = module.clone();
            for func in &mut analyzed.functions {
                analysis::analyze(func).map_err(|e| e.to_string())?;
                let mut printer = Printer::new(func);
                if print_destroys {
                    printer = printer.with_destroys();
                }
                if print_classes {
                    printer = printer.with_classes();
                }
                output.push(printer.to_string());
            }
        }

        if emit_asm {
            let arena = Bump::new();
            let session = CompilationSession::with_options(&arena, options);
            let asm = module.compile(&session).map_err(|e| e.to_string())?;
            output.push(asm);
        }

        Ok(output.join("\n"))
    }

    /// Validate output against CHECK directives
    pub fn validate_output(
        &self,
        output: &str,
        directives: &[CheckDirective],
    ) -> Result<(), String> {
        let output_lines: Vec<&str> = output.lines().collect();
        let mut line_idx = 0;
        let mut forbidden: Vec<&str> = Vec::new();

        for directive in directives {
            match directive {
                CheckDirective::Comment(_) => continue,

                CheckDirective::CheckNot(pattern) => forbidden.push(pattern.as_str()),

                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => {
                    let found = output_lines
                        .iter()
                        .skip(line_idx)
                        .position(|line| line.contains(pattern.as_str()));

                    match found {
                        Some(idx) => {
                            check_forbidden(&output_lines, &mut forbidden, line_idx, line_idx + idx)?;
                            line_idx += idx + 1;
                            if self.verbose {
                                println!("CHECK: '{}' found at line {}", pattern, line_idx - 1);
                            }
                        }
                        None => {
                            return Err(format!("CHECK: pattern '{pattern}' not found in output"));
                        }
                    }
                }

                CheckDirective::CheckNext(pattern) => {
                    if line_idx >= output_lines.len() {
                        return Err(format!("CHECK-NEXT: no more lines, expected '{pattern}'"));
                    }

                    let line = output_lines[line_idx];
                    if !line.contains(pattern.as_str()) {
                        return Err(format!(
                            "CHECK-NEXT: expected '{pattern}' but got '{line}'"
                        ));
                    }
                    check_forbidden(&output_lines, &mut forbidden, line_idx, line_idx)?;

                    if self.verbose {
                        println!("CHECK-NEXT: '{}' matches at line {}", pattern, line_idx);
                    }
                    line_idx += 1;
                }

                CheckDirective::CheckEmpty => {
                    if line_idx >= output_lines.len() {
                        continue;
                    }

                    let line = output_lines[line_idx];
                    if !line.trim().is_empty() {
                        return Err(format!(
                            "CHECK-EMPTY: expected empty line but got '{line}'"
                        ));
                    }

                    line_idx += 1;
                }
            }
        }

        check_forbidden(&output_lines, &mut forbidden, line_idx, output_lines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directives() {
        let content = r#"// RUN: %mlc --print-ir %s
// CHECK: Printing IR
// CHECK-LABEL: fn test
// CHECK-NEXT: return x;
// CHECK-NOT: destroy
// COM: This is a comment
fn test(x) {
    return x;
}"#;

        let spec = TestSpec::parse(content).unwrap();
        assert_eq!(spec.run_directives.len(), 1);
        assert_eq!(spec.run_directives[0].args, vec!["--print-ir", "%s"]);
        assert_eq!(spec.check_directives.len(), 5);
        assert!(spec.ir_content.contains("fn test(x)"));
        assert!(!spec.ir_content.contains("CHECK"));
    }

    #[test]
    fn test_check_matching() {
        let runner = TestRunner::new(false);
        let output = "Printing IR\nfn test(x) {\n    return x;\n}\n";

        let directives = vec![
            CheckDirective::Check("Printing IR".to_string()),
            CheckDirective::CheckLabel("fn test".to_string()),
            CheckDirective::CheckNext("return x;".to_string()),
            CheckDirective::CheckNot("destroy".to_string()),
        ];

        runner.validate_output(output, &directives).unwrap();
    }

    #[test]
    fn test_check_next_failure() {
        let runner = TestRunner::new(false);
        let output = "Line 1\nLine 2\nLine 3\n";

        let directives = vec![
            CheckDirective::Check("Line 1".to_string()),
            CheckDirective::CheckNext("Line 3".to_string()),
        ];

        let result = runner.validate_output(output, &directives);
        assert!(result.unwrap_err().contains("CHECK-NEXT"));
    }

    #[test]
    fn test_check_not_failure() {
        let runner = TestRunner::new(false);
        let output = "cmp rdi, rsi\njge .L0\nret\n";

        let directives = vec![
            CheckDirective::CheckNot("cmp".to_string()),
            CheckDirective::Check("ret".to_string()),
        ];

        let result = runner.validate_output(output, &directives);
        assert!(result.unwrap_err().contains("CHECK-NOT"));
    }

    #[test]
    fn test_run_emits_assembly() {
        let spec = TestSpec::parse(
            "// RUN: %mlc --emit-asm %s\n// CHECK-LABEL: f:\n// CHECK-NEXT: add rdi, rsi\nfn f(x, y) { z = add(x, y); return z; }",
        )
        .unwrap();
        TestRunner::new(false).run_test(&spec).unwrap();
    }
}
