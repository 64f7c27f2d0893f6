//! Code Generator
//!
//! Pure, side-effect-free rendering of new source fragments: optimized
//! function bodies, generated test modules, and documentation. Takes
//! structured inputs, returns text, never touches the filesystem.
//! Improvements reuse the rewrite catalogue, applied sequentially to a
//! text buffer; the result is fresh code, not yet part of a validated
//! tree, so text fidelity is acceptable here.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::tree::rewrite;
use crate::types::RewriteOp;

/// What the caller learned about the code being regenerated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeAnalysis {
    pub issues: Vec<String>,
    pub notes: Vec<String>,
}

/// A function signature the test generator renders calls against.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FnSignature {
    pub name: String,
    /// (name, type) pairs.
    pub params: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
}

/// One generated test case: arguments and the expected result.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    pub args: Vec<String>,
    pub expected: String,
}

/// A function being documented.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDescriptor {
    pub name: String,
    pub signature: String,
    pub description: String,
    #[serde(default)]
    pub params: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,
}

/// Apply a sequence of improvements to `source`, returning the rewritten
/// text with a short header recording what was done and why.
pub fn generate_optimized_code(
    analysis: &CodeAnalysis,
    target: &str,
    improvements: &[RewriteOp],
    source: &str,
) -> Result<String> {
    if improvements.is_empty() {
        bail!("no improvements requested for `{target}`");
    }

    let mut text = source.to_string();
    for op in improvements {
        text = rewrite::apply_op(op, &text).map_err(|reason| anyhow::anyhow!(reason))?;
    }

    let mut header = format!("// Optimized `{target}`: {} improvement(s)\n", improvements.len());
    for issue in &analysis.issues {
        header.push_str(&format!("// addresses: {issue}\n"));
    }
    Ok(format!("{header}{text}"))
}

/// Render a `#[cfg(test)]` module exercising `signature` with the given
/// cases.
pub fn generate_test_code(target: &str, signature: &FnSignature, cases: &[TestCase]) -> String {
    let mut out = format!("// Generated tests for `{target}`\n");
    out.push_str("#[cfg(test)]\nmod generated_tests {\n    use super::*;\n");

    for case in cases {
        let args = case.args.join(", ");
        out.push_str(&format!(
            "\n    #[test]\n    fn {name}() {{\n",
            name = sanitize_test_name(&case.name)
        ));
        match &signature.return_type {
            Some(_) => out.push_str(&format!(
                "        assert_eq!({fn_name}({args}), {expected});\n",
                fn_name = signature.name,
                expected = case.expected
            )),
            None => out.push_str(&format!(
                "        {fn_name}({args});\n",
                fn_name = signature.name
            )),
        }
        out.push_str("    }\n");
    }

    out.push_str("}\n");
    out
}

/// Render markdown documentation for a set of functions.
pub fn generate_documentation(target: &str, functions: &[FunctionDescriptor]) -> String {
    let mut out = format!("# {target}\n\n");
    for f in functions {
        out.push_str(&format!("## `{}`\n\n", f.name));
        out.push_str(&format!("```rust\n{}\n```\n\n", f.signature));
        out.push_str(&format!("{}\n\n", f.description));
        if !f.params.is_empty() {
            out.push_str("Parameters:\n\n");
            for (name, desc) in &f.params {
                out.push_str(&format!("- `{name}`: {desc}\n"));
            }
            out.push('\n');
        }
        if let Some(returns) = &f.returns {
            out.push_str(&format!("Returns: {returns}\n\n"));
        }
    }
    out.trim_end().to_string() + "\n"
}

fn sanitize_test_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if cleaned.starts_with("test_") {
        cleaned
    } else {
        format!("test_{cleaned}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimized_code_applies_improvements_in_order() {
        let analysis = CodeAnalysis {
            issues: vec!["constant arithmetic".into()],
            notes: vec![],
        };
        let out = generate_optimized_code(
            &analysis,
            "answer",
            &[RewriteOp::ConstantFolding],
            "fn answer() -> i32 {\n    40 + 2\n}\n",
        )
        .unwrap();
        assert!(out.contains("42"));
        assert!(out.starts_with("// Optimized `answer`"));
        assert!(out.contains("addresses: constant arithmetic"));
    }

    #[test]
    fn test_optimized_code_rejects_tree_only_ops() {
        let err = generate_optimized_code(
            &CodeAnalysis::default(),
            "f",
            &[RewriteOp::ExtractMethod],
            "fn f() {}",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_generated_tests_parse() {
        let sig = FnSignature {
            name: "add".into(),
            params: vec![("a".into(), "i32".into()), ("b".into(), "i32".into())],
            return_type: Some("i32".into()),
        };
        let cases = vec![
            TestCase {
                name: "adds small".into(),
                args: vec!["1".into(), "2".into()],
                expected: "3".into(),
            },
            TestCase {
                name: "adds negatives".into(),
                args: vec!["-1".into(), "-2".into()],
                expected: "-3".into(),
            },
        ];
        let out = generate_test_code("add", &sig, &cases);
        assert!(out.contains("fn test_adds_small()"));
        assert!(out.contains("assert_eq!(add(1, 2), 3);"));
        // Generated code must itself be valid Rust.
        syn::parse_file(&out).unwrap();
    }

    #[test]
    fn test_documentation_lists_params_and_returns() {
        let doc = generate_documentation(
            "math",
            &[FunctionDescriptor {
                name: "add".into(),
                signature: "fn add(a: i32, b: i32) -> i32".into(),
                description: "Adds two numbers.".into(),
                params: vec![("a".into(), "left operand".into())],
                returns: Some("the sum".into()),
            }],
        );
        assert!(doc.contains("# math"));
        assert!(doc.contains("## `add`"));
        assert!(doc.contains("- `a`: left operand"));
        assert!(doc.contains("Returns: the sum"));
    }
}
