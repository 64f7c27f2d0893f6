//! Validator Checks
//!
//! The four independent checks behind the modification validator:
//! syntax, security, performance, and compatibility. Each returns a
//! named result with its findings; errors block, warnings never do.

use std::path::Path;

use regex::Regex;

use crate::types::{Change, ChangeType, CheckResult};

/// Files that must never be modified by the engine.
pub static PROTECTED_FILES: &[&str] = &[
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    ".env",
    ".env.local",
];

/// Directory patterns that are off-limits for modification.
pub static BLOCKED_DIRECTORY_PATTERNS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    ".metamorph",
    "/etc",
    "/usr",
    "/var",
    "/sys",
    "/proc",
];

/// Constructs on the deny-list: dynamic code execution and dynamic
/// module loading, in both host and generated-code flavors.
static DENY_LIST: &[(&str, &str)] = &[
    (r"\beval\s*\(", "dynamic code evaluation"),
    (r"\bnew\s+Function\s*\(", "dynamic function construction"),
    (r"std::process::Command", "subprocess spawning"),
    (r"\blibloading\b", "dynamic module loading"),
    (r"\bdlopen\b", "dynamic module loading"),
    (r"\basm!\s*\(", "inline assembly"),
    (r"\btransmute\b", "unchecked type transmutation"),
];

/// Anti-patterns with known pathological cost. Warn, never block.
static ANTI_PATTERNS: &[(&str, &str)] = &[
    (r"\bloop\s*\{", "unbounded loop; confirm it has a break path"),
    (r"while\s+true\b", "while-true loop"),
    (r"\.clone\(\)[\s\S]{0,40}\.clone\(\)", "repeated clones in close proximity"),
    (
        r"for\s+[^\{]+\{[^}]*for\s+[^\{]+\{[^}]*for\s+[^\{]+\{",
        "triple-nested loop",
    ),
];

/// 1. Syntax: every fragment (pre-apply) or touched file (post-apply)
/// must parse.
pub fn syntax_check(changes: &[Change], workspace: &Path, post_apply: bool) -> CheckResult {
    let mut errors = Vec::new();

    if post_apply {
        let mut seen = Vec::new();
        for change in changes {
            if seen.contains(&&change.file_path) {
                continue;
            }
            seen.push(&change.file_path);
            if !change.file_path.ends_with(".rs") {
                continue;
            }
            let path = resolve(workspace, &change.file_path);
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    if let Err(e) = syn::parse_file(&text) {
                        errors.push(format!("{}: does not parse after apply: {e}", change.file_path));
                    }
                }
                Err(e) => errors.push(format!("{}: unreadable after apply: {e}", change.file_path)),
            }
        }
    } else {
        for change in changes {
            let Some(fragment) = &change.new_code else {
                continue;
            };
            if !parses_as_fragment(fragment) {
                errors.push(format!(
                    "{} line {}: replacement text is not valid Rust",
                    change.file_path, change.line
                ));
            }
        }
    }

    CheckResult {
        name: "syntax".to_string(),
        passed: errors.is_empty(),
        errors,
        warnings: Vec::new(),
    }
}

/// A fragment may be a whole file, an item, statements, or an expression.
fn parses_as_fragment(text: &str) -> bool {
    syn::parse_file(text).is_ok()
        || syn::parse_str::<syn::Item>(text).is_ok()
        || syn::parse_str::<syn::Block>(&format!("{{ {text} }}")).is_ok()
        || syn::parse_str::<syn::Expr>(text.trim().trim_end_matches(';')).is_ok()
}

/// 2. Security: deny-listed constructs and protected paths are errors.
pub fn security_check(changes: &[Change]) -> CheckResult {
    let mut errors = Vec::new();

    for change in changes {
        if is_protected_file(&change.file_path) {
            errors.push(format!("{}: protected file", change.file_path));
        }
        if let Some(pattern) = blocked_directory(&change.file_path) {
            errors.push(format!(
                "{}: path falls inside blocked directory pattern `{pattern}`",
                change.file_path
            ));
        }
        let Some(new_code) = &change.new_code else {
            continue;
        };
        for (pattern, reason) in DENY_LIST {
            if let Ok(re) = Regex::new(pattern) {
                if re.is_match(new_code) {
                    errors.push(format!(
                        "{} line {}: introduces {reason}",
                        change.file_path, change.line
                    ));
                }
            }
        }
    }

    CheckResult {
        name: "security".to_string(),
        passed: errors.is_empty(),
        errors,
        warnings: Vec::new(),
    }
}

/// Returns `true` when `file_path` matches (by file name) any entry in
/// [`PROTECTED_FILES`].
pub fn is_protected_file(file_path: &str) -> bool {
    let name = Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    PROTECTED_FILES.iter().any(|&p| name == p)
}

fn blocked_directory(file_path: &str) -> Option<&'static str> {
    BLOCKED_DIRECTORY_PATTERNS
        .iter()
        .find(|p| file_path.contains(*p))
        .copied()
}

/// 3. Performance: recorded anti-patterns are warnings only.
pub fn performance_check(changes: &[Change]) -> CheckResult {
    let mut warnings = Vec::new();

    for change in changes {
        let Some(new_code) = &change.new_code else {
            continue;
        };
        for (pattern, reason) in ANTI_PATTERNS {
            if let Ok(re) = Regex::new(pattern) {
                if re.is_match(new_code) {
                    warnings.push(format!(
                        "{} line {}: {reason}",
                        change.file_path, change.line
                    ));
                }
            }
        }
    }

    CheckResult {
        name: "performance".to_string(),
        passed: true,
        errors: Vec::new(),
        warnings,
    }
}

/// 4. Compatibility: a `Modify` change may not alter a public function's
/// signature, which would break recorded callers.
pub fn compatibility_check(changes: &[Change]) -> CheckResult {
    let sig = Regex::new(r"pub\s+(?:async\s+)?fn\s+(\w+)\s*\(([^)]*)\)(?:\s*->\s*([^\{;]+))?")
        .expect("static regex");
    let mut errors = Vec::new();

    for change in changes {
        if change.change_type != ChangeType::Modify {
            continue;
        }
        let (Some(before), Some(after)) = (&change.original_code, &change.new_code) else {
            continue;
        };
        for caps in sig.captures_iter(before) {
            let name = &caps[1];
            let old_params = normalize(caps.get(2).map(|m| m.as_str()).unwrap_or(""));
            let old_ret = normalize(caps.get(3).map(|m| m.as_str()).unwrap_or(""));

            let Some(new_caps) = sig
                .captures_iter(after)
                .find(|c| &c[1] == name)
            else {
                errors.push(format!(
                    "{}: public function `{name}` removed by the change",
                    change.file_path
                ));
                continue;
            };
            let new_params = normalize(new_caps.get(2).map(|m| m.as_str()).unwrap_or(""));
            let new_ret = normalize(new_caps.get(3).map(|m| m.as_str()).unwrap_or(""));
            if old_params != new_params || old_ret != new_ret {
                errors.push(format!(
                    "{}: public function `{name}` signature changed, breaking recorded callers",
                    change.file_path
                ));
            }
        }
    }

    CheckResult {
        name: "compatibility".to_string(),
        passed: errors.is_empty(),
        errors,
        warnings: Vec::new(),
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn resolve(workspace: &Path, file_path: &str) -> std::path::PathBuf {
    let p = Path::new(file_path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workspace.join(p)
    }
}
