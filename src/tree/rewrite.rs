//! Rewrite Catalogue
//!
//! Fixed catalogue of text-level rewrites backing the optimize/refactor
//! directives and the code generator's improvement passes. These operate
//! on rendered text rather than a parsed tree: best-effort, lower
//! fidelity, which is why the transformer re-parses every result and
//! tags the change High risk.

use regex::Regex;

use crate::types::RewriteOp;

/// Apply one catalogue operation to a text buffer.
///
/// Returns the rewritten text (possibly unchanged when the operation
/// finds nothing to do) or a reason the operation cannot run at text
/// fidelity.
pub fn apply_op(op: &RewriteOp, text: &str) -> Result<String, String> {
    match op {
        RewriteOp::RemoveUnusedVariables => Ok(remove_unused_variables(text)),
        RewriteOp::SimplifyConditionals => Ok(simplify_conditionals(text)),
        RewriteOp::ReduceNesting => Ok(reduce_nesting(text)),
        RewriteOp::ConstantFolding => Ok(constant_folding(text)),
        RewriteOp::DeadCodeElimination => Ok(dead_code_elimination(text)),
        RewriteOp::RenameVariables { from, to } => Ok(rename_variables(text, from, to)),
        RewriteOp::ConvertClosureToFn => Ok(convert_closure_to_fn(text)),
        RewriteOp::DestructureParameters => Ok(destructure_parameters(text)),
        RewriteOp::ExtractMethod | RewriteOp::SplitFunction => Err(
            "extract_method/split_function require the tree-based extract directive".to_string(),
        ),
    }
}

/// Drop `let` bindings with a call-free initializer whose name never
/// appears again later in the buffer.
fn remove_unused_variables(text: &str) -> String {
    let binding = Regex::new(r"^\s*let\s+(?:mut\s+)?([A-Za-z_]\w*)\s*=\s*([^;]+);\s*$")
        .expect("static regex");

    let lines: Vec<&str> = text.lines().collect();
    let mut kept: Vec<&str> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let mut drop = false;
        if let Some(caps) = binding.captures(line) {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let rhs = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            // A call in the initializer may have side effects; keep it.
            if !rhs.contains('(') && !name.starts_with('_') {
                let rest = lines[i + 1..].join("\n");
                let used = Regex::new(&format!(r"\b{}\b", regex::escape(name)))
                    .map(|re| re.is_match(&rest))
                    .unwrap_or(true);
                drop = !used;
            }
        }
        if !drop {
            kept.push(line);
        }
    }

    let mut out = kept.join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// `if cond { true } else { false }` becomes `cond`; `== true` vanishes.
fn simplify_conditionals(text: &str) -> String {
    let bool_passthrough =
        Regex::new(r"if\s+([^\{\}\n]+?)\s*\{\s*true\s*\}\s*else\s*\{\s*false\s*\}")
            .expect("static regex");
    let text = bool_passthrough.replace_all(text, "$1").to_string();

    let eq_true = Regex::new(r"\s*==\s*true\b").expect("static regex");
    eq_true.replace_all(&text, "").to_string()
}

/// Collapse `if a { if b { body } }` (inner if without else, flat body)
/// into `if a && b { body }`.
fn reduce_nesting(text: &str) -> String {
    let nested = Regex::new(r"if\s+([^\{\}\n]+?)\s*\{\s*if\s+([^\{\}\n]+?)\s*\{([^\{\}]*)\}\s*\}")
        .expect("static regex");
    nested.replace_all(text, "if $1 && $2 {$3}").to_string()
}

/// Fold integer literal arithmetic (`2 + 3` → `5`), multiplication before
/// addition. Division and float literals are left alone, as are folds
/// whose neighbours would change the expression's grouping.
fn constant_folding(text: &str) -> String {
    let mul = Regex::new(r"(\d+)\s*(\*)\s*(\d+)").expect("static regex");
    let addsub = Regex::new(r"(\d+)\s*([+-])\s*(\d+)").expect("static regex");

    let mut out = text.to_string();
    for _ in 0..64 {
        match fold_once(&out, &mul).or_else(|| fold_once(&out, &addsub)) {
            Some(next) => out = next,
            None => break,
        }
    }
    out
}

/// Fold the first safely-foldable match of `re`, if any.
fn fold_once(text: &str, re: &Regex) -> Option<String> {
    for caps in re.captures_iter(text) {
        let whole = caps.get(0).expect("match");
        // Skip float literals and digit-adjacent matches.
        let adjacent_bad = |c: Option<char>| {
            matches!(c, Some(ch) if ch == '.' || ch == '_' || ch.is_ascii_alphanumeric())
        };
        if adjacent_bad(text[..whole.start()].chars().next_back())
            || adjacent_bad(text[whole.end()..].chars().next())
        {
            continue;
        }
        // Folding next to a higher- or equal-precedence operator would
        // regroup the expression; leave those alone.
        let prev = text[..whole.start()].trim_end().chars().next_back();
        let next = text[whole.end()..].trim_start().chars().next();
        let is_mul = &caps[2] == "*";
        if is_mul {
            if matches!(prev, Some('/')) {
                continue;
            }
        } else if matches!(prev, Some('-') | Some('*') | Some('/'))
            || matches!(next, Some('*') | Some('/'))
        {
            continue;
        }

        let lhs: i64 = match caps[1].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let rhs: i64 = match caps[3].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let value = match &caps[2] {
            "+" => lhs.checked_add(rhs),
            "-" => lhs.checked_sub(rhs),
            "*" => lhs.checked_mul(rhs),
            _ => None,
        };
        if let Some(v) = value {
            let mut folded = text.to_string();
            folded.replace_range(whole.range(), &v.to_string());
            return Some(folded);
        }
    }
    None
}

/// Remove statements after an unconditional `return ...;` until the
/// enclosing block closes. Tracks brace depth line by line.
fn dead_code_elimination(text: &str) -> String {
    let ret = Regex::new(r"^\s*return\b.*;\s*$").expect("static regex");

    let mut out: Vec<&str> = Vec::new();
    let mut depth: i32 = 0;
    let mut dead_above: Option<i32> = None;
    for line in text.lines() {
        let opens = line.matches('{').count() as i32;
        let closes = line.matches('}').count() as i32;
        let depth_after = depth + opens - closes;

        match dead_above {
            // Still inside the unreachable region; skip the line.
            Some(d) if depth_after >= d => {
                depth = depth_after;
                continue;
            }
            // The enclosing block closed; keep this line and resume.
            Some(_) => dead_above = None,
            None => {}
        }

        out.push(line);
        if ret.is_match(line) {
            dead_above = Some(depth);
        }
        depth = depth_after;
    }

    let mut result = out.join("\n");
    if text.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Word-boundary rename of an identifier, parameter-driven.
fn rename_variables(text: &str, from: &str, to: &str) -> String {
    match Regex::new(&format!(r"\b{}\b", regex::escape(from))) {
        Ok(re) => re.replace_all(text, to).to_string(),
        Err(_) => text.to_string(),
    }
}

/// `let f = |x: T| -> R { body };` becomes `fn f(x: T) -> R { body }`.
/// Only flat, fully-typed closures convert; anything else is left alone
/// and the re-parse gate does the rest.
fn convert_closure_to_fn(text: &str) -> String {
    let closure =
        Regex::new(r"let\s+([A-Za-z_]\w*)\s*=\s*\|([^|]*)\|\s*->\s*([^\{\n]+?)\s*\{([^{}]*)\};")
            .expect("static regex");
    closure.replace_all(text, "fn $1($2) -> $3 {$4}").to_string()
}

/// Adjacent `.0`/`.1` projections of the same tuple collapse into one
/// destructuring `let`.
fn destructure_parameters(text: &str) -> String {
    let pair = Regex::new(
        r"let\s+([A-Za-z_]\w*)\s*=\s*([A-Za-z_]\w*)\.0;\s*\n(\s*)let\s+([A-Za-z_]\w*)\s*=\s*([A-Za-z_]\w*)\.1;",
    )
    .expect("static regex");

    pair.replace_all(text, |caps: &regex::Captures| {
        if &caps[2] == &caps[5] {
            format!("let ({}, {}) = {};", &caps[1], &caps[4], &caps[2])
        } else {
            caps[0].to_string()
        }
    })
    .to_string()
}
