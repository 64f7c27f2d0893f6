//! Tree Transformer
//!
//! Pure-ish transformation of parsed source trees: rename, extract,
//! inline, and the optimize/refactor rewrite catalogue. Each directive
//! returns structured `Change`s; edits land only in the arena, never on
//! disk. Target resolution failure aborts the whole batch before any
//! arena mutation survives; a rewrite whose output no longer parses is
//! rejected individually without aborting its siblings.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use proc_macro2::Span;
use syn::spanned::Spanned;
use syn::visit::Visit;
use tracing::debug;
use uuid::Uuid;

use crate::error::MutationError;
use crate::types::{Change, ChangeType, RiskTier, TransformDirective};

use super::rewrite;
use super::store::{item_ident, render_item, SourceTree, TreeArena};

/// A directive the transformer declined to apply, with the reason.
#[derive(Clone, Debug)]
pub struct RejectedDirective {
    pub kind: &'static str,
    pub target: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct TransformSummary {
    pub applied: usize,
    pub rejected: usize,
    pub files_touched: Vec<String>,
}

/// Result of a transform batch.
#[derive(Debug)]
pub struct TransformOutcome {
    pub changes: Vec<Change>,
    pub rejected: Vec<RejectedDirective>,
    pub summary: TransformSummary,
}

enum DirectiveError {
    /// No node matches the target; aborts the whole batch.
    NotFound(String),
    /// The directive cannot be applied safely; siblings continue.
    Rejected(String),
}

/// Apply a batch of directives in submission order. Each directive
/// operates on the tree state left by the previous one, so a later
/// directive may target a node introduced by an earlier one.
///
/// With `fail_fast`, a rejected directive fails the whole batch instead
/// of being skipped.
pub fn transform(
    arena: &mut TreeArena,
    directives: &[TransformDirective],
    fail_fast: bool,
) -> Result<TransformOutcome, MutationError> {
    // Captured so a TargetNotFound abort leaves no partial mutation
    // behind in the arena.
    let snapshot = arena.texts();

    let mut changes = Vec::new();
    let mut rejected = Vec::new();
    let mut files: Vec<String> = Vec::new();

    for directive in directives {
        let result = match directive {
            TransformDirective::Rename {
                target,
                new_name,
                rationale,
            } => apply_rename(arena, target, new_name, rationale.as_deref()),
            TransformDirective::Extract {
                target,
                start_line,
                end_line,
                new_name,
                rationale,
            } => apply_extract(
                arena,
                target,
                *start_line,
                *end_line,
                new_name,
                rationale.as_deref(),
            ),
            TransformDirective::Inline { target, rationale } => {
                apply_inline(arena, target, rationale.as_deref())
            }
            TransformDirective::Optimize {
                target,
                operations,
                rationale,
            } => apply_rewrites(
                arena,
                target,
                operations,
                ChangeType::Optimize,
                rationale.as_deref(),
            ),
            TransformDirective::Refactor {
                target,
                operations,
                rationale,
            } => apply_rewrites(
                arena,
                target,
                operations,
                ChangeType::Refactor,
                rationale.as_deref(),
            ),
        };

        match result {
            Ok(mut produced) => {
                for c in &produced {
                    if !files.contains(&c.file_path) {
                        files.push(c.file_path.clone());
                    }
                }
                changes.append(&mut produced);
            }
            Err(DirectiveError::NotFound(target)) => {
                let _ = arena.restore(snapshot);
                return Err(MutationError::TargetNotFound(target));
            }
            Err(DirectiveError::Rejected(reason)) => {
                debug!(
                    "rejected {} directive on {}: {}",
                    directive.kind(),
                    directive.target(),
                    reason
                );
                if fail_fast {
                    let _ = arena.restore(snapshot);
                    return Err(MutationError::ValidationFailed(format!(
                        "{} on {} rejected: {}",
                        directive.kind(),
                        directive.target(),
                        reason
                    )));
                }
                rejected.push(RejectedDirective {
                    kind: directive.kind(),
                    target: directive.target().to_string(),
                    reason,
                });
            }
        }
    }

    let summary = TransformSummary {
        applied: changes.len(),
        rejected: rejected.len(),
        files_touched: files,
    };
    Ok(TransformOutcome {
        changes,
        rejected,
        summary,
    })
}

// ─── Target resolution ───────────────────────────────────────────

struct ResolvedTarget {
    path: PathBuf,
    name: String,
    /// Local variable inside `name`, for `fn.local` targets.
    local: Option<String>,
}

/// Parse `file.rs:name`, `name`, or `file.rs:fn.local` and confirm the
/// named node exists in the arena.
fn resolve_target(arena: &mut TreeArena, target: &str) -> Result<ResolvedTarget, DirectiveError> {
    let (file, rest) = match target.split_once(':') {
        Some((f, r)) => (Some(f), r),
        None => (None, target),
    };
    let (name, local) = match rest.split_once('.') {
        Some((n, l)) => (n.to_string(), Some(l.to_string())),
        None => (rest.to_string(), None),
    };

    let path = match file {
        Some(f) => {
            // Prefer a path already in the arena (the caller may have
            // loaded it under a workspace-absolute key).
            let known = arena.paths().find(|p| p.ends_with(f)).cloned();
            match known {
                Some(p) => p,
                None => {
                    let p = PathBuf::from(f);
                    arena
                        .load(&p)
                        .map_err(|_| DirectiveError::NotFound(target.to_string()))?;
                    p
                }
            }
        }
        None => arena
            .find_declaring(&name)
            .map(|t| t.path.clone())
            .ok_or_else(|| DirectiveError::NotFound(target.to_string()))?,
    };

    let tree = arena
        .get(&path)
        .ok_or_else(|| DirectiveError::NotFound(target.to_string()))?;
    if tree.find_item(&name).is_none() {
        return Err(DirectiveError::NotFound(target.to_string()));
    }

    Ok(ResolvedTarget { path, name, local })
}

// ─── Visitors ────────────────────────────────────────────────────

/// Collects the spans of every identifier equal to `name`.
struct IdentSpans<'a> {
    name: &'a str,
    spans: Vec<Span>,
}

impl<'ast> Visit<'ast> for IdentSpans<'_> {
    fn visit_ident(&mut self, ident: &'ast proc_macro2::Ident) {
        if *ident == self.name {
            self.spans.push(ident.span());
        }
    }
}

/// Collects identifiers bound by patterns (lets, fn args, closures, loops).
#[derive(Default)]
struct BoundIdents {
    names: HashSet<String>,
}

impl<'ast> Visit<'ast> for BoundIdents {
    fn visit_pat_ident(&mut self, pat: &'ast syn::PatIdent) {
        self.names.insert(pat.ident.to_string());
        syn::visit::visit_pat_ident(self, pat);
    }
}

/// Collects single-segment path identifiers used in expression position,
/// in first-use order.
#[derive(Default)]
struct UsedIdents {
    names: Vec<String>,
}

impl<'ast> Visit<'ast> for UsedIdents {
    fn visit_expr_path(&mut self, expr: &'ast syn::ExprPath) {
        if expr.qself.is_none()
            && expr.path.leading_colon.is_none()
            && expr.path.segments.len() == 1
        {
            let name = expr.path.segments[0].ident.to_string();
            if !self.names.contains(&name) {
                self.names.push(name);
            }
        }
        syn::visit::visit_expr_path(self, expr);
    }
}

/// Collects call expressions of a named free function.
struct CallSites<'a> {
    name: &'a str,
    calls: Vec<(Span, Vec<syn::Expr>)>,
}

impl<'ast> Visit<'ast> for CallSites<'_> {
    fn visit_expr_call(&mut self, call: &'ast syn::ExprCall) {
        if let syn::Expr::Path(p) = call.func.as_ref() {
            if p.path.segments.len() == 1 && p.path.segments[0].ident == self.name {
                self.calls
                    .push((call.span(), call.args.iter().cloned().collect()));
            }
        }
        syn::visit::visit_expr_call(self, call);
    }
}

// ─── Rename ──────────────────────────────────────────────────────

/// Replace every occurrence of the target's declared name within its
/// lexical scope. Produces exactly one `Modify` change covering the
/// item-aligned span containing all occurrences, so its before/after
/// texts parse as complete items on their own.
fn apply_rename(
    arena: &mut TreeArena,
    target: &str,
    new_name: &str,
    rationale: Option<&str>,
) -> Result<Vec<Change>, DirectiveError> {
    let resolved = resolve_target(arena, target)?;
    let tree = arena.get(&resolved.path).expect("resolved path in arena");

    // Scope and the name being renamed: the whole file for a top-level
    // item, the declaring function's body for a local.
    let (old_name, spans) = match &resolved.local {
        None => {
            let mut v = IdentSpans {
                name: &resolved.name,
                spans: Vec::new(),
            };
            v.visit_file(&tree.file);
            (resolved.name.clone(), v.spans)
        }
        Some(local) => {
            let f = tree
                .find_fn(&resolved.name)
                .ok_or_else(|| DirectiveError::NotFound(target.to_string()))?;
            let mut bound = BoundIdents::default();
            bound.visit_item_fn(f);
            if !bound.names.contains(local) {
                return Err(DirectiveError::NotFound(target.to_string()));
            }
            let mut v = IdentSpans {
                name: local,
                spans: Vec::new(),
            };
            v.visit_item_fn(f);
            (local.clone(), v.spans)
        }
    };

    if spans.is_empty() {
        return Err(DirectiveError::NotFound(target.to_string()));
    }

    // Covering range over every occurrence, widened to the boundaries
    // of the enclosing top-level items. A narrower span could start or
    // end mid-item and leave the change's fragments brace-unbalanced.
    let mut ranges: Vec<std::ops::Range<usize>> = Vec::new();
    for span in &spans {
        let range = tree
            .span_range(*span)
            .ok_or_else(|| DirectiveError::Rejected("span outside source text".into()))?;
        ranges.push(range);
    }
    let first = ranges.iter().map(|r| r.start).min().unwrap();
    let last = ranges.iter().map(|r| r.end).max().unwrap();
    let first_line = enclosing_item_lines(tree, first)
        .map(|(start, _)| start)
        .unwrap_or_else(|| tree.position_of(first).0);
    let last_line = enclosing_item_lines(tree, last.saturating_sub(1))
        .map(|(_, end)| end)
        .unwrap_or_else(|| tree.position_of(last.saturating_sub(1)).0);
    let scope_range = tree
        .line_range(first_line, last_line)
        .ok_or_else(|| DirectiveError::Rejected("line range out of bounds".into()))?;

    let before = tree.text[scope_range.clone()].to_string();
    let mut after = before.clone();
    ranges.sort_by_key(|r| std::cmp::Reverse(r.start));
    for r in &ranges {
        let rel = (r.start - scope_range.start)..(r.end - scope_range.start);
        after.replace_range(rel, new_name);
    }

    let change = Change {
        id: Uuid::new_v4().to_string(),
        change_type: ChangeType::Modify,
        file_path: resolved.path.to_string_lossy().to_string(),
        line: first_line,
        column: 1,
        enclosing_function: resolved.local.as_ref().map(|_| resolved.name.clone()),
        enclosing_type: None,
        original_code: Some(before),
        new_code: Some(after.clone()),
        description: format!("Rename `{}` to `{}`", old_name, new_name),
        rationale: rationale.unwrap_or("rename directive").to_string(),
        risk: RiskTier::Low,
    };

    arena
        .apply_edits(&resolved.path, vec![(scope_range, after)])
        .map_err(|e| DirectiveError::Rejected(format!("rename result does not parse: {e}")))?;

    Ok(vec![change])
}

/// Line bounds of the top-level item containing `offset`, if any.
fn enclosing_item_lines(tree: &SourceTree, offset: usize) -> Option<(usize, usize)> {
    tree.file.items.iter().find_map(|item| {
        let range = tree.span_range(SourceTree::item_span(item))?;
        if range.start <= offset && offset < range.end {
            let (start, _) = tree.position_of(range.start);
            let (end, _) = tree.position_of(range.end.saturating_sub(1));
            Some((start, end))
        } else {
            None
        }
    })
}

// ─── Extract ─────────────────────────────────────────────────────

/// Lift a line span of the target function into a new top-level function
/// taking the span's free variables as parameters. Conservative: refuses
/// spans containing `return`, spans ending in a tail expression, and free
/// variables whose type cannot be read off a signature or a typed `let`.
fn apply_extract(
    arena: &mut TreeArena,
    target: &str,
    start_line: usize,
    end_line: usize,
    new_name: &str,
    rationale: Option<&str>,
) -> Result<Vec<Change>, DirectiveError> {
    let resolved = resolve_target(arena, target)?;
    let tree = arena.get(&resolved.path).expect("resolved path in arena");
    let f = tree
        .find_fn(&resolved.name)
        .ok_or_else(|| DirectiveError::NotFound(target.to_string()))?;

    let fn_range = tree
        .span_range(f.span())
        .ok_or_else(|| DirectiveError::Rejected("function span unavailable".into()))?;
    let (fn_start_line, _) = tree.position_of(fn_range.start);
    let (fn_end_line, _) = tree.position_of(fn_range.end.saturating_sub(1));
    if start_line <= fn_start_line || end_line >= fn_end_line || start_line > end_line {
        return Err(DirectiveError::Rejected(format!(
            "lines {start_line}..{end_line} are not inside the body of `{}`",
            resolved.name
        )));
    }

    let span_range = tree
        .line_range(start_line, end_line)
        .ok_or_else(|| DirectiveError::Rejected("line range out of bounds".into()))?;
    let span_text = tree.text[span_range.clone()].to_string();

    let block: syn::Block = syn::parse_str(&format!("{{ {} }}", span_text))
        .map_err(|e| DirectiveError::Rejected(format!("span does not parse as statements: {e}")))?;
    if span_text.contains("return") {
        return Err(DirectiveError::Rejected(
            "extracted span contains a return statement".into(),
        ));
    }
    if matches!(block.stmts.last(), Some(syn::Stmt::Expr(_, None))) {
        return Err(DirectiveError::Rejected(
            "extracted span ends in a tail expression".into(),
        ));
    }

    // Free variables: used identifiers minus span-local bindings minus
    // top-level item names.
    let mut used = UsedIdents::default();
    used.visit_block(&block);
    let mut bound = BoundIdents::default();
    bound.visit_block(&block);
    let item_names: HashSet<String> = tree
        .file
        .items
        .iter()
        .filter_map(item_ident)
        .collect();
    let free: Vec<String> = used
        .names
        .into_iter()
        .filter(|n| !bound.names.contains(n) && !item_names.contains(n))
        .collect();

    let mut params = Vec::new();
    for name in &free {
        let ty = param_type(tree, f, name).ok_or_else(|| {
            DirectiveError::Rejected(format!("cannot determine type of free variable `{name}`"))
        })?;
        // Assigned-to free variables become mut parameters.
        let assigned = regex::Regex::new(&format!(
            r"\b{}\s*[+\-*/]?=[^=]",
            regex::escape(name)
        ))
        .map(|re| re.is_match(&span_text))
        .unwrap_or(false);
        let prefix = if assigned { "mut " } else { "" };
        params.push(format!("{prefix}{name}: {ty}"));
    }

    let fn_text = format!(
        "fn {new_name}({params}) {{\n{body}}}\n",
        params = params.join(", "),
        body = span_text
    );
    let parsed: syn::ItemFn = syn::parse_str(&fn_text)
        .map_err(|e| DirectiveError::Rejected(format!("generated function does not parse: {e}")))?;
    let rendered = render_item(syn::Item::Fn(parsed));

    let indent: String = span_text
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .collect();
    let call_text = format!("{indent}{new_name}({});\n", free.join(", "));

    // Insert the new function immediately after the original declaration.
    let insert_at = tree
        .line_range(fn_end_line, fn_end_line)
        .map(|r| r.end)
        .unwrap_or(tree.text.len());
    let (insert_line, _) = tree.position_of(insert_at.min(tree.text.len().saturating_sub(1)));

    let file_path = resolved.path.to_string_lossy().to_string();
    let add = Change {
        id: Uuid::new_v4().to_string(),
        change_type: ChangeType::Add,
        file_path: file_path.clone(),
        line: insert_line + 1,
        column: 1,
        enclosing_function: None,
        enclosing_type: None,
        original_code: None,
        new_code: Some(format!("\n{rendered}")),
        description: format!("Extract lines {start_line}-{end_line} of `{}` into `{new_name}`", resolved.name),
        rationale: rationale.unwrap_or("extract directive").to_string(),
        risk: RiskTier::Medium,
    };
    let replace = Change {
        id: Uuid::new_v4().to_string(),
        change_type: ChangeType::Modify,
        file_path,
        line: start_line,
        column: 1,
        enclosing_function: Some(resolved.name.clone()),
        enclosing_type: None,
        original_code: Some(span_text),
        new_code: Some(call_text.clone()),
        description: format!("Replace extracted span with call to `{new_name}`"),
        rationale: rationale.unwrap_or("extract directive").to_string(),
        risk: RiskTier::Medium,
    };

    arena
        .apply_edits(
            &resolved.path,
            vec![
                (span_range, call_text),
                (insert_at..insert_at, format!("\n{rendered}")),
            ],
        )
        .map_err(|e| DirectiveError::Rejected(format!("extract result does not parse: {e}")))?;

    Ok(vec![add, replace])
}

/// Read the type of `name` from the enclosing signature, a typed `let`,
/// or a literal `let` initializer.
fn param_type(tree: &SourceTree, f: &syn::ItemFn, name: &str) -> Option<String> {
    for input in &f.sig.inputs {
        if let syn::FnArg::Typed(pt) = input {
            if let syn::Pat::Ident(pi) = pt.pat.as_ref() {
                if pi.ident == name {
                    return tree.slice(pt.ty.span()).map(|s| s.to_string());
                }
            }
        }
    }
    for stmt in &f.block.stmts {
        if let syn::Stmt::Local(local) = stmt {
            match &local.pat {
                syn::Pat::Type(pt) => {
                    if let syn::Pat::Ident(pi) = pt.pat.as_ref() {
                        if pi.ident == name {
                            return tree.slice(pt.ty.span()).map(|s| s.to_string());
                        }
                    }
                }
                syn::Pat::Ident(pi) if pi.ident == name => {
                    let init = local.init.as_ref()?;
                    if let syn::Expr::Lit(lit) = init.expr.as_ref() {
                        return literal_type(&lit.lit).map(|s| s.to_string());
                    }
                    return None;
                }
                _ => {}
            }
        }
    }
    None
}

/// Default Rust type of a literal initializer, when one is unambiguous.
fn literal_type(lit: &syn::Lit) -> Option<&'static str> {
    match lit {
        syn::Lit::Int(i) if i.suffix().is_empty() => Some("i32"),
        syn::Lit::Float(f) if f.suffix().is_empty() => Some("f64"),
        syn::Lit::Bool(_) => Some("bool"),
        syn::Lit::Str(_) => Some("&str"),
        syn::Lit::Char(_) => Some("char"),
        syn::Lit::Byte(_) => Some("u8"),
        _ => None,
    }
}

// ─── Inline ──────────────────────────────────────────────────────

/// Replace call-sites of the target function with its body.
///
/// Parameter substitution is textual, so this refuses anything where
/// that is unsound: bodies that are not a single tail expression, and
/// arguments that are not literals or plain paths (they could be
/// side-effecting or end up evaluated more than once).
fn apply_inline(
    arena: &mut TreeArena,
    target: &str,
    rationale: Option<&str>,
) -> Result<Vec<Change>, DirectiveError> {
    let resolved = resolve_target(arena, target)?;
    let tree = arena.get(&resolved.path).expect("resolved path in arena");
    let f = tree
        .find_fn(&resolved.name)
        .ok_or_else(|| DirectiveError::NotFound(target.to_string()))?;

    let body_expr = match (f.block.stmts.len(), f.block.stmts.first()) {
        (1, Some(syn::Stmt::Expr(expr, None))) => expr,
        _ => {
            return Err(DirectiveError::Rejected(
                "inline requires a single-expression body with no early returns".into(),
            ))
        }
    };
    let body_text = tree
        .slice(body_expr.span())
        .ok_or_else(|| DirectiveError::Rejected("body span unavailable".into()))?
        .to_string();

    let mut param_names = Vec::new();
    for input in &f.sig.inputs {
        match input {
            syn::FnArg::Typed(pt) => match pt.pat.as_ref() {
                syn::Pat::Ident(pi) => param_names.push(pi.ident.to_string()),
                _ => {
                    return Err(DirectiveError::Rejected(
                        "inline requires plain identifier parameters".into(),
                    ))
                }
            },
            syn::FnArg::Receiver(_) => {
                return Err(DirectiveError::Rejected(
                    "cannot inline a method with a receiver".into(),
                ))
            }
        }
    }

    let fn_range = tree
        .span_range(f.span())
        .ok_or_else(|| DirectiveError::Rejected("function span unavailable".into()))?;

    let mut sites = CallSites {
        name: &resolved.name,
        calls: Vec::new(),
    };
    sites.visit_file(&tree.file);
    // Drop the recursive call-sites inside the target itself.
    let calls: Vec<_> = sites
        .calls
        .into_iter()
        .filter(|(span, _)| {
            tree.span_range(*span)
                .map(|r| r.start < fn_range.start || r.start >= fn_range.end)
                .unwrap_or(false)
        })
        .collect();
    if calls.is_empty() {
        return Err(DirectiveError::Rejected(format!(
            "no call sites of `{}` to inline",
            resolved.name
        )));
    }

    let mut changes = Vec::new();
    let mut edits = Vec::new();
    for (span, args) in &calls {
        if args.len() != param_names.len() {
            return Err(DirectiveError::Rejected(
                "call-site arity does not match the signature".into(),
            ));
        }
        let mut arg_texts = Vec::new();
        for arg in args {
            match arg {
                syn::Expr::Lit(_) | syn::Expr::Path(_) => {}
                _ => {
                    return Err(DirectiveError::Rejected(
                        "inline refuses non-trivial call arguments".into(),
                    ))
                }
            }
            let text = tree
                .slice(arg.span())
                .ok_or_else(|| DirectiveError::Rejected("argument span unavailable".into()))?;
            arg_texts.push(text.to_string());
        }

        let mut inlined = body_text.clone();
        for (param, arg) in param_names.iter().zip(&arg_texts) {
            let re = regex::Regex::new(&format!(r"\b{}\b", regex::escape(param)))
                .map_err(|e| DirectiveError::Rejected(e.to_string()))?;
            inlined = re.replace_all(&inlined, arg.as_str()).to_string();
        }
        let inlined = format!("({inlined})");

        let range = tree
            .span_range(*span)
            .ok_or_else(|| DirectiveError::Rejected("call span unavailable".into()))?;
        let (line, column) = tree.position_of(range.start);
        changes.push(Change {
            id: Uuid::new_v4().to_string(),
            change_type: ChangeType::Modify,
            file_path: resolved.path.to_string_lossy().to_string(),
            line,
            column,
            enclosing_function: None,
            enclosing_type: None,
            original_code: Some(tree.text[range.clone()].to_string()),
            new_code: Some(inlined.clone()),
            description: format!("Inline call to `{}`", resolved.name),
            rationale: rationale.unwrap_or("inline directive").to_string(),
            risk: RiskTier::Medium,
        });
        edits.push((range, inlined));
    }

    arena
        .apply_edits(&resolved.path, edits)
        .map_err(|e| DirectiveError::Rejected(format!("inline result does not parse: {e}")))?;

    Ok(changes)
}

// ─── Optimize / Refactor ─────────────────────────────────────────

/// Apply catalogue rewrites to the rendered text of the target subtree,
/// then re-parse to confirm the result is still a valid item. The text
/// path is degraded fidelity, so the resulting change is always High risk.
fn apply_rewrites(
    arena: &mut TreeArena,
    target: &str,
    operations: &[crate::types::RewriteOp],
    change_type: ChangeType,
    rationale: Option<&str>,
) -> Result<Vec<Change>, DirectiveError> {
    let resolved = resolve_target(arena, target)?;
    let tree = arena.get(&resolved.path).expect("resolved path in arena");
    let item = tree
        .find_item(&resolved.name)
        .ok_or_else(|| DirectiveError::NotFound(target.to_string()))?;

    let range = tree
        .span_range(SourceTree::item_span(item))
        .ok_or_else(|| DirectiveError::Rejected("item span unavailable".into()))?;
    let before = tree.text[range.clone()].to_string();

    let mut text = before.clone();
    for op in operations {
        text = rewrite::apply_op(op, &text).map_err(DirectiveError::Rejected)?;
    }
    if text == before {
        return Err(DirectiveError::Rejected(
            "no rewrite in the catalogue had an effect".into(),
        ));
    }
    syn::parse_str::<syn::Item>(&text)
        .map_err(|e| DirectiveError::Rejected(format!("rewrite result does not parse: {e}")))?;

    let (line, column) = tree.position_of(range.start);
    let change = Change {
        id: Uuid::new_v4().to_string(),
        change_type,
        file_path: resolved.path.to_string_lossy().to_string(),
        line,
        column,
        enclosing_function: Some(resolved.name.clone()),
        enclosing_type: None,
        original_code: Some(before),
        new_code: Some(text.clone()),
        description: format!(
            "Apply {} rewrite(s) to `{}`",
            operations.len(),
            resolved.name
        ),
        rationale: rationale.unwrap_or("rewrite catalogue").to_string(),
        risk: RiskTier::High,
    };

    arena
        .apply_edits(&resolved.path, vec![(range, text)])
        .map_err(|e| DirectiveError::Rejected(format!("rewrite result does not parse: {e}")))?;

    Ok(vec![change])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RewriteOp;

    const SRC: &str = "fn add_one(x: i32) -> i32 {\n    x + 1\n}\n\nfn caller() -> i32 {\n    let total = add_one(41);\n    total\n}\n";

    fn arena_with(src: &str) -> TreeArena {
        let mut arena = TreeArena::new();
        arena.insert(Path::new("src/a.rs"), src).unwrap();
        arena
    }

    fn rename(target: &str, new_name: &str) -> TransformDirective {
        TransformDirective::Rename {
            target: target.into(),
            new_name: new_name.into(),
            rationale: None,
        }
    }

    #[test]
    fn test_rename_produces_single_modify_change() {
        let mut arena = arena_with(SRC);
        let outcome = transform(&mut arena, &[rename("src/a.rs:add_one", "incr")], false).unwrap();
        assert_eq!(outcome.changes.len(), 1);
        let c = &outcome.changes[0];
        assert_eq!(c.change_type, ChangeType::Modify);
        let after = c.new_code.as_deref().unwrap();
        assert!(!after.contains("add_one"));
        assert_eq!(after.matches("incr").count(), 2);
        // The change spans whole items, so both fragments stand alone.
        syn::parse_file(c.original_code.as_deref().unwrap()).unwrap();
        syn::parse_file(after).unwrap();

        let tree = arena.get(Path::new("src/a.rs")).unwrap();
        assert!(tree.find_fn("incr").is_some());
        assert!(!tree.text.contains("add_one"));
    }

    #[test]
    fn test_rename_local_variable_scoped_to_function() {
        let mut arena = arena_with(SRC);
        let outcome =
            transform(&mut arena, &[rename("src/a.rs:caller.total", "sum")], false).unwrap();
        assert_eq!(outcome.changes.len(), 1);
        let tree = arena.get(Path::new("src/a.rs")).unwrap();
        assert!(tree.text.contains("let sum = add_one(41);"));
        assert!(!tree.text.contains("total"));
    }

    #[test]
    fn test_unknown_target_aborts_batch() {
        let mut arena = arena_with(SRC);
        let directives = vec![rename("src/a.rs:add_one", "incr"), rename("src/a.rs:ghost", "x")];
        // Second directive's miss aborts the call with TargetNotFound.
        let err = transform(&mut arena, &directives, false).unwrap_err();
        assert!(matches!(err, MutationError::TargetNotFound(_)));
        // All-or-nothing: the first directive's edit was rolled back.
        let tree = arena.get(Path::new("src/a.rs")).unwrap();
        assert_eq!(tree.text, SRC);
    }

    #[test]
    fn test_inline_substitutes_literal_arguments() {
        let mut arena = arena_with(SRC);
        let outcome = transform(
            &mut arena,
            &[TransformDirective::Inline {
                target: "src/a.rs:add_one".into(),
                rationale: None,
            }],
            false,
        )
        .unwrap();
        assert_eq!(outcome.changes.len(), 1);
        let tree = arena.get(Path::new("src/a.rs")).unwrap();
        assert!(tree.text.contains("let total = (41 + 1);"));
    }

    #[test]
    fn test_inline_refuses_side_effecting_arguments() {
        let src = "fn double(x: i32) -> i32 {\n    x * 2\n}\n\nfn caller() -> i32 {\n    double(compute())\n}\n\nfn compute() -> i32 {\n    3\n}\n";
        let mut arena = arena_with(src);
        let outcome = transform(
            &mut arena,
            &[TransformDirective::Inline {
                target: "src/a.rs:double".into(),
                rationale: None,
            }],
            false,
        )
        .unwrap();
        assert!(outcome.changes.is_empty());
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.rejected[0].reason.contains("non-trivial"));
    }

    #[test]
    fn test_inline_refuses_multi_statement_body() {
        let src = "fn noisy(x: i32) -> i32 {\n    let y = x + 1;\n    y * 2\n}\n\nfn caller() -> i32 {\n    noisy(1)\n}\n";
        let mut arena = arena_with(src);
        let outcome = transform(
            &mut arena,
            &[TransformDirective::Inline {
                target: "src/a.rs:noisy".into(),
                rationale: None,
            }],
            false,
        )
        .unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.rejected[0].reason.contains("single-expression"));
    }

    #[test]
    fn test_extract_adds_function_and_call_site() {
        let src = "fn work(a: i32, b: i32) -> i32 {\n    let mut acc = 0;\n    acc += a * 2;\n    acc += b * 3;\n    acc\n}\n";
        let mut arena = arena_with(src);
        let outcome = transform(
            &mut arena,
            &[TransformDirective::Extract {
                target: "src/a.rs:work".into(),
                start_line: 3,
                end_line: 4,
                new_name: "accumulate".into(),
                rationale: None,
            }],
            false,
        )
        .unwrap();
        assert_eq!(outcome.changes.len(), 2);
        assert_eq!(outcome.changes[0].change_type, ChangeType::Add);
        assert_eq!(outcome.changes[1].change_type, ChangeType::Modify);

        let tree = arena.get(Path::new("src/a.rs")).unwrap();
        assert!(tree.find_fn("accumulate").is_some());
        assert!(tree.text.contains("accumulate("));
    }

    #[test]
    fn test_extract_refuses_untypeable_free_variable() {
        let src = "fn work() -> i32 {\n    let acc = seed();\n    let x = acc + 1;\n    x\n}\n\nfn seed() -> i32 {\n    1\n}\n";
        let mut arena = arena_with(src);
        let outcome = transform(
            &mut arena,
            &[TransformDirective::Extract {
                target: "src/a.rs:work".into(),
                start_line: 3,
                end_line: 3,
                new_name: "bump".into(),
                rationale: None,
            }],
            false,
        )
        .unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.rejected[0].reason.contains("free variable"));
    }

    #[test]
    fn test_optimize_folds_constants_and_flags_high_risk() {
        let src = "fn answer() -> i32 {\n    2 + 3\n}\n";
        let mut arena = arena_with(src);
        let outcome = transform(
            &mut arena,
            &[TransformDirective::Optimize {
                target: "src/a.rs:answer".into(),
                operations: vec![RewriteOp::ConstantFolding],
                rationale: None,
            }],
            false,
        )
        .unwrap();
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].risk, RiskTier::High);
        let tree = arena.get(Path::new("src/a.rs")).unwrap();
        assert!(tree.text.contains('5'));
        assert!(!tree.text.contains("2 + 3"));
    }

    #[test]
    fn test_rejected_rewrite_does_not_abort_siblings() {
        let src = "fn a() -> i32 {\n    1\n}\n\nfn b() -> i32 {\n    2 + 2\n}\n";
        let mut arena = arena_with(src);
        let directives = vec![
            TransformDirective::Optimize {
                target: "src/a.rs:a".into(),
                operations: vec![RewriteOp::ConstantFolding],
                rationale: None,
            },
            TransformDirective::Optimize {
                target: "src/a.rs:b".into(),
                operations: vec![RewriteOp::ConstantFolding],
                rationale: None,
            },
        ];
        let outcome = transform(&mut arena, &directives, false).unwrap();
        // `a` has nothing to fold and is rejected; `b` still lands.
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.summary.applied, 1);
        assert_eq!(outcome.summary.rejected, 1);
    }

    #[test]
    fn test_fail_fast_aborts_on_rejection() {
        let src = "fn a() -> i32 {\n    1\n}\n";
        let mut arena = arena_with(src);
        let directives = vec![TransformDirective::Optimize {
            target: "src/a.rs:a".into(),
            operations: vec![RewriteOp::ConstantFolding],
            rationale: None,
        }];
        let err = transform(&mut arena, &directives, true).unwrap_err();
        assert!(matches!(err, MutationError::ValidationFailed(_)));
    }

    #[test]
    fn test_later_directive_sees_earlier_result() {
        let src = "fn work(a: i32, b: i32) -> i32 {\n    let mut acc = 0;\n    acc += a * 2;\n    acc += b * 3;\n    acc\n}\n";
        let mut arena = arena_with(src);
        let directives = vec![
            TransformDirective::Extract {
                target: "src/a.rs:work".into(),
                start_line: 3,
                end_line: 4,
                new_name: "accumulate".into(),
                rationale: None,
            },
            // Targets the function the previous directive introduced.
            rename("src/a.rs:accumulate", "fold_terms"),
        ];
        let outcome = transform(&mut arena, &directives, false).unwrap();
        assert_eq!(outcome.changes.len(), 3);
        let tree = arena.get(Path::new("src/a.rs")).unwrap();
        assert!(tree.find_fn("fold_terms").is_some());
        assert!(!tree.text.contains("accumulate"));
    }
}
