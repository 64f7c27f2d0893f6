//! Change Application
//!
//! Turns a validated change-list into file writes. The batch is
//! replayed in submission order against in-memory working copies, each
//! change re-confirmed against the text state left by the changes
//! before it, so a later change may address text an earlier one
//! introduced. No file is written until the whole batch resolves; a
//! mismatch therefore fails the batch before any mutation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::error::MutationError;
use crate::types::{Change, ChangeType};

/// Maximum diff string length stored on the modification record.
pub const MAX_DIFF_SIZE: usize = 10_000;

/// How far (in lines) a change's recorded location may drift from the
/// matched occurrence before the match is rejected.
const LINE_SEARCH_WINDOW: usize = 5;

/// Outcome of a successful batch apply.
#[derive(Debug)]
pub struct ApplyResult {
    /// Truncated unified-style diff across all touched files.
    pub diff: String,
    pub touched_files: Vec<PathBuf>,
}

struct ResolvedEdit {
    start: usize,
    end: usize,
    replacement: String,
}

/// Apply every change in the batch, all-or-nothing.
///
/// Returns [`MutationError::OriginalTextMismatch`] (wrapped) when any
/// change's expected before-text is not found near its recorded line; in
/// that case nothing has been written.
pub fn apply_changes(workspace: &Path, changes: &[Change]) -> Result<ApplyResult> {
    // Phase 1: replay the batch against in-memory working copies. Each
    // change resolves against the text state left by the changes before
    // it, so chained batches (a change addressing text introduced by an
    // earlier sibling) resolve the same way they were computed.
    let mut originals: BTreeMap<PathBuf, String> = BTreeMap::new();
    let mut working: BTreeMap<PathBuf, String> = BTreeMap::new();
    let mut order: Vec<PathBuf> = Vec::new();

    for change in changes {
        let path = resolve(workspace, &change.file_path);
        if !working.contains_key(&path) {
            let text = if path.exists() {
                fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?
            } else {
                String::new()
            };
            originals.insert(path.clone(), text.clone());
            working.insert(path.clone(), text);
            order.push(path.clone());
        }
        let text = working
            .get_mut(&path)
            .ok_or_else(|| anyhow::anyhow!("missing working copy for {}", path.display()))?;
        let edit = resolve_change(text, change)?;
        text.replace_range(edit.start..edit.end, &edit.replacement);
    }

    // Phase 2: nothing touched disk yet; write the final texts.
    let mut diff = String::new();
    let mut touched_files = Vec::new();
    for path in order {
        let old = originals.remove(&path).unwrap_or_default();
        let new = match working.remove(&path) {
            Some(text) => text,
            None => continue,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &new)
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!("wrote {} ({} bytes)", path.display(), new.len());

        diff.push_str(&format!("--- {}\n", path.display()));
        diff.push_str(&generate_simple_diff(&old, &new));
        touched_files.push(path);
    }

    Ok(ApplyResult {
        diff: truncate_diff(diff),
        touched_files,
    })
}

/// Resolve one change to a byte-range edit against `text`.
fn resolve_change(text: &str, change: &Change) -> Result<ResolvedEdit> {
    match &change.original_code {
        Some(original) => {
            let start = locate(text, original, change.line).ok_or_else(|| {
                anyhow::Error::new(MutationError::OriginalTextMismatch {
                    file: change.file_path.clone(),
                    line: change.line,
                })
            })?;
            Ok(ResolvedEdit {
                start,
                end: start + original.len(),
                replacement: change.new_code.clone().unwrap_or_default(),
            })
        }
        None => {
            // Pure insertion at the start of the recorded line, or at the
            // end of the file when the line is past it.
            if change.change_type == ChangeType::Delete {
                bail!(
                    "{} line {}: delete change without original text",
                    change.file_path,
                    change.line
                );
            }
            let mut new_code = change.new_code.clone().unwrap_or_default();
            if !new_code.ends_with('\n') {
                new_code.push('\n');
            }
            let offset = line_start_offset(text, change.line).unwrap_or(text.len());
            Ok(ResolvedEdit {
                start: offset,
                end: offset,
                replacement: new_code,
            })
        }
    }
}

/// Find the occurrence of `needle` whose line is nearest `line`, within
/// the search window. Returns its byte offset.
fn locate(text: &str, needle: &str, line: usize) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let mut best: Option<(usize, usize)> = None;
    for (offset, _) in text.match_indices(needle) {
        let occurrence_line = line_of_offset(text, offset);
        let distance = occurrence_line.abs_diff(line);
        if distance <= LINE_SEARCH_WINDOW
            && best.map(|(_, d)| distance < d).unwrap_or(true)
        {
            best = Some((offset, distance));
        }
    }
    best.map(|(offset, _)| offset)
}

/// Confirm every change's after-text now sits near its recorded line
/// and, for replacements, that the before-text is gone from that
/// neighbourhood. Run after apply, before the whole-project compile
/// check.
pub fn verify_applied(workspace: &Path, changes: &[Change]) -> Result<()> {
    for change in changes {
        let path = resolve(workspace, &change.file_path);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        if let Some(new_code) = &change.new_code {
            // A sibling later in the batch may have rewritten this
            // change's after-text (a chained batch renaming a function
            // an earlier change introduced). Such text is checked
            // through the sibling's own after-text instead.
            let superseded = changes.iter().any(|c| {
                !std::ptr::eq(c, change)
                    && c.original_code
                        .as_deref()
                        .map(|o| o.contains(new_code.as_str()))
                        .unwrap_or(false)
            });
            if !superseded && locate(&text, new_code, change.line).is_none() {
                return Err(anyhow::Error::new(MutationError::VerificationFailure(
                    format!(
                        "{} near line {}: applied text not found",
                        change.file_path, change.line
                    ),
                )));
            }
        }
        if let Some(original) = &change.original_code {
            // The before-text may legitimately survive: an after-text
            // containing it (`x` rewritten to `x + 1`) or a sibling
            // change that moved it (extract lifts the span into a new
            // function). Only a true removal can be checked for absence.
            let subsumed = changes.iter().any(|c| {
                c.new_code
                    .as_deref()
                    .map(|n| n.contains(original.as_str()))
                    .unwrap_or(false)
            });
            if !subsumed && locate(&text, original, change.line).is_some() {
                return Err(anyhow::Error::new(MutationError::VerificationFailure(
                    format!(
                        "{} near line {}: replaced text still present",
                        change.file_path, change.line
                    ),
                )));
            }
        }
    }
    Ok(())
}

fn resolve(workspace: &Path, file_path: &str) -> PathBuf {
    let p = Path::new(file_path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workspace.join(p)
    }
}

/// 1-based line containing byte `offset`.
fn line_of_offset(text: &str, offset: usize) -> usize {
    text[..offset].bytes().filter(|&b| b == b'\n').count() + 1
}

/// Byte offset of the start of 1-based `line`, or `None` past EOF.
fn line_start_offset(text: &str, line: usize) -> Option<usize> {
    if line <= 1 {
        return Some(0);
    }
    let mut current = 1;
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            current += 1;
            if current == line {
                return Some(i + 1);
            }
        }
    }
    None
}

fn truncate_diff(diff: String) -> String {
    if diff.len() > MAX_DIFF_SIZE {
        let mut end = MAX_DIFF_SIZE;
        while !diff.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...[truncated]", &diff[..end])
    } else {
        diff
    }
}

/// Produce a simple line-by-line unified-style diff between `old` and `new`.
pub fn generate_simple_diff(old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut diff = String::new();
    let max = old_lines.len().max(new_lines.len());

    for i in 0..max {
        let old_line = old_lines.get(i).copied();
        let new_line = new_lines.get(i).copied();

        match (old_line, new_line) {
            (Some(o), Some(n)) if o != n => {
                diff.push_str(&format!("-{o}\n"));
                diff.push_str(&format!("+{n}\n"));
            }
            (Some(o), None) => {
                diff.push_str(&format!("-{o}\n"));
            }
            (None, Some(n)) => {
                diff.push_str(&format!("+{n}\n"));
            }
            _ => {}
        }
    }

    if diff.is_empty() {
        "(no changes)\n".to_string()
    } else {
        diff
    }
}
