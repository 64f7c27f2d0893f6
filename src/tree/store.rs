//! Syntax Tree Store
//!
//! Parses source text into `syn` trees and maps tree nodes back to
//! byte/line positions in the ORIGINAL text, so that before-texts sliced
//! from a tree stay byte-exact with what is on disk. Rendering of
//! synthesized items goes through prettyplease.

use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use proc_macro2::LineColumn;
use syn::spanned::Spanned;

/// One parsed source file plus the offset tables needed to address
/// spans inside its original text.
pub struct SourceTree {
    pub path: PathBuf,
    pub text: String,
    pub file: syn::File,
    /// Byte offset of each line start, 0-based line index.
    line_offsets: Vec<usize>,
}

impl SourceTree {
    pub fn parse(path: PathBuf, text: String) -> Result<Self> {
        let file = syn::parse_file(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let line_offsets = compute_line_offsets(&text);
        Ok(Self {
            path,
            text,
            file,
            line_offsets,
        })
    }

    /// Byte offset of a proc-macro2 line/column position. Lines are
    /// 1-based, columns are 0-based character counts within the line.
    pub fn offset_of(&self, lc: LineColumn) -> Option<usize> {
        let line_start = *self.line_offsets.get(lc.line.checked_sub(1)?)?;
        let line_end = self
            .line_offsets
            .get(lc.line)
            .copied()
            .unwrap_or(self.text.len());
        let line = &self.text[line_start..line_end];

        let mut chars = 0usize;
        for (byte_idx, _) in line.char_indices() {
            if chars == lc.column {
                return Some(line_start + byte_idx);
            }
            chars += 1;
        }
        if chars == lc.column {
            return Some(line_end);
        }
        None
    }

    /// Byte range covered by a span, in the original text.
    pub fn span_range(&self, span: proc_macro2::Span) -> Option<Range<usize>> {
        let start = self.offset_of(span.start())?;
        let end = self.offset_of(span.end())?;
        (start <= end).then_some(start..end)
    }

    /// Slice of the original text covered by a span.
    pub fn slice(&self, span: proc_macro2::Span) -> Option<&str> {
        self.span_range(span).map(|r| &self.text[r])
    }

    /// Byte range of an inclusive 1-based line span, covering full lines
    /// (including the trailing newline of `end_line` when present).
    pub fn line_range(&self, start_line: usize, end_line: usize) -> Option<Range<usize>> {
        let start = *self.line_offsets.get(start_line.checked_sub(1)?)?;
        let end = self
            .line_offsets
            .get(end_line)
            .copied()
            .unwrap_or(self.text.len());
        (start <= end).then_some(start..end)
    }

    /// 1-based (line, column) of a byte offset.
    pub fn position_of(&self, offset: usize) -> (usize, usize) {
        let line_idx = match self.line_offsets.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let col = self.text[self.line_offsets[line_idx]..offset].chars().count();
        (line_idx + 1, col + 1)
    }

    pub fn line_count(&self) -> usize {
        self.line_offsets.len()
    }

    // ─── Node lookup ─────────────────────────────────────────────

    /// Find a top-level item by its declared identifier.
    pub fn find_item(&self, name: &str) -> Option<&syn::Item> {
        self.file.items.iter().find(|item| {
            item_ident(item).map(|id| id == name).unwrap_or(false)
        })
    }

    pub fn find_fn(&self, name: &str) -> Option<&syn::ItemFn> {
        self.file.items.iter().find_map(|item| match item {
            syn::Item::Fn(f) if f.sig.ident == name => Some(f),
            _ => None,
        })
    }

    /// Span of an item, joined over all its tokens.
    pub fn item_span(item: &syn::Item) -> proc_macro2::Span {
        item.span()
    }
}

/// Declared identifier of a top-level item, when it has one.
pub fn item_ident(item: &syn::Item) -> Option<String> {
    match item {
        syn::Item::Fn(f) => Some(f.sig.ident.to_string()),
        syn::Item::Struct(s) => Some(s.ident.to_string()),
        syn::Item::Enum(e) => Some(e.ident.to_string()),
        syn::Item::Const(c) => Some(c.ident.to_string()),
        syn::Item::Static(s) => Some(s.ident.to_string()),
        syn::Item::Trait(t) => Some(t.ident.to_string()),
        syn::Item::Type(t) => Some(t.ident.to_string()),
        syn::Item::Mod(m) => Some(m.ident.to_string()),
        _ => None,
    }
}

/// Render a synthesized item through prettyplease.
pub fn render_item(item: syn::Item) -> String {
    let file = syn::File {
        shebang: None,
        attrs: Vec::new(),
        items: vec![item],
    };
    prettyplease::unparse(&file)
}

fn compute_line_offsets(text: &str) -> Vec<usize> {
    let mut offsets = vec![0];
    for (i, ch) in text.char_indices() {
        if ch == '\n' {
            offsets.push(i + 1);
        }
    }
    offsets
}

// ─── Arena ──────────────────────────────────────────────────────

/// Per-modification arena of parsed source files, keyed by path.
///
/// Owned by one mutation pipeline; its lifetime is scoped to a single
/// modification so stale trees never leak across modifications.
#[derive(Default)]
pub struct TreeArena {
    trees: HashMap<PathBuf, SourceTree>,
}

impl TreeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a file from disk into the arena, parsing it. Re-loading an
    /// already-present path is a no-op.
    pub fn load(&mut self, path: &Path) -> Result<&SourceTree> {
        if !self.trees.contains_key(path) {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let tree = SourceTree::parse(path.to_path_buf(), text)?;
            self.trees.insert(path.to_path_buf(), tree);
        }
        Ok(&self.trees[path])
    }

    /// Insert source text directly (virtual file, used heavily in tests).
    pub fn insert(&mut self, path: &Path, text: &str) -> Result<()> {
        let tree = SourceTree::parse(path.to_path_buf(), text.to_string())?;
        self.trees.insert(path.to_path_buf(), tree);
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<&SourceTree> {
        self.trees.get(path)
    }

    pub fn remove(&mut self, path: &Path) {
        self.trees.remove(path);
    }

    /// Current text of every file in the arena, for snapshot/restore.
    pub fn texts(&self) -> HashMap<PathBuf, String> {
        self.trees
            .iter()
            .map(|(p, t)| (p.clone(), t.text.clone()))
            .collect()
    }

    /// Restore the arena to a previously captured snapshot, dropping any
    /// file loaded since.
    pub fn restore(&mut self, snapshot: HashMap<PathBuf, String>) -> Result<()> {
        let current: Vec<PathBuf> = self.trees.keys().cloned().collect();
        for path in current {
            if !snapshot.contains_key(&path) {
                self.trees.remove(&path);
            }
        }
        for (path, text) in snapshot {
            let tree = SourceTree::parse(path.clone(), text)?;
            self.trees.insert(path, tree);
        }
        Ok(())
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.trees.keys()
    }

    /// Splice `replacement` over `range` in the file's text and re-parse.
    /// The edit is rejected (arena unchanged) if the result no longer
    /// parses.
    pub fn apply_edit(&mut self, path: &Path, range: Range<usize>, replacement: &str) -> Result<()> {
        let tree = self
            .trees
            .get(path)
            .with_context(|| format!("file not in arena: {}", path.display()))?;

        let mut new_text = String::with_capacity(tree.text.len() + replacement.len());
        new_text.push_str(&tree.text[..range.start]);
        new_text.push_str(replacement);
        new_text.push_str(&tree.text[range.end..]);

        let new_tree = SourceTree::parse(path.to_path_buf(), new_text)?;
        self.trees.insert(path.to_path_buf(), new_tree);
        Ok(())
    }

    /// Apply several non-overlapping edits to one file atomically: all
    /// splices land in a single new text which is re-parsed once, so a
    /// failed re-parse leaves the arena untouched.
    pub fn apply_edits(
        &mut self,
        path: &Path,
        mut edits: Vec<(Range<usize>, String)>,
    ) -> Result<()> {
        let tree = self
            .trees
            .get(path)
            .with_context(|| format!("file not in arena: {}", path.display()))?;

        edits.sort_by_key(|(r, _)| r.start);
        let mut new_text = String::with_capacity(tree.text.len());
        let mut cursor = 0usize;
        for (range, replacement) in &edits {
            anyhow::ensure!(range.start >= cursor, "overlapping edits");
            new_text.push_str(&tree.text[cursor..range.start]);
            new_text.push_str(replacement);
            cursor = range.end;
        }
        new_text.push_str(&tree.text[cursor..]);

        let new_tree = SourceTree::parse(path.to_path_buf(), new_text)?;
        self.trees.insert(path.to_path_buf(), new_tree);
        Ok(())
    }

    /// Find the single tree declaring `name`, for unqualified targets.
    /// Returns `None` when no tree (or more than one) declares it.
    pub fn find_declaring(&self, name: &str) -> Option<&SourceTree> {
        let mut found = None;
        for tree in self.trees.values() {
            if tree.find_item(name).is_some() {
                if found.is_some() {
                    return None;
                }
                found = Some(tree);
            }
        }
        found
    }
}
