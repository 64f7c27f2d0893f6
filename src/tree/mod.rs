//! Syntax Tree Module
//!
//! Parsing, span-addressed slicing, and the transformation engine that
//! turns directives into structured change-lists.

pub mod rewrite;
pub mod store;
pub mod transform;

pub use store::{SourceTree, TreeArena};
pub use transform::{transform, RejectedDirective, TransformOutcome, TransformSummary};
