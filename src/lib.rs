//! Metamorph -- Runtime Self-Modification Engine
//!
//! Validates, snapshots, applies, tests, and verifies batches of
//! location-addressed source edits, rolling back on any failure after
//! files were touched. A syntax-tree transformer turns high-level
//! directives (rename, extract, inline, optimize, refactor) into
//! change batches.

pub mod types;
pub mod error;
pub mod config;
pub mod state;
pub mod tree;
pub mod codegen;
pub mod validate;
pub mod backup;
pub mod engine;
pub mod reload;
