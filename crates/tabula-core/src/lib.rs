//! Core engine for the Tabula collaborative spreadsheet server.
//!
//! This crate is deliberately free of I/O and async machinery. It provides:
//! - [`DependencyGraph`]: the cell reference graph with on-line cycle detection
//! - [`formula`]: scanning formula text for the cells it references
//!
//! Formula *evaluation* is out of scope; the server stores formula text and
//! tracks references, nothing more.

pub mod formula;
pub mod graph;

pub use formula::{is_formula, normalize_name, referenced_cells};
pub use graph::DependencyGraph;
