//! Scanning formula text for cell references.
//!
//! A cell's contents is a formula iff its first character is `=`. The server
//! never evaluates formulas; it only extracts the set of cells a formula
//! references so the dependency graph can be kept current.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// A cell reference is a maximal run of letters followed by a maximal run of
/// digits, e.g. `A1` or `ab12`.
static CELL_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new("[A-Za-z]+[0-9]+").unwrap());

/// Whether `contents` is a formula.
pub fn is_formula(contents: &str) -> bool {
    contents.starts_with('=')
}

/// Canonical form of a cell name: letters upper-cased.
///
/// Cell names are case-insensitive everywhere in the protocol; normalizing at
/// the boundary means the cell map, the graph, and broadcasts all agree.
pub fn normalize_name(name: &str) -> String {
    name.to_ascii_uppercase()
}

/// The set of cells referenced by `contents`.
///
/// Non-formula contents reference nothing. References are normalized with
/// [`normalize_name`].
pub fn referenced_cells(contents: &str) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    if is_formula(contents) {
        for m in CELL_REF.find_iter(&contents[1..]) {
            refs.insert(normalize_name(m.as_str()));
        }
    }
    refs
}
