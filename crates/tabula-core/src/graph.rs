//! Cell dependency graph with on-line cycle detection.
//!
//! The graph stores ordered pairs `(s, t)` meaning *`s` depends on `t`*.
//! Two inverse adjacency maps are maintained so both directions can be
//! queried in O(log n): `dependents(s)` is the set of cells `s` references,
//! `dependees(s)` is the set of cells that reference `s`.
//!
//! There is no error type here. The only way an operation can fail is by
//! introducing a cycle, and that is reported as a `bool`; a failed operation
//! leaves the graph exactly as it found it.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashSet;

/// Directed graph of cell-to-cell references.
///
/// Empty adjacency rows are pruned eagerly, so `has_dependents(s)` is
/// equivalent to `s` having a row in the map at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// `dependents[s]` = cells that `s` points to (the cells `s` references).
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// `dependees[t]` = cells that point to `t` (the cells referencing `t`).
    dependees: BTreeMap<String, BTreeSet<String>>,
    /// Number of ordered pairs in the graph.
    count: usize,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of ordered pairs in the graph.
    pub fn size(&self) -> usize {
        self.count
    }

    /// Whether `dependents(s)` is non-empty.
    pub fn has_dependents(&self, s: &str) -> bool {
        self.dependents.contains_key(s)
    }

    /// Whether `dependees(s)` is non-empty.
    pub fn has_dependees(&self, s: &str) -> bool {
        self.dependees.contains_key(s)
    }

    /// The cells that `s` references. Empty for unknown nodes.
    pub fn get_dependents(&self, s: &str) -> BTreeSet<String> {
        self.dependents.get(s).cloned().unwrap_or_default()
    }

    /// The cells that reference `s`. Empty for unknown nodes.
    pub fn get_dependees(&self, s: &str) -> BTreeSet<String> {
        self.dependees.get(s).cloned().unwrap_or_default()
    }

    /// Add the ordered pair `(s, t)`, a no-op if it already exists.
    ///
    /// Returns `false` and rolls the insertion back if `s` would end up
    /// participating in a cycle.
    pub fn add(&mut self, s: &str, t: &str) -> bool {
        let inserted = self
            .dependents
            .entry(s.to_owned())
            .or_default()
            .insert(t.to_owned());
        self.dependees
            .entry(t.to_owned())
            .or_default()
            .insert(s.to_owned());
        if inserted {
            self.count += 1;
        }

        if self.in_cycle(s) {
            self.remove(s, t);
            return false;
        }
        true
    }

    /// Remove the ordered pair `(s, t)`, if it exists.
    pub fn remove(&mut self, s: &str, t: &str) {
        let mut removed = false;
        if let Some(row) = self.dependents.get_mut(s) {
            removed = row.remove(t);
            if row.is_empty() {
                self.dependents.remove(s);
            }
        }
        if let Some(row) = self.dependees.get_mut(t) {
            removed &= row.remove(s);
            if row.is_empty() {
                self.dependees.remove(t);
            }
        }
        if removed {
            self.count -= 1;
        }
    }

    /// Atomically set `{t : (s,t) ∈ E}` to `new_dependents`.
    ///
    /// On a cycle the graph is restored to its pre-call state and `false`
    /// is returned.
    pub fn replace_dependents(&mut self, s: &str, new_dependents: &BTreeSet<String>) -> bool {
        let previous = self.get_dependents(s);
        for t in &previous {
            self.remove(s, t);
        }

        let mut added: Vec<&String> = Vec::new();
        for t in new_dependents {
            if self.add(s, t) {
                added.push(t);
                continue;
            }
            // Cycle: undo the partial replacement and restore the old edges.
            for a in added {
                self.remove(s, a);
            }
            for t in &previous {
                self.add(s, t);
            }
            return false;
        }
        true
    }

    /// Atomically set `{r : (r,s) ∈ E}` to `new_dependees`.
    ///
    /// On a cycle the graph is restored to its pre-call state and `false`
    /// is returned.
    pub fn replace_dependees(&mut self, s: &str, new_dependees: &BTreeSet<String>) -> bool {
        let previous = self.get_dependees(s);
        for r in &previous {
            self.remove(r, s);
        }

        let mut added: Vec<&String> = Vec::new();
        for t in new_dependees {
            if self.add(t, s) {
                added.push(t);
                continue;
            }
            // Cycle: undo the partial replacement and restore the old edges.
            for a in added {
                self.remove(a, s);
            }
            for r in &previous {
                self.add(r, s);
            }
            return false;
        }
        true
    }

    /// Whether `start` participates in a cycle, by depth-first walk along
    /// `dependents` edges. The visited set lives for a single check only.
    fn in_cycle(&self, start: &str) -> bool {
        let mut visited = FxHashSet::default();
        self.visit(start, start, &mut visited)
    }

    fn visit<'g>(&'g self, start: &str, name: &'g str, visited: &mut FxHashSet<&'g str>) -> bool {
        visited.insert(name);

        let Some(next) = self.dependents.get(name) else {
            return false;
        };
        for t in next {
            if t == start {
                return true;
            }
            if !visited.contains(t.as_str()) && self.visit(start, t, visited) {
                return true;
            }
        }
        false
    }
}
