//! One open spreadsheet document and its attached clients.
//!
//! A session owns the cell map, the dependency graph, the undo history, and
//! the set of client handles viewing the document. Edits are committed under
//! the cells lock and fanned out to every attached client in commit order;
//! the disk write happens after the lock is released, so persistence never
//! blocks other editors.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind};
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tabula_core::{DependencyGraph, normalize_name, referenced_cells};

use crate::protocol;
use crate::storage::Storage;
use crate::transport::{ClientHandle, ConnectionId};

/// Cell contents, reference graph, and edit history. Everything in here is
/// guarded by the session's cells lock and mutated together.
#[derive(Debug, Default)]
struct Cells {
    /// Only non-absent cells appear; absent means empty contents.
    map: BTreeMap<String, String>,
    graph: DependencyGraph,
    /// LIFO stack of `(cell name, previous contents)` pairs.
    history: Vec<(String, String)>,
}

impl Cells {
    /// Update one cell and its dependency edges. Returns `false` and leaves
    /// everything unchanged when the new contents would create a circular
    /// dependency. Does not touch the history.
    fn update(&mut self, name: &str, contents: &str) -> bool {
        let refs = referenced_cells(contents);
        if !self.graph.replace_dependees(name, &refs) {
            return false;
        }
        if contents.is_empty() {
            self.map.remove(name);
        } else {
            self.map.insert(name.to_owned(), contents.to_owned());
        }
        true
    }
}

/// The in-memory state of one open document plus its attached clients.
///
/// Lock order is cells before clients wherever both are needed; neither
/// lock is ever held across disk or network I/O (broadcast enqueue is
/// non-blocking).
pub struct Session {
    name: String,
    storage: Storage,
    cells: Mutex<Cells>,
    clients: Mutex<FxHashMap<ConnectionId, ClientHandle>>,
}

impl Session {
    /// Create a session for the named document. Does not touch the disk;
    /// call [`Session::load`] before attaching clients.
    pub fn new(name: impl Into<String>, storage: Storage) -> Self {
        Self {
            name: name.into(),
            storage,
            cells: Mutex::new(Cells::default()),
            clients: Mutex::new(FxHashMap::default()),
        }
    }

    /// The document name; also the filename under `spreadsheets/`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Load the document from disk, creating an empty file when absent.
    ///
    /// Idempotent: a session that already has cells or history keeps them.
    /// Returns `true` when the in-memory state is consistent and the
    /// document file exists.
    pub fn load(&self) -> bool {
        let mut cells = self.cells.lock().unwrap();
        if !cells.history.is_empty() || !cells.map.is_empty() {
            return true;
        }

        if let Err(e) = self.storage.ensure_sheets_dir() {
            tracing::warn!(error = %e, "could not create the spreadsheets directory");
            return false;
        }

        let path = self.storage.sheet_path(&self.name);
        match File::open(&path) {
            Ok(file) => {
                for line in BufReader::new(file).lines().map_while(Result::ok) {
                    if line.is_empty() {
                        continue;
                    }
                    let (raw_name, contents) = protocol::split_first_space(&line);
                    let name = normalize_name(raw_name);
                    if !cells.update(&name, contents) {
                        tracing::warn!(
                            sheet = %self.name,
                            cell = %name,
                            "skipping circular cell while loading"
                        );
                    }
                }
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => match File::create(&path) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(sheet = %self.name, error = %e, "could not create spreadsheet file");
                    false
                }
            },
            Err(e) => {
                tracing::warn!(sheet = %self.name, error = %e, "could not open spreadsheet file");
                false
            }
        }
    }

    /// Write the document to disk as `name contents` lines, overwriting.
    ///
    /// Best-effort: a failure is logged and in-memory state stays
    /// authoritative. The snapshot is taken under the cells lock but the
    /// write happens after release, so a save may observe a later commit
    /// than the one that triggered it; each successful edit is followed by
    /// exactly one save attempt, and saves are idempotent.
    pub fn save(&self) -> bool {
        let snapshot = {
            let cells = self.cells.lock().unwrap();
            let mut out = String::new();
            for (name, contents) in &cells.map {
                out.push_str(name);
                out.push(' ');
                out.push_str(contents);
                out.push('\n');
            }
            out
        };

        if self.storage.ensure_sheets_dir().is_err() {
            return false;
        }
        match fs::write(self.storage.sheet_path(&self.name), snapshot) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(sheet = %self.name, error = %e, "failed to save spreadsheet");
                false
            }
        }
    }

    /// Attach a client and send it the full document: `connected <N>`
    /// followed by one `cell` line per entry.
    ///
    /// Returns `false` when the client is already attached. The burst is
    /// atomic with respect to concurrent edits, so it matches the
    /// advertised count exactly and no broadcast is lost or duplicated.
    pub fn add_client(&self, client: ClientHandle) -> bool {
        let cells = self.cells.lock().unwrap();
        let mut clients = self.clients.lock().unwrap();
        if clients.contains_key(&client.id()) {
            return false;
        }

        client.send(&protocol::connected(cells.map.len()));
        for (name, contents) in &cells.map {
            client.send(&protocol::cell(name, contents));
        }

        clients.insert(client.id(), client);
        true
    }

    /// Detach a client; returns whether it was attached.
    pub fn remove_client(&self, id: ConnectionId) -> bool {
        self.clients.lock().unwrap().remove(&id).is_some()
    }

    /// Number of currently attached clients.
    pub fn user_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Apply one edit: update the graph and the cell map, push the previous
    /// contents onto the history, and broadcast the new contents to every
    /// attached client in commit order. Saves after the commit.
    ///
    /// Returns `false` (and changes nothing) when the edit would create a
    /// circular dependency; nothing is broadcast in that case.
    pub fn edit_cell(&self, name: &str, contents: &str) -> bool {
        let name = normalize_name(name);
        {
            let mut cells = self.cells.lock().unwrap();
            let old = cells.map.get(&name).cloned().unwrap_or_default();
            if !cells.update(&name, contents) {
                return false;
            }
            cells.history.push((name.clone(), old));
            self.broadcast(&protocol::cell(&name, contents));
        }
        self.save();
        true
    }

    /// Reverse the most recent edit and broadcast the restored contents.
    ///
    /// The reversal is itself an edit: the pre-undo contents are pushed onto
    /// the history, so undoing twice restores the value the first undo
    /// replaced. Returns `false`, changing nothing, when there is nothing to
    /// undo or the recorded contents can no longer be applied.
    pub fn undo(&self) -> bool {
        {
            let mut cells = self.cells.lock().unwrap();
            let Some((name, previous)) = cells.history.pop() else {
                return false;
            };
            let current = cells.map.get(&name).cloned().unwrap_or_default();
            // Every entry this session records reverts the sheet to the
            // committed state that preceded the last mutation, and committed
            // states are acyclic, so this cannot fail for a history the
            // session built itself. Refuse anything else rather than
            // broadcasting contents the map does not hold.
            if !cells.update(&name, &previous) {
                tracing::warn!(sheet = %self.name, cell = %name, "undo would reintroduce a circular reference");
                cells.history.push((name, previous));
                return false;
            }
            cells.history.push((name.clone(), current));
            self.broadcast(&protocol::cell(&name, &previous));
        }
        self.save();
        true
    }

    /// Send one line to every attached client. A send to a client whose
    /// transport has closed is dropped silently; there is no retry.
    fn broadcast(&self, line: &str) {
        let clients = self.clients.lock().unwrap();
        for client in clients.values() {
            client.send(line);
        }
    }
}
