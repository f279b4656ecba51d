//! On-disk state: spreadsheet files and the username registry.
//!
//! Everything lives under one root directory: `spreadsheets/<name>` text
//! files (one per document, `name contents` lines) and a `users` file with
//! one username per line. There is no header, no escaping, and no schema
//! versioning; in-memory state is authoritative for the process lifetime and
//! disk writes are best-effort.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Directory holding one file per spreadsheet document.
pub const SPREADSHEETS_DIR: &str = "spreadsheets";

/// File holding the registered usernames, one per line.
pub const USERS_FILE: &str = "users";

/// Always-recognized administrative username. Never written to the users
/// file by injection; present in memory on every load.
pub const ADMIN_USERNAME: &str = "sysadmin";

/// Paths and file formats for everything the server persists.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The `spreadsheets/` directory, created on demand with user-rwx
    /// permissions.
    pub fn ensure_sheets_dir(&self) -> std::io::Result<PathBuf> {
        let dir = self.root.join(SPREADSHEETS_DIR);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(dir)
    }

    /// Path of one document file; the filename equals the document name.
    pub fn sheet_path(&self, name: &str) -> PathBuf {
        self.root.join(SPREADSHEETS_DIR).join(name)
    }

    fn users_path(&self) -> PathBuf {
        self.root.join(USERS_FILE)
    }

    /// Load the username registry.
    ///
    /// [`ADMIN_USERNAME`] is present whether or not the file exists or lists
    /// it. Blank lines are skipped; the loop terminates only on EOF, so no
    /// line is read twice.
    pub fn load_users(&self) -> BTreeSet<String> {
        let mut users = BTreeSet::new();
        users.insert(ADMIN_USERNAME.to_owned());
        if let Ok(file) = File::open(self.users_path()) {
            for line in BufReader::new(file).lines().map_while(Result::ok) {
                if !line.is_empty() {
                    users.insert(line);
                }
            }
        }
        users
    }

    /// Append one newly registered username to the users file, creating the
    /// file when missing.
    pub fn append_user(&self, username: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.users_path())?;
        writeln!(file, "{username}")
    }

    /// Rewrite the users file from the full registry.
    pub fn save_users(&self, users: &BTreeSet<String>) -> std::io::Result<()> {
        let mut out = String::new();
        for user in users {
            out.push_str(user);
            out.push('\n');
        }
        fs::write(self.users_path(), out)
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_users_injects_sysadmin() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());

        let users = storage.load_users();
        assert!(users.contains(ADMIN_USERNAME));
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn test_load_users_reads_each_line_once() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(USERS_FILE), "alice\nbob\n").unwrap();
        let storage = Storage::new(dir.path());

        let users = storage.load_users();
        let names: Vec<_> = users.iter().cloned().collect();
        assert_eq!(names, ["alice", "bob", "sysadmin"]);
    }

    #[test]
    fn test_load_users_skips_blank_lines() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(USERS_FILE), "alice\n\n\nbob\n\n").unwrap();
        let storage = Storage::new(dir.path());

        assert_eq!(storage.load_users().len(), 3);
    }

    #[test]
    fn test_append_then_reload() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());

        storage.append_user("carol").unwrap();
        storage.append_user("dave").unwrap();

        let users = storage.load_users();
        assert!(users.contains("carol"));
        assert!(users.contains("dave"));
    }

    #[test]
    fn test_save_users_overwrites() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());
        fs::write(dir.path().join(USERS_FILE), "stale\n").unwrap();

        let users: BTreeSet<String> = ["alice".to_owned(), "sysadmin".to_owned()].into();
        storage.save_users(&users).unwrap();

        let reloaded = storage.load_users();
        assert!(!reloaded.contains("stale"));
        assert!(reloaded.contains("alice"));
    }

    #[test]
    fn test_ensure_sheets_dir_is_idempotent() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());

        let first = storage.ensure_sheets_dir().unwrap();
        let second = storage.ensure_sheets_dir().unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_sheets_dir_is_user_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let sheets = storage.ensure_sheets_dir().unwrap();

        let mode = fs::metadata(sheets).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
