//! The line protocol spoken between clients and the server.
//!
//! Every message is one line of text ended with `\n`. The first space in a
//! received line separates the command from its argument string; within the
//! arguments of `connect` and `cell`, the first space separates the two
//! fields and the trailing field is taken verbatim, so a cell's contents may
//! contain spaces.

/// Wire error codes carried by `error <code> <text>` replies.
pub mod code {
    /// Generic or I/O failure.
    pub const GENERIC: u8 = 0;
    /// Circular dependency; the edit was not made.
    pub const CIRCULAR: u8 = 1;
    /// Unknown or misused command.
    pub const COMMAND: u8 = 2;
    /// Precondition failed: not connected, or nothing to undo.
    pub const PRECONDITION: u8 = 3;
    /// Username issue: unknown on connect, duplicate on register.
    pub const USERNAME: u8 = 4;
}

/// A parsed client command.
///
/// Command names are case-sensitive and lowercase; anything else is
/// [`Command::Unknown`] and echoed back in an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// `connect <username> <spreadsheet>`
    Connect {
        username: &'a str,
        spreadsheet: &'a str,
    },
    /// `register <username>`
    Register { username: &'a str },
    /// `cell <cellName> <contents>`
    Cell { name: &'a str, contents: &'a str },
    /// `undo` (arguments ignored)
    Undo,
    /// Anything else; carries the offending command token.
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    /// Parse one received line.
    pub fn parse(line: &'a str) -> Self {
        let (cmd, args) = split_first_space(line);
        match cmd {
            "connect" => {
                let (username, spreadsheet) = split_first_space(args);
                Command::Connect {
                    username,
                    spreadsheet,
                }
            }
            "register" => {
                let (username, _) = split_first_space(args);
                Command::Register { username }
            }
            "cell" => {
                let (name, contents) = split_first_space(args);
                Command::Cell { name, contents }
            }
            "undo" => Command::Undo,
            other => Command::Unknown(other),
        }
    }
}

/// Split at the first space; the remainder after that single space is
/// returned verbatim. No space yields an empty remainder.
pub(crate) fn split_first_space(s: &str) -> (&str, &str) {
    match s.find(' ') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    }
}

/// `connected <N>`, sent once after a successful connect, before the
/// initial cell burst of `N` lines.
pub fn connected(cell_count: usize) -> String {
    format!("connected {cell_count}")
}

/// `cell <name> <contents>`: initial sync and edit broadcast.
pub fn cell(name: &str, contents: &str) -> String {
    format!("cell {name} {contents}")
}

/// `error <code> <text>`.
pub fn error(code: u8, text: &str) -> String {
    format!("error {code} {text}")
}
