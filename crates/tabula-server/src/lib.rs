//! Tabula collaborative spreadsheet server.
//!
//! Concurrent remote clients connect over TCP, open or create named
//! spreadsheet documents, register usernames, edit cells whose contents may
//! be formulas referencing other cells, and undo edits. Every participant
//! viewing a document observes every edit in real time, and documents are
//! persisted to disk after each edit.
//!
//! # Architecture
//!
//! - **Transport**: newline-framed messages over an accepted TCP connection
//! - **Listener**: accepts connections and hands out transports
//! - **Session**: the state of one open document and its attached clients
//! - **Server**: command dispatch, document and username registries
//! - **Storage**: text-file persistence for documents and usernames
//!
//! The server stores formula *text* and tracks the reference graph (with
//! circular-dependency rejection); it never computes numeric results.

pub mod error;
pub mod listener;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

pub use error::{ServerError, ServerResult};
pub use listener::Listener;
pub use server::{Server, ServerConfig};
pub use session::Session;
pub use storage::Storage;
pub use transport::{ClientHandle, LineTransport, Received};
