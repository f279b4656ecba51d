//! The server coordinator.
//!
//! Accepts connections, runs one command loop per client, and routes
//! commands either to its own registries (`connect`, `register`) or to the
//! client's bound [`Session`] (`cell`, `undo`). Each registry has its own
//! mutex, held only for a single lookup, insert, or erase and never across
//! I/O or another lock, so unrelated sessions and connections do not
//! contend.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ServerError, ServerResult};
use crate::listener::Listener;
use crate::protocol::{self, Command, code};
use crate::session::Session;
use crate::storage::Storage;
use crate::transport::{ClientHandle, ConnectionId, LineTransport, Received};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to; empty means the wildcard address.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Directory holding `spreadsheets/` and the `users` file.
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 2000,
            data_dir: PathBuf::from("."),
        }
    }
}

/// The spreadsheet server: listener, document registry, username registry,
/// and one command loop per connected client.
pub struct Server {
    storage: Storage,
    config: ServerConfig,
    /// Registered usernames; always contains `sysadmin` once started.
    usernames: Mutex<BTreeSet<String>>,
    /// Open documents by name.
    sessions: Mutex<FxHashMap<String, Arc<Session>>>,
    /// Which session each connection is bound to, if any.
    bindings: Mutex<FxHashMap<ConnectionId, Arc<Session>>>,
    /// Every live connection, bound or not; used to close them all on stop.
    connections: Mutex<FxHashMap<ConnectionId, ClientHandle>>,
    listener: Mutex<Option<Arc<Listener>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            storage: Storage::new(&config.data_dir),
            config,
            usernames: Mutex::new(BTreeSet::new()),
            sessions: Mutex::new(FxHashMap::default()),
            bindings: Mutex::new(FxHashMap::default()),
            connections: Mutex::new(FxHashMap::default()),
            listener: Mutex::new(None),
            accept_task: Mutex::new(None),
            shutdown,
        })
    }

    /// Load usernames, bind the listener, and begin accepting connections.
    pub async fn start(self: &Arc<Self>) -> ServerResult<()> {
        if self.listener.lock().unwrap().is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        tracing::info!("loading usernames");
        *self.usernames.lock().unwrap() = self.storage.load_users();

        let listener = Arc::new(Listener::bind(&self.config.host, self.config.port).await?);
        tracing::info!(addr = %listener.local_addr(), "listening for connections");
        *self.listener.lock().unwrap() = Some(Arc::clone(&listener));

        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(transport) = listener.accept().await {
                tracing::info!(peer = %transport.peer_addr(), "connection established");
                let handle = transport.handle();
                server
                    .connections
                    .lock()
                    .unwrap()
                    .insert(handle.id(), handle);
                let server = Arc::clone(&server);
                tokio::spawn(async move { server.client_loop(transport).await });
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Human-readable `ip:port` the server is listening on, once started.
    pub fn local_addr(&self) -> Option<String> {
        self.listener
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| l.local_addr().to_owned())
    }

    /// Stop the server: save and drop every open document, stop the
    /// listener, close every client transport, and rewrite the users file.
    /// Safe to invoke more than once.
    pub async fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }

        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.save();
        }
        self.bindings.lock().unwrap().clear();

        let listener = self.listener.lock().unwrap().take();
        if let Some(listener) = listener {
            listener.stop();
        }
        let accept_task = self.accept_task.lock().unwrap().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        let connections: Vec<ClientHandle> = {
            let mut connections = self.connections.lock().unwrap();
            connections.drain().map(|(_, c)| c).collect()
        };
        for client in connections {
            client.close();
        }

        let users = self.usernames.lock().unwrap().clone();
        if let Err(e) = self.storage.save_users(&users) {
            tracing::warn!(error = %e, "failed to save usernames");
        }
        tracing::info!("server stopped");
    }

    /// One receive-dispatch loop per connection; exits on peer hangup or
    /// server shutdown.
    async fn client_loop(self: Arc<Self>, mut transport: LineTransport) {
        let client = transport.handle();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let received = tokio::select! {
                _ = shutdown.changed() => continue,
                received = transport.next_line() => received,
            };
            match received {
                Received::Line(line) => {
                    tracing::debug!(peer = %client.peer_addr(), message = %line, "received");
                    self.dispatch(&client, &line);
                }
                Received::Transient(e) => {
                    tracing::warn!(peer = %client.peer_addr(), error = %e, "receive error");
                    client.send(&protocol::error(
                        code::GENERIC,
                        "An error occurred while sending or receiving data.",
                    ));
                }
                Received::Closed => {
                    tracing::info!(peer = %client.peer_addr(), "connection closed");
                    self.disconnect(&client);
                    break;
                }
            }
        }
    }

    fn dispatch(&self, client: &ClientHandle, line: &str) {
        match Command::parse(line) {
            Command::Connect {
                username,
                spreadsheet,
            } => self.handle_connect(client, username, spreadsheet),
            Command::Register { username } => self.handle_register(client, username),
            Command::Cell { name, contents } => self.handle_cell(client, name, contents),
            Command::Undo => self.handle_undo(client),
            Command::Unknown(token) => {
                client.send(&protocol::error(code::COMMAND, token));
            }
        }
    }

    fn handle_connect(&self, client: &ClientHandle, username: &str, spreadsheet: &str) {
        if !self.usernames.lock().unwrap().contains(username) {
            client.send(&protocol::error(code::USERNAME, username));
            return;
        }
        if self.bindings.lock().unwrap().contains_key(&client.id()) {
            client.send(&protocol::error(
                code::COMMAND,
                "You are already connected to a Spreadsheet: \
                 you must connect to a new Spreadsheet using a new connection.",
            ));
            return;
        }

        let Some(session) = self.open_session(spreadsheet) else {
            client.send(&protocol::error(
                code::GENERIC,
                "The spreadsheet could not be loaded correctly.",
            ));
            return;
        };

        self.bindings
            .lock()
            .unwrap()
            .insert(client.id(), Arc::clone(&session));
        if !session.add_client(client.clone()) {
            client.send(&protocol::error(
                code::PRECONDITION,
                "You are already connected to this spreadsheet.",
            ));
        }
    }

    /// Fetch the open session for `name`, or load it from disk and register
    /// it. The registry lock is not held across the disk load; when two
    /// connections race to open the same document, the first registration
    /// wins and the loser attaches to it.
    fn open_session(&self, name: &str) -> Option<Arc<Session>> {
        if let Some(session) = self.sessions.lock().unwrap().get(name) {
            return Some(Arc::clone(session));
        }

        let session = Arc::new(Session::new(name, self.storage.clone()));
        if !session.load() {
            return None;
        }

        let mut sessions = self.sessions.lock().unwrap();
        Some(Arc::clone(
            sessions.entry(name.to_owned()).or_insert(session),
        ))
    }

    fn handle_register(&self, client: &ClientHandle, username: &str) {
        if !self.bindings.lock().unwrap().contains_key(&client.id()) {
            client.send(&protocol::error(
                code::PRECONDITION,
                "You must be connected to a spreadsheet in order to register a user name.",
            ));
            return;
        }

        if !self.usernames.lock().unwrap().insert(username.to_owned()) {
            client.send(&protocol::error(
                code::USERNAME,
                "The username you are trying to register is already registered.",
            ));
            return;
        }

        // A successful register sends no reply; the name is durable at once.
        if let Err(e) = self.storage.append_user(username) {
            tracing::warn!(username = %username, error = %e, "failed to append username");
        }
    }

    fn handle_cell(&self, client: &ClientHandle, name: &str, contents: &str) {
        let session = self.bindings.lock().unwrap().get(&client.id()).cloned();
        let Some(session) = session else {
            client.send(&protocol::error(
                code::PRECONDITION,
                "You must be connected to a spreadsheet in order to use an edit command.",
            ));
            return;
        };

        if !session.edit_cell(name, contents) {
            client.send(&protocol::error(
                code::CIRCULAR,
                &format!(
                    "When trying to edit cell {name}, a circular dependency occurred: \
                     the edit was not made."
                ),
            ));
        }
    }

    fn handle_undo(&self, client: &ClientHandle) {
        let session = self.bindings.lock().unwrap().get(&client.id()).cloned();
        let Some(session) = session else {
            client.send(&protocol::error(
                code::PRECONDITION,
                "You must be connected to a spreadsheet in order to use an undo command.",
            ));
            return;
        };

        if !session.undo() {
            client.send(&protocol::error(
                code::PRECONDITION,
                "Your undo command was unable to be processed.",
            ));
        }
    }

    /// Tear down one connection: unbind it, detach it from its session, and
    /// drop the session entirely (saving it first) when its last
    /// participant leaves.
    fn disconnect(&self, client: &ClientHandle) {
        let session = self.bindings.lock().unwrap().remove(&client.id());
        if let Some(session) = session {
            session.remove_client(client.id());
            if session.user_count() == 0 {
                session.save();
                let mut sessions = self.sessions.lock().unwrap();
                // A new participant may have attached while we were saving.
                if session.user_count() == 0 {
                    sessions.remove(session.name());
                }
            }
        }
        self.connections.lock().unwrap().remove(&client.id());
        client.close();
    }
}
