//! End-to-end tests: a real server on a loopback socket, driven through the
//! wire protocol exactly as a remote client would.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

use tabula_server::{Server, ServerConfig};

const WAIT: Duration = Duration::from_secs(5);

/// Start a server on an ephemeral loopback port with `alice` pre-registered.
async fn start_server(dir: &Path) -> Arc<Server> {
    std::fs::write(dir.join("users"), "alice\n").unwrap();
    start_server_with_existing_users(dir).await
}

async fn start_server_with_existing_users(dir: &Path) -> Arc<Server> {
    let server = Server::new(ServerConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        data_dir: dir.to_path_buf(),
    });
    server.start().await.expect("server should start");
    server
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(server: &Server) -> Self {
        let addr = server.local_addr().expect("server is started");
        let stream = TcpStream::connect(addr.as_str()).await.expect("connect");
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("send");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("send");
    }

    async fn recv(&mut self) -> String {
        timeout(WAIT, self.lines.next_line())
            .await
            .expect("reply within timeout")
            .expect("readable stream")
            .expect("stream still open")
    }

    async fn recv_eof(&mut self) -> bool {
        matches!(
            timeout(WAIT, self.lines.next_line()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_unknown_user_is_rejected_and_connection_stays_open() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;
    client.send("connect bob sheet1").await;
    assert_eq!(client.recv().await, "error 4 bob");

    // The connection remains usable.
    client.send("connect alice sheet1").await;
    assert_eq!(client.recv().await, "connected 0");

    server.stop().await;
}

#[tokio::test]
async fn test_successful_attach_to_empty_sheet_creates_file() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;
    client.send("connect alice sheet1").await;
    assert_eq!(client.recv().await, "connected 0");

    let path = dir.path().join("spreadsheets/sheet1");
    assert!(path.is_file());
    assert_eq!(std::fs::read_to_string(path).unwrap(), "");

    server.stop().await;
}

#[tokio::test]
async fn test_edits_broadcast_to_every_client_in_commit_order() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut a = Client::connect(&server).await;
    a.send("connect alice sheet1").await;
    assert_eq!(a.recv().await, "connected 0");

    let mut b = Client::connect(&server).await;
    b.send("connect alice sheet1").await;
    assert_eq!(b.recv().await, "connected 0");

    a.send("cell A1 =B1+1").await;
    assert_eq!(a.recv().await, "cell A1 =B1+1");
    assert_eq!(b.recv().await, "cell A1 =B1+1");

    b.send("cell B1 42").await;
    assert_eq!(a.recv().await, "cell B1 42");
    assert_eq!(b.recv().await, "cell B1 42");

    server.stop().await;
}

#[tokio::test]
async fn test_circular_dependency_errors_only_the_editor() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut a = Client::connect(&server).await;
    a.send("connect alice sheet1").await;
    assert_eq!(a.recv().await, "connected 0");
    a.send("cell A1 =B1").await;
    assert_eq!(a.recv().await, "cell A1 =B1");

    let mut b = Client::connect(&server).await;
    b.send("connect alice sheet1").await;
    assert_eq!(b.recv().await, "connected 1");
    assert_eq!(b.recv().await, "cell A1 =B1");

    b.send("cell B1 =A1").await;
    assert_eq!(
        b.recv().await,
        "error 1 When trying to edit cell B1, a circular dependency occurred: \
         the edit was not made."
    );

    // No broadcast was produced by the rejected edit: the next line each
    // client sees is the next successful edit.
    a.send("cell C1 9").await;
    assert_eq!(a.recv().await, "cell C1 9");
    assert_eq!(b.recv().await, "cell C1 9");

    server.stop().await;
}

#[tokio::test]
async fn test_undo_after_two_edits_restores_previous_value() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;
    client.send("connect alice sheet1").await;
    assert_eq!(client.recv().await, "connected 0");

    client.send("cell A1 5").await;
    assert_eq!(client.recv().await, "cell A1 5");
    client.send("cell A1 7").await;
    assert_eq!(client.recv().await, "cell A1 7");
    client.send("undo").await;
    assert_eq!(client.recv().await, "cell A1 5");

    server.stop().await;
}

#[tokio::test]
async fn test_undo_on_fresh_sheet_reports_error() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;
    client.send("connect alice sheet1").await;
    assert_eq!(client.recv().await, "connected 0");

    client.send("undo").await;
    assert_eq!(
        client.recv().await,
        "error 3 Your undo command was unable to be processed."
    );

    server.stop().await;
}

#[tokio::test]
async fn test_last_client_leaving_saves_and_closes_the_session() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut a = Client::connect(&server).await;
    a.send("connect alice sheet1").await;
    assert_eq!(a.recv().await, "connected 0");
    let mut b = Client::connect(&server).await;
    b.send("connect alice sheet1").await;
    assert_eq!(b.recv().await, "connected 0");

    a.send("cell A1 5").await;
    assert_eq!(a.recv().await, "cell A1 5");
    assert_eq!(b.recv().await, "cell A1 5");

    // First client leaves; the session stays open for the second.
    drop(a);
    b.send("cell B1 6").await;
    assert_eq!(b.recv().await, "cell B1 6");

    // Last client leaves; the session is saved and torn down.
    drop(b);
    let path = dir.path().join("spreadsheets/sheet1");
    wait_until(|| std::fs::read_to_string(&path).unwrap() == "A1 5\nB1 6\n").await;

    // A fresh connect re-opens the saved document.
    let mut c = Client::connect(&server).await;
    c.send("connect alice sheet1").await;
    assert_eq!(c.recv().await, "connected 2");
    assert_eq!(c.recv().await, "cell A1 5");
    assert_eq!(c.recv().await, "cell B1 6");

    server.stop().await;
}

#[tokio::test]
async fn test_register_persists_across_restart() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;
    client.send("connect alice sheet1").await;
    assert_eq!(client.recv().await, "connected 0");

    // No positive acknowledgement is sent for a successful register; the
    // undo error doubles as a sequencing barrier.
    client.send("register bob").await;
    client.send("undo").await;
    assert_eq!(
        client.recv().await,
        "error 3 Your undo command was unable to be processed."
    );

    // The name is durable before the server stops.
    let users = std::fs::read_to_string(dir.path().join("users")).unwrap();
    assert!(users.lines().any(|l| l == "bob"));

    server.stop().await;

    let server = start_server_with_existing_users(dir.path()).await;
    let mut client = Client::connect(&server).await;
    client.send("connect bob sheet1").await;
    assert_eq!(client.recv().await, "connected 0");
    server.stop().await;
}

#[tokio::test]
async fn test_sysadmin_is_recognized_without_being_in_the_users_file() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let users = std::fs::read_to_string(dir.path().join("users")).unwrap();
    assert!(!users.contains("sysadmin"));

    let mut client = Client::connect(&server).await;
    client.send("connect sysadmin sheet1").await;
    assert_eq!(client.recv().await, "connected 0");

    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_register_reports_username_error() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;
    client.send("connect alice sheet1").await;
    assert_eq!(client.recv().await, "connected 0");

    client.send("register alice").await;
    assert_eq!(
        client.recv().await,
        "error 4 The username you are trying to register is already registered."
    );

    server.stop().await;
}

#[tokio::test]
async fn test_commands_require_a_bound_connection() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;

    client.send("cell A1 5").await;
    assert_eq!(
        client.recv().await,
        "error 3 You must be connected to a spreadsheet in order to use an edit command."
    );
    client.send("undo").await;
    assert_eq!(
        client.recv().await,
        "error 3 You must be connected to a spreadsheet in order to use an undo command."
    );
    client.send("register bob").await;
    assert_eq!(
        client.recv().await,
        "error 3 You must be connected to a spreadsheet in order to register a user name."
    );

    server.stop().await;
}

#[tokio::test]
async fn test_second_connect_on_same_connection_is_rejected() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;
    client.send("connect alice sheet1").await;
    assert_eq!(client.recv().await, "connected 0");

    client.send("connect alice sheet2").await;
    assert_eq!(
        client.recv().await,
        "error 2 You are already connected to a Spreadsheet: \
         you must connect to a new Spreadsheet using a new connection."
    );

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_command_is_echoed_in_the_error() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;
    client.send("frobnicate A1").await;
    assert_eq!(client.recv().await, "error 2 frobnicate");

    server.stop().await;
}

#[tokio::test]
async fn test_trailing_fields_keep_embedded_spaces() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    // Spreadsheet names may contain spaces.
    let mut client = Client::connect(&server).await;
    client.send("connect alice my budget 2015").await;
    assert_eq!(client.recv().await, "connected 0");
    assert!(dir.path().join("spreadsheets/my budget 2015").is_file());

    // Cell contents may contain spaces, preserved verbatim end to end.
    client.send("cell A1 some text  with   spaces").await;
    assert_eq!(client.recv().await, "cell A1 some text  with   spaces");

    drop(client);
    let path = dir.path().join("spreadsheets/my budget 2015");
    wait_until(|| std::fs::read_to_string(&path).unwrap() == "A1 some text  with   spaces\n").await;

    server.stop().await;
}

#[tokio::test]
async fn test_crlf_framing_is_accepted() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;
    client.send_raw(b"connect alice sheet1\r\n").await;
    assert_eq!(client.recv().await, "connected 0");

    client.send_raw(b"cell A1 5\r\n").await;
    assert_eq!(client.recv().await, "cell A1 5");

    server.stop().await;
}

#[tokio::test]
async fn test_stop_closes_clients_and_is_idempotent() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = Client::connect(&server).await;
    client.send("connect alice sheet1").await;
    assert_eq!(client.recv().await, "connected 0");
    client.send("cell A1 5").await;
    assert_eq!(client.recv().await, "cell A1 5");

    server.stop().await;
    server.stop().await;

    assert!(client.recv_eof().await);

    // The open document was saved on stop.
    let saved = std::fs::read_to_string(dir.path().join("spreadsheets/sheet1")).unwrap();
    assert_eq!(saved, "A1 5\n");

    // The users file was rewritten from the in-memory set.
    let users = std::fs::read_to_string(dir.path().join("users")).unwrap();
    assert!(users.lines().any(|l| l == "alice"));
    assert!(users.lines().any(|l| l == "sysadmin"));
}
