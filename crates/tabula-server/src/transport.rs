//! Newline-framed message transport over an accepted TCP connection.
//!
//! A [`LineTransport`] splits the stream into a reading side, polled with
//! [`LineTransport::next_line`], and a clonable sending side, the
//! [`ClientHandle`]. Sends are enqueued on an unbounded channel drained by a
//! dedicated writer task, so enqueueing never blocks and delivery is FIFO
//! per connection. No lock is held while handlers run, so sending from
//! within command handling cannot deadlock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

/// Identifier of one accepted connection, unique for the server's lifetime.
pub type ConnectionId = u64;

/// The outcome of waiting for the next framed line.
#[derive(Debug)]
pub enum Received {
    /// A complete line; the terminator is stripped and every `\r` elided,
    /// so CRLF and LF framings are equivalent.
    Line(String),
    /// A non-fatal read error; the connection stays usable.
    Transient(std::io::Error),
    /// The peer hung up or the transport was closed.
    Closed,
}

pub(crate) enum Frame {
    Line(String),
    Close,
}

/// Clonable sending half of a transport.
///
/// Sessions and registries hold these; identity is the connection id, so a
/// handle can stand in for "the client" in maps and sets.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    peer: Arc<str>,
    tx: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

impl ClientHandle {
    /// The connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Human-readable `ip:port` of the peer.
    pub fn peer_addr(&self) -> &str {
        &self.peer
    }

    /// Whether the transport has reached its terminal closed state.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Enqueue one message for transmission, appending `\n` when missing.
    ///
    /// Returns immediately; delivery is FIFO through the writer task. On a
    /// closed transport the message is discarded and `false` returned.
    pub fn send(&self, msg: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut line = msg.to_owned();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.tx.send(Frame::Line(line)).is_ok()
    }

    /// Transition the transport to its terminal closed state. Idempotent.
    ///
    /// Messages already enqueued are still flushed; the writer task then
    /// shuts down the write half of the socket. New sends are discarded.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Frame::Close);
        }
    }
}

/// One accepted TCP connection, framed as lines of text.
pub struct LineTransport {
    reader: BufReader<OwnedReadHalf>,
    handle: ClientHandle,
}

impl LineTransport {
    /// Wrap an accepted stream and spawn its writer task.
    pub fn new(id: ConnectionId, stream: TcpStream) -> Self {
        let peer: Arc<str> = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_owned())
            .into();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(write_loop(write_half, rx, Arc::clone(&closed)));
        Self {
            reader: BufReader::new(read_half),
            handle: ClientHandle {
                id,
                peer,
                tx,
                closed,
            },
        }
    }

    /// A clonable handle for sending to this connection.
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Human-readable `ip:port` of the peer.
    pub fn peer_addr(&self) -> &str {
        self.handle.peer_addr()
    }

    /// Close the transport; see [`ClientHandle::close`].
    pub fn close(&self) {
        self.handle.close();
    }

    /// Wait for the next complete line.
    ///
    /// [`Received::Closed`] covers peer hangup (a zero-byte read), an
    /// incomplete trailing frame at EOF, and a locally closed transport.
    pub async fn next_line(&mut self) -> Received {
        if self.handle.closed.load(Ordering::Acquire) {
            return Received::Closed;
        }
        let mut buf = String::new();
        match self.reader.read_line(&mut buf).await {
            Ok(0) => Received::Closed,
            Ok(_) => {
                if !buf.ends_with('\n') {
                    // EOF in the middle of a frame; the partial line is not
                    // a message.
                    return Received::Closed;
                }
                buf.pop();
                buf.retain(|c| c != '\r');
                Received::Line(buf)
            }
            Err(e) => match e.kind() {
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => Received::Closed,
                _ => Received::Transient(e),
            },
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Line(line) => {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            Frame::Close => break,
        }
    }
    closed.store(true, Ordering::Release);
    let _ = write_half.shutdown().await;
}

/// A handle wired to an in-memory channel instead of a socket, for tests
/// that exercise session broadcast without TCP.
#[cfg(test)]
pub(crate) fn test_handle(id: ConnectionId) -> (ClientHandle, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ClientHandle {
        id,
        peer: "127.0.0.1:0".into(),
        tx,
        closed: Arc::new(AtomicBool::new(false)),
    };
    (handle, rx)
}

#[cfg(test)]
pub(crate) fn drain_lines(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Frame::Line(line) = frame {
            lines.push(line);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (LineTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (LineTransport::new(1, accepted), client)
    }

    #[tokio::test]
    async fn test_send_appends_newline_and_preserves_fifo() {
        let (transport, mut client) = pair().await;
        let handle = transport.handle();

        assert!(handle.send("first"));
        assert!(handle.send("second\n"));
        handle.close();

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_receive_strips_terminator_and_carriage_returns() {
        let (mut transport, mut client) = pair().await;

        client.write_all(b"hello world\r\n").await.unwrap();
        match transport.next_line().await {
            Received::Line(line) => assert_eq!(line, "hello world"),
            other => panic!("expected line, got {other:?}"),
        }

        client.write_all(b"plain\n").await.unwrap();
        match transport.next_line().await {
            Received::Line(line) => assert_eq!(line, "plain"),
            other => panic!("expected line, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_hangup_reports_closed() {
        let (mut transport, client) = pair().await;
        drop(client);
        assert!(matches!(transport.next_line().await, Received::Closed));
    }

    #[tokio::test]
    async fn test_partial_trailing_frame_reports_closed() {
        let (mut transport, mut client) = pair().await;
        client.write_all(b"no terminator").await.unwrap();
        drop(client);
        assert!(matches!(transport.next_line().await, Received::Closed));
    }

    #[tokio::test]
    async fn test_send_after_close_is_discarded() {
        let (transport, _client) = pair().await;
        let handle = transport.handle();

        handle.close();
        handle.close(); // idempotent
        assert!(!handle.send("dropped"));
        assert!(handle.is_closed());
    }
}
