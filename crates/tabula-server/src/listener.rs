//! TCP listener yielding framed transports.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::{ServerError, ServerResult};
use crate::transport::LineTransport;

/// A bound, listening TCP socket handing out [`LineTransport`]s.
pub struct Listener {
    inner: TcpListener,
    local: String,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl Listener {
    /// Bind a passive socket. An empty host means the wildcard address.
    pub async fn bind(host: &str, port: u16) -> ServerResult<Self> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let inner = TcpListener::bind((host, port))
            .await
            .map_err(|e| ServerError::Bind {
                addr: format!("{host}:{port}"),
                message: e.to_string(),
            })?;
        let local = inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("{host}:{port}"));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner,
            local,
            shutdown,
            next_id: AtomicU64::new(0),
        })
    }

    /// Human-readable `ip:port` of the bound socket.
    pub fn local_addr(&self) -> &str {
        &self.local
    }

    /// Accept the next connection, or `None` once the listener is stopped.
    ///
    /// Transient accept failures are logged and retried.
    pub async fn accept(&self) -> Option<LineTransport> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                return None;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, _)) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        return Some(LineTransport::new(id, stream));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                    }
                },
            }
        }
    }

    /// Stop accepting. Idempotent; any in-flight accept resolves to `None`.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}
