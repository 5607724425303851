//! Unix socket server: one membership session per accepted connection.

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::protocol::{encode_status, status_for, Request, REQUEST_LEN};
use mcast_membership::{InterfaceResolver, MulticastControlPlane, Session};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. EMFILE) before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Decrements the active-session counter when a connection ends
struct SessionSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared state handed to every connection task
#[derive(Clone)]
struct SessionFactory {
    plane: Arc<dyn MulticastControlPlane>,
    resolver: Arc<dyn InterfaceResolver>,
    max_groups: usize,
}

impl SessionFactory {
    fn open(&self) -> Session {
        Session::with_group_limit(
            Arc::clone(&self.plane),
            Arc::clone(&self.resolver),
            self.max_groups,
        )
    }
}

/// Multicast membership control server
pub struct MembershipServer {
    listener: UnixListener,
    socket_path: PathBuf,
    factory: SessionFactory,
    max_sessions: usize,
    active: Arc<AtomicUsize>,
}

impl MembershipServer {
    /// Binds the control socket, replacing a stale socket file if present
    pub fn bind(
        config: &DaemonConfig,
        plane: Arc<dyn MulticastControlPlane>,
        resolver: Arc<dyn InterfaceResolver>,
    ) -> Result<Self> {
        let socket_path = config.server.socket_path.clone();
        remove_stale_socket(&socket_path)?;

        let listener = UnixListener::bind(&socket_path)?;
        info!(path = %socket_path.display(), "Listening for membership sessions");

        Ok(Self {
            listener,
            socket_path,
            factory: SessionFactory {
                plane,
                resolver,
                max_groups: config.membership.max_groups_per_session,
            },
            max_sessions: config.server.max_sessions,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of sessions currently open
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Accepts connections until `shutdown` flips to true, then closes every session
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, closing sessions");
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            accept_failed(&e).await;
                            continue;
                        }
                    };

                    if self.active.fetch_add(1, Ordering::AcqRel) >= self.max_sessions {
                        self.active.fetch_sub(1, Ordering::AcqRel);
                        warn!(max_sessions = self.max_sessions, "Session limit reached, refusing connection");
                        drop(stream);
                        continue;
                    }

                    let slot = SessionSlot { active: Arc::clone(&self.active) };
                    let session = self.factory.open();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        let _slot = slot;
                        run_session(session, stream, shutdown).await;
                    });
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "Session task failed");
                    }
                }
            }
        }

        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Session task failed");
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), error = %e, "Failed to remove socket");
            }
        }
        info!("Membership server stopped");
        Ok(())
    }
}

/// Logs a failed accept and waits before the listener is polled again
async fn accept_failed(err: &io::Error) {
    warn!(error = %err, backoff_ms = ACCEPT_BACKOFF.as_millis() as u64, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Serves one connection until EOF, a short frame, or shutdown
async fn run_session(session: Session, mut stream: UnixStream, mut shutdown: watch::Receiver<bool>) {
    let id = session.id();
    info!(session = %id, "Session opened");

    let mut frame = [0u8; REQUEST_LEN];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            read = stream.read_exact(&mut frame) => {
                match read {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        debug!(session = %id, "Peer disconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(session = %id, error = %e, "Read failed");
                        break;
                    }
                }

                let status = dispatch(&session, &frame);
                if let Err(e) = stream.write_all(&encode_status(status)).await {
                    warn!(session = %id, error = %e, "Write failed");
                    break;
                }
            }
        }
    }

    let report = session.close();
    info!(
        session = %id,
        released = report.released.len(),
        failures = report.failures.len(),
        "Session closed"
    );
}

/// Decodes and executes one request, returning the status to write back
fn dispatch(session: &Session, frame: &[u8; REQUEST_LEN]) -> i32 {
    let request = match Request::decode(frame) {
        Ok(request) => request,
        Err(e) => {
            warn!(session = %session.id(), error = %e, "Rejected request");
            return e.status_code();
        }
    };

    let result = match request {
        Request::Join(group) => session.join(group),
        Request::Leave(group) => session.leave(group),
        Request::Bind(bind) => session.bind(bind),
    };
    if let Err(e) = &result {
        debug!(session = %session.id(), ?request, error = %e, "Request failed");
    }
    status_for(&result)
}
