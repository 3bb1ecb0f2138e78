//! Control channel server
//!
//! One accept loop serves both command connections and observers. Each
//! connection runs in its own task, but commands only take effect through
//! the worker queue, so they apply in the order the worker receives them.
//!
//! Shutdown: once the shutdown token is cancelled the listener is closed and
//! the socket file removed; command connections already accepted run to
//! completion, observers get the final snapshot and are disconnected.

use crate::channel::broadcaster::snapshot_stream;
use crate::error::{Error, Result};
use crate::playback::{Subscription, WorkerHandle};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunectl_common::framing::{self, JsonLines};
use tunectl_common::{Request, Response, TransportStatus};

/// Back-off after a failed `accept` (e.g. out of descriptors)
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    worker: WorkerHandle,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl ControlServer {
    /// Bind the socket, readable and writable by the owner only
    pub fn bind(
        path: &Path,
        worker: WorkerHandle,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        remove_socket_file(path);
        let listener = UnixListener::bind(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!("Control channel listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            worker,
            timeout,
            shutdown,
        })
    }

    pub fn address(&self) -> &Path {
        &self.path
    }

    /// Serve until the shutdown token is cancelled
    pub async fn run(self) {
        let ControlServer {
            listener,
            path,
            worker,
            timeout,
            shutdown,
        } = self;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let worker = worker.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, worker, timeout, shutdown).await {
                                debug!("Control connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Control channel accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Control connection task failed: {}", e);
                    }
                }
            }
        }

        info!("Control channel closing, {} connections in flight", connections.len());
        drop(listener);
        remove_socket_file(&path);

        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!("Control connection task failed: {}", e);
            }
        }
        info!("Control channel closed");
    }
}

async fn handle_connection(
    stream: UnixStream,
    worker: WorkerHandle,
    timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut framed = framing::json_lines(stream);

    let request = match tokio::time::timeout(timeout, framing::recv::<_, Request>(&mut framed)).await {
        Err(_) => {
            debug!("Client sent no request within {} ms", timeout.as_millis());
            return Ok(());
        }
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            let err = Error::from(e);
            warn!("Rejecting request: {}", err);
            let response = Response::Error(err.to_descriptor());
            if let Err(write_err) = respond(&mut framed, &response, timeout).await {
                debug!("Could not report protocol error: {}", write_err);
            }
            return Err(err);
        }
    };

    match request {
        Request::Command(command) => {
            debug!("Command: {}", command);
            let response = match worker.send(command).await {
                Ok(snapshot) => Response::Snapshot(snapshot),
                Err(e) => {
                    debug!("Command failed: {}", e);
                    Response::Error(e.to_descriptor())
                }
            };
            respond(&mut framed, &response, timeout).await
        }
        Request::Subscribe => serve_observer(framed, worker, timeout, shutdown).await,
    }
}

async fn serve_observer(
    mut framed: JsonLines<UnixStream>,
    worker: WorkerHandle,
    timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let Subscription { snapshot, updates } = worker.subscribe().await?;
    respond(&mut framed, &Response::Snapshot(snapshot), timeout).await?;
    info!("Observer connected");

    let updates = snapshot_stream(updates);
    tokio::pin!(updates);

    loop {
        tokio::select! {
            biased;
            next = updates.next() => match next {
                Some(snapshot) => {
                    let terminal = snapshot.status == TransportStatus::ShuttingDown;
                    respond(&mut framed, &Response::Snapshot(snapshot), timeout).await?;
                    if terminal {
                        break;
                    }
                }
                None => break,
            },
            incoming = framed.next() => match incoming {
                None | Some(Err(_)) => break,
                Some(Ok(_)) => debug!("Ignoring message from observer"),
            },
            _ = shutdown.cancelled() => break,
        }
    }

    info!("Observer disconnected");
    Ok(())
}

async fn respond(framed: &mut JsonLines<UnixStream>, response: &Response, timeout: Duration) -> Result<()> {
    tokio::time::timeout(timeout, framing::send(framed, response))
        .await
        .map_err(|_| Error::ChannelProtocol(format!("write timed out after {} ms", timeout.as_millis())))??;
    Ok(())
}

fn remove_socket_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove socket {}: {}", path.display(), e);
        }
    }
}
