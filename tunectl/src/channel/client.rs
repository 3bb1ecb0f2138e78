//! Control channel client used by short-lived CLI invocations

use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;
use tunectl_common::framing::{self, JsonLines};
use tunectl_common::{ControlCommand, Request, Response, StateSnapshot};

fn into_snapshot(response: Response) -> Result<StateSnapshot> {
    match response {
        Response::Snapshot(snapshot) => Ok(snapshot),
        Response::Error(descriptor) => Err(Error::from_descriptor(descriptor)),
    }
}

/// Connection parameters for one singleton's channel
#[derive(Debug, Clone)]
pub struct ControlClient {
    address: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(address: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    async fn connect(&self) -> Result<JsonLines<UnixStream>> {
        match UnixStream::connect(&self.address).await {
            Ok(stream) => Ok(framing::json_lines(stream)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                debug!("No listener at {}: {}", self.address.display(), e);
                Err(Error::NoRunningInstance)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn unresponsive(&self) -> Error {
        Error::InstanceUnresponsive(self.timeout.as_millis() as u64)
    }

    /// Send one command and wait for the resulting snapshot
    pub async fn send(&self, command: ControlCommand) -> Result<StateSnapshot> {
        let exchange = async {
            let mut framed = self.connect().await?;
            framing::send(&mut framed, &Request::Command(command)).await?;
            match framing::recv::<_, Response>(&mut framed).await? {
                Some(response) => into_snapshot(response),
                None => Err(Error::ChannelProtocol(
                    "connection closed without a response".to_string(),
                )),
            }
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| self.unresponsive())?
    }

    /// Open an observer connection
    ///
    /// The first snapshot (current state) is read before returning.
    pub async fn subscribe(&self) -> Result<Observer> {
        let handshake = async {
            let mut framed = self.connect().await?;
            framing::send(&mut framed, &Request::Subscribe).await?;
            let first = match framing::recv::<_, Response>(&mut framed).await? {
                Some(response) => into_snapshot(response)?,
                None => {
                    return Err(Error::ChannelProtocol(
                        "connection closed before the first snapshot".to_string(),
                    ))
                }
            };
            Ok::<_, Error>(Observer {
                framed,
                pending: Some(first),
            })
        };
        tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| self.unresponsive())?
    }
}

/// Stream of snapshots from a subscribed connection
pub struct Observer {
    framed: JsonLines<UnixStream>,
    pending: Option<StateSnapshot>,
}

impl Observer {
    /// Next snapshot, `None` once the singleton closed the connection
    pub async fn next(&mut self) -> Result<Option<StateSnapshot>> {
        if let Some(first) = self.pending.take() {
            return Ok(Some(first));
        }
        match framing::recv::<_, Response>(&mut self.framed).await? {
            Some(response) => into_snapshot(response).map(Some),
            None => Ok(None),
        }
    }
}
