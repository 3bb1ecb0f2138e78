//! Newline-delimited JSON framing for the control channel
//!
//! One JSON document per line. `LinesCodec` buffers partial reads, so a message
//! split across several socket reads is still delivered whole, and lines longer
//! than [`MAX_FRAME_LEN`] are rejected instead of growing the buffer forever.

use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec};

/// Upper bound for a single frame (64 KiB)
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// A byte stream framed into JSON lines
pub type JsonLines<T> = Framed<T, LinesCodec>;

/// Wrap a connection in the control-channel codec
pub fn json_lines<T>(io: T) -> JsonLines<T>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, LinesCodec::new_with_max_length(MAX_FRAME_LEN))
}

/// Serialize a message into a single line (no trailing newline)
pub fn encode<M: Serialize>(message: &M) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse one line into a message
pub fn decode<M: DeserializeOwned>(line: &str) -> Result<M> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Write one message and flush it
pub async fn send<T, M>(framed: &mut JsonLines<T>, message: &M) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    let line = encode(message)?;
    framed.send(line).await?;
    Ok(())
}

/// Read the next message
///
/// Returns `Ok(None)` when the peer closed the connection cleanly.
pub async fn recv<T, M>(framed: &mut JsonLines<T>) -> Result<Option<M>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    match framed.next().await {
        Some(Ok(line)) => decode(&line).map(Some),
        Some(Err(e)) => Err(Error::from(e)),
        None => Ok(None),
    }
}
