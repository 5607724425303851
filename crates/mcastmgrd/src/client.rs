//! Async client for the control socket.

use crate::error::Result;
use crate::protocol::{decode_status, Request, RESPONSE_LEN};
use mcast_membership::{BindRequest, GroupAddress};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// One membership session held open over the control socket
///
/// Every call returns the raw status: non-negative on success, a negative
/// errno on failure. Dropping the client ends the session.
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        debug!(path = %path.as_ref().display(), "Connected to mcastmgrd");
        Ok(Self { stream })
    }

    pub async fn bind(&mut self, request: BindRequest) -> Result<i32> {
        self.call(Request::Bind(request)).await
    }

    pub async fn join(&mut self, group: GroupAddress) -> Result<i32> {
        self.call(Request::Join(group)).await
    }

    pub async fn leave(&mut self, group: GroupAddress) -> Result<i32> {
        self.call(Request::Leave(group)).await
    }

    /// Sends a raw 12-byte frame; used to probe the daemon's framing
    pub async fn send_raw(&mut self, frame: &[u8]) -> Result<i32> {
        self.stream.write_all(frame).await?;
        let mut response = [0u8; RESPONSE_LEN];
        self.stream.read_exact(&mut response).await?;
        Ok(decode_status(&response))
    }

    async fn call(&mut self, request: Request) -> Result<i32> {
        let status = self.send_raw(&request.encode()).await?;
        debug!(?request, status, "Request completed");
        Ok(status)
    }

    /// Ends the session; the daemon releases every membership it held
    pub async fn disconnect(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
