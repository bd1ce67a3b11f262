use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use tick_core::point::Point;

use crate::ingest::IngestRouter;

/// One wire frame: points tagged with the database/retention-policy pair
/// that routes them.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteFrame {
    pub db: String,
    pub rp: String,
    pub points: Vec<Point>,
}

/// TCP receiver that accepts connections, reads length-prefixed JSON
/// frames, and routes the points through the [`IngestRouter`].
pub struct Receiver {
    listener: TcpListener,
    router: Arc<IngestRouter>,
    cancel: CancellationToken,
}

impl Receiver {
    /// Parse `"tcp://host:port"` and bind a TCP listener.
    pub async fn bind(listen: &str, router: Arc<IngestRouter>) -> anyhow::Result<Self> {
        let addr = listen.strip_prefix("tcp://").unwrap_or(listen);
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept loop; blocks until the cancellation token fires.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (stream, peer) = result?;
                    td_debug!(conn, peer = %peer, "accepted connection");
                    let router = Arc::clone(&self.router);
                    let cancel = self.cancel.child_token();
                    tokio::spawn(handle_connection(stream, router, cancel, peer));
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    router: Arc<IngestRouter>,
    cancel: CancellationToken,
    peer: SocketAddr,
) {
    let (reader, _writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(None) => break,
                    Ok(Some(payload)) => {
                        match serde_json::from_slice::<WriteFrame>(&payload) {
                            Ok(frame) => {
                                td_trace!(pipe, db = %frame.db, points = frame.points.len(), "frame decoded");
                                router.write_points(&frame.db, &frame.rp, frame.points).await;
                            }
                            Err(e) => td_warn!(conn, peer = %peer, error = %e, "frame decode error"),
                        }
                    }
                    Err(e) => {
                        td_warn!(conn, peer = %peer, error = %e, "connection read error");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    td_debug!(conn, peer = %peer, "connection closed");
}

/// Read a single length-prefixed frame: `[4B BE u32 len][payload]`.
///
/// Returns `Ok(None)` on clean EOF (connection closed).
async fn read_frame(reader: &mut (impl AsyncReadExt + Unpin)) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; frame_len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Encode one frame for the wire; used by tests and client tooling.
pub fn encode_frame(frame: &WriteFrame) -> anyhow::Result<Vec<u8>> {
    let payload = serde_json::to_vec(frame)?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
