//! TCP transport: length-prefixed frames and per-peer connection handles.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! JSON (one [`Envelope`]). A [`PeerConnection`] owns the write half through a
//! bounded queue drained by a writer task; the read half is handed back as a
//! [`FrameReader`] for the node's read loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::MeshError;
use crate::identity::split_endpoint;
use crate::message::Envelope;

/// Size of the frame length header.
pub const FRAME_HEADER_LEN: usize = 4;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Which end opened a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Write one frame: length header followed by `body`.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), MeshError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| MeshError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame body.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary. A header
/// announcing more than `max` bytes fails with [`MeshError::FrameTooLarge`]
/// without reading the body.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, MeshError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max {
        return Err(MeshError::FrameTooLarge { len, max });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// A handle to one open transport.
///
/// Cheap to clone; every clone feeds the same writer task. Sends never block:
/// when the queue is full the message is dropped and an error returned.
#[derive(Clone)]
pub struct PeerConnection {
    conn_id: u64,
    remote_addr: SocketAddr,
    direction: Direction,
    outbox: mpsc::Sender<Vec<u8>>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl PeerConnection {
    /// Process-unique id of this transport.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Socket address of the remote end.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether we dialed this transport or accepted it.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Queue an envelope for transmission.
    pub fn send(&self, envelope: &Envelope) -> Result<(), MeshError> {
        let bytes = envelope.to_bytes()?;
        self.outbox
            .try_send(bytes)
            .map_err(|e| MeshError::SendFailed(format!("{}: {e}", self.remote_addr)))
    }

    /// Force-close the transport. Idempotent.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// A receiver that observes [`close`](Self::close).
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("conn_id", &self.conn_id)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The read half of a transport.
pub struct FrameReader {
    reader: OwnedReadHalf,
    max_frame_bytes: usize,
}

impl FrameReader {
    /// Read the next frame body; `None` at end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, MeshError> {
        read_frame(&mut self.reader, self.max_frame_bytes).await
    }
}

/// Resolve once `rx` reports the transport closed (or its sender is gone).
pub async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Take ownership of a connected stream.
///
/// Spawns the writer task and returns the shareable handle plus the read half.
pub fn open(
    stream: TcpStream,
    direction: Direction,
    queue: usize,
    max_frame_bytes: usize,
) -> Result<(PeerConnection, FrameReader), MeshError> {
    let remote_addr = stream.peer_addr()?;
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();

    let (outbox, mut rx) = mpsc::channel::<Vec<u8>>(queue.max(1));
    let (close_tx, mut close_rx) = watch::channel(false);
    let close_tx = Arc::new(close_tx);
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

    let writer_close = Arc::clone(&close_tx);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = closed(&mut close_rx) => break,
                msg = rx.recv() => {
                    let Some(bytes) = msg else { break };
                    if let Err(e) = write_frame(&mut writer, &bytes).await {
                        debug!("Write to {remote_addr} failed: {e}");
                        break;
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
        writer_close.send_replace(true);
        trace!("Writer for {remote_addr} (conn {conn_id}) exited");
    });

    let conn = PeerConnection {
        conn_id,
        remote_addr,
        direction,
        outbox,
        close_tx,
    };
    let reader = FrameReader {
        reader,
        max_frame_bytes,
    };
    Ok((conn, reader))
}

/// Open an outbound TCP connection to `endpoint` (`host:port`).
pub async fn dial(endpoint: &str, timeout: Duration) -> Result<TcpStream, MeshError> {
    if split_endpoint(endpoint).is_none() {
        return Err(MeshError::InvalidEndpoint(endpoint.to_string()));
    }

    match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
        Err(_) => Err(MeshError::Timeout(timeout)),
        Ok(Err(source)) => Err(MeshError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            source,
        }),
        Ok(Ok(stream)) => Ok(stream),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::message::MessageKind;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"{\"k\":1}").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b, 64).await.unwrap().unwrap(), b"{\"k\":1}");
        assert_eq!(read_frame(&mut b, 64).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut b, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[b'x'; 100]).await.unwrap();

        match read_frame(&mut b, 10).await {
            Err(MeshError::FrameTooLarge { len, max }) => {
                assert_eq!(len, 100);
                assert_eq!(max, 10);
            }
            other => panic!("Expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_body_is_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        assert!(read_frame(&mut b, 64).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_invalid_endpoint() {
        let result = dial("no-port-here", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(MeshError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = dial(&addr.to_string(), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(MeshError::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn test_connection_send_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = dial(&addr.to_string(), Duration::from_secs(2)).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (client_conn, _client_reader) = open(client, Direction::Outbound, 8, 1024).unwrap();
        let (server_conn, mut server_reader) = open(server, Direction::Inbound, 8, 1024).unwrap();
        assert_eq!(client_conn.direction(), Direction::Outbound);
        assert_eq!(server_conn.direction(), Direction::Inbound);
        assert_ne!(client_conn.conn_id(), server_conn.conn_id());

        let envelope = Envelope::new(NodeId::generate(), MessageKind::Heartbeat, "");
        client_conn.send(&envelope).unwrap();

        let frame = server_reader.next_frame().await.unwrap().unwrap();
        assert_eq!(Envelope::from_slice(&frame).unwrap(), envelope);

        // Closing shuts the write half, so the server sees end of stream.
        client_conn.close();
        assert!(client_conn.is_closed());
        let next = tokio::time::timeout(Duration::from_secs(2), server_reader.next_frame())
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_none());

        let mut signal = client_conn.close_signal();
        closed(&mut signal).await;
    }
}
