//! TCP plumbing shared by the server and the client connector.
//!
//! A [`TcpStream`] is split in two: the write half is driven by a writer task
//! draining a [`ChannelTransport`] queue, and the read half is wrapped in a
//! [`FrameReader`] that yields frames in arrival order.

use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::ChannelTransport;
use crate::frame::{Frame, FrameError};

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// How long a closed transport keeps flushing queued frames before the
/// socket is dropped regardless.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Errors produced while reading frames off a socket.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("peer closed the connection mid-frame")]
    UnexpectedEof,
}

/// Reads length-prefixed frames from the read half of a TCP stream.
pub struct FrameReader {
    read: OwnedReadHalf,
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameReader {
    pub fn new(read: OwnedReadHalf, max_frame_size: usize) -> Self {
        Self {
            read,
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
            max_frame_size,
        }
    }

    /// Returns the next frame, or `None` when the peer closed cleanly between
    /// frames.
    ///
    /// Cancel-safe: bytes read before cancellation stay buffered.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ReadError> {
        loop {
            match Frame::decode(&mut self.buf, self.max_frame_size) {
                Ok(frame) => return Ok(Some(frame)),
                Err(FrameError::Incomplete) => {}
                Err(e) => return Err(e.into()),
            }

            if self.read.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ReadError::UnexpectedEof)
                };
            }
        }
    }
}

/// Splits `stream` into a queued transport, a frame reader, and the writer
/// task that drains the queue onto the socket.
///
/// The writer task exits after writing a [`Frame::Close`], when every
/// transport handle is dropped, or on the first write error. Once the
/// transport is closed the writer gets [`CLOSE_GRACE`] to flush what is
/// queued; a peer that is not reading loses the rest and the socket is
/// dropped. Awaiting its handle is how a read loop learns that the outbound
/// side is gone.
pub fn split(
    stream: TcpStream,
    queue_capacity: usize,
    max_frame_size: usize,
) -> (ChannelTransport, FrameReader, JoinHandle<()>) {
    let (read, write) = stream.into_split();
    let (transport, rx) = ChannelTransport::pair(queue_capacity);
    let transport = transport.with_max_frame_size(max_frame_size);
    let writer = tokio::spawn(write_frames(write, rx, transport.close_signal()));
    (transport, FrameReader::new(read, max_frame_size), writer)
}

async fn write_frames(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    let flushed = tokio::select! {
        biased;
        flushed = drain(&mut write, &mut rx) => flushed,
        _ = async {
            closed.cancelled().await;
            sleep(CLOSE_GRACE).await;
        } => {
            debug!("peer is not draining, abandoning queued frames");
            false
        }
    };
    if flushed {
        let _ = tokio::time::timeout(CLOSE_GRACE, write.shutdown()).await;
    }
}

// Writes queued frames until a close frame or the end of the queue. Returns
// `false` if the socket failed.
async fn drain(write: &mut OwnedWriteHalf, rx: &mut mpsc::Receiver<Frame>) -> bool {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    while let Some(frame) = rx.recv().await {
        let is_close = frame == Frame::Close;
        if let Err(e) = frame.encode(&mut buf) {
            warn!(error = %e, "dropping unencodable frame");
            continue;
        }
        trace!(opcode = %frame.opcode(), len = buf.len(), "writing frame");
        if let Err(e) = write_all(write, &mut buf).await {
            debug!(error = %e, "write failed, stopping writer");
            return false;
        }
        if is_close {
            break;
        }
    }
    true
}

async fn write_all(write: &mut OwnedWriteHalf, buf: &mut BytesMut) -> std::io::Result<()> {
    write.write_all(buf).await?;
    write.flush().await?;
    buf.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DEFAULT_MAX_FRAME_SIZE;
    use crate::transport::Transport;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn frames_cross_the_socket_in_order() {
        let (a, b) = socket_pair().await;
        let (transport, _reader_a, _writer) = split(a, 8, DEFAULT_MAX_FRAME_SIZE);
        let (_transport_b, mut reader_b, _writer_b) = split(b, 8, DEFAULT_MAX_FRAME_SIZE);

        transport.send(Frame::Text("one".into())).await.unwrap();
        transport
            .send(Frame::Binary(Bytes::from_static(&[0, 1, 2])))
            .await
            .unwrap();

        assert_eq!(
            reader_b.next_frame().await.unwrap(),
            Some(Frame::Text("one".into()))
        );
        assert_eq!(
            reader_b.next_frame().await.unwrap(),
            Some(Frame::Binary(Bytes::from_static(&[0, 1, 2])))
        );
    }

    #[tokio::test]
    async fn close_ends_writer_and_peer_sees_close_then_eof() {
        let (a, b) = socket_pair().await;
        let (transport, _reader_a, writer) = split(a, 8, DEFAULT_MAX_FRAME_SIZE);
        let (_transport_b, mut reader_b, _writer_b) = split(b, 8, DEFAULT_MAX_FRAME_SIZE);

        transport.close().await;
        writer.await.unwrap();

        assert_eq!(reader_b.next_frame().await.unwrap(), Some(Frame::Close));
        assert_eq!(reader_b.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_releases_writer_when_peer_never_reads() {
        let (a, _silent_peer) = socket_pair().await;
        let (transport, _reader, writer) = split(a, 2, DEFAULT_MAX_FRAME_SIZE);
        let transport = Arc::new(transport);

        // Fill the socket buffers and the queue until sends block.
        let flooder = Arc::clone(&transport);
        let flood = tokio::spawn(async move {
            let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
            let mut queued = 0usize;
            while flooder.send(Frame::Binary(chunk.clone())).await.is_ok() {
                queued += 1;
            }
            queued
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        transport.close().await;
        timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer still running after close")
            .unwrap();
        let queued = timeout(Duration::from_secs(5), flood)
            .await
            .expect("sender still blocked after close")
            .unwrap();
        assert!(queued > 0);
    }

    #[tokio::test]
    async fn garbage_is_a_frame_error() {
        let (mut a, b) = socket_pair().await;
        let (_transport_b, mut reader_b, _writer_b) = split(b, 8, DEFAULT_MAX_FRAME_SIZE);

        a.write_all(&[0x7f, 0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            reader_b.next_frame().await,
            Err(ReadError::Frame(FrameError::UnknownOpcode(0x7f)))
        ));
    }
}
