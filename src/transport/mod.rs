//! Transport boundary: the outbound half of a bidirectional frame stream.
//!
//! The gateway never touches sockets directly. It holds each connection's
//! [`Transport`] and only ever calls [`Transport::send`] and
//! [`Transport::close`]. The inbound half is whatever read loop feeds frames
//! into [`Gateway::handle_frame`](crate::gateway::Gateway::handle_frame).
//!
//! [`ChannelTransport`] is the stock implementation: frames are queued onto a
//! bounded Tokio channel and a writer task (see [`tcp::split`]) drains the
//! queue onto the socket.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::frame::{DEFAULT_MAX_FRAME_SIZE, Frame, FrameError};

pub mod tcp;

pub use tcp::{FrameReader, ReadError};

/// A boxed, `Send` future borrowing from `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// I/O-level failures reported by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("transport operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame rejected: {0}")]
    Frame(#[from] FrameError),
}

/// The outbound side of one connection.
///
/// # Contract
///
/// - Frames passed to `send` on the same transport are delivered in call order.
/// - After `close` resolves, every further `send` fails with
///   [`TransportError::Closed`].
/// - `close` is idempotent.
pub trait Transport: Send + Sync + 'static {
    /// Queues `frame` for delivery.
    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Closes the transport, sending a close frame when still possible.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// A [`Transport`] backed by a bounded Tokio channel.
///
/// # Examples
///
/// ```
/// use rtgate::frame::Frame;
/// use rtgate::transport::{ChannelTransport, Transport};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (transport, mut rx) = ChannelTransport::pair(8);
/// transport.send(Frame::Text("hi".into())).await.unwrap();
/// assert_eq!(rx.recv().await, Some(Frame::Text("hi".into())));
/// # }
/// ```
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Frame>,
    closing: AtomicBool,
    closed: CancellationToken,
    max_frame_size: usize,
}

impl ChannelTransport {
    /// Creates a transport and the receiving end its frames are delivered to.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                closing: AtomicBool::new(false),
                closed: CancellationToken::new(),
                max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            },
            rx,
        )
    }

    /// Rejects outbound frames whose payload exceeds `max_frame_size`.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// A token cancelled as soon as [`Transport::close`] is called, even when
    /// the queue is too full to take the close frame.
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Returns `true` once [`Transport::close`] has been called or the
    /// receiving end has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Err(TransportError::Closed);
            }
            frame.check_size(self.max_frame_size)?;
            // A sender parked on a full queue is released by `close`.
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => Err(TransportError::Closed),
                sent = self.tx.send(frame) => sent.map_err(|_| TransportError::Closed),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closing.swap(true, Ordering::AcqRel) {
                return;
            }
            // Best-effort: a full queue or a vanished peer drops the close frame,
            // and the cancelled token still tells the writer to stop.
            let _ = self.tx.try_send(Frame::Close);
            self.closed.cancel();
        })
    }
}
