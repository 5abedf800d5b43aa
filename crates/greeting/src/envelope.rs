//! Per-call context: method, shape, metadata slots and the outbound sink.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channel::BoxMessage;
use crate::metadata::{HeaderSlot, Metadata, MetadataError, TrailerSlot};
use crate::status::Status;
use crate::transport::Frame;

/// The four interaction shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// One request, one response.
    Unary,
    /// One request, many responses.
    ServerStream,
    /// Many requests, one response.
    ClientStream,
    /// Many requests, many responses, interleaved.
    BidiStream,
}

impl Shape {
    /// Whether the caller sends a stream of requests.
    pub fn is_client_streaming(self) -> bool {
        matches!(self, Shape::ClientStream | Shape::BidiStream)
    }

    /// Whether the server sends a stream of responses.
    pub fn is_server_streaming(self) -> bool {
        matches!(self, Shape::ServerStream | Shape::BidiStream)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Shape::Unary => "unary",
            Shape::ServerStream => "server_stream",
            Shape::ClientStream => "client_stream",
            Shape::BidiStream => "bidi_stream",
        })
    }
}

/// Failure of an immediate header flush.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendHeaderError {
    /// The header slot no longer accepts metadata.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// The header could not be transmitted.
    #[error(transparent)]
    Transport(#[from] Status),
}

impl From<SendHeaderError> for Status {
    fn from(err: SendHeaderError) -> Self {
        match err {
            SendHeaderError::Metadata(err) => err.into(),
            SendHeaderError::Transport(status) => status,
        }
    }
}

/// One logical call.
///
/// The header slot accepts [`set_header`](Self::set_header) merges until the
/// header goes out, either explicitly through
/// [`send_header`](Self::send_header) or implicitly with the first response
/// message. The trailer slot stays open until the call completes.
pub struct CallEnvelope {
    method: String,
    shape: Shape,
    incoming: Metadata,
    deadline: Option<Instant>,
    header: Mutex<HeaderSlot>,
    trailer: Mutex<TrailerSlot>,
    outbound: mpsc::Sender<Frame>,
}

impl fmt::Debug for CallEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallEnvelope")
            .field("method", &self.method)
            .field("shape", &self.shape)
            .field("incoming", &self.incoming)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CallEnvelope {
    pub(crate) fn new(
        method: String,
        shape: Shape,
        incoming: Metadata,
        deadline: Option<Instant>,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            method,
            shape,
            incoming,
            deadline,
            header: Mutex::new(HeaderSlot::Pending(Metadata::new())),
            trailer: Mutex::new(TrailerSlot::Open(Metadata::new())),
            outbound,
        }
    }

    /// Full method identifier.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Interaction shape.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Metadata sent by the caller.
    pub fn incoming(&self) -> &Metadata {
        &self.incoming
    }

    /// When the call must be finished by, if the caller set a deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether header metadata has been transmitted.
    pub fn header_sent(&self) -> bool {
        lock(&self.header).is_sent()
    }

    /// Merge header metadata for later transmission.
    pub fn set_header(&self, metadata: Metadata) -> Result<(), MetadataError> {
        lock(&self.header).merge(metadata)
    }

    /// Merge header metadata and transmit the header immediately.
    pub async fn send_header(&self, metadata: Metadata) -> Result<(), SendHeaderError> {
        let header = {
            let mut slot = lock(&self.header);
            slot.merge(metadata)?;
            slot.take().ok_or(MetadataError::AlreadySent)?
        };
        Ok(self.transmit(Frame::Header(header)).await?)
    }

    /// Merge trailer metadata, sent when the call completes.
    pub fn set_trailer(&self, metadata: Metadata) -> Result<(), MetadataError> {
        lock(&self.trailer).merge(metadata)
    }

    pub(crate) fn check_deadline(&self) -> Result<(), Status> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(Status::deadline_exceeded("deadline exceeded"))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn peer_gone(&self) -> bool {
        self.outbound.is_closed()
    }

    pub(crate) async fn send_message(&self, message: BoxMessage) -> Result<(), Status> {
        let header = lock(&self.header).take();
        if let Some(header) = header {
            self.transmit(Frame::Header(header)).await?;
        }
        self.transmit(Frame::Message(message)).await
    }

    async fn transmit(&self, frame: Frame) -> Result<(), Status> {
        self.check_deadline()?;
        let sent = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.outbound.send(frame))
                .await
                .map_err(|_| Status::deadline_exceeded("deadline exceeded"))?,
            None => self.outbound.send(frame).await,
        };
        sent.map_err(|_| Status::cancelled("peer went away"))
    }

    /// Send any pending header, then the trailer and terminal status.
    pub(crate) async fn complete(&self, status: Option<Status>) {
        let header = lock(&self.header).take();
        let trailer = lock(&self.trailer).close();
        if let Some(header) = header
            && self.outbound.send(Frame::Header(header)).await.is_err()
        {
            tracing::debug!(method = %self.method, "peer gone before completion");
            return;
        }
        let frame = Frame::Trailer {
            metadata: trailer,
            status,
        };
        if self.outbound.send(frame).await.is_err() {
            tracing::debug!(method = %self.method, "peer gone before trailer");
        }
    }
}
