//! In-process transport between callers and the server runtime.
//!
//! A [`Listener`] hands the runtime a stream of [`IncomingCall`]s. Each call
//! carries its own inbound message queue and outbound [`Frame`] queue, so a
//! caller only ever sees frames for the call it opened. [`memory`] builds a
//! listener and a matching [`Connector`] backed by tokio channels; the gRPC
//! bridge and the tests both open calls through a `Connector`.

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channel::{BoxMessage, Message, downcast_message};
use crate::metadata::Metadata;
use crate::status::Status;

/// One unit of server-to-caller traffic on a call.
pub enum Frame {
    /// Header metadata; always precedes the first message.
    Header(Metadata),
    /// A response message.
    Message(BoxMessage),
    /// Trailer metadata plus the terminal status (`None` means OK).
    Trailer {
        /// Trailer metadata.
        metadata: Metadata,
        /// Terminal error, if the call failed.
        status: Option<Status>,
    },
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Header(md) => f.debug_tuple("Header").field(md).finish(),
            Frame::Message(msg) => f.debug_tuple("Message").field(msg).finish(),
            Frame::Trailer { metadata, status } => f
                .debug_struct("Trailer")
                .field("metadata", metadata)
                .field("status", status)
                .finish(),
        }
    }
}

/// Request-side queue item: a message, or a transport error from the caller.
pub type Inbound = Result<BoxMessage, Status>;

/// A call the runtime has not yet admitted.
#[derive(Debug)]
pub struct IncomingCall {
    pub(crate) method: String,
    pub(crate) metadata: Metadata,
    pub(crate) deadline: Option<Instant>,
    pub(crate) inbound: mpsc::Receiver<Inbound>,
    pub(crate) outbound: mpsc::Sender<Frame>,
}

impl IncomingCall {
    /// The full method identifier, e.g. `/myapp.GreetingService/Hello`.
    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Source of incoming calls.
///
/// `accept` must be cancel-safe: the runtime drops a pending `accept` future
/// when it begins draining.
#[async_trait]
pub trait Listener: Send + 'static {
    /// Wait for the next call. `None` means no more calls will arrive.
    async fn accept(&mut self) -> Option<IncomingCall>;
}

/// Listener half of an in-process transport.
#[derive(Debug)]
pub struct MemoryListener {
    rx: mpsc::Receiver<IncomingCall>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Option<IncomingCall> {
        self.rx.recv().await
    }
}

/// Caller half of an in-process transport.
#[derive(Debug, Clone)]
pub struct Connector {
    tx: mpsc::Sender<IncomingCall>,
    capacity: usize,
}

/// Create an in-process transport.
///
/// `capacity` bounds the accept queue and each call's message queues.
pub fn memory(capacity: usize) -> (MemoryListener, Connector) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (MemoryListener { rx }, Connector { tx, capacity })
}

impl Connector {
    /// Open a call without a deadline.
    pub async fn call(
        &self,
        method: impl Into<String>,
        metadata: Metadata,
    ) -> Result<ClientCall, Status> {
        self.open(method.into(), metadata, None).await
    }

    /// Open a call that must finish before `deadline`.
    pub async fn call_with_deadline(
        &self,
        method: impl Into<String>,
        metadata: Metadata,
        deadline: Instant,
    ) -> Result<ClientCall, Status> {
        self.open(method.into(), metadata, Some(deadline)).await
    }

    async fn open(
        &self,
        method: String,
        metadata: Metadata,
        deadline: Option<Instant>,
    ) -> Result<ClientCall, Status> {
        let (in_tx, in_rx) = mpsc::channel(self.capacity);
        let (out_tx, out_rx) = mpsc::channel(self.capacity);
        let call = IncomingCall {
            method,
            metadata,
            deadline,
            inbound: in_rx,
            outbound: out_tx,
        };
        self.tx
            .send(call)
            .await
            .map_err(|_| Status::unavailable("server is not accepting calls"))?;
        Ok(ClientCall {
            requests: Some(in_tx),
            frames: out_rx,
            header: None,
            buffered: VecDeque::new(),
            trailer: None,
            status: None,
        })
    }
}

/// Caller side of one open call.
#[derive(Debug)]
pub struct ClientCall {
    requests: Option<mpsc::Sender<Inbound>>,
    frames: mpsc::Receiver<Frame>,
    header: Option<Metadata>,
    buffered: VecDeque<BoxMessage>,
    trailer: Option<Metadata>,
    status: Option<Status>,
}

impl ClientCall {
    /// Send one request message.
    pub async fn send<T: Message>(&mut self, message: T) -> Result<(), Status> {
        self.push(Ok(Box::new(message))).await
    }

    /// Fail the request stream with a caller-side error.
    pub async fn send_error(&mut self, status: Status) -> Result<(), Status> {
        self.push(Err(status)).await
    }

    async fn push(&mut self, item: Inbound) -> Result<(), Status> {
        let Some(requests) = &self.requests else {
            return Err(Status::internal("request stream already closed"));
        };
        push_request(requests, item).await
    }

    /// Signal end of the request stream.
    pub fn close_send(&mut self) {
        self.requests = None;
    }

    /// Detach the request half so it can be driven from another task.
    ///
    /// Afterwards `send` on this call fails; dropping the returned sender
    /// ends the request stream.
    pub fn take_sender(&mut self) -> Option<RequestSender> {
        self.requests.take().map(|tx| RequestSender { tx })
    }

    /// Next raw frame, or `None` once the server side is gone.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Wait for header metadata. `None` if the call ended without one.
    pub async fn header(&mut self) -> Option<&Metadata> {
        while self.header.is_none() && self.trailer.is_none() {
            if !self.pump().await {
                break;
            }
        }
        self.header.as_ref()
    }

    /// Next response message; `Ok(None)` once the call completed successfully.
    pub async fn message<T: Message>(&mut self) -> Result<Option<T>, Status> {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return downcast_message(message).map(Some);
            }
            if self.trailer.is_some() || !self.pump().await {
                return match self.status.clone() {
                    Some(status) => Err(status),
                    None => Ok(None),
                };
            }
        }
    }

    /// Trailer metadata, available once the call completed.
    pub fn trailer(&self) -> Option<&Metadata> {
        self.trailer.as_ref()
    }

    /// Collect everything left on the call.
    pub async fn finish(mut self) -> CallOutcome {
        self.close_send();
        while self.pump().await {}
        CallOutcome {
            header: self.header,
            messages: self.buffered.into_iter().collect(),
            trailer: self.trailer.unwrap_or_default(),
            status: self.status,
        }
    }

    /// Read one frame into local state. Returns false when nothing more
    /// will arrive.
    async fn pump(&mut self) -> bool {
        if self.trailer.is_some() {
            return false;
        }
        match self.frames.recv().await {
            Some(Frame::Header(md)) => {
                self.header = Some(md);
                true
            }
            Some(Frame::Message(message)) => {
                self.buffered.push_back(message);
                true
            }
            Some(Frame::Trailer { metadata, status }) => {
                self.trailer = Some(metadata);
                self.status = status;
                false
            }
            None => {
                self.trailer = Some(Metadata::new());
                self.status = Some(Status::unavailable("call dropped before completion"));
                false
            }
        }
    }
}

async fn push_request(tx: &mpsc::Sender<Inbound>, item: Inbound) -> Result<(), Status> {
    tx.send(item)
        .await
        .map_err(|_| Status::cancelled("server closed the request stream"))
}

/// Request half detached from a [`ClientCall`].
#[derive(Debug)]
pub struct RequestSender {
    tx: mpsc::Sender<Inbound>,
}

impl RequestSender {
    /// Send one request message.
    pub async fn send<T: Message>(&self, message: T) -> Result<(), Status> {
        push_request(&self.tx, Ok(Box::new(message))).await
    }

    /// Fail the request stream with a caller-side error.
    pub async fn send_error(&self, status: Status) -> Result<(), Status> {
        push_request(&self.tx, Err(status)).await
    }
}

/// Everything a caller observed on a completed call.
#[derive(Debug)]
pub struct CallOutcome {
    /// Header metadata, if any was sent.
    pub header: Option<Metadata>,
    /// Response messages in arrival order.
    pub messages: Vec<BoxMessage>,
    /// Trailer metadata.
    pub trailer: Metadata,
    /// Terminal error; `None` means the call succeeded.
    pub status: Option<Status>,
}

impl CallOutcome {
    /// Downcast every message to `T`.
    pub fn into_messages<T: Message>(self) -> Result<Vec<T>, Status> {
        self.messages.into_iter().map(downcast_message).collect()
    }
}
