//! Message channels: the send/receive surface of a streaming call.
//!
//! Handlers and stream interceptors only see `&mut dyn MessageChannel`.
//! Interceptors decorate a channel by wrapping it in another type that
//! implements [`MessageChannel`] and forwards to the inner one; see
//! [`ObservedChannel`].

use std::any::{Any, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::{CallEnvelope, SendHeaderError};
use crate::metadata::{Metadata, MetadataError};
use crate::status::Status;
use crate::transport::Inbound;

/// An opaque typed payload.
///
/// Implemented for every `'static` type that is `Debug + Send + Sync`.
pub trait Message: Any + fmt::Debug + Send + Sync {
    /// Borrow as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
    /// Mutably borrow as `Any` for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Convert into a boxed `Any`.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: Any + fmt::Debug + Send + Sync> Message for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// A boxed, type-erased message.
pub type BoxMessage = Box<dyn Message>;

impl dyn Message + '_ {
    /// Returns true if the payload is a `T`.
    pub fn is<T: Message>(&self) -> bool {
        Message::as_any(self).is::<T>()
    }

    /// Borrow the payload as a `T`.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        Message::as_any(self).downcast_ref::<T>()
    }

    /// Mutably borrow the payload as a `T`.
    pub fn downcast_mut<T: Message>(&mut self) -> Option<&mut T> {
        Message::as_any_mut(self).downcast_mut::<T>()
    }
}

/// Unbox a message as `T`, or fail the call with `Internal`.
pub fn downcast_message<T: Message>(message: BoxMessage) -> Result<T, Status> {
    if !(*message).is::<T>() {
        tracing::error!(expected = type_name::<T>(), got = ?message, "unexpected message type");
        return Err(Status::internal("unexpected message type"));
    }
    Message::into_any(message)
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| Status::internal("unexpected message type"))
}

/// Send/receive surface of one call.
///
/// `recv` returns `Ok(None)` at end of stream. Wrappers must pass `Ok(None)`
/// through unchanged and forward every method to the channel they wrap.
#[async_trait]
pub trait MessageChannel: Send {
    /// The call this channel belongs to.
    fn envelope(&self) -> &CallEnvelope;

    /// Send one message to the caller.
    async fn send(&mut self, message: BoxMessage) -> Result<(), Status>;

    /// Receive the next message from the caller.
    async fn recv(&mut self) -> Result<Option<BoxMessage>, Status>;

    /// Merge header metadata to go out with the first message.
    fn set_header(&mut self, metadata: Metadata) -> Result<(), MetadataError>;

    /// Merge header metadata and transmit it now.
    async fn send_header(&mut self, metadata: Metadata) -> Result<(), SendHeaderError>;

    /// Merge trailer metadata, sent when the call completes.
    fn set_trailer(&mut self, metadata: Metadata) -> Result<(), MetadataError>;
}

/// The channel the runtime builds for each admitted call.
#[derive(Debug)]
pub(crate) struct RawChannel {
    envelope: Arc<CallEnvelope>,
    inbound: mpsc::Receiver<Inbound>,
}

impl RawChannel {
    pub(crate) fn new(envelope: Arc<CallEnvelope>, inbound: mpsc::Receiver<Inbound>) -> Self {
        Self { envelope, inbound }
    }
}

#[async_trait]
impl MessageChannel for RawChannel {
    fn envelope(&self) -> &CallEnvelope {
        &self.envelope
    }

    async fn send(&mut self, message: BoxMessage) -> Result<(), Status> {
        self.envelope.send_message(message).await
    }

    async fn recv(&mut self) -> Result<Option<BoxMessage>, Status> {
        self.envelope.check_deadline()?;
        let next = match self.envelope.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, self.inbound.recv())
                .await
                .map_err(|_| Status::deadline_exceeded("deadline exceeded"))?,
            None => self.inbound.recv().await,
        };
        match next {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(status)) => Err(status),
            // The request queue also closes when the caller drops the whole
            // call; only a live response queue means a clean end of stream.
            None if self.envelope.peer_gone() => Err(Status::cancelled("peer went away")),
            None => Ok(None),
        }
    }

    fn set_header(&mut self, metadata: Metadata) -> Result<(), MetadataError> {
        self.envelope.set_header(metadata)
    }

    async fn send_header(&mut self, metadata: Metadata) -> Result<(), SendHeaderError> {
        self.envelope.send_header(metadata).await
    }

    fn set_trailer(&mut self, metadata: Metadata) -> Result<(), MetadataError> {
        self.envelope.set_trailer(metadata)
    }
}

/// Hooks run by [`ObservedChannel`] for every message crossing it.
pub trait ChannelObserver: Send + Sync {
    /// Called after a message was received, before the handler sees it.
    fn on_recv(&self, _call: &CallEnvelope, _message: &dyn Message) {}

    /// Called before a message is handed to the inner channel.
    fn on_send(&self, _call: &CallEnvelope, _message: &dyn Message) {}
}

/// Decorator that runs a [`ChannelObserver`] around an inner channel.
pub struct ObservedChannel<'a, O> {
    inner: &'a mut dyn MessageChannel,
    observer: &'a O,
}

impl<'a, O: ChannelObserver> ObservedChannel<'a, O> {
    /// Wrap `inner`.
    pub fn new(inner: &'a mut dyn MessageChannel, observer: &'a O) -> Self {
        Self { inner, observer }
    }
}

impl<O> fmt::Debug for ObservedChannel<'_, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedChannel")
            .field("method", &self.inner.envelope().method())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<'a, O: ChannelObserver> MessageChannel for ObservedChannel<'a, O> {
    fn envelope(&self) -> &CallEnvelope {
        self.inner.envelope()
    }

    async fn send(&mut self, message: BoxMessage) -> Result<(), Status> {
        self.observer.on_send(self.inner.envelope(), &*message);
        self.inner.send(message).await
    }

    async fn recv(&mut self) -> Result<Option<BoxMessage>, Status> {
        let received = self.inner.recv().await?;
        if let Some(message) = &received {
            self.observer.on_recv(self.inner.envelope(), &**message);
        }
        Ok(received)
    }

    fn set_header(&mut self, metadata: Metadata) -> Result<(), MetadataError> {
        self.inner.set_header(metadata)
    }

    async fn send_header(&mut self, metadata: Metadata) -> Result<(), SendHeaderError> {
        self.inner.send_header(metadata).await
    }

    fn set_trailer(&mut self, metadata: Metadata) -> Result<(), MetadataError> {
        self.inner.set_trailer(metadata)
    }
}

/// Send half handed to server-streaming handlers.
pub struct ServerStream<'a, T> {
    channel: &'a mut dyn MessageChannel,
    _marker: PhantomData<fn(T)>,
}

impl<'a, T: Message> ServerStream<'a, T> {
    /// Wrap a channel.
    pub fn new(channel: &'a mut dyn MessageChannel) -> Self {
        Self {
            channel,
            _marker: PhantomData,
        }
    }

    /// The call this stream belongs to.
    pub fn envelope(&self) -> &CallEnvelope {
        self.channel.envelope()
    }

    /// Send one response.
    pub async fn send(&mut self, message: T) -> Result<(), Status> {
        self.channel.send(Box::new(message)).await
    }

    /// See [`MessageChannel::set_header`].
    pub fn set_header(&mut self, metadata: Metadata) -> Result<(), MetadataError> {
        self.channel.set_header(metadata)
    }

    /// See [`MessageChannel::send_header`].
    pub async fn send_header(&mut self, metadata: Metadata) -> Result<(), SendHeaderError> {
        self.channel.send_header(metadata).await
    }

    /// See [`MessageChannel::set_trailer`].
    pub fn set_trailer(&mut self, metadata: Metadata) -> Result<(), MetadataError> {
        self.channel.set_trailer(metadata)
    }
}

/// Receive half handed to client-streaming handlers.
pub struct ClientStream<'a, T> {
    channel: &'a mut dyn MessageChannel,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Message> ClientStream<'a, T> {
    /// Wrap a channel.
    pub fn new(channel: &'a mut dyn MessageChannel) -> Self {
        Self {
            channel,
            _marker: PhantomData,
        }
    }

    /// The call this stream belongs to.
    pub fn envelope(&self) -> &CallEnvelope {
        self.channel.envelope()
    }

    /// Next request, or `Ok(None)` at end of stream.
    pub async fn recv(&mut self) -> Result<Option<T>, Status> {
        match self.channel.recv().await? {
            Some(message) => downcast_message(message).map(Some),
            None => Ok(None),
        }
    }

    /// See [`MessageChannel::set_header`].
    pub fn set_header(&mut self, metadata: Metadata) -> Result<(), MetadataError> {
        self.channel.set_header(metadata)
    }

    /// See [`MessageChannel::set_trailer`].
    pub fn set_trailer(&mut self, metadata: Metadata) -> Result<(), MetadataError> {
        self.channel.set_trailer(metadata)
    }
}

/// Both halves, handed to bidirectional handlers.
pub struct BidiStream<'a, Req, Resp> {
    channel: &'a mut dyn MessageChannel,
    _marker: PhantomData<fn(Resp) -> Req>,
}

impl<'a, Req: Message, Resp: Message> BidiStream<'a, Req, Resp> {
    /// Wrap a channel.
    pub fn new(channel: &'a mut dyn MessageChannel) -> Self {
        Self {
            channel,
            _marker: PhantomData,
        }
    }

    /// The call this stream belongs to.
    pub fn envelope(&self) -> &CallEnvelope {
        self.channel.envelope()
    }

    /// Next request, or `Ok(None)` at end of stream.
    pub async fn recv(&mut self) -> Result<Option<Req>, Status> {
        match self.channel.recv().await? {
            Some(message) => downcast_message(message).map(Some),
            None => Ok(None),
        }
    }

    /// Send one response.
    pub async fn send(&mut self, message: Resp) -> Result<(), Status> {
        self.channel.send(Box::new(message)).await
    }

    /// See [`MessageChannel::set_header`].
    pub fn set_header(&mut self, metadata: Metadata) -> Result<(), MetadataError> {
        self.channel.set_header(metadata)
    }

    /// See [`MessageChannel::send_header`].
    pub async fn send_header(&mut self, metadata: Metadata) -> Result<(), SendHeaderError> {
        self.channel.send_header(metadata).await
    }

    /// See [`MessageChannel::set_trailer`].
    pub fn set_trailer(&mut self, metadata: Metadata) -> Result<(), MetadataError> {
        self.channel.set_trailer(metadata)
    }
}

macro_rules! impl_stream_debug {
    ($name:ident < $($param:ident),+ >) => {
        impl<$($param),+> fmt::Debug for $name<'_, $($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("method", &self.channel.envelope().method())
                    .finish_non_exhaustive()
            }
        }
    };
}

impl_stream_debug!(ServerStream<T>);
impl_stream_debug!(ClientStream<T>);
impl_stream_debug!(BidiStream<Req, Resp>);
