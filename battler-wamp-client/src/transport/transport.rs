use std::fmt::Debug;

use futures_util::{
    StreamExt,
    stream::BoxStream,
};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    core::close::{
        CloseCode,
        CloseInfo,
    },
    message::message::Message,
    serializer::serializer::Serializer,
};

/// An event produced by an open [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport is connected and ready to carry messages.
    Open,
    /// A message was received.
    Message(Message),
    /// The transport failed. No more events follow.
    Error(String),
    /// The transport closed. No more events follow.
    Close(CloseInfo),
}

/// The sequence of events produced by a [`Transport`], starting when it is opened.
pub type TransportEventStream = BoxStream<'static, TransportEvent>;

/// An error for sending a message over a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,
    #[error("transport is closed")]
    Closed,
    #[error("failed to serialize {message}: {error}")]
    Serialization {
        message: &'static str,
        error: anyhow::Error,
    },
}

/// A transport, over which WAMP messages can be sent and received.
///
/// Sending is synchronous: messages are serialized immediately, so serialization failures are
/// reported to the sender, and queued for delivery in order.
pub trait Transport: Send + Sync + Debug {
    /// The name of the transport, for logging.
    fn name(&self) -> &str;

    /// Opens the transport to the given endpoint.
    ///
    /// Connecting happens in the background. The returned stream reports [`TransportEvent::Open`]
    /// once connected, then every message received, and ends after the first
    /// [`TransportEvent::Error`] or [`TransportEvent::Close`].
    fn open(&mut self, endpoint: &str) -> TransportEventStream;

    /// Sends a message.
    fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Closes the transport.
    ///
    /// A [`TransportEvent::Close`] event is reported for the given code and reason.
    fn close(&self, code: CloseCode, reason: &str);
}

/// A factory for creating a new [`Transport`].
pub trait TransportFactory: Send + Sync {
    /// Creates a new [`Transport`] for WAMP messaging, using the given serializer for every
    /// message.
    fn new_transport(&self, serializer: Box<dyn Serializer>) -> Box<dyn Transport>;
}

/// Turns a channel of events into a [`TransportEventStream`] that ends after the first terminal
/// event.
pub(crate) fn event_stream(events: UnboundedReceiver<TransportEvent>) -> TransportEventStream {
    futures_util::stream::unfold(Some(events), |events| async move {
        let mut events = events?;
        let event = events.recv().await?;
        let terminal = matches!(event, TransportEvent::Error(_) | TransportEvent::Close(_));
        Some((event, (!terminal).then_some(events)))
    })
    .boxed()
}

/// The close event reported when a transport is closed locally.
pub(crate) fn local_close(code: CloseCode, reason: &str) -> TransportEvent {
    TransportEvent::Close(CloseInfo {
        code,
        reason: reason.to_owned(),
        was_clean: code == CloseCode::NORMAL,
    })
}
