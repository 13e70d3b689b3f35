use std::sync::{
    Arc,
    atomic::{
        AtomicBool,
        Ordering,
    },
};

use anyhow::{
    Error,
    Result,
};
use log::warn;
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded_channel,
};

use crate::{
    core::close::{
        CloseCode,
        CloseInfo,
    },
    message::message::Message,
    serializer::serializer::Serializer,
    transport::transport::{
        Transport,
        TransportError,
        TransportEvent,
        TransportEventStream,
        TransportFactory,
        event_stream,
        local_close,
    },
};

#[derive(Debug)]
enum DirectFrame {
    Message(Vec<u8>),
    Close(CloseInfo),
}

/// A transport that connects directly to an in-process router, which receives the other end as
/// a [`DirectEndpoint`].
///
/// Every message still crosses the serializer in both directions.
#[derive(Debug)]
pub struct DirectTransport {
    serializer: Arc<dyn Serializer>,
    endpoint_tx: UnboundedSender<DirectEndpoint>,
    outgoing_tx: Option<UnboundedSender<DirectFrame>>,
    events_tx: Option<UnboundedSender<TransportEvent>>,
    closed: AtomicBool,
}

impl Transport for DirectTransport {
    fn name(&self) -> &str {
        "direct"
    }

    fn open(&mut self, endpoint: &str) -> TransportEventStream {
        let (events_tx, events_rx) = unbounded_channel();
        let (outgoing_tx, outgoing_rx) = unbounded_channel();
        let direct_endpoint = DirectEndpoint {
            endpoint: endpoint.to_owned(),
            serializer: self.serializer.clone(),
            incoming_rx: outgoing_rx,
            events_tx: events_tx.clone(),
            client_close: None,
        };
        match self.endpoint_tx.send(direct_endpoint) {
            Ok(()) => {
                events_tx.send(TransportEvent::Open).ok();
            }
            Err(_) => {
                events_tx
                    .send(TransportEvent::Error(format!(
                        "no router is accepting connections for {endpoint}"
                    )))
                    .ok();
            }
        }
        self.events_tx = Some(events_tx);
        self.outgoing_tx = Some(outgoing_tx);
        event_stream(events_rx)
    }

    fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let outgoing_tx = self.outgoing_tx.as_ref().ok_or(TransportError::NotOpen)?;
        let bytes =
            self.serializer
                .serialize(message)
                .map_err(|error| TransportError::Serialization {
                    message: message.message_name(),
                    error,
                })?;
        outgoing_tx
            .send(DirectFrame::Message(bytes))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, code: CloseCode, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(outgoing_tx) = &self.outgoing_tx {
            outgoing_tx
                .send(DirectFrame::Close(CloseInfo {
                    code,
                    reason: reason.to_owned(),
                    was_clean: code == CloseCode::NORMAL,
                }))
                .ok();
        }
        if let Some(events_tx) = &self.events_tx {
            events_tx.send(local_close(code, reason)).ok();
        }
    }
}

/// The router's end of a [`DirectTransport`].
#[derive(Debug)]
pub struct DirectEndpoint {
    endpoint: String,
    serializer: Arc<dyn Serializer>,
    incoming_rx: UnboundedReceiver<DirectFrame>,
    events_tx: UnboundedSender<TransportEvent>,
    client_close: Option<CloseInfo>,
}

impl DirectEndpoint {
    /// The endpoint the client opened.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Receives the next message sent by the client.
    ///
    /// Returns [`None`] once the client closes the transport.
    pub async fn receive(&mut self) -> Option<Message> {
        loop {
            match self.incoming_rx.recv().await? {
                DirectFrame::Message(bytes) => match self.serializer.deserialize(&bytes) {
                    Ok(message) => return Some(message),
                    Err(err) => warn!(
                        "Direct endpoint {} dropped undecodable message: {err:#}",
                        self.endpoint
                    ),
                },
                DirectFrame::Close(info) => {
                    self.client_close = Some(info);
                    return None;
                }
            }
        }
    }

    /// Sends a message to the client.
    pub fn send(&self, message: &Message) -> Result<()> {
        let bytes = self.serializer.serialize(message)?;
        let message = self.serializer.deserialize(&bytes)?;
        self.events_tx
            .send(TransportEvent::Message(message))
            .map_err(|_| Error::msg("client transport is gone"))
    }

    /// Reports a transport failure to the client.
    pub fn fail<S>(&self, error: S)
    where
        S: Into<String>,
    {
        self.events_tx.send(TransportEvent::Error(error.into())).ok();
    }

    /// Closes the transport from the router's side.
    pub fn close(&self, code: CloseCode, reason: &str) {
        self.events_tx
            .send(TransportEvent::Close(CloseInfo {
                code,
                reason: reason.to_owned(),
                was_clean: true,
            }))
            .ok();
    }

    /// How the client closed the transport, if it has.
    pub fn client_close(&self) -> Option<&CloseInfo> {
        self.client_close.as_ref()
    }
}

/// Accepts [`DirectEndpoint`]s for every [`DirectTransport`] opened through the paired
/// [`DirectTransportFactory`].
#[derive(Debug)]
pub struct DirectAcceptor {
    endpoint_rx: UnboundedReceiver<DirectEndpoint>,
}

impl DirectAcceptor {
    /// Waits for the next client to open a transport.
    pub async fn accept(&mut self) -> Option<DirectEndpoint> {
        self.endpoint_rx.recv().await
    }
}

/// A factory for [`DirectTransport`].
#[derive(Debug, Clone)]
pub struct DirectTransportFactory {
    endpoint_tx: UnboundedSender<DirectEndpoint>,
}

impl DirectTransportFactory {
    /// Creates a new factory and the acceptor that receives the router's end of each transport.
    pub fn new() -> (Self, DirectAcceptor) {
        let (endpoint_tx, endpoint_rx) = unbounded_channel();
        (Self { endpoint_tx }, DirectAcceptor { endpoint_rx })
    }
}

impl TransportFactory for DirectTransportFactory {
    fn new_transport(&self, serializer: Box<dyn Serializer>) -> Box<dyn Transport> {
        Box::new(DirectTransport {
            serializer: serializer.into(),
            endpoint_tx: self.endpoint_tx.clone(),
            outgoing_tx: None,
            events_tx: None,
            closed: AtomicBool::new(false),
        })
    }
}
