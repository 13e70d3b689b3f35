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
use futures_util::{
    SinkExt,
    StreamExt,
};
use log::{
    debug,
    warn,
};
use tokio::{
    net::TcpStream,
    sync::mpsc::{
        UnboundedReceiver,
        UnboundedSender,
        unbounded_channel,
    },
};
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
    connect_async,
    tungstenite::{
        ClientRequestBuilder,
        Message as WebSocketMessage,
        http::header::SEC_WEBSOCKET_PROTOCOL,
        protocol::CloseFrame,
    },
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

/// Close code reported when the WebSocket stream ends without a close frame.
const CONNECTION_LOST: CloseCode = CloseCode(1006);

enum Outgoing {
    Message(Vec<u8>),
    Close(CloseCode, String),
}

/// A transport implemented for a TCP stream using the WebSocket protocol.
///
/// The serializer's protocol identifier is negotiated as the WebSocket sub-protocol.
#[derive(Debug)]
pub struct WebSocketTransport {
    serializer: Arc<dyn Serializer>,
    outgoing_tx: Option<UnboundedSender<Outgoing>>,
    events_tx: Option<UnboundedSender<TransportEvent>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(bytes) => write!(f, "Message({} bytes)", bytes.len()),
            Self::Close(code, reason) => write!(f, "Close({code}, {reason})"),
        }
    }
}

impl WebSocketTransport {
    /// Creates a new WebSocket transport that has not been opened.
    pub fn new(serializer: Box<dyn Serializer>) -> Self {
        Self {
            serializer: serializer.into(),
            outgoing_tx: None,
            events_tx: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    fn open(&mut self, endpoint: &str) -> TransportEventStream {
        let (events_tx, events_rx) = unbounded_channel();
        let (outgoing_tx, outgoing_rx) = unbounded_channel();
        self.events_tx = Some(events_tx.clone());
        self.outgoing_tx = Some(outgoing_tx);
        tokio::spawn(run_web_socket(
            endpoint.to_owned(),
            self.serializer.clone(),
            events_tx,
            outgoing_rx,
            self.closed.clone(),
        ));
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
            .send(Outgoing::Message(bytes))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, code: CloseCode, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(outgoing_tx) = &self.outgoing_tx {
            outgoing_tx
                .send(Outgoing::Close(code, reason.to_owned()))
                .ok();
        }
        if let Some(events_tx) = &self.events_tx {
            events_tx.send(local_close(code, reason)).ok();
        }
    }
}

async fn connect(
    endpoint: &str,
    protocol_id: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let request =
        ClientRequestBuilder::new(endpoint.try_into()?).with_sub_protocol(protocol_id.to_owned());
    let (stream, response) = connect_async(request).await?;
    match response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        Some(protocol) if protocol.to_str()? == protocol_id => Ok(stream),
        Some(protocol) => Err(Error::msg(format!(
            "router selected unsupported sub-protocol {}",
            protocol.to_str()?
        ))),
        None => Err(Error::msg("handshake did not produce a sub-protocol")),
    }
}

fn web_socket_message(serializer: &dyn Serializer, bytes: Vec<u8>) -> Result<WebSocketMessage> {
    if serializer.is_binary() {
        Ok(WebSocketMessage::Binary(bytes.into()))
    } else {
        Ok(WebSocketMessage::Text(String::from_utf8(bytes)?.into()))
    }
}

async fn run_web_socket(
    endpoint: String,
    serializer: Arc<dyn Serializer>,
    events_tx: UnboundedSender<TransportEvent>,
    mut outgoing_rx: UnboundedReceiver<Outgoing>,
    closed: Arc<AtomicBool>,
) {
    let stream = match connect(&endpoint, serializer.protocol_id()).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!("Failed to connect to {endpoint}: {err:#}");
            events_tx.send(TransportEvent::Error(err.to_string())).ok();
            return;
        }
    };
    if closed.load(Ordering::Acquire) {
        return;
    }
    debug!("Connected to {endpoint}");
    events_tx.send(TransportEvent::Open).ok();

    let (mut sink, mut stream) = stream.split();
    loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                match outgoing {
                    Some(Outgoing::Message(bytes)) => {
                        let message = match web_socket_message(serializer.as_ref(), bytes) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!("Dropping outgoing message for {endpoint}: {err:#}");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(message).await {
                            events_tx.send(TransportEvent::Error(err.to_string())).ok();
                            break;
                        }
                    }
                    Some(Outgoing::Close(code, reason)) => {
                        let frame = CloseFrame {
                            code: code.0.into(),
                            reason: reason.into(),
                        };
                        sink.send(WebSocketMessage::Close(Some(frame))).await.ok();
                        break;
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(message)) => {
                        if message.is_text() || message.is_binary() {
                            match serializer.deserialize(&message.into_data()) {
                                Ok(message) => {
                                    events_tx.send(TransportEvent::Message(message)).ok();
                                }
                                Err(err) => {
                                    events_tx.send(TransportEvent::Error(format!("failed to deserialize message: {err}"))).ok();
                                    break;
                                }
                            }
                        } else if let WebSocketMessage::Ping(data) = message {
                            sink.send(WebSocketMessage::Pong(data)).await.ok();
                        } else if let WebSocketMessage::Close(frame) = message {
                            let (code, reason) = match frame {
                                Some(frame) => (CloseCode(frame.code.into()), frame.reason.as_str().to_owned()),
                                None => (CloseCode::NORMAL, String::new()),
                            };
                            events_tx.send(TransportEvent::Close(CloseInfo { code, reason, was_clean: true })).ok();
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        events_tx.send(TransportEvent::Error(err.to_string())).ok();
                        break;
                    }
                    None => {
                        events_tx.send(TransportEvent::Close(CloseInfo {
                            code: CONNECTION_LOST,
                            reason: "connection lost".to_owned(),
                            was_clean: false,
                        })).ok();
                        break;
                    }
                }
            }
        }
    }
    closed.store(true, Ordering::Release);
}

/// A factory for [`WebSocketTransport`].
#[derive(Default)]
pub struct WebSocketTransportFactory {}

impl TransportFactory for WebSocketTransportFactory {
    fn new_transport(&self, serializer: Box<dyn Serializer>) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new(serializer))
    }
}
