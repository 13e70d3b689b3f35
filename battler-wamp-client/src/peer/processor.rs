use std::{
    fmt::Debug,
    sync::Arc,
};

use log::trace;

use crate::{
    core::{
        error::{
            InteractionError,
            SessionError,
        },
        id::{
            Id,
            IdAllocator,
            IdGenerators,
        },
        roles::{
            PeerRole,
            role_details,
        },
        types::{
            Dictionary,
            Value,
        },
    },
    message::message::Message,
    peer::{
        callee::Callee,
        caller::Caller,
        publisher::Publisher,
        subscriber::Subscriber,
    },
    transport::transport::{
        Transport,
        TransportError,
    },
};

/// The single outbound path of a connection, shared by every role processor.
#[derive(Debug, Clone)]
pub struct MessageSender {
    name: Arc<str>,
    transport: Arc<dyn Transport>,
}

impl MessageSender {
    pub fn new(name: Arc<str>, transport: Arc<dyn Transport>) -> Self {
        Self { name, transport }
    }

    /// The name of the connection, for logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a message over the transport.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        trace!("Connection {} sending message: {message:?}", self.name);
        self.transport.send(message)
    }

    /// Sends a request, converting failures into a [`SessionError`] for the requester.
    pub fn send_request(&self, message: &Message) -> Result<(), SessionError> {
        self.send(message).map_err(|err| SessionError::SendFailed {
            message: message.message_name(),
            error: err.to_string(),
        })
    }
}

/// Everything a role processor needs from its connection.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    pub sender: MessageSender,
    pub ids: Arc<IdGenerators>,
}

impl ProcessorContext {
    /// The name of the connection, for logging.
    pub fn name(&self) -> &str {
        self.sender.name()
    }

    /// Allocates the next session-scoped request ID.
    pub fn next_request_id(&self) -> Id {
        self.ids.session.generate_id()
    }
}

/// The outcome of offering a message to a role processor.
#[derive(Debug)]
pub enum Claim {
    /// The processor consumed the message.
    Claimed,
    /// The message does not belong to the processor, and is handed back.
    Declined(Message),
}

/// A processor for the messages of a single WAMP role.
///
/// Processors are driven synchronously by the connection, one message at a time, in the order
/// messages arrive. A message that cannot belong to any request the processor knows about is a
/// protocol violation, which ends the session.
pub trait MessageProcessor: Send + Debug {
    /// The role implemented by the processor.
    fn role(&self) -> PeerRole;

    /// Feature flags announced for the role in HELLO.
    fn features(&self) -> &'static [&'static str];

    /// Offers an incoming message to the processor.
    fn process_message(&mut self, message: Message) -> Result<Claim, InteractionError>;

    /// Closes the processor, rejecting everything it has outstanding.
    ///
    /// A closed processor declines every message and fails every new operation.
    fn close(&mut self);
}

pub(crate) fn protocol_violation<S>(reason: S) -> InteractionError
where
    S: Into<String>,
{
    InteractionError::ProtocolViolation(reason.into())
}

/// The four role processors of an established session.
#[derive(Debug)]
pub struct RoleProcessors {
    pub publisher: Publisher,
    pub subscriber: Subscriber,
    pub caller: Caller,
    pub callee: Callee,
}

impl RoleProcessors {
    pub fn new(context: ProcessorContext) -> Self {
        Self {
            publisher: Publisher::new(context.clone()),
            subscriber: Subscriber::new(context.clone()),
            caller: Caller::new(context.clone()),
            callee: Callee::new(context),
        }
    }

    fn processors(&mut self) -> [&mut dyn MessageProcessor; 4] {
        [
            &mut self.publisher,
            &mut self.subscriber,
            &mut self.caller,
            &mut self.callee,
        ]
    }

    /// The `roles` dictionary announced in HELLO.
    pub fn roles() -> Dictionary {
        Dictionary::from_iter(
            [
                (PeerRole::Publisher, Publisher::FEATURES),
                (PeerRole::Subscriber, Subscriber::FEATURES),
                (PeerRole::Caller, Caller::FEATURES),
                (PeerRole::Callee, Callee::FEATURES),
            ]
            .into_iter()
            .map(|(role, features)| (role.as_str().to_owned(), role_details(features))),
        )
    }

    /// Offers a message to each processor in turn, until one claims it.
    pub fn dispatch(&mut self, message: Message) -> Result<Claim, InteractionError> {
        let mut message = message;
        for processor in self.processors() {
            match processor.process_message(message)? {
                Claim::Claimed => return Ok(Claim::Claimed),
                Claim::Declined(declined) => message = declined,
            }
        }
        Ok(Claim::Declined(message))
    }

    /// Closes every processor.
    pub fn close(&mut self) {
        for processor in self.processors() {
            processor.close();
        }
    }
}

/// Reads the role dictionary for a single role from HELLO details, for tests and diagnostics.
pub fn role_features(roles: &Dictionary, role: PeerRole) -> Option<&Dictionary> {
    roles
        .get(role.as_str())
        .and_then(Value::dictionary)
        .and_then(|details| details.get("features"))
        .and_then(Value::dictionary)
}

#[cfg(test)]
pub(crate) mod test_transport {
    use std::sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicBool,
            Ordering,
        },
    };

    use crate::{
        core::{
            close::CloseCode,
            id::IdGenerators,
        },
        message::message::Message,
        peer::processor::{
            MessageSender,
            ProcessorContext,
        },
        transport::transport::{
            Transport,
            TransportError,
            TransportEventStream,
        },
    };

    /// A transport that records every message sent through it.
    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        sent: Mutex<Vec<Message>>,
        fail_sends: AtomicBool,
        fail_yield_serialization: AtomicBool,
    }

    impl RecordingTransport {
        pub fn take_sent(&self) -> Vec<Message> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        pub fn fail_sends(&self) {
            self.fail_sends.store(true, Ordering::Release);
        }

        pub fn allow_sends(&self) {
            self.fail_sends.store(false, Ordering::Release);
        }

        /// Fails to serialize every YIELD, as if its payload could not be encoded.
        pub fn fail_yield_serialization(&self) {
            self.fail_yield_serialization.store(true, Ordering::Release);
        }
    }

    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        fn open(&mut self, _: &str) -> TransportEventStream {
            Box::pin(futures_util::stream::empty())
        }

        fn send(&self, message: &Message) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            if self.fail_yield_serialization.load(Ordering::Acquire)
                && matches!(message, Message::Yield(_))
            {
                return Err(TransportError::Serialization {
                    message: message.message_name(),
                    error: anyhow::Error::msg("payload cannot be encoded"),
                });
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn close(&self, _: CloseCode, _: &str) {}
    }

    pub fn processor_context() -> (ProcessorContext, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let context = ProcessorContext {
            sender: MessageSender::new("test".into(), transport.clone()),
            ids: Arc::new(IdGenerators::default()),
        };
        (context, transport)
    }
}
