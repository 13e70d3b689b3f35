use thiserror::Error;

use crate::core::{
    close::CloseCode,
    roles::PeerRole,
    types::{
        Dictionary,
        List,
        Value,
    },
    uri::Uri,
};

/// An interaction error that occurs while processing a WAMP message.
///
/// Interaction errors are clearly defined in the WAMP standard and are reserved for errors that
/// peers must be able to parse easily.
#[derive(Debug, Error)]
pub enum InteractionError {
    /// The incoming message violates the WAMP protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// An invocation handler failed without describing its own error.
    #[error("{0}")]
    RuntimeError(String),
    /// A message could not be serialized.
    #[error("serialization error: {0}")]
    SerializationError(String),
    /// The call was canceled.
    #[error("canceled")]
    Canceled,
}

impl InteractionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::RuntimeError(_) => "runtime_error",
            Self::SerializationError(_) => "serialization_error",
            Self::Canceled => "canceled",
        }
    }

    /// The full error URI.
    pub fn uri(&self) -> Uri {
        Uri::from_known(format!("wamp.error.{}", self.uri_component()))
    }
}

/// An error reported over the wire, in an ERROR message.
///
/// Requests rejected by the router resolve to this error. Invocation handlers may also return
/// this error to control exactly what is reported back to the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct WampError {
    pub reason: Uri,
    pub details: Dictionary,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

impl WampError {
    /// Creates a new error with no payload.
    pub fn new(reason: Uri) -> Self {
        Self {
            reason,
            ..Default::default()
        }
    }

    /// Attaches positional arguments to the error.
    pub fn with_arguments(mut self, arguments: List) -> Self {
        self.arguments = arguments;
        self
    }

    /// Attaches keyword arguments to the error.
    pub fn with_arguments_keyword(mut self, arguments_keyword: Dictionary) -> Self {
        self.arguments_keyword = arguments_keyword;
        self
    }

    /// The human-readable message attached to the error, if any.
    ///
    /// Routers conventionally place the message in `details.message`, but many peers put it in
    /// the first positional argument.
    pub fn message(&self) -> Option<&str> {
        self.details
            .get("message")
            .and_then(Value::string)
            .or_else(|| self.arguments.first().and_then(Value::string))
    }
}

impl From<&InteractionError> for WampError {
    fn from(value: &InteractionError) -> Self {
        Self::new(value.uri()).with_arguments(List::from_iter([Value::String(value.to_string())]))
    }
}

/// A local usage error, which fails an operation without sending anything over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session is not established.
    #[error("invalid session state")]
    InvalidSessionState,
    /// The connection already has an open or opening transport.
    #[error("transport already opened or opening")]
    TransportAlreadyOpen,
    /// The connection has no open transport.
    #[error("transport is not open")]
    TransportNotOpen,
    /// The role processor was closed before the operation started.
    #[error("{0} closed")]
    Closed(PeerRole),
    /// The role processor closed while the operation was pending.
    #[error("{0} closing")]
    Closing(PeerRole),
    /// The call being canceled is not pending.
    #[error("no such pending call")]
    NoSuchPendingCall,
    /// The subscription is not active.
    #[error("no such subscription")]
    NoSuchSubscription,
    /// The registration is not active.
    #[error("no such registration")]
    NoSuchRegistration,
    /// The request could not be sent over the transport.
    #[error("failed to send {message}: {error}")]
    SendFailed { message: &'static str, error: String },
}

/// An error that can be transmitted over channels, resolving a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Remote(#[from] WampError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl RequestError {
    /// Converts the error into a real Error object that can be returned out.
    pub fn into_error(self) -> anyhow::Error {
        match self {
            Self::Remote(err) => err.into(),
            Self::Session(err) => err.into(),
        }
    }
}

/// Type alias for a channel-transmittable result.
pub type RequestResult<T> = Result<T, RequestError>;

/// An error for a session that failed to open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to open session: {reason}")]
pub struct ConnectionOpenError {
    pub reason: String,
    pub details: Dictionary,
}

impl ConnectionOpenError {
    pub fn new<S>(reason: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            reason: reason.into(),
            details: Dictionary::default(),
        }
    }
}

/// An error for a session that closed uncleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session closed abnormally ({code}): {reason}")]
pub struct ConnectionCloseError {
    pub code: CloseCode,
    pub reason: String,
}
