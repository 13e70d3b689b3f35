use crate::{
    core::{
        close::CloseReason,
        error::{
            InteractionError,
            WampError,
        },
        id::Id,
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        AbortMessage,
        ErrorMessage,
        GoodbyeMessage,
        Message,
        MessageKind,
    },
};

fn message_details(message: &str) -> Dictionary {
    Dictionary::from_iter([("message".to_owned(), Value::String(message.to_owned()))])
}

/// An ABORT message for a protocol violation detected locally.
pub fn abort_message_for_protocol_violation(reason: &str) -> Message {
    Message::Abort(AbortMessage {
        details: message_details(reason),
        reason: InteractionError::ProtocolViolation(reason.to_owned()).uri(),
    })
}

/// A GOODBYE message for closing the session.
pub fn goodbye_with_close_reason(close_reason: CloseReason, message: Option<&str>) -> Message {
    Message::Goodbye(GoodbyeMessage {
        details: message.map(message_details).unwrap_or_default(),
        reason: close_reason.uri(),
    })
}

/// A GOODBYE message for acknowledging a GOODBYE from the router.
pub fn goodbye_and_out() -> Message {
    goodbye_with_close_reason(CloseReason::GoodbyeAndOut, None)
}

/// An ERROR message in response to a request from the router.
pub fn error_for_request(request_type: MessageKind, request: Id, error: WampError) -> Message {
    Message::Error(ErrorMessage {
        request_type: request_type.tag(),
        request,
        details: error.details,
        error: error.reason,
        arguments: error.arguments,
        arguments_keyword: error.arguments_keyword,
    })
}

/// Reads the wire error carried by an ERROR message.
pub fn wamp_error_from_message(message: ErrorMessage) -> WampError {
    WampError {
        reason: message.error,
        details: message.details,
        arguments: message.arguments,
        arguments_keyword: message.arguments_keyword,
    }
}

/// Reads an ID from a details dictionary.
pub fn id_from_details(details: &Dictionary, key: &str) -> Option<Id> {
    details.get(key).and_then(|value| Id::try_from(value).ok())
}

/// Reads a URI from a details dictionary.
pub fn uri_from_details(details: &Dictionary, key: &str) -> Option<Uri> {
    details
        .get(key)
        .and_then(Value::string)
        .and_then(|value| Uri::try_from(value).ok())
}

/// Reads a boolean flag from a details or options dictionary, defaulting to false.
pub fn flag_from_details(details: &Dictionary, key: &str) -> bool {
    details.get(key).and_then(Value::bool).unwrap_or(false)
}
