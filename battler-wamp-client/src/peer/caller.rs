use std::time::Duration;

use anyhow::Result;
use log::{
    debug,
    warn,
};

use crate::{
    core::{
        cancel::CallCancelMode,
        error::{
            InteractionError,
            SessionError,
        },
        hash::HashMap,
        id::Id,
        roles::PeerRole,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::{
            flag_from_details,
            wamp_error_from_message,
        },
        message::{
            CallMessage,
            CancelMessage,
            Message,
            MessageKind,
            ResultMessage,
        },
    },
    peer::{
        pending::{
            PendingResponse,
            Responder,
            pending_request,
        },
        processor::{
            Claim,
            MessageProcessor,
            ProcessorContext,
            protocol_violation,
        },
    },
};

/// Options for calling a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallOptions {
    /// The callee should report progressive results.
    pub receive_progress: bool,
    /// A timeout advertised to the router. Not enforced locally.
    pub timeout: Option<Duration>,
    /// The caller's identity should be disclosed to the callee.
    pub disclose_me: bool,
}

impl CallOptions {
    /// The options dictionary for CALL.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut options = Dictionary::default();
        if self.receive_progress {
            options.insert("receive_progress".to_owned(), Value::Bool(true));
        }
        if let Some(timeout) = self.timeout {
            options.insert(
                "timeout".to_owned(),
                Value::Integer(timeout.as_millis() as u64),
            );
        }
        if self.disclose_me {
            options.insert("disclose_me".to_owned(), Value::Bool(true));
        }
        options
    }
}

/// A procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub options: CallOptions,
}

/// A result of a procedure call.
#[derive(Debug)]
pub struct RpcResult {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// The next result, if this result is progressive.
    pub next_result: Option<PendingRpcResult>,
}

impl RpcResult {
    /// Whether more results follow this one.
    pub fn progress(&self) -> bool {
        self.next_result.is_some()
    }
}

/// A result of a procedure call that has not arrived yet.
#[derive(Debug)]
pub struct PendingRpcResult {
    pending: PendingResponse<RpcResult>,
}

impl PendingRpcResult {
    /// Waits for the result.
    pub async fn result(self) -> Result<RpcResult> {
        self.pending.wait().await
    }
}

/// A procedure call that was sent to the router.
#[derive(Debug)]
pub struct PendingRpc {
    request_id: Id,
    result: PendingRpcResult,
}

impl PendingRpc {
    /// The request ID of the call, used for canceling it.
    pub fn request_id(&self) -> Id {
        self.request_id
    }

    /// Waits for the first result of the call.
    ///
    /// If progressive results were requested, the result may carry the next one.
    pub async fn result(self) -> Result<RpcResult> {
        self.result.result().await
    }
}

#[derive(Debug)]
struct PendingCall {
    responder: Responder<RpcResult>,
    receive_progress: bool,
}

/// The caller role, which calls procedures.
#[derive(Debug)]
pub struct Caller {
    context: ProcessorContext,
    calls: HashMap<Id, PendingCall>,
    closed: bool,
}

impl Caller {
    pub const FEATURES: &'static [&'static str] = &[
        "progressive_call_results",
        "call_timeout",
        "call_canceling",
        "caller_identification",
    ];

    pub fn new(context: ProcessorContext) -> Self {
        Self {
            context,
            calls: HashMap::default(),
            closed: false,
        }
    }

    /// Calls a procedure.
    ///
    /// Returns as soon as CALL is sent, so that the call can be canceled by its request ID.
    pub fn call(&mut self, procedure: Uri, call: RpcCall) -> Result<PendingRpc> {
        if self.closed {
            return Err(SessionError::Closed(PeerRole::Caller).into());
        }
        let request_id = self.context.next_request_id();
        let receive_progress = call.options.receive_progress;
        let message = Message::Call(CallMessage {
            request: request_id,
            options: call.options.to_dictionary(),
            procedure,
            arguments: call.arguments,
            arguments_keyword: call.arguments_keyword,
        });
        self.context.sender.send_request(&message)?;

        let (responder, pending) = pending_request(PeerRole::Caller, request_id);
        self.calls.insert(
            request_id,
            PendingCall {
                responder,
                receive_progress,
            },
        );
        debug!(
            "Connection {} calling with request {request_id}",
            self.context.name()
        );
        Ok(PendingRpc {
            request_id,
            result: PendingRpcResult { pending },
        })
    }

    /// Cancels a pending call.
    ///
    /// When no mode is given, the router applies its default.
    pub fn cancel(&mut self, request_id: Id, mode: Option<CallCancelMode>) -> Result<()> {
        if self.closed {
            return Err(SessionError::Closed(PeerRole::Caller).into());
        }
        if !self.calls.contains_key(&request_id) {
            return Err(SessionError::NoSuchPendingCall.into());
        }
        let mut options = Dictionary::default();
        if let Some(mode) = mode {
            options.insert("mode".to_owned(), Value::String(mode.as_str().to_owned()));
        }
        self.context
            .sender
            .send_request(&Message::Cancel(CancelMessage {
                call_request: request_id,
                options,
            }))?;
        debug!(
            "Connection {} canceled call {request_id}",
            self.context.name()
        );
        Ok(())
    }

    fn handle_result(&mut self, message: ResultMessage) -> Result<(), InteractionError> {
        let request_id = message.call_request;
        let call = self
            .calls
            .remove(&request_id)
            .ok_or_else(|| protocol_violation("unexpected RESULT"))?;
        if !flag_from_details(&message.details, "progress") {
            call.responder.resolve(RpcResult {
                arguments: message.arguments,
                arguments_keyword: message.arguments_keyword,
                next_result: None,
            });
            return Ok(());
        }

        if !call.receive_progress {
            return Err(protocol_violation("unexpected PROGRESS RESULT"));
        }
        let (responder, pending) = pending_request(PeerRole::Caller, request_id);
        self.calls.insert(
            request_id,
            PendingCall {
                responder,
                receive_progress: true,
            },
        );
        call.responder.resolve(RpcResult {
            arguments: message.arguments,
            arguments_keyword: message.arguments_keyword,
            next_result: Some(PendingRpcResult { pending }),
        });
        Ok(())
    }
}

impl MessageProcessor for Caller {
    fn role(&self) -> PeerRole {
        PeerRole::Caller
    }

    fn features(&self) -> &'static [&'static str] {
        Self::FEATURES
    }

    fn process_message(&mut self, message: Message) -> Result<Claim, InteractionError> {
        if self.closed {
            return Ok(Claim::Declined(message));
        }
        match message {
            Message::Result(message) => {
                self.handle_result(message)?;
                Ok(Claim::Claimed)
            }
            Message::Error(message) if message.request_type == MessageKind::Call.tag() => {
                let call = self
                    .calls
                    .remove(&message.request)
                    .ok_or_else(|| protocol_violation("unexpected CALL ERROR"))?;
                warn!(
                    "Connection {} call {} failed: {}",
                    self.context.name(),
                    message.request,
                    message.error
                );
                call.responder.reject(wamp_error_from_message(message));
                Ok(Claim::Claimed)
            }
            message => Ok(Claim::Declined(message)),
        }
    }

    fn close(&mut self) {
        self.closed = true;
        for (_, call) in self.calls.drain() {
            call.responder
                .reject(SessionError::Closing(PeerRole::Caller));
        }
    }
}
