use std::{
    fmt::Debug,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{
    FutureExt,
    future::BoxFuture,
};
use log::{
    debug,
    warn,
};
use tokio::sync::{
    mpsc,
    watch,
};

use crate::{
    core::{
        error::{
            InteractionError,
            RequestResult,
            SessionError,
            WampError,
        },
        hash::HashMap,
        id::Id,
        invocation_policy::InvocationPolicy,
        match_style::MatchStyle,
        roles::PeerRole,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::{
        common::{
            error_for_request,
            flag_from_details,
            id_from_details,
            uri_from_details,
        },
        message::{
            InvocationMessage,
            Message,
            MessageKind,
            RegisterMessage,
            RegisteredMessage,
            UnregisterMessage,
            UnregisteredMessage,
            YieldMessage,
        },
    },
    peer::{
        pending::{
            Correlated,
            Notification,
            Notifier,
            PendingMap,
            PendingResponse,
            Responder,
            notification,
        },
        processor::{
            Claim,
            MessageProcessor,
            ProcessorContext,
            protocol_violation,
        },
    },
    transport::transport::TransportError,
};

/// Options for registering a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcedureOptions {
    /// How the procedure should be matched for procedure calls.
    pub match_style: Option<MatchStyle>,
    /// How a callee should be selected for invocations.
    pub invocation_policy: InvocationPolicy,
    /// The caller's identity should be disclosed.
    pub disclose_caller: bool,
}

impl ProcedureOptions {
    /// The options dictionary for REGISTER.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut options = Dictionary::default();
        if let Some(match_style) = self.match_style {
            options.insert(
                "match".to_owned(),
                Value::String(match_style.as_str().to_owned()),
            );
        }
        if self.invocation_policy != InvocationPolicy::default() {
            options.insert(
                "invoke".to_owned(),
                Value::String(self.invocation_policy.as_str().to_owned()),
            );
        }
        if self.disclose_caller {
            options.insert("disclose_caller".to_owned(), Value::Bool(true));
        }
        options
    }
}

/// A signal raised when the router interrupts an invocation.
///
/// Cancellation never stops a handler by itself. Handlers observe the signal and decide when to
/// stop.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// Checks if the invocation was canceled.
    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the invocation to be canceled.
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|canceled| *canceled).await.is_err() {
            // The call finished without being canceled.
            futures_util::future::pending::<()>().await;
        }
    }
}

fn cancellation_signal() -> (watch::Sender<bool>, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (tx, CancellationSignal { rx })
}

/// An invocation of a registered procedure.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The request ID of the invocation.
    pub id: Id,
    /// The registration the invocation was routed to.
    pub registration: Id,
    /// The procedure that was called, which may differ from the registered procedure for
    /// pattern-based registrations.
    pub procedure: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
    /// The caller accepts progressive results.
    pub receive_progress: bool,
    /// The timeout advertised by the caller.
    pub timeout: Option<Duration>,
    cancellation: CancellationSignal,
}

impl Invocation {
    /// The session that made the call, if disclosed.
    pub fn caller(&self) -> Option<Id> {
        id_from_details(&self.details, "caller")
    }

    /// The signal raised when the router interrupts this invocation.
    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }
}

/// A result yielded by an invocation handler.
#[derive(Default)]
pub struct RpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// The next result, which makes this result progressive.
    pub next_yield: Option<BoxFuture<'static, Result<RpcYield>>>,
}

impl Debug for RpcYield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcYield")
            .field("arguments", &self.arguments)
            .field("arguments_keyword", &self.arguments_keyword)
            .field("progress", &self.next_yield.is_some())
            .finish()
    }
}

/// A handler for invocations of a registered procedure.
///
/// Handlers run on their own task. Returning a [`WampError`] controls the ERROR reported to the
/// caller. Any other error is reported as `wamp.error.runtime_error`.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<RpcYield>;
}

#[async_trait]
impl<F, Fut> InvocationHandler for F
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcYield>> + Send + 'static,
{
    async fn invoke(&self, invocation: Invocation) -> Result<RpcYield> {
        self(invocation).await
    }
}

/// A registration of a procedure.
#[derive(Debug, Clone)]
pub struct Registration {
    id: Id,
    procedure: WildcardUri,
    unregistered: Notification,
}

impl Registration {
    /// The registration ID assigned by the router.
    pub fn id(&self) -> Id {
        self.id
    }

    /// The registered procedure.
    pub fn procedure(&self) -> &WildcardUri {
        &self.procedure
    }

    /// Waits for the registration to end.
    ///
    /// Resolves when the procedure is unregistered locally or revoked by the router, and fails
    /// if the session ends first.
    pub async fn unregistered(&self) -> Result<()> {
        self.unregistered.wait().await
    }
}

struct Procedure {
    procedure: WildcardUri,
    handler: Arc<dyn InvocationHandler>,
}

impl Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("procedure", &self.procedure)
            .finish()
    }
}

#[derive(Debug)]
struct ActiveRegistration {
    procedure: Procedure,
    unregistered: Notifier,
}

#[derive(Debug)]
struct RunningCall {
    cancel: watch::Sender<bool>,
}

impl RunningCall {
    fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}

#[derive(Debug)]
enum Outcome {
    Progress(List, Dictionary),
    Final(List, Dictionary),
    Failed(WampError),
}

/// The outcome of an invocation handler, to be reported to the router by the [`Callee`].
#[derive(Debug)]
pub struct InvocationOutcome {
    request_id: Id,
    outcome: Outcome,
}

fn handler_error(error: anyhow::Error) -> WampError {
    match error.downcast::<WampError>() {
        Ok(error) => error,
        Err(error) => match error.downcast_ref::<InteractionError>() {
            Some(error) => WampError::from(error),
            None => WampError::from(&InteractionError::RuntimeError(error.to_string())),
        },
    }
}

async fn run_invocation(
    handler: Arc<dyn InvocationHandler>,
    invocation: Invocation,
    outcomes: mpsc::UnboundedSender<InvocationOutcome>,
) {
    let request_id = invocation.id;
    let receive_progress = invocation.receive_progress;
    let mut next: BoxFuture<'static, Result<RpcYield>> =
        async move { handler.invoke(invocation).await }.boxed();
    loop {
        let outcome = match AssertUnwindSafe(next).catch_unwind().await {
            Ok(Ok(mut rpc_yield)) => match rpc_yield.next_yield.take() {
                Some(following) => {
                    next = following;
                    if receive_progress {
                        let outcome = InvocationOutcome {
                            request_id,
                            outcome: Outcome::Progress(
                                rpc_yield.arguments,
                                rpc_yield.arguments_keyword,
                            ),
                        };
                        if outcomes.send(outcome).is_err() {
                            return;
                        }
                    }
                    continue;
                }
                None => Outcome::Final(rpc_yield.arguments, rpc_yield.arguments_keyword),
            },
            Ok(Err(err)) => Outcome::Failed(handler_error(err)),
            Err(_) => Outcome::Failed(handler_error(
                InteractionError::RuntimeError("invocation handler panicked".to_owned()).into(),
            )),
        };
        // The callee may already be gone.
        outcomes
            .send(InvocationOutcome {
                request_id,
                outcome,
            })
            .ok();
        return;
    }
}

/// The callee role, which handles invocations of registered procedures.
#[derive(Debug)]
pub struct Callee {
    context: ProcessorContext,
    registers: PendingMap<RegisteredMessage, Registration>,
    unregisters: PendingMap<UnregisteredMessage, ()>,
    pending_registrations: HashMap<Id, Procedure>,
    pending_unregistrations: HashMap<Id, Id>,
    registrations: HashMap<Id, ActiveRegistration>,
    running_calls: HashMap<Id, RunningCall>,
    outcomes_tx: mpsc::UnboundedSender<InvocationOutcome>,
    outcomes_rx: Option<mpsc::UnboundedReceiver<InvocationOutcome>>,
    closed: bool,
}

impl Callee {
    pub const FEATURES: &'static [&'static str] = &[
        "progressive_call_results",
        "call_timeout",
        "call_canceling",
        "caller_identification",
        "pattern_based_registration",
        "shared_registration",
    ];

    pub fn new(context: ProcessorContext) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            context,
            registers: PendingMap::new(PeerRole::Callee),
            unregisters: PendingMap::new(PeerRole::Callee).with_router_initiated(),
            pending_registrations: HashMap::default(),
            pending_unregistrations: HashMap::default(),
            registrations: HashMap::default(),
            running_calls: HashMap::default(),
            outcomes_tx,
            outcomes_rx: Some(outcomes_rx),
            closed: false,
        }
    }

    /// Takes the stream of invocation outcomes, which must be fed back through
    /// [`Callee::complete`].
    pub fn take_outcomes(&mut self) -> Option<mpsc::UnboundedReceiver<InvocationOutcome>> {
        self.outcomes_rx.take()
    }

    /// The number of invocations whose handlers have not finished.
    pub fn running_calls(&self) -> usize {
        self.running_calls.len()
    }

    /// Registers a procedure.
    pub fn register(
        &mut self,
        procedure: WildcardUri,
        handler: Arc<dyn InvocationHandler>,
        options: ProcedureOptions,
    ) -> Result<PendingResponse<Registration>> {
        if self.closed {
            return Err(SessionError::Closed(PeerRole::Callee).into());
        }
        let request_id = self.context.next_request_id();
        let message = Message::Register(RegisterMessage {
            request: request_id,
            options: options.to_dictionary(),
            procedure: procedure.clone(),
        });

        let pending = self.registers.put(request_id);
        self.pending_registrations
            .insert(request_id, Procedure { procedure, handler });
        if let Err(err) = self.context.sender.send_request(&message) {
            self.registers.remove(request_id);
            self.pending_registrations.remove(&request_id);
            return Err(err.into());
        }
        debug!(
            "Connection {} registering with request {request_id}",
            self.context.name()
        );
        Ok(pending)
    }

    /// Unregisters a procedure.
    ///
    /// The registration keeps handling invocations until the router confirms.
    pub fn unregister(&mut self, registration: &Registration) -> Result<PendingResponse<()>> {
        if self.closed {
            return Err(SessionError::Closed(PeerRole::Callee).into());
        }
        if !self.registrations.contains_key(&registration.id) {
            return Err(SessionError::NoSuchRegistration.into());
        }
        let request_id = self.context.next_request_id();
        let message = Message::Unregister(UnregisterMessage {
            request: request_id,
            registered_registration: registration.id,
        });
        let pending = self.unregisters.put(request_id);
        self.pending_unregistrations
            .insert(request_id, registration.id);
        if let Err(err) = self.context.sender.send_request(&message) {
            self.unregisters.remove(request_id);
            self.pending_unregistrations.remove(&request_id);
            return Err(err.into());
        }
        debug!(
            "Connection {} unregistering {} with request {request_id}",
            self.context.name(),
            registration.id
        );
        Ok(pending)
    }

    /// Reports the outcome of an invocation handler to the router.
    pub fn complete(&mut self, outcome: InvocationOutcome) {
        if self.closed {
            return;
        }
        let request_id = outcome.request_id;
        let message = match outcome.outcome {
            Outcome::Progress(arguments, arguments_keyword) => {
                if !self.running_calls.contains_key(&request_id) {
                    return;
                }
                Message::Yield(YieldMessage {
                    invocation_request: request_id,
                    options: Dictionary::from_iter([("progress".to_owned(), Value::Bool(true))]),
                    arguments,
                    arguments_keyword,
                })
            }
            Outcome::Final(arguments, arguments_keyword) => {
                if self.running_calls.remove(&request_id).is_none() {
                    return;
                }
                Message::Yield(YieldMessage {
                    invocation_request: request_id,
                    options: Dictionary::default(),
                    arguments,
                    arguments_keyword,
                })
            }
            Outcome::Failed(error) => {
                if self.running_calls.remove(&request_id).is_none() {
                    return;
                }
                warn!(
                    "Connection {} invocation {request_id} failed: {}",
                    self.context.name(),
                    error.reason
                );
                error_for_request(MessageKind::Invocation, request_id, error)
            }
        };

        match self.context.sender.send(&message) {
            Ok(()) => (),
            Err(TransportError::Serialization { error, .. }) => {
                warn!(
                    "Connection {} failed to serialize result of invocation {request_id}: {error}",
                    self.context.name()
                );
                self.running_calls.remove(&request_id);
                let error = InteractionError::SerializationError(error.to_string());
                let message =
                    error_for_request(MessageKind::Invocation, request_id, WampError::from(&error));
                if let Err(err) = self.context.sender.send(&message) {
                    warn!(
                        "Connection {} failed to report error for invocation {request_id}: {err}",
                        self.context.name()
                    );
                }
            }
            Err(err) => {
                warn!(
                    "Connection {} failed to send result of invocation {request_id}: {err}",
                    self.context.name()
                );
            }
        }
    }

    fn handle_registered(&mut self, response: RegisteredMessage, responder: Responder<Registration>) {
        let request_id = responder.request_id();
        let procedure = match self.pending_registrations.remove(&request_id) {
            Some(procedure) => procedure,
            None => {
                responder.reject(SessionError::NoSuchRegistration);
                return;
            }
        };
        let (notifier, unregistered) = notification(PeerRole::Callee);
        let registration = Registration {
            id: response.registration,
            procedure: procedure.procedure.clone(),
            unregistered,
        };
        debug!(
            "Connection {} registered {} with registration {}",
            self.context.name(),
            procedure.procedure,
            response.registration
        );
        self.registrations.insert(
            response.registration,
            ActiveRegistration {
                procedure,
                unregistered: notifier,
            },
        );
        responder.resolve(registration);
    }

    fn handle_unregistered(&mut self, request_id: Id, result: RequestResult<()>) {
        let registration_id = match self.pending_unregistrations.remove(&request_id) {
            Some(registration_id) => registration_id,
            None => return,
        };
        // On error, the registration stays active.
        if result.is_ok() {
            if let Some(registration) = self.registrations.remove(&registration_id) {
                registration.unregistered.notify(Ok(()));
            }
        }
    }

    fn handle_router_unregistered(
        &mut self,
        message: UnregisteredMessage,
    ) -> Result<(), InteractionError> {
        let registration_id = id_from_details(&message.details, "registration")
            .ok_or_else(|| protocol_violation("invalid router UNREGISTERED"))?;
        let registration = self
            .registrations
            .remove(&registration_id)
            .ok_or_else(|| protocol_violation("unexpected router UNREGISTERED"))?;
        debug!(
            "Connection {} had registration {registration_id} revoked by the router",
            self.context.name()
        );
        registration.unregistered.notify(Ok(()));
        Ok(())
    }

    fn handle_invocation(&mut self, message: InvocationMessage) -> Result<(), InteractionError> {
        let registration = self
            .registrations
            .get(&message.registered_registration)
            .ok_or_else(|| protocol_violation("unexpected INVOCATION"))?;
        let procedure = uri_from_details(&message.details, "procedure").unwrap_or_else(|| {
            Uri::from_known(registration.procedure.procedure.to_string())
        });
        let timeout = message
            .details
            .get("timeout")
            .and_then(Value::integer)
            .filter(|timeout| *timeout > 0)
            .map(Duration::from_millis);
        let (cancel, cancellation) = cancellation_signal();
        let invocation = Invocation {
            id: message.request,
            registration: message.registered_registration,
            procedure,
            receive_progress: flag_from_details(&message.details, "receive_progress"),
            timeout,
            arguments: message.arguments,
            arguments_keyword: message.arguments_keyword,
            details: message.details,
            cancellation,
        };
        debug!(
            "Connection {} received invocation {} for registration {}",
            self.context.name(),
            invocation.id,
            invocation.registration
        );
        self.running_calls
            .insert(invocation.id, RunningCall { cancel });
        tokio::spawn(run_invocation(
            registration.procedure.handler.clone(),
            invocation,
            self.outcomes_tx.clone(),
        ));
        Ok(())
    }
}

impl MessageProcessor for Callee {
    fn role(&self) -> PeerRole {
        PeerRole::Callee
    }

    fn features(&self) -> &'static [&'static str] {
        Self::FEATURES
    }

    fn process_message(&mut self, message: Message) -> Result<Claim, InteractionError> {
        if self.closed {
            return Ok(Claim::Declined(message));
        }
        let message = match self.registers.handle(message) {
            Correlated::Declined(message) => message,
            Correlated::Response {
                response,
                responder,
            } => {
                self.handle_registered(response, responder);
                return Ok(Claim::Claimed);
            }
            Correlated::Rejected { request_id, .. } => {
                self.pending_registrations.remove(&request_id);
                return Ok(Claim::Claimed);
            }
            Correlated::RouterInitiated(_) => return Err(protocol_violation("unexpected REGISTERED")),
            Correlated::Unexpected(reason) => return Err(protocol_violation(reason)),
        };

        let message = match message {
            Message::Invocation(message) => {
                self.handle_invocation(message)?;
                return Ok(Claim::Claimed);
            }
            Message::Interrupt(message) => {
                let call = self
                    .running_calls
                    .get(&message.invocation_request)
                    .ok_or_else(|| protocol_violation("unexpected INTERRUPT"))?;
                debug!(
                    "Connection {} interrupted invocation {}",
                    self.context.name(),
                    message.invocation_request
                );
                call.cancel();
                return Ok(Claim::Claimed);
            }
            message => message,
        };

        match self.unregisters.handle(message) {
            Correlated::Declined(message) => Ok(Claim::Declined(message)),
            Correlated::Response { responder, .. } => {
                self.handle_unregistered(responder.request_id(), Ok(()));
                responder.resolve(());
                Ok(Claim::Claimed)
            }
            Correlated::Rejected { request_id, error } => {
                self.handle_unregistered(request_id, Err(error.into()));
                Ok(Claim::Claimed)
            }
            Correlated::RouterInitiated(message) => {
                self.handle_router_unregistered(message)?;
                Ok(Claim::Claimed)
            }
            Correlated::Unexpected(reason) => Err(protocol_violation(reason)),
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.registers.close();
        self.unregisters.close();
        self.pending_registrations.clear();
        self.pending_unregistrations.clear();
        for (_, call) in self.running_calls.drain() {
            call.cancel();
        }
        for (_, registration) in self.registrations.drain() {
            registration
                .unregistered
                .notify(Err(SessionError::Closing(PeerRole::Callee).into()));
        }
    }
}

#[cfg(test)]
mod callee_test {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use anyhow::Result;
    use futures_util::FutureExt;
    use tokio::sync::mpsc;

    use crate::{
        core::{
            error::{
                InteractionError,
                SessionError,
                WampError,
            },
            id::Id,
            roles::PeerRole,
            types::{
                Dictionary,
                List,
                Value,
            },
            uri::{
                Uri,
                WildcardUri,
            },
        },
        message::message::{
            ErrorMessage,
            InterruptMessage,
            InvocationMessage,
            Message,
            MessageKind,
            RegisteredMessage,
            UnregisteredMessage,
            YieldMessage,
        },
        peer::{
            callee::{
                Callee,
                Invocation,
                InvocationHandler,
                InvocationOutcome,
                ProcedureOptions,
                Registration,
                RpcYield,
            },
            processor::{
                Claim,
                MessageProcessor,
                test_transport::{
                    RecordingTransport,
                    processor_context,
                },
            },
        },
    };

    fn id(value: u64) -> Id {
        Id::try_from(value).unwrap()
    }

    fn procedure() -> WildcardUri {
        WildcardUri::try_from("com.battler.add").unwrap()
    }

    fn sum(invocation: &Invocation) -> u64 {
        invocation
            .arguments
            .iter()
            .filter_map(|value| value.integer())
            .sum()
    }

    async fn add(invocation: Invocation) -> Result<RpcYield> {
        Ok(RpcYield {
            arguments: List::from_iter([Value::Integer(sum(&invocation))]),
            ..Default::default()
        })
    }

    fn adder() -> Arc<dyn InvocationHandler> {
        Arc::new(add)
    }

    async fn register(
        callee: &mut Callee,
        transport: &RecordingTransport,
        handler: Arc<dyn InvocationHandler>,
        registration_id: u64,
    ) -> Registration {
        let pending = callee
            .register(procedure(), handler, ProcedureOptions::default())
            .unwrap();
        let request = match transport.take_sent().as_slice() {
            [Message::Register(message)] => message.request,
            sent => panic!("unexpected messages: {sent:?}"),
        };
        callee
            .process_message(Message::Registered(RegisteredMessage {
                register_request: request,
                registration: id(registration_id),
            }))
            .unwrap();
        pending.wait().await.unwrap()
    }

    fn invocation(request: u64, registration: u64, details: Dictionary) -> Message {
        Message::Invocation(InvocationMessage {
            request: id(request),
            registered_registration: id(registration),
            details,
            arguments: List::from_iter([Value::Integer(1), Value::Integer(2)]),
            arguments_keyword: Dictionary::default(),
        })
    }

    async fn next_outcome(
        outcomes: &mut mpsc::UnboundedReceiver<InvocationOutcome>,
    ) -> InvocationOutcome {
        tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn yields_handler_result() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let mut outcomes = callee.take_outcomes().unwrap();
        let registration = register(&mut callee, &transport, adder(), 7).await;
        assert_eq!(registration.id(), id(7));

        assert_matches::assert_matches!(
            callee.process_message(invocation(1, 7, Dictionary::default())),
            Ok(Claim::Claimed)
        );
        assert_eq!(callee.running_calls(), 1);
        let outcome = next_outcome(&mut outcomes).await;
        callee.complete(outcome);
        assert_eq!(callee.running_calls(), 0);

        pretty_assertions::assert_eq!(
            transport.take_sent(),
            Vec::from_iter([Message::Yield(YieldMessage {
                invocation_request: id(1),
                options: Dictionary::default(),
                arguments: List::from_iter([Value::Integer(3)]),
                arguments_keyword: Dictionary::default(),
            })])
        );
    }

    #[tokio::test]
    async fn invocation_for_unknown_registration_is_violation() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        register(&mut callee, &transport, adder(), 7).await;
        assert_matches::assert_matches!(
            callee.process_message(invocation(1, 99, Dictionary::default())),
            Err(err) => {
                assert_eq!(err.to_string(), "protocol violation: unexpected INVOCATION");
            }
        );
        assert_matches::assert_matches!(
            callee.process_message(Message::Interrupt(InterruptMessage {
                invocation_request: id(1),
                options: Dictionary::default(),
            })),
            Err(err) => {
                assert_eq!(err.to_string(), "protocol violation: unexpected INTERRUPT");
            }
        );
    }

    fn count(from: u64, to: u64) -> RpcYield {
        RpcYield {
            arguments: List::from_iter([Value::Integer(from)]),
            next_yield: (from < to).then(|| async move { Ok(count(from + 1, to)) }.boxed()),
            ..Default::default()
        }
    }

    async fn count_to_three(_: Invocation) -> Result<RpcYield> {
        Ok(count(1, 3))
    }

    fn counter() -> Arc<dyn InvocationHandler> {
        Arc::new(count_to_three)
    }

    async fn fail(invocation: Invocation) -> Result<RpcYield> {
        if sum(&invocation) > 0 {
            Err(WampError::new(Uri::try_from("com.battler.error.overflow").unwrap()).into())
        } else {
            Err(anyhow::anyhow!("nothing to add"))
        }
    }

    async fn panic_on_arguments(invocation: Invocation) -> Result<RpcYield> {
        if sum(&invocation) > 0 {
            panic!("handler panicked");
        }
        Ok(RpcYield::default())
    }

    async fn wait_for_cancellation(invocation: Invocation) -> Result<RpcYield> {
        invocation.cancellation().canceled().await;
        Err(InteractionError::Canceled.into())
    }

    #[tokio::test]
    async fn yields_progressive_results_when_requested() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let mut outcomes = callee.take_outcomes().unwrap();
        register(&mut callee, &transport, counter(), 7).await;

        callee
            .process_message(invocation(
                1,
                7,
                Dictionary::from_iter([("receive_progress".to_owned(), Value::Bool(true))]),
            ))
            .unwrap();
        for _ in 0..3 {
            let outcome = next_outcome(&mut outcomes).await;
            callee.complete(outcome);
        }

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 3);
        let progress = sent
            .iter()
            .map(|message| match message {
                Message::Yield(message) => message.options.get("progress").is_some(),
                message => panic!("unexpected message: {message:?}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(progress, Vec::from_iter([true, true, false]));
        assert_matches::assert_matches!(sent.last(), Some(Message::Yield(message)) => {
            assert_eq!(message.arguments, List::from_iter([Value::Integer(3)]));
        });
    }

    #[tokio::test]
    async fn skips_progressive_results_when_not_requested() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let mut outcomes = callee.take_outcomes().unwrap();
        register(&mut callee, &transport, counter(), 7).await;

        callee
            .process_message(invocation(1, 7, Dictionary::default()))
            .unwrap();
        let outcome = next_outcome(&mut outcomes).await;
        callee.complete(outcome);

        assert_matches::assert_matches!(transport.take_sent().as_slice(), [Message::Yield(message)] => {
            assert!(message.options.is_empty());
            assert_eq!(message.arguments, List::from_iter([Value::Integer(3)]));
        });
    }

    #[tokio::test]
    async fn reports_handler_errors() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let mut outcomes = callee.take_outcomes().unwrap();
        register(&mut callee, &transport, Arc::new(fail), 7).await;

        callee
            .process_message(invocation(1, 7, Dictionary::default()))
            .unwrap();
        let outcome = next_outcome(&mut outcomes).await;
        callee.complete(outcome);
        callee
            .process_message(Message::Invocation(InvocationMessage {
                request: id(2),
                registered_registration: id(7),
                ..Default::default()
            }))
            .unwrap();
        let outcome = next_outcome(&mut outcomes).await;
        callee.complete(outcome);

        pretty_assertions::assert_eq!(
            transport.take_sent(),
            Vec::from_iter([
                Message::Error(ErrorMessage {
                    request_type: MessageKind::Invocation.tag(),
                    request: id(1),
                    error: Uri::try_from("com.battler.error.overflow").unwrap(),
                    ..Default::default()
                }),
                Message::Error(ErrorMessage {
                    request_type: MessageKind::Invocation.tag(),
                    request: id(2),
                    error: Uri::try_from("wamp.error.runtime_error").unwrap(),
                    arguments: List::from_iter([Value::String("nothing to add".to_owned())]),
                    ..Default::default()
                }),
            ])
        );
    }

    #[tokio::test]
    async fn reports_panicking_handler_as_runtime_error() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let mut outcomes = callee.take_outcomes().unwrap();
        register(&mut callee, &transport, Arc::new(panic_on_arguments), 7).await;

        callee
            .process_message(invocation(1, 7, Dictionary::default()))
            .unwrap();
        let outcome = next_outcome(&mut outcomes).await;
        callee.complete(outcome);

        assert_matches::assert_matches!(transport.take_sent().as_slice(), [Message::Error(message)] => {
            assert_eq!(message.error.as_ref(), "wamp.error.runtime_error");
        });
    }

    #[tokio::test]
    async fn reports_unserializable_result_as_error() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let mut outcomes = callee.take_outcomes().unwrap();
        register(&mut callee, &transport, adder(), 7).await;
        transport.fail_yield_serialization();

        callee
            .process_message(invocation(1, 7, Dictionary::default()))
            .unwrap();
        assert_eq!(callee.running_calls(), 1);
        let outcome = next_outcome(&mut outcomes).await;
        callee.complete(outcome);

        assert_matches::assert_matches!(transport.take_sent().as_slice(), [Message::Error(message)] => {
            assert_eq!(message.request_type, MessageKind::Invocation.tag());
            assert_eq!(message.request, id(1));
            assert_eq!(message.error.as_ref(), "wamp.error.serialization_error");
        });
        assert_eq!(callee.running_calls(), 0);
    }

    #[tokio::test]
    async fn interrupt_raises_cancellation_signal() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let mut outcomes = callee.take_outcomes().unwrap();
        register(&mut callee, &transport, Arc::new(wait_for_cancellation), 7).await;

        callee
            .process_message(invocation(1, 7, Dictionary::default()))
            .unwrap();
        assert_matches::assert_matches!(
            callee.process_message(Message::Interrupt(InterruptMessage {
                invocation_request: id(1),
                options: Dictionary::default(),
            })),
            Ok(Claim::Claimed)
        );
        let outcome = next_outcome(&mut outcomes).await;
        callee.complete(outcome);

        assert_matches::assert_matches!(transport.take_sent().as_slice(), [Message::Error(message)] => {
            assert_eq!(message.error.as_ref(), "wamp.error.canceled");
        });
    }

    #[tokio::test]
    async fn passes_invocation_details_to_handler() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recorder: Arc<dyn InvocationHandler> = Arc::new(move |invocation: Invocation| {
            tx.send(invocation).ok();
            async move { Ok::<_, anyhow::Error>(RpcYield::default()) }
        });
        register(&mut callee, &transport, recorder, 7).await;

        callee
            .process_message(invocation(
                1,
                7,
                Dictionary::from_iter([
                    ("caller".to_owned(), Value::Integer(55)),
                    ("timeout".to_owned(), Value::Integer(1500)),
                    (
                        "procedure".to_owned(),
                        Value::String("com.battler.add.more".to_owned()),
                    ),
                ]),
            ))
            .unwrap();
        let invocation = rx.recv().await.unwrap();
        assert_eq!(invocation.id, id(1));
        assert_eq!(invocation.registration, id(7));
        assert_eq!(invocation.caller(), Some(id(55)));
        assert_eq!(invocation.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(invocation.procedure.as_ref(), "com.battler.add.more");
        assert!(!invocation.receive_progress);
        assert!(!invocation.cancellation().is_canceled());
    }

    #[tokio::test]
    async fn unregisters_procedure() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let registration = register(&mut callee, &transport, adder(), 7).await;

        let pending = callee.unregister(&registration).unwrap();
        let request = match transport.take_sent().as_slice() {
            [Message::Unregister(message)] => {
                assert_eq!(message.registered_registration, id(7));
                message.request
            }
            sent => panic!("unexpected messages: {sent:?}"),
        };
        callee
            .process_message(Message::Unregistered(UnregisteredMessage {
                unregister_request: request.value(),
                details: Dictionary::default(),
            }))
            .unwrap();
        pending.wait().await.unwrap();
        registration.unregistered().await.unwrap();

        assert_matches::assert_matches!(callee.unregister(&registration), Err(err) => {
            assert_matches::assert_matches!(
                err.downcast_ref::<SessionError>(),
                Some(SessionError::NoSuchRegistration)
            );
        });
    }

    #[tokio::test]
    async fn router_error_on_unregister_keeps_registration() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let registration = register(&mut callee, &transport, adder(), 7).await;

        let pending = callee.unregister(&registration).unwrap();
        let request = match transport.take_sent().as_slice() {
            [Message::Unregister(message)] => message.request,
            sent => panic!("unexpected messages: {sent:?}"),
        };
        callee
            .process_message(Message::Error(ErrorMessage {
                request_type: MessageKind::Unregister.tag(),
                request,
                error: Uri::try_from("wamp.error.no_such_registration").unwrap(),
                ..Default::default()
            }))
            .unwrap();
        assert_matches::assert_matches!(pending.wait().await, Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(err) => {
                assert_eq!(err.reason.as_ref(), "wamp.error.no_such_registration");
            });
        });
        assert_matches::assert_matches!(
            callee.process_message(invocation(1, 7, Dictionary::default())),
            Ok(Claim::Claimed)
        );
    }

    #[tokio::test]
    async fn router_revokes_registration() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let registration = register(&mut callee, &transport, adder(), 7).await;

        callee
            .process_message(Message::Unregistered(UnregisteredMessage {
                unregister_request: 0,
                details: Dictionary::from_iter([("registration".to_owned(), Value::Integer(7))]),
            }))
            .unwrap();
        registration.unregistered().await.unwrap();

        assert_matches::assert_matches!(
            callee.process_message(Message::Unregistered(UnregisteredMessage {
                unregister_request: 0,
                details: Dictionary::from_iter([("registration".to_owned(), Value::Integer(7))]),
            })),
            Err(err) => {
                assert_eq!(err.to_string(), "protocol violation: unexpected router UNREGISTERED");
            }
        );
    }

    #[tokio::test]
    async fn close_cancels_calls_and_rejects_registrations() {
        let (context, transport) = processor_context();
        let mut callee = Callee::new(context);
        let mut outcomes = callee.take_outcomes().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let waiting: Arc<dyn InvocationHandler> = Arc::new(move |invocation: Invocation| {
            let tx = tx.clone();
            async move {
                invocation.cancellation().canceled().await;
                tx.send(()).ok();
                Ok::<_, anyhow::Error>(RpcYield::default())
            }
        });
        let registration = register(&mut callee, &transport, waiting, 7).await;
        let pending = callee
            .register(procedure(), adder(), ProcedureOptions::default())
            .unwrap();
        callee
            .process_message(invocation(1, 7, Dictionary::default()))
            .unwrap();
        transport.take_sent();

        callee.close();
        rx.recv().await.unwrap();
        assert_matches::assert_matches!(pending.wait().await, Err(err) => {
            assert_eq!(err.to_string(), "callee closing");
        });
        assert_matches::assert_matches!(registration.unregistered().await, Err(err) => {
            assert_eq!(err.to_string(), "callee closing");
        });

        // Outcomes arriving after close are dropped.
        let outcome = next_outcome(&mut outcomes).await;
        callee.complete(outcome);
        assert!(transport.take_sent().is_empty());

        assert_matches::assert_matches!(
            callee.register(procedure(), adder(), ProcedureOptions::default()),
            Err(err) => {
                assert_matches::assert_matches!(
                    err.downcast_ref::<SessionError>(),
                    Some(SessionError::Closed(PeerRole::Callee))
                );
            }
        );
    }

    #[test]
    fn renders_procedure_options() {
        let options = ProcedureOptions {
            match_style: Some(crate::core::match_style::MatchStyle::Prefix),
            invocation_policy: crate::core::invocation_policy::InvocationPolicy::RoundRobin,
            disclose_caller: true,
        };
        pretty_assertions::assert_eq!(
            options.to_dictionary(),
            Dictionary::from_iter([
                ("match".to_owned(), Value::String("prefix".to_owned())),
                ("invoke".to_owned(), Value::String("roundrobin".to_owned())),
                ("disclose_caller".to_owned(), Value::Bool(true)),
            ])
        );
    }
}
