use std::sync::Arc;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    StreamExt,
    lock::Mutex,
};
use log::{
    debug,
    error,
    info,
    trace,
    warn,
};
use tokio::{
    sync::{
        broadcast,
        mpsc,
        oneshot,
    },
    task::JoinHandle,
};

use crate::{
    auth::auth_provider::{
        AuthProvider,
        Signature,
    },
    core::{
        cancel::CallCancelMode,
        close::{
            CloseCode,
            CloseInfo,
            CloseReason,
        },
        error::{
            ConnectionCloseError,
            ConnectionOpenError,
            InteractionError,
            SessionError,
        },
        id::{
            Id,
            IdGenerators,
        },
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
            abort_message_for_protocol_violation,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::{
            AbortMessage,
            AuthenticateMessage,
            ChallengeMessage,
            HelloMessage,
            Message,
            MessageKind,
            WelcomeMessage,
        },
    },
    peer::{
        callee::{
            InvocationHandler,
            InvocationOutcome,
            ProcedureOptions,
            Registration,
        },
        caller::{
            PendingRpc,
            RpcCall,
            RpcResult,
        },
        processor::{
            Claim,
            MessageSender,
            ProcessorContext,
            RoleProcessors,
        },
        publisher::{
            Publication,
            PublishedEvent,
        },
        state_machine::{
            ConnectionState,
            ConnectionStateMachine,
            MessageDirection,
        },
        subscriber::{
            EventHandler,
            Subscription,
            SubscriptionOptions,
        },
    },
    serializer::serializer::{
        SerializerType,
        new_serializer,
    },
    transport::transport::{
        Transport,
        TransportEvent,
        TransportEventStream,
        TransportFactory,
    },
};

/// The default agent announced in HELLO.
pub const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

const AUTHENTICATION_FAILED: &str = "Authentication failed";
const PROTOCOL_VIOLATION: &str = "protocol_violation";

/// Configuration for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Name of the connection, mostly for logging.
    pub name: String,
    /// Agent name, communicated to the router.
    pub agent: String,
    /// Endpoint the transport connects to.
    pub endpoint: String,
    /// Realm to join.
    pub realm: Uri,
    /// Serializer used for every message.
    pub serializer: SerializerType,
    /// Authentication for joining the realm.
    pub auth_provider: Option<Arc<dyn AuthProvider>>,
}

impl ConnectionConfig {
    fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::msg("endpoint is required"));
        }
        if self.realm.as_ref().is_empty() {
            return Err(Error::msg("realm is required"));
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT.to_owned(),
            agent: DEFAULT_AGENT.to_owned(),
            endpoint: String::default(),
            realm: Uri::default(),
            serializer: SerializerType::default(),
            auth_provider: None,
        }
    }
}

type OpenResult = Result<Dictionary, ConnectionOpenError>;
type CloseResult = Result<CloseInfo, ConnectionCloseError>;

/// The state of a single opened transport, and the session running over it.
struct ActiveSession {
    transport: Arc<dyn Transport>,
    sender: MessageSender,
    state: ConnectionStateMachine,
    session_id: Option<Id>,
    processors: Option<RoleProcessors>,
    open_tx: Option<oneshot::Sender<OpenResult>>,
    aborted: bool,
}

impl ActiveSession {
    fn resolve_open(&mut self, result: OpenResult) {
        if let Some(open_tx) = self.open_tx.take() {
            open_tx.send(result).ok();
        }
    }
}

#[derive(Default)]
struct ConnectionInner {
    active: Option<ActiveSession>,
}

/// Work that must happen outside of the connection lock.
enum Deferred {
    Challenge {
        provider: Arc<dyn AuthProvider>,
        challenge: ChallengeMessage,
    },
}

/// A client connection to a WAMP router, running at most one session at a time.
///
/// Every inbound message is processed on a single background task, in the order the transport
/// delivers it. Public operations fail with [`SessionError::InvalidSessionState`] unless a session
/// is established.
pub struct Connection {
    config: Arc<ConnectionConfig>,
    transport_factory: Box<dyn TransportFactory>,
    inner: Arc<Mutex<ConnectionInner>>,
    close_tx: broadcast::Sender<CloseResult>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a new connection.
    pub fn new(config: ConnectionConfig, transport_factory: Box<dyn TransportFactory>) -> Result<Self> {
        config.validate()?;
        let (close_tx, _) = broadcast::channel(16);
        Ok(Self {
            config: Arc::new(config),
            transport_factory,
            inner: Arc::new(Mutex::new(ConnectionInner::default())),
            close_tx,
        })
    }

    /// The name of the connection.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Opens the transport and establishes a session in the configured realm.
    ///
    /// Resolves to the details of WELCOME.
    pub async fn open(&self) -> Result<Dictionary> {
        let open_rx = {
            let mut inner = self.inner.lock().await;
            if inner.active.is_some() {
                return Err(SessionError::TransportAlreadyOpen.into());
            }
            let mut transport = self
                .transport_factory
                .new_transport(new_serializer(self.config.serializer));
            let events = transport.open(&self.config.endpoint);
            let transport: Arc<dyn Transport> = Arc::from(transport);
            debug!(
                "Connection {} opened {} transport to {} with {}",
                self.config.name,
                transport.name(),
                self.config.endpoint,
                self.config.serializer.protocol_id()
            );

            let (open_tx, open_rx) = oneshot::channel();
            inner.active = Some(ActiveSession {
                sender: MessageSender::new(self.config.name.as_str().into(), transport.clone()),
                transport,
                state: ConnectionStateMachine::default(),
                session_id: None,
                processors: None,
                open_tx: Some(open_tx),
                aborted: false,
            });
            tokio::spawn(Self::event_loop(
                self.config.clone(),
                self.inner.clone(),
                self.close_tx.clone(),
                events,
            ));
            open_rx
        };
        match open_rx.await {
            Ok(Ok(details)) => Ok(details),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ConnectionOpenError::new("connection dropped").into()),
        }
    }

    /// Closes the session and the transport.
    ///
    /// Resolves once the transport is closed.
    pub async fn close(&self) -> Result<CloseInfo> {
        let closed = self.on_close();
        {
            let mut inner = self.inner.lock().await;
            let session = inner
                .active
                .as_mut()
                .ok_or(SessionError::TransportNotOpen)?;
            match session.state.state() {
                ConnectionState::Established => {
                    debug!("Connection {} closing session", self.config.name);
                    let goodbye =
                        goodbye_with_close_reason(CloseReason::Normal, Some("client shutdown"));
                    match session.sender.send(&goodbye) {
                        Ok(()) => {
                            session
                                .state
                                .update(MessageDirection::Sent, MessageKind::Goodbye);
                        }
                        Err(err) => {
                            warn!(
                                "Connection {} failed to send GOODBYE: {err}",
                                self.config.name
                            );
                            session
                                .transport
                                .close(CloseCode::NORMAL, CloseReason::Normal.uri().as_ref());
                        }
                    }
                }
                ConnectionState::Closing => (),
                _ => session
                    .transport
                    .close(CloseCode::NORMAL, CloseReason::Normal.uri().as_ref()),
            }
        }
        closed.await
    }

    /// Waits for the next teardown of the transport.
    ///
    /// Resolves with the close info if the session closed cleanly, and fails with a
    /// [`ConnectionCloseError`] otherwise.
    pub fn on_close(&self) -> impl Future<Output = Result<CloseInfo>> + Send + 'static {
        let mut close_rx = self.close_tx.subscribe();
        async move {
            match close_rx.recv().await {
                Ok(Ok(info)) => Ok(info),
                Ok(Err(err)) => Err(err.into()),
                Err(err) => Err(Error::new(err).context("failed to wait for connection close")),
            }
        }
    }

    /// The ID of the established session, as assigned by the router.
    pub async fn session_id(&self) -> Option<Id> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .and_then(|session| session.session_id)
    }

    /// The current lifecycle state of the session.
    pub async fn state(&self) -> ConnectionState {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|session| session.state.state())
            .unwrap_or_default()
    }

    async fn with_processors<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RoleProcessors) -> Result<T>,
    {
        let mut inner = self.inner.lock().await;
        match inner
            .active
            .as_mut()
            .and_then(|session| session.processors.as_mut())
        {
            Some(processors) => f(processors),
            None => Err(SessionError::InvalidSessionState.into()),
        }
    }

    /// Publishes an event to a topic.
    ///
    /// The returned publication resolves once the router acknowledges it, if requested.
    pub async fn publish(&self, topic: Uri, event: PublishedEvent) -> Result<Publication> {
        self.with_processors(|processors| processors.publisher.publish(topic, event))
            .await
    }

    /// Subscribes to a topic.
    pub async fn subscribe<H>(&self, topic: WildcardUri, handler: H) -> Result<Subscription>
    where
        H: EventHandler + 'static,
    {
        self.subscribe_with_options(topic, handler, SubscriptionOptions::default())
            .await
    }

    /// Subscribes to a topic with options.
    pub async fn subscribe_with_options<H>(
        &self,
        topic: WildcardUri,
        handler: H,
        options: SubscriptionOptions,
    ) -> Result<Subscription>
    where
        H: EventHandler + 'static,
    {
        let pending = self
            .with_processors(|processors| {
                processors
                    .subscriber
                    .subscribe(topic, Arc::new(handler), options)
            })
            .await?;
        pending.wait().await
    }

    /// Unsubscribes from a topic.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let pending = self
            .with_processors(|processors| processors.subscriber.unsubscribe(subscription))
            .await?;
        pending.wait().await
    }

    /// Calls a procedure.
    ///
    /// Returns as soon as CALL is sent. The request ID of the returned call can be used to cancel
    /// it.
    pub async fn call(&self, procedure: Uri, call: RpcCall) -> Result<PendingRpc> {
        self.with_processors(|processors| processors.caller.call(procedure, call))
            .await
    }

    /// Calls a procedure and waits for its final result, skipping over progressive results.
    pub async fn call_and_wait(&self, procedure: Uri, call: RpcCall) -> Result<RpcResult> {
        let mut result = self.call(procedure, call).await?.result().await?;
        while let Some(next_result) = result.next_result.take() {
            result = next_result.result().await?;
        }
        Ok(result)
    }

    /// Cancels a pending call.
    pub async fn cancel_call(&self, request_id: Id, mode: Option<CallCancelMode>) -> Result<()> {
        self.with_processors(|processors| processors.caller.cancel(request_id, mode))
            .await
    }

    /// Registers a procedure.
    pub async fn register<H>(&self, procedure: WildcardUri, handler: H) -> Result<Registration>
    where
        H: InvocationHandler + 'static,
    {
        self.register_with_options(procedure, handler, ProcedureOptions::default())
            .await
    }

    /// Registers a procedure with options.
    pub async fn register_with_options<H>(
        &self,
        procedure: WildcardUri,
        handler: H,
        options: ProcedureOptions,
    ) -> Result<Registration>
    where
        H: InvocationHandler + 'static,
    {
        let pending = self
            .with_processors(|processors| {
                processors
                    .callee
                    .register(procedure, Arc::new(handler), options)
            })
            .await?;
        pending.wait().await
    }

    /// Unregisters a procedure.
    pub async fn unregister(&self, registration: &Registration) -> Result<()> {
        let pending = self
            .with_processors(|processors| processors.callee.unregister(registration))
            .await?;
        pending.wait().await
    }

    async fn event_loop(
        config: Arc<ConnectionConfig>,
        inner: Arc<Mutex<ConnectionInner>>,
        close_tx: broadcast::Sender<CloseResult>,
        mut events: TransportEventStream,
    ) {
        let mut outcomes: Option<mpsc::UnboundedReceiver<InvocationOutcome>> = None;
        let (signatures_tx, mut signatures) = mpsc::unbounded_channel();
        let mut challenge_task: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                event = events.next() => {
                    let event = match event {
                        Some(event) => event,
                        None => TransportEvent::Close(CloseInfo {
                            code: CloseCode::ABNORMAL,
                            reason: "transport ended".to_owned(),
                            was_clean: false,
                        }),
                    };
                    let deferred = {
                        let mut inner = inner.lock().await;
                        let session = match inner.active.as_mut() {
                            Some(session) => session,
                            None => break,
                        };
                        match event {
                            TransportEvent::Open => {
                                Self::send_hello(&config, session);
                                None
                            }
                            TransportEvent::Message(message) => {
                                Self::handle_message(&config, session, &mut outcomes, message)
                            }
                            TransportEvent::Error(err) => {
                                warn!("Connection {} transport failed: {err}", config.name);
                                session.transport.close(CloseCode::ABNORMAL, &err);
                                Self::teardown(&config, &mut inner, &close_tx, CloseInfo {
                                    code: CloseCode::ABNORMAL,
                                    reason: err,
                                    was_clean: false,
                                });
                                break;
                            }
                            TransportEvent::Close(info) => {
                                Self::teardown(&config, &mut inner, &close_tx, info);
                                break;
                            }
                        }
                    };
                    if let Some(deferred) = deferred {
                        let task = Self::spawn_deferred(&config, deferred, signatures_tx.clone());
                        if let Some(previous) = challenge_task.replace(task) {
                            previous.abort();
                        }
                    }
                }
                Some(signature) = signatures.recv() => {
                    let mut inner = inner.lock().await;
                    if let Some(session) = inner.active.as_mut() {
                        Self::answer_challenge(&config, session, signature);
                    }
                }
                Some(outcome) = Self::next_outcome(&mut outcomes) => {
                    let mut inner = inner.lock().await;
                    if let Some(processors) = inner
                        .active
                        .as_mut()
                        .and_then(|session| session.processors.as_mut())
                    {
                        processors.callee.complete(outcome);
                    }
                }
            }
        }
        if let Some(challenge_task) = challenge_task {
            challenge_task.abort();
        }
        debug!("Connection {} event loop finished", config.name);
    }

    async fn next_outcome(
        outcomes: &mut Option<mpsc::UnboundedReceiver<InvocationOutcome>>,
    ) -> Option<InvocationOutcome> {
        match outcomes {
            Some(outcomes) => outcomes.recv().await,
            None => futures_util::future::pending().await,
        }
    }

    fn send_hello(config: &ConnectionConfig, session: &mut ActiveSession) {
        let mut details = Dictionary::default();
        details.insert("agent".to_owned(), Value::String(config.agent.clone()));
        details.insert("roles".to_owned(), Value::Dictionary(RoleProcessors::roles()));
        if let Some(auth_provider) = &config.auth_provider {
            details.insert(
                "authid".to_owned(),
                Value::String(auth_provider.auth_id().to_owned()),
            );
            details.insert(
                "authmethods".to_owned(),
                Value::List(List::from_iter([Value::String(
                    auth_provider.auth_method().to_owned(),
                )])),
            );
        }
        let hello = Message::Hello(HelloMessage {
            realm: config.realm.clone(),
            details,
        });
        match session.sender.send(&hello) {
            Ok(()) => {
                let state = session
                    .state
                    .update(MessageDirection::Sent, MessageKind::Hello);
                debug!("Connection {} sent HELLO, now {state}", config.name);
            }
            Err(err) => {
                Self::handle_protocol_violation(config, session, &format!("transport error: {err}"))
            }
        }
    }

    fn handle_message(
        config: &ConnectionConfig,
        session: &mut ActiveSession,
        outcomes: &mut Option<mpsc::UnboundedReceiver<InvocationOutcome>>,
        message: Message,
    ) -> Option<Deferred> {
        trace!(
            "Connection {} received message: {message:?}",
            config.name
        );
        if session.aborted {
            debug!(
                "Connection {} dropped {} after abort",
                config.name,
                message.message_name()
            );
            return None;
        }
        if session.state.state() == ConnectionState::Established {
            Self::handle_established_message(config, session, message);
            None
        } else {
            Self::handle_session_message(config, session, outcomes, message)
        }
    }

    fn handle_established_message(
        config: &ConnectionConfig,
        session: &mut ActiveSession,
        message: Message,
    ) {
        let message = match message {
            Message::Goodbye(goodbye) => {
                info!(
                    "Connection {} received GOODBYE from the router: {}",
                    config.name, goodbye.reason
                );
                session
                    .state
                    .update(MessageDirection::Received, MessageKind::Goodbye);
                if let Err(err) = session.sender.send(&goodbye_and_out()) {
                    warn!("Connection {} failed to send GOODBYE: {err}", config.name);
                }
                session
                    .state
                    .update(MessageDirection::Sent, MessageKind::Goodbye);
                session
                    .transport
                    .close(CloseCode::NORMAL, CloseReason::Normal.uri().as_ref());
                return;
            }
            Message::Abort(abort) => {
                warn!(
                    "Connection {} session aborted by the router: {}",
                    config.name, abort.reason
                );
                session.aborted = true;
                session
                    .transport
                    .close(CloseCode::ABNORMAL, abort.reason.as_ref());
                return;
            }
            message => message,
        };

        let processors = match session.processors.as_mut() {
            Some(processors) => processors,
            None => {
                Self::handle_protocol_violation(config, session, "no role processors");
                return;
            }
        };
        match processors.dispatch(message) {
            Ok(Claim::Claimed) => (),
            Ok(Claim::Declined(message)) => {
                error!(
                    "Connection {} received unhandled message: {message:?}",
                    config.name
                );
                Self::handle_protocol_violation(config, session, "no handler found for message");
            }
            Err(InteractionError::ProtocolViolation(reason)) => {
                Self::handle_protocol_violation(config, session, &reason)
            }
            Err(err) => Self::handle_protocol_violation(config, session, &err.to_string()),
        }
    }

    fn handle_session_message(
        config: &ConnectionConfig,
        session: &mut ActiveSession,
        outcomes: &mut Option<mpsc::UnboundedReceiver<InvocationOutcome>>,
        message: Message,
    ) -> Option<Deferred> {
        let previous = session.state.state();
        let kind = message.kind();
        let state = session.state.update(MessageDirection::Received, kind);
        debug!(
            "Connection {} received {kind} while {previous}, now {state}",
            config.name
        );
        match (state, message) {
            (ConnectionState::Established, Message::Welcome(welcome)) => {
                Self::establish(config, session, outcomes, welcome);
                None
            }
            (ConnectionState::Challenging, Message::Challenge(challenge)) => {
                match config
                    .auth_provider
                    .clone()
                    .filter(|provider| !provider.is_transport_level())
                {
                    Some(provider) => Some(Deferred::Challenge {
                        provider,
                        challenge,
                    }),
                    None => {
                        warn!(
                            "Connection {} received CHALLENGE for {} without a session-level auth provider",
                            config.name, challenge.auth_method
                        );
                        session
                            .transport
                            .close(CloseCode::ABNORMAL, AUTHENTICATION_FAILED);
                        None
                    }
                }
            }
            (ConnectionState::Closed, _) => {
                session
                    .transport
                    .close(CloseCode::NORMAL, CloseReason::Normal.uri().as_ref());
                None
            }
            (ConnectionState::Error, Message::Abort(abort)) => {
                Self::handle_abort(config, session, abort);
                None
            }
            (_, message) => {
                Self::handle_protocol_violation(
                    config,
                    session,
                    &format!("unexpected {} while {previous}", message.message_name()),
                );
                None
            }
        }
    }

    fn establish(
        config: &ConnectionConfig,
        session: &mut ActiveSession,
        outcomes: &mut Option<mpsc::UnboundedReceiver<InvocationOutcome>>,
        welcome: WelcomeMessage,
    ) {
        let context = ProcessorContext {
            sender: session.sender.clone(),
            ids: Arc::new(IdGenerators::default()),
        };
        let mut processors = RoleProcessors::new(context);
        *outcomes = processors.callee.take_outcomes();
        session.processors = Some(processors);
        session.session_id = Some(welcome.session);
        info!(
            "Connection {} established session {} in realm {}",
            config.name, welcome.session, config.realm
        );
        session.resolve_open(Ok(welcome.details));
    }

    fn handle_abort(config: &ConnectionConfig, session: &mut ActiveSession, abort: AbortMessage) {
        warn!(
            "Connection {} failed to establish session: {}",
            config.name, abort.reason
        );
        session.aborted = true;
        session
            .transport
            .close(CloseCode::ABNORMAL, abort.reason.as_ref());
        session.resolve_open(Err(ConnectionOpenError {
            reason: abort.reason.to_string(),
            details: abort.details,
        }));
    }

    fn handle_protocol_violation(config: &ConnectionConfig, session: &mut ActiveSession, reason: &str) {
        error!("Connection {} protocol violation: {reason}", config.name);
        if session.aborted {
            return;
        }
        session.aborted = true;
        if let Err(err) = session
            .sender
            .send(&abort_message_for_protocol_violation(reason))
        {
            warn!("Connection {} failed to send ABORT: {err}", config.name);
        }
        session
            .transport
            .close(CloseCode::ABNORMAL, PROTOCOL_VIOLATION);
        session.resolve_open(Err(ConnectionOpenError {
            reason: "protocol violation".to_owned(),
            details: Dictionary::from_iter([(
                "message".to_owned(),
                Value::String(reason.to_owned()),
            )]),
        }));
    }

    fn spawn_deferred(
        config: &ConnectionConfig,
        deferred: Deferred,
        signatures: mpsc::UnboundedSender<Result<Signature>>,
    ) -> JoinHandle<()> {
        match deferred {
            Deferred::Challenge {
                provider,
                challenge,
            } => {
                debug!(
                    "Connection {} computing {} challenge",
                    config.name, challenge.auth_method
                );
                tokio::spawn(async move {
                    let signature = provider.compute_challenge(&challenge.extra).await;
                    signatures.send(signature).ok();
                })
            }
        }
    }

    fn answer_challenge(
        config: &ConnectionConfig,
        session: &mut ActiveSession,
        signature: Result<Signature>,
    ) {
        if session.state.state() != ConnectionState::Challenging {
            debug!(
                "Connection {} dropped challenge answer while {}",
                config.name,
                session.state.state()
            );
            return;
        }
        let authenticate = signature.and_then(|signature| {
            let message = Message::Authenticate(AuthenticateMessage {
                signature: signature.signature,
                extra: signature.details,
            });
            session.sender.send(&message).map_err(Error::new)
        });
        match authenticate {
            Ok(()) => {
                session
                    .state
                    .update(MessageDirection::Sent, MessageKind::Authenticate);
            }
            Err(err) => {
                warn!(
                    "Connection {} failed to answer CHALLENGE: {err:#}",
                    config.name
                );
                session
                    .transport
                    .close(CloseCode::ABNORMAL, AUTHENTICATION_FAILED);
            }
        }
    }

    fn teardown(
        config: &ConnectionConfig,
        inner: &mut ConnectionInner,
        close_tx: &broadcast::Sender<CloseResult>,
        info: CloseInfo,
    ) {
        let mut session = match inner.active.take() {
            Some(session) => session,
            None => return,
        };
        if let Some(mut processors) = session.processors.take() {
            processors.close();
        }
        session.resolve_open(Err(ConnectionOpenError::new(info.reason.clone())));

        let result = if info.is_clean() {
            info!(
                "Connection {} closed: {} ({})",
                config.name, info.reason, info.code
            );
            Ok(info)
        } else {
            warn!(
                "Connection {} closed abnormally: {} ({})",
                config.name, info.reason, info.code
            );
            Err(ConnectionCloseError {
                code: info.code,
                reason: info.reason,
            })
        };
        // Nobody may be waiting.
        close_tx.send(result).ok();
    }
}
