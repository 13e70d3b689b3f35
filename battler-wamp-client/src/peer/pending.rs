use std::marker::PhantomData;

use anyhow::Result;
use log::debug;
use tokio::sync::{
    oneshot,
    watch,
};

use crate::{
    core::{
        error::{
            RequestError,
            RequestResult,
            SessionError,
            WampError,
        },
        hash::HashMap,
        id::Id,
        roles::PeerRole,
    },
    message::{
        common::wamp_error_from_message,
        message::{
            Message,
            MessageKind,
            PublishedMessage,
            RegisteredMessage,
            SubscribedMessage,
            UnregisteredMessage,
            UnsubscribedMessage,
        },
    },
};

/// A message that answers a single request, correlated by request ID.
pub trait CorrelatedResponse: Sized {
    /// The kind of the request being answered.
    const REQUEST_KIND: MessageKind;

    /// The kind of the successful response.
    const RESPONSE_KIND: MessageKind;

    /// Extracts the response from a message, giving the message back if it is of another kind.
    fn from_message(message: Message) -> Result<Self, Message>;

    /// The ID of the answered request.
    ///
    /// Responses sent on the router's own initiative have no request ID.
    fn request_id(&self) -> Option<Id>;
}

macro_rules! correlated_response {
    ($response:ident, $variant:ident, $request_kind:ident, $request_id:expr) => {
        impl CorrelatedResponse for $response {
            const REQUEST_KIND: MessageKind = MessageKind::$request_kind;
            const RESPONSE_KIND: MessageKind = MessageKind::$variant;

            fn from_message(message: Message) -> Result<Self, Message> {
                match message {
                    Message::$variant(message) => Ok(message),
                    message => Err(message),
                }
            }

            fn request_id(&self) -> Option<Id> {
                let request_id: fn(&Self) -> Option<Id> = $request_id;
                request_id(self)
            }
        }
    };
}

correlated_response!(PublishedMessage, Published, Publish, |message| Some(
    message.publish_request
));
correlated_response!(SubscribedMessage, Subscribed, Subscribe, |message| Some(
    message.subscribe_request
));
correlated_response!(UnsubscribedMessage, Unsubscribed, Unsubscribe, |message| {
    Id::try_from(message.unsubscribe_request).ok()
});
correlated_response!(RegisteredMessage, Registered, Register, |message| Some(
    message.register_request
));
correlated_response!(UnregisteredMessage, Unregistered, Unregister, |message| {
    Id::try_from(message.unregister_request).ok()
});

/// The completion side of a single pending request.
///
/// Consumed on completion, so a request can only ever be settled once.
#[derive(Debug)]
pub struct Responder<T> {
    request_id: Id,
    tx: oneshot::Sender<RequestResult<T>>,
}

impl<T> Responder<T> {
    /// The ID of the request being answered.
    pub fn request_id(&self) -> Id {
        self.request_id
    }

    /// Resolves the request.
    pub fn resolve(self, value: T) {
        self.tx.send(Ok(value)).ok();
    }

    /// Rejects the request.
    pub fn reject<E>(self, error: E)
    where
        E: Into<RequestError>,
    {
        self.tx.send(Err(error.into())).ok();
    }
}

/// The waiting side of a single pending request.
#[derive(Debug)]
pub struct PendingResponse<T> {
    role: PeerRole,
    rx: oneshot::Receiver<RequestResult<T>>,
}

impl<T> PendingResponse<T> {
    /// A response that is already settled.
    pub fn ready(role: PeerRole, value: T) -> Self {
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(value)).ok();
        Self { role, rx }
    }

    /// Waits for the request to settle.
    ///
    /// If the owning role processor closes first, the request fails with
    /// [`SessionError::Closing`].
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result.map_err(RequestError::into_error),
            Err(_) => Err(SessionError::Closing(self.role).into()),
        }
    }
}

/// Creates a single pending request that is not tracked by any [`PendingMap`].
pub fn pending_request<T>(role: PeerRole, request_id: Id) -> (Responder<T>, PendingResponse<T>) {
    let (tx, rx) = oneshot::channel();
    (Responder { request_id, tx }, PendingResponse { role, rx })
}

/// The sending side of a one-time notification, such as a subscription ending.
#[derive(Debug)]
pub struct Notifier {
    tx: watch::Sender<Option<RequestResult<()>>>,
}

impl Notifier {
    /// Settles the notification for every waiter.
    pub fn notify(self, result: RequestResult<()>) {
        self.tx.send_replace(Some(result));
    }
}

/// A one-time notification that any number of waiters can await.
#[derive(Debug, Clone)]
pub struct Notification {
    role: PeerRole,
    rx: watch::Receiver<Option<RequestResult<()>>>,
}

impl Notification {
    /// Waits for the notification.
    ///
    /// If the notifier is dropped without settling, the owning role processor is gone and the
    /// notification fails with [`SessionError::Closing`].
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        match result {
            Some(result) => result.map_err(RequestError::into_error),
            None => Err(SessionError::Closing(self.role).into()),
        }
    }
}

/// Creates a new one-time notification.
pub fn notification(role: PeerRole) -> (Notifier, Notification) {
    let (tx, rx) = watch::channel(None);
    (Notifier { tx }, Notification { role, rx })
}

/// The classification of an incoming message by a [`PendingMap`].
#[derive(Debug)]
pub enum Correlated<S, T> {
    /// The message does not belong to this map.
    Declined(Message),
    /// The message answers a pending request, which is handed back for completion.
    Response { response: S, responder: Responder<T> },
    /// The message is an ERROR for a pending request, which was rejected with it.
    Rejected { request_id: Id, error: WampError },
    /// The message is a response sent on the router's own initiative.
    RouterInitiated(S),
    /// The message claims to answer a request that is not pending.
    Unexpected(String),
}

/// A table of requests awaiting a correlated response from the router.
///
/// Matches responses of kind `S` (and ERROR messages for the corresponding request kind) to
/// pending requests, which resolve to `T`.
#[derive(Debug)]
pub struct PendingMap<S, T> {
    role: PeerRole,
    allow_router_initiated: bool,
    pending: HashMap<Id, Responder<T>>,
    closed: bool,
    _response: PhantomData<fn() -> S>,
}

impl<S, T> PendingMap<S, T>
where
    S: CorrelatedResponse,
{
    /// Creates a new map for requests issued by the given role.
    pub fn new(role: PeerRole) -> Self {
        Self {
            role,
            allow_router_initiated: false,
            pending: HashMap::default(),
            closed: false,
            _response: PhantomData,
        }
    }

    /// Allows responses without a request ID, which the router sends on its own initiative.
    pub fn with_router_initiated(mut self) -> Self {
        self.allow_router_initiated = true;
        self
    }

    /// Registers interest in the response to a request.
    pub fn put(&mut self, request_id: Id) -> PendingResponse<T> {
        let (responder, pending) = pending_request(self.role, request_id);
        if self.closed {
            responder.reject(SessionError::Closing(self.role));
        } else {
            self.pending.insert(request_id, responder);
        }
        pending
    }

    /// Forgets a request, for when it could not be sent.
    pub fn remove(&mut self, request_id: Id) -> Option<Responder<T>> {
        self.pending.remove(&request_id)
    }

    /// The number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Classifies an incoming message.
    pub fn handle(&mut self, message: Message) -> Correlated<S, T> {
        if self.closed {
            return Correlated::Declined(message);
        }
        let message = match S::from_message(message) {
            Ok(response) => return self.handle_response(response),
            Err(message) => message,
        };
        match message {
            Message::Error(message) if message.request_type == S::REQUEST_KIND.tag() => {
                let request_id = message.request;
                match self.pending.remove(&request_id) {
                    Some(responder) => {
                        debug!(
                            "{} request {request_id} failed: {}",
                            S::REQUEST_KIND,
                            message.error
                        );
                        let error = wamp_error_from_message(message);
                        responder.reject(error.clone());
                        Correlated::Rejected { request_id, error }
                    }
                    None => Correlated::Unexpected(format!("unexpected {} ERROR", S::REQUEST_KIND)),
                }
            }
            message => Correlated::Declined(message),
        }
    }

    fn handle_response(&mut self, response: S) -> Correlated<S, T> {
        match response.request_id() {
            None if self.allow_router_initiated => Correlated::RouterInitiated(response),
            None => Correlated::Unexpected(format!("unexpected {}", S::RESPONSE_KIND)),
            Some(request_id) => match self.pending.remove(&request_id) {
                Some(responder) => Correlated::Response {
                    response,
                    responder,
                },
                None => Correlated::Unexpected(format!("unexpected {}", S::RESPONSE_KIND)),
            },
        }
    }

    /// Rejects every pending request and stops correlating messages.
    pub fn close(&mut self) {
        self.closed = true;
        for (_, responder) in self.pending.drain() {
            responder.reject(SessionError::Closing(self.role));
        }
    }
}
