use std::{
    fmt::Debug,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use anyhow::Result;
use log::{
    debug,
    warn,
};

use crate::{
    core::{
        error::{
            InteractionError,
            RequestError,
            RequestResult,
            SessionError,
        },
        hash::HashMap,
        id::{
            Id,
            IdAllocator,
        },
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
            id_from_details,
            uri_from_details,
        },
        message::{
            EventMessage,
            Message,
            SubscribeMessage,
            SubscribedMessage,
            UnsubscribeMessage,
            UnsubscribedMessage,
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
};

/// Options for subscribing to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// How the subscription should be matched for published events.
    pub match_style: Option<MatchStyle>,
}

impl SubscriptionOptions {
    /// The options dictionary for SUBSCRIBE.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut options = Dictionary::default();
        if let Some(match_style) = self.match_style {
            options.insert(
                "match".to_owned(),
                Value::String(match_style.as_str().to_owned()),
            );
        }
        options
    }
}

/// An event received for a subscription.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Event {
    /// The subscription the event was delivered for.
    pub subscription: Id,
    /// The publication ID assigned by the router.
    pub publication: Id,
    /// The topic the event was published to.
    pub topic: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
}

impl Event {
    /// The session that published the event, if disclosed.
    pub fn publisher(&self) -> Option<Id> {
        id_from_details(&self.details, "publisher")
    }
}

/// A handler for events published to a subscribed topic.
///
/// Handlers run synchronously as each event is dispatched, so they should hand off long-running
/// work.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: Event);
}

impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync,
{
    fn handle_event(&self, event: Event) {
        self(event)
    }
}

/// A subscription to a topic.
///
/// Several subscriptions may share the same router subscription ID. The router subscription is
/// only removed when the last of them unsubscribes.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: Id,
    handler_id: Id,
    topic: WildcardUri,
    unsubscribed: Notification,
}

impl Subscription {
    /// The subscription ID assigned by the router.
    pub fn id(&self) -> Id {
        self.id
    }

    /// The subscribed topic.
    pub fn topic(&self) -> &WildcardUri {
        &self.topic
    }

    /// Waits for the subscription to end.
    ///
    /// Resolves when the subscription is unsubscribed locally or revoked by the router, and fails
    /// if the session ends first.
    pub async fn unsubscribed(&self) -> Result<()> {
        self.unsubscribed.wait().await
    }
}

struct LocalHandler {
    id: Id,
    handler: Arc<dyn EventHandler>,
    unsubscribed: Notifier,
}

impl Debug for LocalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHandler").field("id", &self.id).finish()
    }
}

/// Every local handler multiplexed onto a single router subscription.
#[derive(Debug)]
struct SharedSubscription {
    topic: WildcardUri,
    handlers: Vec<LocalHandler>,
    draining: Vec<Notifier>,
}

impl SharedSubscription {
    fn finish(self, result: RequestResult<()>) {
        for handler in self.handlers {
            handler.unsubscribed.notify(result.clone());
        }
        for notifier in self.draining {
            notifier.notify(result.clone());
        }
    }
}

struct PendingSubscription {
    topic: WildcardUri,
    handler: Arc<dyn EventHandler>,
}

impl Debug for PendingSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSubscription")
            .field("topic", &self.topic)
            .finish()
    }
}

/// The subscriber role, which receives events for subscribed topics.
#[derive(Debug)]
pub struct Subscriber {
    context: ProcessorContext,
    subscribes: PendingMap<SubscribedMessage, Subscription>,
    unsubscribes: PendingMap<UnsubscribedMessage, ()>,
    pending_subscriptions: HashMap<Id, PendingSubscription>,
    pending_unsubscriptions: HashMap<Id, Id>,
    subscriptions: HashMap<Id, SharedSubscription>,
    closed: bool,
}

impl Subscriber {
    pub const FEATURES: &'static [&'static str] =
        &["publisher_identification", "pattern_based_subscription"];

    pub fn new(context: ProcessorContext) -> Self {
        Self {
            context,
            subscribes: PendingMap::new(PeerRole::Subscriber),
            unsubscribes: PendingMap::new(PeerRole::Subscriber).with_router_initiated(),
            pending_subscriptions: HashMap::default(),
            pending_unsubscriptions: HashMap::default(),
            subscriptions: HashMap::default(),
            closed: false,
        }
    }

    /// Subscribes to a topic.
    ///
    /// The handler is registered before the subscription resolves, so it receives every event
    /// that follows SUBSCRIBED.
    pub fn subscribe(
        &mut self,
        topic: WildcardUri,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> Result<PendingResponse<Subscription>> {
        if self.closed {
            return Err(SessionError::Closed(PeerRole::Subscriber).into());
        }
        let request_id = self.context.next_request_id();
        let message = Message::Subscribe(SubscribeMessage {
            request: request_id,
            options: options.to_dictionary(),
            topic: topic.clone(),
        });

        let pending = self.subscribes.put(request_id);
        self.pending_subscriptions
            .insert(request_id, PendingSubscription { topic, handler });
        if let Err(err) = self.context.sender.send_request(&message) {
            self.subscribes.remove(request_id);
            self.pending_subscriptions.remove(&request_id);
            return Err(err.into());
        }
        debug!(
            "Connection {} subscribing with request {request_id}",
            self.context.name()
        );
        Ok(pending)
    }

    /// Unsubscribes a single subscription.
    ///
    /// If other subscriptions share the router subscription, this one resolves immediately.
    /// Otherwise, UNSUBSCRIBE is sent and the subscription resolves once the router confirms.
    pub fn unsubscribe(&mut self, subscription: &Subscription) -> Result<PendingResponse<()>> {
        if self.closed {
            return Err(SessionError::Closed(PeerRole::Subscriber).into());
        }
        let shared = self
            .subscriptions
            .get_mut(&subscription.id)
            .ok_or(SessionError::NoSuchSubscription)?;
        let index = shared
            .handlers
            .iter()
            .position(|handler| handler.id == subscription.handler_id)
            .ok_or(SessionError::NoSuchSubscription)?;

        if shared.handlers.len() > 1 {
            let handler = shared.handlers.remove(index);
            debug!(
                "Connection {} removed handler from shared subscription {}",
                self.context.name(),
                subscription.id
            );
            handler.unsubscribed.notify(Ok(()));
            return Ok(PendingResponse::ready(PeerRole::Subscriber, ()));
        }

        // The last handler stays active until UNSUBSCRIBE is actually sent.
        let request_id = self.context.next_request_id();
        let message = Message::Unsubscribe(UnsubscribeMessage {
            request: request_id,
            subscribed_subscription: subscription.id,
        });
        let pending = self.unsubscribes.put(request_id);
        self.pending_unsubscriptions
            .insert(request_id, subscription.id);
        if let Err(err) = self.context.sender.send_request(&message) {
            self.unsubscribes.remove(request_id);
            self.pending_unsubscriptions.remove(&request_id);
            return Err(err.into());
        }
        let handler = shared.handlers.remove(index);
        shared.draining.push(handler.unsubscribed);
        debug!(
            "Connection {} unsubscribing from {} with request {request_id}",
            self.context.name(),
            subscription.id
        );
        Ok(pending)
    }

    fn handle_subscribed(
        &mut self,
        response: SubscribedMessage,
        responder: Responder<Subscription>,
    ) {
        let request_id = responder.request_id();
        let pending = match self.pending_subscriptions.remove(&request_id) {
            Some(pending) => pending,
            None => {
                responder.reject(SessionError::NoSuchSubscription);
                return;
            }
        };
        let handler_id = self.context.ids.global.generate_id();
        let (notifier, unsubscribed) = notification(PeerRole::Subscriber);
        let shared = self
            .subscriptions
            .entry(response.subscription)
            .or_insert_with(|| SharedSubscription {
                topic: pending.topic.clone(),
                handlers: Vec::new(),
                draining: Vec::new(),
            });
        shared.handlers.push(LocalHandler {
            id: handler_id,
            handler: pending.handler,
            unsubscribed: notifier,
        });
        debug!(
            "Connection {} subscribed to {} with subscription {}",
            self.context.name(),
            pending.topic,
            response.subscription
        );
        responder.resolve(Subscription {
            id: response.subscription,
            handler_id,
            topic: pending.topic,
            unsubscribed,
        });
    }

    fn handle_unsubscribed(&mut self, request_id: Id, result: RequestResult<()>) {
        let subscription_id = match self.pending_unsubscriptions.remove(&request_id) {
            Some(subscription_id) => subscription_id,
            None => return,
        };
        match result {
            Ok(()) => {
                if let Some(shared) = self.subscriptions.remove(&subscription_id) {
                    shared.finish(Ok(()));
                }
            }
            Err(err) => {
                // The router subscription stays in place, with no handlers left.
                if let Some(shared) = self.subscriptions.get_mut(&subscription_id) {
                    for notifier in shared.draining.drain(..) {
                        notifier.notify(Err(err.clone()));
                    }
                }
            }
        }
    }

    fn handle_router_unsubscribed(
        &mut self,
        message: UnsubscribedMessage,
    ) -> Result<(), InteractionError> {
        let subscription_id = id_from_details(&message.details, "subscription")
            .ok_or_else(|| protocol_violation("invalid router UNSUBSCRIBED"))?;
        let shared = self
            .subscriptions
            .remove(&subscription_id)
            .ok_or_else(|| protocol_violation("unexpected router UNSUBSCRIBED"))?;
        debug!(
            "Connection {} had subscription {subscription_id} revoked by the router",
            self.context.name()
        );
        shared.finish(Ok(()));
        Ok(())
    }

    fn handle_event(&mut self, message: EventMessage) -> Result<(), InteractionError> {
        let shared = self
            .subscriptions
            .get(&message.subscribed_subscription)
            .ok_or_else(|| protocol_violation("unexpected EVENT"))?;
        let topic = uri_from_details(&message.details, "topic")
            .unwrap_or_else(|| Uri::from_known(shared.topic.to_string()));
        let event = Event {
            subscription: message.subscribed_subscription,
            publication: message.published_publication,
            topic,
            arguments: message.arguments,
            arguments_keyword: message.arguments_keyword,
            details: message.details,
        };
        for handler in &shared.handlers {
            let event = event.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler.handler.handle_event(event)))
                .is_err()
            {
                warn!(
                    "Connection {} event handler panicked for publication {} on subscription {}",
                    self.context.name(),
                    message.published_publication,
                    message.subscribed_subscription
                );
            }
        }
        Ok(())
    }
}

impl MessageProcessor for Subscriber {
    fn role(&self) -> PeerRole {
        PeerRole::Subscriber
    }

    fn features(&self) -> &'static [&'static str] {
        Self::FEATURES
    }

    fn process_message(&mut self, message: Message) -> Result<Claim, InteractionError> {
        if self.closed {
            return Ok(Claim::Declined(message));
        }
        let message = match self.subscribes.handle(message) {
            Correlated::Declined(message) => message,
            Correlated::Response {
                response,
                responder,
            } => {
                self.handle_subscribed(response, responder);
                return Ok(Claim::Claimed);
            }
            Correlated::Rejected { request_id, .. } => {
                self.pending_subscriptions.remove(&request_id);
                return Ok(Claim::Claimed);
            }
            Correlated::RouterInitiated(_) => return Err(protocol_violation("unexpected SUBSCRIBED")),
            Correlated::Unexpected(reason) => return Err(protocol_violation(reason)),
        };

        let message = match message {
            Message::Event(message) => {
                self.handle_event(message)?;
                return Ok(Claim::Claimed);
            }
            message => message,
        };

        match self.unsubscribes.handle(message) {
            Correlated::Declined(message) => Ok(Claim::Declined(message)),
            Correlated::Response { responder, .. } => {
                self.handle_unsubscribed(responder.request_id(), Ok(()));
                responder.resolve(());
                Ok(Claim::Claimed)
            }
            Correlated::Rejected { request_id, error } => {
                self.handle_unsubscribed(request_id, Err(RequestError::Remote(error)));
                Ok(Claim::Claimed)
            }
            Correlated::RouterInitiated(message) => {
                self.handle_router_unsubscribed(message)?;
                Ok(Claim::Claimed)
            }
            Correlated::Unexpected(reason) => Err(protocol_violation(reason)),
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.subscribes.close();
        self.unsubscribes.close();
        self.pending_subscriptions.clear();
        self.pending_unsubscriptions.clear();
        for (_, shared) in self.subscriptions.drain() {
            shared.finish(Err(SessionError::Closing(PeerRole::Subscriber).into()));
        }
    }
}
