use anyhow::Result;
use log::debug;

use crate::{
    core::{
        error::{
            InteractionError,
            SessionError,
        },
        id::Id,
        roles::PeerRole,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        Message,
        PublishMessage,
        PublishedMessage,
    },
    peer::{
        pending::{
            Correlated,
            PendingMap,
            PendingResponse,
        },
        processor::{
            Claim,
            MessageProcessor,
            ProcessorContext,
            protocol_violation,
        },
    },
};

/// Options for publishing an event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// The router should acknowledge the publication with PUBLISHED.
    pub acknowledge: bool,
    /// The publisher should not receive its own event. Routers exclude the publisher by default.
    pub exclude_me: Option<bool>,
    /// The publisher's identity should be disclosed to subscribers.
    pub disclose_me: bool,
    /// Sessions that should not receive the event.
    pub exclude: Vec<Id>,
    /// Authentication IDs that should not receive the event.
    pub exclude_authid: Vec<String>,
    /// Authentication roles that should not receive the event.
    pub exclude_authrole: Vec<String>,
    /// The only sessions that may receive the event.
    pub eligible: Vec<Id>,
    /// The only authentication IDs that may receive the event.
    pub eligible_authid: Vec<String>,
    /// The only authentication roles that may receive the event.
    pub eligible_authrole: Vec<String>,
}

fn id_list(ids: &[Id]) -> Value {
    Value::List(ids.iter().map(|id| Value::from(*id)).collect())
}

fn string_list(strings: &[String]) -> Value {
    Value::List(strings.iter().map(|s| Value::String(s.clone())).collect())
}

impl PublishOptions {
    /// The options dictionary for PUBLISH.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut options = Dictionary::default();
        if self.acknowledge {
            options.insert("acknowledge".to_owned(), Value::Bool(true));
        }
        if let Some(exclude_me) = self.exclude_me {
            options.insert("exclude_me".to_owned(), Value::Bool(exclude_me));
        }
        if self.disclose_me {
            options.insert("disclose_me".to_owned(), Value::Bool(true));
        }
        for (key, ids) in [("exclude", &self.exclude), ("eligible", &self.eligible)] {
            if !ids.is_empty() {
                options.insert(key.to_owned(), id_list(ids));
            }
        }
        for (key, strings) in [
            ("exclude_authid", &self.exclude_authid),
            ("exclude_authrole", &self.exclude_authrole),
            ("eligible_authid", &self.eligible_authid),
            ("eligible_authrole", &self.eligible_authrole),
        ] {
            if !strings.is_empty() {
                options.insert(key.to_owned(), string_list(strings));
            }
        }
        options
    }
}

/// An event to publish to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub options: PublishOptions,
}

/// An event that was handed to the router.
#[derive(Debug)]
pub struct Publication {
    request_id: Id,
    acknowledgement: Option<PendingResponse<Id>>,
}

impl Publication {
    /// The request ID of the PUBLISH message.
    pub fn request_id(&self) -> Id {
        self.request_id
    }

    /// Waits for the publication to be acknowledged.
    ///
    /// Resolves to the publication ID assigned by the router, or [`None`] immediately if no
    /// acknowledgement was requested.
    pub async fn published(self) -> Result<Option<Id>> {
        match self.acknowledgement {
            Some(acknowledgement) => acknowledgement.wait().await.map(Some),
            None => Ok(None),
        }
    }
}

/// The publisher role, which publishes events to topics.
#[derive(Debug)]
pub struct Publisher {
    context: ProcessorContext,
    publications: PendingMap<PublishedMessage, Id>,
    closed: bool,
}

impl Publisher {
    pub const FEATURES: &'static [&'static str] = &[
        "publisher_exclusion",
        "publisher_identification",
        "subscriber_blackwhite_listing",
    ];

    pub fn new(context: ProcessorContext) -> Self {
        Self {
            context,
            publications: PendingMap::new(PeerRole::Publisher),
            closed: false,
        }
    }

    /// Publishes an event to a topic.
    pub fn publish(&mut self, topic: Uri, event: PublishedEvent) -> Result<Publication> {
        if self.closed {
            return Err(SessionError::Closed(PeerRole::Publisher).into());
        }
        let request_id = self.context.next_request_id();
        let acknowledge = event.options.acknowledge;
        let message = Message::Publish(PublishMessage {
            request: request_id,
            options: event.options.to_dictionary(),
            topic,
            arguments: event.arguments,
            arguments_keyword: event.arguments_keyword,
        });

        let acknowledgement = acknowledge.then(|| self.publications.put(request_id));
        if let Err(err) = self.context.sender.send_request(&message) {
            self.publications.remove(request_id);
            return Err(err.into());
        }
        debug!(
            "Connection {} published request {request_id}",
            self.context.name()
        );
        Ok(Publication {
            request_id,
            acknowledgement,
        })
    }
}

impl MessageProcessor for Publisher {
    fn role(&self) -> PeerRole {
        PeerRole::Publisher
    }

    fn features(&self) -> &'static [&'static str] {
        Self::FEATURES
    }

    fn process_message(&mut self, message: Message) -> Result<Claim, InteractionError> {
        if self.closed {
            return Ok(Claim::Declined(message));
        }
        match self.publications.handle(message) {
            Correlated::Declined(message) => Ok(Claim::Declined(message)),
            Correlated::Response {
                response,
                responder,
            } => {
                responder.resolve(response.publication);
                Ok(Claim::Claimed)
            }
            Correlated::Rejected { .. } => Ok(Claim::Claimed),
            Correlated::RouterInitiated(_) => Err(protocol_violation("unexpected PUBLISHED")),
            Correlated::Unexpected(reason) => Err(protocol_violation(reason)),
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.publications.close();
    }
}
