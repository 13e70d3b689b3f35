use std::{
    fmt::Debug,
    future::Future,
};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{
    FutureExt,
    future::BoxFuture,
};

use crate::{
    auth::auth_provider::{
        AuthProvider,
        Signature,
    },
    core::types::Dictionary,
};

type TicketFn = dyn Fn(Dictionary) -> BoxFuture<'static, Result<Signature>> + Send + Sync;

/// Login with a ticket, such as a password or a static token.
///
/// The ticket is produced by a callback for every challenge, so it never needs to be stored.
pub struct TicketAuthProvider {
    auth_id: String,
    auth_method: String,
    ticket: Box<TicketFn>,
}

impl TicketAuthProvider {
    /// Creates a new provider for the `ticket` authentication method.
    pub fn new<S, F, Fut>(auth_id: S, ticket: F) -> Self
    where
        S: Into<String>,
        F: Fn(Dictionary) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Signature>> + Send + 'static,
    {
        Self {
            auth_id: auth_id.into(),
            auth_method: "ticket".to_owned(),
            ticket: Box::new(move |extra| ticket(extra).boxed()),
        }
    }

    /// Overrides the authentication method announced to the router.
    pub fn with_auth_method<S>(mut self, auth_method: S) -> Self
    where
        S: Into<String>,
    {
        self.auth_method = auth_method.into();
        self
    }
}

impl Debug for TicketAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketAuthProvider")
            .field("auth_id", &self.auth_id)
            .field("auth_method", &self.auth_method)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthProvider for TicketAuthProvider {
    fn auth_id(&self) -> &str {
        &self.auth_id
    }

    fn auth_method(&self) -> &str {
        &self.auth_method
    }

    fn is_transport_level(&self) -> bool {
        false
    }

    async fn compute_challenge(&self, extra: &Dictionary) -> Result<Signature> {
        (self.ticket)(extra.clone()).await
    }
}
