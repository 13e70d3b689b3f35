use std::fmt::Debug;

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;

use crate::core::types::Dictionary;

/// The answer to an authentication challenge, sent in AUTHENTICATE.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signature: String,
    pub details: Dictionary,
}

impl Signature {
    pub fn new<S>(signature: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            signature: signature.into(),
            details: Dictionary::default(),
        }
    }
}

/// A provider of client authentication for a WAMP session.
///
/// The auth ID and method are announced in HELLO. Session-level providers answer the router's
/// CHALLENGE; transport-level providers rely on credentials already presented by the transport
/// (such as cookies or TLS client certificates) and are never asked to answer a challenge.
#[async_trait]
pub trait AuthProvider: Send + Sync + Debug {
    /// The identity to authenticate as.
    fn auth_id(&self) -> &str;

    /// The authentication method.
    fn auth_method(&self) -> &str;

    /// Whether authentication happens on the transport level.
    fn is_transport_level(&self) -> bool;

    /// Computes the signature for a CHALLENGE.
    async fn compute_challenge(&self, extra: &Dictionary) -> Result<Signature>;
}

/// Authentication that is settled by the transport, not by a challenge.
#[derive(Debug, Clone)]
struct TransportLevelProvider {
    auth_id: String,
    auth_method: &'static str,
}

impl TransportLevelProvider {
    async fn compute_challenge(&self) -> Result<Signature> {
        Err(Error::msg(format!(
            "{} authentication is established on the transport level",
            self.auth_method
        )))
    }
}

macro_rules! transport_level_provider {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            inner: TransportLevelProvider,
        }

        #[async_trait]
        impl AuthProvider for $name {
            fn auth_id(&self) -> &str {
                &self.inner.auth_id
            }

            fn auth_method(&self) -> &str {
                self.inner.auth_method
            }

            fn is_transport_level(&self) -> bool {
                true
            }

            async fn compute_challenge(&self, _: &Dictionary) -> Result<Signature> {
                self.inner.compute_challenge().await
            }
        }
    };
}

transport_level_provider!(
    /// Login without any credentials.
    AnonymousAuthProvider
);

impl AnonymousAuthProvider {
    /// Logs in as `anonymous`.
    pub fn new() -> Self {
        Self::with_auth_id("anonymous")
    }

    /// Logs in as the given identity.
    pub fn with_auth_id<S>(auth_id: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            inner: TransportLevelProvider {
                auth_id: auth_id.into(),
                auth_method: "anonymous",
            },
        }
    }
}

impl Default for AnonymousAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

transport_level_provider!(
    /// Login with cookies sent when the transport connected.
    CookieAuthProvider
);

impl CookieAuthProvider {
    pub fn new() -> Self {
        Self {
            inner: TransportLevelProvider {
                auth_id: String::new(),
                auth_method: "cookie",
            },
        }
    }
}

impl Default for CookieAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

transport_level_provider!(
    /// Login with a TLS client certificate presented when the transport connected.
    ///
    /// A certificate may permit several identities, so the auth ID is only a hint to the router.
    TlsAuthProvider
);

impl TlsAuthProvider {
    pub fn new<S>(auth_id: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            inner: TransportLevelProvider {
                auth_id: auth_id.into(),
                auth_method: "tls",
            },
        }
    }
}
