use std::fmt::Display;

use crate::core::types::{
    Dictionary,
    Value,
};

/// A role a client peer can take on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Publishes events to topics.
    Publisher,
    /// Subscribes to events for topics.
    Subscriber,
    /// Calls RPC endpoints.
    Caller,
    /// Registers RPC endpoints.
    Callee,
}

impl PeerRole {
    /// The key of the role in the HELLO `roles` dictionary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
            Self::Caller => "caller",
            Self::Callee => "callee",
        }
    }
}

impl Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the details announced for a single role in HELLO, enabling every named feature.
pub fn role_details(features: &[&str]) -> Value {
    Value::Dictionary(Dictionary::from_iter([(
        "features".to_owned(),
        Value::Dictionary(Dictionary::from_iter(
            features
                .iter()
                .map(|feature| ((*feature).to_owned(), Value::Bool(true))),
        )),
    )]))
}

#[cfg(test)]
mod roles_test {
    use crate::core::{
        roles::role_details,
        types::{
            Dictionary,
            Value,
        },
    };

    #[test]
    fn role_details_nests_features() {
        pretty_assertions::assert_eq!(
            role_details(&["call_canceling", "progressive_call_results"]),
            Value::Dictionary(Dictionary::from_iter([(
                "features".to_owned(),
                Value::Dictionary(Dictionary::from_iter([
                    ("call_canceling".to_owned(), Value::Bool(true)),
                    ("progressive_call_results".to_owned(), Value::Bool(true)),
                ])),
            )]))
        );
    }
}
