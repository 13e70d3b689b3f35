//! # battler-wamp-client
//!
//! **battler-wamp-client** is a client-side session engine for the
//! [Web Application Messaging Protocol](https://wamp-proto.org/spec.html).
//!
//! A [`Connection`][`crate::peer::connection::Connection`] drives a single WAMP session over an
//! abstract [`Transport`][`crate::transport::transport::Transport`]: it performs the HELLO /
//! WELCOME handshake (optionally with CHALLENGE / AUTHENTICATE), then dispatches every inbound
//! message to the four role processors (publisher, subscriber, caller, and callee) in a fixed
//! order. Each role correlates the router's replies with the requests it issued.

pub mod auth;
pub mod core;
pub mod message;
pub mod peer;
pub mod serializer;
pub mod transport;
