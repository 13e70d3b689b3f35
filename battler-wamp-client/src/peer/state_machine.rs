use std::fmt::Display;

use crate::message::message::MessageKind;

/// The lifecycle state of a session on a connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Closed,
    Establishing,
    Challenging,
    Authenticating,
    Established,
    Closing,
    Error,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Establishing => "ESTABLISHING",
            Self::Challenging => "CHALLENGING",
            Self::Authenticating => "AUTHENTICATING",
            Self::Established => "ESTABLISHED",
            Self::Closing => "CLOSING",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// The direction a message traveled, relative to this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageDirection {
    Sent,
    Received,
}

impl ConnectionState {
    /// The state after a message of the given kind travels in the given direction.
    pub fn next(self, direction: MessageDirection, kind: MessageKind) -> Self {
        use MessageDirection::*;
        match (self, direction, kind) {
            (Self::Closed, Sent, MessageKind::Hello) => Self::Establishing,
            (Self::Closed, _, _) => Self::Error,
            (Self::Establishing, Received, MessageKind::Welcome) => Self::Established,
            (Self::Establishing, Received, MessageKind::Challenge) => Self::Challenging,
            (Self::Establishing, _, _) => Self::Error,
            (Self::Challenging, Sent, MessageKind::Authenticate) => Self::Authenticating,
            (Self::Challenging, _, _) => Self::Error,
            (Self::Authenticating, Received, MessageKind::Welcome) => Self::Established,
            (Self::Authenticating, _, _) => Self::Error,
            (Self::Established, _, MessageKind::Goodbye) => Self::Closing,
            (Self::Established, _, _) => Self::Established,
            (Self::Closing, _, MessageKind::Goodbye) => Self::Closed,
            (Self::Closing, _, _) => Self::Error,
            (Self::Error, _, _) => Self::Error,
        }
    }
}

/// The finite-state machine over the session lifecycle, driven by every HELLO, WELCOME, CHALLENGE,
/// AUTHENTICATE, and GOODBYE that crosses the connection.
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    /// The current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Transitions the machine, returning the new state.
    pub fn update(&mut self, direction: MessageDirection, kind: MessageKind) -> ConnectionState {
        self.state = self.state.next(direction, kind);
        self.state
    }
}
