use crate::core::uri::Uri;

/// A transport close code.
///
/// Follows WebSocket close codes, which every transport reuses for reporting how a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// The session ended cleanly.
    pub const NORMAL: CloseCode = CloseCode(1000);

    /// The session ended abnormally, due to a protocol violation or failed authentication.
    pub const ABNORMAL: CloseCode = CloseCode(3000);
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The reason for closing a WAMP session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    #[default]
    Normal,
    SystemShutdown,
    CloseRealm,
    Killed,
    TimedOut,
    GoodbyeAndOut,
}

impl CloseReason {
    fn uri_component(&self) -> &str {
        match self {
            Self::Normal => "normal",
            Self::SystemShutdown => "system_shutdown",
            Self::CloseRealm => "close_realm",
            Self::Killed => "killed",
            Self::TimedOut => "timed_out",
            Self::GoodbyeAndOut => "goodbye_and_out",
        }
    }

    /// URI for the close reason.
    pub fn uri(&self) -> Uri {
        Uri::from_known(format!("wamp.close.{}", self.uri_component()))
    }
}

/// Information about how a session's transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: CloseCode,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    /// Checks if the session closed cleanly, as agreed upon by both peers.
    pub fn is_clean(&self) -> bool {
        self.was_clean && self.code == CloseCode::NORMAL
    }
}
