use std::fmt::Display;

/// How a procedure registration or subscription should be matched by the router.
///
/// Exact matching is the default and is not sent over the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MatchStyle {
    #[default]
    Exact,
    Prefix,
    Wildcard,
}

impl MatchStyle {
    /// The value of the `match` option.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Prefix => "prefix",
            Self::Wildcard => "wildcard",
        }
    }
}

impl TryFrom<&str> for MatchStyle {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "exact" => Ok(Self::Exact),
            "prefix" => Ok(Self::Prefix),
            "wildcard" => Ok(Self::Wildcard),
            _ => Err(Self::Error::msg(format!("invalid match style: {value}"))),
        }
    }
}

impl Display for MatchStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
