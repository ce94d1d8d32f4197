use std::fmt;

/// Commands the controller sends over the control connection.
///
/// Anything outside the known alphabet is kept as [`Command::Unknown`] and is
/// still acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Ping,
    TakeSnapshot,
    StartStreaming,
    StopStreaming,
    Unknown,
}

impl Command {
    pub fn parse(token: &str) -> Self {
        match token {
            "Ping" => Self::Ping,
            "TakeSnapshot" => Self::TakeSnapshot,
            "StartStreaming" => Self::StartStreaming,
            "StopStreaming" => Self::StopStreaming,
            _ => Self::Unknown,
        }
    }

    /// Textual acknowledgment sent back before any side effect runs.
    pub const fn ack(self) -> &'static str {
        match self {
            Self::Ping => "Pong",
            Self::TakeSnapshot | Self::StartStreaming | Self::StopStreaming => "Ok",
            // Unrecognized tokens are accepted too
            Self::Unknown => "Ok",
        }
    }
}

impl From<&str> for Command {
    fn from(token: &str) -> Self {
        Self::parse(token)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ping => "Ping",
            Self::TakeSnapshot => "TakeSnapshot",
            Self::StartStreaming => "StartStreaming",
            Self::StopStreaming => "StopStreaming",
            Self::Unknown => "<unknown>",
        };
        f.write_str(name)
    }
}
