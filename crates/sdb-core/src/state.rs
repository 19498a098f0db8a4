//! Connection lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the four states an engine's connection can be in.
///
/// The states form a cycle: `Connecting → Open → Closing → Closed → Connecting`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// A transport is being established.
    Connecting = 0,
    /// The transport is ready for RPCs.
    Open = 1,
    /// The transport is being torn down.
    Closing = 2,
    /// No transport exists.
    #[default]
    Closed = 3,
}

impl ConnectionState {
    /// Numeric tag of the state.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// The state that follows this one in the lifecycle cycle.
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Connecting => Self::Open,
            Self::Open => Self::Closing,
            Self::Closing => Self::Closed,
            Self::Closed => Self::Connecting,
        }
    }

    /// Lowercase event name for this state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
