//! Pipeline lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a pipeline run
///
/// `Failed`, `Finished` and `Stopped` end a run. `Stopping` is only entered
/// from `Started` or `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunningState {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Finished,
}

impl RunningState {
    /// Returns true for the states that end a run
    pub fn is_ended(self) -> bool {
        matches!(self, Self::Failed | Self::Finished | Self::Stopped)
    }

    /// Returns true while a run is in flight
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Started | Self::Stopping)
    }

    /// Checks whether `self -> next` is one of the lifecycle edges.
    ///
    /// A fresh context starts out `Stopped`, so `Stopped -> Starting`
    /// doubles as the initial transition.
    pub fn can_transition_to(self, next: RunningState) -> bool {
        use RunningState::*;
        match next {
            Starting => self.is_ended(),
            Started => self == Starting,
            Stopping => matches!(self, Started | Starting),
            Stopped => matches!(self, Stopping | Finished | Failed),
            Finished => matches!(self, Starting | Started),
            Failed => matches!(self, Starting | Started | Stopping),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
