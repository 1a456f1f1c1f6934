use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumString;

/// Lifecycle state of a session. Persisted as a single snake_case line in
/// the session directory's `state` file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Running,
    PendingReview,
    Approved,
    Executing,
    Executed,
    Denied,
    Rejected,
    Expired,
    Failed,
}

impl SessionState {
    /// Terminal states are owned by nobody and safe to read concurrently.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Executed
                | SessionState::Denied
                | SessionState::Rejected
                | SessionState::Expired
                | SessionState::Failed
        )
    }

    /// The legal state machine. `Running → Approved` is the fast path when
    /// every capture auto-classifies; any non-terminal state can expire.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match self {
            Running => matches!(next, PendingReview | Approved | Denied | Failed | Expired),
            PendingReview => matches!(next, Approved | Denied | Rejected | Expired),
            Approved => matches!(next, Executing | Expired),
            Executing => matches!(next, Executed | Failed | Expired),
            Executed | Denied | Rejected | Expired | Failed => false,
        }
    }
}
