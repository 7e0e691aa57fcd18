use serde::{Deserialize, Serialize};
use std::fmt;

/// Conversational state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No active response, no user speech.
    #[default]
    Idle,
    /// Speech started, turn not yet complete.
    UserSpeaking,
    /// Turn complete, provider generating.
    Processing,
    /// Response output streaming.
    AgentSpeaking,
    /// User barged in; resolved to `UserSpeaking` within the same event.
    Interrupted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::UserSpeaking => write!(f, "user_speaking"),
            SessionState::Processing => write!(f, "processing"),
            SessionState::AgentSpeaking => write!(f, "agent_speaking"),
            SessionState::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Inputs of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    SpeechStarted,
    TurnComplete,
    /// Turn committed without requesting a response.
    TurnCommitted,
    ResponseRequested,
    ResponseStarted,
    ResponseDone,
    InterruptionResolved,
    /// Detection lost, generation failed, protocol error or close.
    Reset,
}

impl SessionState {
    /// Target state of `transition`, or `None` when the table has no entry.
    pub fn next(self, transition: Transition) -> Option<SessionState> {
        use SessionState::*;
        use Transition as T;

        match (self, transition) {
            (Idle, T::SpeechStarted) => Some(UserSpeaking),
            (UserSpeaking, T::TurnComplete) => Some(Processing),
            (UserSpeaking, T::TurnCommitted) => Some(Idle),
            (Idle, T::ResponseRequested) => Some(Processing),
            (Processing, T::ResponseStarted) => Some(AgentSpeaking),
            // the pending response is cancelled before producing output
            (Processing, T::SpeechStarted) => Some(UserSpeaking),
            (Processing, T::ResponseDone) => Some(Idle),
            (AgentSpeaking, T::ResponseDone) => Some(Idle),
            (AgentSpeaking, T::SpeechStarted) => Some(Interrupted),
            (Interrupted, T::InterruptionResolved) => Some(UserSpeaking),
            (_, T::Reset) => Some(Idle),
            _ => None,
        }
    }

    /// Whether a response is pending or streaming.
    pub fn has_response(self) -> bool {
        matches!(self, SessionState::Processing | SessionState::AgentSpeaking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = SessionState::Idle;
        for (transition, expected) in [
            (Transition::SpeechStarted, SessionState::UserSpeaking),
            (Transition::TurnComplete, SessionState::Processing),
            (Transition::ResponseStarted, SessionState::AgentSpeaking),
            (Transition::ResponseDone, SessionState::Idle),
        ] {
            state = state.next(transition).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_barge_in_path() {
        let state = SessionState::AgentSpeaking
            .next(Transition::SpeechStarted)
            .unwrap();
        assert_eq!(state, SessionState::Interrupted);
        assert_eq!(
            state.next(Transition::InterruptionResolved),
            Some(SessionState::UserSpeaking)
        );
    }

    #[test]
    fn test_speech_started_while_speaking_has_no_entry() {
        assert_eq!(
            SessionState::UserSpeaking.next(Transition::SpeechStarted),
            None
        );
    }

    #[test]
    fn test_reset_from_any_state() {
        for state in [
            SessionState::Idle,
            SessionState::UserSpeaking,
            SessionState::Processing,
            SessionState::AgentSpeaking,
            SessionState::Interrupted,
        ] {
            assert_eq!(state.next(Transition::Reset), Some(SessionState::Idle));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionState::AgentSpeaking.to_string(), "agent_speaking");
    }
}
