//! # Session State Machine
//!
//! ```text
//!            start            call-start
//!   Idle ───────────▶ Connecting ───────────▶ Connected ◀──────┐
//!    ▲                                        │   ▲   │         │ speech-end
//!    │ stop / call-end                speech- │   │   │ output  │
//!    │                                 start  ▼   │   ▼         │
//!    └──────────────────────────────── Listening ─┘ Speaking ───┘
//!
//!   any active state ──error──▶ Error ──stop──▶ Idle
//! ```
//!
//! Transitions not in the table are rejected and leave the state unchanged.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Listening,
    Speaking,
    Error,
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    CallStarted,
    SpeechStarted,
    SpeechEnded,
    AssistantOutput,
    Failure,
    CallEnded,
    Stop,
}

impl SessionState {
    /// A call is up (or coming up) and the engine can still emit events for it.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Listening | SessionState::Speaking
        )
    }

    fn in_call(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Listening | SessionState::Speaking)
    }

    /// Next state for `event`, or `None` when the transition is not allowed.
    pub fn next(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Idle, Start) => Some(Connecting),
            (Connecting, CallStarted) => Some(Connected),
            (state, SpeechStarted) if state.in_call() => Some(Listening),
            (Listening | Speaking, SpeechEnded) => Some(Connected),
            (state, AssistantOutput) if state.in_call() => Some(Speaking),
            (state, Failure) if state.is_active() || state == Error => Some(Error),
            (state, CallEnded) if state.is_active() => Some(Idle),
            (_, Stop) => Some(Idle),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionEvent::*;
    use SessionState::*;

    const ALL_STATES: [SessionState; 6] = [Idle, Connecting, Connected, Listening, Speaking, Error];

    #[test]
    fn test_happy_path() {
        let mut state = Idle;
        for (event, expected) in [
            (Start, Connecting),
            (CallStarted, Connected),
            (SpeechStarted, Listening),
            (SpeechEnded, Connected),
            (AssistantOutput, Speaking),
            (SpeechEnded, Connected),
            (Stop, Idle),
        ] {
            state = state.next(event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_start_only_from_idle() {
        for state in ALL_STATES {
            assert_eq!(state.next(Start).is_some(), state == Idle, "{}", state);
        }
    }

    #[test]
    fn test_stop_always_returns_to_idle() {
        for state in ALL_STATES {
            assert_eq!(state.next(Stop), Some(Idle));
        }
    }

    #[test]
    fn test_errors_only_while_a_call_exists() {
        assert_eq!(Idle.next(Failure), None);
        for state in [Connecting, Connected, Listening, Speaking, Error] {
            assert_eq!(state.next(Failure), Some(Error));
        }
    }

    #[test]
    fn test_rejected_transitions() {
        assert_eq!(Idle.next(CallStarted), None);
        assert_eq!(Connected.next(CallStarted), None);
        assert_eq!(Connecting.next(SpeechStarted), None);
        assert_eq!(Connecting.next(AssistantOutput), None);
        assert_eq!(Error.next(CallEnded), None);
        assert_eq!(Connected.next(SpeechEnded), None);
    }

    #[test]
    fn test_call_end_from_active_states() {
        for state in [Connecting, Connected, Listening, Speaking] {
            assert_eq!(state.next(CallEnded), Some(Idle));
        }
    }
}
