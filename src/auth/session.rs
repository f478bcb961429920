//! Session registry — per-device conversation state.
//!
//! A device session is one chat participant (one LINE user id), created
//! implicitly on first message and never persisted. The conversation state
//! is an explicit tagged union with exhaustive dispatch; there is no way to
//! express a contradictory combination of flow flags.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Current step of a session's multi-turn flow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConversationState {
    /// No flow in progress.
    #[default]
    Idle,
    /// Waiting for `name grade key` (optionally `gender`) after "login".
    AwaitingCredentials,
    /// Waiting for yes/no to re-login as a logged-out member.
    AwaitingRelogin { name: String, grade: String },
    /// Waiting for the 6-digit takeover code.
    AwaitingOtp,
    /// Waiting for yes/no to confirm account deletion.
    AwaitingDeleteConfirm,
}

/// Process-wide map from device session id to conversation state.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    states: Mutex<HashMap<String, ConversationState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a session. Unknown sessions are `Idle`.
    pub fn get(&self, session_id: &str) -> ConversationState {
        self.states
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&self, session_id: &str, state: ConversationState) {
        let mut states = self.states.lock();
        if state == ConversationState::Idle {
            states.remove(session_id);
        } else {
            states.insert(session_id.to_string(), state);
        }
    }

    /// Reset a session to `Idle`, dropping any in-progress flow.
    pub fn reset(&self, session_id: &str) {
        self.states.lock().remove(session_id);
    }

    /// Number of sessions currently mid-flow.
    pub fn active_count(&self) -> usize {
        self.states.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_session_is_idle() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.get("S1"), ConversationState::Idle);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn set_and_get_round_trips() {
        let registry = SessionRegistry::new();
        registry.set("S1", ConversationState::AwaitingCredentials);
        assert_eq!(registry.get("S1"), ConversationState::AwaitingCredentials);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn setting_idle_drops_the_entry() {
        let registry = SessionRegistry::new();
        registry.set("S1", ConversationState::AwaitingOtp);
        registry.set("S1", ConversationState::Idle);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn reset_clears_flow() {
        let registry = SessionRegistry::new();
        registry.set(
            "S1",
            ConversationState::AwaitingRelogin {
                name: "Taro".into(),
                grade: "2".into(),
            },
        );
        registry.reset("S1");
        assert_eq!(registry.get("S1"), ConversationState::Idle);
    }

    #[test]
    fn sessions_are_independent() {
        let registry = SessionRegistry::new();
        registry.set("S1", ConversationState::AwaitingOtp);
        assert_eq!(registry.get("S2"), ConversationState::Idle);
    }
}
