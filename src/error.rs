//! Error taxonomy for the authentication flows.
//!
//! Every variant maps to a chat reply at the flow-step boundary: nothing in
//! here is fatal to the process. `Validation` is locally recoverable (the
//! session keeps its current step and is re-prompted); all other variants
//! terminate the current flow and return the session to idle.

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Bad field count or format. The message is shown to the user verbatim
    /// as a re-prompt.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The referenced identity does not exist.
    #[error("identity not found")]
    NotFound,

    /// Wrong secret key for an existing identity. No lockout by itself.
    #[error("secret key mismatch")]
    AuthMismatch,

    /// The outstanding OTP challenge passed its TTL.
    #[error("verification code expired")]
    ChallengeExpired,

    /// No outstanding OTP challenge for this requester.
    #[error("no outstanding verification")]
    ChallengeNotFound,

    /// The OTP attempt cap was exhausted; the requester has been suspended.
    #[error("too many failed verification attempts")]
    TooManyAttempts { suspended_mins: u64 },

    /// The record layer is unreachable. Recovered by user retry; the failed
    /// step never leaves partial writes behind.
    #[error("identity store unavailable: {0}")]
    StoreUnavailable(String),
}

impl AuthError {
    /// The chat reply shown to the user for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::NotFound => "No such member was found.".into(),
            Self::AuthMismatch => "Authentication failed: wrong secret key.".into(),
            Self::ChallengeExpired => {
                "The verification code has expired. Send \"login\" to start over.".into()
            }
            Self::ChallengeNotFound => {
                "No verification is pending. Send \"login\" to start over.".into()
            }
            Self::TooManyAttempts { suspended_mins } => format!(
                "Too many wrong codes. You are suspended for {suspended_mins} minute(s)."
            ),
            Self::StoreUnavailable(_) => {
                "The member database is unavailable right now. \
                 Please try again later or contact an admin."
                    .into()
            }
        }
    }

    /// Whether the session should keep its current conversation step.
    pub fn keeps_state(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_passes_through() {
        let err = AuthError::Validation("send: name grade key".into());
        assert_eq!(err.user_message(), "send: name grade key");
        assert!(err.keeps_state());
    }

    #[test]
    fn terminal_errors_reset_state() {
        assert!(!AuthError::AuthMismatch.keeps_state());
        assert!(!AuthError::ChallengeExpired.keeps_state());
        assert!(!AuthError::StoreUnavailable("down".into()).keeps_state());
    }

    #[test]
    fn too_many_attempts_names_duration() {
        let err = AuthError::TooManyAttempts { suspended_mins: 30 };
        assert!(err.user_message().contains("30 minute"));
    }
}
