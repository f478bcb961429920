//! One-time-passcode challenges for device takeover.
//!
//! When a second device submits matching credentials for an already-bound
//! identity, a 6-digit code is pushed to the currently-bound device and the
//! new device must type it back. Challenges are keyed by the *owner*
//! session (the device that must approve): at most one outstanding
//! challenge per owner, reissuing overwrites.
//!
//! ## Security
//! - Codes are drawn uniformly from the full 000000–999999 space
//! - Fixed TTL (default 10 minutes), checked lazily on verification
//! - Attempt cap (default 2); the caller suspends the requester on the
//!   final miss

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::store::IdentityKey;

/// How long a takeover code remains valid (seconds).
pub const DEFAULT_OTP_TTL_SECS: u64 = 600; // 10 minutes

/// Wrong-code attempts allowed before the requester is suspended.
pub const DEFAULT_OTP_MAX_ATTEMPTS: u32 = 2;

/// One outstanding device-takeover verification.
#[derive(Debug, Clone)]
pub struct OtpChallenge {
    /// The currently-bound device, who must approve.
    pub owner_session: String,
    /// The new device attempting to claim the identity.
    pub requester_session: String,
    /// The identity being claimed.
    pub identity: IdentityKey,
    /// 6-digit numeric code.
    pub code: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub attempts: u32,
}

/// Result of a verification attempt.
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    /// Code matched; the challenge is consumed.
    Success(OtpChallenge),
    /// Code mismatched. At zero attempts left the challenge was deleted and
    /// the caller must suspend the requester.
    WrongCode { attempts_left: u32 },
    /// The challenge passed its TTL and was deleted.
    Expired,
    /// No outstanding challenge for this requester.
    NotFound,
}

/// Thread-safe store for outstanding takeover challenges, keyed by owner.
#[derive(Debug)]
pub struct OtpManager {
    challenges: Mutex<HashMap<String, OtpChallenge>>,
    ttl_secs: u64,
    max_attempts: u32,
}

impl OtpManager {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_OTP_TTL_SECS, DEFAULT_OTP_MAX_ATTEMPTS)
    }

    pub fn with_limits(ttl_secs: u64, max_attempts: u32) -> Self {
        Self {
            challenges: Mutex::new(HashMap::new()),
            ttl_secs,
            max_attempts,
        }
    }

    /// Issue a challenge: the code is returned for pushing to the owner
    /// device. A prior challenge for the same owner (or a stale one from the
    /// same requester) is invalidated.
    pub fn issue(&self, owner: &str, requester: &str, identity: IdentityKey) -> String {
        self.issue_at(owner, requester, identity, epoch_secs())
    }

    pub fn issue_at(
        &self,
        owner: &str,
        requester: &str,
        identity: IdentityKey,
        now: u64,
    ) -> String {
        let code = generate_code();
        let mut challenges = self.challenges.lock();

        // A requester can only chase one identity at a time.
        challenges.retain(|_, ch| ch.requester_session != requester);

        challenges.insert(
            owner.to_string(),
            OtpChallenge {
                owner_session: owner.to_string(),
                requester_session: requester.to_string(),
                identity,
                code: code.clone(),
                created_at: now,
                expires_at: now + self.ttl_secs,
                attempts: 0,
            },
        );

        tracing::info!(
            owner = owner,
            requester = requester,
            "Takeover challenge issued (expires in {}s)",
            self.ttl_secs
        );

        code
    }

    /// Verify a code typed by the requesting device.
    pub fn verify(&self, requester: &str, code: &str) -> VerifyOutcome {
        self.verify_at(requester, code, epoch_secs())
    }

    pub fn verify_at(&self, requester: &str, code: &str, now: u64) -> VerifyOutcome {
        let mut challenges = self.challenges.lock();

        let owner = match challenges
            .values()
            .find(|ch| ch.requester_session == requester)
        {
            Some(ch) => ch.owner_session.clone(),
            None => return VerifyOutcome::NotFound,
        };

        let challenge = challenges
            .get_mut(&owner)
            .expect("challenge indexed by owner");

        if now > challenge.expires_at {
            challenges.remove(&owner);
            return VerifyOutcome::Expired;
        }

        if challenge.code == code {
            let challenge = challenges.remove(&owner).expect("challenge present");
            return VerifyOutcome::Success(challenge);
        }

        challenge.attempts += 1;
        let attempts_left = self.max_attempts.saturating_sub(challenge.attempts);
        if attempts_left == 0 {
            challenges.remove(&owner);
        }
        VerifyOutcome::WrongCode { attempts_left }
    }

    /// Drop any outstanding challenge owned by this session.
    pub fn revoke(&self, owner: &str) -> bool {
        self.challenges.lock().remove(owner).is_some()
    }

    /// Number of outstanding challenges.
    pub fn outstanding(&self) -> usize {
        self.challenges.lock().len()
    }
}

impl Default for OtpManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a string looks like a takeover code (6 digits).
pub fn looks_like_code(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_digit())
}

/// Generate a uniformly random 6-digit code.
///
/// Rejection sampling keeps the distribution uniform over 000000–999999
/// (a plain modulo of a 32-bit draw would skew the low codes).
fn generate_code() -> String {
    const SPACE: u64 = 1_000_000;
    const LIMIT: u64 = (u32::MAX as u64 / SPACE) * SPACE;

    loop {
        let draw = u64::from(rand::random::<u32>());
        if draw < LIMIT {
            return format!("{:06}", draw % SPACE);
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taro() -> IdentityKey {
        IdentityKey::new("Taro", "2")
    }

    #[test]
    fn code_is_six_digits() {
        for _ in 0..32 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn issue_and_verify_succeeds() {
        let manager = OtpManager::new();
        let code = manager.issue_at("S1", "S2", taro(), 1000);

        match manager.verify_at("S2", &code, 1001) {
            VerifyOutcome::Success(ch) => {
                assert_eq!(ch.owner_session, "S1");
                assert_eq!(ch.requester_session, "S2");
                assert_eq!(ch.identity, taro());
            }
            other => panic!("expected success, got {other:?}"),
        }

        // Consumed on success.
        assert!(matches!(
            manager.verify_at("S2", &code, 1002),
            VerifyOutcome::NotFound
        ));
    }

    #[test]
    fn single_flight_per_owner() {
        let manager = OtpManager::new();
        let first = manager.issue_at("S1", "S2", taro(), 1000);
        let second = manager.issue_at("S1", "S2", taro(), 1001);

        assert_eq!(manager.outstanding(), 1);
        if first != second {
            assert!(matches!(
                manager.verify_at("S2", &first, 1002),
                VerifyOutcome::WrongCode { .. }
            ));
        }
        assert!(matches!(
            manager.verify_at("S2", &second, 1003),
            VerifyOutcome::Success(_)
        ));
    }

    #[test]
    fn expiry_is_monotonic() {
        let manager = OtpManager::with_limits(600, 2);
        let code = manager.issue_at("S1", "S2", taro(), 1000);

        // TTL is 10 minutes; 11 minutes later the code must not verify.
        assert!(matches!(
            manager.verify_at("S2", &code, 1000 + 660),
            VerifyOutcome::Expired
        ));
        // Expiry deletes the challenge.
        assert!(matches!(
            manager.verify_at("S2", &code, 1000 + 661),
            VerifyOutcome::NotFound
        ));
    }

    #[test]
    fn verifies_right_before_expiry() {
        let manager = OtpManager::with_limits(600, 2);
        let code = manager.issue_at("S1", "S2", taro(), 1000);
        assert!(matches!(
            manager.verify_at("S2", &code, 1600),
            VerifyOutcome::Success(_)
        ));
    }

    #[test]
    fn attempt_cap_deletes_challenge() {
        let manager = OtpManager::with_limits(600, 2);
        let code = manager.issue_at("S1", "S2", taro(), 1000);

        match manager.verify_at("S2", "000000", 1001) {
            VerifyOutcome::WrongCode { attempts_left } => assert_eq!(attempts_left, 1),
            other => panic!("expected wrong code, got {other:?}"),
        }
        // One attempt left: the real code still works after cap - 1 misses.
        assert_eq!(manager.outstanding(), 1);

        match manager.verify_at("S2", "111111", 1002) {
            VerifyOutcome::WrongCode { attempts_left } => assert_eq!(attempts_left, 0),
            other => panic!("expected wrong code, got {other:?}"),
        }
        assert_eq!(manager.outstanding(), 0);
        let _ = code;
    }

    #[test]
    fn cap_minus_one_keeps_challenge_verifiable() {
        let manager = OtpManager::with_limits(600, 2);
        let code = manager.issue_at("S1", "S2", taro(), 1000);

        let _ = manager.verify_at("S2", "000000", 1001);
        assert!(matches!(
            manager.verify_at("S2", &code, 1002),
            VerifyOutcome::Success(_)
        ));
    }

    #[test]
    fn verify_unknown_requester_is_not_found() {
        let manager = OtpManager::new();
        assert!(matches!(
            manager.verify_at("S_ghost", "123456", 1000),
            VerifyOutcome::NotFound
        ));
    }

    #[test]
    fn revoke_drops_challenge() {
        let manager = OtpManager::new();
        let code = manager.issue_at("S1", "S2", taro(), 1000);

        assert!(manager.revoke("S1"));
        assert!(!manager.revoke("S1"));
        assert!(matches!(
            manager.verify_at("S2", &code, 1001),
            VerifyOutcome::NotFound
        ));
    }

    #[test]
    fn reissue_drops_requesters_stale_challenge() {
        let manager = OtpManager::new();
        // S2 first chases Taro's device S1, then switches to Jiro's device S3.
        let _ = manager.issue_at("S1", "S2", taro(), 1000);
        let code = manager.issue_at("S3", "S2", IdentityKey::new("Jiro", "3"), 1001);

        assert_eq!(manager.outstanding(), 1);
        match manager.verify_at("S2", &code, 1002) {
            VerifyOutcome::Success(ch) => assert_eq!(ch.owner_session, "S3"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn looks_like_code_valid() {
        assert!(looks_like_code("123456"));
        assert!(looks_like_code("000000"));
        assert!(looks_like_code(" 482901 "));
    }

    #[test]
    fn looks_like_code_invalid() {
        assert!(!looks_like_code("12345"));
        assert!(!looks_like_code("1234567"));
        assert!(!looks_like_code("abcdef"));
        assert!(!looks_like_code(""));
    }
}
