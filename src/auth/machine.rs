//! The auth state machine.
//!
//! Orchestrates one inbound chat message `(session_id, text)` into exactly
//! one reply plus zero-or-more pushes to *other* sessions. Order of
//! processing is fixed:
//!
//! 1. Suspension gate — suspended sessions get the ban notice and nothing
//!    else, not even "logout".
//! 2. Idle sweep — a live binding whose last activity is older than the
//!    idle window is auto-logged-out before the message is considered.
//! 3. Global commands (`logout`, `end`) — recognized in any state.
//! 4. Per-state dispatch on the session's conversation step.
//!
//! Errors are caught at the step boundary and converted to a chat reply: a
//! validation error re-prompts and keeps the current step, everything else
//! resets the session to idle. No store write happens before the inputs
//! that justify it are fully validated, so a failed step never leaves a
//! half-bound record behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::store::{Activity, IdentityKey, IdentityRecord, IdentityStore};

use super::otp::{self, OtpManager, VerifyOutcome};
use super::session::{ConversationState, SessionRegistry};
use super::suspension::{GateStatus, SuspensionLedger};

const MSG_HELP: &str = "Commands: login, logout, end.";
const MSG_CREDENTIALS_PROMPT: &str =
    "Send your details in one message: name grade key (optionally: name grade key gender).";
const MSG_CODE_SENT: &str = "This account is active on another device. A verification code was \
                             sent there — enter the 6-digit code here to move the session.";
const MSG_CODE_PROMPT: &str =
    "Enter the 6-digit code sent to your other device, or send \"end\" to cancel.";
const MSG_REPLACED: &str = "Your session was replaced by a login on another device.";
const MSG_CANCELLED: &str = "Cancelled.";
const MSG_LOGGED_OUT: &str = "You have been logged out.";
const MSG_NOT_LINKED: &str = "No account is linked to this device.";
const MSG_ADMIN_ONLY: &str = "Only a logged-in admin can do that.";
const MSG_SUSPEND_USAGE: &str = "Usage: suspend <name> <grade> <minutes> <reason>";
const MSG_BINDING_MOVED: &str =
    "This account is now active on another device. Send \"login\" to start over.";

/// Reason recorded for automatic suspensions.
const OTP_ABUSE_REASON: &str = "OTP abuse";

/// A push notification to a session other than the sender.
#[derive(Debug, Clone)]
pub struct Push {
    pub session_id: String,
    pub text: String,
}

/// Result of processing one inbound message.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// The single reply to the sender.
    pub reply: String,
    /// Pushes to other devices (OTP code, replacement notice, abuse alerts).
    pub pushes: Vec<Push>,
}

impl Outcome {
    fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: text.into(),
            pushes: Vec::new(),
        }
    }
}

/// Per-identity lock table guarding binding and challenge mutations.
///
/// Lock entries are tiny and never removed; the member population is small
/// and bounded, so the table does not need eviction.
#[derive(Default)]
struct LockTable {
    inner: Mutex<HashMap<IdentityKey, Arc<Mutex<()>>>>,
}

impl LockTable {
    fn acquire(&self, key: &IdentityKey) -> Arc<Mutex<()>> {
        self.inner.lock().entry(key.clone()).or_default().clone()
    }
}

/// The core orchestrator. Owns the session registry and the OTP manager;
/// the identity store and suspension ledger are injected collaborators.
pub struct AuthMachine {
    store: Arc<dyn IdentityStore>,
    ledger: Arc<SuspensionLedger>,
    sessions: SessionRegistry,
    otp: OtpManager,
    locks: LockTable,
    cfg: AuthConfig,
}

impl AuthMachine {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        ledger: Arc<SuspensionLedger>,
        cfg: AuthConfig,
    ) -> Self {
        let otp = OtpManager::with_limits(cfg.otp_ttl_secs, cfg.otp_max_attempts);
        Self {
            store,
            ledger,
            sessions: SessionRegistry::new(),
            otp,
            locks: LockTable::default(),
            cfg,
        }
    }

    /// Process one inbound message. Never panics, never returns an error:
    /// every failure becomes a chat reply.
    pub fn handle(&self, session_id: &str, text: &str) -> Outcome {
        self.handle_at(session_id, text, epoch_secs())
    }

    pub fn handle_at(&self, session_id: &str, text: &str, now: u64) -> Outcome {
        // The gate runs before anything else.
        if let GateStatus::Active {
            remaining_secs,
            reason,
        } = self.ledger.check_at(session_id, now)
        {
            return Outcome::reply(format!(
                "You are suspended ({reason}). {} minute(s) remain.",
                remaining_secs.div_ceil(60)
            ));
        }

        match self.dispatch(session_id, text, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                if !err.keeps_state() {
                    self.sessions.reset(session_id);
                }
                if let AuthError::StoreUnavailable(ref detail) = err {
                    tracing::error!(session = session_id, "Identity store failure: {detail}");
                }
                Outcome::reply(err.user_message())
            }
        }
    }

    fn dispatch(&self, session_id: &str, text: &str, now: u64) -> Result<Outcome, AuthError> {
        let trimmed = text.trim();
        let lower = trimmed.to_lowercase();

        if let Some(outcome) = self.idle_sweep(session_id, &lower, now)? {
            return Ok(outcome);
        }

        // Global commands work in any state. "logout" is exempt from the
        // already-logged-in idempotency of "login"; "end" is a pure local
        // reset.
        match lower.as_str() {
            "logout" => return self.handle_logout(session_id),
            "end" => {
                self.sessions.reset(session_id);
                return Ok(Outcome::reply(MSG_CANCELLED));
            }
            _ => {}
        }

        match self.sessions.get(session_id) {
            ConversationState::Idle => self.handle_idle(session_id, trimmed, &lower, now),
            ConversationState::AwaitingCredentials => {
                self.submit_credentials(session_id, trimmed, now)
            }
            ConversationState::AwaitingRelogin { name, grade } => {
                self.confirm_relogin(session_id, &lower, &name, &grade, now)
            }
            ConversationState::AwaitingOtp => self.submit_code(session_id, trimmed, now),
            ConversationState::AwaitingDeleteConfirm => self.confirm_delete(session_id, &lower),
        }
    }

    /// Auto-logout a binding whose last activity is older than the idle
    /// window. Runs for every message; a "login" sent after expiry falls
    /// through into the normal re-login flow, anything else is answered
    /// with the notice instead of being executed.
    fn idle_sweep(
        &self,
        session_id: &str,
        lower: &str,
        now: u64,
    ) -> Result<Option<Outcome>, AuthError> {
        let Some(record) = self.store.find_by_session(session_id)? else {
            return Ok(None);
        };
        let key = record.key();
        let lock = self.locks.acquire(&key);
        let _guard = lock.lock();

        // Re-read under the lock: a takeover can move the binding between
        // the session lookup and here, and the expiry write must not
        // restore it.
        let Some(current) = self.store.find_by_identity(&key)? else {
            return Ok(None);
        };
        if current.bound_session.as_deref() != Some(session_id) {
            return Ok(None);
        }
        let Some(Activity::At(ts)) = current.last_activity else {
            return Ok(None);
        };
        if now.saturating_sub(ts) <= self.cfg.idle_window_secs {
            return Ok(None);
        }

        let mut expired = current;
        expired.last_activity = Some(Activity::LoggedOut);
        self.store.upsert(&expired)?;
        self.sessions.reset(session_id);
        tracing::info!(
            session = session_id,
            member = %expired.key(),
            "Idle window elapsed, auto-logout"
        );

        if lower == "login" {
            return Ok(None);
        }
        Ok(Some(Outcome::reply(format!(
            "You were logged out after {} minute(s) of inactivity. Send \"login\" to log in again.",
            self.cfg.idle_window_secs / 60
        ))))
    }

    /// Set the `LOGGED_OUT` sentinel on the caller's bound record. The
    /// lookup goes by binding, not by conversation state, and repeating it
    /// is a harmless no-op.
    fn handle_logout(&self, session_id: &str) -> Result<Outcome, AuthError> {
        self.sessions.reset(session_id);
        let Some(record) = self.store.find_by_session(session_id)? else {
            return Ok(Outcome::reply(MSG_NOT_LINKED));
        };
        let key = record.key();
        let lock = self.locks.acquire(&key);
        let _guard = lock.lock();

        match self.store.find_by_identity(&key)? {
            Some(mut current) if current.bound_session.as_deref() == Some(session_id) => {
                current.last_activity = Some(Activity::LoggedOut);
                self.store.upsert(&current)?;
                tracing::info!(session = session_id, member = %key, "Logged out");
                Ok(Outcome::reply(MSG_LOGGED_OUT))
            }
            // The binding moved to another device meanwhile.
            _ => Ok(Outcome::reply(MSG_NOT_LINKED)),
        }
    }

    fn handle_idle(
        &self,
        session_id: &str,
        trimmed: &str,
        lower: &str,
        now: u64,
    ) -> Result<Outcome, AuthError> {
        if lower == "login" {
            return self.start_login(session_id);
        }
        if lower == "delete account" {
            return self.start_delete(session_id);
        }
        if lower == "suspend" || lower.starts_with("suspend ") {
            return self.admin_suspend(session_id, trimmed, now);
        }
        Ok(Outcome::reply(MSG_HELP))
    }

    fn start_login(&self, session_id: &str) -> Result<Outcome, AuthError> {
        match self.store.find_by_session(session_id)? {
            Some(record) => match record.last_activity {
                Some(Activity::LoggedOut) => {
                    self.sessions.set(
                        session_id,
                        ConversationState::AwaitingRelogin {
                            name: record.name.clone(),
                            grade: record.grade.clone(),
                        },
                    );
                    Ok(Outcome::reply(format!(
                        "Log back in as {}? (yes/no)",
                        record.name
                    )))
                }
                // Login is idempotent while the binding is live.
                _ => Ok(Outcome::reply(format!(
                    "You are already logged in as {}.",
                    record.name
                ))),
            },
            None => {
                self.sessions
                    .set(session_id, ConversationState::AwaitingCredentials);
                Ok(Outcome::reply(MSG_CREDENTIALS_PROMPT))
            }
        }
    }

    fn submit_credentials(
        &self,
        session_id: &str,
        trimmed: &str,
        now: u64,
    ) -> Result<Outcome, AuthError> {
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() != 3 && tokens.len() != 4 {
            return Err(AuthError::Validation(MSG_CREDENTIALS_PROMPT.into()));
        }
        let (name, grade, key) = (tokens[0], tokens[1], tokens[2]);
        let gender = tokens.get(3).map(|s| (*s).to_string());
        if !grade.chars().all(|c| c.is_ascii_digit()) {
            return Err(AuthError::Validation(format!(
                "The grade must be digits. {MSG_CREDENTIALS_PROMPT}"
            )));
        }

        let identity = IdentityKey::new(name, grade);
        let lock = self.locks.acquire(&identity);
        let _guard = lock.lock();

        match self.store.find_by_identity(&identity)? {
            None => {
                let record = IdentityRecord {
                    name: name.into(),
                    grade: grade.into(),
                    secret_key: key.into(),
                    gender,
                    rank: None,
                    bound_session: Some(session_id.into()),
                    last_activity: Some(Activity::At(now)),
                };
                self.store.upsert(&record)?;
                self.sessions.reset(session_id);
                tracing::info!(session = session_id, member = %identity, "Registered");
                Ok(Outcome::reply(format!(
                    "Registered and logged in as {name}. Welcome!"
                )))
            }
            // Wrong key for an existing member always rejects; it never
            // falls through to creating a duplicate row.
            Some(record) if record.secret_key != key => Err(AuthError::AuthMismatch),
            Some(mut record) => match record.bound_session.clone() {
                None => {
                    record.bound_session = Some(session_id.into());
                    record.last_activity = Some(Activity::At(now));
                    if gender.is_some() {
                        record.gender = gender;
                    }
                    self.store.upsert(&record)?;
                    self.sessions.reset(session_id);
                    Ok(Outcome::reply(format!("Login successful. Welcome, {name}!")))
                }
                Some(ref bound) if bound == session_id => {
                    record.last_activity = Some(Activity::At(now));
                    self.store.upsert(&record)?;
                    self.sessions.reset(session_id);
                    Ok(Outcome::reply(format!("Welcome back, {name}!")))
                }
                Some(owner) => {
                    // Takeover: the currently-bound device must approve.
                    let code = self.otp.issue_at(&owner, session_id, identity.clone(), now);
                    self.sessions.set(session_id, ConversationState::AwaitingOtp);
                    tracing::info!(
                        requester = session_id,
                        owner = %owner,
                        member = %identity,
                        "Takeover challenge started"
                    );
                    Ok(Outcome {
                        reply: MSG_CODE_SENT.into(),
                        pushes: vec![Push {
                            session_id: owner,
                            text: format!(
                                "A login for {name} was attempted from another device. \
                                 Verification code: {code}"
                            ),
                        }],
                    })
                }
            },
        }
    }

    fn confirm_relogin(
        &self,
        session_id: &str,
        lower: &str,
        name: &str,
        grade: &str,
        now: u64,
    ) -> Result<Outcome, AuthError> {
        match lower {
            "yes" => {
                let identity = IdentityKey::new(name, grade);
                let lock = self.locks.acquire(&identity);
                let _guard = lock.lock();

                match self.store.find_by_identity(&identity)? {
                    Some(mut record)
                        if record.bound_session.as_deref() == Some(session_id) =>
                    {
                        record.last_activity = Some(Activity::At(now));
                        self.store.upsert(&record)?;
                        self.sessions.reset(session_id);
                        Ok(Outcome::reply(format!("Logged back in as {name}.")))
                    }
                    // Deleted or taken over since the prompt was shown.
                    _ => {
                        self.sessions.reset(session_id);
                        Ok(Outcome::reply(MSG_BINDING_MOVED))
                    }
                }
            }
            "no" => {
                self.sessions.reset(session_id);
                Ok(Outcome::reply(MSG_CANCELLED))
            }
            _ => Err(AuthError::Validation(format!(
                "Please answer yes or no: log back in as {name}?"
            ))),
        }
    }

    fn submit_code(&self, session_id: &str, trimmed: &str, now: u64) -> Result<Outcome, AuthError> {
        if !otp::looks_like_code(trimmed) {
            return Err(AuthError::Validation(MSG_CODE_PROMPT.into()));
        }

        match self.otp.verify_at(session_id, trimmed, now) {
            VerifyOutcome::Success(challenge) => {
                let lock = self.locks.acquire(&challenge.identity);
                let _guard = lock.lock();

                let Some(mut record) = self.store.find_by_identity(&challenge.identity)? else {
                    return Err(AuthError::NotFound);
                };
                record.bound_session = Some(session_id.into());
                record.last_activity = Some(Activity::At(now));
                self.store.upsert(&record)?;
                self.sessions.reset(session_id);
                tracing::info!(
                    session = session_id,
                    member = %challenge.identity,
                    displaced = %challenge.owner_session,
                    "Takeover verified, binding moved"
                );
                Ok(Outcome {
                    reply: format!("Device verified. You are now logged in as {}.", record.name),
                    pushes: vec![Push {
                        session_id: challenge.owner_session,
                        text: MSG_REPLACED.into(),
                    }],
                })
            }
            VerifyOutcome::WrongCode { attempts_left } if attempts_left > 0 => {
                Err(AuthError::Validation(format!(
                    "Wrong code. {attempts_left} attempt(s) left."
                )))
            }
            VerifyOutcome::WrongCode { .. } => {
                let suspended_mins = self.cfg.abuse_suspension_secs / 60;
                self.ledger.suspend_at(
                    session_id,
                    now + self.cfg.abuse_suspension_secs,
                    OTP_ABUSE_REASON,
                );
                let pushes = self.admin_alerts(session_id);
                self.sessions.reset(session_id);
                tracing::warn!(session = session_id, "OTP attempt cap hit, requester suspended");
                Ok(Outcome {
                    reply: AuthError::TooManyAttempts { suspended_mins }.user_message(),
                    pushes,
                })
            }
            VerifyOutcome::Expired => Err(AuthError::ChallengeExpired),
            VerifyOutcome::NotFound => Err(AuthError::ChallengeNotFound),
        }
    }

    /// Best-effort pushes to every live admin device about an abuse event.
    fn admin_alerts(&self, requester: &str) -> Vec<Push> {
        let admins = match self.store.admins() {
            Ok(admins) => admins,
            Err(e) => {
                tracing::warn!("Could not load admins for abuse alert: {e}");
                return Vec::new();
            }
        };
        admins
            .into_iter()
            .filter(|a| a.is_active())
            .filter_map(|a| a.bound_session)
            .filter(|bound| bound != requester)
            .map(|bound| Push {
                session_id: bound,
                text: format!(
                    "Device {requester} was suspended for {OTP_ABUSE_REASON} \
                     (too many wrong verification codes)."
                ),
            })
            .collect()
    }

    /// `suspend <name> <grade> <minutes> <reason…>` — authority identities
    /// (rank "1") only.
    fn admin_suspend(
        &self,
        session_id: &str,
        trimmed: &str,
        now: u64,
    ) -> Result<Outcome, AuthError> {
        let caller = self.store.find_by_session(session_id)?;
        let authorized = caller.as_ref().is_some_and(|c| c.is_admin() && c.is_active());
        if !authorized {
            return Ok(Outcome::reply(MSG_ADMIN_ONLY));
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() < 5 {
            return Err(AuthError::Validation(MSG_SUSPEND_USAGE.into()));
        }
        let (name, grade) = (tokens[1], tokens[2]);
        let minutes: u64 = tokens[3]
            .parse()
            .map_err(|_| AuthError::Validation(MSG_SUSPEND_USAGE.into()))?;
        // Absurd durations would overflow the epoch arithmetic.
        let until = minutes
            .checked_mul(60)
            .and_then(|secs| now.checked_add(secs))
            .ok_or_else(|| AuthError::Validation(MSG_SUSPEND_USAGE.into()))?;
        let reason = tokens[4..].join(" ");

        let target = self
            .store
            .find_by_identity(&IdentityKey::new(name, grade))?
            .ok_or(AuthError::NotFound)?;
        let Some(bound) = target.bound_session else {
            return Ok(Outcome::reply(format!(
                "{name} has no device bound; nothing to suspend."
            )));
        };

        self.ledger.suspend_at(&bound, until, &reason);
        let until_display = chrono::DateTime::from_timestamp(until as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "later".into());
        Ok(Outcome::reply(format!(
            "Suspended {name}'s device for {minutes} minute(s) (until {until_display}): {reason}"
        )))
    }

    fn start_delete(&self, session_id: &str) -> Result<Outcome, AuthError> {
        match self.store.find_by_session(session_id)? {
            Some(record) => {
                self.sessions
                    .set(session_id, ConversationState::AwaitingDeleteConfirm);
                Ok(Outcome::reply(format!(
                    "Delete the account for {}? This cannot be undone. (yes/no)",
                    record.name
                )))
            }
            None => Ok(Outcome::reply(MSG_NOT_LINKED)),
        }
    }

    fn confirm_delete(&self, session_id: &str, lower: &str) -> Result<Outcome, AuthError> {
        match lower {
            "yes" => {
                self.sessions.reset(session_id);
                let Some(record) = self.store.find_by_session(session_id)? else {
                    return Ok(Outcome::reply(MSG_NOT_LINKED));
                };
                let key = record.key();
                let lock = self.locks.acquire(&key);
                let _guard = lock.lock();

                self.store.delete(&key)?;
                self.otp.revoke(session_id);
                tracing::info!(session = session_id, member = %key, "Account deleted");
                Ok(Outcome::reply("Your account has been deleted."))
            }
            "no" => {
                self.sessions.reset(session_id);
                Ok(Outcome::reply(MSG_CANCELLED))
            }
            _ => Err(AuthError::Validation(
                "Please answer yes or no: delete your account?".into(),
            )),
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Tests ───────────────────────────────────────────────────────────
