//! Device-binding authentication.
//!
//! Binds a persistent member identity (name, grade, secret key) to a
//! volatile per-device chat session, detects device takeover attempts, and
//! arbitrates conflicting claims via a one-time passcode sent to the
//! currently-bound device.
//!
//! ## Design Decisions
//! - Session state is single-process and best-effort: a restart drops
//!   conversation steps and outstanding codes, never member records.
//! - Expiry (OTP TTL, idle window, suspensions) is evaluated lazily on the
//!   next inbound message — no background sweepers, zero cost when idle.
//! - Every mutation of a member's device binding happens under a lock keyed
//!   by the identity's natural key, so two near-simultaneous takeover
//!   attempts cannot both succeed.

pub mod machine;
pub mod otp;
pub mod session;
pub mod suspension;

pub use machine::{AuthMachine, Outcome, Push};
pub use otp::{OtpManager, VerifyOutcome};
pub use session::{ConversationState, SessionRegistry};
pub use suspension::{GateStatus, SuspensionLedger};
