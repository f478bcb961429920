//! Identity record storage.
//!
//! An identity is a registered member keyed by `(name, grade)` — distinct
//! from any one device. At most one device session is ever bound to an
//! identity; the binding (not the record) expires. The store interface
//! exposes indexed lookups by natural key and by session id; the linear
//! scan of the original spreadsheet backend is not part of the contract.

pub mod sqlite;

pub use sqlite::SqliteIdentityStore;

/// Rank value that marks an authority (admin) identity.
pub const ADMIN_RANK: &str = "1";

/// Natural key of an identity record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub name: String,
    pub grade: String,
}

impl IdentityKey {
    pub fn new(name: impl Into<String>, grade: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grade: grade.into(),
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.grade)
    }
}

/// Last-activity marker on an identity record.
///
/// `LoggedOut` is a sentinel distinct from "never active": a logged-out
/// member keeps its device binding and re-enters through the re-login
/// confirmation, while a missing value means the record was never live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Unix epoch seconds of the last processed message.
    At(u64),
    /// Explicitly logged out (user command or idle expiry).
    LoggedOut,
}

/// One registered member.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub name: String,
    pub grade: String,
    /// Shared secret, compared by exact match. Plaintext on purpose — the
    /// source system never hashes it; see DESIGN.md.
    pub secret_key: String,
    /// Optional profile field from the 4-token signup variant.
    pub gender: Option<String>,
    /// Authority rank; `"1"` marks an admin.
    pub rank: Option<String>,
    /// The device session currently authenticated as this identity.
    pub bound_session: Option<String>,
    pub last_activity: Option<Activity>,
}

impl IdentityRecord {
    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(self.name.clone(), self.grade.clone())
    }

    pub fn is_admin(&self) -> bool {
        self.rank.as_deref() == Some(ADMIN_RANK)
    }

    /// Whether the record is currently live (bound and not logged out).
    pub fn is_active(&self) -> bool {
        self.bound_session.is_some() && matches!(self.last_activity, Some(Activity::At(_)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

/// Identity record access, injected into the auth state machine.
///
/// Implementations must index by `(name, grade)` and by `session_id`.
pub trait IdentityStore: Send + Sync {
    fn find_by_identity(&self, key: &IdentityKey) -> Result<Option<IdentityRecord>, StoreError>;
    fn find_by_session(&self, session_id: &str) -> Result<Option<IdentityRecord>, StoreError>;
    fn upsert(&self, record: &IdentityRecord) -> Result<(), StoreError>;
    fn delete(&self, key: &IdentityKey) -> Result<bool, StoreError>;
    /// All authority identities (rank `"1"`), for abuse alerts.
    fn admins(&self) -> Result<Vec<IdentityRecord>, StoreError>;
}
