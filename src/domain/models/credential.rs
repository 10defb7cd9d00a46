use serde::{Deserialize, Serialize};

/// `(subscriber_id, exchange_id)` -> encrypted API credential. Ciphertext
/// never leaves the Credential Store; this struct is the handle the rest of
/// the system passes around. See spec §3 "Credential", §4.9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub subscriber_id: String,
    pub exchange_id: String,
    pub status: ApprovalStatus,
    pub active: bool,
    pub last_error: Option<String>,
}

impl Credential {
    pub fn is_usable(&self) -> bool {
        self.active && self.status == ApprovalStatus::Approved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Plaintext API secret, held only inside the single call that needs it.
/// Never `Debug`-derived with its fields visible, never serialized to logs.
#[derive(Clone)]
pub struct PlaintextCredential {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for PlaintextCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaintextCredential").field("api_key", &"<redacted>").finish()
    }
}
