use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SERVICE_NAME: &str = "io.cirrusdrive.agent";
const SESSION_KEY: &str = "session_state";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("no saved session")]
    NotFound,
    #[error("stored session is unreadable: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Everything that must survive a restart but never touch plain disk: the
/// session cookie (CSRF token included in it), the bearer fallback, the
/// last active workspace and the chosen sync root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub session_cookie: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<i64>,
    #[serde(default)]
    pub sync_root: Option<String>,
}

pub struct CredentialStore {
    entry: Entry,
}

impl CredentialStore {
    pub fn new() -> Result<Self, CredentialError> {
        Ok(Self {
            entry: Entry::new(SERVICE_NAME, SESSION_KEY)?,
        })
    }

    pub fn save(&self, state: &SessionState) -> Result<(), CredentialError> {
        let serialized = serde_json::to_string(state)?;
        self.entry.set_password(&serialized)?;
        Ok(())
    }

    pub fn load(&self) -> Result<SessionState, CredentialError> {
        match self.entry.get_password() {
            Ok(serialized) => Ok(serde_json::from_str(&serialized)?),
            Err(keyring::Error::NoEntry) => Err(CredentialError::NotFound),
            Err(err) => Err(CredentialError::Keyring(err)),
        }
    }

    pub fn clear(&self) -> Result<(), CredentialError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(CredentialError::Keyring(err)),
        }
    }
}
