//! Session credential store.
//!
//! Holds the access/refresh token pair in memory and, when a namespace is
//! configured, mirrors it to `dirs::data_dir()/<namespace>/session.json` so it
//! survives a reload. Writes use temp file + rename.
//!
//! The persisted file only ever contains the keys in [`SESSION_KEYS`].

use crate::TollgateError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

/// Keys written to the persisted session file.
pub const SESSION_KEYS: [&str; 2] = ["access_token", "refresh_token"];

const SESSION_FILE: &str = "session.json";

/// Access/refresh credential pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token attached to requests.
    pub access_token: Option<String>,
    /// Token exchanged for a new access token on expiry.
    pub refresh_token: Option<String>,
}

impl Session {
    /// True iff an access token is present.
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    /// True iff neither token is present.
    pub fn is_anonymous(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

/// Process-wide owner of the session credentials.
#[derive(Debug)]
pub struct SessionStore {
    session: RwLock<Session>,
    path: Option<PathBuf>,
}

impl SessionStore {
    /// Store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            session: RwLock::new(Session::default()),
            path: None,
        }
    }

    /// Store persisted under `dirs::data_dir()/<namespace>/`.
    ///
    /// Loads an existing session file if one is present.
    pub fn with_namespace(namespace: &str) -> Result<Self, TollgateError> {
        let base_dir = dirs::data_dir()
            .ok_or_else(|| TollgateError::SessionIO("Could not find data directory".to_string()))?;
        Self::with_dir(base_dir.join(namespace))
    }

    /// Store persisted in a specific directory.
    pub fn with_dir(dir: PathBuf) -> Result<Self, TollgateError> {
        fs::create_dir_all(&dir)
            .map_err(|e| TollgateError::SessionIO(format!("Failed to create session dir: {}", e)))?;

        let path = dir.join(SESSION_FILE);
        let session = if path.exists() {
            let json = fs::read_to_string(&path)
                .map_err(|e| TollgateError::SessionIO(format!("Failed to read session: {}", e)))?;
            serde_json::from_str(&json)
                .map_err(|e| TollgateError::SessionIO(format!("Failed to parse session: {}", e)))?
        } else {
            Session::default()
        };

        Ok(Self {
            session: RwLock::new(session),
            path: Some(path),
        })
    }

    /// Current access token, if any. Never performs I/O.
    pub fn access_credential(&self) -> Option<String> {
        self.read().access_token.clone()
    }

    /// Current refresh token, if any.
    pub fn refresh_credential(&self) -> Option<String> {
        self.read().refresh_token.clone()
    }

    /// True iff an access credential is present.
    pub fn is_authenticated(&self) -> bool {
        self.read().is_authenticated()
    }

    /// Copy of the whole session.
    pub fn session(&self) -> Session {
        self.read().clone()
    }

    /// Overwrite the access token and, when given, the refresh token.
    ///
    /// A `None` refresh token keeps the current one (refresh responses that
    /// do not rotate it).
    pub fn set_credentials(
        &self,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
    ) -> Result<(), TollgateError> {
        let snapshot = {
            let mut session = self.write();
            session.access_token = Some(access_token.into());
            if let Some(refresh) = refresh_token {
                session.refresh_token = Some(refresh);
            }
            session.clone()
        };
        self.persist(&snapshot)
    }

    /// Remove all credentials. Idempotent.
    pub fn clear(&self) -> Result<(), TollgateError> {
        *self.write() = Session::default();

        if let Some(path) = &self.path {
            if path.exists() {
                fs::remove_file(path).map_err(|e| {
                    TollgateError::SessionIO(format!("Failed to delete session: {}", e))
                })?;
            }
        }
        Ok(())
    }

    fn persist(&self, session: &Session) -> Result<(), TollgateError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string(session)
            .map_err(|e| TollgateError::SessionIO(format!("Failed to serialize: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &json)
            .map_err(|e| TollgateError::SessionIO(format!("Failed to write temp file: {}", e)))?;
        fs::rename(&temp_path, path)
            .map_err(|e| TollgateError::SessionIO(format!("Failed to rename session file: {}", e)))?;

        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Short SHA-256 fingerprint of a token for log lines.
///
/// Tokens themselves are never logged.
pub fn token_fingerprint(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(token.as_bytes());
    hex::encode(&hash[..6])
}
