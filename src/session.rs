//! Session model and persistence.
//!
//! The durable form is a flat record with four keys (`user`, `user_type`,
//! `access_token`, `refresh_token`). A record with only some of them is
//! treated as corrupt and never turned into a [`Session`].

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Which kind of portal account the session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Student,
    Teacher,
}

impl UserType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "student" => Some(Self::Student),
            "teacher" => Some(Self::Teacher),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
        }
    }
}

/// The authenticated identity of the current user.
///
/// Both tokens and the profile always travel together; "no session" is
/// `Option::<Session>::None`, never a half-filled value.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub user_type: UserType,
    /// Shape depends on `user_type`
    pub profile: Value,
}

impl Session {
    pub fn new(
        access_token: String,
        refresh_token: String,
        user_type: UserType,
        profile: Value,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            user_type,
            profile,
        }
    }

    /// Replace the token pair after a refresh.
    /// The refresh token only changes when the server rotated it.
    pub fn rotate(&mut self, access_token: String, refresh_token: Option<String>) {
        self.access_token = access_token;
        if let Some(refresh_token) = refresh_token {
            self.refresh_token = refresh_token;
        }
    }

    /// Best-effort display name taken from the profile
    pub fn display_name(&self) -> &str {
        ["name", "full_name", "username", "email"]
            .iter()
            .find_map(|key| self.profile.get(*key).and_then(|v| v.as_str()))
            .unwrap_or("unknown user")
    }
}

/// The persisted key-value form of a session
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<UserType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl SessionRecord {
    pub fn is_empty(&self) -> bool {
        self.user.is_none()
            && self.user_type.is_none()
            && self.access_token.is_none()
            && self.refresh_token.is_none()
    }

    /// Returns `None` unless all four keys are present
    pub fn into_session(self) -> Option<Session> {
        Some(Session {
            access_token: self.access_token?,
            refresh_token: self.refresh_token?,
            user_type: self.user_type?,
            profile: self.user?,
        })
    }
}

impl From<&Session> for SessionRecord {
    fn from(session: &Session) -> Self {
        Self {
            user: Some(session.profile.clone()),
            user_type: Some(session.user_type),
            access_token: Some(session.access_token.clone()),
            refresh_token: Some(session.refresh_token.clone()),
        }
    }
}

/// Durable storage for the session record
pub trait SessionStore: Send + Sync {
    /// Read the stored record; an empty record means nothing is stored
    fn read(&self) -> Result<SessionRecord, StoreError>;
    fn write(&self, record: &SessionRecord) -> Result<(), StoreError>;
    /// Remove every stored key
    fn clear(&self) -> Result<(), StoreError>;
}

impl<S: SessionStore + ?Sized> SessionStore for Box<S> {
    fn read(&self) -> Result<SessionRecord, StoreError> {
        (**self).read()
    }

    fn write(&self, record: &SessionRecord) -> Result<(), StoreError> {
        (**self).write(record)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
}

/// Session stored as a JSON file, written atomically via a sibling temp file
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl SessionStore for FileStore {
    fn read(&self) -> Result<SessionRecord, StoreError> {
        if !self.path.exists() {
            return Ok(SessionRecord::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(SessionRecord::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, record: &SessionRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        // A leftover temp file may carry looser permissions; start fresh
        match std::fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut file = private_file(&tmp)?;
        file.write_all(serde_json::to_string_pretty(record)?.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Create `path` so that it is owner-only from the moment it exists
#[cfg(unix)]
fn private_file(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn private_file(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

/// In-process store; the session lives only as long as the process.
/// Clones share the same record.
#[derive(Clone, Default)]
pub struct MemoryStore {
    record: Arc<Mutex<SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn read(&self) -> Result<SessionRecord, StoreError> {
        Ok(self
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn write(&self, record: &SessionRecord) -> Result<(), StoreError> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = record.clone();
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = SessionRecord::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_session() -> Session {
        Session::new(
            "access-1".to_string(),
            "refresh-1".to_string(),
            UserType::Student,
            json!({ "name": "Ada", "grade": 5 }),
        )
    }

    #[test]
    fn test_user_type_parse() {
        assert_eq!(UserType::from_str("Teacher"), Some(UserType::Teacher));
        assert_eq!(UserType::from_str("student"), Some(UserType::Student));
        assert_eq!(UserType::from_str("admin"), None);
        assert_eq!(UserType::Teacher.as_str(), "teacher");
    }

    #[test]
    fn test_rotate_keeps_refresh_token_when_not_supplied() {
        let mut session = sample_session();
        session.rotate("access-2".to_string(), None);
        assert_eq!(session.access_token, "access-2");
        assert_eq!(session.refresh_token, "refresh-1");

        session.rotate("access-3".to_string(), Some("refresh-2".to_string()));
        assert_eq!(session.access_token, "access-3");
        assert_eq!(session.refresh_token, "refresh-2");
    }

    #[test]
    fn test_display_name() {
        assert_eq!(sample_session().display_name(), "Ada");
        let mut session = sample_session();
        session.profile = json!({ "email": "ada@school.test" });
        assert_eq!(session.display_name(), "ada@school.test");
        session.profile = json!({});
        assert_eq!(session.display_name(), "unknown user");
    }

    #[test]
    fn test_partial_record_is_not_a_session() {
        let mut record = SessionRecord::from(&sample_session());
        record.refresh_token = None;
        assert!(!record.is_empty());
        assert!(record.into_session().is_none());
    }

    #[test]
    fn test_file_store_write_read_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let store = FileStore::new(&path);

        assert!(store.read().unwrap().is_empty());

        let session = sample_session();
        store.write(&SessionRecord::from(&session)).unwrap();
        let restored = store.read().unwrap().into_session().unwrap();
        assert_eq!(restored, session);

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let mut keys: Vec<&str> = raw.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        keys.sort();
        assert_eq!(keys, vec!["access_token", "refresh_token", "user", "user_type"]);

        store.clear().unwrap();
        assert!(!path.exists());
        assert!(store.read().unwrap().is_empty());
        // Clearing twice is fine
        store.clear().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        let store = FileStore::new(&path);
        store.write(&SessionRecord::from(&sample_session())).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_ignores_stale_world_readable_temp() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        let stale = dir.path().join("session.json.tmp");
        std::fs::write(&stale, "leftover").unwrap();
        std::fs::set_permissions(&stale, std::fs::Permissions::from_mode(0o644)).unwrap();

        let store = FileStore::new(&path);
        store.write(&SessionRecord::from(&sample_session())).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!stale.exists());
        assert_eq!(
            store.read().unwrap().into_session().unwrap(),
            sample_session()
        );
    }

    #[test]
    fn test_file_store_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileStore::new(&path);
        assert!(matches!(store.read(), Err(StoreError::Json(_))));
    }

    #[test]
    fn test_memory_store_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.write(&SessionRecord::from(&sample_session())).unwrap();
        assert!(other.read().unwrap().into_session().is_some());
        other.clear().unwrap();
        assert!(store.read().unwrap().is_empty());
    }
}
