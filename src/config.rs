use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_LOGIN_PATH: &str = "/api/v1/auth/login";
pub const DEFAULT_SIGNUP_PATH: &str = "/api/v1/auth/signup";
pub const DEFAULT_LOGOUT_PATH: &str = "/api/v1/auth/logout";
pub const DEFAULT_REFRESH_PATH: &str = "/api/v1/auth/refresh";

fn default_timeout_ms() -> u64 {
    30_000 // 30 seconds
}

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Where the API lives and which paths the auth flow uses.
/// Unset fields fall back to the defaults above.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub login_path: Option<String>,
    #[serde(default)]
    pub signup_path: Option<String>,
    #[serde(default)]
    pub logout_path: Option<String>,
    #[serde(default)]
    pub refresh_path: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ApiConfig {
    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn login_path(&self) -> &str {
        self.login_path.as_deref().unwrap_or(DEFAULT_LOGIN_PATH)
    }

    pub fn signup_path(&self) -> &str {
        self.signup_path.as_deref().unwrap_or(DEFAULT_SIGNUP_PATH)
    }

    pub fn logout_path(&self) -> &str {
        self.logout_path.as_deref().unwrap_or(DEFAULT_LOGOUT_PATH)
    }

    pub fn refresh_path(&self) -> &str {
        self.refresh_path.as_deref().unwrap_or(DEFAULT_REFRESH_PATH)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or_else(default_timeout_ms))
    }
}

/// Where the session is persisted between runs
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Audit journal output; disabled unless a path is given
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct JournalConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

impl Config {
    /// Load configuration from default paths
    /// Priority: local (.portal/config.local.toml) > project (.portal/config.toml) > user (~/.portal/config.toml)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".portal").join("config.toml");
            if user_config.exists() {
                config.merge(Self::load_from(&user_config)?);
            }
        }

        let project_config = Path::new(".portal").join("config.toml");
        if project_config.exists() {
            config.merge(Self::load_from(&project_config)?);
        }

        // Should be gitignored
        let local_config = Path::new(".portal").join("config.local.toml");
        if local_config.exists() {
            config.merge(Self::load_from(&local_config)?);
        }

        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge another config into this one; fields set in `other` win
    pub fn merge(&mut self, other: Config) {
        let api = other.api;
        if api.base_url.is_some() {
            self.api.base_url = api.base_url;
        }
        if api.login_path.is_some() {
            self.api.login_path = api.login_path;
        }
        if api.signup_path.is_some() {
            self.api.signup_path = api.signup_path;
        }
        if api.logout_path.is_some() {
            self.api.logout_path = api.logout_path;
        }
        if api.refresh_path.is_some() {
            self.api.refresh_path = api.refresh_path;
        }
        if api.timeout_ms.is_some() {
            self.api.timeout_ms = api.timeout_ms;
        }

        if other.session.path.is_some() {
            self.session.path = other.session.path;
        }
        if other.journal.path.is_some() {
            self.journal.path = other.journal.path;
        }
    }

    /// Resolved session file: configured path, else ~/.portal/session.json,
    /// else .portal/session.json when there is no home directory
    pub fn session_path(&self) -> PathBuf {
        if let Some(path) = &self.session.path {
            return path.clone();
        }
        dirs::home_dir()
            .map(|home| home.join(".portal"))
            .unwrap_or_else(|| PathBuf::from(".portal"))
            .join("session.json")
    }

    /// Shell history lives next to the session file
    pub fn history_path(&self) -> PathBuf {
        self.session_path().with_file_name("history")
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let base_url = self.api.base_url();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            errors.push(ValidationError {
                field: "api.base_url".to_string(),
                message: format!("Expected an http:// or https:// URL, got '{}'", base_url),
            });
        }

        let paths = [
            ("api.login_path", self.api.login_path()),
            ("api.signup_path", self.api.signup_path()),
            ("api.logout_path", self.api.logout_path()),
            ("api.refresh_path", self.api.refresh_path()),
        ];
        for (field, path) in paths {
            if !path.starts_with('/') {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!("Path must start with '/', got '{}'", path),
                });
            }
        }

        if self.api.timeout_ms == Some(0) {
            errors.push(ValidationError {
                field: "api.timeout_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.base_url(), DEFAULT_BASE_URL);
        assert_eq!(config.api.refresh_path(), "/api/v1/auth/refresh");
        assert_eq!(config.api.timeout(), Duration::from_secs(30));
        assert!(config.journal.path.is_none());
        assert!(config.session_path().ends_with("session.json"));
        assert!(config.history_path().ends_with(".portal/history"));
    }

    #[test]
    fn test_load_from_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[api]
base_url = "https://portal.school.test"
timeout_ms = 5000

[journal]
path = "/tmp/portal.jsonl"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api.base_url(), "https://portal.school.test");
        assert_eq!(config.api.login_path(), DEFAULT_LOGIN_PATH);
        assert_eq!(config.api.timeout(), Duration::from_millis(5000));
        assert_eq!(config.journal.path, Some(PathBuf::from("/tmp/portal.jsonl")));
    }

    #[test]
    fn test_merge_only_overrides_set_fields() {
        let mut base = Config::default();
        base.api.base_url = Some("https://user.test".to_string());
        base.api.refresh_path = Some("/auth/refresh".to_string());
        base.session.path = Some(PathBuf::from("/home/u/.portal/session.json"));

        let mut project = Config::default();
        project.api.base_url = Some("https://project.test".to_string());

        base.merge(project);
        assert_eq!(base.api.base_url(), "https://project.test");
        assert_eq!(base.api.refresh_path(), "/auth/refresh");
        assert_eq!(
            base.session_path(),
            PathBuf::from("/home/u/.portal/session.json")
        );
        assert_eq!(base.history_path(), PathBuf::from("/home/u/.portal/history"));
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_bad_base_url() {
        let mut config = Config::default();
        config.api.base_url = Some("portal.school.test".to_string());
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "api.base_url");
    }

    #[test]
    fn test_validate_paths_and_timeout() {
        let mut config = Config::default();
        config.api.refresh_path = Some("auth/refresh".to_string());
        config.api.timeout_ms = Some(0);
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].field.contains("refresh_path"));
        assert!(errors[1].message.contains("greater than 0"));
    }
}
