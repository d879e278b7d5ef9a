use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only JSONL record of what the gateway did. Tokens never go in here.
pub struct Journal {
    pub path: PathBuf,
    client_id: String,
    file: File,
}

#[derive(Serialize)]
struct Event<'a> {
    ts: DateTime<Utc>,
    client_id: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(flatten)]
    data: serde_json::Value,
}

impl Journal {
    pub fn new(path: &Path, client_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            client_id: client_id.to_string(),
            file,
        })
    }

    pub fn log(&mut self, event_type: &str, data: serde_json::Value) -> Result<()> {
        let event = Event {
            ts: Utc::now(),
            client_id: &self.client_id,
            event_type,
            data,
        };
        let line = serde_json::to_string(&event)?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn request(&mut self, method: &str, url: &str, authenticated: bool) -> Result<()> {
        self.log(
            "request",
            serde_json::json!({
                "method": method,
                "url": url,
                "authenticated": authenticated,
            }),
        )
    }

    pub fn response(&mut self, method: &str, url: &str, status: u16) -> Result<()> {
        self.log(
            "response",
            serde_json::json!({
                "method": method,
                "url": url,
                "status": status,
            }),
        )
    }

    pub fn transport_error(&mut self, method: &str, url: &str, error: &str) -> Result<()> {
        self.log(
            "transport_error",
            serde_json::json!({
                "method": method,
                "url": url,
                "error": error,
            }),
        )
    }

    pub fn refresh_start(&mut self) -> Result<()> {
        self.log("refresh_start", serde_json::json!({}))
    }

    /// `rotated` is true when the server also issued a new refresh token
    pub fn refresh_ok(&mut self, rotated: bool, waiters: usize) -> Result<()> {
        self.log(
            "refresh_ok",
            serde_json::json!({ "rotated": rotated, "waiters": waiters }),
        )
    }

    pub fn refresh_failed(&mut self, reason: &str, waiters: usize) -> Result<()> {
        self.log(
            "refresh_failed",
            serde_json::json!({ "reason": reason, "waiters": waiters }),
        )
    }

    pub fn login(&mut self, user_type: &str) -> Result<()> {
        self.log("login", serde_json::json!({ "user_type": user_type }))
    }

    pub fn logout(&mut self) -> Result<()> {
        self.log("logout", serde_json::json!({}))
    }

    /// Involuntary sign-out after an unrecoverable refresh failure
    pub fn signed_out(&mut self) -> Result<()> {
        self.log("signed_out", serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn read_events(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_events_are_flattened() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("journal.jsonl");
        let mut journal = Journal::new(&path, "client-1").unwrap();

        journal.request("GET", "http://localhost/api/v1/students/dashboard", true).unwrap();
        journal.refresh_ok(false, 2).unwrap();

        let events = read_events(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "request");
        assert_eq!(events[0]["client_id"], "client-1");
        assert_eq!(events[0]["authenticated"], true);
        assert!(events[0]["ts"].is_string());
        assert_eq!(events[1]["type"], "refresh_ok");
        assert_eq!(events[1]["rotated"], false);
        assert_eq!(events[1]["waiters"], 2);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        Journal::new(&path, "a").unwrap().logout().unwrap();
        Journal::new(&path, "b").unwrap().signed_out().unwrap();

        let events = read_events(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["client_id"], "a");
        assert_eq!(events[1]["type"], "signed_out");
    }
}
