//! Rollout-backed session store (§6, §11 "Conversation replay / rollout
//! resume"): lists, creates, and resumes sessions persisted as
//! `.codex/rollout-<id>.json` files under the project root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use coda_core::rollout::{Rollout, SessionMeta};
use coda_llm::Message;
use parking_lot::Mutex;

pub type SharedSessionStore = Arc<Mutex<SessionStore>>;

/// Summary of a session found on disk, for listing without loading its
/// full message history.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub model: String,
    pub created_at: String,
    pub title: Option<String>,
}

pub struct SessionStore {
    codex_dir: PathBuf,
    active: Option<Rollout>,
}

impl SessionStore {
    pub fn open_for_project_root(project_root: &Path) -> Self {
        Self {
            codex_dir: project_root.join(".codex"),
            active: None,
        }
    }

    pub fn codex_dir(&self) -> &Path {
        &self.codex_dir
    }

    /// List sessions under the project root, most recently created first,
    /// bounded to `limit` entries.
    pub fn list_sessions(&self, limit: usize) -> std::io::Result<Vec<SessionSummary>> {
        let mut entries = Vec::new();
        let dir = match std::fs::read_dir(&self.codex_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        for entry in dir {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("rollout-") || !name.ends_with(".json") {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
                continue;
            };
            let Some(session) = value.get("session") else {
                continue;
            };
            let summary = SessionSummary {
                id: session
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                model: session
                    .get("model")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                created_at: session
                    .get("created_at")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                title: None,
            };
            entries.push(summary);
        }

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|r| r.session.id.as_str())
    }

    /// A clone of the active rollout, if any (§11 resume path).
    pub fn active_rollout(&self) -> Option<Rollout> {
        self.active.clone()
    }

    /// Start a brand-new session: a fresh id, no history.
    pub fn create_session(&mut self, model: &str, provider: &str, created_at: String) -> &Rollout {
        let session = SessionMeta {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.to_string(),
            provider: provider.to_string(),
            created_at,
            instructions: None,
        };
        self.active = Some(Rollout::new(session));
        self.active.as_ref().unwrap()
    }

    /// Load a specific session's rollout into memory, returning its message
    /// history so the caller can rebuild an [`coda_core::Agent`] from it.
    pub async fn activate_session(&mut self, session_id: &str) -> std::io::Result<Vec<Message>> {
        let path = Rollout::path_for(&self.codex_dir, session_id);
        let rollout = Rollout::load(&path).await?;
        let items = rollout.items.clone();
        self.active = Some(rollout);
        Ok(items)
    }

    /// Resume the most recently created session, if any.
    pub async fn resume_most_recent_session(&mut self) -> std::io::Result<Option<Vec<Message>>> {
        let Some(summary) = self.list_sessions(1)?.into_iter().next() else {
            return Ok(None);
        };
        self.activate_session(&summary.id).await.map(Some)
    }

    /// Append a message to the active session's rollout and persist it to
    /// disk immediately (§6, §11).
    pub async fn record(&mut self, message: Message) -> std::io::Result<()> {
        let codex_dir = self.codex_dir.clone();
        let Some(rollout) = self.active.as_mut() else {
            return Err(std::io::Error::other("no active session"));
        };
        let path = Rollout::path_for(&codex_dir, &rollout.session.id);
        rollout.record(&path, message).await
    }

    /// Overwrite the active session's full history (used after a turn
    /// completes, to persist exactly the conversation the agent now holds).
    pub async fn sync_from_messages(&mut self, messages: &[Message]) -> std::io::Result<()> {
        let codex_dir = self.codex_dir.clone();
        let Some(rollout) = self.active.as_mut() else {
            return Err(std::io::Error::other("no active session"));
        };
        rollout.items = messages.to_vec();
        let path = Rollout::path_for(&codex_dir, &rollout.session.id);
        rollout.save(&path).await
    }
}

pub fn session_label(summary: &SessionSummary) -> String {
    match &summary.title {
        Some(title) => format!("{title} ({})", summary.id),
        None => format!("Session {}", summary.id),
    }
}
