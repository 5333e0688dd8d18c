//! Rollout persistence (spec §6, SPEC_FULL.md §11 "Conversation replay /
//! rollout resume"): a durable JSON snapshot of a session's conversation
//! history, so a session can be reopened exactly where it left off.
//!
//! The on-disk shape mirrors [`coda_llm::Message`] but is independently
//! serializable, since the wire types favor arrival-order `Vec<Part>`
//! enums over a `serde`-friendly tagged representation.

use std::io;
use std::path::{Path, PathBuf};

use coda_llm::{AssistantPart, ImagePart, Message, ReasoningPart, SystemPart, TextPart, ToolCallPart, ToolResultPart, UserPart};
use serde::{Deserialize, Serialize};

/// Metadata describing a session, stored alongside its conversation items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub model: String,
    pub provider: String,
    /// RFC3339 timestamp. Stamped by the caller — this module never calls
    /// the clock, so resumed runs stay reproducible.
    pub created_at: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// A session's full persisted state: its metadata and message history.
#[derive(Debug, Clone)]
pub struct Rollout {
    pub session: SessionMeta,
    pub items: Vec<Message>,
}

impl Rollout {
    pub fn new(session: SessionMeta) -> Self {
        Self {
            session,
            items: Vec::new(),
        }
    }

    /// The conventional path for a session's rollout file under `codex_dir`
    /// (§6: `.codex/rollout-<session_id>.json`).
    pub fn path_for(codex_dir: &Path, session_id: &str) -> PathBuf {
        codex_dir.join(format!("rollout-{session_id}.json"))
    }

    /// Load a rollout file from disk.
    pub async fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let file: RolloutFile =
            serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self {
            session: file.session,
            items: file.items.into_iter().map(from_wire).collect(),
        })
    }

    /// Persist the rollout to disk, creating parent directories as needed.
    pub async fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = RolloutFile {
            session: self.session.clone(),
            items: self.items.iter().map(to_wire).collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(path, json).await
    }

    /// Append a message to the in-memory history and immediately persist
    /// (§6: the rollout file stays in sync as the turn progresses, so a
    /// crash mid-turn loses at most the in-flight tool call).
    pub async fn record(&mut self, path: impl AsRef<Path>, message: Message) -> io::Result<()> {
        self.items.push(message);
        self.save(path).await
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct RolloutFile {
    session: SessionMeta,
    items: Vec<WireMessage>,
}

#[derive(Serialize, Deserialize)]
enum WireSystemPart {
    Text(TextPart),
}

#[derive(Serialize, Deserialize)]
enum WireUserPart {
    Text(TextPart),
    Image(ImagePart),
}

#[derive(Serialize, Deserialize)]
enum WireAssistantPart {
    Text(TextPart),
    Reasoning(ReasoningPart),
    ToolCall(ToolCallPart),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
enum WireMessage {
    System { parts: Vec<WireSystemPart> },
    User { parts: Vec<WireUserPart> },
    Assistant { parts: Vec<WireAssistantPart> },
    Tool { parts: Vec<ToolResultPart> },
}

fn to_wire(msg: &Message) -> WireMessage {
    match msg {
        Message::System { parts } => WireMessage::System {
            parts: parts
                .iter()
                .map(|SystemPart::Text(t)| WireSystemPart::Text(t.clone()))
                .collect(),
        },
        Message::User { parts } => WireMessage::User {
            parts: parts
                .iter()
                .map(|p| match p {
                    UserPart::Text(t) => WireUserPart::Text(t.clone()),
                    UserPart::Image(i) => WireUserPart::Image(i.clone()),
                })
                .collect(),
        },
        Message::Assistant { parts } => WireMessage::Assistant {
            parts: parts
                .iter()
                .map(|p| match p {
                    AssistantPart::Text(t) => WireAssistantPart::Text(t.clone()),
                    AssistantPart::Reasoning(r) => WireAssistantPart::Reasoning(r.clone()),
                    AssistantPart::ToolCall(tc) => WireAssistantPart::ToolCall(tc.clone()),
                })
                .collect(),
        },
        Message::Tool { parts } => WireMessage::Tool {
            parts: parts.clone(),
        },
    }
}

fn from_wire(msg: WireMessage) -> Message {
    match msg {
        WireMessage::System { parts } => Message::System {
            parts: parts
                .into_iter()
                .map(|WireSystemPart::Text(t)| SystemPart::Text(t))
                .collect(),
        },
        WireMessage::User { parts } => Message::User {
            parts: parts
                .into_iter()
                .map(|p| match p {
                    WireUserPart::Text(t) => UserPart::Text(t),
                    WireUserPart::Image(i) => UserPart::Image(i),
                })
                .collect(),
        },
        WireMessage::Assistant { parts } => Message::Assistant {
            parts: parts
                .into_iter()
                .map(|p| match p {
                    WireAssistantPart::Text(t) => AssistantPart::Text(t),
                    WireAssistantPart::Reasoning(r) => AssistantPart::Reasoning(r),
                    WireAssistantPart::ToolCall(tc) => AssistantPart::ToolCall(tc),
                })
                .collect(),
        },
        WireMessage::Tool { parts } => Message::Tool { parts },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_session() -> SessionMeta {
        SessionMeta {
            id: "abc123".to_string(),
            model: "gpt-5-codex".to_string(),
            provider: "openai".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            instructions: Some("You are helpful.".to_string()),
        }
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout-abc123.json");

        let mut rollout = Rollout::new(sample_session());
        rollout.items.push(Message::user("hello"));
        rollout.items.push(Message::assistant("hi there"));
        rollout.items.push(Message::Assistant {
            parts: vec![AssistantPart::ToolCall(ToolCallPart {
                id: "call_1".to_string(),
                name: "shell".to_string(),
                arguments: r#"{"cmd":["ls"]}"#.to_string(),
            })],
        });
        rollout.items.push(Message::tool_result("call_1", "{}"));

        rollout.save(&path).await.unwrap();
        let loaded = Rollout::load(&path).await.unwrap();

        assert_eq!(loaded.session.id, "abc123");
        assert_eq!(loaded.items.len(), 4);
        assert!(matches!(loaded.items[0], Message::User { .. }));
        assert!(matches!(loaded.items[2], Message::Assistant { .. }));
        assert_eq!(loaded.items[2].tool_calls().len(), 1);
    }

    #[tokio::test]
    async fn record_appends_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout-xyz.json");
        let mut rollout = Rollout::new(sample_session());

        rollout
            .record(&path, Message::user("first"))
            .await
            .unwrap();
        rollout
            .record(&path, Message::assistant("second"))
            .await
            .unwrap();

        let loaded = Rollout::load(&path).await.unwrap();
        assert_eq!(loaded.items.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        assert!(Rollout::load(&path).await.is_err());
    }
}
