use std::time::Instant;

use coda_llm::{Describe, Property, Schema};
use serde::Deserialize;

use crate::handler::finish;
use crate::memory::MemoryStore;
use crate::tool::Tool;

/// `persistent_memory` tool input (§4.4): append a note, or query the
/// store, filtered by an optional substring.
#[derive(Clone, Deserialize)]
pub struct PersistentMemoryInput {
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
}

impl Describe for PersistentMemoryInput {
    fn describe() -> Schema {
        Schema::Object {
            description: Some(
                "Append a note to, or query, the user's persistent notes store".into(),
            ),
            properties: vec![
                Property {
                    name: "note".into(),
                    schema: Schema::String {
                        description: Some("A note to append".into()),
                        enumeration: None,
                    },
                },
                Property {
                    name: "query".into(),
                    schema: Schema::String {
                        description: Some(
                            "Substring to filter existing notes by; omit to list them all".into(),
                        ),
                        enumeration: None,
                    },
                },
            ],
            required: vec![],
        }
    }
}

#[derive(Clone)]
pub struct PersistentMemoryTool {
    pub(crate) store: std::sync::Arc<MemoryStore>,
}

impl PersistentMemoryTool {
    pub fn new(store: std::sync::Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

impl Tool for PersistentMemoryTool {
    type Input = PersistentMemoryInput;

    fn name(&self) -> &str {
        "persistent_memory"
    }

    fn description(&self) -> &str {
        "Append a note to, or query, the user's persistent notes store (.codex/memory.md)."
    }

    async fn call(&self, input: PersistentMemoryInput) -> Result<String, coda_llm::Error> {
        let start = Instant::now();

        if let Some(note) = input.note {
            let result = match self.store.append(&note).await {
                Ok(()) => finish(start, "Noted.", 0),
                Err(e) => finish(start, e.to_string(), 1),
            };
            return Ok(result.to_content());
        }

        let result = match self.store.query(input.query.as_deref()).await {
            Ok(matches) if matches.is_empty() => finish(start, "(no notes)", 0),
            Ok(matches) => finish(start, matches, 0),
            Err(e) => finish(start, e.to_string(), 1),
        };
        Ok(result.to_content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn note_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let tool = PersistentMemoryTool::new(Arc::new(MemoryStore::new(dir.path())));

        tool.call(PersistentMemoryInput {
            note: Some("check on the deploy".to_string()),
            query: None,
        })
        .await
        .unwrap();

        let content = tool
            .call(PersistentMemoryInput {
                note: None,
                query: None,
            })
            .await
            .unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        assert!(result.output.contains("check on the deploy"));
    }
}
