use std::time::Instant;

use coda_llm::{Describe, Property, Schema};
use serde::Deserialize;

use crate::handler::finish;
use crate::tool::Tool;

/// `edit` tool input (§11 supplemented feature): an exact-match
/// find/replace, distinct from the patch engine, for a single small
/// in-place edit without constructing a full patch envelope.
#[derive(Clone, Deserialize)]
pub struct EditInput {
    /// The file path to edit, relative to the working directory.
    pub path: String,
    /// The exact text to find in the file. Must match exactly once.
    pub old: String,
    /// The replacement text.
    pub new: String,
}

impl Describe for EditInput {
    fn describe() -> Schema {
        Schema::Object {
            description: None,
            properties: vec![
                Property {
                    name: "path".into(),
                    schema: Schema::String {
                        description: Some(
                            "File path to edit, relative to the working directory".into(),
                        ),
                        enumeration: None,
                    },
                },
                Property {
                    name: "old".into(),
                    schema: Schema::String {
                        description: Some(
                            "The exact text to find in the file. Must match exactly once.".into(),
                        ),
                        enumeration: None,
                    },
                },
                Property {
                    name: "new".into(),
                    schema: Schema::String {
                        description: Some("The replacement text".into()),
                        enumeration: None,
                    },
                },
            ],
            required: vec!["path".into(), "old".into(), "new".into()],
        }
    }
}

/// Tool that performs an exact-match find-and-replace in a file.
/// The `old` string must appear exactly once in the file.
#[derive(Clone)]
pub struct EditTool {
    pub(crate) cwd: std::path::PathBuf,
}

impl EditTool {
    pub fn new(cwd: std::path::PathBuf) -> Self {
        Self { cwd }
    }
}

impl Tool for EditTool {
    type Input = EditInput;

    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact match of `old` with `new`. The `old` string must appear \
         exactly once in the file."
    }

    async fn call(&self, input: EditInput) -> Result<String, coda_llm::Error> {
        let start = Instant::now();
        let path = self.cwd.join(&input.path);

        let outcome = async {
            let content = tokio::fs::read_to_string(&path).await?;
            let count = content.matches(&input.old).count();
            if count != 1 {
                return Ok(finish(
                    start,
                    format!("old string found {count} times in {} (must be exactly 1)", input.path),
                    1,
                ));
            }
            let new_content = content.replacen(&input.old, &input.new, 1);
            tokio::fs::write(&path, &new_content).await?;
            Ok::<_, std::io::Error>(finish(start, format!("edited {}", input.path), 0))
        }
        .await;

        let result = outcome.unwrap_or_else(|e| finish(start, format!("{}: {e}", path.display()), 1));
        Ok(result.to_content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn replaces_unique_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {\n    old();\n}\n").unwrap();
        let tool = EditTool::new(dir.path().to_path_buf());
        let content = tool
            .call(EditInput {
                path: "a.rs".to_string(),
                old: "old();".to_string(),
                new: "new();".to_string(),
            })
            .await
            .unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        assert_eq!(result.metadata.exit_code, 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.rs")).unwrap(),
            "fn main() {\n    new();\n}\n"
        );
    }

    #[tokio::test]
    async fn rejects_ambiguous_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "x\nx\n").unwrap();
        let tool = EditTool::new(dir.path().to_path_buf());
        let content = tool
            .call(EditInput {
                path: "a.rs".to_string(),
                old: "x".to_string(),
                new: "y".to_string(),
            })
            .await
            .unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        assert_ne!(result.metadata.exit_code, 0);
    }

    #[tokio::test]
    async fn rejects_missing_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "hello\n").unwrap();
        let tool = EditTool::new(dir.path().to_path_buf());
        let content = tool
            .call(EditInput {
                path: "a.rs".to_string(),
                old: "nonexistent".to_string(),
                new: "y".to_string(),
            })
            .await
            .unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        assert_ne!(result.metadata.exit_code, 0);
    }
}
