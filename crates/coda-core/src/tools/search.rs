use std::time::Instant;

use coda_llm::{Describe, Property, Schema};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::exec::{self, CancelHandle, ExecInput, Sandbox};
use crate::handler::{finish, map_search_exit};
use crate::tool::Tool;

/// `search_codebase` tool input (§4.1, §4.4): wraps a ripgrep-style
/// invocation.
#[derive(Clone, Deserialize)]
pub struct SearchCodebaseInput {
    pub pattern: String,
    #[serde(default)]
    pub include: Option<String>,
}

impl Describe for SearchCodebaseInput {
    fn describe() -> Schema {
        Schema::Object {
            description: Some("Search the repository for a pattern using ripgrep".into()),
            properties: vec![
                Property {
                    name: "pattern".into(),
                    schema: Schema::String {
                        description: Some("Regex pattern to search for".into()),
                        enumeration: None,
                    },
                },
                Property {
                    name: "include".into(),
                    schema: Schema::String {
                        description: Some("Glob restricting which files are searched".into()),
                        enumeration: None,
                    },
                },
            ],
            required: vec!["pattern".into()],
        }
    }
}

#[derive(Clone)]
pub struct SearchCodebaseTool {
    pub(crate) cwd: std::path::PathBuf,
    pub(crate) cancel: CancelHandle,
}

impl SearchCodebaseTool {
    pub fn new(cwd: std::path::PathBuf, cancel: CancelHandle) -> Self {
        Self { cwd, cancel }
    }
}

impl Tool for SearchCodebaseTool {
    type Input = SearchCodebaseInput;

    fn name(&self) -> &str {
        "search_codebase"
    }

    fn description(&self) -> &str {
        "Search the repository for a pattern using ripgrep. Returns matching lines with file:line prefixes."
    }

    async fn call(&self, input: SearchCodebaseInput) -> Result<String, coda_llm::Error> {
        let start = Instant::now();
        let mut cmd = vec!["rg".to_string(), "--line-number".to_string()];
        if let Some(include) = input.include {
            cmd.push("--glob".to_string());
            cmd.push(include);
        }
        cmd.push(input.pattern);

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let exec_result = exec::exec(
            ExecInput {
                cmd,
                workdir: Some(self.cwd.clone()),
                timeout_ms: None,
            },
            Sandbox::None,
            self.cancel.token(),
            tx,
        )
        .await;

        let (output, exit_code) =
            map_search_exit(&exec_result.stdout, &exec_result.stderr, exec_result.exit_code);
        Ok(finish(start, output, exit_code).to_content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn no_matches_reports_exact_message() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "nothing interesting here").unwrap();
        let tool = SearchCodebaseTool::new(dir.path().to_path_buf(), CancelHandle::new());
        let content = tool
            .call(SearchCodebaseInput {
                pattern: "definitely-not-present-xyz".to_string(),
                include: None,
            })
            .await
            .unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        // When `rg` isn't on PATH this degrades to the 127 branch instead;
        // accept either outcome in this environment-dependent test.
        if result.metadata.exit_code == 0 {
            assert_eq!(result.output, "No matches found.");
        } else {
            assert_eq!(result.metadata.exit_code, 127);
            assert!(result.output.contains("exit code 127"));
        }
    }
}
