use std::time::Instant;

use coda_llm::{Describe, Property, Schema};
use serde::Deserialize;
use serde::de::{self, Deserializer};
use tokio::sync::mpsc;

use crate::exec::{self, CancelHandle, ExecInput, OutputChunk, Sandbox};
use crate::handler::finish;
use crate::patch::{self, FsPatchFs};
use crate::tool::Tool;

/// `shell` tool input (§4.1, §4.4). `apply_patch` is a convention, not a
/// separate tool name: the model (or the free-text recovery path, S4) emits
/// it as `cmd = ["apply_patch", <patch_text>]`.
#[derive(Clone)]
pub struct ShellInput {
    pub cmd: Vec<String>,
    pub workdir: Option<String>,
    pub timeout_ms: Option<u32>,
}

impl<'de> Deserialize<'de> for ShellInput {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            cmd: Option<serde_json::Value>,
            #[serde(default)]
            command: Option<serde_json::Value>,
            #[serde(default)]
            workdir: Option<String>,
            #[serde(default)]
            timeout: Option<u32>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let value = raw.cmd.or(raw.command).ok_or_else(|| {
            de::Error::custom("shell tool call is missing `cmd`/`command`")
        })?;
        let cmd = crate::parser::normalize_cmd_value(&value).map_err(de::Error::custom)?;

        Ok(ShellInput {
            cmd,
            workdir: raw.workdir,
            timeout_ms: raw.timeout,
        })
    }
}

impl Describe for ShellInput {
    fn describe() -> Schema {
        Schema::Object {
            description: Some(
                "Run a shell command, or apply a textual patch via `cmd = [\"apply_patch\", <patch>]`"
                    .into(),
            ),
            properties: vec![
                Property {
                    name: "cmd".into(),
                    schema: Schema::Array {
                        description: Some("Argv, or a one-element array holding a full command line".into()),
                        items: Box::new(Schema::String {
                            description: None,
                            enumeration: None,
                        }),
                    },
                },
                Property {
                    name: "workdir".into(),
                    schema: Schema::String {
                        description: Some("Working directory, relative to the session root".into()),
                        enumeration: None,
                    },
                },
                Property {
                    name: "timeout".into(),
                    schema: Schema::Integer {
                        description: Some("Timeout in milliseconds (default 10000)".into()),
                    },
                },
            ],
            required: vec!["cmd".into()],
        }
    }
}

#[derive(Clone)]
pub struct ShellTool {
    pub(crate) cwd: std::path::PathBuf,
    pub(crate) sandbox: Sandbox,
    pub(crate) cancel: CancelHandle,
}

impl ShellTool {
    /// `cancel` should be the turn-scoped handle the agent loop holds, so
    /// that cancelling a turn also tears down any in-flight child process.
    pub fn new(cwd: std::path::PathBuf, sandbox: Sandbox, cancel: CancelHandle) -> Self {
        Self {
            cwd,
            sandbox,
            cancel,
        }
    }
}

impl Tool for ShellTool {
    type Input = ShellInput;

    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory, or apply a textual patch via \
         `cmd = [\"apply_patch\", <patch text>]`."
    }

    async fn call(&self, input: ShellInput) -> Result<String, coda_llm::Error> {
        let start = Instant::now();

        if input.cmd.first().map(String::as_str) == Some("apply_patch") {
            let patch_text = input.cmd.get(1).cloned().unwrap_or_default();
            let mut fs = FsPatchFs::new(self.cwd.clone());
            let result = match patch::apply_patch_text(&patch_text, &mut fs) {
                Ok(fuzz) => finish(start, format!("Patch applied (fuzz={fuzz})."), 0),
                Err(e) => finish(start, e.to_string(), 1),
            };
            return Ok(result.to_content());
        }

        let workdir = input.workdir.map(|w| self.cwd.join(w)).or_else(|| Some(self.cwd.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let exec_result = exec::exec(
            ExecInput {
                cmd: input.cmd,
                workdir,
                timeout_ms: input.timeout_ms,
            },
            self.sandbox,
            self.cancel.token(),
            tx,
        )
        .await;

        let mut output = exec_result.stdout;
        if !exec_result.stderr.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str("stderr:\n");
            output.push_str(&exec_result.stderr);
        }
        Ok(finish(start, output, exec_result.exit_code).to_content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserializes_array_cmd() {
        let input: ShellInput = serde_json::from_str(r#"{"cmd":["ls","-la"]}"#).unwrap();
        assert_eq!(input.cmd, vec!["ls".to_string(), "-la".to_string()]);
    }

    #[test]
    fn deserializes_string_command_and_tokenizes() {
        let input: ShellInput = serde_json::from_str(r#"{"command":"cat README.md"}"#).unwrap();
        assert_eq!(input.cmd, vec!["cat".to_string(), "README.md".to_string()]);
    }

    #[tokio::test]
    async fn runs_echo() {
        let tool = ShellTool::new(std::env::temp_dir(), Sandbox::None, CancelHandle::new());
        let content = tool
            .call(ShellInput {
                cmd: vec!["echo".to_string(), "hi".to_string()],
                workdir: None,
                timeout_ms: None,
            })
            .await
            .unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        assert_eq!(result.metadata.exit_code, 0);
        assert_eq!(result.output.trim(), "hi");
    }

    #[tokio::test]
    async fn apply_patch_argv_dispatches_to_patch_engine() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ShellTool::new(dir.path().to_path_buf(), Sandbox::None, CancelHandle::new());
        let patch_text = "*** Begin Patch\n*** Add File: hi.txt\n+hello\n*** End Patch";
        let content = tool
            .call(ShellInput {
                cmd: vec!["apply_patch".to_string(), patch_text.to_string()],
                workdir: None,
                timeout_ms: None,
            })
            .await
            .unwrap();
        let result: coda_llm::ToolResult = serde_json::from_str(&content).unwrap();
        assert_eq!(result.metadata.exit_code, 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hi.txt")).unwrap(),
            "hello\n"
        );
    }
}
