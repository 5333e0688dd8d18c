//! The function-call handler (C4, spec §4.4). Cross-cutting helpers shared
//! by the individual tool implementations in [`crate::tools`]: where a
//! call's working directory and sandbox come from, how its approval-gate
//! disposition is classified before it ever reaches a tool, and the
//! ripgrep exit-code mapping for `search_codebase`.

use std::path::PathBuf;
use std::time::Instant;

use coda_llm::ToolResult;

use crate::approval::PendingCall;
use crate::exec::Sandbox;

/// Shared execution context threaded into every built-in tool.
#[derive(Clone)]
pub struct HandlerContext {
    pub cwd: PathBuf,
    pub sandbox: Sandbox,
}

impl HandlerContext {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            sandbox: Sandbox::None,
        }
    }
}

/// Wrap a handler's raw output into the `{output, metadata}` envelope
/// (§4.4), timing the call from `start`.
pub fn finish(start: Instant, output: impl Into<String>, exit_code: i32) -> ToolResult {
    let duration = start.elapsed().as_secs_f64();
    if exit_code == 0 {
        ToolResult::ok(output, duration)
    } else {
        ToolResult::failed(output, exit_code, duration)
    }
}

/// Map a ripgrep-style invocation's outcome to `search_codebase`'s output
/// text (§4.4, scenario S6).
pub fn map_search_exit(stdout: &str, stderr: &str, exit_code: i32) -> (String, i32) {
    match exit_code {
        0 => (stdout.to_string(), 0),
        1 => ("No matches found.".to_string(), 0),
        127 => (
            format!("Error: search_codebase failed with exit code 127: {stderr}"),
            127,
        ),
        other => (
            format!("Error: search_codebase failed with exit code {other}: {stderr}"),
            other,
        ),
    }
}

/// Classify a named tool call ahead of dispatch, for the approval gate
/// (§4.7). `arguments` is the call's raw JSON argument string.
pub fn classify_call(name: &str, arguments: &str) -> PendingCall {
    let argv = if name == "shell" || name == "apply_patch" {
        serde_json::from_str::<serde_json::Value>(arguments)
            .ok()
            .and_then(|v| v.get("cmd").cloned())
            .and_then(|v| match v {
                serde_json::Value::Array(items) => Some(
                    items
                        .into_iter()
                        .filter_map(|i| i.as_str().map(str::to_string))
                        .collect::<Vec<_>>(),
                ),
                serde_json::Value::String(s) => crate::parser::tokenize(&s).ok(),
                _ => None,
            })
    } else {
        None
    };

    // `apply_patch` calls are normalized to `name == "shell"` before this
    // function ever runs (see `agent.rs::normalize_tool_call`), so the tool
    // name alone can't distinguish a patch application from an arbitrary
    // shell command — only the parsed argv can, mirroring the dispatch
    // check `tools/shell.rs` makes at execution time.
    let is_write = matches!(name, "write_file" | "delete_file" | "edit")
        || argv
            .as_ref()
            .and_then(|a| a.first())
            .map(String::as_str)
            == Some("apply_patch");

    PendingCall {
        tool_name: name.to_string(),
        argv,
        is_write,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_exit_mapping() {
        assert_eq!(
            map_search_exit("", "", 1),
            ("No matches found.".to_string(), 0)
        );
        let (msg, code) = map_search_exit("", "/bin/sh: 1: rg: not found", 127);
        assert_eq!(code, 127);
        assert!(msg.contains("exit code 127"));
        assert!(msg.contains("rg: not found"));
    }

    #[test]
    fn classify_marks_writes() {
        let call = classify_call("write_file", r#"{"path":"a"}"#);
        assert!(call.is_write);
        let call = classify_call("read_file", r#"{"path":"a"}"#);
        assert!(!call.is_write);
    }

    #[test]
    fn classify_distinguishes_shell_from_normalized_apply_patch() {
        // Both arrive with `name == "shell"` (apply_patch is normalized
        // before classification); only the argv tells them apart.
        let shell = classify_call("shell", r#"{"cmd":["rm","-rf","."]}"#);
        assert!(!shell.is_write);
        let patch = classify_call("shell", r#"{"cmd":["apply_patch","*** Begin Patch"]}"#);
        assert!(patch.is_write);
    }
}
