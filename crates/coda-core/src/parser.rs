//! Tool-call parsing (C1): JSON-argument normalization, free-text tool-call
//! recovery, and argument flattening. See spec §4.1.

use coda_llm::ToolCallPart;
use serde_json::Value;

/// Keys from the tool-call argument union (§4.1) used to recognize a
/// free-standing JSON object as a tool call.
const SCHEMA_KEYS: &[&str] = &[
    "cmd",
    "command",
    "patch",
    "path",
    "start_line",
    "end_line",
    "pattern",
    "include",
    "depth",
];

/// Result of a failed parse (§4.1 "Failure modes" — never panics).
#[derive(Debug, Clone)]
pub struct ParseFailure {
    pub error: String,
}

impl ParseFailure {
    pub fn to_result_json(&self) -> String {
        serde_json::json!({ "success": false, "error": self.error }).to_string()
    }
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for ParseFailure {}

// ---------------------------------------------------------------------------
// Shell tokenization (§4.1, invariant 4)
// ---------------------------------------------------------------------------

/// POSIX-ish shell word-splitting: quotes and escapes honored, no glob
/// expansion (shell-words never expands globs).
pub fn tokenize(command_line: &str) -> Result<Vec<String>, ParseFailure> {
    shell_words::split(command_line).map_err(|e| ParseFailure {
        error: format!("failed to tokenize command: {e}"),
    })
}

/// A single shell-operator token that forces shell dispatch (§4.3).
const SHELL_OPERATORS: &[&str] = &["|", ">", "<", ">>", "&&", "||", ";", "&"];

/// `requires_shell(cmd)` (§4.3, invariant 4): true iff `cmd` is a single
/// element (a full command line) or any element, tokenized, contains a
/// shell operator.
pub fn requires_shell(cmd: &[String]) -> bool {
    if cmd.len() == 1 {
        return true;
    }
    cmd.iter().any(|part| {
        tokenize(part)
            .map(|tokens| tokens.iter().any(|t| SHELL_OPERATORS.contains(&t.as_str())))
            .unwrap_or(false)
    })
}

/// Normalize a `cmd`/`command` JSON value into argv, per §4.1:
/// - `command` is renamed to `cmd`.
/// - a single string is tokenized with POSIX word-splitting.
/// - a one-element array whose sole string contains whitespace outside
///   quotes is tokenized the same way; other arrays are used verbatim.
pub fn normalize_cmd_value(value: &Value) -> Result<Vec<String>, ParseFailure> {
    match value {
        Value::String(s) => tokenize(s),
        Value::Array(items) => {
            let strings: Result<Vec<String>, ParseFailure> = items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| ParseFailure {
                        error: "cmd array must contain only strings".into(),
                    })
                })
                .collect();
            let strings = strings?;
            if strings.len() == 1 && strings[0].contains(char::is_whitespace) {
                tokenize(&strings[0])
            } else {
                Ok(strings)
            }
        }
        _ => Err(ParseFailure {
            error: "cmd/command must be a string or array of strings".into(),
        }),
    }
}

/// Rename the top-level `command` key to `cmd` in a JSON object, if present.
fn rename_command_to_cmd(value: &mut Value) {
    if let Value::Object(map) = value
        && let Some(command) = map.remove("command")
    {
        map.entry("cmd").or_insert(command);
    }
}

// ---------------------------------------------------------------------------
// Argument flattening (§4.1, scenario S8)
// ---------------------------------------------------------------------------

/// If `call.arguments` is a concatenation of multiple top-level JSON
/// objects, split it into one call per object, inheriting `call.name`. A
/// single well-formed object is returned unchanged (as a one-element
/// vector) so callers can always iterate the result.
pub fn flatten_tool_call(call: &ToolCallPart) -> Vec<ToolCallPart> {
    let objects = scan_balanced_objects(&call.arguments);
    if objects.len() <= 1 {
        return vec![call.clone()];
    }

    objects
        .into_iter()
        .enumerate()
        .filter_map(|(i, raw)| {
            let mut value: Value = serde_json::from_str(raw).ok()?;
            rename_command_to_cmd(&mut value);
            Some(ToolCallPart {
                id: format!("{}_{i}", call.id),
                name: call.name.clone(),
                arguments: value.to_string(),
            })
        })
        .collect()
}

/// Scan `text` for top-level (depth-0-rooted) balanced `{...}` spans,
/// honoring string literals and escapes so braces inside strings don't
/// perturb the depth count. Returns the raw substrings, in order.
fn scan_balanced_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut depth = 0i32;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i] as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if b == '\\' {
                escaped = true;
            } else if b == '"' {
                in_string = false;
            }
        } else {
            match b {
                '"' => in_string = true,
                '{' => {
                    if depth == 0 {
                        start = Some(i);
                    }
                    depth += 1;
                }
                '}' => {
                    depth -= 1;
                    if depth == 0
                        && let Some(s) = start.take()
                    {
                        spans.push(&text[s..=i]);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }

    spans
}

// ---------------------------------------------------------------------------
// Free-text tool-call recovery (§4.1, §9)
// ---------------------------------------------------------------------------

/// Recover tool calls the model emitted as assistant text instead of through
/// the structured function-calling channel. Precedence: fenced code blocks,
/// then balanced-brace JSON (skipped if fenced blocks yielded anything), then
/// raw `*** Begin Patch ... *** End Patch` blocks (always scanned).
pub fn extract_free_text_tool_calls(text: &str) -> Vec<ToolCallPart> {
    let mut calls = scan_fenced_blocks(text);
    if calls.is_empty() {
        calls.extend(scan_json_objects(text));
    }
    calls.extend(scan_raw_patches(text));
    calls
}

fn synth_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// (a) Fenced code blocks labelled `json`, `bash`, `shell`, or `sh`.
fn scan_fenced_blocks(text: &str) -> Vec<ToolCallPart> {
    let mut calls = Vec::new();
    let mut rest = text;

    while let Some(fence_start) = rest.find("```") {
        let after_fence = &rest[fence_start + 3..];
        let line_end = after_fence.find('\n').unwrap_or(after_fence.len());
        let lang = after_fence[..line_end].trim().to_lowercase();
        let body_start = if line_end < after_fence.len() {
            line_end + 1
        } else {
            line_end
        };
        let body_rest = &after_fence[body_start..];

        let Some(close_rel) = body_rest.find("```") else {
            break;
        };
        let body = &body_rest[..close_rel];

        match lang.as_str() {
            "json" => {
                if let Some(call) = parse_json_tool_call(body.trim()) {
                    calls.push(call);
                }
            }
            "bash" | "shell" | "sh" => {
                if let Ok(argv) = tokenize(body.trim()) {
                    calls.push(ToolCallPart {
                        id: synth_id(),
                        name: "shell".into(),
                        arguments: serde_json::json!({ "cmd": argv }).to_string(),
                    });
                }
            }
            _ => {}
        }

        rest = &body_rest[close_rel + 3..];
    }

    calls
}

/// (b) Any top-level balanced `{…}` JSON object containing a recognized key.
fn scan_json_objects(text: &str) -> Vec<ToolCallPart> {
    scan_balanced_objects(text)
        .into_iter()
        .filter_map(parse_json_tool_call)
        .collect()
}

fn parse_json_tool_call(raw: &str) -> Option<ToolCallPart> {
    let mut value: Value = serde_json::from_str(raw).ok()?;
    rename_command_to_cmd(&mut value);
    let obj = value.as_object()?;
    if !SCHEMA_KEYS.iter().any(|k| obj.contains_key(*k)) {
        return None;
    }

    Some(ToolCallPart {
        id: synth_id(),
        name: infer_tool_name(obj),
        arguments: value.to_string(),
    })
}

fn infer_tool_name(obj: &serde_json::Map<String, Value>) -> String {
    if obj.contains_key("cmd") || obj.contains_key("command") {
        "shell".to_string()
    } else if obj.contains_key("patch") {
        "apply_patch".to_string()
    } else if obj.contains_key("pattern") {
        "search_codebase".to_string()
    } else if obj.contains_key("start_line") || obj.contains_key("end_line") {
        "read_file_lines".to_string()
    } else if obj.contains_key("path") {
        "read_file".to_string()
    } else {
        "unknown".to_string()
    }
}

/// (c) Raw `*** Begin Patch ... *** End Patch` blocks not otherwise wrapped
/// in a fenced code block, treated as `apply_patch` invocations via `shell`
/// with argv `["apply_patch", <patch_text>]` (§4.4).
fn scan_raw_patches(text: &str) -> Vec<ToolCallPart> {
    const BEGIN: &str = "*** Begin Patch";
    const END: &str = "*** End Patch";

    let mut calls = Vec::new();
    let mut rest = text;
    while let Some(begin_rel) = rest.find(BEGIN) {
        let after_begin = &rest[begin_rel..];
        let Some(end_rel) = after_begin.find(END) else {
            break;
        };
        let patch_text = &after_begin[..end_rel + END.len()];
        calls.push(ToolCallPart {
            id: synth_id(),
            name: "shell".into(),
            arguments: serde_json::json!({ "cmd": ["apply_patch", patch_text] }).to_string(),
        });
        rest = &after_begin[end_rel + END.len()..];
    }
    calls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_free_text_two_json_calls() {
        let text = "Running two commands:\n{\"cmd\":[\"ls\"]}\nAnd then:\n{\"cmd\":[\"cat\",\"README.md\"]}";
        let calls = extract_free_text_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "shell");
        assert_eq!(calls[1].name, "shell");
        let a0: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(a0["cmd"], serde_json::json!(["ls"]));
        let a1: Value = serde_json::from_str(&calls[1].arguments).unwrap();
        assert_eq!(a1["cmd"], serde_json::json!(["cat", "README.md"]));
    }

    #[test]
    fn s2_single_string_command_split() {
        let argv = normalize_cmd_value(&serde_json::json!("cat README.md")).unwrap();
        assert_eq!(argv, vec!["cat", "README.md"]);
    }

    #[test]
    fn s3_fenced_code_blocks() {
        let text = "...\n```bash\nls -la\n```\n...\n```json\n{\"command\":\"cat README.md\"}\n```";
        let calls = extract_free_text_tool_calls(text);
        assert_eq!(calls.len(), 2);
        let a0: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(a0["cmd"], serde_json::json!(["ls", "-la"]));
        let a1: Value = serde_json::from_str(&calls[1].arguments).unwrap();
        assert_eq!(a1["cmd"], serde_json::json!(["cat", "README.md"]));
    }

    #[test]
    fn s4_raw_patch_extraction() {
        let text = "*** Begin Patch\n*** Update File: raw.js\n@@ -0,0 +1 @@\n+console.log(\"raw\");\n*** End Patch";
        let calls = extract_free_text_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "shell");
        let a0: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(a0["cmd"][0], "apply_patch");
        assert!(a0["cmd"][1].as_str().unwrap().contains("*** Begin Patch"));
    }

    #[test]
    fn s8_flatten_concatenated_arguments() {
        let call = ToolCallPart {
            id: "call_1".into(),
            name: "read_file_lines".into(),
            arguments: r#"{"end_line":3,"path":"file1.md","start_line":1}{"end_line":3,"path":"file2.md","start_line":1}"#.into(),
        };
        let flattened = flatten_tool_call(&call);
        assert_eq!(flattened.len(), 2);
        assert_eq!(flattened[0].name, "read_file_lines");
        assert_eq!(flattened[1].name, "read_file_lines");
        let a0: Value = serde_json::from_str(&flattened[0].arguments).unwrap();
        assert_eq!(a0["path"], "file1.md");
        let a1: Value = serde_json::from_str(&flattened[1].arguments).unwrap();
        assert_eq!(a1["path"], "file2.md");
    }

    #[test]
    fn flatten_single_object_is_noop() {
        let call = ToolCallPart {
            id: "call_1".into(),
            name: "shell".into(),
            arguments: r#"{"cmd":["ls"]}"#.into(),
        };
        let flattened = flatten_tool_call(&call);
        assert_eq!(flattened.len(), 1);
        assert_eq!(flattened[0].arguments, call.arguments);
    }

    #[test]
    fn requires_shell_single_element() {
        assert!(requires_shell(&["ls -la | wc -l".to_string()]));
    }

    #[test]
    fn requires_shell_operator_in_multi_element() {
        assert!(requires_shell(&[
            "ls".to_string(),
            "-la".to_string(),
            "|".to_string()
        ]));
        assert!(!requires_shell(&["ls".to_string(), "-la".to_string()]));
    }

    #[test]
    fn invalid_json_is_not_a_tool_call() {
        let calls = extract_free_text_tool_calls("not json at all, just prose.");
        assert!(calls.is_empty());
    }
}
