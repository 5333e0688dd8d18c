use serde::{Deserialize, Serialize};

/// The outcome of executing a tool call, always JSON-encoded as the content
/// of the tool message that reports it back to the model (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    pub metadata: ToolResultMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResultMetadata {
    pub exit_code: i32,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_detected: Option<bool>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            output: output.into(),
            metadata: ToolResultMetadata {
                exit_code: 0,
                duration_seconds,
                loop_detected: None,
            },
        }
    }

    pub fn failed(output: impl Into<String>, exit_code: i32, duration_seconds: f64) -> Self {
        Self {
            output: output.into(),
            metadata: ToolResultMetadata {
                exit_code,
                duration_seconds,
                loop_detected: None,
            },
        }
    }

    pub fn mark_loop_detected(mut self) -> Self {
        self.metadata.loop_detected = Some(true);
        self
    }

    /// Serialize to the JSON string that goes on the wire as tool-message
    /// content. Falls back to a plain-text envelope if serialization
    /// somehow fails (it can't, barring a non-UTF8 output, but we never
    /// want message construction itself to be fallible).
    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.output.clone())
    }
}
