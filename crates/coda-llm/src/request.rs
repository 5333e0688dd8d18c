use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Top-level request
// ---------------------------------------------------------------------------

/// A request to generate a language model response.
#[derive(Default, Debug, Clone)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub options: GenerateOptions,
    /// Provider-specific metadata (e.g. reasoning effort). Passed through to
    /// the backend as-is.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Knobs that control generation behavior.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
    pub tool_choice: ToolChoice,
}

// ---------------------------------------------------------------------------
// Reusable part types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePart {
    pub url: String,
}

/// A chunk of model "thinking" text, exposed separately from the final
/// answer (§4.5). `tag` records which inline reasoning block it was lifted
/// from when the provider doesn't have a dedicated reasoning channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningPart {
    pub text: String,
    #[serde(default)]
    pub tag: Option<ReasoningTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningTag {
    Thought,
    Think,
    Plan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPart {
    pub tool_call_id: String,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Role-specific part enums (composed from reusable parts)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum SystemPart {
    Text(TextPart),
}

#[derive(Debug, Clone)]
pub enum UserPart {
    Text(TextPart),
    Image(ImagePart),
}

/// One piece of an assistant turn, preserved in arrival order so interleaved
/// reasoning / text / tool calls round-trip exactly (§3, §4.5).
#[derive(Debug, Clone)]
pub enum AssistantPart {
    Text(TextPart),
    Reasoning(ReasoningPart),
    ToolCall(ToolCallPart),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Message {
    System { parts: Vec<SystemPart> },
    User { parts: Vec<UserPart> },
    Assistant { parts: Vec<AssistantPart> },
    Tool { parts: Vec<ToolResultPart> },
}

// ---------------------------------------------------------------------------
// Convenience constructors
// ---------------------------------------------------------------------------

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message::System {
            parts: vec![SystemPart::Text(TextPart { text: text.into() })],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Message::User {
            parts: vec![UserPart::Text(TextPart { text: text.into() })],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message::Assistant {
            parts: vec![AssistantPart::Text(TextPart { text: text.into() })],
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            parts: vec![ToolResultPart {
                tool_call_id: tool_call_id.into(),
                content: content.into(),
            }],
        }
    }

    /// The tool calls carried by this message, if it is an assistant message
    /// with any (§3 invariant 1).
    pub fn tool_calls(&self) -> Vec<&ToolCallPart> {
        match self {
            Message::Assistant { parts } => parts
                .iter()
                .filter_map(|p| match p {
                    AssistantPart::ToolCall(tc) => Some(tc),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A tool the model can call.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Schema,
}

/// Controls how the model selects tools.
#[derive(Debug, Clone, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    /// Force calling a specific tool by name.
    Tool(String),
}

// ---------------------------------------------------------------------------
// Request builder
// ---------------------------------------------------------------------------

/// Fluent builder for [`GenerateRequest`]. Created via [`request()`].
#[derive(Default, Debug, Clone)]
pub struct RequestBuilder {
    system: Option<String>,
    messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    options: GenerateOptions,
    metadata: HashMap<String, serde_json::Value>,
}

/// Start building a [`GenerateRequest`].
pub fn request() -> RequestBuilder {
    RequestBuilder::default()
}

impl RequestBuilder {
    pub fn system(&mut self, text: impl Into<String>) -> &mut Self {
        self.system = Some(text.into());
        self
    }

    pub fn user(&mut self, text: impl Into<String>) -> &mut Self {
        self.messages.push(Message::user(text));
        self
    }

    pub fn messages(&mut self, messages: Vec<Message>) -> &mut Self {
        self.messages = messages;
        self
    }

    pub fn tools(&mut self, tools: Vec<ToolDefinition>) -> &mut Self {
        self.tools = tools;
        self
    }

    pub fn temperature(&mut self, value: f32) -> &mut Self {
        self.options.temperature = Some(value);
        self
    }

    pub fn max_tokens(&mut self, value: u32) -> &mut Self {
        self.options.max_tokens = Some(value);
        self
    }

    pub fn tool_choice(&mut self, choice: ToolChoice) -> &mut Self {
        self.options.tool_choice = choice;
        self
    }

    /// Attach a provider-specific metadata key (e.g. `reasoning_effort`).
    pub fn meta(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> &mut Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(&mut self) -> GenerateRequest {
        let mut messages = Vec::new();
        if let Some(system) = self.system.take() {
            messages.push(Message::system(system));
        }
        messages.append(&mut self.messages);

        GenerateRequest {
            messages,
            tools: std::mem::take(&mut self.tools),
            options: std::mem::take(&mut self.options),
            metadata: std::mem::take(&mut self.metadata),
        }
    }
}

impl From<&mut RequestBuilder> for GenerateRequest {
    fn from(builder: &mut RequestBuilder) -> Self {
        builder.build()
    }
}

// ---------------------------------------------------------------------------
// Schema descriptor — Rust-native, converts to JSON Schema downstream
// ---------------------------------------------------------------------------

/// A Rust-native description of a value's shape, convertible to JSON Schema.
#[derive(Debug, Clone)]
pub enum Schema {
    String {
        description: Option<String>,
        enumeration: Option<Vec<String>>,
    },
    Number {
        description: Option<String>,
    },
    Integer {
        description: Option<String>,
    },
    Boolean {
        description: Option<String>,
    },
    Array {
        description: Option<String>,
        items: Box<Schema>,
    },
    Object {
        description: Option<String>,
        properties: Vec<Property>,
        required: Vec<String>,
    },
    /// Escape hatch: a literal JSON Schema value for cases we don't cover.
    Raw(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub schema: Schema,
}

impl Schema {
    /// Convert to a JSON Schema `serde_json::Value`.
    pub fn to_json_schema(&self) -> serde_json::Value {
        match self {
            Schema::String {
                description,
                enumeration,
            } => {
                let mut obj = serde_json::json!({ "type": "string" });
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                if let Some(e) = enumeration {
                    obj["enum"] = serde_json::json!(e);
                }
                obj
            }
            Schema::Number { description } => {
                let mut obj = serde_json::json!({ "type": "number" });
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                obj
            }
            Schema::Integer { description } => {
                let mut obj = serde_json::json!({ "type": "integer" });
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                obj
            }
            Schema::Boolean { description } => {
                let mut obj = serde_json::json!({ "type": "boolean" });
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                obj
            }
            Schema::Array { description, items } => {
                let mut obj = serde_json::json!({
                    "type": "array",
                    "items": items.to_json_schema(),
                });
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                obj
            }
            Schema::Object {
                description,
                properties,
                required,
            } => {
                let props: serde_json::Map<String, serde_json::Value> = properties
                    .iter()
                    .map(|p| (p.name.clone(), p.schema.to_json_schema()))
                    .collect();
                let mut obj = serde_json::json!({
                    "type": "object",
                    "properties": props,
                });
                if !required.is_empty() {
                    obj["required"] = serde_json::json!(required);
                }
                if let Some(d) = description {
                    obj["description"] = serde_json::json!(d);
                }
                obj
            }
            Schema::Raw(v) => v.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_puts_system_message_first() {
        let mut builder = request();
        builder.user("hello");
        builder.system("you are helpful");
        let req = builder.build();

        assert!(matches!(req.messages[0], Message::System { .. }));
        assert!(matches!(req.messages[1], Message::User { .. }));
    }

    #[test]
    fn schema_object_round_trips_to_json() {
        let schema = Schema::Object {
            description: None,
            properties: vec![Property {
                name: "path".into(),
                schema: Schema::String {
                    description: Some("file path".into()),
                    enumeration: None,
                },
            }],
            required: vec!["path".into()],
        };

        let json = schema.to_json_schema();
        assert_eq!(json["type"], "object");
        assert_eq!(json["required"][0], "path");
        assert_eq!(json["properties"]["path"]["type"], "string");
    }
}
