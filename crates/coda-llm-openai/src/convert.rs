//! Converts between coda-llm generic types and the OpenAI-compatible
//! `/chat/completions` wire format.

use coda_llm::request::{AssistantPart, GenerateRequest, Message, SystemPart, ToolChoice, UserPart};

use crate::types::{
    ChatCompletionRequest, ChatFunctionCall, ChatFunctionDef, ChatMessage, ChatTool, ChatToolCall,
    Role, StreamOptions,
};

/// Wraps a `<tag>...</tag>` inline reasoning block the way the decoder
/// expects to find it again on a later turn (§4.5).
fn wrap_reasoning(tag: &str, text: &str) -> String {
    format!("<{tag}>{text}</{tag}>")
}

pub fn to_chat_request(model_id: &str, req: &GenerateRequest) -> ChatCompletionRequest {
    let mut messages: Vec<ChatMessage> = Vec::new();

    for msg in &req.messages {
        match msg {
            Message::System { parts } => {
                let text: String = parts
                    .iter()
                    .map(|p| match p {
                        SystemPart::Text(t) => t.text.as_str(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                messages.push(ChatMessage {
                    role: Role::System,
                    content: Some(text),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                });
            }
            Message::User { parts } => {
                let text: String = parts
                    .iter()
                    .map(|p| match p {
                        UserPart::Text(t) => t.text.clone(),
                        UserPart::Image(img) => format!("![image]({})", img.url),
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                messages.push(ChatMessage {
                    role: Role::User,
                    content: Some(text),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                });
            }
            Message::Assistant { parts } => {
                let mut content = String::new();
                let mut tool_calls = Vec::new();

                for part in parts {
                    match part {
                        AssistantPart::Text(t) => content.push_str(&t.text),
                        AssistantPart::Reasoning(r) => {
                            let tag = match r.tag {
                                Some(coda_llm::request::ReasoningTag::Thought) => "thought",
                                Some(coda_llm::request::ReasoningTag::Think) => "think",
                                Some(coda_llm::request::ReasoningTag::Plan) => "plan",
                                None => "think",
                            };
                            content.push_str(&wrap_reasoning(tag, &r.text));
                        }
                        AssistantPart::ToolCall(tc) => {
                            tool_calls.push(ChatToolCall {
                                id: tc.id.clone(),
                                kind: "function",
                                function: ChatFunctionCall {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            });
                        }
                    }
                }

                messages.push(ChatMessage {
                    role: Role::Assistant,
                    content: if content.is_empty() {
                        None
                    } else {
                        Some(content)
                    },
                    tool_calls,
                    tool_call_id: None,
                });
            }
            Message::Tool { parts } => {
                for part in parts {
                    messages.push(ChatMessage {
                        role: Role::Tool,
                        content: Some(part.content.clone()),
                        tool_calls: Vec::new(),
                        tool_call_id: Some(part.tool_call_id.clone()),
                    });
                }
            }
        }
    }

    let tools: Vec<ChatTool> = req
        .tools
        .iter()
        .map(|t| ChatTool {
            kind: "function",
            function: ChatFunctionDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.to_json_schema(),
            },
        })
        .collect();

    let tool_choice = match &req.options.tool_choice {
        ToolChoice::Auto => None,
        ToolChoice::None => Some(serde_json::json!("none")),
        ToolChoice::Required => Some(serde_json::json!("required")),
        ToolChoice::Tool(name) => Some(serde_json::json!({
            "type": "function",
            "function": { "name": name },
        })),
    };

    ChatCompletionRequest {
        model: model_id.to_string(),
        messages,
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
        temperature: req.options.temperature,
        max_tokens: req.options.max_tokens,
        top_p: req.options.top_p,
        stop: req.options.stop.clone(),
        tools,
        tool_choice,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coda_llm::request::{Message, ReasoningPart, ReasoningTag, ToolCallPart};

    #[test]
    fn system_message_is_passed_through_as_its_own_role() {
        let mut builder = coda_llm::request();
        builder.system("be terse").user("hi");
        let req = builder.build();

        let chat = to_chat_request("gpt-5", &req);
        assert_eq!(chat.messages[0].role, Role::System);
        assert_eq!(chat.messages[0].content.as_deref(), Some("be terse"));
        assert_eq!(chat.messages[1].role, Role::User);
    }

    #[test]
    fn assistant_reasoning_round_trips_as_inline_tag() {
        let req = GenerateRequest {
            messages: vec![Message::Assistant {
                parts: vec![
                    AssistantPart::Reasoning(ReasoningPart {
                        text: "check the tests first".into(),
                        tag: Some(ReasoningTag::Plan),
                    }),
                    AssistantPart::Text(coda_llm::request::TextPart {
                        text: "Done.".into(),
                    }),
                ],
            }],
            ..Default::default()
        };

        let chat = to_chat_request("gpt-5", &req);
        assert_eq!(
            chat.messages[0].content.as_deref(),
            Some("<plan>check the tests first</plan>Done.")
        );
    }

    #[test]
    fn tool_call_and_tool_result_messages_carry_matching_ids() {
        let req = GenerateRequest {
            messages: vec![
                Message::Assistant {
                    parts: vec![AssistantPart::ToolCall(ToolCallPart {
                        id: "call_1".into(),
                        name: "read_file".into(),
                        arguments: "{\"path\":\"a.rs\"}".into(),
                    })],
                },
                Message::tool_result("call_1", "{\"output\":\"...\"}"),
            ],
            ..Default::default()
        };

        let chat = to_chat_request("gpt-5", &req);
        assert_eq!(chat.messages[0].tool_calls[0].id, "call_1");
        assert_eq!(chat.messages[1].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(chat.messages[1].role, Role::Tool);
    }
}
