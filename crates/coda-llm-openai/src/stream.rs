//! Opens an SSE connection to an OpenAI-compatible `/chat/completions`
//! endpoint and maps chunks to the coda-llm `StreamEvent` type.

use crate::ProviderState;
use crate::types::{ChatCompletionChunk, ChatCompletionRequest};
use coda_llm::error::Error;
use coda_llm::request::{ReasoningPart, ReasoningTag, ToolCallPart};
use coda_llm::stream::{FinishReason, StreamEvent, Usage};
use eventsource_stream::Eventsource;
use futures::Stream;
use std::sync::Arc;
use tokio_stream::StreamExt;

pub fn open(
    state: Arc<ProviderState>,
    body: ChatCompletionRequest,
) -> impl Stream<Item = Result<StreamEvent, Error>> + Send {
    async_stream::try_stream! {
        let url = format!("{}/chat/completions", state.config.base_url);
        let mut req = state
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", state.config.auth_token));
        for (k, v) in &state.config.extra_headers {
            req = req.header(k, v);
        }

        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(Box::new(e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            Err(Error::Api {
                code: status.as_str().to_string(),
                message: body_text,
                metadata: Default::default(),
            })?;
            unreachable!();
        }

        let mut sse = resp.bytes_stream().eventsource();
        let mut mapper = EventMapper::new();

        while let Some(event) = sse.next().await {
            match event {
                Ok(event) => {
                    if event.data == "[DONE]" {
                        continue;
                    }
                    for stream_event in mapper.map_chunk(&event.data)? {
                        yield stream_event;
                    }
                }
                Err(e) => {
                    Err(Error::Sse(e.to_string()))?;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event mapper — assembles tool-call argument deltas by index and scans
// assistant text on the fly for inline reasoning blocks (§4.5).
// ---------------------------------------------------------------------------

struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

struct EventMapper {
    tool_calls: Vec<Option<PendingToolCall>>,
    has_tool_calls: bool,
    text_done_emitted: bool,
    reasoning: ReasoningScanner,
}

impl EventMapper {
    fn new() -> Self {
        Self {
            tool_calls: Vec::new(),
            has_tool_calls: false,
            text_done_emitted: false,
            reasoning: ReasoningScanner::new(),
        }
    }

    fn map_chunk(&mut self, data: &str) -> Result<Vec<StreamEvent>, Error> {
        let parsed: ChatCompletionChunk = serde_json::from_str(data)?;
        let mut events = Vec::new();

        if let Some(choice) = parsed.choices.first() {
            if let Some(content) = &choice.delta.content {
                events.extend(self.reasoning.feed(content));
            }

            for delta in &choice.delta.tool_calls {
                if self.tool_calls.len() <= delta.index {
                    self.tool_calls.resize_with(delta.index + 1, || None);
                }

                if self.tool_calls[delta.index].is_none() {
                    let id = delta.id.clone().unwrap_or_default();
                    let name = delta.function.name.clone().unwrap_or_default();
                    self.has_tool_calls = true;
                    events.push(StreamEvent::ToolCallBegin {
                        index: delta.index,
                        id: id.clone(),
                        name: name.clone(),
                    });
                    self.tool_calls[delta.index] = Some(PendingToolCall {
                        id,
                        name,
                        arguments: String::new(),
                    });
                }

                if let Some(arg_delta) = &delta.function.arguments {
                    if let Some(pending) = &mut self.tool_calls[delta.index] {
                        pending.arguments.push_str(arg_delta);
                    }
                    events.push(StreamEvent::ToolCallDelta {
                        index: delta.index,
                        arguments_delta: arg_delta.clone(),
                    });
                }
            }

            if let Some(reason) = &choice.finish_reason {
                events.extend(self.reasoning.flush());
                if !self.text_done_emitted {
                    events.push(StreamEvent::TextDone);
                    self.text_done_emitted = true;
                }
                for (index, slot) in self.tool_calls.iter().enumerate() {
                    if let Some(pending) = slot {
                        events.push(StreamEvent::ToolCallEnd {
                            index,
                            call: ToolCallPart {
                                id: pending.id.clone(),
                                name: pending.name.clone(),
                                arguments: pending.arguments.clone(),
                            },
                        });
                    }
                }

                let finish_reason = match reason.as_str() {
                    "tool_calls" => FinishReason::ToolCalls,
                    "stop" => FinishReason::Stop,
                    "length" => FinishReason::Length,
                    "content_filter" => FinishReason::ContentFilter,
                    other => FinishReason::Other(other.to_string()),
                };
                let finish_reason = if self.has_tool_calls && finish_reason == FinishReason::Stop {
                    FinishReason::ToolCalls
                } else {
                    finish_reason
                };

                let usage = parsed.usage.map(|u| Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                    reasoning_tokens: u
                        .completion_tokens_details
                        .and_then(|d| d.reasoning_tokens),
                    cached_tokens: u.prompt_tokens_details.and_then(|d| d.cached_tokens),
                });
                events.push(StreamEvent::Finish {
                    reason: finish_reason,
                    usage,
                });
            }
        } else if let Some(usage) = parsed.usage {
            // The final usage-only chunk (sent when stream_options.include_usage
            // is set) carries no choices.
            events.push(StreamEvent::Finish {
                reason: if self.has_tool_calls {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::Stop
                },
                usage: Some(Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                    reasoning_tokens: usage
                        .completion_tokens_details
                        .and_then(|d| d.reasoning_tokens),
                    cached_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
                }),
            });
        }

        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Inline reasoning block scanner
// ---------------------------------------------------------------------------

const OPEN_TAGS: &[(&str, ReasoningTag)] = &[
    ("<thought>", ReasoningTag::Thought),
    ("<think>", ReasoningTag::Think),
    ("<plan>", ReasoningTag::Plan),
];

/// Scans a stream of text deltas for inline `<thought>`/`<think>`/`<plan>`
/// blocks, splitting plain text from reasoning text as it arrives even when
/// a tag is split across chunk boundaries.
struct ReasoningScanner {
    buf: String,
    open: Option<ReasoningTag>,
    /// Accumulates the full text of the currently open block so `ReasoningDone`
    /// can carry it for callers that only want the completed block.
    current_text: String,
}

impl ReasoningScanner {
    fn new() -> Self {
        Self {
            buf: String::new(),
            open: None,
            current_text: String::new(),
        }
    }

    fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();

        loop {
            match self.open {
                None => {
                    let earliest = OPEN_TAGS
                        .iter()
                        .filter_map(|(tag, kind)| self.buf.find(tag).map(|pos| (pos, tag, *kind)))
                        .min_by_key(|(pos, ..)| *pos);

                    match earliest {
                        Some((pos, tag, kind)) => {
                            if pos > 0 {
                                events.push(StreamEvent::TextDelta(self.buf[..pos].to_string()));
                            }
                            self.buf.drain(..pos + tag.len());
                            self.open = Some(kind);
                            events.push(StreamEvent::ReasoningBegin(kind));
                        }
                        None => {
                            let safe_len = safe_flush_len(&self.buf, OPEN_TAGS.iter().map(|(t, _)| *t));
                            if safe_len > 0 {
                                events.push(StreamEvent::TextDelta(self.buf[..safe_len].to_string()));
                                self.buf.drain(..safe_len);
                            }
                            break;
                        }
                    }
                }
                Some(kind) => {
                    let close = close_tag(kind);
                    match self.buf.find(close) {
                        Some(pos) => {
                            if pos > 0 {
                                let text = self.buf[..pos].to_string();
                                self.current_text.push_str(&text);
                                events.push(StreamEvent::ReasoningDelta(text));
                            }
                            self.buf.drain(..pos + close.len());
                            events.push(StreamEvent::ReasoningDone(ReasoningPart {
                                text: std::mem::take(&mut self.current_text),
                                tag: Some(kind),
                            }));
                            self.open = None;
                        }
                        None => {
                            let safe_len = safe_flush_len(&self.buf, std::iter::once(close));
                            if safe_len > 0 {
                                let text = self.buf[..safe_len].to_string();
                                self.current_text.push_str(&text);
                                events.push(StreamEvent::ReasoningDelta(text));
                                self.buf.drain(..safe_len);
                            }
                            break;
                        }
                    }
                }
            }
        }

        events
    }

    /// Force-flush whatever is buffered when the stream ends, even if a tag
    /// looked partially open (malformed output shouldn't hang the decoder).
    fn flush(&mut self) -> Vec<StreamEvent> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let text = std::mem::take(&mut self.buf);
        match self.open.take() {
            Some(kind) => {
                self.current_text.push_str(&text);
                vec![
                    StreamEvent::ReasoningDelta(text),
                    StreamEvent::ReasoningDone(ReasoningPart {
                        text: std::mem::take(&mut self.current_text),
                        tag: Some(kind),
                    }),
                ]
            }
            None => vec![StreamEvent::TextDelta(text)],
        }
    }
}

fn close_tag(tag: ReasoningTag) -> &'static str {
    match tag {
        ReasoningTag::Thought => "</thought>",
        ReasoningTag::Think => "</think>",
        ReasoningTag::Plan => "</plan>",
    }
}

/// How many leading bytes of `buf` are safe to flush immediately: everything
/// except a trailing fragment that could still grow into one of `needles`.
fn safe_flush_len<'a>(buf: &str, needles: impl Iterator<Item = &'a str>) -> usize {
    let mut longest_suffix_match = 0;
    for needle in needles {
        let max_check = needle.len().min(buf.len());
        for len in (1..=max_check).rev() {
            if buf.ends_with(&needle[..len]) {
                longest_suffix_match = longest_suffix_match.max(len);
                break;
            }
        }
    }
    buf.len() - longest_suffix_match
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through_unchanged() {
        let mut scanner = ReasoningScanner::new();
        let events = scanner.feed("hello world");
        let flushed = scanner.flush();
        let all: Vec<_> = events.into_iter().chain(flushed).collect();
        assert!(matches!(&all[..], [StreamEvent::TextDelta(t)] if t == "hello world"));
    }

    #[test]
    fn tag_split_across_chunks_is_still_detected() {
        let mut scanner = ReasoningScanner::new();
        let mut events = scanner.feed("before <thi");
        events.extend(scanner.feed("nk>reasoning "));
        events.extend(scanner.feed("text</thi"));
        events.extend(scanner.feed("nk> after"));

        let texts: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta(t) => Some(format!("T:{t}")),
                StreamEvent::ReasoningDelta(t) => Some(format!("R:{t}")),
                StreamEvent::ReasoningBegin(_) => Some("BEGIN".into()),
                StreamEvent::ReasoningDone(_) => Some("DONE".into()),
                _ => None,
            })
            .collect();

        assert_eq!(
            texts,
            vec![
                "T:before ".to_string(),
                "BEGIN".to_string(),
                "R:reasoning ".to_string(),
                "R:text".to_string(),
                "DONE".to_string(),
                "T: after".to_string(),
            ]
        );
    }

    #[test]
    fn unclosed_tag_is_flushed_at_stream_end() {
        let mut scanner = ReasoningScanner::new();
        let mut events = scanner.feed("<plan>do the thing");
        events.extend(scanner.flush());

        assert!(events.iter().any(|e| matches!(e, StreamEvent::ReasoningBegin(ReasoningTag::Plan))));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::ReasoningDone(_))));
    }
}
