//! The agent loop (C6, spec §4.6): the state machine that drives a single
//! conversation turn from a queued user input through streaming, tool
//! dispatch, and back to idle — including free-text tool-call recovery
//! (C1), the approval gate (C7), loop protection, context-window trimming,
//! and cancellation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use coda_llm::{
    AssistantPart, Error as LlmError, GenerateRequest, ImagePart, LanguageModel, Message,
    StreamEvent, SystemPart, TextPart, ToolCallPart, ToolDefinition, ToolResult, Usage, UserPart,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tracing::debug;

use crate::approval::{self, ApprovalDecision, ApprovalPolicy, Decision, PendingCall};
use crate::event::{AgentEvent, DisplayBody, ToolCallDisplay, ToolResultDisplay};
use crate::exec::{CancelHandle, Sandbox};
use crate::handler;
use crate::memory::MemoryStore;
use crate::parser;
use crate::rollout::Rollout;
use crate::tool::{ErasedTool, Tool};
use crate::tools::{
    DeleteFileTool, EditTool, ListDirectoryTool, ListFilesRecursiveTool, PersistentMemoryTool,
    ReadFileLinesTool, ReadFileTool, SearchCodebaseTool, ShellTool, SkillTool, WriteFileTool,
};

/// Default model-agnostic context budget for trimming (§4.6, §10.3 of
/// SPEC_FULL.md — `text.len()/4` is the estimator, this is the budget it's
/// measured against).
const DEFAULT_CONTEXT_TOKEN_BUDGET: usize = 128_000;

/// Total attempts (initial + retries) for a network-transient model-request
/// failure, per the Open Question decision recorded in DESIGN.md.
const MAX_REQUEST_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 8_000;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct QueuedRun {
    parts: Vec<UserPart>,
    tx: mpsc::Sender<AgentEvent>,
}

struct QueueState {
    queue: VecDeque<QueuedRun>,
    driving: bool,
    terminated: bool,
}

/// Tracks the last run of identical, failing tool-call signatures (§4.6
/// "Loop protection"). Any non-matching or successful call resets the run.
struct LoopGuard {
    window: VecDeque<String>,
}

impl LoopGuard {
    fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(3),
        }
    }

    /// Returns `true` the moment `signature` has failed three times in a
    /// row, and resets the window so the next call starts a fresh run.
    fn observe(&mut self, signature: &str, failed: bool) -> bool {
        if !failed {
            self.window.clear();
            return false;
        }
        if self.window.back().map(|s| s.as_str()) != Some(signature) {
            self.window.clear();
        }
        self.window.push_back(signature.to_string());
        if self.window.len() >= 3 {
            self.window.clear();
            true
        } else {
            false
        }
    }
}

struct Inner {
    conversation: Mutex<Vec<Message>>,
    tools: Mutex<Vec<Box<dyn ErasedTool>>>,
    approval_policy: Mutex<ApprovalPolicy>,
    remembered: Mutex<HashSet<String>>,
    pending_approvals: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    loop_guard: Mutex<LoopGuard>,
    queue: Mutex<QueueState>,
    context_token_budget: usize,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// The core agent. Holds a language model, conversation history, and
/// registered tools. UI-agnostic — communicates via [`AgentEvent`]s.
pub struct Agent {
    model: Arc<LanguageModel>,
    system_prompt: Option<String>,
    cancel: CancelHandle,
    inner: Arc<Inner>,
}

impl Agent {
    /// Create a new agent backed by the given model, with no tools and no
    /// system prompt.
    pub fn new(model: LanguageModel) -> Self {
        Self {
            model: Arc::new(model),
            system_prompt: None,
            cancel: CancelHandle::new(),
            inner: Arc::new(Inner {
                conversation: Mutex::new(Vec::new()),
                tools: Mutex::new(Vec::new()),
                approval_policy: Mutex::new(ApprovalPolicy::default()),
                remembered: Mutex::new(HashSet::new()),
                pending_approvals: Mutex::new(HashMap::new()),
                loop_guard: Mutex::new(LoopGuard::new()),
                queue: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    driving: false,
                    terminated: false,
                }),
                context_token_budget: DEFAULT_CONTEXT_TOKEN_BUDGET,
            }),
        }
    }

    /// Create an agent with the full built-in tool set (§4.1, §11 of
    /// SPEC_FULL.md) wired to operate within `cwd`, and a system prompt
    /// describing them.
    pub fn with_defaults(model: LanguageModel, cwd: PathBuf) -> Self {
        let mut agent = Self::new(model);
        agent.system(default_system_prompt(&cwd));

        let codex_dir = cwd.join(".codex");
        let skills_dir = cwd.join(".agents").join("skills");
        let memory_store = Arc::new(MemoryStore::new(&codex_dir));
        let cancel = agent.cancel.clone();

        agent.tool(ReadFileTool::new(cwd.clone()));
        agent.tool(ReadFileLinesTool::new(cwd.clone()));
        agent.tool(WriteFileTool::new(cwd.clone()));
        agent.tool(DeleteFileTool::new(cwd.clone()));
        agent.tool(ListDirectoryTool::new(cwd.clone()));
        agent.tool(ListFilesRecursiveTool::new(cwd.clone()));
        agent.tool(EditTool::new(cwd.clone()));
        agent.tool(ShellTool::new(cwd.clone(), Sandbox::None, cancel.clone()));
        agent.tool(SearchCodebaseTool::new(cwd.clone(), cancel));
        agent.tool(PersistentMemoryTool::new(memory_store));
        agent.tool(SkillTool::new(skills_dir));

        agent
    }

    /// Rebuild an agent from a persisted [`Rollout`] (§11 "Conversation
    /// replay / rollout resume"), restoring its message history and
    /// registering the same default tool set as [`with_defaults`].
    pub fn resume(model: LanguageModel, cwd: PathBuf, rollout: Rollout) -> Self {
        let mut agent = Self::with_defaults(model, cwd);
        agent.inner.conversation.lock().clone_from(&rollout.items);
        agent
    }

    /// Set the system prompt.
    pub fn system(&mut self, prompt: impl Into<String>) -> &mut Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Register a tool the model can call.
    pub fn tool(&mut self, tool: impl Tool) -> &mut Self {
        self.inner.tools.lock().push(Box::new(tool));
        self
    }

    /// Override the token budget context trimming is measured against
    /// (default: [`DEFAULT_CONTEXT_TOKEN_BUDGET`]).
    pub fn with_context_token_budget(mut self, budget: usize) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("no clones exist yet during construction")
            .context_token_budget = budget;
        self
    }

    /// The current approval policy (§4.7).
    pub fn approval_policy(&self) -> ApprovalPolicy {
        *self.inner.approval_policy.lock()
    }

    /// Change the approval policy for subsequent tool calls.
    pub fn set_approval_policy(&self, policy: ApprovalPolicy) {
        *self.inner.approval_policy.lock() = policy;
    }

    /// Access the conversation history (completed messages only).
    pub fn messages(&self) -> Vec<Message> {
        self.inner.conversation.lock().clone()
    }

    /// The underlying model's identifier (e.g. `"gpt-5-codex"`).
    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    /// Resolve an outstanding [`AgentEvent::ApprovalNeeded`] request. A
    /// no-op if `id` doesn't match a pending request (already resolved, or
    /// never asked).
    pub fn resolve_approval(&self, id: &str, decision: ApprovalDecision) {
        if let Some(tx) = self.inner.pending_approvals.lock().remove(id) {
            let _ = tx.send(decision);
        }
    }

    /// Cancel whatever turn is currently in flight (§4.6, §5). Idempotent;
    /// a no-op if nothing is running.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Terminate the agent: cancel the in-flight turn and drop every
    /// queued one. No further transitions occur after this (§4.6
    /// `terminate()`); subsequent `submit()` calls return an
    /// already-closed stream.
    pub fn terminate(&self) {
        self.cancel.cancel();
        let mut qs = self.inner.queue.lock();
        qs.terminated = true;
        qs.queue.clear();
    }

    /// Submit a plain-text user turn and get back a stream of events.
    pub fn submit(&self, content: impl Into<String>) -> AgentStream {
        self.submit_parts(vec![UserPart::Text(TextPart {
            text: content.into(),
        })])
    }

    /// Submit a user turn seeded with one or more images (§6 `--image`),
    /// alongside the text content.
    pub fn submit_with_images<I, S>(&self, content: impl Into<String>, image_paths: I) -> AgentStream
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = vec![UserPart::Text(TextPart {
            text: content.into(),
        })];
        parts.extend(
            image_paths
                .into_iter()
                .map(|p| UserPart::Image(ImagePart { url: p.into() })),
        );
        self.submit_parts(parts)
    }

    /// Submit an arbitrary set of user-message parts.
    ///
    /// If the agent isn't currently mid-turn, this starts a new driver task
    /// immediately. Otherwise the run is enqueued FIFO (§4.6 "Prompt
    /// queue") and dispatched automatically once the agent returns to
    /// `Idle`. Dropping the returned [`AgentStream`] does not cancel the
    /// turn — use [`Agent::cancel`] for that.
    pub fn submit_parts(&self, parts: Vec<UserPart>) -> AgentStream {
        let (tx, rx) = mpsc::channel(64);

        let mut qs = self.inner.queue.lock();
        if qs.terminated {
            return AgentStream { rx };
        }
        qs.queue.push_back(QueuedRun { parts, tx });
        let should_spawn = !qs.driving;
        if should_spawn {
            qs.driving = true;
        }
        drop(qs);

        if should_spawn {
            self.spawn_driver();
        }

        AgentStream { rx }
    }

    fn spawn_driver(&self) {
        let model = Arc::clone(&self.model);
        let system_prompt = self.system_prompt.clone();
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let run = {
                    let mut qs = inner.queue.lock();
                    if qs.terminated {
                        qs.driving = false;
                        break;
                    }
                    match qs.queue.pop_front() {
                        Some(run) => run,
                        None => {
                            qs.driving = false;
                            break;
                        }
                    }
                };

                cancel.reset();
                debug!("agent: starting turn");
                run_turn(
                    &model,
                    system_prompt.as_deref(),
                    &inner,
                    &cancel,
                    run.parts,
                    run.tx,
                )
                .await;
                debug!("agent: turn finished, returning to Idle");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// AgentStream
// ---------------------------------------------------------------------------

/// A stream of [`AgentEvent`]s from a single queued turn.
pub struct AgentStream {
    rx: mpsc::Receiver<AgentEvent>,
}

impl AgentStream {
    /// Get the next event, or `None` when the turn is complete.
    pub async fn next(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Turn driver
// ---------------------------------------------------------------------------

async fn run_turn(
    model: &LanguageModel,
    system_prompt: Option<&str>,
    inner: &Inner,
    cancel: &CancelHandle,
    parts: Vec<UserPart>,
    tx: mpsc::Sender<AgentEvent>,
) {
    let preview: String = parts
        .iter()
        .filter_map(|p| match p {
            UserPart::Text(t) => Some(t.text.clone()),
            UserPart::Image(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    {
        let mut conv = inner.conversation.lock();
        conv.push(Message::User { parts });
    }
    if tx
        .send(AgentEvent::UserMessage { content: preview })
        .await
        .is_err()
    {
        return;
    }

    let mut usage_total = Usage::default();

    loop {
        {
            let mut conv = inner.conversation.lock();
            trim_context(&mut conv, inner.context_token_budget);
        }

        let outcome = match request_with_retry(model, system_prompt, inner, cancel, &tx).await {
            StreamStatus::Done(outcome) => outcome,
            StreamStatus::Cancelled => {
                let _ = tx.send(AgentEvent::Cancelled).await;
                return;
            }
            StreamStatus::Failed => return,
        };

        usage_total = merge_usage(usage_total, outcome.usage);

        {
            let mut conv = inner.conversation.lock();
            if !outcome.parts.is_empty() {
                conv.push(Message::Assistant {
                    parts: outcome.parts,
                });
            }
        }

        if outcome.tool_calls.is_empty() {
            let _ = tx
                .send(AgentEvent::TurnComplete {
                    usage: usage_total,
                })
                .await;
            return;
        }

        for tc in &outcome.tool_calls {
            if cancel.is_cancelled() {
                let _ = tx.send(AgentEvent::Cancelled).await;
                return;
            }

            let pending = handler::classify_call(&tc.name, &tc.arguments);
            let decision = classify_pending(inner, &pending);

            let resolved = match decision {
                Decision::Approved => ApprovalDecision::Yes,
                Decision::Ask => {
                    let display = build_tool_call_display(tc);
                    let (atx, arx) = oneshot::channel();
                    inner.pending_approvals.lock().insert(tc.id.clone(), atx);
                    if tx
                        .send(AgentEvent::ApprovalNeeded {
                            id: tc.id.clone(),
                            display,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }

                    let token = cancel.token();
                    let decision = tokio::select! {
                        resolved = arx => resolved.unwrap_or(ApprovalDecision::No),
                        _ = token.cancelled() => {
                            inner.pending_approvals.lock().remove(&tc.id);
                            let _ = tx.send(AgentEvent::Cancelled).await;
                            return;
                        }
                    };

                    if decision == ApprovalDecision::YesAlways {
                        inner.remembered.lock().insert(tc.name.clone());
                    }
                    if tx
                        .send(AgentEvent::ApprovalResolved {
                            id: tc.id.clone(),
                            decision: decision.clone(),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    decision
                }
            };

            let content = if resolved.is_approved() {
                dispatch_tool_call(inner, tc).await
            } else {
                ToolResult::failed(resolved.deny_message(), 1, 0.0).to_content()
            };

            let parsed: ToolResult = serde_json::from_str(&content)
                .unwrap_or_else(|_| ToolResult::ok(content.clone(), 0.0));
            let signature = tool_call_signature(tc);
            let failed = parsed.metadata.exit_code != 0;
            let loop_detected = inner.loop_guard.lock().observe(&signature, failed);

            let final_content = if loop_detected {
                debug!(signature = %signature, "agent: loop detected, stopping turn");
                ToolResult::failed(
                    format!("Loop detected: {signature} has failed 3 times in a row. Stopping."),
                    parsed.metadata.exit_code,
                    parsed.metadata.duration_seconds,
                )
                .mark_loop_detected()
                .to_content()
            } else {
                content
            };

            let display = build_tool_result_display(tc, &final_content);
            if tx
                .send(AgentEvent::ToolResult {
                    id: tc.id.clone(),
                    display,
                })
                .await
                .is_err()
            {
                return;
            }

            {
                let mut conv = inner.conversation.lock();
                append_tool_message(&mut conv, &tc.id, final_content);
            }

            if loop_detected {
                let message = format!(
                    "I stopped: `{}` failed three times in a row with the same arguments.",
                    tc.name
                );
                {
                    let mut conv = inner.conversation.lock();
                    conv.push(Message::assistant(&message));
                }
                let _ = tx
                    .send(AgentEvent::TurnComplete {
                        usage: usage_total,
                    })
                    .await;
                return;
            }
        }

        // All tool calls dispatched without loop detection: re-enter
        // Requesting with the new history (§4.6 Dispatching).
    }
}

fn classify_pending(inner: &Inner, pending: &PendingCall) -> Decision {
    let policy = *inner.approval_policy.lock();
    let remembered = inner.remembered.lock();
    approval::classify(policy, pending, &remembered)
}

// ---------------------------------------------------------------------------
// Model request + streaming, with retry
// ---------------------------------------------------------------------------

struct StreamOutcome {
    parts: Vec<AssistantPart>,
    tool_calls: Vec<ToolCallPart>,
    usage: Usage,
}

enum StreamStatus {
    Done(StreamOutcome),
    Cancelled,
    Failed,
}

enum StreamAttempt {
    Done(StreamOutcome),
    Cancelled,
    /// A transient error (§7) with no assistant content produced yet —
    /// safe to retry the whole request from scratch.
    RetryableBeforeContent(LlmError),
    /// A non-transient error, or a transient one after content already
    /// started flowing — not retried.
    Terminal(LlmError),
}

async fn request_with_retry(
    model: &LanguageModel,
    system_prompt: Option<&str>,
    inner: &Inner,
    cancel: &CancelHandle,
    tx: &mpsc::Sender<AgentEvent>,
) -> StreamStatus {
    let mut attempt = 0u32;
    loop {
        let request = build_request(system_prompt, inner);
        match stream_request(model, request, cancel, tx).await {
            StreamAttempt::Done(outcome) => return StreamStatus::Done(outcome),
            StreamAttempt::Cancelled => return StreamStatus::Cancelled,
            StreamAttempt::RetryableBeforeContent(err) if attempt + 1 < MAX_REQUEST_ATTEMPTS => {
                attempt += 1;
                let _ = tx
                    .send(AgentEvent::Error {
                        error: format!("Network error: {err}. Retrying…"),
                    })
                    .await;
                let delay = backoff_delay(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.token().cancelled() => return StreamStatus::Cancelled,
                }
                continue;
            }
            StreamAttempt::RetryableBeforeContent(err) | StreamAttempt::Terminal(err) => {
                let message = format!("Model request failed: {err}");
                {
                    let mut conv = inner.conversation.lock();
                    conv.push(Message::assistant(&message));
                }
                let _ = tx.send(AgentEvent::Error { error: message }).await;
                return StreamStatus::Failed;
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16)).min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=exp);
    Duration::from_millis(jitter)
}

async fn stream_request(
    model: &LanguageModel,
    request: GenerateRequest,
    cancel: &CancelHandle,
    tx: &mpsc::Sender<AgentEvent>,
) -> StreamAttempt {
    let mut stream = model.generate(request).events();
    let mut parts: Vec<AssistantPart> = Vec::new();
    let mut text = String::new();
    let mut structured_calls: Vec<ToolCallPart> = Vec::new();
    let mut index_to_id: HashMap<usize, String> = HashMap::new();
    let mut usage = Usage::default();
    let token = cancel.token();

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamAttempt::Cancelled,
            event = stream.next() => event,
        };
        let Some(event) = next else { break };

        match event {
            Ok(StreamEvent::TextDelta(delta)) => {
                text.push_str(&delta);
                if tx.send(AgentEvent::TextDelta { delta }).await.is_err() {
                    return StreamAttempt::Cancelled;
                }
            }
            Ok(StreamEvent::TextDone) => {}
            Ok(StreamEvent::ReasoningBegin(_)) => {}
            Ok(StreamEvent::ReasoningDelta(delta)) => {
                if tx.send(AgentEvent::ReasoningDelta { delta }).await.is_err() {
                    return StreamAttempt::Cancelled;
                }
            }
            Ok(StreamEvent::ReasoningDone(part)) => {
                flush_text(&mut parts, &mut text);
                parts.push(AssistantPart::Reasoning(part));
            }
            Ok(StreamEvent::ToolCallBegin { index, id, name }) => {
                index_to_id.insert(index, id.clone());
                if tx.send(AgentEvent::ToolCallBegin { id, name }).await.is_err() {
                    return StreamAttempt::Cancelled;
                }
            }
            Ok(StreamEvent::ToolCallDelta {
                index,
                arguments_delta,
            }) => {
                let id = index_to_id.get(&index).cloned().unwrap_or_default();
                if tx
                    .send(AgentEvent::ToolCallDelta {
                        id,
                        delta: arguments_delta,
                    })
                    .await
                    .is_err()
                {
                    return StreamAttempt::Cancelled;
                }
            }
            Ok(StreamEvent::ToolCallEnd { call, .. }) => {
                flush_text(&mut parts, &mut text);
                if tx
                    .send(AgentEvent::ToolCallReady {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .await
                    .is_err()
                {
                    return StreamAttempt::Cancelled;
                }
                structured_calls.push(call.clone());
                parts.push(AssistantPart::ToolCall(call));
            }
            Ok(StreamEvent::Finish { usage: u, .. }) => {
                if let Some(u) = u {
                    usage = merge_usage(usage, u);
                }
            }
            Ok(StreamEvent::Error(message)) => {
                return classify_stream_error(LlmError::Other(message), &parts, &text, &structured_calls);
            }
            Err(e) => {
                return classify_stream_error(e, &parts, &text, &structured_calls);
            }
        }
    }

    flush_text(&mut parts, &mut text);

    let raw_calls = if !structured_calls.is_empty() {
        structured_calls
    } else {
        let full_text: String = parts
            .iter()
            .filter_map(|p| match p {
                AssistantPart::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect();
        parser::extract_free_text_tool_calls(&full_text)
    };

    let final_calls: Vec<ToolCallPart> = raw_calls
        .iter()
        .flat_map(parser::flatten_tool_call)
        .map(normalize_tool_call)
        .collect();

    // Keep the persisted assistant message's ToolCall parts in exact
    // correspondence with what's actually dispatched (§8 invariant 1),
    // even after free-text recovery and argument flattening.
    parts.retain(|p| !matches!(p, AssistantPart::ToolCall(_)));
    for call in &final_calls {
        parts.push(AssistantPart::ToolCall(call.clone()));
    }

    StreamAttempt::Done(StreamOutcome {
        parts,
        tool_calls: final_calls,
        usage,
    })
}

fn classify_stream_error(
    err: LlmError,
    parts: &[AssistantPart],
    text: &str,
    tool_calls: &[ToolCallPart],
) -> StreamAttempt {
    let no_content_yet = parts.is_empty() && text.is_empty() && tool_calls.is_empty();
    if no_content_yet && err.is_transient() {
        StreamAttempt::RetryableBeforeContent(err)
    } else {
        StreamAttempt::Terminal(err)
    }
}

fn flush_text(parts: &mut Vec<AssistantPart>, text: &mut String) {
    if !text.is_empty() {
        parts.push(AssistantPart::Text(TextPart {
            text: std::mem::take(text),
        }));
    }
}

fn merge_usage(mut acc: Usage, delta: Usage) -> Usage {
    acc.input_tokens += delta.input_tokens;
    acc.output_tokens += delta.output_tokens;
    if let Some(r) = delta.reasoning_tokens {
        *acc.reasoning_tokens.get_or_insert(0) += r;
    }
    if let Some(c) = delta.cached_tokens {
        *acc.cached_tokens.get_or_insert(0) += c;
    }
    acc
}

fn build_request(system_prompt: Option<&str>, inner: &Inner) -> GenerateRequest {
    let mut builder = coda_llm::request();
    if let Some(system) = system_prompt {
        builder.system(system);
    }
    builder.messages(inner.conversation.lock().clone());
    let tool_defs: Vec<ToolDefinition> = inner
        .tools
        .lock()
        .iter()
        .map(|t| t.definition())
        .collect();
    builder.tools(tool_defs);
    builder.build()
}

/// `apply_patch` is a convention over `shell`, not a distinct tool name
/// (§4.4): normalize a free-text-recovered `apply_patch` call (which may
/// carry its body under a bare `patch` key) into the `shell` shape the
/// handler dispatches on.
fn normalize_tool_call(tc: ToolCallPart) -> ToolCallPart {
    if tc.name != "apply_patch" {
        return tc;
    }
    let patch_text = serde_json::from_str::<serde_json::Value>(&tc.arguments)
        .ok()
        .and_then(|v| v.get("patch").and_then(|p| p.as_str()).map(str::to_string))
        .unwrap_or_default();
    ToolCallPart {
        id: tc.id,
        name: "shell".to_string(),
        arguments: serde_json::json!({ "cmd": ["apply_patch", patch_text] }).to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tool dispatch (C4)
// ---------------------------------------------------------------------------

async fn dispatch_tool_call(inner: &Inner, tc: &ToolCallPart) -> String {
    let fut = {
        let tools = inner.tools.lock();
        match tools.iter().find(|t| t.definition().name == tc.name) {
            Some(t) => t.call_erased(&tc.arguments),
            None => {
                return ToolResult::failed(format!("unknown tool: {}", tc.name), 127, 0.0)
                    .to_content();
            }
        }
    };

    match fut.await {
        Ok(content) => content,
        Err(e) => ToolResult::failed(format!("tool error: {e}"), 1, 0.0).to_content(),
    }
}

fn tool_call_signature(tc: &ToolCallPart) -> String {
    let canonical = serde_json::from_str::<serde_json::Value>(&tc.arguments)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| tc.arguments.clone());
    format!("{}:{canonical}", tc.name)
}

/// Replace a prior tool message for the same `tool_call_id` in place, or
/// append if none exists yet (§4.6 "Streaming-tool updates" — the sole
/// exception to append-only conversation history).
fn append_tool_message(conversation: &mut Vec<Message>, tool_call_id: &str, content: String) {
    let existing = conversation.iter_mut().find(|m| match m {
        Message::Tool { parts } => parts.iter().any(|p| p.tool_call_id == tool_call_id),
        _ => false,
    });
    match existing {
        Some(slot) => *slot = Message::tool_result(tool_call_id, content),
        None => conversation.push(Message::tool_result(tool_call_id, content)),
    }
}

// ---------------------------------------------------------------------------
// Context-window trimming (§4.6, §10.3 of SPEC_FULL.md)
// ---------------------------------------------------------------------------

fn message_text_len(msg: &Message) -> usize {
    match msg {
        Message::System { parts } => parts
            .iter()
            .map(|SystemPart::Text(t)| t.text.len())
            .sum(),
        Message::User { parts } => parts
            .iter()
            .map(|p| match p {
                UserPart::Text(t) => t.text.len(),
                UserPart::Image(i) => i.url.len(),
            })
            .sum(),
        Message::Assistant { parts } => parts
            .iter()
            .map(|p| match p {
                AssistantPart::Text(t) => t.text.len(),
                AssistantPart::Reasoning(r) => r.text.len(),
                AssistantPart::ToolCall(tc) => tc.name.len() + tc.arguments.len(),
            })
            .sum(),
        Message::Tool { parts } => parts.iter().map(|p| p.content.len()).sum(),
    }
}

fn estimate_tokens(msg: &Message) -> usize {
    message_text_len(msg) / 4
}

/// Drop the oldest whole turn (a user message and everything up to, but
/// not including, the next user message) until the conversation fits the
/// budget. The system prompt, if present, is never dropped (§4.6).
fn trim_context(conversation: &mut Vec<Message>, budget_tokens: usize) {
    loop {
        let total: usize = conversation.iter().map(estimate_tokens).sum();
        if total <= budget_tokens {
            return;
        }

        let start = if matches!(conversation.first(), Some(Message::System { .. })) {
            1
        } else {
            0
        };
        if conversation.len() <= start + 1 {
            return;
        }

        let mut end = start + 1;
        while end < conversation.len() && !matches!(conversation[end], Message::User { .. }) {
            end += 1;
        }
        conversation.drain(start..end);
    }
}

// ---------------------------------------------------------------------------
// Display rendering
// ---------------------------------------------------------------------------

fn build_tool_call_display(tc: &ToolCallPart) -> ToolCallDisplay {
    let value: serde_json::Value =
        serde_json::from_str(&tc.arguments).unwrap_or(serde_json::Value::Null);

    match tc.name.as_str() {
        "shell" => {
            let argv: Vec<String> = value
                .get("cmd")
                .and_then(|c| c.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if argv.first().map(String::as_str) == Some("apply_patch") {
                ToolCallDisplay {
                    title: "Apply patch".to_string(),
                    body: argv.get(1).map(|p| DisplayBody::Code {
                        language: Some("diff".to_string()),
                        content: p.clone(),
                    }),
                }
            } else {
                let cmd = argv.join(" ");
                ToolCallDisplay {
                    title: format!("Run `{cmd}`"),
                    body: Some(DisplayBody::Code {
                        language: Some("bash".to_string()),
                        content: cmd,
                    }),
                }
            }
        }
        "read_file" | "read_file_lines" => ToolCallDisplay {
            title: format!("Read {}", path_of(&value)),
            body: None,
        },
        "write_file" => ToolCallDisplay {
            title: format!("Write {}", path_of(&value)),
            body: value
                .get("content")
                .and_then(|c| c.as_str())
                .map(|c| DisplayBody::Code {
                    language: None,
                    content: c.to_string(),
                }),
        },
        "delete_file" => ToolCallDisplay {
            title: format!("Delete {}", path_of(&value)),
            body: None,
        },
        "list_directory" | "list_files_recursive" => ToolCallDisplay {
            title: format!("List {}", path_of(&value)),
            body: None,
        },
        "search_codebase" => ToolCallDisplay {
            title: format!(
                "Search for `{}`",
                value.get("pattern").and_then(|p| p.as_str()).unwrap_or("")
            ),
            body: None,
        },
        "edit" => ToolCallDisplay {
            title: format!("Edit {}", path_of(&value)),
            body: None,
        },
        "persistent_memory" => ToolCallDisplay {
            title: "Persistent memory".to_string(),
            body: None,
        },
        "skill" => ToolCallDisplay {
            title: format!(
                "Load skill {}",
                value.get("name").and_then(|p| p.as_str()).unwrap_or("?")
            ),
            body: None,
        },
        other => ToolCallDisplay {
            title: other.to_string(),
            body: None,
        },
    }
}

fn path_of(value: &serde_json::Value) -> &str {
    value.get("path").and_then(|p| p.as_str()).unwrap_or("?")
}

fn build_tool_result_display(tc: &ToolCallPart, content: &str) -> ToolResultDisplay {
    let result: ToolResult = serde_json::from_str(content)
        .unwrap_or_else(|_| ToolResult::ok(content.to_string(), 0.0));
    let title = if result.metadata.loop_detected == Some(true) {
        "Loop detected".to_string()
    } else if result.metadata.exit_code == 0 {
        format!("{} completed", tc.name)
    } else {
        format!("exit code {}", result.metadata.exit_code)
    };
    ToolResultDisplay {
        title,
        body: Some(DisplayBody::Text(result.output)),
    }
}

// ---------------------------------------------------------------------------
// Default system prompt
// ---------------------------------------------------------------------------

fn default_system_prompt(cwd: &std::path::Path) -> String {
    format!(
        r#"You are an expert coding assistant. You help the user by reading, writing, editing, searching, and running code in their project.

Working directory: {cwd}

Tools:

- **read_file** / **read_file_lines**: read a file in full, or an inclusive 1-based line range.
- **write_file**: create or overwrite a file. Creates parent directories as needed.
- **delete_file**: remove a file.
- **edit**: exact-match find/replace in a file. `old` must appear exactly once.
- **list_directory** / **list_files_recursive**: enumerate a directory, optionally bounded by depth.
- **search_codebase**: search the repository for a pattern.
- **shell**: run a shell command in the working directory, given as `cmd` (argv array or a single command-line string). Returns stdout, stderr, and exit code.
- **apply_patch** (via `shell`, `cmd = ["apply_patch", <patch text>]`): apply a textual patch using `*** Begin Patch` / `*** Update|Add|Delete File:` / `*** End Patch` markers.
- **persistent_memory**: append a note to, or query, a durable notes store that outlives this conversation.
- **skill**: load a named skill document from `.agents/skills/<name>/SKILL.md`.

Guidelines:
- Before editing a file, read it first so you have the exact content to match against.
- Use `edit` for surgical changes; use `write_file` only when creating new files or replacing the entire content.
- Prefer `apply_patch` for multi-hunk changes across a file; `edit` for a single unambiguous replacement.
- When running commands, prefer non-interactive invocations.
- Be concise in your explanations. Focus on what changed and why.
- If a command fails, read the error and try to fix it."#,
        cwd = cwd.display()
    )
}
