use coda_llm::stream::Usage;

use crate::approval::ApprovalDecision;

// ---------------------------------------------------------------------------
// Display types — tool-agnostic rendering protocol
// ---------------------------------------------------------------------------

/// How to display a tool invocation (the input side) to the user.
#[derive(Debug, Clone)]
pub struct ToolCallDisplay {
    /// Short summary, e.g. "Read src/main.rs", "Run `cargo build`".
    pub title: String,
    /// Optional expanded content (e.g. the command, the file content to write).
    pub body: Option<DisplayBody>,
}

/// How to display a tool result (the output side) to the user.
#[derive(Debug, Clone)]
pub struct ToolResultDisplay {
    /// Short summary, e.g. "55 lines", "exit code 0".
    pub title: String,
    /// Optional expanded content (e.g. file contents, command output).
    pub body: Option<DisplayBody>,
}

/// Structured content for display. Frontends can use this to apply
/// syntax highlighting, diff rendering, etc.
#[derive(Debug, Clone)]
pub enum DisplayBody {
    /// Plain text.
    Text(String),
    /// Code with an optional language hint for syntax highlighting.
    Code {
        language: Option<String>,
        content: String,
    },
}

// ---------------------------------------------------------------------------
// Agent events — the render-oriented protocol from agent to UI
// ---------------------------------------------------------------------------

/// Events emitted by the agent during a generation turn (§4.6, §5).
///
/// A frontend consumes these to update its UI, throttled to at most one
/// partial-update snapshot every 150ms per §4.5/§5. The events form a
/// protocol:
///
/// ```text
/// UserMessage
/// (TextDelta | ReasoningDelta)*
/// (ToolCallBegin ToolCallDelta* ToolCallReady ApprovalNeeded? ToolResult)*  ← tool loop, may repeat turns
/// TurnComplete | Error
/// ```
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The user's message was recorded in conversation history.
    UserMessage { content: String },

    /// A chunk of assistant text arrived.
    TextDelta { delta: String },

    /// A chunk of inline reasoning text arrived (§4.5's `<think>`/`<thought>`/`<plan>`).
    ReasoningDelta { delta: String },

    /// A new tool call started streaming.
    ToolCallBegin { id: String, name: String },

    /// A chunk of a tool call's JSON arguments arrived.
    ToolCallDelta { id: String, delta: String },

    /// A tool call finished streaming and is about to be dispatched.
    ToolCallReady {
        id: String,
        name: String,
        arguments: String,
    },

    /// The approval gate is asking the user to confirm a pending tool call.
    /// The frontend must eventually resolve the paired oneshot with a
    /// decision; the turn is suspended until it does.
    ApprovalNeeded {
        id: String,
        display: ToolCallDisplay,
    },

    /// The user's approval decision was recorded (mirrors what was sent
    /// back on the oneshot, for display purposes).
    ApprovalResolved { id: String, decision: ApprovalDecision },

    /// A tool finished executing.
    ToolResult {
        id: String,
        display: ToolResultDisplay,
    },

    /// The entire turn is complete (no more tool loops).
    TurnComplete { usage: Usage },

    /// The turn was cancelled by the user; no synthetic message is appended
    /// (§7's "User cancel" row).
    Cancelled,

    /// An error occurred during the turn.
    Error { error: String },
}
