pub mod agent;
pub mod approval;
pub mod event;
pub mod exec;
pub mod handler;
pub mod memory;
pub mod parser;
pub mod patch;
pub mod rollout;
pub mod tool;
pub mod tools;

pub use agent::{Agent, AgentStream, ConversationState};
pub use approval::{ApprovalDecision, ApprovalPolicy, Decision, Gate, PendingCall};
pub use event::{AgentEvent, DisplayBody, ToolCallDisplay, ToolResultDisplay};
pub use exec::{exec as run_exec, CancelHandle, ExecInput, ExecResult, Sandbox};
pub use memory::MemoryStore;
pub use rollout::Rollout;
pub use tool::Tool;
pub use tools::{
    DeleteFileTool, EditTool, ListDirectoryTool, ListFilesRecursiveTool, PersistentMemoryTool,
    ReadFileLinesTool, ReadFileTool, SearchCodebaseTool, ShellTool, SkillTool, WriteFileTool,
};
