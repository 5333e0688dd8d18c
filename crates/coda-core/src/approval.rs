//! The approval gate (C7, spec §4.7). Decides, per pending tool call,
//! whether it runs immediately, is auto-denied, or must be escalated to the
//! user as an awaited request.

use tokio::sync::oneshot;

/// How aggressively the agent is allowed to act without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalPolicy {
    /// Always ask, for every tool call outside the safelist.
    #[default]
    Suggest,
    /// Auto-approve patch/file-write calls; still ask for shell commands.
    AutoEdit,
    /// Auto-approve everything the safelist permits, and beyond: any call
    /// that isn't a bare shell invocation outside the sandbox's writable
    /// roots.
    FullAuto,
}

/// The user's answer to an [`AgentEvent::ApprovalNeeded`](crate::event::AgentEvent::ApprovalNeeded) request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Approve this one call.
    Yes,
    /// Approve this call and remember the decision for the rest of the session.
    YesAlways,
    /// Deny with the default message.
    No,
    /// Deny with a custom message shown to the model as the tool's output.
    NoWithMessage { custom_deny_message: String },
}

impl ApprovalDecision {
    pub fn deny_message(&self) -> &str {
        match self {
            ApprovalDecision::NoWithMessage {
                custom_deny_message,
            } => custom_deny_message,
            _ => "Command denied by user.",
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Yes | ApprovalDecision::YesAlways)
    }
}

/// Read-only commands auto-approved under any policy (§4.7). Matched
/// against the tokenized argv's first one or two words.
pub const SAFELIST: &[&[&str]] = &[
    &["ls"],
    &["cat"],
    &["pwd"],
    &["echo"],
    &["true"],
    &["false"],
    &["git", "status"],
    &["git", "diff"],
    &["git", "log"],
    &["git", "show"],
    &["git", "branch"],
    &["rg"],
    &["grep"],
    &["find"],
    &["head"],
    &["tail"],
    &["wc"],
    &["which"],
    &["file"],
];

/// Whether `argv` (a tokenized command line) matches an entry in
/// [`SAFELIST`].
pub fn is_safelisted(argv: &[String]) -> bool {
    SAFELIST.iter().any(|entry| {
        argv.len() >= entry.len() && argv.iter().zip(entry.iter()).all(|(a, b)| a == b)
    })
}

/// What the approval gate decided to do with a pending call, before it's
/// dispatched.
#[derive(Debug)]
pub enum Gate {
    /// Run it without asking.
    Approved,
    /// Don't run it; hand the model this message as the tool's output.
    Denied { message: String },
    /// Ask the user. The caller must send a decision on the returned
    /// sender and then act on it (approved → run, denied → synthesize a
    /// tool message from `deny_message()`).
    Ask(oneshot::Sender<ApprovalDecision>),
}

/// A tool call under consideration, enough information for the gate to
/// classify it without knowing how to execute it.
pub struct PendingCall {
    pub tool_name: String,
    /// Tokenized argv, if this is a shell invocation (`None` otherwise).
    pub argv: Option<Vec<String>>,
    /// Whether this tool mutates the filesystem (apply_patch, write_file,
    /// delete_file) as opposed to being read-only.
    pub is_write: bool,
}

/// Decide a pending call's disposition under `policy`. `remembered` holds
/// tool names the user already blessed with `YesAlways` this session.
pub fn classify(
    policy: ApprovalPolicy,
    call: &PendingCall,
    remembered: &std::collections::HashSet<String>,
) -> Decision {
    if remembered.contains(&call.tool_name) {
        return Decision::Approved;
    }
    if let Some(argv) = &call.argv
        && is_safelisted(argv)
    {
        return Decision::Approved;
    }

    match policy {
        ApprovalPolicy::Suggest => Decision::Ask,
        ApprovalPolicy::AutoEdit => {
            if call.is_write {
                Decision::Approved
            } else {
                Decision::Ask
            }
        }
        ApprovalPolicy::FullAuto => Decision::Approved,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Ask,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn safelist_matches_prefix() {
        assert!(is_safelisted(&argv(&["git", "status"])));
        assert!(is_safelisted(&argv(&["ls", "-la"])));
        assert!(!is_safelisted(&argv(&["git", "push"])));
        assert!(!is_safelisted(&argv(&["rm", "-rf", "/"])));
    }

    #[test]
    fn suggest_always_asks_outside_safelist() {
        let call = PendingCall {
            tool_name: "shell".to_string(),
            argv: Some(vec![]),
            is_write: false,
        };
        let remembered = Default::default();
        assert_eq!(
            classify(ApprovalPolicy::Suggest, &call, &remembered),
            Decision::Ask
        );
    }

    #[test]
    fn auto_edit_approves_writes_but_asks_for_shell() {
        let write_call = crate::handler::classify_call("write_file", r#"{"path":"a"}"#);
        let shell_call = crate::handler::classify_call("shell", r#"{"cmd":["rm","-rf","."]}"#);
        let remembered = Default::default();
        assert_eq!(
            classify(ApprovalPolicy::AutoEdit, &write_call, &remembered),
            Decision::Approved
        );
        assert_eq!(
            classify(ApprovalPolicy::AutoEdit, &shell_call, &remembered),
            Decision::Ask
        );
    }

    #[test]
    fn auto_edit_approves_apply_patch_normalized_to_shell() {
        // `agent::normalize_tool_call` rewrites `apply_patch` calls to
        // `name == "shell"` with `cmd = ["apply_patch", <patch>]` before
        // classification ever runs; AutoEdit must still treat that as a
        // write, not as an arbitrary shell command.
        let patch_call =
            crate::handler::classify_call("shell", r#"{"cmd":["apply_patch","*** Begin Patch"]}"#);
        assert!(patch_call.is_write);
        let remembered = Default::default();
        assert_eq!(
            classify(ApprovalPolicy::AutoEdit, &patch_call, &remembered),
            Decision::Approved
        );
    }

    #[test]
    fn full_auto_approves_everything() {
        let call = PendingCall {
            tool_name: "shell".to_string(),
            argv: Some(argv(&["rm", "-rf", "x"])),
            is_write: true,
        };
        let remembered = Default::default();
        assert_eq!(
            classify(ApprovalPolicy::FullAuto, &call, &remembered),
            Decision::Approved
        );
    }

    #[test]
    fn yes_always_is_remembered() {
        let call = PendingCall {
            tool_name: "shell".to_string(),
            argv: Some(vec![]),
            is_write: false,
        };
        let mut remembered = std::collections::HashSet::new();
        remembered.insert("shell".to_string());
        assert_eq!(
            classify(ApprovalPolicy::Suggest, &call, &remembered),
            Decision::Approved
        );
    }

    #[test]
    fn deny_message_defaults() {
        assert_eq!(ApprovalDecision::No.deny_message(), "Command denied by user.");
        assert_eq!(
            ApprovalDecision::NoWithMessage {
                custom_deny_message: "no thanks".to_string()
            }
            .deny_message(),
            "no thanks"
        );
    }
}
