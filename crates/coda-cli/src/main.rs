mod app;
mod session;
mod ui;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use app::{App, AppState};
use clap::{Parser, ValueEnum};
use coda_core::event::AgentEvent;
use coda_core::{Agent, ApprovalDecision, ApprovalPolicy};
use crossterm::event::{DisableMouseCapture, EnableMouseCapture, Event, EventStream};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use parking_lot::Mutex;
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use session::SessionStore;
use tokio_stream::StreamExt;

const DEFAULT_MODEL: &str = "gpt-5-codex";

/// Exit codes (§6): 0 success, 1 unrecoverable error, 2 bad arguments,
/// 130 interrupted.
const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_BAD_ARGS: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "coda", about = "A terminal-based agentic coding assistant.")]
struct Cli {
    /// Seed the first user turn with this text instead of opening the TUI
    /// on an empty input.
    #[arg(long)]
    prompt: Option<String>,

    /// Attach an image to the first user turn. May be repeated.
    #[arg(long = "image")]
    images: Vec<String>,

    /// Approval policy for tool calls (§4.7).
    #[arg(long, value_enum)]
    approval: Option<ApprovalArg>,

    /// Model id to use (defaults to $CODA_MODEL or a built-in default).
    #[arg(long)]
    model: Option<String>,

    /// Print full tool stdout/stderr rather than a truncated summary
    /// (single-pass mode only).
    #[arg(long)]
    full_stdout: bool,

    /// Preview mode: every tool call is automatically denied, so the
    /// model's reasoning is visible but nothing touches the filesystem or
    /// spawns a process.
    #[arg(long)]
    dry_run: bool,

    /// Run one non-interactive turn to completion (requires --prompt) and
    /// exit, instead of opening the TUI.
    #[arg(long)]
    single_pass: bool,

    /// Path to a config file (defaults to `.codex/config.toml` under the
    /// current directory).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ApprovalArg {
    Suggest,
    AutoEdit,
    FullAuto,
}

impl From<ApprovalArg> for ApprovalPolicy {
    fn from(value: ApprovalArg) -> Self {
        match value {
            ApprovalArg::Suggest => ApprovalPolicy::Suggest,
            ApprovalArg::AutoEdit => ApprovalPolicy::AutoEdit,
            ApprovalArg::FullAuto => ApprovalPolicy::FullAuto,
        }
    }
}

/// Config file shape (§10.3): `.codex/config.toml`, lowest-precedence
/// source above the built-in defaults. Unknown keys are ignored.
#[derive(Default, serde::Deserialize)]
struct FileConfig {
    model: Option<String>,
    approval: Option<String>,
    base_url: Option<String>,
}

fn load_file_config(path: &std::path::Path) -> FileConfig {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| toml::from_str(&raw).ok())
        .unwrap_or_default()
}

fn init_logging() {
    let debug = std::env::var("DEBUG").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .with_writer(io::stderr)
        .init();
}

/// Restore the terminal to its original state. Called on normal exit and
/// from the panic hook.
fn restore_terminal() {
    let _ = disable_raw_mode();
    let _ = execute!(io::stdout(), DisableMouseCapture, LeaveAlternateScreen);
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    init_logging();

    if cli.single_pass && cli.prompt.is_none() {
        eprintln!("--single-pass requires --prompt");
        return EXIT_BAD_ARGS;
    }

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(err) => {
            eprintln!("failed to read working directory: {err}");
            return EXIT_ERROR;
        }
    };

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cwd.join(".codex").join("config.toml"));
    let file_config = load_file_config(&config_path);

    let model_id = cli
        .model
        .clone()
        .or_else(|| std::env::var("CODA_MODEL").ok())
        .or(file_config.model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    // --dry-run previews the turn: force a policy that asks about every
    // non-safelisted call, so nothing with side effects runs unconfirmed;
    // both single-pass and interactive mode then auto-deny those requests
    // instead of executing them (see `single_pass` and `App::dry_run`).
    let approval_policy = if cli.dry_run {
        ApprovalPolicy::Suggest
    } else {
        cli.approval
            .map(ApprovalPolicy::from)
            .or_else(|| parse_approval_arg(file_config.approval.as_deref()))
            .unwrap_or_default()
    };

    let provider = match file_config.base_url.clone() {
        Some(base_url) => coda_llm_openai::provider(coda_llm_openai::OpenAIConfig {
            auth_token: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            base_url,
            extra_headers: Default::default(),
        }),
        None => coda_llm_openai::from_env(),
    };
    let model = provider.model(&model_id);

    if cli.single_pass {
        let mut agent = Agent::with_defaults(model, cwd.clone());
        agent.set_approval_policy(approval_policy);
        single_pass(
            agent,
            cli.prompt.clone().unwrap_or_default(),
            cli.images,
            cli.full_stdout,
        )
        .await
    } else {
        interactive(
            model,
            approval_policy,
            &cwd,
            cli.prompt,
            cli.images,
            cli.dry_run,
        )
        .await
    }
}

fn parse_approval_arg(value: Option<&str>) -> Option<ApprovalPolicy> {
    match value? {
        "suggest" => Some(ApprovalPolicy::Suggest),
        "auto-edit" => Some(ApprovalPolicy::AutoEdit),
        "full-auto" => Some(ApprovalPolicy::FullAuto),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Single-pass (non-interactive) mode
// ---------------------------------------------------------------------------

async fn single_pass(agent: Agent, prompt: String, images: Vec<String>, full_stdout: bool) -> i32 {
    let mut stream = if images.is_empty() {
        agent.submit(prompt)
    } else {
        agent.submit_with_images(prompt, images)
    };

    let mut final_text = String::new();
    let mut had_error = false;

    loop {
        let next = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c() => {
                agent.cancel();
                return EXIT_INTERRUPTED;
            }
        };
        let Some(event) = next else { break };

        match event {
            AgentEvent::TextDelta { delta } => {
                final_text.push_str(&delta);
            }
            AgentEvent::ApprovalNeeded { id, display } => {
                // There's no TTY to ask in single-pass mode. A call only
                // reaches here if the policy didn't already auto-approve it
                // (`--approval full-auto` never does), so fail safe and
                // deny rather than silently running an unconfirmed command.
                eprintln!("[denied, no interactive approval in --single-pass: {}]", display.title);
                agent.resolve_approval(&id, ApprovalDecision::No);
            }
            AgentEvent::ToolResult { display, .. } if full_stdout => {
                if let Some(coda_core::event::DisplayBody::Text(text)) = &display.body {
                    eprintln!("--- {} ---\n{text}", display.title);
                }
            }
            AgentEvent::Error { error } => {
                eprintln!("{error}");
                had_error = true;
            }
            AgentEvent::Cancelled => {
                return EXIT_INTERRUPTED;
            }
            AgentEvent::TurnComplete { .. } => break,
            _ => {}
        }
    }

    println!("{}", final_text.trim());
    if had_error {
        EXIT_ERROR
    } else {
        EXIT_OK
    }
}

// ---------------------------------------------------------------------------
// Interactive TUI mode
// ---------------------------------------------------------------------------

async fn interactive(
    model: coda_llm::LanguageModel,
    approval_policy: ApprovalPolicy,
    cwd: &std::path::Path,
    seed_prompt: Option<String>,
    seed_images: Vec<String>,
    dry_run: bool,
) -> i32 {
    let model_id = model.model_id().to_string();
    let provider_name = model.provider().to_string();

    let mut session_store = SessionStore::open_for_project_root(cwd);
    let _ = session_store.resume_most_recent_session().await;

    let mut agent = match session_store.active_rollout() {
        Some(rollout) => Agent::resume(model, cwd.to_path_buf(), rollout),
        None => {
            session_store.create_session(&model_id, &provider_name, now_rfc3339());
            Agent::with_defaults(model, cwd.to_path_buf())
        }
    };
    agent.set_approval_policy(approval_policy);

    let session_store = Arc::new(Mutex::new(session_store));
    let mut app = App::new(agent, session_store);
    app.dry_run = dry_run;

    if let Some(prompt) = seed_prompt {
        let stream = if seed_images.is_empty() {
            app.agent.submit(prompt)
        } else {
            app.agent.submit_with_images(prompt, seed_images)
        };
        app.state = AppState::Generating { stream };
    }

    enable_raw_mode().ok();
    if execute!(io::stdout(), EnterAlternateScreen, EnableMouseCapture).is_err() {
        restore_terminal();
        return EXIT_ERROR;
    }
    let backend = CrosstermBackend::new(io::stdout());
    let mut terminal = match Terminal::new(backend) {
        Ok(t) => t,
        Err(err) => {
            restore_terminal();
            eprintln!("failed to initialize terminal: {err}");
            return EXIT_ERROR;
        }
    };

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        restore_terminal();
        default_hook(info);
    }));

    let mut events = EventStream::new();
    let result = run_event_loop(&mut terminal, &mut app, &mut events).await;
    restore_terminal();

    match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("{err}");
            EXIT_ERROR
        }
    }
}

/// Minimum interval between terminal redraws while a turn is streaming
/// (spec §4.5/§5: "throttled (>=150 ms) snapshot of the partial-update
/// state"). Redraws triggered by user input or a turn-structural event
/// (tool call begin/end, approval, turn complete, ...) are never throttled.
const RENDER_THROTTLE: std::time::Duration = std::time::Duration::from_millis(150);

async fn run_event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    events: &mut EventStream,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut blink_interval = tokio::time::interval(std::time::Duration::from_millis(530));
    blink_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut render_interval = tokio::time::interval(RENDER_THROTTLE);
    render_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut dirty = true;
    // Set once a delta arrives while streaming; cleared on the next
    // render-interval tick that actually redraws.
    let mut delta_pending = false;

    loop {
        if dirty {
            terminal.draw(|frame| ui::render(frame, app))?;
            dirty = false;
            delta_pending = false;
        }

        if app.should_quit {
            break;
        }

        tokio::select! {
            Some(Ok(event)) = events.next() => {
                match event {
                    Event::Key(key) => {
                        app.handle_key(key);
                    }
                    Event::Mouse(mouse) => {
                        app.handle_mouse(mouse);
                    }
                    Event::Resize(_, _) => {}
                    _ => {}
                }
                dirty = true;
            }

            Some(agent_event) = async {
                match &mut app.state {
                    AppState::Generating { stream } => stream.next().await,
                    AppState::Idle => std::future::pending().await,
                }
            } => {
                let is_delta = matches!(
                    agent_event,
                    AgentEvent::TextDelta { .. }
                        | AgentEvent::ReasoningDelta { .. }
                        | AgentEvent::ToolCallDelta { .. }
                );
                app.handle_agent_event(agent_event);
                if is_delta {
                    // Coalesce rapid deltas into the next render-interval tick
                    // rather than redrawing on every one.
                    delta_pending = true;
                } else {
                    dirty = true;
                }
            }

            _ = blink_interval.tick() => {
                if matches!(app.state, AppState::Generating { .. }) {
                    app.toggle_cursor_blink();
                    dirty = true;
                }
            }

            _ = render_interval.tick() => {
                if delta_pending {
                    dirty = true;
                }
            }
        }
    }
    Ok(())
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
