//! Terminal front end for sita: input classification, control commands, turn
//! dispatch to the shell, quick-query and agent paths, and the REPL.

mod bootstrap_helpers;
mod control_commands;
mod input_classifier;
mod presentation;
mod provider_client;
mod runtime_loop;
mod runtime_types;
mod startup;
mod system_prompt;
mod turn_dispatch;

pub use bootstrap_helpers::init_tracing;
pub use control_commands::{
    export_session_to_dir, render_config, render_help, render_history, render_models,
    render_stats,
};
pub use input_classifier::{
    classify_input, ClassifiedInput, ControlCommand, CONTROL_KEYWORDS, QUERY_MARKER,
    SHELL_MARKER,
};
pub use presentation::{format_event, status_line, tool_event_sink, turn_segments, Presenter, Segment};
pub use provider_client::{build_provider_client, ClientSettings};
pub use runtime_loop::{run_interactive, run_line, run_one_shot};
pub use runtime_types::{
    ClientFactory, ControlOutput, EventSink, InputOutcome, RuntimeParts, TerminalRuntime,
    TurnLimits,
};
pub use startup::{build_tool_registry, run_cli};
pub use system_prompt::{compose_system_prompt, PlatformInfo};
pub use turn_dispatch::invocation_output;
