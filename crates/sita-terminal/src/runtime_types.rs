use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use sita_agent_core::{AgentEvent, ToolRegistry};
use sita_ai::LlmClient;
use sita_cli::{Configuration, SettingsStore};
use sita_session::{Session, SessionStore, Turn};

use crate::system_prompt::PlatformInfo;

/// Builds a completion client for the current configuration.
pub type ClientFactory = Arc<dyn Fn(&Configuration) -> Result<Arc<dyn LlmClient>> + Send + Sync>;

/// Subscriber for orchestration events, installed when `show_tool_calls` is on.
pub type EventSink = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnLimits {
    pub max_rounds: usize,
    pub max_parallel_tool_calls: usize,
    pub history_turns: usize,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            max_parallel_tool_calls: 4,
            history_turns: 3,
        }
    }
}

/// Output of a control command, rendered by the presentation adapter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlOutput {
    pub text: String,
    /// `text` is markdown rather than preformatted text.
    pub markdown: bool,
    pub clear_screen: bool,
    pub exit: bool,
}

impl ControlOutput {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markdown: true,
            ..Self::default()
        }
    }
}

/// What one input line resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum InputOutcome {
    Noop,
    Control(ControlOutput),
    Turn(Box<Turn>),
}

pub struct RuntimeParts {
    pub configuration: Configuration,
    pub settings: SettingsStore,
    pub store: SessionStore,
    pub session: Session,
    pub registry: Arc<ToolRegistry>,
    pub client_factory: ClientFactory,
    pub limits: TurnLimits,
    pub data_dir: PathBuf,
}

/// Everything one interactive process owns: configuration, the active
/// session and the services a turn runs against.
pub struct TerminalRuntime {
    pub(crate) configuration: Configuration,
    pub(crate) settings: SettingsStore,
    pub(crate) store: SessionStore,
    pub(crate) session: Session,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) client_factory: ClientFactory,
    pub(crate) client: Option<Arc<dyn LlmClient>>,
    pub(crate) limits: TurnLimits,
    pub(crate) platform: PlatformInfo,
    pub(crate) data_dir: PathBuf,
    pub(crate) event_sink: Option<EventSink>,
}

impl TerminalRuntime {
    pub fn new(parts: RuntimeParts) -> Self {
        Self {
            configuration: parts.configuration,
            settings: parts.settings,
            store: parts.store,
            session: parts.session,
            registry: parts.registry,
            client_factory: parts.client_factory,
            client: None,
            limits: parts.limits,
            platform: PlatformInfo::detect(),
            data_dir: parts.data_dir,
            event_sink: None,
        }
    }

    pub fn set_event_sink(&mut self, sink: Option<EventSink>) {
        self.event_sink = sink;
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    /// Drops the cached client so the next AGENT turn rebuilds it.
    pub(crate) fn invalidate_client(&mut self) {
        self.client = None;
    }

    pub(crate) fn completion_client(&mut self) -> Result<Arc<dyn LlmClient>> {
        if let Some(client) = &self.client {
            return Ok(Arc::clone(client));
        }
        let client = (self.client_factory)(&self.configuration)?;
        self.client = Some(Arc::clone(&client));
        Ok(client)
    }
}
