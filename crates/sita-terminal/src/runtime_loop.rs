use std::{
    io::{IsTerminal, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use rustyline::{
    completion::{Completer, Pair},
    error::ReadlineError,
    highlight::Highlighter,
    hint::Hinter,
    history::DefaultHistory,
    validate::Validator,
    Config as ReadlineConfig, Context as ReadlineContext, Editor, Helper,
};
use sita_agent_core::{CancellationToken, TurnStatus};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::input_classifier::CONTROL_KEYWORDS;
use crate::presentation::Presenter;
use crate::{InputOutcome, TerminalRuntime};

const REPL_PROMPT: &str = "sita> ";
const HISTORY_FILE: &str = "history.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Exit,
}

#[derive(Debug)]
struct KeywordCompleter {
    keywords: Vec<String>,
}

impl KeywordCompleter {
    fn new(keywords: &[&str]) -> Self {
        Self {
            keywords: keywords.iter().map(|keyword| (*keyword).to_string()).collect(),
        }
    }

    fn complete_token(&self, token: &str) -> Vec<String> {
        if token.is_empty() {
            return Vec::new();
        }
        let lowered = token.to_ascii_lowercase();
        self.keywords
            .iter()
            .filter(|candidate| candidate.starts_with(&lowered))
            .cloned()
            .collect()
    }
}

impl Helper for KeywordCompleter {}
impl Validator for KeywordCompleter {}
impl Highlighter for KeywordCompleter {}

impl Hinter for KeywordCompleter {
    type Hint = String;
}

impl Completer for KeywordCompleter {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &ReadlineContext<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let safe_pos = pos.min(line.len());
        // Only the first word is a control keyword.
        if line[..safe_pos].trim_start().contains(char::is_whitespace) {
            return Ok((safe_pos, Vec::new()));
        }
        let start = line.len() - line.trim_start().len();
        let token = &line[start.min(safe_pos)..safe_pos];
        let matches = self
            .complete_token(token)
            .into_iter()
            .map(|candidate| Pair {
                display: candidate.clone(),
                replacement: candidate,
            })
            .collect::<Vec<_>>();
        Ok((start.min(safe_pos), matches))
    }
}

/// Runs one input line, cancelling the turn on Ctrl-C.
///
/// The turn is always awaited to its terminal status; Ctrl-C only trips the
/// cancellation token.
pub async fn run_line(runtime: &mut TerminalRuntime, line: &str) -> Result<InputOutcome> {
    let cancellation = CancellationToken::new();
    let turn = runtime.handle_input(line, &cancellation);
    tokio::pin!(turn);
    tokio::select! {
        outcome = &mut turn => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("cancelling...");
            cancellation.cancel();
            turn.await
        }
    }
}

/// Runs `input` once. Exit code 0 only when a turn completed or a control
/// command ran.
pub async fn run_one_shot(
    runtime: &mut TerminalRuntime,
    presenter: &mut Presenter,
    input: &str,
) -> Result<i32> {
    let outcome = run_line(runtime, input).await?;
    Ok(present_outcome(runtime, presenter, &outcome).1)
}

pub async fn run_interactive(
    runtime: &mut TerminalRuntime,
    presenter: &mut Presenter,
) -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stdout().is_terminal() {
        run_interactive_tty(runtime, presenter).await
    } else {
        run_interactive_stdin(runtime, presenter).await
    }
}

async fn run_interactive_stdin(
    runtime: &mut TerminalRuntime,
    presenter: &mut Presenter,
) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("{REPL_PROMPT}");
        std::io::stdout()
            .flush()
            .context("failed to flush stdout")?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match dispatch_line(runtime, presenter, &line).await {
            LoopControl::Continue => continue,
            LoopControl::Exit => break,
        }
    }
    Ok(())
}

async fn run_interactive_tty(
    runtime: &mut TerminalRuntime,
    presenter: &mut Presenter,
) -> Result<()> {
    let history_path = repl_history_path(runtime.data_dir());
    let mut editor = build_repl_editor()?;
    load_repl_history(&mut editor, &history_path);

    loop {
        let readline = tokio::task::block_in_place(|| editor.readline(REPL_PROMPT));
        let line = match readline {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("use 'exit' to quit");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(error) => return Err(anyhow!("failed to read interactive input: {error}")),
        };
        if line.trim().is_empty() {
            continue;
        }
        if matches!(editor.add_history_entry(line.as_str()), Ok(true)) {
            save_repl_history(&mut editor, &history_path);
        }
        match dispatch_line(runtime, presenter, &line).await {
            LoopControl::Continue => continue,
            LoopControl::Exit => break,
        }
    }

    save_repl_history(&mut editor, &history_path);
    Ok(())
}

async fn dispatch_line(
    runtime: &mut TerminalRuntime,
    presenter: &mut Presenter,
    line: &str,
) -> LoopControl {
    match run_line(runtime, line).await {
        Ok(outcome) => present_outcome(runtime, presenter, &outcome).0,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "input failed");
            eprintln!("error: {error:#}");
            LoopControl::Continue
        }
    }
}

fn present_outcome(
    runtime: &TerminalRuntime,
    presenter: &mut Presenter,
    outcome: &InputOutcome,
) -> (LoopControl, i32) {
    presenter.set_render_markdown(runtime.configuration().render_markdown);
    match outcome {
        InputOutcome::Noop => (LoopControl::Continue, 0),
        InputOutcome::Control(output) => {
            presenter.print_control(output);
            let control = if output.exit {
                LoopControl::Exit
            } else {
                LoopControl::Continue
            };
            (control, 0)
        }
        InputOutcome::Turn(turn) => {
            presenter.print_turn(turn);
            let code = if turn.status == TurnStatus::Completed { 0 } else { 1 };
            (LoopControl::Continue, code)
        }
    }
}

fn build_repl_editor() -> Result<Editor<KeywordCompleter, DefaultHistory>> {
    let config = ReadlineConfig::builder().auto_add_history(false).build();
    let mut editor = Editor::<KeywordCompleter, DefaultHistory>::with_config(config)
        .context("failed to initialize interactive editor")?;
    editor.set_helper(Some(KeywordCompleter::new(CONTROL_KEYWORDS)));
    Ok(editor)
}

fn repl_history_path(data_dir: &Path) -> PathBuf {
    data_dir.join(HISTORY_FILE)
}

fn load_repl_history(editor: &mut Editor<KeywordCompleter, DefaultHistory>, path: &Path) {
    if let Err(error) = editor.load_history(path) {
        if !matches!(
            error,
            ReadlineError::Io(ref io_error) if io_error.kind() == std::io::ErrorKind::NotFound
        ) {
            tracing::warn!(path = %path.display(), %error, "failed to load REPL history");
        }
    }
}

fn save_repl_history(editor: &mut Editor<KeywordCompleter, DefaultHistory>, path: &Path) {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if let Err(error) = std::fs::create_dir_all(parent) {
            tracing::warn!(path = %parent.display(), %error, "failed to create REPL history directory");
            return;
        }
    }
    if let Err(error) = editor.save_history(path) {
        tracing::warn!(path = %path.display(), %error, "failed to persist REPL history");
    }
}
