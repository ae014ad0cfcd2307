//! Step control for debugging sessions
//!
//! A session pauses before the replayed function starts and, while stepping or
//! at a breakpoint, before each substituted effect. At every pause the
//! [`StepController`] decides what happens next.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{ClearstoneError, Result};

/// Where a session is paused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum PausePoint {
    /// Before the replayed function runs
    Entry { function: String, agent_class: String },
    /// Before a substituted effect is served
    BeforeEffect {
        target: String,
        /// Number of calls already served for this target
        call_index: usize,
        /// Recorded outputs left for this target
        remaining: usize,
    },
}

impl std::fmt::Display for PausePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PausePoint::Entry {
                function,
                agent_class,
            } => write!(f, "entry of {agent_class}::{function}"),
            PausePoint::BeforeEffect {
                target,
                call_index,
                remaining,
            } => write!(
                f,
                "before call #{call_index} to '{target}' ({remaining} recorded output(s) left)"
            ),
        }
    }
}

/// Decision taken at a pause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepCommand {
    /// Run until the next breakpoint
    Continue,
    /// Pause again before the next effect
    Step,
    /// Add a breakpoint on a target and stay paused
    Break(String),
    /// Remove a breakpoint and stay paused
    Clear(String),
    /// End the session with `SessionAborted`
    Abort,
}

/// Drives a debugging session
#[async_trait]
pub trait StepController: Send {
    async fn pause(&mut self, point: &PausePoint) -> StepCommand;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Stepping,
    Running,
}

/// Pause bookkeeping shared by a session and its controller
pub(crate) struct Stepper<'a> {
    controller: &'a mut dyn StepController,
    mode: Mode,
    breakpoints: BTreeSet<String>,
}

impl<'a> Stepper<'a> {
    pub(crate) fn new(controller: &'a mut dyn StepController) -> Self {
        Self {
            controller,
            mode: Mode::Stepping,
            breakpoints: BTreeSet::new(),
        }
    }

    pub(crate) fn should_pause_before(&self, target: &str) -> bool {
        self.mode == Mode::Stepping || self.breakpoints.contains(target)
    }

    /// Hand control to the controller until it resumes or aborts
    pub(crate) async fn pause(&mut self, point: &PausePoint) -> Result<()> {
        tracing::debug!(point = %point, "debugging session paused");
        loop {
            match self.controller.pause(point).await {
                StepCommand::Continue => {
                    self.mode = Mode::Running;
                    return Ok(());
                }
                StepCommand::Step => {
                    self.mode = Mode::Stepping;
                    return Ok(());
                }
                StepCommand::Break(target) => {
                    self.breakpoints.insert(target);
                }
                StepCommand::Clear(target) => {
                    self.breakpoints.remove(&target);
                }
                StepCommand::Abort => {
                    tracing::info!(point = %point, "debugging session aborted");
                    return Err(ClearstoneError::SessionAborted);
                }
            }
        }
    }
}

/// Plays back a fixed list of commands and records every pause.
///
/// Once the script runs out every pause continues.
#[derive(Debug, Clone, Default)]
pub struct ScriptedController {
    script: VecDeque<StepCommand>,
    pauses: Arc<Mutex<Vec<PausePoint>>>,
}

impl ScriptedController {
    pub fn new(script: impl IntoIterator<Item = StepCommand>) -> Self {
        Self {
            script: script.into_iter().collect(),
            pauses: Arc::default(),
        }
    }

    /// Every pause seen so far
    pub fn pauses(&self) -> Vec<PausePoint> {
        self.pauses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StepController for ScriptedController {
    async fn pause(&mut self, point: &PausePoint) -> StepCommand {
        self.pauses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(point.clone());
        self.script.pop_front().unwrap_or(StepCommand::Continue)
    }
}

/// Line-oriented controller for interactive terminals.
///
/// Commands: `c`/`continue`, `s`/`step`, `b <target>`/`break <target>`,
/// `d <target>`/`delete <target>`, `q`/`quit`. End of input continues.
pub struct ConsoleController<R, W> {
    input: R,
    output: W,
}

const CONSOLE_HELP: &str =
    "commands: c(ontinue) | s(tep) | b(reak) <target> | d(elete) <target> | q(uit)";

impl<R: BufRead + Send, W: Write + Send> ConsoleController<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn read_command(&mut self) -> std::io::Result<Option<StepCommand>> {
        write!(self.output, "(clearstone) ")?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(Some(StepCommand::Continue));
        }

        let mut words = line.split_whitespace();
        let command = match (words.next(), words.next()) {
            (Some("c" | "continue"), None) => Some(StepCommand::Continue),
            (Some("s" | "step"), None) => Some(StepCommand::Step),
            (Some("b" | "break"), Some(target)) => Some(StepCommand::Break(target.to_string())),
            (Some("d" | "delete"), Some(target)) => Some(StepCommand::Clear(target.to_string())),
            (Some("q" | "quit"), None) => Some(StepCommand::Abort),
            _ => None,
        };
        Ok(command)
    }
}

#[async_trait]
impl<R: BufRead + Send, W: Write + Send> StepController for ConsoleController<R, W> {
    async fn pause(&mut self, point: &PausePoint) -> StepCommand {
        if let Err(e) = writeln!(self.output, "paused at {point}") {
            tracing::warn!(error = %e, "console controller cannot write; continuing");
            return StepCommand::Continue;
        }
        loop {
            match self.read_command() {
                Ok(Some(command)) => {
                    if let StepCommand::Break(target) | StepCommand::Clear(target) = &command
                        && let Err(e) = writeln!(self.output, "breakpoints updated: {target}")
                    {
                        tracing::warn!(error = %e, "console controller cannot write");
                    }
                    return command;
                }
                Ok(None) => {
                    if let Err(e) = writeln!(self.output, "{CONSOLE_HELP}") {
                        tracing::warn!(error = %e, "console controller cannot write; continuing");
                        return StepCommand::Continue;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "console controller cannot read; continuing");
                    return StepCommand::Continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn effect(target: &str) -> PausePoint {
        PausePoint::BeforeEffect {
            target: target.to_string(),
            call_index: 0,
            remaining: 1,
        }
    }

    #[tokio::test]
    async fn test_stepper_modes_and_breakpoints() {
        let mut controller = ScriptedController::new([
            StepCommand::Break("llm".to_string()),
            StepCommand::Continue,
        ]);
        let mut stepper = Stepper::new(&mut controller);
        assert!(stepper.should_pause_before("anything"));

        stepper.pause(&effect("tool")).await.unwrap();
        assert!(!stepper.should_pause_before("tool"));
        assert!(stepper.should_pause_before("llm"));
    }

    #[tokio::test]
    async fn test_abort() {
        let mut controller = ScriptedController::new([StepCommand::Abort]);
        let mut stepper = Stepper::new(&mut controller);
        let err = stepper.pause(&effect("llm")).await.unwrap_err();
        assert!(matches!(err, ClearstoneError::SessionAborted));
        drop(stepper);
        assert_eq!(controller.pauses().len(), 1);
    }

    /// Accepts writes except those carrying `reject`
    struct RejectingWriter {
        reject: &'static [&'static str],
        written: Vec<u8>,
    }

    impl Write for RejectingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let text = String::from_utf8_lossy(buf);
            if self.reject.iter().any(|marker| text.contains(marker)) {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_console_write_failures_do_not_stall() {
        let output = RejectingWriter {
            reject: &["breakpoints", "commands:"],
            written: Vec::new(),
        };
        let mut console = ConsoleController::new(Cursor::new("bogus
b llm
"), output);
        let point = effect("llm");

        // Unknown input with no way to show help continues instead of looping.
        assert_eq!(console.pause(&point).await, StepCommand::Continue);
        // The command still applies when its echo cannot be written.
        assert_eq!(console.pause(&point).await, StepCommand::Break("llm".to_string()));

        let transcript = String::from_utf8(console.output.written).unwrap();
        assert!(transcript.contains("paused at"));
        assert!(!transcript.contains("breakpoints"));
    }

    #[tokio::test]
    async fn test_console_parses_commands() {
        let input = Cursor::new("bogus\nb llm\ns\nq\n");
        let mut output = Vec::new();
        {
            let mut console = ConsoleController::new(input, &mut output);
            let point = effect("llm");
            assert_eq!(console.pause(&point).await, StepCommand::Break("llm".to_string()));
            assert_eq!(console.pause(&point).await, StepCommand::Step);
            assert_eq!(console.pause(&point).await, StepCommand::Abort);
            assert_eq!(console.pause(&point).await, StepCommand::Continue);
        }
        let transcript = String::from_utf8(output).unwrap();
        assert!(transcript.contains("paused at before call #0 to 'llm'"));
        assert!(transcript.contains("commands:"));
    }
}
