//! Per-connection protocol state machine.
//!
//! The machine is a plain value: [`SessionMachine::apply`] consumes one engine
//! event and returns the successor machine plus an [`Effect`] describing what
//! the transcript should do with it. Nothing is mutated in place, so a caller
//! holding an earlier snapshot can still compare it structurally.

use std::fmt;

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::protocol::{EngineError, Notice, ServerEvent};

/// Stable handle for one transcript entry. Minted at submission (or receipt,
/// for standalone notices) and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HistoryId(Uuid);

impl HistoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HistoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What kind of output a sub-statement produces. Collapses the engine's
/// is-streaming and has-rows flags so the illegal combinations cannot be
/// represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Bare acknowledgement, no rows.
    Plain,
    /// Bounded row set from a one-shot query.
    Rowset,
    /// Continuous subscription; rows keep arriving until cancelled.
    Stream { has_rows: bool },
}

impl ResultShape {
    pub fn is_streaming(self) -> bool {
        matches!(self, ResultShape::Stream { .. })
    }

    pub fn has_rows(self) -> bool {
        match self {
            ResultShape::Plain => false,
            ResultShape::Rowset => true,
            ResultShape::Stream { has_rows } => has_rows,
        }
    }
}

/// One sub-statement's output within a submitted command. For streaming
/// results `rows` holds the raw signed-event log; the diff accumulator
/// materializes it on read.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub shape: ResultShape,
    pub notices: Vec<Notice>,
    pub error: Option<EngineError>,
    pub cols: Option<Vec<String>>,
    pub rows: Vec<Vec<Value>>,
    pub complete_tag: Option<String>,
    pub started_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

impl CommandResult {
    fn new(shape: ResultShape) -> Self {
        Self {
            shape,
            notices: Vec::new(),
            error: None,
            cols: None,
            rows: Vec::new(),
            complete_tag: None,
            started_at_ms: now_ms(),
            finished_at_ms: None,
        }
    }
}

/// One user-submitted command transcript entry. `results` grows as the engine
/// announces each sub-statement; a top-level `error` means the command failed
/// before any sub-statement began.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub history_id: HistoryId,
    pub command: String,
    pub notices: Vec<Notice>,
    pub error: Option<EngineError>,
    pub results: Vec<CommandResult>,
}

impl CommandOutput {
    fn new(command: &str) -> Self {
        Self {
            history_id: HistoryId::new(),
            command: command.to_string(),
            notices: Vec::new(),
            error: None,
            results: Vec::new(),
        }
    }
}

/// Out-of-band notice received while no command was in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct NoticeOutput {
    pub history_id: HistoryId,
    pub notice: Notice,
}

impl NoticeOutput {
    fn new(notice: Notice) -> Self {
        Self {
            history_id: HistoryId::new(),
            notice,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    ReadyForQuery,
    CommandSent,
    InProgressDefault,
    InProgressHasRows,
    InProgressStreaming,
}

/// What the caller should do with the transcript after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Nothing to persist (handshake traffic).
    None,
    /// A standalone notice to append as its own transcript entry.
    Standalone(NoticeOutput),
    /// The in-flight command changed; replace its transcript value.
    Updated(CommandOutput),
    /// The command's round-trip finished; persist the final value.
    Finished(CommandOutput),
}

#[derive(Debug)]
pub struct Transition {
    pub machine: SessionMachine,
    pub effect: Effect,
}

/// An event/state pairing the protocol forbids. Indicates desynchronization
/// with the engine; the session must not paper over it.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolViolation {
    #[error("event {event} is not legal in state {state:?}")]
    UnexpectedEvent {
        state: SessionState,
        event: &'static str,
    },
    #[error("no command in flight while handling {event}")]
    NoCommandInFlight { event: &'static str },
    #[error("row data arrived before any sub-statement started")]
    NoResultStarted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionMachine {
    state: SessionState,
    current: Option<CommandOutput>,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Initial,
            current: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Begin a command round-trip. Only legal while idle; anywhere else the
    /// submission is ignored and `None` comes back with the machine untouched.
    /// The caller must put the command on the wire atomically with installing
    /// the returned machine value.
    pub fn submit(&self, command: &str) -> Option<(SessionMachine, CommandOutput)> {
        if self.state != SessionState::ReadyForQuery {
            return None;
        }
        let output = CommandOutput::new(command);
        let machine = SessionMachine {
            state: SessionState::CommandSent,
            current: Some(output.clone()),
        };
        Some((machine, output))
    }

    /// Advance the machine by one engine event.
    pub fn apply(&self, event: ServerEvent) -> Result<Transition, ProtocolViolation> {
        use SessionState::*;

        let mut next = self.clone();
        let effect = match (self.state, event) {
            (Initial, ServerEvent::ReadyForQuery) => {
                next.state = ReadyForQuery;
                Effect::None
            }
            (ReadyForQuery, ServerEvent::Notice(notice)) => {
                Effect::Standalone(NoticeOutput::new(notice))
            }
            (CommandSent, ServerEvent::CommandStarting {
                is_streaming,
                has_rows,
            }) => {
                let shape = match (is_streaming, has_rows) {
                    (true, has_rows) => ResultShape::Stream { has_rows },
                    (false, true) => ResultShape::Rowset,
                    (false, false) => ResultShape::Plain,
                };
                next.state = match shape {
                    ResultShape::Plain => InProgressDefault,
                    ResultShape::Rowset => InProgressHasRows,
                    ResultShape::Stream { .. } => InProgressStreaming,
                };
                let command = next.active_command("CommandStarting")?;
                command.results.push(CommandResult::new(shape));
                Effect::Updated(command.clone())
            }
            (CommandSent, ServerEvent::Notice(notice)) => {
                // Before the first sub-statement announcement the notice
                // belongs to the command itself; afterwards it rides with the
                // most recently started result.
                let command = next.active_command("Notice")?;
                match command.results.last_mut() {
                    Some(result) => result.notices.push(notice),
                    None => command.notices.push(notice),
                }
                Effect::Updated(command.clone())
            }
            (CommandSent, ServerEvent::Error(error)) => {
                let command = next.active_command("Error")?;
                command.error = Some(error);
                Effect::Updated(command.clone())
            }
            (CommandSent, ServerEvent::ReadyForQuery) => {
                next.state = ReadyForQuery;
                let command = next
                    .current
                    .take()
                    .ok_or(ProtocolViolation::NoCommandInFlight {
                        event: "ReadyForQuery",
                    })?;
                Effect::Finished(command)
            }
            (InProgressDefault, ServerEvent::CommandComplete(tag)) => {
                next.state = CommandSent;
                next.complete_active_result(tag)?
            }
            (InProgressDefault, ServerEvent::Notice(notice)) => {
                // Engine-compatible oddity: a notice during a no-rows result
                // shifts the machine onto the has-rows path. Kept as observed.
                next.state = InProgressHasRows;
                let result = next.active_result()?;
                result.notices.push(notice);
                Effect::Updated(next.active_command("Notice")?.clone())
            }
            (InProgressDefault, ServerEvent::Error(error)) => {
                next.state = CommandSent;
                next.fail_active_result(error)?
            }
            (InProgressHasRows | InProgressStreaming, ServerEvent::Rows(cols)) => {
                let result = next.active_result()?;
                result.cols = Some(cols);
                Effect::Updated(next.active_command("Rows")?.clone())
            }
            (InProgressHasRows | InProgressStreaming, ServerEvent::Row(values)) => {
                let result = next.active_result()?;
                result.rows.push(values);
                Effect::Updated(next.active_command("Row")?.clone())
            }
            (InProgressHasRows | InProgressStreaming, ServerEvent::Notice(notice)) => {
                let result = next.active_result()?;
                result.notices.push(notice);
                Effect::Updated(next.active_command("Notice")?.clone())
            }
            (InProgressHasRows | InProgressStreaming, ServerEvent::CommandComplete(tag)) => {
                next.state = CommandSent;
                next.complete_active_result(tag)?
            }
            (InProgressHasRows | InProgressStreaming, ServerEvent::Error(error)) => {
                next.state = CommandSent;
                next.fail_active_result(error)?
            }
            (state, event) => {
                return Err(ProtocolViolation::UnexpectedEvent {
                    state,
                    event: event_name(&event),
                });
            }
        };
        Ok(Transition {
            machine: next,
            effect,
        })
    }

    fn active_command(
        &mut self,
        event: &'static str,
    ) -> Result<&mut CommandOutput, ProtocolViolation> {
        self.current
            .as_mut()
            .ok_or(ProtocolViolation::NoCommandInFlight { event })
    }

    fn active_result(&mut self) -> Result<&mut CommandResult, ProtocolViolation> {
        self.current
            .as_mut()
            .and_then(|command| command.results.last_mut())
            .ok_or(ProtocolViolation::NoResultStarted)
    }

    fn complete_active_result(&mut self, tag: String) -> Result<Effect, ProtocolViolation> {
        let result = self.active_result()?;
        result.complete_tag = Some(tag);
        result.finished_at_ms = Some(now_ms());
        Ok(Effect::Updated(
            self.active_command("CommandComplete")?.clone(),
        ))
    }

    fn fail_active_result(&mut self, error: EngineError) -> Result<Effect, ProtocolViolation> {
        let result = self.active_result()?;
        result.error = Some(error);
        result.finished_at_ms = Some(now_ms());
        Ok(Effect::Updated(self.active_command("Error")?.clone()))
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn event_name(event: &ServerEvent) -> &'static str {
    match event {
        ServerEvent::ReadyForQuery => "ReadyForQuery",
        ServerEvent::Notice(_) => "Notice",
        ServerEvent::CommandStarting { .. } => "CommandStarting",
        ServerEvent::Rows(_) => "Rows",
        ServerEvent::Row(_) => "Row",
        ServerEvent::CommandComplete(_) => "CommandComplete",
        ServerEvent::Error(_) => "Error",
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
