//! Command context and its execution state machine.
//!
//! ```text
//! INITIALIZING -> EXEC_SCHEDULED -> EXECUTING -> EXEC_FINISHED -> OK
//!                                              \-> EXEC_FINISHED -> EXPECTING_EXPBUF_ACK -> EXPBUF_ACKED -> OK
//!                                              \-> EXPECTING_DATA -> EXECUTING (resumed)
//! ERROR is reachable from any non-terminal state and is itself terminal.
//! ```

use crate::error::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    Initializing,
    ExecScheduled,
    Executing,
    ExecFinished,
    ExpectingData,
    ExpectingExpbufAck,
    ExpbufAcked,
    Ok,
    Error,
}

impl CommandState {
    fn label(self) -> &'static str {
        match self {
            CommandState::Initializing => "INITIALIZING",
            CommandState::ExecScheduled => "EXEC_SCHEDULED",
            CommandState::Executing => "EXECUTING",
            CommandState::ExecFinished => "EXEC_FINISHED",
            CommandState::ExpectingData => "EXPECTING_DATA",
            CommandState::ExpectingExpbufAck => "EXPECTING_EXPBUF_ACK",
            CommandState::ExpbufAcked => "EXPBUF_ACKED",
            CommandState::Ok => "OK",
            CommandState::Error => "ERROR",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, CommandState::Ok | CommandState::Error)
    }

    /// Whether `self -> next` is one of the transitions named above.
    fn allows(self, next: CommandState) -> bool {
        use CommandState::*;
        if next == Error {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Initializing, ExecScheduled)
                | (ExecScheduled, Executing)
                | (Executing, ExecFinished)
                | (Executing, ExpectingData)
                | (ExpectingData, Executing)
                | (ExecFinished, Ok)
                | (ExecFinished, ExpectingExpbufAck)
                | (ExpectingExpbufAck, ExpbufAcked)
                | (ExpbufAcked, Ok)
        )
    }
}

/// A single in-flight command's execution context: its current state, the
/// command name it is executing, and an optional data buffer accumulated
/// while in `EXPECTING_DATA`, requesting more input before resuming
/// execution.
pub struct CommandContext {
    name: String,
    state: CommandState,
    pending_data: Vec<u8>,
    error: Option<String>,
}

impl CommandContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), state: CommandState::Initializing, pending_data: Vec::new(), error: None }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn transition(&mut self, next: CommandState) -> Result<(), CommandError> {
        if !self.state.allows(next) {
            return Err(CommandError::InvalidTransition { from: self.state.label(), to: next.label() });
        }
        self.state = next;
        Ok(())
    }

    pub fn schedule(&mut self) -> Result<(), CommandError> {
        self.transition(CommandState::ExecScheduled)
    }

    pub fn begin_execute(&mut self) -> Result<(), CommandError> {
        self.transition(CommandState::Executing)
    }

    /// The executing callback is done and produced no further data request.
    pub fn finish_execute(&mut self) -> Result<(), CommandError> {
        self.transition(CommandState::ExecFinished)
    }

    /// The executing callback needs more client-supplied data before it can
    /// finish; append it to a held buffer and resume execution once the
    /// caller supplies it via [`Self::supply_data`].
    pub fn request_data(&mut self) -> Result<(), CommandError> {
        self.transition(CommandState::ExpectingData)
    }

    pub fn supply_data(&mut self, chunk: &[u8]) -> Result<(), CommandError> {
        self.pending_data.extend_from_slice(chunk);
        self.transition(CommandState::Executing)
    }

    pub fn take_pending_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending_data)
    }

    /// The finished command produced an export buffer (memfd) the client
    /// must acknowledge receipt of before the command is considered
    /// complete.
    pub fn request_expbuf_ack(&mut self) -> Result<(), CommandError> {
        self.transition(CommandState::ExpectingExpbufAck)
    }

    pub fn ack_expbuf(&mut self) -> Result<(), CommandError> {
        self.transition(CommandState::ExpbufAcked)?;
        self.transition(CommandState::Ok)
    }

    pub fn complete(&mut self) -> Result<(), CommandError> {
        self.transition(CommandState::Ok)
    }

    /// Reachable from any non-terminal state; itself terminal.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.state = CommandState::Error;
    }
}
