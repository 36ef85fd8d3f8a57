use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cmd_shell::CmdShell;
use crate::error::Result;
use crate::error::ShellError;

mod harvester;
mod processor;

pub(crate) use harvester::ErrorCrop;
pub(crate) use harvester::OutputCrop;
pub(crate) use harvester::harvest_error;
pub(crate) use harvester::harvest_output;
pub use processor::CmdProcessor;
pub use processor::CmdSubmission;

/// Exit codes reported through [`CmdResult::exit_code`].
///
/// Everything from `0` to `255` comes straight from the shell. The negative
/// values are reported by the command processor itself and any of them means
/// the session is gone.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const PROBLEM: i32 = 1;
    pub const OUT_OF_RANGE: i32 = 255;
    /// The command processor hit an unexpected condition, e.g. an
    /// unparsable end-of-command marker.
    pub const EXCEPTION: i32 = -1;
    /// The command ran past its timeout and the session was killed.
    pub const TIMEOUT: i32 = -2;
    /// The shell process ended before the command completed.
    pub const SHELL_DIED: i32 = -3;
    /// Placeholder before any real code was harvested. Never visible in a
    /// completed [`CmdResult`].
    pub const INITIAL: i32 = -99;
}

/// Event delivered to a live line sink while a command runs.
///
/// Exactly one terminal event arrives after the last line: [`Completed`]
/// when the command finished normally, [`Interrupted`] when the stream
/// ended before the end-of-command marker was seen.
///
/// [`Completed`]: SinkEvent::Completed
/// [`Interrupted`]: SinkEvent::Interrupted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Line(String),
    Completed,
    Interrupted,
}

/// A batch of shell command lines executed as one unit.
///
/// Built via [`Cmd::builder`]. Each build gets a fresh marker, so a command
/// can be rebuilt and resubmitted but a single value is meant for a single
/// submission.
#[derive(Debug, Clone)]
pub struct Cmd {
    marker: String,
    commands: Vec<String>,
    timeout: Option<Duration>,
    output_buffer: bool,
    error_buffer: bool,
    output_sink: Option<mpsc::Sender<SinkEvent>>,
    error_sink: Option<mpsc::Sender<SinkEvent>>,
}

impl Cmd {
    pub fn builder<I, S>(commands: I) -> CmdBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CmdBuilder::new().input(commands)
    }

    /// Copies everything but the marker into a new builder.
    pub fn to_builder(&self) -> CmdBuilder {
        let mut builder = CmdBuilder::new()
            .input(self.commands.iter().cloned())
            .output_buffer(self.output_buffer)
            .error_buffer(self.error_buffer);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(sink) = &self.output_sink {
            builder = builder.output_sink(sink.clone());
        }
        if let Some(sink) = &self.error_sink {
            builder = builder.error_sink(sink.clone());
        }
        builder
    }

    /// Marker string separating this command's output from its neighbors'.
    ///
    /// The protocol assumes the marker never occurs in the command's own
    /// output; a fresh UUID makes a collision practically impossible but
    /// nothing enforces it.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn output_buffer_enabled(&self) -> bool {
        self.output_buffer
    }

    pub fn error_buffer_enabled(&self) -> bool {
        self.error_buffer
    }

    pub fn output_sink(&self) -> Option<&mpsc::Sender<SinkEvent>> {
        self.output_sink.as_ref()
    }

    pub fn error_sink(&self) -> Option<&mpsc::Sender<SinkEvent>> {
        self.error_sink.as_ref()
    }
}

/// Builder for [`Cmd`].
#[derive(Debug)]
pub struct CmdBuilder {
    commands: Vec<String>,
    timeout: Option<Duration>,
    output_buffer: bool,
    error_buffer: bool,
    output_sink: Option<mpsc::Sender<SinkEvent>>,
    error_sink: Option<mpsc::Sender<SinkEvent>>,
}

impl Default for CmdBuilder {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout: None,
            output_buffer: true,
            error_buffer: true,
            output_sink: None,
            error_sink: None,
        }
    }
}

impl CmdBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends command lines to execute.
    pub fn input<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    /// Deadline for the whole batch. When it passes, the session is
    /// forcibly killed and the result carries [`exit_code::TIMEOUT`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether stdout lines are collected into [`CmdResult::output`].
    /// Defaults to `true`; when disabled the result carries no buffer at
    /// all, which keeps memory flat for chatty commands.
    pub fn output_buffer(mut self, enabled: bool) -> Self {
        self.output_buffer = enabled;
        self
    }

    /// See [`CmdBuilder::output_buffer`].
    pub fn error_buffer(mut self, enabled: bool) -> Self {
        self.error_buffer = enabled;
        self
    }

    /// Receives every stdout line while the command runs, plus one terminal
    /// [`SinkEvent`]. Mind the backpressure: the processor awaits each send,
    /// so a full sink channel stalls the whole session. A stall long enough
    /// to overrun the internal line stream loses lines; the overrun is
    /// logged and the stream skips ahead.
    pub fn output_sink(mut self, sink: mpsc::Sender<SinkEvent>) -> Self {
        self.output_sink = Some(sink);
        self
    }

    /// See [`CmdBuilder::output_sink`].
    pub fn error_sink(mut self, sink: mpsc::Sender<SinkEvent>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Cmd> {
        if self.commands.is_empty() {
            return Err(ShellError::EmptyCommand);
        }
        Ok(Cmd {
            marker: Uuid::new_v4().to_string(),
            commands: self.commands,
            timeout: self.timeout,
            output_buffer: self.output_buffer,
            error_buffer: self.error_buffer,
            output_sink: self.output_sink,
            error_sink: self.error_sink,
        })
    }

    /// One-shot convenience: opens the shell if needed, runs the command
    /// and closes the session again unless it was already open.
    pub async fn submit_once(self, shell: &CmdShell) -> Result<CmdResult> {
        let cmd = self.build()?;
        let was_alive = shell.is_alive().await;
        let session = shell.open().await?;
        let result = session.submit(cmd).await;
        if !was_alive {
            session.close().await;
        }
        Ok(result)
    }
}

/// Everything a finished [`Cmd`] produced.
#[derive(Debug)]
pub struct CmdResult {
    cmd: Cmd,
    exit_code: i32,
    output: Option<Vec<String>>,
    errors: Option<Vec<String>>,
}

impl CmdResult {
    pub(crate) fn new(
        cmd: Cmd,
        exit_code: i32,
        output: Option<Vec<String>>,
        errors: Option<Vec<String>>,
    ) -> Self {
        Self {
            cmd,
            exit_code,
            output,
            errors,
        }
    }

    /// Result for a command that never ran because the shell was gone.
    /// Disabled buffers stay `None` here too.
    pub(crate) fn shell_died(cmd: Cmd) -> Self {
        let output = cmd.output_buffer_enabled().then(Vec::new);
        let errors = cmd.error_buffer_enabled().then(Vec::new);
        Self::new(cmd, exit_code::SHELL_DIED, output, errors)
    }

    pub fn cmd(&self) -> &Cmd {
        &self.cmd
    }

    /// The exit code of the last command line, or a negative
    /// [`exit_code`] value when the batch never completed.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == exit_code::OK
    }

    /// Collected stdout lines, `None` if the buffer was disabled.
    pub fn output(&self) -> Option<&[String]> {
        self.output.as_deref()
    }

    /// Collected stderr lines, `None` if the buffer was disabled.
    pub fn errors(&self) -> Option<&[String]> {
        self.errors.as_deref()
    }

    /// Output lines followed by error lines. Disabled buffers contribute
    /// nothing.
    pub fn merge(&self) -> Vec<String> {
        let mut merged = Vec::new();
        if let Some(output) = &self.output {
            merged.extend(output.iter().cloned());
        }
        if let Some(errors) = &self.errors {
            merged.extend(errors.iter().cloned());
        }
        merged
    }
}
