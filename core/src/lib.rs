//! Run batches of shell commands against a single long-lived `sh` or `su`
//! process. Each [`cmd::Cmd`] gets its own exit code, captured output and
//! error lines, and optional live line sinks, while the process, its pipes
//! and the serializing command queue are shared across the whole session.

pub mod cmd;
mod cmd_shell;
mod error;
pub mod process;
pub mod shell;
#[cfg(test)]
mod testkit;

pub use cmd_shell::CmdShell;
pub use cmd_shell::CmdShellBuilder;
pub use cmd_shell::CmdShellSession;
pub use error::Result;
pub use error::ShellError;
