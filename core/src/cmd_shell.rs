use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::cmd::Cmd;
use crate::cmd::CmdProcessor;
use crate::cmd::CmdSubmission;
use crate::cmd::exit_code;
use crate::error::Result;
use crate::process::ProcessKiller;
use crate::process::ShellProcess;
use crate::process::SuKiller;
use crate::process::UserKiller;
use crate::shell::Shell;
use crate::shell::ShellSession;

/// High level entry point: a reusable `sh` (or `su`) shell that executes
/// [`Cmd`] batches.
///
/// `open` hands out the running [`CmdShellSession`] while the shell
/// process is alive and starts a fresh process, environment and command
/// processor once it is not. A `CmdShell` can therefore outlive any number
/// of dead sessions.
#[derive(Debug)]
pub struct CmdShell {
    shell: Shell,
    environment: Vec<(String, String)>,
    session: Mutex<Option<CmdShellSession>>,
}

impl CmdShell {
    pub fn builder() -> CmdShellBuilder {
        CmdShellBuilder::new()
    }

    /// Opens the shell, applying the configured environment to every fresh
    /// process before any command can run in it.
    pub async fn open(&self) -> Result<CmdShellSession> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref()
            && session.is_alive()
        {
            return Ok(session.clone());
        }
        let shell_session = self.shell.open().await?;
        if let Err(err) = apply_environment(&shell_session, &self.environment).await {
            warn!("failed to apply the session environment: {err}");
            shell_session.cancel().await;
            return Err(err);
        }
        let processor = CmdProcessor::new();
        processor.attach(shell_session.clone())?;
        let session = CmdShellSession {
            shell_session,
            processor,
        };
        *guard = Some(session.clone());
        Ok(session)
    }

    pub async fn is_alive(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(CmdShellSession::is_alive)
    }

    /// Kills the current session, if any.
    pub async fn cancel(&self) {
        if let Some(session) = self.session.lock().await.as_ref() {
            session.cancel().await;
        }
    }

    /// Closes the current session, if any, and returns its exit code.
    pub async fn close(&self) -> i32 {
        let session = self.session.lock().await.as_ref().cloned();
        match session {
            Some(session) => session.close().await,
            None => exit_code::OK,
        }
    }
}

/// One live shell process plus the processor feeding it.
///
/// Clones share the session.
#[derive(Debug, Clone)]
pub struct CmdShellSession {
    shell_session: ShellSession,
    processor: CmdProcessor,
}

impl CmdShellSession {
    /// Queues a command for execution. See [`CmdProcessor::submit`].
    pub fn submit(&self, cmd: Cmd) -> CmdSubmission {
        self.processor.submit(cmd)
    }

    pub fn is_alive(&self) -> bool {
        self.shell_session.is_alive()
    }

    /// Waits for the shell process to end and returns its exit code.
    pub async fn wait_for(&self) -> i32 {
        self.shell_session.wait_for().await
    }

    /// Kills the shell process. Running and queued commands resolve with
    /// [`exit_code::SHELL_DIED`].
    pub async fn cancel(&self) {
        self.shell_session.cancel().await;
    }

    /// Waits for queued commands to finish, then asks the shell to exit
    /// and returns the process exit code. Idempotent.
    pub async fn close(&self) -> i32 {
        let mut idle = self.processor.idle();
        loop {
            if *idle.borrow_and_update() {
                break;
            }
            if idle.changed().await.is_err() {
                break;
            }
        }
        self.shell_session.close().await
    }
}

/// Builder for [`CmdShell`].
#[derive(Debug, Default)]
pub struct CmdShellBuilder {
    root: bool,
    environment: Vec<(String, String)>,
}

impl CmdShellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `su` instead of `sh`, with a process killer that sweeps the
    /// elevated process tree.
    pub fn root(mut self, root: bool) -> Self {
        self.root = root;
        self
    }

    /// Sets `key=value` in every session this shell opens.
    pub fn shell_environment(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> CmdShell {
        let process = ShellProcess::new(shell_command(self.root), shell_killer(self.root));
        CmdShell {
            shell: Shell::new(process),
            environment: self.environment,
            session: Mutex::new(None),
        }
    }
}

fn shell_command(root: bool) -> Vec<String> {
    let program = if root { "su" } else { "sh" };
    vec![program.to_string()]
}

fn shell_killer(root: bool) -> Arc<dyn ProcessKiller> {
    if root {
        Arc::new(SuKiller)
    } else {
        Arc::new(UserKiller)
    }
}

async fn apply_environment(
    session: &ShellSession,
    environment: &[(String, String)],
) -> Result<()> {
    let last = environment.len().saturating_sub(1);
    for (index, (key, value)) in environment.iter().enumerate() {
        session
            .write_line(&format!("{key}={value}"), index == last)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn user_shell_runs_sh() {
        assert_eq!(shell_command(false), vec!["sh"]);
    }

    #[test]
    fn root_shell_runs_su() {
        assert_eq!(shell_command(true), vec!["su"]);
    }

    #[test]
    fn environment_keeps_insertion_order() {
        let builder = CmdShell::builder()
            .shell_environment("FRUIT", "straw")
            .shell_environment("BERRY", "blue");
        assert_eq!(
            builder.environment,
            vec![
                ("FRUIT".to_string(), "straw".to_string()),
                ("BERRY".to_string(), "blue".to_string()),
            ]
        );
    }
}
