use std::fmt;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::error::Result;
use crate::error::ShellError;

mod killer;

pub use killer::ProcessKiller;
pub use killer::SuKiller;
pub use killer::UserKiller;

/// Write half of the process stdin pipe.
pub type StdinWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// Read half of a process output pipe.
pub type StreamReader = Box<dyn AsyncRead + Send + Unpin>;

/// Spawns and tracks a single long-lived child process.
///
/// `open` hands out the running [`ProcessSession`] while the process is
/// alive and spawns a replacement once it has ended, so one value can
/// back any number of consecutive sessions.
#[derive(Debug)]
pub struct ShellProcess {
    command: Vec<String>,
    killer: Arc<dyn ProcessKiller>,
    session: Mutex<Option<ProcessSession>>,
}

impl ShellProcess {
    pub fn new(command: Vec<String>, killer: Arc<dyn ProcessKiller>) -> Self {
        Self {
            command,
            killer,
            session: Mutex::new(None),
        }
    }

    /// Returns the live session, spawning the process if necessary.
    pub async fn open(&self) -> Result<ProcessSession> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref()
            && session.is_alive()
        {
            trace!("process is still alive, reusing session");
            return Ok(session.clone());
        }
        let session = ProcessSession::spawn(&self.command, Arc::clone(&self.killer)).await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    pub async fn is_alive(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(ProcessSession::is_alive)
    }
}

struct SessionInner {
    pid: Option<u32>,
    stdin: StdMutex<Option<StdinWriter>>,
    stdout: StdMutex<Option<StreamReader>>,
    stderr: StdMutex<Option<StreamReader>>,
    exit_rx: watch::Receiver<Option<i32>>,
    kill_tx: mpsc::Sender<()>,
    killer: Arc<dyn ProcessKiller>,
}

/// Handle to a spawned process.
///
/// Clones share the underlying process. The stdio pipes can be claimed
/// once via the `take_*` accessors; the process itself is reaped by a
/// background task which publishes the exit code to every clone.
#[derive(Clone)]
pub struct ProcessSession {
    inner: Arc<SessionInner>,
}

impl ProcessSession {
    async fn spawn(command: &[String], killer: Arc<dyn ProcessKiller>) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            return Err(ShellError::EmptyCommand);
        };
        debug!("spawning process: {command:?}");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ShellError::spawn(program, source))?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or(ShellError::StreamsClaimed)?;
        let stdout = child.stdout.take().ok_or(ShellError::StreamsClaimed)?;
        let stderr = child.stderr.take().ok_or(ShellError::StreamsClaimed)?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.recv() => {
                    if let Err(err) = child.start_kill() {
                        warn!("failed to kill process {pid:?}: {err}");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => exit_code_from_status(status),
                Err(err) => {
                    warn!("failed to reap process {pid:?}: {err}");
                    -1
                }
            };
            debug!("process {pid:?} ended with exit code {code}");
            let _ = exit_tx.send(Some(code));
        });

        Ok(Self {
            inner: Arc::new(SessionInner {
                pid,
                stdin: StdMutex::new(Some(Box::new(stdin))),
                stdout: StdMutex::new(Some(Box::new(stdout))),
                stderr: StdMutex::new(Some(Box::new(stderr))),
                exit_rx,
                kill_tx,
                killer,
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        stdin: StdinWriter,
        stdout: StreamReader,
        stderr: StreamReader,
        exit_rx: watch::Receiver<Option<i32>>,
        kill_tx: mpsc::Sender<()>,
        killer: Arc<dyn ProcessKiller>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                pid: None,
                stdin: StdMutex::new(Some(stdin)),
                stdout: StdMutex::new(Some(stdout)),
                stderr: StdMutex::new(Some(stderr)),
                exit_rx,
                kill_tx,
                killer,
            }),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn is_alive(&self) -> bool {
        self.inner.exit_rx.borrow().is_none()
    }

    /// Claims the stdin pipe. Returns `None` once claimed.
    pub fn take_stdin(&self) -> Option<StdinWriter> {
        self.inner.stdin.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Claims the stdout pipe. Returns `None` once claimed.
    pub fn take_stdout(&self) -> Option<StreamReader> {
        self.inner
            .stdout
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    /// Claims the stderr pipe. Returns `None` once claimed.
    pub fn take_stderr(&self) -> Option<StreamReader> {
        self.inner
            .stderr
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    /// Waits for the process to end and returns its exit code.
    pub async fn wait_for(&self) -> i32 {
        let mut exit_rx = self.inner.exit_rx.clone();
        loop {
            if let Some(code) = *exit_rx.borrow_and_update() {
                return code;
            }
            if exit_rx.changed().await.is_err() {
                // The reaper task never drops the sender before publishing.
                return (*exit_rx.borrow()).unwrap_or(-1);
            }
        }
    }

    /// Ends the process via the configured killer and waits until it is gone.
    pub async fn destroy(&self) {
        let killer = Arc::clone(&self.inner.killer);
        killer.kill(self).await;
        self.wait_for().await;
    }

    /// Signals the reaper task to kill the process directly.
    pub(crate) fn kill_now(&self) {
        let _ = self.inner.kill_tx.try_send(());
    }
}

impl fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSession")
            .field("pid", &self.inner.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

fn exit_code_from_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
