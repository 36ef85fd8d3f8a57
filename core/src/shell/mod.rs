use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::trace;

use crate::error::Result;
use crate::error::ShellError;
use crate::process::ProcessSession;
use crate::process::ShellProcess;
use crate::process::StdinWriter;
use crate::process::StreamReader;

mod line_reader;

pub use line_reader::LineDecoder;
pub use line_reader::LineReader;
pub use line_reader::LineSeparator;

// Lines buffered per output stream before slow subscribers start lagging.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Line-oriented view of a [`ShellProcess`].
///
/// `open` is idempotent while the underlying process lives: it returns the
/// current [`ShellSession`] and only builds a fresh one after the previous
/// process ended.
#[derive(Debug)]
pub struct Shell {
    process: ShellProcess,
    separator: LineSeparator,
    session: Mutex<Option<ShellSession>>,
}

impl Shell {
    pub fn new(process: ShellProcess) -> Self {
        Self {
            process,
            separator: LineSeparator::native(),
            session: Mutex::new(None),
        }
    }

    pub async fn open(&self) -> Result<ShellSession> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref()
            && session.is_alive()
        {
            trace!("shell session is still alive, reusing it");
            return Ok(session.clone());
        }
        let process_session = self.process.open().await?;
        let session = ShellSession::new(process_session, self.separator)?;
        *guard = Some(session.clone());
        Ok(session)
    }

    pub async fn is_alive(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(ShellSession::is_alive)
    }
}

struct ShellSessionInner {
    process: ProcessSession,
    separator: LineSeparator,
    writer: Mutex<BufWriter<StdinWriter>>,
    // Keep-alive receivers. Never polled; they pin the channels open so
    // no line is lost between process output and the first subscriber.
    stdout_rx: broadcast::Receiver<String>,
    stderr_rx: broadcast::Receiver<String>,
    // Exit code recorded by `close`, which must write `exit` only once.
    exit: Mutex<Option<i32>>,
}

/// A running shell with line-based access to its three pipes.
///
/// Clones share the session. Output and error lines are fanned out to any
/// number of subscribers; a subscription starts at the live tail and ends
/// when the process closes the stream.
#[derive(Clone)]
pub struct ShellSession {
    inner: Arc<ShellSessionInner>,
}

impl ShellSession {
    pub(crate) fn new(process: ProcessSession, separator: LineSeparator) -> Result<Self> {
        let stdin = process.take_stdin().ok_or(ShellError::StreamsClaimed)?;
        let stdout = process.take_stdout().ok_or(ShellError::StreamsClaimed)?;
        let stderr = process.take_stderr().ok_or(ShellError::StreamsClaimed)?;
        let (stdout_tx, stdout_rx) = broadcast::channel(LINE_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = broadcast::channel(LINE_CHANNEL_CAPACITY);
        spawn_line_pump(stdout, separator, stdout_tx, "stdout");
        spawn_line_pump(stderr, separator, stderr_tx, "stderr");
        Ok(Self {
            inner: Arc::new(ShellSessionInner {
                process,
                separator,
                writer: Mutex::new(BufWriter::new(stdin)),
                stdout_rx,
                stderr_rx,
                exit: Mutex::new(None),
            }),
        })
    }

    /// Subscribes to stdout lines, starting at the live tail.
    pub fn output_lines(&self) -> broadcast::Receiver<String> {
        self.inner.stdout_rx.resubscribe()
    }

    /// Subscribes to stderr lines, starting at the live tail.
    pub fn error_lines(&self) -> broadcast::Receiver<String> {
        self.inner.stderr_rx.resubscribe()
    }

    /// Writes one line to the shell stdin, appending the session separator.
    pub async fn write_line(&self, line: &str, flush: bool) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(ShellError::Write)?;
        writer
            .write_all(self.inner.separator.as_str().as_bytes())
            .await
            .map_err(ShellError::Write)?;
        if flush {
            writer.flush().await.map_err(ShellError::Write)?;
        }
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.inner.process.is_alive()
    }

    /// Waits for the shell process to end and returns its exit code.
    pub async fn wait_for(&self) -> i32 {
        self.inner.process.wait_for().await
    }

    /// Kills the shell process without letting it run remaining input.
    pub async fn cancel(&self) {
        self.inner.process.destroy().await;
    }

    /// Asks the shell to exit and waits for the process to end.
    ///
    /// The `exit` command is written once no matter how many times or how
    /// concurrently this is called; every caller gets the same exit code. A
    /// failed write is logged and ignored since the process may already be
    /// gone, in which case the exit code tells the real story.
    pub async fn close(&self) -> i32 {
        let mut exit = self.inner.exit.lock().await;
        if let Some(code) = *exit {
            return code;
        }
        if let Err(err) = self.write_line("exit", true).await {
            debug!("failed to write exit command: {err}");
        }
        let code = self.inner.process.wait_for().await;
        *exit = Some(code);
        code
    }
}

impl fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSession")
            .field("process", &self.inner.process)
            .field("separator", &self.inner.separator)
            .finish()
    }
}

fn spawn_line_pump(
    stream: StreamReader,
    separator: LineSeparator,
    tx: broadcast::Sender<String>,
    name: &'static str,
) {
    tokio::spawn(async move {
        let mut reader = LineReader::new(stream, separator);
        while let Some(line) = reader.next_line().await {
            if tx.send(line).is_err() {
                // Every receiver is gone, including the session keep-alive.
                break;
            }
        }
        trace!("{name} pump ended");
    });
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast::error::RecvError;

    use crate::testkit::mock_process_session;

    use super::*;

    fn mock_session() -> (ShellSession, crate::testkit::MockShellHandle) {
        let (process, handle) = mock_process_session();
        let session = ShellSession::new(process, LineSeparator::Lf).unwrap();
        (session, handle)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flushed_lines_reach_the_process_and_come_back() {
        let (session, handle) = mock_session();
        let mut output = session.output_lines();

        session.write_line("out hello", true).await.unwrap();

        assert_eq!(output.recv().await.unwrap(), "hello");
        assert_eq!(handle.written_lines(), vec!["out hello".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unflushed_lines_stay_in_the_writer() {
        let (session, handle) = mock_session();
        let mut output = session.output_lines();

        session.write_line("out early", false).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(handle.written_lines(), Vec::<String>::new());

        session.write_line("out go", true).await.unwrap();
        assert_eq!(output.recv().await.unwrap(), "early");
        assert_eq!(output.recv().await.unwrap(), "go");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn output_and_error_streams_are_kept_apart() {
        let (session, _handle) = mock_session();
        let mut output = session.output_lines();
        let mut errors = session.error_lines();

        session.write_line("out plain", false).await.unwrap();
        session.write_line("err loud", true).await.unwrap();

        assert_eq!(output.recv().await.unwrap(), "plain");
        assert_eq!(errors.recv().await.unwrap(), "loud");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscriptions_end_when_the_process_ends() {
        let (session, _handle) = mock_session();
        let mut output = session.output_lines();

        session.write_line("exit", true).await.unwrap();

        assert_eq!(session.wait_for().await, 0);
        assert!(matches!(output.recv().await, Err(RecvError::Closed)));
        assert!(!session.is_alive());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_subscribers_start_at_the_tail() {
        let (session, _handle) = mock_session();
        let mut first = session.output_lines();

        session.write_line("out one", true).await.unwrap();
        assert_eq!(first.recv().await.unwrap(), "one");

        let mut second = session.output_lines();
        session.write_line("out two", true).await.unwrap();
        assert_eq!(second.recv().await.unwrap(), "two");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_writes_exit_once_and_shares_the_code() {
        let (session, handle) = mock_session();

        let mut closers = Vec::new();
        for _ in 0..16 {
            let session = session.clone();
            closers.push(tokio::spawn(async move { session.close().await }));
        }
        for closer in closers {
            assert_eq!(closer.await.unwrap(), 0);
        }
        assert_eq!(
            handle
                .written_lines()
                .iter()
                .filter(|line| line.as_str() == "exit")
                .count(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_after_death_returns_the_recorded_code() {
        let (session, _handle) = mock_session();

        session.write_line("die 9", true).await.unwrap();
        assert_eq!(session.wait_for().await, 9);
        assert_eq!(session.close().await, 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_kills_the_process() {
        let (session, _handle) = mock_session();
        let mut output = session.output_lines();

        session.cancel().await;

        assert!(!session.is_alive());
        assert_eq!(session.wait_for().await, 137);
        assert!(matches!(output.recv().await, Err(RecvError::Closed)));
    }
}
