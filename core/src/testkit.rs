use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::process::ProcessSession;
use crate::process::UserKiller;
use crate::shell::LineReader;
use crate::shell::LineSeparator;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Observer handle for a [`mock_process_session`].
pub(crate) struct MockShellHandle {
    written: Arc<StdMutex<Vec<String>>>,
}

impl MockShellHandle {
    /// Every line the session wrote to the mock stdin, in order.
    pub(crate) fn written_lines(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

/// In-memory stand-in for a live shell process.
///
/// The mock reads stdin line by line and interprets a tiny command
/// language so tests can script exact stream behavior:
///
/// - `out <text>`: write `<text>` to stdout
/// - `err <text>`: write `<text>` to stderr
/// - `rc <n>`: report exit code `<n>` for the current command
/// - `sleep <ms>`: stall before reading further lines
/// - `die [n]`: end the process without answering anything else
/// - `exit`: end the process with code 0
///
/// A line `echo <m> $?` is answered with `<m> <rc>` on stdout and a line
/// `echo <m> >&2` with `<m>` on stderr, the way a real `sh` answers the
/// end-of-command markers. The kill switch ends the mock with code 137.
pub(crate) fn mock_process_session() -> (ProcessSession, MockShellHandle) {
    let (stdin_local, stdin_remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (stdout_local, stdout_remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr_local, stderr_remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, mut kill_rx) = mpsc::channel(1);
    let written = Arc::new(StdMutex::new(Vec::new()));

    let log = Arc::clone(&written);
    tokio::spawn(async move {
        let code = tokio::select! {
            code = run_script(stdin_remote, stdout_remote, stderr_remote, log) => code,
            _ = kill_rx.recv() => 137,
        };
        // Dropping the script future closed the stream write halves, so
        // readers see end of stream right around the exit code.
        let _ = exit_tx.send(Some(code));
    });

    let session = ProcessSession::from_parts(
        Box::new(stdin_local),
        Box::new(stdout_local),
        Box::new(stderr_local),
        exit_rx,
        kill_tx,
        Arc::new(UserKiller),
    );
    (session, MockShellHandle { written })
}

async fn run_script(
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    written: Arc<StdMutex<Vec<String>>>,
) -> i32 {
    let mut reader = LineReader::new(stdin, LineSeparator::Lf);
    let mut last_exit = 0i32;
    while let Some(line) = reader.next_line().await {
        written.lock().unwrap().push(line.clone());
        if line == "exit" {
            return 0;
        }
        if let Some(code) = line.strip_prefix("die") {
            return code.trim().parse().unwrap_or(1);
        }
        if let Some(marker) = line
            .strip_prefix("echo ")
            .and_then(|rest| rest.strip_suffix(" $?"))
        {
            write_text_line(&mut stdout, &format!("{marker} {last_exit}")).await;
            last_exit = 0;
        } else if let Some(marker) = line
            .strip_prefix("echo ")
            .and_then(|rest| rest.strip_suffix(" >&2"))
        {
            write_text_line(&mut stderr, marker).await;
        } else if let Some(text) = line.strip_prefix("out ") {
            write_text_line(&mut stdout, text).await;
        } else if let Some(text) = line.strip_prefix("err ") {
            write_text_line(&mut stderr, text).await;
        } else if let Some(code) = line.strip_prefix("rc ") {
            last_exit = code.trim().parse().unwrap_or(0);
        } else if let Some(ms) = line.strip_prefix("sleep ") {
            tokio::time::sleep(Duration::from_millis(ms.trim().parse().unwrap_or(0))).await;
        }
    }
    // Stdin closed without an explicit exit, like `sh` seeing end of input.
    0
}

async fn write_text_line(stream: &mut DuplexStream, text: &str) {
    let _ = stream.write_all(text.as_bytes()).await;
    let _ = stream.write_all(b"\n").await;
}
