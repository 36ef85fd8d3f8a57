use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::error::ShellError;
use crate::shell::ShellSession;

use super::Cmd;
use super::CmdResult;
use super::ErrorCrop;
use super::OutputCrop;
use super::exit_code;
use super::harvest_error;
use super::harvest_output;

/// Serializes [`Cmd`] execution against one [`ShellSession`].
///
/// Commands submitted while another runs wait their turn; the shell sees
/// one command batch at a time, which is what makes the marker protocol
/// sound. A negative exit code ends the session: the running command kills
/// the shell and every queued command resolves with
/// [`exit_code::SHELL_DIED`], as do all later submissions.
#[derive(Debug, Clone)]
pub struct CmdProcessor {
    shared: Arc<Shared>,
}

impl CmdProcessor {
    pub fn new() -> Self {
        let (idle_tx, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    dead: false,
                }),
                notify: Notify::new(),
                idle_tx,
                attached: AtomicBool::new(false),
            }),
        }
    }

    /// Queues a command. The command is enqueued before this returns, so
    /// submission order is execution order; the returned future resolves
    /// once the command has a result.
    pub fn submit(&self, cmd: Cmd) -> CmdSubmission {
        let fallback = cmd.clone();
        let (promise, answer) = oneshot::channel();
        {
            let mut state = self.shared.lock_queue();
            if state.dead {
                debug!("processor is dead, answering with SHELL_DIED right away");
                let _ = promise.send(CmdResult::shell_died(cmd));
            } else {
                state.items.push_back(QueueMsg::Cmd(PendingCmd { cmd, promise }));
                self.shared.notify.notify_one();
            }
        }
        CmdSubmission {
            fallback: Some(fallback),
            answer,
        }
    }

    /// Starts working the queue against `session`. A processor serves one
    /// session for its whole life, so this can be called only once.
    pub fn attach(&self, session: ShellSession) -> Result<()> {
        if self.shared.attached.swap(true, Ordering::SeqCst) {
            return Err(ShellError::AlreadyAttached);
        }
        let watcher = {
            let shared = Arc::clone(&self.shared);
            let session = session.clone();
            tokio::spawn(async move {
                let code = session.wait_for().await;
                debug!("session ended with exit code {code}, scheduling processor shutdown");
                shared.push_poison_back();
            })
        };
        tokio::spawn(run_worker(Arc::clone(&self.shared), session, watcher));
        Ok(())
    }

    /// Watch that flips to `false` while a command is being worked and
    /// back to `true` when the queue runs dry. Ends on `true` after the
    /// processor shuts down.
    pub fn idle(&self) -> watch::Receiver<bool> {
        self.shared.idle_tx.subscribe()
    }
}

impl Default for CmdProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending answer for a submitted [`Cmd`].
///
/// Resolves with [`exit_code::SHELL_DIED`] if the processor disappears
/// without answering.
#[derive(Debug)]
pub struct CmdSubmission {
    fallback: Option<Cmd>,
    answer: oneshot::Receiver<CmdResult>,
}

impl Future for CmdSubmission {
    type Output = CmdResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.answer).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.fallback = None;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => match self.fallback.take() {
                Some(cmd) => Poll::Ready(CmdResult::shell_died(cmd)),
                // Polled again after completion; stay quiet.
                None => Poll::Pending,
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

struct PendingCmd {
    cmd: Cmd,
    promise: oneshot::Sender<CmdResult>,
}

enum QueueMsg {
    Cmd(PendingCmd),
    Poison,
}

struct QueueState {
    items: VecDeque<QueueMsg>,
    dead: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    notify: Notify,
    idle_tx: watch::Sender<bool>,
    attached: AtomicBool,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn next_msg(&self) -> QueueMsg {
        loop {
            let popped = self.lock_queue().items.pop_front();
            match popped {
                Some(msg) => return msg,
                None => self.notify.notified().await,
            }
        }
    }

    fn push_poison_back(&self) {
        self.lock_queue().items.push_back(QueueMsg::Poison);
        self.notify.notify_one();
    }

    fn push_poison_front(&self) {
        self.lock_queue().items.push_front(QueueMsg::Poison);
        self.notify.notify_one();
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("attached", &self.attached)
            .finish()
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    session: ShellSession,
    watcher: tokio::task::JoinHandle<()>,
) {
    loop {
        match shared.next_msg().await {
            QueueMsg::Poison => break,
            QueueMsg::Cmd(pending) => {
                shared.idle_tx.send_replace(false);
                process_one(&shared, &session, pending).await;
            }
        }
    }
    // The queue is closed for good: answer everything still in it and
    // turn away future submissions under the same lock.
    let leftovers = {
        let mut state = shared.lock_queue();
        state.dead = true;
        std::mem::take(&mut state.items)
    };
    for msg in leftovers {
        if let QueueMsg::Cmd(pending) = msg {
            let _ = pending.promise.send(CmdResult::shell_died(pending.cmd));
        }
    }
    shared.idle_tx.send_replace(true);
    watcher.abort();
    debug!("command processor ended");
}

async fn process_one(shared: &Shared, session: &ShellSession, pending: PendingCmd) {
    let PendingCmd { cmd, promise } = pending;
    debug!("processing command: {:?}", cmd.commands());

    // Harvesters must be listening before the first byte is written, or
    // a fast shell could answer into the void.
    let output_task = tokio::spawn(harvest_output(session.output_lines(), cmd.clone()));
    let error_task = tokio::spawn(harvest_error(session.error_lines(), cmd.clone()));

    let timeout = cmd.timeout();
    let result = match write_command(session, &cmd).await {
        Err(err) => {
            warn!("failed to write command to the shell: {err}");
            // The harvester tasks end on their own once the streams do.
            CmdResult::shell_died(cmd)
        }
        Ok(()) => {
            let crops = async move {
                let output = output_task.await.ok();
                let errors = error_task.await.ok();
                (output, errors)
            };
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, crops).await {
                    Ok((output, errors)) => merge_crops(cmd, output, errors),
                    Err(_) => {
                        warn!("command timed out after {limit:?}");
                        build_result(cmd, exit_code::TIMEOUT, None, None)
                    }
                },
                None => {
                    let (output, errors) = crops.await;
                    merge_crops(cmd, output, errors)
                }
            }
        }
    };

    if result.exit_code() < exit_code::OK {
        debug!(
            "exit code {} is fatal, poisoning the queue and killing the session",
            result.exit_code()
        );
        shared.push_poison_front();
        session.cancel().await;
    }
    let _ = promise.send(result);
    let empty = shared.lock_queue().items.is_empty();
    shared.idle_tx.send_replace(empty);
}

async fn write_command(session: &ShellSession, cmd: &Cmd) -> Result<()> {
    for line in cmd.commands() {
        session.write_line(line, false).await?;
    }
    session
        .write_line(&format!("echo {} $?", cmd.marker()), false)
        .await?;
    session
        .write_line(&format!("echo {} >&2", cmd.marker()), true)
        .await
}

fn merge_crops(cmd: Cmd, output: Option<OutputCrop>, errors: Option<ErrorCrop>) -> CmdResult {
    let (mut exit_code, output_buffer, output_complete) = match output {
        Some(crop) => (crop.exit_code, crop.buffer, crop.complete),
        None => (exit_code::INITIAL, None, false),
    };
    let (error_buffer, errors_complete) = match errors {
        Some(crop) => (crop.buffer, crop.complete),
        None => (None, false),
    };
    if !output_complete || !errors_complete {
        exit_code = exit_code::SHELL_DIED;
    }
    build_result(cmd, exit_code, output_buffer, error_buffer)
}

/// A missing buffer on an enabled side becomes an empty one, so callers
/// can tell "buffer off" (`None`) apart from "nothing arrived".
fn build_result(
    cmd: Cmd,
    exit_code: i32,
    output: Option<Vec<String>>,
    errors: Option<Vec<String>>,
) -> CmdResult {
    let output = output.or_else(|| cmd.output_buffer_enabled().then(Vec::new));
    let errors = errors.or_else(|| cmd.error_buffer_enabled().then(Vec::new));
    CmdResult::new(cmd, exit_code, output, errors)
}
