use async_trait::async_trait;
use std::io;
use std::process::Output;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::shell::LineSeparator;

use super::ProcessSession;

/// Binary used to reach the privileged process namespace.
const SU_BINARY: &str = "su";

/// Strategy for ending a shell process and whatever it spawned.
#[async_trait]
pub trait ProcessKiller: Send + Sync + std::fmt::Debug {
    async fn kill(&self, session: &ProcessSession);
}

/// Ends the process directly through the runtime kill handle.
#[derive(Debug, Default)]
pub struct UserKiller;

#[async_trait]
impl ProcessKiller for UserKiller {
    async fn kill(&self, session: &ProcessSession) {
        if !session.is_alive() {
            debug!("process has already ended, skipping kill");
            return;
        }
        session.kill_now();
    }
}

/// Sweeps the process and its children through a helper `su` shell.
///
/// An elevated shell can spawn workers that outlive a plain kill of the
/// shell itself, so the sweep lists every process whose parent is the
/// session and kills them by pid. Falls back to [`UserKiller`] behavior
/// when the helper shell is unavailable or reports an error.
#[derive(Debug, Default)]
pub struct SuKiller;

#[async_trait]
impl ProcessKiller for SuKiller {
    async fn kill(&self, session: &ProcessSession) {
        if !session.is_alive() {
            debug!("process has already ended, skipping kill");
            return;
        }
        let Some(pid) = session.pid() else {
            warn!("process id is unknown, falling back to a direct kill");
            session.kill_now();
            return;
        };
        let destroyed = match related_pids(pid).await {
            Ok(pids) => {
                debug!("related pids: {pids:?}");
                destroy_pids(&pids).await
            }
            Err(err) => {
                warn!("failed to list related processes: {err}");
                false
            }
        };
        if !destroyed {
            warn!("could not end the process tree via su, falling back to a direct kill");
            session.kill_now();
        }
    }
}

/// The session pid plus every pid `ps` reports as spawned by it.
async fn related_pids(parent_pid: u32) -> io::Result<Vec<u32>> {
    let mut pids = vec![parent_pid];
    let output = run_su(&["ps".to_string()]).await?;
    if output.status.success() {
        pids.extend(parse_child_pids(
            parent_pid,
            &String::from_utf8_lossy(&output.stdout),
        ));
    }
    Ok(pids)
}

async fn destroy_pids(pids: &[u32]) -> bool {
    let lines: Vec<String> = pids.iter().map(|pid| format!("kill {pid}")).collect();
    match run_su(&lines).await {
        Ok(output) => output.status.success(),
        Err(err) => {
            warn!("failed to run kill commands: {err}");
            false
        }
    }
}

/// Runs the given lines in a fresh `su` shell and waits for it to exit.
async fn run_su(lines: &[String]) -> io::Result<Output> {
    let mut child = Command::new(SU_BINARY)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let Some(mut stdin) = child.stdin.take() else {
        return Err(io::Error::other("stdin pipe is missing"));
    };
    let separator = LineSeparator::native().as_str().as_bytes();
    for line in lines {
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(separator).await?;
    }
    stdin.write_all(b"exit").await?;
    stdin.write_all(separator).await?;
    stdin.flush().await?;
    drop(stdin);
    child.wait_with_output().await
}

/// Picks the pids whose parent column matches `parent_pid`.
///
/// Expects `ps` output where the second column is the pid and the third
/// the parent pid. The first row is the column header and rows that do
/// not parse are skipped.
fn parse_child_pids(parent_pid: u32, ps_output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for row in ps_output.lines().skip(1) {
        let columns: Vec<&str> = row.split_whitespace().collect();
        if columns.len() < 3 {
            continue;
        }
        let (Ok(pid), Ok(ppid)) = (columns[1].parse::<u32>(), columns[2].parse::<u32>()) else {
            warn!("skipping unparsable ps row: {row:?}");
            continue;
        };
        if ppid == parent_pid {
            pids.push(pid);
        }
    }
    pids
}
