mod cli;

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use cmdmux_core::CmdShell;
use cmdmux_core::cmd::Cmd;
use cmdmux_core::cmd::CmdBuilder;
use cmdmux_core::cmd::CmdResult;
use cmdmux_core::cmd::SinkEvent;
use cmdmux_core::cmd::exit_code;

pub use cli::Cli;

const SINK_CHANNEL_CAPACITY: usize = 256;
const FAILURE_EXIT_CODE: i32 = 1;
// 128 + SIGINT, what an interrupted shell command would report itself.
const CTRL_C_EXIT_CODE: i32 = 130;

/// Runs the parsed invocation and returns the process exit code.
pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    let Cli {
        root,
        env,
        timeout_ms,
        json,
        no_capture,
        commands,
    } = cli;

    let mut shell_builder = CmdShell::builder().root(root);
    for (key, value) in env {
        shell_builder = shell_builder.shell_environment(key, value);
    }
    let shell = shell_builder.build();

    let mut builder = Cmd::builder(commands);
    if let Some(millis) = timeout_ms {
        builder = builder.timeout(Duration::from_millis(millis));
    }

    tokio::select! {
        code = run_batch(&shell, builder, json, no_capture) => code,
        _ = wait_for_ctrl_c() => {
            shell.cancel().await;
            Ok(CTRL_C_EXIT_CODE)
        }
    }
}

async fn run_batch(
    shell: &CmdShell,
    builder: CmdBuilder,
    json: bool,
    no_capture: bool,
) -> anyhow::Result<i32> {
    if no_capture {
        return stream_batch(shell, builder).await;
    }
    let result = builder.submit_once(shell).await?;
    debug!("batch finished with exit code {}", result.exit_code());
    print_result(&result, json);
    Ok(process_exit_code(result.exit_code()))
}

async fn stream_batch(shell: &CmdShell, builder: CmdBuilder) -> anyhow::Result<i32> {
    let (output_sink, output_printer) = spawn_line_printer(false);
    let (error_sink, error_printer) = spawn_line_printer(true);
    let result = builder
        .output_buffer(false)
        .error_buffer(false)
        .output_sink(output_sink)
        .error_sink(error_sink)
        .submit_once(shell)
        .await?;
    let code = result.exit_code();
    debug!("batch finished with exit code {code}");
    // The result keeps the sink senders alive through its `Cmd`; dropping
    // it lets the printer tasks run to the end of their channels.
    drop(result);
    let _ = output_printer.await;
    let _ = error_printer.await;
    Ok(process_exit_code(code))
}

fn spawn_line_printer(to_stderr: bool) -> (mpsc::Sender<SinkEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let SinkEvent::Line(line) = event {
                if to_stderr {
                    eprintln!("{line}");
                } else {
                    println!("{line}");
                }
            }
        }
    });
    (tx, printer)
}

fn print_result(result: &CmdResult, json: bool) {
    if json {
        let payload = serde_json::json!({
            "exit_code": result.exit_code(),
            "success": result.is_success(),
            "output": result.output(),
            "errors": result.errors(),
        });
        println!("{payload}");
        return;
    }
    for line in result.output().unwrap_or_default() {
        println!("{line}");
    }
    for line in result.errors().unwrap_or_default() {
        eprintln!("{line}");
    }
}

/// Native codes pass through; the engine's negative codes become a
/// diagnostic plus a plain failure.
fn process_exit_code(code: i32) -> i32 {
    if code >= 0 {
        return code;
    }
    let reason = match code {
        exit_code::TIMEOUT => "the command timed out and the shell was killed",
        exit_code::SHELL_DIED => "the shell died before the command completed",
        exit_code::EXCEPTION => "the command completion could not be read",
        _ => "the command failed inside the engine",
    };
    eprintln!("cmdmux: {reason}");
    FAILURE_EXIT_CODE
}

async fn wait_for_ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler on this platform; wait forever instead of
        // treating the failure as an interrupt.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn native_codes_pass_through() {
        assert_eq!(process_exit_code(0), 0);
        assert_eq!(process_exit_code(7), 7);
        assert_eq!(process_exit_code(255), 255);
    }

    #[test]
    fn engine_codes_become_a_plain_failure() {
        assert_eq!(process_exit_code(exit_code::TIMEOUT), FAILURE_EXIT_CODE);
        assert_eq!(process_exit_code(exit_code::SHELL_DIED), FAILURE_EXIT_CODE);
        assert_eq!(process_exit_code(exit_code::EXCEPTION), FAILURE_EXIT_CODE);
    }
}
