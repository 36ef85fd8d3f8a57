use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::trace;
use tracing::warn;

use super::Cmd;
use super::SinkEvent;
use super::exit_code;

/// What the stdout harvester brought home for one command.
#[derive(Debug)]
pub(crate) struct OutputCrop {
    pub(crate) buffer: Option<Vec<String>>,
    pub(crate) exit_code: i32,
    pub(crate) complete: bool,
}

/// What the stderr harvester brought home for one command.
#[derive(Debug)]
pub(crate) struct ErrorCrop {
    pub(crate) buffer: Option<Vec<String>>,
    pub(crate) complete: bool,
}

/// Consumes stdout lines until the command's marker passes by.
///
/// The marker line carries the exit code (`<marker> <code>`); content
/// glued to the front of it is still command output. A stream that ends
/// before the marker yields an incomplete crop.
pub(crate) async fn harvest_output(
    mut lines: broadcast::Receiver<String>,
    cmd: Cmd,
) -> OutputCrop {
    let mut buffer = cmd.output_buffer_enabled().then(Vec::new);
    loop {
        let line = match lines.recv().await {
            Ok(line) => line,
            Err(RecvError::Lagged(skipped)) => {
                warn!("output harvester lagged, {skipped} lines lost");
                continue;
            }
            Err(RecvError::Closed) => {
                finish_sink(cmd.output_sink(), false).await;
                return OutputCrop {
                    buffer,
                    exit_code: exit_code::INITIAL,
                    complete: false,
                };
            }
        };
        trace!("stdout: {line}");
        match line.find(cmd.marker()) {
            None => publish(&mut buffer, cmd.output_sink(), line).await,
            Some(index) => {
                if index > 0 {
                    let content = line[..index].to_string();
                    publish(&mut buffer, cmd.output_sink(), content).await;
                }
                let exit_code = parse_exit_code(&line[index..], cmd.marker());
                finish_sink(cmd.output_sink(), true).await;
                return OutputCrop {
                    buffer,
                    exit_code,
                    complete: true,
                };
            }
        }
    }
}

/// Consumes stderr lines until the command's marker passes by.
///
/// The stderr marker line is bare. Content in front of it loses its
/// trailing separator character and is kept, even when that leaves an
/// empty line.
pub(crate) async fn harvest_error(mut lines: broadcast::Receiver<String>, cmd: Cmd) -> ErrorCrop {
    let mut buffer = cmd.error_buffer_enabled().then(Vec::new);
    loop {
        let line = match lines.recv().await {
            Ok(line) => line,
            Err(RecvError::Lagged(skipped)) => {
                warn!("error harvester lagged, {skipped} lines lost");
                continue;
            }
            Err(RecvError::Closed) => {
                finish_sink(cmd.error_sink(), false).await;
                return ErrorCrop {
                    buffer,
                    complete: false,
                };
            }
        };
        trace!("stderr: {line}");
        match line.find(cmd.marker()) {
            None => publish(&mut buffer, cmd.error_sink(), line).await,
            Some(index) => {
                if index > 0 {
                    let content = drop_last_char(&line[..index]).to_string();
                    publish(&mut buffer, cmd.error_sink(), content).await;
                }
                finish_sink(cmd.error_sink(), true).await;
                return ErrorCrop {
                    buffer,
                    complete: true,
                };
            }
        }
    }
}

/// Exit code from a `<marker> <code>` sentinel. Anything that does not
/// parse as a base 10 integer counts as an exception.
fn parse_exit_code(sentinel: &str, marker: &str) -> i32 {
    sentinel
        .get(marker.len() + 1..)
        .and_then(|raw| raw.parse::<i32>().ok())
        .unwrap_or(exit_code::EXCEPTION)
}

fn drop_last_char(text: &str) -> &str {
    text.char_indices().last().map_or(text, |(index, _)| &text[..index])
}

async fn publish(
    buffer: &mut Option<Vec<String>>,
    sink: Option<&mpsc::Sender<SinkEvent>>,
    line: String,
) {
    if let Some(sink) = sink {
        if let Some(buffer) = buffer.as_mut() {
            buffer.push(line.clone());
        }
        let _ = sink.send(SinkEvent::Line(line)).await;
    } else if let Some(buffer) = buffer.as_mut() {
        buffer.push(line);
    }
}

async fn finish_sink(sink: Option<&mpsc::Sender<SinkEvent>>, complete: bool) {
    if let Some(sink) = sink {
        let event = if complete {
            SinkEvent::Completed
        } else {
            SinkEvent::Interrupted
        };
        let _ = sink.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn plain_cmd() -> Cmd {
        Cmd::builder(["true"]).build().unwrap()
    }

    fn drain(mut rx: mpsc::Receiver<SinkEvent>) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn collects_lines_until_the_output_marker() {
        let cmd = plain_cmd();
        let (tx, rx) = broadcast::channel(16);
        tx.send("straw".to_string()).unwrap();
        tx.send("berry".to_string()).unwrap();
        tx.send(format!("{} 0", cmd.marker())).unwrap();

        let crop = harvest_output(rx, cmd).await;
        assert!(crop.complete);
        assert_eq!(crop.exit_code, exit_code::OK);
        assert_eq!(crop.buffer, Some(vec!["straw".into(), "berry".into()]));
    }

    #[tokio::test]
    async fn content_glued_to_the_marker_is_kept() {
        let cmd = plain_cmd();
        let (tx, rx) = broadcast::channel(16);
        tx.send(format!("partial{} 7", cmd.marker())).unwrap();

        let crop = harvest_output(rx, cmd).await;
        assert!(crop.complete);
        assert_eq!(crop.exit_code, 7);
        assert_eq!(crop.buffer, Some(vec!["partial".into()]));
    }

    #[tokio::test]
    async fn marker_without_exit_code_is_an_exception() {
        let cmd = plain_cmd();
        let (tx, rx) = broadcast::channel(16);
        tx.send(cmd.marker().to_string()).unwrap();

        let crop = harvest_output(rx, cmd).await;
        assert!(crop.complete);
        assert_eq!(crop.exit_code, exit_code::EXCEPTION);
    }

    #[tokio::test]
    async fn unparsable_exit_code_is_an_exception() {
        let cmd = plain_cmd();
        let (tx, rx) = broadcast::channel(16);
        tx.send(format!("{} over9000", cmd.marker())).unwrap();

        let crop = harvest_output(rx, cmd).await;
        assert!(crop.complete);
        assert_eq!(crop.exit_code, exit_code::EXCEPTION);
    }

    #[tokio::test]
    async fn stream_end_before_the_marker_is_incomplete() {
        let cmd = plain_cmd();
        let (tx, rx) = broadcast::channel(16);
        tx.send("half".to_string()).unwrap();
        drop(tx);

        let crop = harvest_output(rx, cmd).await;
        assert!(!crop.complete);
        assert_eq!(crop.exit_code, exit_code::INITIAL);
        assert_eq!(crop.buffer, Some(vec!["half".into()]));
    }

    #[tokio::test]
    async fn disabled_buffer_still_feeds_the_sink() {
        let (sink_tx, sink_rx) = mpsc::channel(16);
        let cmd = Cmd::builder(["true"])
            .output_buffer(false)
            .output_sink(sink_tx)
            .build()
            .unwrap();
        let (tx, rx) = broadcast::channel(16);
        tx.send("live".to_string()).unwrap();
        tx.send(format!("{} 0", cmd.marker())).unwrap();

        let crop = harvest_output(rx, cmd).await;
        assert_eq!(crop.buffer, None);
        assert_eq!(
            drain(sink_rx),
            vec![SinkEvent::Line("live".into()), SinkEvent::Completed]
        );
    }

    #[tokio::test]
    async fn interrupted_stream_ends_the_sink_with_interrupted() {
        let (sink_tx, sink_rx) = mpsc::channel(16);
        let cmd = Cmd::builder(["true"]).output_sink(sink_tx).build().unwrap();
        let (tx, rx) = broadcast::channel(16);
        drop(tx);

        let crop = harvest_output(rx, cmd).await;
        assert!(!crop.complete);
        assert_eq!(drain(sink_rx), vec![SinkEvent::Interrupted]);
    }

    #[tokio::test]
    async fn error_lines_collect_until_the_bare_marker() {
        let cmd = plain_cmd();
        let (tx, rx) = broadcast::channel(16);
        tx.send("oops".to_string()).unwrap();
        tx.send(cmd.marker().to_string()).unwrap();

        let crop = harvest_error(rx, cmd).await;
        assert!(crop.complete);
        assert_eq!(crop.buffer, Some(vec!["oops".into()]));
    }

    #[tokio::test]
    async fn error_content_before_the_marker_loses_its_separator() {
        let cmd = plain_cmd();
        let (tx, rx) = broadcast::channel(16);
        tx.send(format!("warn!{}", cmd.marker())).unwrap();

        let crop = harvest_error(rx, cmd).await;
        assert!(crop.complete);
        assert_eq!(crop.buffer, Some(vec!["warn".into()]));
    }

    #[tokio::test]
    async fn single_char_error_content_becomes_an_empty_line() {
        let cmd = plain_cmd();
        let (tx, rx) = broadcast::channel(16);
        tx.send(format!("x{}", cmd.marker())).unwrap();

        let crop = harvest_error(rx, cmd).await;
        assert!(crop.complete);
        assert_eq!(crop.buffer, Some(vec![String::new()]));
    }

    #[tokio::test]
    async fn lagged_receiver_catches_up_and_completes() {
        let cmd = plain_cmd();
        let (tx, rx) = broadcast::channel(2);
        for n in 0..5 {
            tx.send(format!("line{n}")).unwrap();
        }
        tx.send(format!("{} 0", cmd.marker())).unwrap();

        let crop = harvest_output(rx, cmd).await;
        assert!(crop.complete);
        assert_eq!(crop.exit_code, exit_code::OK);
        assert_eq!(crop.buffer, Some(vec!["line4".into()]));
    }
}
