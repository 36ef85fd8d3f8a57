use cmdmux_core::cmd::SinkEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SINK_CAPACITY: usize = 256;

/// Expands to an early return when the host has no usable `sh`, so the
/// process-spawning tests degrade to skips on exotic build machines.
#[macro_export]
macro_rules! skip_if_no_sh {
    () => {
        $crate::skip_if_no_sh!(())
    };
    ($ret:expr) => {
        if !$crate::sh_available() {
            eprintln!("skipping test: no usable `sh` binary on this host");
            return $ret;
        }
    };
}

pub fn sh_available() -> bool {
    if std::env::var_os("CMDMUX_SKIP_SHELL_TESTS").is_some() {
        return false;
    }
    std::process::Command::new("sh")
        .arg("-c")
        .arg("true")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// A sink sender plus a task collecting everything sent into it.
///
/// The collector resolves once every sender clone is gone. A `CmdResult`
/// keeps its `Cmd` and the `Cmd` keeps a sender clone, so drop the result
/// before awaiting the collector.
pub fn sink_channel() -> (mpsc::Sender<SinkEvent>, JoinHandle<Vec<SinkEvent>>) {
    let (tx, mut rx) = mpsc::channel(SINK_CAPACITY);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    (tx, collector)
}
