use clap::Parser;

/// Run command lines as one batch on a long-lived shell session.
///
/// The lines execute in order inside a single `sh` (or `su`) process, so
/// state such as variables and the working directory carries from one line
/// to the next. The process exits with the batch's own exit code.
#[derive(Debug, Parser)]
#[command(name = "cmdmux", version)]
pub struct Cli {
    /// Run the batch through `su` instead of `sh`.
    #[arg(long)]
    pub root: bool,

    /// KEY=VALUE set in the session before any command runs. Repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Kill the session when the batch runs longer than this.
    #[arg(long = "timeout-ms", value_name = "MILLIS")]
    pub timeout_ms: Option<u64>,

    /// Print the result as one JSON object instead of raw lines.
    #[arg(long)]
    pub json: bool,

    /// Stream lines as they arrive instead of printing them at the end.
    #[arg(long, conflicts_with = "json")]
    pub no_capture: bool,

    /// Command lines executed as one batch, in order.
    #[arg(value_name = "CMDLINE", required = true, num_args = 1..)]
    pub commands: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}
