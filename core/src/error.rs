use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShellError>;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to spawn shell process `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write to shell stdin: {0}")]
    Write(#[source] std::io::Error),
    #[error("process stdio streams were already claimed")]
    StreamsClaimed,
    #[error("command requires at least one command line")]
    EmptyCommand,
    #[error("command processor is already attached to a shell session")]
    AlreadyAttached,
}

impl ShellError {
    pub(crate) fn spawn(program: &str, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.to_string(),
            source,
        }
    }
}
