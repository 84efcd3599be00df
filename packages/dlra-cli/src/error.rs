// Error types shared by the remote helper modules
use thiserror::Error;

/// Result type for remote helper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while serving a remote-helper invocation
#[derive(Debug, Error)]
pub enum Error {
    /// Remote URL or parameter combination cannot be used
    #[error("configuration error: {0}")]
    Config(String),

    /// An external command exited unsuccessfully
    #[error("command `{command}` failed with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    /// The remote deposit is inconsistent or could not be written
    #[error("deposit error: {0}")]
    Deposit(String),

    /// Unexpected input on the remote-helper line protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credential lookup, prompt or storage failed
    #[error("credential error: {0}")]
    Credential(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn deposit(msg: impl Into<String>) -> Self {
        Error::Deposit(msg.into())
    }
}
