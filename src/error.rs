//! Connection error types

use std::error::Error as _;
use std::io;

use thiserror::Error;

use crate::retry::RetriesExhausted;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid connection configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection is not connected")]
    NotConnected,

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(
        "Command [{command}] exited with rc [{rc}], expected [{expected}], stderr [{stderr}], stdout [{stdout}]"
    )]
    UnexpectedExitCode {
        command: String,
        rc: i32,
        expected: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Command [{command}] finished without an exit status: {reason}")]
    ExitStatusUnavailable { command: String, reason: String },

    #[error(transparent)]
    RetriesExhausted(#[from] RetriesExhausted),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Connection refused, timeouts and the WinRM "invalid content type" symptom.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectionError::ConnectionRefused(_) | ConnectionError::Timeout(_) => true,
            ConnectionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut
            ),
            other => other.to_string().contains("invalid content type"),
        }
    }

    pub fn is_connection_refused(&self) -> bool {
        match self {
            ConnectionError::ConnectionRefused(_) => true,
            ConnectionError::Io(e) => e.kind() == io::ErrorKind::ConnectionRefused,
            _ => false,
        }
    }
}

impl From<russh::Error> for ConnectionError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                ConnectionError::ConnectionRefused(e.to_string())
            }
            russh::Error::IO(e) => ConnectionError::Io(e),
            other => ConnectionError::Transport(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for ConnectionError {
    fn from(err: russh::keys::Error) -> Self {
        ConnectionError::KeyError(err.to_string())
    }
}

impl From<reqwest::Error> for ConnectionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ConnectionError::Timeout(err.to_string());
        }
        if err.is_connect() {
            let mut source = err.source();
            while let Some(cause) = source {
                if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                    if io_err.kind() == io::ErrorKind::ConnectionRefused {
                        return ConnectionError::ConnectionRefused(err.to_string());
                    }
                    if io_err.kind() == io::ErrorKind::TimedOut {
                        return ConnectionError::Timeout(err.to_string());
                    }
                }
                source = cause.source();
            }
            return ConnectionError::ConnectionFailed(err.to_string());
        }
        ConnectionError::Transport(err.to_string())
    }
}

// Make ConnectionError serializable for the C facade's JSON replies
impl serde::Serialize for ConnectionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
