//! Connection contract shared by the SSH and WinRM leaves.

mod models;
mod state;

pub use models::{
    Command, CommandResult, ConnectionDetails, ConnectionType, Credentials, WinRmConnectionData,
    WinRmProtocol, FORCE_COMMAND_SPLIT,
};
pub(crate) use models::host_port;
pub(crate) use state::ConnectionState;

use async_trait::async_trait;

use crate::error::ConnectionError;
use crate::ssh::SshConnection;
use crate::winrm::WinRmConnection;

mod sealed {
    pub trait Sealed {}

    impl Sealed for crate::ssh::SshConnection {}
    impl Sealed for crate::winrm::WinRmConnection {}
}

/// A remote command session.
///
/// Implemented only by [`SshConnection`] and [`WinRmConnection`]; obtain one
/// through [`ConnectionFactory`] or [`new_connection`].
#[async_trait]
pub trait Connection: sealed::Sealed + Send {
    /// Open the transport. Succeeds without doing anything when already connected.
    async fn connect(&mut self, details: &ConnectionDetails) -> Result<(), ConnectionError>;

    /// Release the transport. Close failures are logged, never returned.
    async fn disconnect(&mut self) -> Result<(), ConnectionError>;

    /// Block command execution without dropping the transport.
    fn suspend_connection(&mut self);

    fn restore_connection(&mut self);

    fn is_suspended(&self) -> bool;

    fn is_connected(&self) -> bool;

    async fn run_command(&mut self, command: &Command) -> Result<CommandResult, ConnectionError>;
}

/// Build a disconnected connection of the requested kind.
pub fn new_connection(connection_type: ConnectionType) -> Box<dyn Connection> {
    match connection_type {
        ConnectionType::Ssh => Box::new(SshConnection::new()),
        ConnectionType::WinRm => Box::new(WinRmConnection::new()),
    }
}

/// Creates connections for higher level flows.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, connection_type: ConnectionType) -> Box<dyn Connection>;
}

/// Factory producing the production SSH/WinRM connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnectionFactory;

impl ConnectionFactory for DefaultConnectionFactory {
    fn create(&self, connection_type: ConnectionType) -> Box<dyn Connection> {
        new_connection(connection_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_requires_connection_on_both_leaves() {
        for kind in [ConnectionType::Ssh, ConnectionType::WinRm] {
            let mut conn = DefaultConnectionFactory.create(kind);
            assert!(!conn.is_connected());
            let err = conn.run_command(&Command::new("hostname")).await.unwrap_err();
            assert!(matches!(err, ConnectionError::NotConnected));
            assert_eq!(err.to_string(), "Connection is not connected");
        }
    }

    #[tokio::test]
    async fn test_disconnect_when_disconnected_is_noop() {
        for kind in [ConnectionType::Ssh, ConnectionType::WinRm] {
            let mut conn = new_connection(kind);
            assert!(conn.disconnect().await.is_ok());
            assert!(!conn.is_connected());
        }
    }
}
