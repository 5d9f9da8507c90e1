//! SSH leaf of the connection contract.
//!
//! One authenticated client per connection, one exec channel per command.

pub mod auth;
pub mod session;

pub use auth::{authenticate, AuthNegotiator, SshAuth};
pub use session::{
    ExecOutput, ExitOutcome, RusshTransport, SshClient, SshHandler, SshTarget, SshTransport,
};

use std::time::Duration;

use async_trait::async_trait;

use crate::connection::{
    Command, CommandResult, Connection, ConnectionDetails, ConnectionState,
};
use crate::error::ConnectionError;
use crate::retry::retry_if;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Bound on the TCP dial of each connect attempt.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// SSH connection manager.
pub struct SshConnection {
    transport: Box<dyn SshTransport>,
    client: Option<Box<dyn SshClient>>,
    state: ConnectionState,
}

impl SshConnection {
    pub fn new() -> Self {
        Self::with_transport(Box::new(RusshTransport))
    }

    pub fn with_transport(transport: Box<dyn SshTransport>) -> Self {
        Self {
            transport,
            client: None,
            state: ConnectionState::default(),
        }
    }
}

impl Default for SshConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn connect(&mut self, details: &ConnectionDetails) -> Result<(), ConnectionError> {
        if self.state.is_connected() {
            return Ok(());
        }
        if details.address.is_empty() {
            return Err(ConnectionError::InvalidConfig(
                "No address given for SSH connection".to_string(),
            ));
        }

        let auth = SshAuth::from_credentials(&details.credentials)?;
        let target = SshTarget {
            host: details.address.clone(),
            port: details.port.unwrap_or(DEFAULT_SSH_PORT),
            user: details.credentials.user.clone(),
            dial_timeout: DIAL_TIMEOUT,
        };

        log::info!(
            "Connecting to {}:{} as [{}] using {}",
            target.host,
            target.port,
            target.user,
            auth.kind()
        );

        let transport = &self.transport;
        let client = retry_if(
            || transport.open(&target, &auth),
            details.connect_attempts(),
            details.retry_tick(),
            ConnectionError::is_connection_refused,
        )
        .await?;

        self.client = Some(client);
        self.state.mark_connected();
        log::info!("SSH connected to {}:{}", target.host, target.port);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                log::warn!("Failed to close SSH client: {}", e);
            }
        }
        self.state.mark_disconnected();
        Ok(())
    }

    fn suspend_connection(&mut self) {
        self.state.suspend();
    }

    fn restore_connection(&mut self) {
        self.state.restore();
    }

    fn is_suspended(&self) -> bool {
        self.state.is_suspended()
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    async fn run_command(&mut self, command: &Command) -> Result<CommandResult, ConnectionError> {
        self.state.ensure_ready()?;
        let client = self.client.as_ref().ok_or(ConnectionError::NotConnected)?;

        log::debug!("Running SSH command [{}]", command.command);
        let output = client.exec(&command.command).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let rc = match output.exit {
            ExitOutcome::Status(code) => code as i32,
            other => {
                let reason = match other {
                    ExitOutcome::Signal(signal) => format!("terminated by signal {}", signal),
                    _ => "channel closed before an exit status was reported".to_string(),
                };
                if !command.ignore_rc {
                    return Err(ConnectionError::ExitStatusUnavailable {
                        command: command.command.clone(),
                        reason,
                    });
                }
                log::warn!(
                    "Command [{}] {}; reporting rc -1",
                    command.command,
                    reason
                );
                -1
            }
        };

        if !command.ignore_rc && rc != command.expected_rc {
            return Err(ConnectionError::UnexpectedExitCode {
                command: command.command.clone(),
                rc,
                expected: command.expected_rc,
                stdout,
                stderr,
            });
        }

        Ok(CommandResult { stdout, stderr, rc })
    }
}
