//! WinRM leaf of the connection contract.
//!
//! A connection owns one shell client and one remote `cmd` shell; every
//! command runs as a PowerShell process inside that shell.

pub mod client;
pub mod encoding;
pub mod executor;
pub mod ntlm;
pub mod soap;

pub use client::{
    Endpoint, HttpTransport, RemoteProcess, RemoteShell, ShellClient, WinRmClient, WinRmTransport,
};
pub use executor::{run_and_collect, PowerShellExecutor, WinRmExecutor};

use std::time::Duration;

use async_trait::async_trait;

use crate::connection::{
    Command, CommandResult, Connection, ConnectionDetails, ConnectionState, WinRmProtocol,
};
use crate::error::ConnectionError;
use crate::retry::{retry, retry_if};

pub const DEFAULT_WINRM_HTTPS_PORT: u16 = 5986;
pub const DEFAULT_WINRM_HTTP_PORT: u16 = 5985;

/// HTTP timeout for each WinRM request.
pub const WINRM_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// WinRM connection manager.
pub struct WinRmConnection {
    transport: Box<dyn WinRmTransport>,
    executor: Box<dyn WinRmExecutor>,
    client: Option<Box<dyn ShellClient>>,
    shell: Option<Box<dyn RemoteShell>>,
    state: ConnectionState,
}

impl WinRmConnection {
    pub fn new() -> Self {
        Self::with_parts(Box::new(HttpTransport), Box::new(PowerShellExecutor))
    }

    pub fn with_parts(transport: Box<dyn WinRmTransport>, executor: Box<dyn WinRmExecutor>) -> Self {
        Self {
            transport,
            executor,
            client: None,
            shell: None,
            state: ConnectionState::default(),
        }
    }

    async fn endpoint(details: &ConnectionDetails) -> Result<Endpoint, ConnectionError> {
        let data = details.connection_data.clone().unwrap_or_default();
        let https = data.protocol == WinRmProtocol::Https;
        let default_port = if https {
            DEFAULT_WINRM_HTTPS_PORT
        } else {
            DEFAULT_WINRM_HTTP_PORT
        };

        let ca_cert = match data.certificate.filter(|p| !p.as_os_str().is_empty()) {
            Some(path) => Some(tokio::fs::read(&path).await.map_err(|e| {
                ConnectionError::InvalidConfig(format!(
                    "Failed to read certificate {}: {}",
                    path.display(),
                    e
                ))
            })?),
            None => None,
        };

        Ok(Endpoint {
            host: details.address.clone(),
            port: details.port.unwrap_or(default_port),
            https,
            insecure: data.trust_certificate,
            ca_cert,
            timeout: WINRM_REQUEST_TIMEOUT,
        })
    }
}

impl Default for WinRmConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for WinRmConnection {
    async fn connect(&mut self, details: &ConnectionDetails) -> Result<(), ConnectionError> {
        if self.state.is_connected() {
            return Ok(());
        }
        if details.address.is_empty() {
            return Err(ConnectionError::InvalidConfig(
                "No address given for WinRM connection".to_string(),
            ));
        }

        let endpoint = Self::endpoint(details).await?;
        log::info!(
            "Connecting to {} as [{}]",
            endpoint.url(),
            details.credentials.user
        );

        let transport = &self.transport;
        let credentials = &details.credentials;
        let client = retry_if(
            || transport.create_client(&endpoint, credentials),
            details.connect_attempts(),
            details.retry_tick(),
            ConnectionError::is_transient,
        )
        .await?;

        let shell = retry_if(
            || client.create_shell(),
            details.connect_attempts(),
            details.retry_tick(),
            ConnectionError::is_transient,
        )
        .await?;

        self.client = Some(client);
        self.shell = Some(shell);
        self.state.mark_connected();
        log::info!("WinRM connected to {}", endpoint.url());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        if let Some(shell) = self.shell.take() {
            if let Err(e) = shell.close().await {
                log::warn!("Failed to close WinRM shell: {}", e);
            }
        }
        self.client = None;
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
        let shell = self.shell.as_deref().ok_or(ConnectionError::NotConnected)?;
        let executor = &self.executor;

        retry(
            || executor.execute(shell, command),
            command.retry_count,
            command.retry_delay(),
            &command.retry_on_errors,
        )
        .await
    }
}
