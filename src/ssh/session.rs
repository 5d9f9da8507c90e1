use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::*;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::auth::{self, AuthNegotiator, SshAuth};
use crate::error::ConnectionError;

/// Where to dial and who to log in as.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub dial_timeout: Duration,
}

/// How a remote command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Status(u32),
    Signal(String),
    /// Channel closed without the server reporting either
    Unknown,
}

/// Raw output of one exec channel.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: ExitOutcome,
}

/// Opens authenticated SSH clients.
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn open(
        &self,
        target: &SshTarget,
        auth: &SshAuth,
    ) -> Result<Box<dyn SshClient>, ConnectionError>;
}

/// An authenticated SSH client; one channel per exec.
#[async_trait]
pub trait SshClient: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput, ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Minimal SSH client handler.
pub struct SshHandler;

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not verified for remote command execution targets.
        log::warn!("Accepting server key without verification");
        Ok(true)
    }
}

#[async_trait]
impl AuthNegotiator for client::Handle<SshHandler> {
    async fn password(&mut self, user: &str, password: &str) -> Result<bool, ConnectionError> {
        let result = self.authenticate_password(user, password).await?;
        Ok(result.success())
    }

    async fn public_key(&mut self, user: &str, key: PrivateKey) -> Result<bool, ConnectionError> {
        let hash_alg = self.best_supported_rsa_hash().await?.flatten();
        let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
        let result = self.authenticate_publickey(user, key).await?;
        Ok(result.success())
    }
}

/// russh backed transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshTransport;

#[async_trait]
impl SshTransport for RusshTransport {
    async fn open(
        &self,
        target: &SshTarget,
        auth: &SshAuth,
    ) -> Result<Box<dyn SshClient>, ConnectionError> {
        let addr = crate::connection::host_port(&target.host, target.port);

        let stream = tokio::time::timeout(target.dial_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| {
                ConnectionError::Timeout(format!(
                    "Dial to {} timed out after {:?}",
                    addr, target.dial_timeout
                ))
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    ConnectionError::ConnectionRefused(format!("{}: {}", addr, e))
                }
                std::io::ErrorKind::TimedOut => {
                    ConnectionError::Timeout(format!("{}: {}", addr, e))
                }
                _ => ConnectionError::ConnectionFailed(format!("{}: {}", addr, e)),
            })?;

        let mut handle =
            client::connect_stream(Arc::new(client::Config::default()), stream, SshHandler)
                .await?;
        log::debug!("SSH handshake with {} completed", addr);

        let accepted = auth::authenticate(&mut handle, &target.user, auth).await?;
        if !accepted {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "{} authentication for user [{}] rejected by {}",
                auth.kind(),
                target.user,
                addr
            )));
        }

        Ok(Box::new(RusshClient {
            handle: Mutex::new(handle),
        }))
    }
}

struct RusshClient {
    handle: Mutex<client::Handle<SshHandler>>,
}

#[async_trait]
impl SshClient for RusshClient {
    async fn exec(&self, command: &str) -> Result<ExecOutput, ConnectionError> {
        let mut channel = {
            let handle = self.handle.lock().await;
            handle.channel_open_session().await?
        };
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit = ExitOutcome::Unknown;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit = ExitOutcome::Status(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    exit = ExitOutcome::Signal(format!("{:?}", signal_name))
                }
                _ => {}
            }
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            exit,
        })
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let handle = self.handle.lock().await;
        handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}
