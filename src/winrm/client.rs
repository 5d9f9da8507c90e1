//! WinRM shell client over HTTP(S) with NTLM authentication.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use tokio::sync::{mpsc, oneshot};

use super::ntlm::NtlmCredentials;
use super::soap::{self, EnvelopeConfig, SOAP_CONTENT_TYPE};
use crate::connection::{host_port, Credentials};
use crate::error::ConnectionError;

/// Buffered output chunks per stream before the pump waits on the reader.
const STREAM_BUFFER: usize = 64;

/// Where the WinRM listener lives.
#[derive(Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub https: bool,
    /// Skip server certificate validation
    pub insecure: bool,
    /// Extra PEM root certificate
    pub ca_cert: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}/wsman", scheme, host_port(&self.host, self.port))
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url())
            .field("insecure", &self.insecure)
            .field("ca_cert", &self.ca_cert.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A started remote process. Both streams close once the exit code is known.
pub struct RemoteProcess {
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub stderr: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<Result<i32, ConnectionError>>,
}

/// Builds shell clients for an endpoint.
#[async_trait]
pub trait WinRmTransport: Send + Sync {
    async fn create_client(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Box<dyn ShellClient>, ConnectionError>;
}

#[async_trait]
pub trait ShellClient: Send + Sync {
    async fn create_shell(&self) -> Result<Box<dyn RemoteShell>, ConnectionError>;
}

/// A remote `cmd` shell able to start processes.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn execute(&self, command_line: &str) -> Result<RemoteProcess, ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// reqwest + NTLM backed transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransport;

#[async_trait]
impl WinRmTransport for HttpTransport {
    async fn create_client(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Box<dyn ShellClient>, ConnectionError> {
        Ok(Box::new(WinRmClient::new(endpoint, credentials)?))
    }
}

/// Cheap to clone; clones share the HTTP connection pool.
#[derive(Clone)]
pub struct WinRmClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    ntlm: NtlmCredentials,
    envelopes: EnvelopeConfig,
}

impl WinRmClient {
    pub fn new(endpoint: &Endpoint, credentials: &Credentials) -> Result<Self, ConnectionError> {
        if credentials.user.is_empty() {
            return Err(ConnectionError::InvalidConfig(
                "No user given for WinRM connection".to_string(),
            ));
        }
        let password = credentials
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                ConnectionError::InvalidConfig(format!(
                    "No password given for WinRM user [{}]",
                    credentials.user
                ))
            })?;

        let mut builder = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .danger_accept_invalid_certs(endpoint.insecure);
        if let Some(pem) = &endpoint.ca_cert {
            let cert = reqwest::Certificate::from_pem(pem).map_err(|e| {
                ConnectionError::InvalidConfig(format!("Invalid CA certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build().map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                ntlm: NtlmCredentials::new(&credentials.user, password),
                envelopes: EnvelopeConfig::new(endpoint.url()),
            }),
        })
    }

    /// Post one envelope, authenticating the request with NTLM.
    ///
    /// Returns the status and body of any response carrying SOAP content.
    async fn post(&self, body: String) -> Result<(StatusCode, String), ConnectionError> {
        let inner = &self.inner;
        let url = inner.envelopes.url.as_str();

        let negotiate = BASE64_STANDARD.encode(inner.ntlm.negotiate_message());
        let response = inner
            .http
            .post(url)
            .header(AUTHORIZATION, format!("Negotiate {}", negotiate))
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .header(CONTENT_LENGTH, "0")
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            if !is_soap(&response) {
                return Err(invalid_content_type(response.status()));
            }
            return Err(ConnectionError::AuthenticationFailed(format!(
                "Expected NTLM challenge from {}, got {}",
                url,
                response.status()
            )));
        }
        let challenge = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| v.strip_prefix("Negotiate ").or_else(|| v.strip_prefix("NTLM ")))
            .ok_or_else(|| {
                ConnectionError::AuthenticationFailed(
                    "No NTLM challenge in WWW-Authenticate".to_string(),
                )
            })?;
        let challenge = BASE64_STANDARD.decode(challenge.trim()).map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Invalid challenge encoding: {}", e))
        })?;

        let authenticate = BASE64_STANDARD.encode(inner.ntlm.authenticate_message(&challenge)?);
        let response = inner
            .http
            .post(url)
            .header(AUTHORIZATION, format!("Negotiate {}", authenticate))
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "Credentials for [{}] rejected by {}",
                inner.ntlm.user(),
                url
            )));
        }
        // The listener answers with an empty or HTML body while it is still coming up
        if !is_soap(&response) {
            return Err(invalid_content_type(status));
        }

        let text = response.text().await?;
        Ok((status, text))
    }

    /// Post and require a successful response.
    async fn call(&self, body: String, what: &str) -> Result<String, ConnectionError> {
        let (status, text) = self.post(body).await?;
        if !status.is_success() {
            return Err(ConnectionError::Transport(format!(
                "{} failed ({}): {}",
                what,
                status.as_u16(),
                soap::fault_reason(&text)
            )));
        }
        Ok(text)
    }
}

fn is_soap(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("application/soap+xml"))
}

fn invalid_content_type(status: StatusCode) -> ConnectionError {
    ConnectionError::Transport(format!(
        "http response error: {} - invalid content type",
        status.as_u16()
    ))
}

#[async_trait]
impl ShellClient for WinRmClient {
    async fn create_shell(&self) -> Result<Box<dyn RemoteShell>, ConnectionError> {
        let envelope = self.inner.envelopes.create_shell();
        let response = self.call(envelope, "Create shell").await?;
        let shell_id = soap::parse_shell_id(&response).ok_or_else(|| {
            ConnectionError::Transport("No ShellId in create shell response".to_string())
        })?;
        log::debug!("Created WinRM shell {}", shell_id);

        Ok(Box::new(WinRmShell {
            client: self.clone(),
            shell_id,
        }))
    }
}

struct WinRmShell {
    client: WinRmClient,
    shell_id: String,
}

#[async_trait]
impl RemoteShell for WinRmShell {
    async fn execute(&self, command_line: &str) -> Result<RemoteProcess, ConnectionError> {
        let envelope = self.client.inner.envelopes.command(&self.shell_id, command_line);
        let response = self.client.call(envelope, "Command").await?;
        let command_id = soap::parse_command_id(&response).ok_or_else(|| {
            ConnectionError::Transport("No CommandId in command response".to_string())
        })?;

        let (stdout_tx, stdout) = mpsc::channel(STREAM_BUFFER);
        let (stderr_tx, stderr) = mpsc::channel(STREAM_BUFFER);
        let (exit_tx, exit) = oneshot::channel();

        let pump = OutputPump {
            client: self.client.clone(),
            shell_id: self.shell_id.clone(),
            command_id,
            stdout: stdout_tx,
            stderr: stderr_tx,
        };
        tokio::spawn(async move {
            let result = pump.run().await;
            // The receiver is gone only when the caller stopped waiting
            let _ = exit_tx.send(result);
        });

        Ok(RemoteProcess {
            stdout,
            stderr,
            exit,
        })
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let envelope = self.client.inner.envelopes.delete_shell(&self.shell_id);
        self.client.call(envelope, "Delete shell").await?;
        log::debug!("Deleted WinRM shell {}", self.shell_id);
        Ok(())
    }
}

/// Polls Receive until the command is done, forwarding output.
struct OutputPump {
    client: WinRmClient,
    shell_id: String,
    command_id: String,
    stdout: mpsc::Sender<Vec<u8>>,
    stderr: mpsc::Sender<Vec<u8>>,
}

impl OutputPump {
    async fn run(self) -> Result<i32, ConnectionError> {
        let envelopes = &self.client.inner.envelopes;
        loop {
            let (status, text) = self
                .client
                .post(envelopes.receive(&self.shell_id, &self.command_id))
                .await?;

            if !status.is_success() {
                if soap::is_operation_timeout(&text) {
                    continue;
                }
                return Err(ConnectionError::Transport(format!(
                    "Receive failed ({}): {}",
                    status.as_u16(),
                    soap::fault_reason(&text)
                )));
            }

            let output = soap::parse_receive(&text).map_err(ConnectionError::Transport)?;
            if !output.stdout.is_empty() {
                let _ = self.stdout.send(output.stdout).await;
            }
            if !output.stderr.is_empty() {
                let _ = self.stderr.send(output.stderr).await;
            }

            if let Some(code) = output.exit_code {
                let terminate = envelopes.signal_terminate(&self.shell_id, &self.command_id);
                if let Err(e) = self.client.call(terminate, "Signal").await {
                    log::debug!("Terminate signal for command {} failed: {}", self.command_id, e);
                }
                return Ok(code);
            }
        }
    }
}
