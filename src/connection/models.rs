//! Connection and command data model.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `extra_command_data` key forcing the WinRM file-chunked path.
pub const FORCE_COMMAND_SPLIT: &str = "force_command_split";

/// Transport used to reach a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Ssh,
    #[serde(alias = "win_rm")]
    WinRm,
}

/// Login material. For SSH the first usable of password, key file and key
/// contents wins; WinRM needs user and password.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_filepath: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_contents: Option<String>,
}

impl Credentials {
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Some(password.into()),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_filepath", &self.private_key_filepath)
            .field(
                "private_key_contents",
                &self.private_key_contents.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WinRmProtocol {
    #[default]
    Https,
    Http,
}

/// WinRM specific connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WinRmConnectionData {
    /// PEM certificate trusted in addition to the system roots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<PathBuf>,
    /// Skip server certificate validation
    #[serde(default)]
    pub trust_certificate: bool,
    #[serde(default)]
    pub protocol: WinRmProtocol,
}

/// Where and how to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDetails {
    pub address: String,

    /// Defaults to 22 for SSH, 5986 for WinRM over HTTPS and 5985 over HTTP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    pub connection_type: ConnectionType,

    pub credentials: Credentials,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_data: Option<WinRmConnectionData>,

    /// Connect attempts; 0 behaves as 1
    #[serde(default = "default_connection_retries")]
    pub connection_retries: u32,

    /// Seconds between connect attempts
    #[serde(default = "default_retry_tick_period")]
    pub retry_tick_period: u64,
}

fn default_connection_retries() -> u32 {
    1
}

fn default_retry_tick_period() -> u64 {
    1
}

impl ConnectionDetails {
    pub fn new(
        address: impl Into<String>,
        connection_type: ConnectionType,
        credentials: Credentials,
    ) -> Self {
        Self {
            address: address.into(),
            port: None,
            connection_type,
            credentials,
            connection_data: None,
            connection_retries: default_connection_retries(),
            retry_tick_period: default_retry_tick_period(),
        }
    }

    /// Number of connect attempts to make, never below one.
    pub fn connect_attempts(&self) -> u32 {
        self.connection_retries.max(1)
    }

    pub fn retry_tick(&self) -> Duration {
        Duration::from_secs(self.retry_tick_period)
    }
}

/// A single remote command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command: String,

    #[serde(default)]
    pub expected_rc: i32,

    #[serde(default)]
    pub ignore_rc: bool,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra_command_data: HashMap<String, serde_json::Value>,

    /// Total attempts for the WinRM command path
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Seconds between attempts
    #[serde(default)]
    pub retry_delay: u64,

    /// Error substrings that qualify for a retry; empty retries everything
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_on_errors: Vec<String>,
}

fn default_retry_count() -> u32 {
    1
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            expected_rc: 0,
            ignore_rc: false,
            extra_command_data: HashMap::new(),
            retry_count: default_retry_count(),
            retry_delay: 0,
            retry_on_errors: Vec::new(),
        }
    }

    pub fn expect_rc(mut self, rc: i32) -> Self {
        self.expected_rc = rc;
        self
    }

    pub fn ignore_rc(mut self) -> Self {
        self.ignore_rc = true;
        self
    }

    pub fn force_split(mut self) -> Self {
        self.extra_command_data
            .insert(FORCE_COMMAND_SPLIT.to_string(), serde_json::Value::Bool(true));
        self
    }

    pub fn with_retries(mut self, count: u32, delay_secs: u64, on_errors: Vec<String>) -> Self {
        self.retry_count = count;
        self.retry_delay = delay_secs;
        self.retry_on_errors = on_errors;
        self
    }

    /// Accepts a JSON boolean or the strings "true"/"false".
    pub fn forces_split(&self) -> bool {
        match self.extra_command_data.get(FORCE_COMMAND_SPLIT) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

/// Output of one command run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub rc: i32,
}

/// `host:port`, with IPv6 literals bracketed.
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
