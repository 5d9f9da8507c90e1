//! rexec core: remote command execution over SSH and WinRM
//!
//! Opens authenticated sessions to remote hosts, runs shell or PowerShell
//! commands with structured results, and drives remote agent installs on
//! top of them. Native callers use the blocking C interface in [`ffi`].

pub mod agent;
pub mod connection;
pub mod error;
pub mod ffi;
pub mod retry;
pub mod ssh;
pub mod winrm;

pub use connection::{
    new_connection, Command, CommandResult, Connection, ConnectionDetails, ConnectionFactory,
    ConnectionType, Credentials, DefaultConnectionFactory,
};
pub use error::ConnectionError;
