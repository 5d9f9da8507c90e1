//! Remote agent lifecycle: connector install/uninstall and SSH CA trust.

pub mod commands;
pub mod connector;
pub mod ssh_ca;

pub use commands::{CommandSets, OsCommands};
pub use connector::{
    ConnectorInstallRequest, ConnectorLifecycle, ConnectorRegistry, ConnectorScriptSource,
    ConnectorUninstallRequest, PollPolicy,
};
pub use ssh_ca::{SshCaKeyManager, SshCaKeyResult, SshCaScriptSource};

use serde::{Deserialize, Serialize};

/// OS family of the machine receiving the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    Linux,
    Darwin,
    Windows,
}

impl std::fmt::Display for TargetOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TargetOs::Linux => "linux",
            TargetOs::Darwin => "darwin",
            TargetOs::Windows => "windows",
        };
        f.write_str(name)
    }
}
