//! Per-OS service lifecycle commands for the connector agent.

use serde::{Deserialize, Serialize};

use super::TargetOs;

/// Placeholder replaced by the install script body in `install_wrapper`.
pub const SCRIPT_PLACEHOLDER: &str = "{script}";

const DEFAULT_ID_KEY: &str = "Id";

/// Commands driving the agent service on one OS family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsCommands {
    pub stop_service: String,
    pub remove_service: String,
    pub remove_files: String,
    /// Exits 0 once the service is running
    pub check_active: String,
    /// Prints the generated agent configuration as JSON
    pub read_config: String,
    /// Command template wrapping the install script; see [`SCRIPT_PLACEHOLDER`]
    pub install_wrapper: String,
}

impl OsCommands {
    pub fn linux() -> Self {
        Self {
            stop_service: "sudo systemctl stop connector-agent".to_string(),
            remove_service: "sudo systemctl disable connector-agent && sudo rm -f /etc/systemd/system/connector-agent.service && sudo systemctl daemon-reload".to_string(),
            remove_files: "sudo rm -rf /opt/connector-agent".to_string(),
            check_active: "sudo systemctl is-active --quiet connector-agent".to_string(),
            read_config: "sudo cat /opt/connector-agent/config.json".to_string(),
            install_wrapper: unix_wrapper(),
        }
    }

    pub fn darwin() -> Self {
        Self {
            stop_service: "sudo launchctl bootout system/com.connector.agent".to_string(),
            remove_service: "sudo rm -f /Library/LaunchDaemons/com.connector.agent.plist".to_string(),
            remove_files: "sudo rm -rf /usr/local/connector-agent".to_string(),
            check_active: "sudo launchctl print system/com.connector.agent | grep -q 'state = running'".to_string(),
            read_config: "sudo cat /usr/local/connector-agent/config.json".to_string(),
            install_wrapper: unix_wrapper(),
        }
    }

    pub fn windows() -> Self {
        Self {
            stop_service: "Stop-Service -Name ConnectorAgent -Force -ErrorAction Stop".to_string(),
            remove_service: "$svc = Get-CimInstance -ClassName Win32_Service -Filter \"Name='ConnectorAgent'\"; if (-not $svc) { exit 1 }; $r = Invoke-CimMethod -InputObject $svc -MethodName Delete; exit $r.ReturnValue".to_string(),
            remove_files: "Remove-Item -Path 'C:\\Program Files\\ConnectorAgent' -Recurse -Force -ErrorAction Stop".to_string(),
            check_active: "if ((Get-Service -Name ConnectorAgent -ErrorAction Stop).Status -ne 'Running') { exit 1 }".to_string(),
            read_config: "Get-Content -Raw -Path 'C:\\Program Files\\ConnectorAgent\\config.json'".to_string(),
            install_wrapper: SCRIPT_PLACEHOLDER.to_string(),
        }
    }

    /// The command that runs `script` on the target.
    pub fn install_command(&self, script: &str) -> String {
        self.install_wrapper.replace(SCRIPT_PLACEHOLDER, script)
    }
}

fn unix_wrapper() -> String {
    format!(
        "cat <<'REXEC_INSTALL_EOF' | sudo bash -s\n{}\nREXEC_INSTALL_EOF",
        SCRIPT_PLACEHOLDER
    )
}

/// Immutable command tables for every supported OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSets {
    #[serde(default = "OsCommands::linux")]
    pub linux: OsCommands,
    #[serde(default = "OsCommands::darwin")]
    pub darwin: OsCommands,
    #[serde(default = "OsCommands::windows")]
    pub windows: OsCommands,
    /// Key holding the connector ID in the generated config
    #[serde(default = "default_id_key")]
    pub connector_id_key: String,
}

fn default_id_key() -> String {
    DEFAULT_ID_KEY.to_string()
}

impl Default for CommandSets {
    fn default() -> Self {
        Self {
            linux: OsCommands::linux(),
            darwin: OsCommands::darwin(),
            windows: OsCommands::windows(),
            connector_id_key: default_id_key(),
        }
    }
}

impl CommandSets {
    /// Missing OS entries fall back to the built-in sets.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn for_os(&self, os: TargetOs) -> &OsCommands {
        match os {
            TargetOs::Linux => &self.linux,
            TargetOs::Darwin => &self.darwin,
            TargetOs::Windows => &self.windows,
        }
    }
}
