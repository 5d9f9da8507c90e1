//! Connector agent install and uninstall.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::commands::{CommandSets, OsCommands};
use super::TargetOs;
use crate::connection::{Command, Connection, ConnectionDetails, ConnectionFactory};
use crate::error::ConnectionError;
use crate::retry::retry_if;

/// Supplies the connector install script for an OS.
#[async_trait]
pub trait ConnectorScriptSource: Send + Sync {
    async fn install_script(&self, os: TargetOs) -> Result<String>;
}

/// Remote registry the connector reports to.
#[async_trait]
pub trait ConnectorRegistry: Send + Sync {
    /// Delete the connector, returning the HTTP status of the call.
    async fn delete_connector(&self, connector_id: &str) -> Result<u16>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorInstallRequest {
    pub target_os: TargetOs,
    pub connection: ConnectionDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorUninstallRequest {
    pub target_os: TargetOs,
    pub connection: ConnectionDetails,
    pub connector_id: String,
}

/// Bounds on the two wait loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Service activity checks after install
    pub active_attempts: u32,
    pub active_tick: Duration,
    pub deregister_attempts: u32,
    pub deregister_tick: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            active_attempts: 30,
            active_tick: Duration::from_secs(10),
            deregister_attempts: 5,
            deregister_tick: Duration::from_secs(5),
        }
    }
}

#[derive(Error, Debug)]
#[error("Connector [{connector_id}] deregistration returned HTTP {status}")]
struct DeregistrationStatus {
    connector_id: String,
    status: u16,
}

/// Installs and removes the connector agent on remote machines.
pub struct ConnectorLifecycle {
    connections: Box<dyn ConnectionFactory>,
    scripts: Box<dyn ConnectorScriptSource>,
    registry: Box<dyn ConnectorRegistry>,
    commands: CommandSets,
    poll: PollPolicy,
}

impl ConnectorLifecycle {
    pub fn new(
        connections: Box<dyn ConnectionFactory>,
        scripts: Box<dyn ConnectorScriptSource>,
        registry: Box<dyn ConnectorRegistry>,
    ) -> Self {
        Self {
            connections,
            scripts,
            registry,
            commands: CommandSets::default(),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_commands(mut self, commands: CommandSets) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Install the connector and return the ID it generated.
    pub async fn install(&self, request: &ConnectorInstallRequest) -> Result<String> {
        let os = request.target_os;
        let host = &request.connection.address;

        let script = self
            .scripts
            .install_script(os)
            .await
            .with_context(|| format!("Failed to fetch {} connector install script", os))?;

        let mut conn = self.connections.create(request.connection.connection_type);
        conn.connect(&request.connection)
            .await
            .with_context(|| format!("Failed to connect to {}", host))?;
        log::info!("Installing {} connector on {}", os, host);

        let outcome = self.install_on(conn.as_mut(), os, &script).await;
        release(conn.as_mut(), host).await;

        let connector_id =
            outcome.with_context(|| format!("Failed to install connector on {}", host))?;
        log::info!("Connector {} installed on {}", connector_id, host);
        Ok(connector_id)
    }

    async fn install_on(
        &self,
        conn: &mut dyn Connection,
        os: TargetOs,
        script: &str,
    ) -> Result<String> {
        let commands = self.commands.for_os(os);

        // A clean machine has nothing to stop or remove
        for (step, line) in cleanup_steps(commands) {
            if let Err(e) = conn.run_command(&Command::new(line)).await {
                log::debug!("Pre-install {} skipped: {}", step, e);
            }
        }

        let mut install = Command::new(commands.install_command(script));
        if os == TargetOs::Windows {
            install = install.force_split();
        }
        conn.run_command(&install)
            .await
            .context("Install script failed")?;

        wait_until_active(conn, &Command::new(&commands.check_active), &self.poll)
            .await
            .with_context(|| {
                format!(
                    "Connector service not active after {} checks",
                    self.poll.active_attempts.max(1)
                )
            })?;

        let config = conn
            .run_command(&Command::new(&commands.read_config))
            .await
            .context("Failed to read connector config")?;
        extract_connector_id(&config.stdout, &self.commands.connector_id_key)
    }

    /// Remove the connector from the machine, then deregister it.
    pub async fn uninstall(&self, request: &ConnectorUninstallRequest) -> Result<()> {
        let os = request.target_os;
        let host = &request.connection.address;
        let commands = self.commands.for_os(os);

        let mut conn = self.connections.create(request.connection.connection_type);
        conn.connect(&request.connection)
            .await
            .with_context(|| format!("Failed to connect to {}", host))?;
        log::info!("Uninstalling connector {} from {}", request.connector_id, host);

        let mut outcome = Ok(());
        for (step, line) in cleanup_steps(commands) {
            if let Err(e) = conn.run_command(&Command::new(line)).await {
                outcome = Err(anyhow!(e).context(format!("Failed to {}", step)));
                break;
            }
        }
        release(conn.as_mut(), host).await;
        outcome.with_context(|| format!("Failed to uninstall connector from {}", host))?;

        self.deregister(&request.connector_id).await
    }

    async fn deregister(&self, connector_id: &str) -> Result<()> {
        let registry = &self.registry;
        retry_if(
            || async move {
                let status = registry.delete_connector(connector_id).await?;
                if status != 200 {
                    return Err(anyhow::Error::new(DeregistrationStatus {
                        connector_id: connector_id.to_string(),
                        status,
                    }));
                }
                Ok::<(), anyhow::Error>(())
            },
            self.poll.deregister_attempts.max(1),
            self.poll.deregister_tick,
            |e: &anyhow::Error| e.is::<DeregistrationStatus>(),
        )
        .await
        .with_context(|| format!("Failed to deregister connector {}", connector_id))?;

        log::info!("Connector {} deregistered", connector_id);
        Ok(())
    }
}

fn cleanup_steps(commands: &OsCommands) -> [(&'static str, &str); 3] {
    [
        ("stop service", commands.stop_service.as_str()),
        ("remove service", commands.remove_service.as_str()),
        ("remove files", commands.remove_files.as_str()),
    ]
}

async fn release(conn: &mut dyn Connection, host: &str) {
    if let Err(e) = conn.disconnect().await {
        log::warn!("Failed to disconnect from {}: {}", host, e);
    }
}

/// Run `check` until it succeeds, sleeping `active_tick` between attempts.
async fn wait_until_active(
    conn: &mut dyn Connection,
    check: &Command,
    poll: &PollPolicy,
) -> Result<(), ConnectionError> {
    let attempts = poll.active_attempts.max(1);
    let mut attempt = 1;
    loop {
        match conn.run_command(check).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt < attempts => {
                log::debug!(
                    "Connector service not active yet ({}/{}): {}",
                    attempt,
                    attempts,
                    e
                );
                tokio::time::sleep(poll.active_tick).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn extract_connector_id(config: &str, key: &str) -> Result<String> {
    let config = config.trim().trim_start_matches('\u{feff}');
    let value: serde_json::Value =
        serde_json::from_str(config).context("Connector config is not valid JSON")?;
    match value.get(key) {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(serde_json::Value::Number(id)) => Ok(id.to_string()),
        _ => bail!("Connector config has no [{}] value", key),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::agent::testing::{exit, ok, FakeHost};
    use crate::connection::{ConnectionType, Credentials};

    struct StaticScripts;

    #[async_trait]
    impl ConnectorScriptSource for StaticScripts {
        async fn install_script(&self, os: TargetOs) -> Result<String> {
            Ok(format!("install-{}", os))
        }
    }

    #[derive(Default, Clone)]
    struct FakeRegistry {
        statuses: Arc<Mutex<Vec<u16>>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectorRegistry for FakeRegistry {
        async fn delete_connector(&self, _connector_id: &str) -> Result<u16> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.is_empty() {
                return Ok(200);
            }
            Ok(statuses.remove(0))
        }
    }

    fn fast_poll() -> PollPolicy {
        PollPolicy {
            active_attempts: 3,
            active_tick: Duration::ZERO,
            deregister_attempts: 3,
            deregister_tick: Duration::ZERO,
        }
    }

    fn lifecycle(host: &FakeHost, registry: &FakeRegistry) -> ConnectorLifecycle {
        ConnectorLifecycle::new(
            Box::new(host.clone()),
            Box::new(StaticScripts),
            Box::new(registry.clone()),
        )
        .with_poll_policy(fast_poll())
    }

    fn details(connection_type: ConnectionType) -> ConnectionDetails {
        let mut details = ConnectionDetails::new(
            "agent-host",
            connection_type,
            Credentials::password("admin", "pw"),
        );
        details.retry_tick_period = 0;
        details
    }

    fn install_request(os: TargetOs, connection_type: ConnectionType) -> ConnectorInstallRequest {
        ConnectorInstallRequest {
            target_os: os,
            connection: details(connection_type),
        }
    }

    #[tokio::test]
    async fn test_linux_install_happy_path() {
        let checks = Arc::new(AtomicUsize::new(0));
        let host = {
            let checks = checks.clone();
            FakeHost::new(move |cmd| {
                if cmd.contains("systemctl stop") {
                    // Nothing installed yet
                    return exit("", 5);
                }
                if cmd.contains("is-active") {
                    let n = checks.fetch_add(1, Ordering::SeqCst);
                    return exit("", if n == 0 { 3 } else { 0 });
                }
                if cmd.contains("config.json") {
                    return ok(r#"{"Id": "conn-42", "Region": "eu"}"#);
                }
                ok("")
            })
        };
        let registry = FakeRegistry::default();

        let id = lifecycle(&host, &registry)
            .install(&install_request(TargetOs::Linux, ConnectionType::Ssh))
            .await
            .unwrap();

        assert_eq!(id, "conn-42");
        assert_eq!(checks.load(Ordering::SeqCst), 2);
        assert_eq!(host.disconnects(), 1);

        let lines = host.command_lines();
        let sets = CommandSets::default();
        assert_eq!(lines[0], sets.linux.stop_service);
        assert_eq!(lines[1], sets.linux.remove_service);
        assert_eq!(lines[2], sets.linux.remove_files);
        assert_eq!(lines[3], sets.linux.install_command("install-linux"));
    }

    #[tokio::test]
    async fn test_windows_install_forces_split() {
        let host = FakeHost::new(|cmd| {
            if cmd.contains("config.json") {
                return ok("\u{feff}{\"Id\": \"win-7\"}\r\n");
            }
            ok("")
        });
        let registry = FakeRegistry::default();

        let id = lifecycle(&host, &registry)
            .install(&install_request(TargetOs::Windows, ConnectionType::WinRm))
            .await
            .unwrap();
        assert_eq!(id, "win-7");

        let install = host
            .commands()
            .into_iter()
            .find(|c| c.command == "install-windows")
            .unwrap();
        assert!(install.forces_split());
        assert!(host
            .commands()
            .iter()
            .filter(|c| c.command != "install-windows")
            .all(|c| !c.forces_split()));
    }

    #[tokio::test]
    async fn test_install_poll_exhaustion_is_fatal_and_disconnects() {
        let host = FakeHost::new(|cmd| {
            if cmd.contains("is-active") {
                return exit("", 3);
            }
            ok("")
        });
        let registry = FakeRegistry::default();

        let err = lifecycle(&host, &registry)
            .install(&install_request(TargetOs::Linux, ConnectionType::Ssh))
            .await
            .unwrap_err();

        let msg = format!("{:#}", err);
        assert!(msg.contains("agent-host"), "{}", msg);
        assert!(msg.contains("not active after 3 checks"), "{}", msg);
        let checks = host
            .command_lines()
            .iter()
            .filter(|l| l.contains("is-active"))
            .count();
        assert_eq!(checks, 3);
        assert_eq!(host.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_install_script_failure_surfaces_rc() {
        let host = FakeHost::new(|cmd| {
            if cmd.contains("install-darwin") {
                return exit("partial", 9);
            }
            ok("")
        });
        let registry = FakeRegistry::default();

        let err = lifecycle(&host, &registry)
            .install(&install_request(TargetOs::Darwin, ConnectionType::Ssh))
            .await
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("Install script failed"));
        assert!(msg.contains("rc [9]"));
        assert_eq!(host.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_missing_id_key_is_error() {
        let host = FakeHost::new(|cmd| {
            if cmd.contains("config.json") {
                return ok(r#"{"Name": "x"}"#);
            }
            ok("")
        });
        let registry = FakeRegistry::default();

        let err = lifecycle(&host, &registry)
            .install(&install_request(TargetOs::Linux, ConnectionType::Ssh))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("no [Id] value"));
    }

    #[tokio::test]
    async fn test_uninstall_runs_steps_then_deregisters() {
        let host = FakeHost::new(|_| ok(""));
        let registry = FakeRegistry::default();
        registry.statuses.lock().unwrap().extend([503, 404]);

        let request = ConnectorUninstallRequest {
            target_os: TargetOs::Linux,
            connection: details(ConnectionType::Ssh),
            connector_id: "conn-42".to_string(),
        };
        lifecycle(&host, &registry).uninstall(&request).await.unwrap();

        assert_eq!(host.command_lines().len(), 3);
        assert_eq!(host.disconnects(), 1);
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_uninstall_step_failure_is_fatal() {
        let host = FakeHost::new(|cmd| {
            if cmd.contains("disable") {
                return exit("", 1);
            }
            ok("")
        });
        let registry = FakeRegistry::default();

        let request = ConnectorUninstallRequest {
            target_os: TargetOs::Linux,
            connection: details(ConnectionType::Ssh),
            connector_id: "conn-42".to_string(),
        };
        let err = lifecycle(&host, &registry).uninstall(&request).await.unwrap_err();

        assert!(format!("{:#}", err).contains("Failed to remove service"));
        // remove files never ran
        assert_eq!(host.command_lines().len(), 2);
        assert_eq!(host.disconnects(), 1);
        assert_eq!(registry.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deregistration_gives_up() {
        let host = FakeHost::new(|_| ok(""));
        let registry = FakeRegistry::default();
        registry.statuses.lock().unwrap().extend([500, 500, 500, 500]);

        let request = ConnectorUninstallRequest {
            target_os: TargetOs::Linux,
            connection: details(ConnectionType::Ssh),
            connector_id: "conn-42".to_string(),
        };
        let err = lifecycle(&host, &registry).uninstall(&request).await.unwrap_err();

        assert!(format!("{:#}", err).contains("HTTP 500"));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_extract_connector_id_accepts_numbers() {
        assert_eq!(extract_connector_id(r#"{"Id": 17}"#, "Id").unwrap(), "17");
        assert!(extract_connector_id("not json", "Id").is_err());
        assert!(extract_connector_id(r#"{"Id": ""}"#, "Id").is_err());
    }
}
