//! SSH certificate authority trust on remote `sshd` hosts.
//!
//! Each operation first runs a generated check script whose exit code
//! describes the current state:
//!
//! | rc | meaning                                   |
//! |----|-------------------------------------------|
//! | 0  | our CA key is trusted                     |
//! | 2  | no CA trust configured                    |
//! | 3  | a different CA key is trusted             |
//!
//! The signed install script is only run when the probe says it is needed
//! and will not clobber someone else's CA.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connection::{Command, Connection, ConnectionDetails, ConnectionFactory, ConnectionType};

const PROBE_INSTALLED: i32 = 0;
const PROBE_NOT_INSTALLED: i32 = 2;
const PROBE_OTHER_CA: i32 = 3;

/// Supplies the CA public key and the signed install script.
#[async_trait]
pub trait SshCaScriptSource: Send + Sync {
    /// OpenSSH formatted public key, e.g. `ssh-ed25519 AAAA... comment`
    async fn public_key(&self) -> Result<String>;

    /// Script taking `install` or `uninstall` as its first argument
    async fn install_script(&self) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCaKeyResult {
    pub result: bool,
    pub message: String,
}

impl SshCaKeyResult {
    fn new(result: bool, message: impl Into<String>) -> Self {
        Self {
            result,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Installed,
    NotInstalled,
    OtherCa,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Install,
    Uninstall,
}

impl Action {
    fn arg(self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::Uninstall => "uninstall",
        }
    }
}

/// Installs, removes and checks the SSH CA public key on a host.
pub struct SshCaKeyManager {
    connections: Box<dyn ConnectionFactory>,
    scripts: Box<dyn SshCaScriptSource>,
}

impl SshCaKeyManager {
    pub fn new(connections: Box<dyn ConnectionFactory>, scripts: Box<dyn SshCaScriptSource>) -> Self {
        Self {
            connections,
            scripts,
        }
    }

    pub async fn install_public_key(&self, details: &ConnectionDetails) -> Result<SshCaKeyResult> {
        let host = details.address.as_str();
        let key = self.fetch_key().await?;
        let script = self.fetch_script().await?;

        let mut conn = self.connect(details).await?;
        let outcome = install_flow(conn.as_mut(), host, &key, &script).await;
        release(conn.as_mut(), host).await;
        outcome.with_context(|| format!("Failed to install SSH CA public key on {}", host))
    }

    pub async fn uninstall_public_key(&self, details: &ConnectionDetails) -> Result<SshCaKeyResult> {
        let host = details.address.as_str();
        let key = self.fetch_key().await?;
        let script = self.fetch_script().await?;

        let mut conn = self.connect(details).await?;
        let outcome = uninstall_flow(conn.as_mut(), host, &key, &script).await;
        release(conn.as_mut(), host).await;
        outcome.with_context(|| format!("Failed to uninstall SSH CA public key from {}", host))
    }

    pub async fn is_public_key_installed(
        &self,
        details: &ConnectionDetails,
    ) -> Result<SshCaKeyResult> {
        let host = details.address.as_str();
        let key = self.fetch_key().await?;

        let mut conn = self.connect(details).await?;
        let outcome = probe(conn.as_mut(), &key).await.map(|state| match state {
            Probe::Installed => {
                SshCaKeyResult::new(true, format!("SSH CA public key installed on {}", host))
            }
            Probe::NotInstalled => {
                SshCaKeyResult::new(false, format!("SSH CA public key not installed on {}", host))
            }
            Probe::OtherCa => {
                SshCaKeyResult::new(false, format!("A different SSH CA is trusted on {}", host))
            }
        });
        release(conn.as_mut(), host).await;
        outcome.with_context(|| format!("Failed to check SSH CA public key on {}", host))
    }

    async fn fetch_key(&self) -> Result<String> {
        let key = self
            .scripts
            .public_key()
            .await
            .context("Failed to fetch SSH CA public key")?;
        if key_material(&key).is_empty() {
            bail!("SSH CA public key is empty");
        }
        Ok(key)
    }

    async fn fetch_script(&self) -> Result<String> {
        self.scripts
            .install_script()
            .await
            .context("Failed to fetch SSH CA install script")
    }

    async fn connect(&self, details: &ConnectionDetails) -> Result<Box<dyn Connection>> {
        if details.connection_type != ConnectionType::Ssh {
            bail!("SSH CA keys can only be managed over SSH");
        }
        let mut conn = self.connections.create(ConnectionType::Ssh);
        conn.connect(details)
            .await
            .with_context(|| format!("Failed to connect to {}", details.address))?;
        Ok(conn)
    }
}

async fn release(conn: &mut dyn Connection, host: &str) {
    if let Err(e) = conn.disconnect().await {
        log::warn!("Failed to disconnect from {}: {}", host, e);
    }
}

async fn install_flow(
    conn: &mut dyn Connection,
    host: &str,
    key: &str,
    script: &str,
) -> Result<SshCaKeyResult> {
    match probe(conn, key).await? {
        Probe::Installed => Ok(SshCaKeyResult::new(
            true,
            format!("SSH CA public key already installed on {}", host),
        )),
        Probe::NotInstalled => {
            run_script(conn, script, Action::Install).await?;
            Ok(SshCaKeyResult::new(
                true,
                format!("SSH CA public key installed on {}", host),
            ))
        }
        Probe::OtherCa => Ok(SshCaKeyResult::new(
            false,
            format!(
                "A different SSH CA is already trusted on {}; not overwriting it",
                host
            ),
        )),
    }
}

async fn uninstall_flow(
    conn: &mut dyn Connection,
    host: &str,
    key: &str,
    script: &str,
) -> Result<SshCaKeyResult> {
    match probe(conn, key).await? {
        Probe::Installed => {
            run_script(conn, script, Action::Uninstall).await?;
            Ok(SshCaKeyResult::new(
                true,
                format!("SSH CA public key removed from {}", host),
            ))
        }
        Probe::NotInstalled => Ok(SshCaKeyResult::new(
            true,
            format!("SSH CA public key not installed on {}", host),
        )),
        Probe::OtherCa => Ok(SshCaKeyResult::new(
            false,
            format!("The SSH CA trusted on {} is not ours; leaving it in place", host),
        )),
    }
}

/// Key type and base64 body, without the comment.
fn key_material(public_key: &str) -> String {
    public_key
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// POSIX single-quote `value`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn check_script(public_key: &str) -> String {
    format!(
        r#"KEY={key}
CA_FILE=$(sudo sshd -T 2>/dev/null | awk '$1 == "trustedusercakeys" {{ print $2; exit }}')
if [ -z "$CA_FILE" ] || [ "$CA_FILE" = "none" ]; then exit 2; fi
if ! sudo test -s "$CA_FILE"; then exit 2; fi
if sudo grep -qF "$KEY" "$CA_FILE"; then exit 0; fi
exit 3"#,
        key = shell_quote(&key_material(public_key))
    )
}

async fn probe(conn: &mut dyn Connection, public_key: &str) -> Result<Probe> {
    let result = conn
        .run_command(&Command::new(check_script(public_key)).ignore_rc())
        .await
        .context("SSH CA check script failed")?;

    match result.rc {
        PROBE_INSTALLED => Ok(Probe::Installed),
        PROBE_NOT_INSTALLED => Ok(Probe::NotInstalled),
        PROBE_OTHER_CA => Ok(Probe::OtherCa),
        rc => bail!(
            "SSH CA check script exited with unrecognized code {} (stderr: {})",
            rc,
            result.stderr.trim()
        ),
    }
}

async fn run_script(conn: &mut dyn Connection, script: &str, action: Action) -> Result<()> {
    let line = format!(
        "cat <<'REXEC_SSH_CA_EOF' | sudo bash -s -- {}\n{}\nREXEC_SSH_CA_EOF",
        action.arg(),
        script
    );
    conn.run_command(&Command::new(line))
        .await
        .with_context(|| format!("SSH CA {} script failed", action.arg()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{exit, ok, FakeHost};
    use crate::connection::Credentials;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIExample ca@example";

    struct StaticSource;

    #[async_trait]
    impl SshCaScriptSource for StaticSource {
        async fn public_key(&self) -> Result<String> {
            Ok(KEY.to_string())
        }

        async fn install_script(&self) -> Result<String> {
            Ok("echo signed-script".to_string())
        }
    }

    /// Host whose check script exits with `probe_rc`.
    fn host(probe_rc: i32) -> FakeHost {
        FakeHost::new(move |cmd| {
            if cmd.starts_with("KEY=") {
                return exit("", probe_rc);
            }
            ok("")
        })
    }

    fn manager(host: &FakeHost) -> SshCaKeyManager {
        SshCaKeyManager::new(Box::new(host.clone()), Box::new(StaticSource))
    }

    fn details() -> ConnectionDetails {
        ConnectionDetails::new(
            "bastion",
            ConnectionType::Ssh,
            Credentials::password("root", "pw"),
        )
    }

    fn ran_body(host: &FakeHost, action: &str) -> bool {
        host.command_lines()
            .iter()
            .any(|l| l.contains(&format!("sudo bash -s -- {}\n", action)))
    }

    #[tokio::test]
    async fn test_is_installed_probe_outcomes() {
        let h = host(2);
        let result = manager(&h).is_public_key_installed(&details()).await.unwrap();
        assert!(!result.result);

        let h = host(0);
        let result = manager(&h).is_public_key_installed(&details()).await.unwrap();
        assert!(result.result);
        assert_eq!(h.command_lines().len(), 1);
        assert_eq!(h.disconnects(), 1);

        let h = host(3);
        assert!(!manager(&h).is_public_key_installed(&details()).await.unwrap().result);
    }

    #[tokio::test]
    async fn test_install_runs_body_only_when_missing() {
        let h = host(2);
        let result = manager(&h).install_public_key(&details()).await.unwrap();
        assert!(result.result);
        assert!(ran_body(&h, "install"));
        assert!(h.command_lines()[1].contains("echo signed-script"));

        let h = host(0);
        let result = manager(&h).install_public_key(&details()).await.unwrap();
        assert!(result.result);
        assert!(!ran_body(&h, "install"));

        let h = host(3);
        let result = manager(&h).install_public_key(&details()).await.unwrap();
        assert!(!result.result);
        assert!(!ran_body(&h, "install"));
    }

    #[tokio::test]
    async fn test_uninstall_runs_body_only_when_ours() {
        let h = host(0);
        assert!(manager(&h).uninstall_public_key(&details()).await.unwrap().result);
        assert!(ran_body(&h, "uninstall"));

        let h = host(2);
        assert!(manager(&h).uninstall_public_key(&details()).await.unwrap().result);
        assert!(!ran_body(&h, "uninstall"));

        let h = host(3);
        assert!(!manager(&h).uninstall_public_key(&details()).await.unwrap().result);
        assert!(!ran_body(&h, "uninstall"));
    }

    #[tokio::test]
    async fn test_unrecognized_probe_code_is_error() {
        let h = host(127);
        let err = manager(&h).install_public_key(&details()).await.unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("unrecognized code 127"), "{}", msg);
        assert!(msg.contains("bastion"));
        assert_eq!(h.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_body_is_error() {
        let h = FakeHost::new(|cmd| {
            if cmd.starts_with("KEY=") {
                return exit("", 2);
            }
            exit("", 1)
        });
        let err = manager(&h).install_public_key(&details()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("SSH CA install script failed"));
        assert_eq!(h.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_winrm_target_rejected() {
        let h = host(0);
        let mut d = details();
        d.connection_type = ConnectionType::WinRm;
        assert!(manager(&h).is_public_key_installed(&d).await.is_err());
        assert_eq!(h.connects(), 0);
    }

    #[test]
    fn test_check_script_quotes_key_material() {
        let script = check_script("ssh-rsa AAAA'x comment with spaces");
        assert!(script.starts_with("KEY='ssh-rsa AAAA'\\''x'\n"));
        assert!(!script.contains("comment"));
    }

    #[test]
    fn test_check_script_reads_effective_sshd_config() {
        // Include'd drop-ins are only visible in the effective config
        let script = check_script("ssh-ed25519 AAAAC3Nz ca");
        assert!(script.contains("sudo sshd -T"));
        assert!(script.contains(r#"$1 == "trustedusercakeys""#));
        assert!(!script.contains("/etc/ssh/sshd_config"));
    }
}
