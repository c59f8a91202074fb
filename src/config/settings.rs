use crate::error::EngineResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which credential is tried first when a request carries both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPreference {
    #[default]
    KeyFirst,
    PasswordFirst,
}

/// Engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
    #[serde(default)]
    pub credential_preference: CredentialPreference,
    #[serde(default = "default_terminal")]
    pub terminal_type: String,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u32 {
    20
}

fn default_terminal() -> String {
    "xterm-256color".to_string()
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval: default_keepalive(),
            credential_preference: CredentialPreference::default(),
            terminal_type: default_terminal(),
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_rows")]
    pub default_rows: u32,
    #[serde(default = "default_cols")]
    pub default_cols: u32,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
}

fn default_rows() -> u32 {
    24
}

fn default_cols() -> u32 {
    80
}

fn default_read_timeout() -> u64 {
    100
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_idle_timeout() -> u64 {
    30 * 60
}

fn default_reap_interval() -> u64 {
    60
}

fn default_output_buffer() -> usize {
    256
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_rows: default_rows(),
            default_cols: default_cols(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
            output_buffer: default_output_buffer(),
        }
    }
}

impl SessionSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Credentials used for post-handshake identification during scans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeCredentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(default = "default_scan_ports")]
    pub default_ports: Vec<u16>,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub identify_with: Option<ProbeCredentials>,
}

fn default_scan_ports() -> Vec<u16> {
    vec![22]
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_max_concurrency() -> usize {
    64
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            default_ports: default_scan_ports(),
            probe_timeout_secs: default_probe_timeout(),
            max_concurrency: default_max_concurrency(),
            identify_with: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    32 * 1024
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

impl EngineSettings {
    pub fn load(config_dir: &Path) -> EngineResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: EngineSettings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            let settings = EngineSettings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_dir: &Path) -> EngineResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings::load(dir.path()).unwrap();
        assert!(dir.path().join("config.toml").exists());
        assert_eq!(settings.ssh.default_port, 22);
        assert_eq!(settings.transfer.chunk_size, 32 * 1024);
        assert_eq!(settings.ssh.credential_preference, CredentialPreference::KeyFirst);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[ssh]\ncredential_preference = \"password_first\"\n\n[scan]\nmax_concurrency = 8\n",
        )
        .unwrap();

        let settings = EngineSettings::load(dir.path()).unwrap();
        assert_eq!(
            settings.ssh.credential_preference,
            CredentialPreference::PasswordFirst
        );
        assert_eq!(settings.scan.max_concurrency, 8);
        assert_eq!(settings.scan.default_ports, vec![22]);
        assert_eq!(settings.session.default_cols, 80);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[ssh\n").unwrap();
        let err = EngineSettings::load(dir.path()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
