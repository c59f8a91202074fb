//! Authenticated SSH connections.
//!
//! One `RemoteConnection` wraps one `ssh2::Session`. It is owned by whoever
//! opened it (command execution, file transfer or a session worker) and is
//! never shared between concurrent operations.

use crate::config::{CredentialPreference, HostEntry, SshSettings};
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh2::Session as Ssh2Session;
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::io::Write;
use std::time::Duration;

/// Credential material for one login
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, alias = "key")]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

// SECURITY: never print credential material
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Default::default()
        }
    }

    pub fn private_key(key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            private_key: Some(key.into()),
            passphrase,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.private_key.is_none()
    }
}

/// Authentication method, in the order it will be attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    PrivateKey,
    Password,
}

/// Everything needed to open one connection
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host_id: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub connect_timeout: Duration,
    pub credential_preference: CredentialPreference,
    pub keepalive_interval: u32,
}

impl ConnectParams {
    pub fn new(
        host_id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        let defaults = SshSettings::default();
        Self {
            host_id: host_id.into(),
            address: address.into(),
            port,
            username: username.into(),
            credentials,
            connect_timeout: defaults.connect_timeout(),
            credential_preference: defaults.credential_preference,
            keepalive_interval: defaults.keepalive_interval,
        }
    }

    /// Build parameters for an inventory host using the engine's SSH settings.
    pub fn for_host(
        host: &HostEntry,
        username: impl Into<String>,
        credentials: Credentials,
        settings: &SshSettings,
    ) -> Self {
        Self {
            host_id: host.id.clone(),
            address: host.address.clone(),
            port: host.port,
            username: username.into(),
            credentials,
            connect_timeout: settings.connect_timeout(),
            credential_preference: settings.credential_preference,
            keepalive_interval: settings.keepalive_interval,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_preference(mut self, preference: CredentialPreference) -> Self {
        self.credential_preference = preference;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// An authenticated connection to one host
pub struct RemoteConnection {
    host_id: String,
    endpoint: String,
    session: Ssh2Session,
    connected_at: chrono::DateTime<chrono::Utc>,
}

impl fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("host_id", &self.host_id)
            .field("endpoint", &self.endpoint)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

impl RemoteConnection {
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }

    pub(crate) fn session(&self) -> &Ssh2Session {
        &self.session
    }

    /// Server identification string, e.g. `SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13`
    pub fn server_banner(&self) -> Option<String> {
        self.session.banner().map(|b| b.to_string())
    }

    /// Close the connection. Errors are logged, the socket is released either way.
    pub fn close(self) {
        disconnect_quietly(&self.session, &self.host_id);
    }
}

pub(crate) fn disconnect_quietly(session: &Ssh2Session, host_id: &str) {
    session.set_blocking(true);
    session.set_timeout(2_000);
    if let Err(e) = session.disconnect(None, "closed by opsrelay", None) {
        tracing::debug!("Disconnect from {} was not clean: {}", host_id, e);
    }
}

/// Open and authenticate a connection (blocking).
pub fn connect_blocking(params: &ConnectParams) -> EngineResult<RemoteConnection> {
    tracing::info!(
        "Connecting to {}@{} (host {})",
        params.username,
        params.endpoint(),
        params.host_id
    );

    let addr = resolve_endpoint(&params.address, params.port)?;
    let tcp = TcpStream::connect_timeout(&addr, params.connect_timeout)
        .map_err(|e| tcp_connect_error(&params.endpoint(), e, params.connect_timeout))?;
    tcp.set_nodelay(true)?;

    let mut session = Ssh2Session::new().map_err(|e| EngineError::Connection {
        host: params.endpoint(),
        message: format!("Failed to create SSH session: {}", e),
    })?;
    session.set_timeout(duration_to_millis(params.connect_timeout));
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| EngineError::Connection {
        host: params.endpoint(),
        message: format!("SSH handshake failed: {}", e),
    })?;

    authenticate(&session, params)?;

    if params.keepalive_interval > 0 {
        session.set_keepalive(true, params.keepalive_interval);
    }
    // Per-operation deadlines are enforced by the callers from here on
    session.set_timeout(0);

    Ok(RemoteConnection {
        host_id: params.host_id.clone(),
        endpoint: params.endpoint(),
        session,
        connected_at: chrono::Utc::now(),
    })
}

/// An unreachable endpoint is a connection failure, whether refused or timed out
fn tcp_connect_error(endpoint: &str, err: std::io::Error, timeout: Duration) -> EngineError {
    let message = if err.kind() == std::io::ErrorKind::TimedOut {
        format!("TCP connect timed out after {:?}", timeout)
    } else {
        format!("TCP connect failed: {}", err)
    };
    EngineError::Connection {
        host: endpoint.to_string(),
        message,
    }
}

/// Open and authenticate a connection without blocking the runtime.
pub async fn connect(params: &ConnectParams) -> EngineResult<RemoteConnection> {
    let params = params.clone();
    let host_id = params.host_id.clone();
    tokio::task::spawn_blocking(move || connect_blocking(&params))
        .await?
        .map_err(|e| e.context(host_id, "connect"))
}

pub(crate) fn resolve_endpoint(address: &str, port: u16) -> EngineResult<SocketAddr> {
    (address, port)
        .to_socket_addrs()
        .map_err(|e| EngineError::Connection {
            host: format!("{}:{}", address, port),
            message: format!("Invalid address: {}", e),
        })?
        .next()
        .ok_or_else(|| EngineError::Connection {
            host: format!("{}:{}", address, port),
            message: "Address did not resolve".to_string(),
        })
}

/// Order in which the supplied credentials are attempted.
pub fn auth_order(credentials: &Credentials, preference: CredentialPreference) -> Vec<AuthKind> {
    let preferred = match preference {
        CredentialPreference::KeyFirst => [AuthKind::PrivateKey, AuthKind::Password],
        CredentialPreference::PasswordFirst => [AuthKind::Password, AuthKind::PrivateKey],
    };
    preferred
        .into_iter()
        .filter(|kind| match kind {
            AuthKind::PrivateKey => credentials.private_key.is_some(),
            AuthKind::Password => credentials.password.is_some(),
        })
        .collect()
}

/// Authenticate, falling back to the other credential when the preferred one is rejected.
pub(crate) fn authenticate(session: &Ssh2Session, params: &ConnectParams) -> EngineResult<()> {
    let order = auth_order(&params.credentials, params.credential_preference);
    if order.is_empty() {
        return Err(EngineError::Auth {
            host: params.host_id.clone(),
            message: "No password or private key supplied".to_string(),
        });
    }

    let mut last_failure = String::new();
    for kind in order {
        let result = match kind {
            AuthKind::PrivateKey => authenticate_key(session, params),
            AuthKind::Password => session
                .userauth_password(
                    &params.username,
                    params.credentials.password.as_deref().unwrap_or_default(),
                )
                .map_err(|_| "Password authentication failed".to_string()),
        };

        match result {
            Ok(()) if session.authenticated() => {
                tracing::info!("SSH authentication successful ({:?}, host {})", kind, params.host_id);
                return Ok(());
            }
            Ok(()) => last_failure = "Authentication incomplete".to_string(),
            Err(msg) => {
                tracing::debug!("{:?} authentication rejected for host {}", kind, params.host_id);
                last_failure = msg;
            }
        }
    }

    Err(EngineError::Auth {
        host: params.host_id.clone(),
        message: last_failure,
    })
}

/// Private key in a temp file for the lifetime of one auth attempt.
/// The file is created 0600 and removed on drop.
fn write_temp_key(key_data: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new().prefix("opsrelay_key_").tempfile()?;
    file.write_all(key_data.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn authenticate_key(session: &Ssh2Session, params: &ConnectParams) -> Result<(), String> {
    let key_data = params.credentials.private_key.as_deref().unwrap_or_default();
    let key_file = write_temp_key(key_data).map_err(|e| format!("Failed to write temp key file: {}", e))?;

    session
        .userauth_pubkey_file(
            &params.username,
            None,
            key_file.path(),
            params.credentials.passphrase.as_deref(),
        )
        .map_err(|e| {
            let msg = e.to_string().to_lowercase();
            if msg.contains("passphrase") || msg.contains("decrypt") || msg.contains("parse") {
                "Invalid passphrase or key format".to_string()
            } else {
                "Private key not accepted by server".to_string()
            }
        })
}

pub(crate) fn duration_to_millis(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}

/// Compute SHA256 fingerprint of a host key
pub(crate) fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}
