//! Single-target probes.

use crate::config::ProbeCredentials;
use crate::ssh::connection::{authenticate, compute_sha256_fingerprint, disconnect_quietly, duration_to_millis};
use crate::ssh::exec::execute_blocking;
use crate::ssh::{ConnectParams, Credentials};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ssh2::Session as Ssh2Session;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Outcome class of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Handshake completed
    Success,
    /// Port accepted the connection but no SSH handshake
    Open,
    /// Nothing answered in time
    Timeout,
    Error,
}

/// What a probe learned about one address and port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredHost {
    pub address: IpAddr,
    pub port: u16,
    pub status: HostStatus,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub banner: Option<String>,
    pub host_key_fingerprint: Option<String>,
}

impl DiscoveredHost {
    pub fn new(address: IpAddr, port: u16, status: HostStatus) -> Self {
        Self {
            address,
            port,
            status,
            hostname: None,
            os: None,
            banner: None,
            host_key_fingerprint: None,
        }
    }
}

#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Probe one target. Never fails; problems show up in `status`.
    async fn probe(&self, address: IpAddr, port: u16, timeout: Duration) -> DiscoveredHost;
}

/// Probes by TCP connect and SSH handshake
#[derive(Debug, Clone, Default)]
pub struct SshProber {
    identify_with: Option<ProbeCredentials>,
}

impl SshProber {
    pub fn new(identify_with: Option<ProbeCredentials>) -> Self {
        Self { identify_with }
    }
}

#[async_trait]
impl Prober for SshProber {
    async fn probe(&self, address: IpAddr, port: u16, timeout: Duration) -> DiscoveredHost {
        let target = SocketAddr::new(address, port);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::trace!("Connect to {} failed: {}", target, e);
                return DiscoveredHost::new(address, port, HostStatus::Timeout);
            }
            Err(_) => return DiscoveredHost::new(address, port, HostStatus::Timeout),
        };

        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("Could not detach stream for {}: {}", target, e);
                return DiscoveredHost::new(address, port, HostStatus::Error);
            }
        };
        if let Err(e) = stream.set_nonblocking(false) {
            tracing::debug!("Could not switch {} to blocking: {}", target, e);
            return DiscoveredHost::new(address, port, HostStatus::Error);
        }

        let identify_with = self.identify_with.clone();
        tokio::task::spawn_blocking(move || handshake(stream, target, timeout, identify_with.as_ref()))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Probe task for {} failed: {}", target, e);
                DiscoveredHost::new(address, port, HostStatus::Error)
            })
    }
}

fn handshake(
    stream: std::net::TcpStream,
    target: SocketAddr,
    timeout: Duration,
    identify_with: Option<&ProbeCredentials>,
) -> DiscoveredHost {
    let mut host = DiscoveredHost::new(target.ip(), target.port(), HostStatus::Open);

    let mut session = match Ssh2Session::new() {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Failed to create SSH session: {}", e);
            host.status = HostStatus::Error;
            return host;
        }
    };
    session.set_tcp_stream(stream);
    session.set_timeout(duration_to_millis(timeout));

    if let Err(e) = session.handshake() {
        tracing::trace!("No SSH handshake with {}: {}", target, e);
        return host;
    }

    host.status = HostStatus::Success;
    host.banner = session.banner().map(str::to_string);
    host.os = host.banner.as_deref().and_then(os_from_banner);
    host.host_key_fingerprint = session.host_key().map(|(key, _)| compute_sha256_fingerprint(key));

    if let Some(creds) = identify_with {
        identify(&session, target, timeout, creds, &mut host);
    }

    disconnect_quietly(&session, &target.to_string());
    host
}

/// Authenticated lookups; any failure leaves `host` as it was.
fn identify(session: &Ssh2Session, target: SocketAddr, timeout: Duration, creds: &ProbeCredentials, host: &mut DiscoveredHost) {
    let params = ConnectParams::new(
        target.to_string(),
        target.ip().to_string(),
        target.port(),
        creds.username.clone(),
        Credentials {
            password: creds.password.clone(),
            private_key: creds.private_key.clone(),
            passphrase: None,
        },
    );
    if authenticate(session, &params).is_err() {
        tracing::debug!("Identification login to {} rejected", target);
        return;
    }

    let hostname = execute_blocking(session, "hostname", timeout);
    if hostname.success() {
        host.hostname = non_empty(&hostname.stdout);
    }
    let uname = execute_blocking(session, "uname -sr", timeout);
    if uname.success() {
        if let Some(os) = non_empty(&uname.stdout) {
            host.os = Some(os);
        }
    }
}

fn non_empty(output: &str) -> Option<String> {
    let trimmed = output.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Guess the operating system from an SSH identification string
pub fn os_from_banner(banner: &str) -> Option<String> {
    let lower = banner.to_ascii_lowercase();
    let known = [
        ("ubuntu", "Ubuntu"),
        ("debian", "Debian"),
        ("raspbian", "Raspbian"),
        ("freebsd", "FreeBSD"),
        ("openbsd", "OpenBSD"),
        ("netbsd", "NetBSD"),
        ("windows", "Windows"),
        ("fedora", "Fedora"),
        ("el7", "Enterprise Linux 7"),
        ("el8", "Enterprise Linux 8"),
        ("el9", "Enterprise Linux 9"),
        ("dropbear", "Embedded Linux (Dropbear)"),
        ("rosssh", "RouterOS"),
        ("cisco", "Cisco IOS"),
    ];
    known
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, os)| os.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_from_banner() {
        assert_eq!(
            os_from_banner("SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.6").as_deref(),
            Some("Ubuntu")
        );
        assert_eq!(
            os_from_banner("SSH-2.0-OpenSSH_for_Windows_8.1").as_deref(),
            Some("Windows")
        );
        assert_eq!(os_from_banner("SSH-2.0-dropbear_2022.83").as_deref(), Some("Embedded Linux (Dropbear)"));
        assert_eq!(os_from_banner("SSH-2.0-OpenSSH_9.6"), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let host = DiscoveredHost::new("10.0.0.1".parse().unwrap(), 22, HostStatus::Timeout);
        let json = serde_json::to_value(&host).unwrap();
        assert_eq!(json["status"], "timeout");
        assert_eq!(json["address"], "10.0.0.1");
    }

    #[tokio::test]
    async fn test_closed_port_is_timeout() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let host = SshProber::default()
            .probe("127.0.0.1".parse().unwrap(), port, Duration::from_secs(1))
            .await;
        assert_eq!(host.status, HostStatus::Timeout);
    }

    #[tokio::test]
    async fn test_non_ssh_listener_is_open() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            }
        });

        let host = SshProber::default()
            .probe("127.0.0.1".parse().unwrap(), port, Duration::from_secs(2))
            .await;
        assert_eq!(host.status, HostStatus::Open);
        assert!(host.banner.is_none());
    }
}
