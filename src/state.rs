use crate::config::{EngineSettings, HostResolver, HostTable};
use crate::error::{EngineError, EngineResult};
use crate::scan::{AddressRange, Prober, ScanHandle, ScanRequest, Scanner, SshProber};
use crate::sftp::commands::FileService;
use crate::ssh::{
    connect, execute_command, CommandOutput, ConnectParams, Credentials, PtySize, Session, SessionRegistry,
    ShellConnector, SshConnector,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Engine state shared by every caller
pub struct Engine {
    pub settings: Arc<EngineSettings>,
    pub registry: Arc<SessionRegistry>,
    pub hosts: Arc<dyn HostResolver>,
    pub scanner: Scanner,
    pub files: FileService,
}

impl Engine {
    /// Engine backed by real SSH connections
    pub fn new(settings: EngineSettings, hosts: Arc<dyn HostResolver>) -> Self {
        let connector = Arc::new(SshConnector::new(settings.ssh.terminal_type.clone()));
        let prober = Arc::new(SshProber::new(settings.scan.identify_with.clone()));
        Self::with_parts(settings, hosts, connector, prober)
    }

    pub fn with_parts(
        settings: EngineSettings,
        hosts: Arc<dyn HostResolver>,
        connector: Arc<dyn ShellConnector>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(connector, settings.session.clone()));
        let files = FileService::new(Arc::clone(&hosts), settings.ssh.clone(), settings.transfer.clone());

        Self {
            settings: Arc::new(settings),
            registry,
            hosts,
            scanner: Scanner::new(prober),
            files,
        }
    }

    /// Load `config.toml` and `hosts.toml` from `config_dir`
    pub fn load(config_dir: &Path) -> EngineResult<Self> {
        let settings = EngineSettings::load(config_dir)?;
        let hosts = HostTable::load(config_dir)?;
        tracing::info!("Loaded {} host(s) from {:?}", hosts.len(), config_dir);
        Ok(Self::new(settings, Arc::new(hosts)))
    }

    pub fn connect_params(
        &self,
        host_id: &str,
        username: &str,
        credentials: Credentials,
    ) -> EngineResult<ConnectParams> {
        let host = self
            .hosts
            .resolve(host_id)
            .ok_or_else(|| EngineError::HostNotFound(host_id.to_string()))?;
        Ok(ConnectParams::for_host(&host, username, credentials, &self.settings.ssh))
    }

    /// Open an interactive session on an inventory host
    pub async fn open_session(
        &self,
        host_id: &str,
        username: &str,
        credentials: Credentials,
        size: Option<PtySize>,
    ) -> EngineResult<Arc<Session>> {
        let params = self.connect_params(host_id, username, credentials)?;
        let size = size.unwrap_or(PtySize::new(
            self.settings.session.default_rows,
            self.settings.session.default_cols,
        ));
        self.registry.create(&params, size).await
    }

    /// Connect, run one command, disconnect
    pub async fn execute(
        &self,
        host_id: &str,
        username: &str,
        credentials: Credentials,
        command: &str,
        timeout: Duration,
    ) -> EngineResult<CommandOutput> {
        let params = self.connect_params(host_id, username, credentials)?;
        let connection = connect(&params).await?;
        let output = execute_command(&connection, command, timeout).await;
        connection.close();
        Ok(output)
    }

    /// Start a scan; the handle is returned before any probe completes
    pub fn scan(
        &self,
        range: &str,
        ports: Vec<u16>,
        timeout_secs: u64,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> EngineResult<ScanHandle> {
        let request = ScanRequest::new(
            AddressRange::parse(range)?,
            ports,
            Duration::from_secs(timeout_secs),
            max_concurrency,
        );
        self.scanner.scan(request, cancel)
    }

    /// Scan with ports, timeout and concurrency from settings
    pub fn scan_with_defaults(&self, range: &str, cancel: CancellationToken) -> EngineResult<ScanHandle> {
        let request = ScanRequest::from_settings(range, &self.settings.scan)?;
        self.scanner.scan(request, cancel)
    }

    /// Periodic idle reaping using the session settings
    pub fn start_reaper(&self, token: CancellationToken) -> JoinHandle<()> {
        self.registry.spawn_reaper(
            self.settings.session.reap_interval(),
            self.settings.session.idle_timeout(),
            token,
        )
    }

    /// Close every session
    pub async fn shutdown(&self) -> usize {
        let closed = self.registry.close_all().await;
        tracing::info!("Engine shut down, closed {} session(s)", closed);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostEntry;
    use crate::scan::{DiscoveredHost, HostStatus};
    use crate::ssh::testing::FakeConnector;
    use async_trait::async_trait;
    use std::net::IpAddr;

    struct EveryoneAnswers;

    #[async_trait]
    impl Prober for EveryoneAnswers {
        async fn probe(&self, address: IpAddr, port: u16, _timeout: Duration) -> DiscoveredHost {
            DiscoveredHost::new(address, port, HostStatus::Success)
        }
    }

    fn engine() -> Engine {
        let hosts = HostTable::from_entries([HostEntry::new("web-01", "10.0.0.2", 22)]);
        Engine::with_parts(
            EngineSettings::default(),
            Arc::new(hosts),
            Arc::new(FakeConnector::new()),
            Arc::new(EveryoneAnswers),
        )
    }

    #[tokio::test]
    async fn test_open_session_uses_default_size() {
        let engine = engine();
        let session = engine
            .open_session("web-01", "ops", Credentials::password("pw"), None)
            .await
            .unwrap();
        assert_eq!(session.size(), PtySize::new(24, 80));
        assert_eq!(engine.registry.len(), 1);

        assert_eq!(engine.shutdown().await, 1);
        assert!(engine.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_host_is_rejected() {
        let engine = engine();
        let err = engine
            .open_session("db-09", "ops", Credentials::password("pw"), None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "HOST_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_scan_returns_handle() {
        let engine = engine();
        let handle = engine
            .scan("10.0.0.0/30", vec![22], 1, 2, CancellationToken::new())
            .unwrap();
        assert_eq!(handle.total_probes(), 4);
        assert_eq!(handle.collect().await.len(), 4);

        assert!(engine
            .scan("10.0.0.0/99", vec![22], 1, 2, CancellationToken::new())
            .is_err());
    }
}
