//! Host discovery over address ranges.
//!
//! A scan expands its range, then launches one probe per address and port.
//! At most `max_concurrency` probes hold a semaphore permit at any time; the
//! permit covers connect, handshake and identification. Results arrive on a
//! stream in completion order.

pub mod probe;
pub mod range;

pub use probe::{os_from_banner, DiscoveredHost, HostStatus, Prober, SshProber};
pub use range::{AddressRange, MAX_SCAN_ADDRESSES};

use crate::config::ScanSettings;
use crate::error::{EngineError, EngineResult};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Parameters of one scan
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub range: AddressRange,
    pub ports: Vec<u16>,
    pub timeout: Duration,
    pub max_concurrency: usize,
}

impl ScanRequest {
    pub fn new(range: AddressRange, ports: Vec<u16>, timeout: Duration, max_concurrency: usize) -> Self {
        Self {
            range,
            ports,
            timeout,
            max_concurrency,
        }
    }

    /// Parse `range` and fill the rest from settings.
    pub fn from_settings(range: &str, settings: &ScanSettings) -> EngineResult<Self> {
        Ok(Self::new(
            AddressRange::parse(range)?,
            settings.default_ports.clone(),
            Duration::from_secs(settings.probe_timeout_secs),
            settings.max_concurrency,
        ))
    }

    pub fn probe_estimate(&self) -> u128 {
        self.range.probe_estimate(self.ports.len())
    }

    fn validate(&self) -> EngineResult<()> {
        if self.ports.is_empty() {
            return Err(EngineError::Resource("Scan needs at least one port".into()));
        }
        if self.ports.contains(&0) {
            return Err(EngineError::Resource("Port 0 cannot be probed".into()));
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::Resource("max_concurrency must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(EngineError::Resource("Probe timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Runs scans with a given probe strategy
#[derive(Clone)]
pub struct Scanner {
    prober: Arc<dyn Prober>,
}

impl Scanner {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    /// Start a scan. Returns at once; results stream through the handle.
    ///
    /// Cancelling `cancel` stops new probes from launching. Probes already
    /// running finish but their results are dropped. Dropping the handle
    /// cancels the scan without touching `cancel` itself.
    pub fn scan(&self, request: ScanRequest, cancel: CancellationToken) -> EngineResult<ScanHandle> {
        request.validate()?;
        let cancel = cancel.child_token();

        let total_probes = request.probe_estimate();
        let (tx, rx) = mpsc::channel(request.max_concurrency.max(1) * 2);
        let prober = Arc::clone(&self.prober);
        let task_cancel = cancel.clone();

        tracing::info!(
            "Scanning {} on {} port(s), {} probe(s), concurrency {}",
            request.range,
            request.ports.len(),
            total_probes,
            request.max_concurrency
        );

        tokio::spawn(async move {
            run_scan(prober, request, tx, task_cancel).await;
        });

        Ok(ScanHandle {
            rx,
            cancel,
            total_probes,
        })
    }
}

async fn run_scan(
    prober: Arc<dyn Prober>,
    request: ScanRequest,
    tx: mpsc::Sender<DiscoveredHost>,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(request.max_concurrency));
    let mut launched: u64 = 0;

    'launch: for address in request.range.addresses() {
        for &port in &request.ports {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'launch,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'launch,
                },
            };

            let prober = Arc::clone(&prober);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let timeout = request.timeout;
            launched += 1;

            tokio::spawn(async move {
                let host = prober.probe(address, port, timeout).await;
                drop(permit);
                if cancel.is_cancelled() {
                    return;
                }
                if host.status == HostStatus::Success {
                    tracing::debug!("Found SSH host {}:{}", host.address, host.port);
                }
                let _ = tx.send(host).await;
            });
        }
    }

    if cancel.is_cancelled() {
        tracing::info!("Scan of {} cancelled after {} probe(s)", request.range, launched);
    } else {
        tracing::info!("Scan of {} launched {} probe(s)", request.range, launched);
    }
    // Stream ends once the last probe task drops its sender
}

/// Results of a running scan
pub struct ScanHandle {
    rx: mpsc::Receiver<DiscoveredHost>,
    cancel: CancellationToken,
    total_probes: u128,
}

impl ScanHandle {
    pub async fn next(&mut self) -> Option<DiscoveredHost> {
        self.rx.recv().await
    }

    /// Probes the range would need before the address cap
    pub fn total_probes(&self) -> u128 {
        self.total_probes
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the scan into a vector
    pub async fn collect(mut self) -> Vec<DiscoveredHost> {
        let mut hosts = Vec::new();
        while let Some(host) = self.rx.recv().await {
            hosts.push(host);
        }
        hosts
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for ScanHandle {
    type Item = DiscoveredHost;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted prober that tracks how many probes run at once
    #[derive(Default)]
    struct FakeProber {
        statuses: HashMap<IpAddr, HostStatus>,
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, address: IpAddr, port: u16, _timeout: Duration) -> DiscoveredHost {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let status = self.statuses.get(&address).copied().unwrap_or(HostStatus::Timeout);
            let mut host = DiscoveredHost::new(address, port, status);
            if status == HostStatus::Success {
                host.os = Some("Ubuntu".into());
            }
            host
        }
    }

    fn request(range: &str, ports: Vec<u16>, max_concurrency: usize) -> ScanRequest {
        ScanRequest::new(
            AddressRange::parse(range).unwrap(),
            ports,
            Duration::from_secs(1),
            max_concurrency,
        )
    }

    #[tokio::test]
    async fn test_slash_30_scenario() {
        let prober = FakeProber {
            statuses: HashMap::from([
                ("10.0.0.1".parse().unwrap(), HostStatus::Success),
                ("10.0.0.2".parse().unwrap(), HostStatus::Open),
            ]),
            ..Default::default()
        };
        let scanner = Scanner::new(Arc::new(prober));
        let handle = scanner
            .scan(request("10.0.0.0/30", vec![22], 2), CancellationToken::new())
            .unwrap();
        assert_eq!(handle.total_probes(), 4);

        let mut hosts = handle.collect().await;
        hosts.sort_by_key(|h| h.address);
        let statuses: Vec<_> = hosts.iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![
                HostStatus::Timeout,
                HostStatus::Success,
                HostStatus::Open,
                HostStatus::Timeout
            ]
        );
        assert_eq!(hosts[1].os.as_deref(), Some("Ubuntu"));
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let prober = Arc::new(FakeProber {
            delay: Duration::from_millis(10),
            ..Default::default()
        });
        let scanner = Scanner::new(prober.clone());
        let handle = scanner
            .scan(request("10.0.0.0/27", vec![22, 2222], 3), CancellationToken::new())
            .unwrap();

        let hosts: Vec<_> = handle.collect().await;
        assert_eq!(hosts.len(), 64);
        assert!(prober.peak.load(Ordering::SeqCst) <= 3);
        assert!(prober.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_launching() {
        let prober = Arc::new(FakeProber {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let scanner = Scanner::new(prober.clone());
        let cancel = CancellationToken::new();
        let mut handle = scanner.scan(request("10.0.0.0/24", vec![22], 2), cancel.clone()).unwrap();

        let first = handle.next().await;
        assert!(first.is_some());
        handle.cancel();

        let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(5), handle.collect())
            .await
            .unwrap();
        assert!(rest.len() < 255);
        assert!(prober.calls.load(Ordering::SeqCst) < 256);
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_scan() {
        let prober = Arc::new(FakeProber {
            delay: Duration::from_millis(5),
            ..Default::default()
        });
        let scanner = Scanner::new(prober.clone());
        let cancel = CancellationToken::new();
        let mut handle = scanner.scan(request("10.0.0.0/20", vec![22], 4), cancel.clone()).unwrap();

        assert!(handle.next().await.is_some());
        drop(handle);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = prober.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), settled);
        assert!(settled < 4096);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_handle_is_a_stream() {
        let scanner = Scanner::new(Arc::new(FakeProber::default()));
        let handle = scanner
            .scan(request("192.168.5.9", vec![22], 4), CancellationToken::new())
            .unwrap();
        let hosts: Vec<DiscoveredHost> = StreamExt::collect(handle).await;
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].address.to_string(), "192.168.5.9");
    }

    #[test]
    fn test_invalid_requests() {
        let range = AddressRange::parse("10.0.0.0/30").unwrap();
        assert!(ScanRequest::new(range, vec![], Duration::from_secs(1), 4).validate().is_err());
        assert!(ScanRequest::new(range, vec![22], Duration::from_secs(1), 0).validate().is_err());
        assert!(ScanRequest::new(range, vec![0], Duration::from_secs(1), 4).validate().is_err());
        assert!(ScanRequest::from_settings("10.0.0.0/40", &ScanSettings::default()).is_err());
    }
}
