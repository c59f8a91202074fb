pub mod commands;
pub mod connection;
pub mod exec;
pub mod protocol;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;

pub use connection::*;
pub use exec::{execute_command, CommandError, CommandOutput};
pub use session::*;

use crate::config::SessionSettings;
use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Owns every live session, keyed by session id
pub struct SessionRegistry {
    connector: Arc<dyn ShellConnector>,
    settings: SessionSettings,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn ShellConnector>, settings: SessionSettings) -> Self {
        Self {
            connector,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a session and register it
    pub async fn create(&self, params: &ConnectParams, size: PtySize) -> EngineResult<Arc<Session>> {
        let session = Arc::new(
            Session::open(Arc::clone(&self.connector), params, size, &self.settings).await?,
        );

        let displaced = self
            .sessions
            .lock()
            .insert(session.id().to_string(), Arc::clone(&session));
        if let Some(old) = displaced {
            // Ids are unique per process; reaching this means a clock went backwards across processes
            tracing::warn!("Replaced session with duplicate id {}", old.id());
            old.close().await;
        }

        tracing::info!(
            "Created session {} for {}@{}",
            session.id(),
            params.username,
            params.endpoint()
        );
        Ok(session)
    }

    /// Get a session by ID
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Any session for the host
    pub fn get_by_host(&self, host_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .values()
            .find(|s| s.host_id() == host_id)
            .cloned()
    }

    /// Remove and close one session
    pub async fn close(&self, id: &str) -> EngineResult<()> {
        let session = self
            .sessions
            .lock()
            .remove(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;

        session.close().await;
        tracing::info!("Disconnected session: {}", id);
        Ok(())
    }

    /// Remove and close every session for a host, returns how many were closed
    pub async fn close_all_for_host(&self, host_id: &str) -> usize {
        let removed = self.take_where(|s| s.host_id() == host_id);
        let count = removed.len();
        close_all(removed).await;
        if count > 0 {
            tracing::info!("Closed {} session(s) for host {}", count, host_id);
        }
        count
    }

    /// Close sessions idle for longer than `max_idle`
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        self.reap_idle_at(Instant::now(), max_idle).await
    }

    pub(crate) async fn reap_idle_at(&self, now: Instant, max_idle: Duration) -> usize {
        let removed = self.take_where(|s| s.idle_for(now) > max_idle);
        let count = removed.len();
        for session in &removed {
            tracing::info!(
                "Reaping idle session {} (idle {}s)",
                session.id(),
                session.idle_for(now).as_secs()
            );
        }
        close_all(removed).await;
        count
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.lock().values().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Close everything, used on shutdown
    pub async fn close_all(&self) -> usize {
        let removed: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        let count = removed.len();
        close_all(removed).await;
        count
    }

    /// Run `reap_idle` every `interval` until `token` is cancelled.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = registry.reap_idle(max_idle).await;
                        if reaped > 0 {
                            tracing::debug!("Reaper closed {} session(s)", reaped);
                        }
                    }
                }
            }
            tracing::debug!("Session reaper stopped");
        })
    }

    fn take_where(&self, mut predicate: impl FnMut(&Session) -> bool) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        let ids: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| predicate(s))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| sessions.remove(id)).collect()
    }
}

async fn close_all(sessions: Vec<Arc<Session>>) {
    futures::future::join_all(sessions.iter().map(|s| s.close())).await;
}
