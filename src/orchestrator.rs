//! Background sync scheduling.
//!
//! One orchestrator per process. It owns the interval timer, walks the peer
//! list sequentially and folds every [`PeerOutcome`] into one [`SyncResult`].
//! State is readable on demand with [`SyncOrchestrator::status`] and pushed
//! to subscribers through a `watch` channel.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clubsync_core::{EntityCounts, SyncConflict, SyncError};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::{ConflictStore, TrustStore};
use crate::discovery::PeerTable;
use crate::sync::{Peer, PeerExchange, PeerOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Stopped,
    Idle,
    Syncing,
    Error(String),
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Stopped => write!(f, "stopped"),
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// Aggregate of one sync cycle across all peers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub pushed: EntityCounts,
    pub pulled: EntityCounts,
    pub conflicts: Vec<SyncConflict>,
    pub peers_synced: usize,
    pub peers_failed: usize,
    /// Schema-blocked peers the timer left alone.
    pub peers_skipped: usize,
    /// The first peer failure of the cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    fn begin(at: DateTime<Utc>) -> Self {
        Self {
            pushed: EntityCounts::default(),
            pulled: EntityCounts::default(),
            conflicts: Vec::new(),
            peers_synced: 0,
            peers_failed: 0,
            peers_skipped: 0,
            error: None,
            started_at: at,
            finished_at: at,
        }
    }

    fn absorb(&mut self, outcome: PeerOutcome) {
        match outcome {
            PeerOutcome::Synced { report, .. } => {
                self.peers_synced += 1;
                self.pushed.merge(&report.pushed);
                self.pulled.merge(&report.pulled);
                self.conflicts.extend(report.conflicts);
            }
            PeerOutcome::Failed { peer_id, error } => {
                self.peers_failed += 1;
                if self.error.is_none() {
                    self.error = Some(format!("{}: {}", peer_id, error));
                }
            }
        }
    }

    fn fail(&mut self, error: String) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// The state a cycle with this result ends in.
    fn end_state(&self) -> SyncState {
        if let Some(error) = &self.error {
            SyncState::Error(error.clone())
        } else if !self.conflicts.is_empty() {
            SyncState::Error(format!(
                "{} conflict(s) need resolution",
                self.conflicts.len()
            ))
        } else {
            SyncState::Idle
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_result: Option<SyncResult>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Sync already in progress")]
    AlreadySyncing,
    #[error("Sync orchestrator is not running")]
    NotRunning,
    #[error("Sync orchestrator is already running")]
    AlreadyRunning,
}

/// Supplies the peers a cycle should visit.
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn peers(&self) -> Result<Vec<Peer>, SyncError>;
}

/// Trusted peers that discovery currently sees online.
pub struct TrustedPeers {
    pool: SqlitePool,
    self_id: Uuid,
    table: PeerTable,
}

impl TrustedPeers {
    pub fn new(pool: SqlitePool, self_id: Uuid, table: PeerTable) -> Self {
        Self {
            pool,
            self_id,
            table,
        }
    }
}

#[async_trait]
impl PeerSource for TrustedPeers {
    async fn peers(&self) -> Result<Vec<Peer>, SyncError> {
        let trusted: HashSet<Uuid> = TrustStore::new(self.pool.clone())
            .peers(self.self_id)
            .await
            .map_err(|e| SyncError::Validation(format!("Local store: {}", e)))?
            .into_iter()
            .map(|d| d.id)
            .collect();

        Ok(self
            .table
            .online(Utc::now())
            .await
            .into_iter()
            .filter(|p| trusted.contains(&p.id))
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub interval: Duration,
    pub peer_timeout: Duration,
    pub conflict_retention_days: i64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            peer_timeout: Duration::from_secs(60),
            conflict_retention_days: 30,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Explicit,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    exchange: Arc<dyn PeerExchange>,
    peers: Arc<dyn PeerSource>,
    settings: OrchestratorSettings,
    conflicts: Option<ConflictStore>,
    table: Option<PeerTable>,
    status: watch::Sender<SyncStatus>,
    timer: Mutex<Option<JoinHandle<()>>>,
    schema_blocked: Mutex<HashSet<Uuid>>,
}

impl SyncOrchestrator {
    pub fn new(
        exchange: Arc<dyn PeerExchange>,
        peers: Arc<dyn PeerSource>,
        settings: OrchestratorSettings,
        conflicts: Option<ConflictStore>,
        table: Option<PeerTable>,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus {
            state: SyncState::Stopped,
            last_result: None,
        });
        Self {
            inner: Arc::new(Inner {
                exchange,
                peers,
                settings,
                conflicts,
                table,
                status,
                timer: Mutex::new(None),
                schema_blocked: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Moves to `Idle` and starts the interval timer. The first timed cycle
    /// runs one interval from now.
    pub fn start(&self) -> Result<(), OrchestratorError> {
        let mut timer = lock(&self.inner.timer);
        if timer.is_some() {
            return Err(OrchestratorError::AlreadyRunning);
        }

        self.inner.status.send_modify(|s| s.state = SyncState::Idle);

        let this = self.clone();
        let period = self.inner.settings.interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match this.cycle(Trigger::Timer).await {
                    Ok(_) => {}
                    Err(OrchestratorError::AlreadySyncing) => {
                        tracing::debug!("Skipping timed sync; a sync is in progress");
                    }
                    Err(_) => break,
                }
            }
        }));

        tracing::info!(interval_secs = period.as_secs(), "Sync orchestrator started");
        Ok(())
    }

    /// Runs a cycle now, including peers the timer skips for schema reasons.
    pub async fn sync_now(&self) -> Result<SyncResult, OrchestratorError> {
        self.cycle(Trigger::Explicit).await
    }

    /// Cancels the timer from any state.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.inner.timer).take() {
            handle.abort();
        }
        self.inner.status.send_modify(|s| s.state = SyncState::Stopped);
        tracing::info!("Sync orchestrator stopped");
    }

    fn begin(&self) -> Result<(), OrchestratorError> {
        let mut rejected = None;
        self.inner.status.send_if_modified(|s| match s.state {
            SyncState::Stopped => {
                rejected = Some(OrchestratorError::NotRunning);
                false
            }
            SyncState::Syncing => {
                rejected = Some(OrchestratorError::AlreadySyncing);
                false
            }
            _ => {
                s.state = SyncState::Syncing;
                true
            }
        });
        rejected.map_or(Ok(()), Err)
    }

    async fn cycle(&self, trigger: Trigger) -> Result<SyncResult, OrchestratorError> {
        self.begin()?;
        let mut result = SyncResult::begin(Utc::now());

        match self.inner.peers.peers().await {
            Ok(peers) => {
                tracing::debug!(peers = peers.len(), "Starting sync cycle");
                for peer in peers {
                    if trigger == Trigger::Timer && self.is_schema_blocked(peer.id) {
                        tracing::debug!(peer_id = %peer.id, "Skipping schema-incompatible peer");
                        result.peers_skipped += 1;
                        continue;
                    }
                    let outcome = self.exchange_with(&peer).await;
                    self.note_schema(&outcome);
                    result.absorb(outcome);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not list peers");
                result.fail(e.to_string());
            }
        }

        self.maintain().await;
        result.finished_at = Utc::now();

        let end = result.end_state();
        tracing::info!(
            synced = result.peers_synced,
            failed = result.peers_failed,
            pushed = result.pushed.total(),
            pulled = result.pulled.total(),
            conflicts = result.conflicts.len(),
            state = %end,
            "Sync cycle finished"
        );

        let finished = result.clone();
        self.inner.status.send_modify(|s| {
            // A stop during the cycle wins.
            if s.state != SyncState::Stopped {
                s.state = end;
            }
            s.last_result = Some(finished);
        });
        Ok(result)
    }

    async fn exchange_with(&self, peer: &Peer) -> PeerOutcome {
        let syncing = match &self.inner.table {
            Some(table) => Some(table.mark_syncing(peer.id).await),
            None => None,
        };

        let timeout = self.inner.settings.peer_timeout;
        let outcome = match tokio::time::timeout(timeout, self.inner.exchange.exchange(peer)).await
        {
            Ok(outcome) => outcome,
            Err(_) => PeerOutcome::Failed {
                peer_id: peer.id,
                error: SyncError::PeerUnreachable(format!(
                    "exchange did not finish within {}s",
                    timeout.as_secs_f32()
                )),
            },
        };

        drop(syncing);
        if let PeerOutcome::Failed { peer_id, error } = &outcome {
            tracing::warn!(%peer_id, %error, "Peer sync failed");
        }
        outcome
    }

    fn is_schema_blocked(&self, peer_id: Uuid) -> bool {
        lock(&self.inner.schema_blocked).contains(&peer_id)
    }

    fn note_schema(&self, outcome: &PeerOutcome) {
        let mut blocked = lock(&self.inner.schema_blocked);
        match outcome {
            PeerOutcome::Failed { peer_id, error } if !error.is_retryable() => {
                blocked.insert(*peer_id);
            }
            PeerOutcome::Synced { peer_id, .. } => {
                blocked.remove(peer_id);
            }
            PeerOutcome::Failed { .. } => {}
        }
    }

    /// Settles acknowledged conflicts and purges old ones.
    async fn maintain(&self) {
        let Some(conflicts) = &self.inner.conflicts else {
            return;
        };
        let now = Utc::now();
        match conflicts.mark_acknowledged(now).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "Conflicts acknowledged by peers"),
            Err(e) => tracing::warn!(error = %e, "Failed to settle acknowledged conflicts"),
        }
        let cutoff = now - ChronoDuration::days(self.inner.settings.conflict_retention_days);
        match conflicts.purge_synced(cutoff).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "Purged settled conflicts"),
            Err(e) => tracing::warn!(error = %e, "Failed to purge settled conflicts"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
