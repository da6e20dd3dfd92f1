//! Peer discovery.
//!
//! Two sources feed one [`PeerTable`]: UDP broadcast announcements on the LAN
//! and a prober that calls `/api/sync/status` on configured and last-known
//! addresses. Neither source decides trust; the orchestrator filters the
//! table against the trust list.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clubsync_core::{SchemaVersion, SCHEMA_VERSION};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::{Identity, TrustStore};
use crate::sync::{Peer, SyncClient};

/// A peer seen within this window (inclusive) counts as online.
pub const ONLINE_GRACE_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    Online,
    Syncing,
    Offline,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Online => write!(f, "online"),
            PeerStatus::Syncing => write!(f, "syncing"),
            PeerStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub peer_id: Uuid,
    pub address: String,
    pub last_seen_at: DateTime<Utc>,
    #[serde(skip)]
    syncing: bool,
}

impl DiscoveredPeer {
    pub fn status_at(&self, now: DateTime<Utc>) -> PeerStatus {
        if self.syncing {
            PeerStatus::Syncing
        } else if now - self.last_seen_at <= ChronoDuration::seconds(ONLINE_GRACE_SECS) {
            PeerStatus::Online
        } else {
            PeerStatus::Offline
        }
    }
}

/// Shared, continuously updated view of reachable peers.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: Arc<RwLock<HashMap<Uuid, DiscoveredPeer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting. Later sightings move the address; older ones are
    /// ignored.
    pub async fn seen(&self, peer_id: Uuid, address: &str, at: DateTime<Utc>) {
        let mut peers = self.peers.write().await;
        match peers.get_mut(&peer_id) {
            Some(peer) if peer.last_seen_at > at => {}
            Some(peer) => {
                peer.last_seen_at = at;
                peer.address = address.to_string();
            }
            None => {
                tracing::info!(%peer_id, address, "Discovered peer");
                peers.insert(
                    peer_id,
                    DiscoveredPeer {
                        peer_id,
                        address: address.to_string(),
                        last_seen_at: at,
                        syncing: false,
                    },
                );
            }
        }
    }

    pub async fn set_syncing(&self, peer_id: Uuid, syncing: bool) {
        if let Some(peer) = self.peers.write().await.get_mut(&peer_id) {
            peer.syncing = syncing;
        }
    }

    /// Marks `peer_id` as syncing until the returned guard is dropped, which
    /// also happens when the exchange holding it is cancelled.
    pub async fn mark_syncing(&self, peer_id: Uuid) -> SyncingGuard {
        self.set_syncing(peer_id, true).await;
        SyncingGuard {
            table: self.clone(),
            peer_id,
        }
    }

    pub async fn status_of(&self, peer_id: Uuid, now: DateTime<Utc>) -> PeerStatus {
        self.peers
            .read()
            .await
            .get(&peer_id)
            .map(|p| p.status_at(now))
            .unwrap_or(PeerStatus::Offline)
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> Vec<(DiscoveredPeer, PeerStatus)> {
        let mut peers: Vec<_> = self
            .peers
            .read()
            .await
            .values()
            .map(|p| (p.clone(), p.status_at(now)))
            .collect();
        peers.sort_by(|a, b| a.0.address.cmp(&b.0.address));
        peers
    }

    /// Peers that are online (not offline) at `now`.
    pub async fn online(&self, now: DateTime<Utc>) -> Vec<Peer> {
        self.snapshot(now)
            .await
            .into_iter()
            .filter(|(_, status)| *status != PeerStatus::Offline)
            .map(|(p, _)| Peer {
                id: p.peer_id,
                address: p.address,
            })
            .collect()
    }
}

/// Clears a peer's syncing flag on drop.
pub struct SyncingGuard {
    table: PeerTable,
    peer_id: Uuid,
}

impl Drop for SyncingGuard {
    fn drop(&mut self) {
        if let Ok(mut peers) = self.table.peers.try_write() {
            if let Some(peer) = peers.get_mut(&self.peer_id) {
                peer.syncing = false;
            }
            return;
        }
        // Table is busy; clear it as soon as the lock is free.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let table = self.table.clone();
            let peer_id = self.peer_id;
            handle.spawn(async move { table.set_syncing(peer_id, false).await });
        }
    }
}

/// Payload of a LAN broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub network_id: Uuid,
    pub device_id: Uuid,
    /// Port of the announcing device's protocol server.
    pub port: u16,
    pub schema_version: SchemaVersion,
}

impl Announcement {
    /// The peer address this announcement points at, or `None` for our own
    /// and other networks' announcements.
    fn accept(&self, identity: &Identity, from: IpAddr) -> Option<String> {
        if self.device_id == identity.device_id || self.network_id != identity.network_id {
            return None;
        }
        // Still recorded: the exchange reports the incompatibility.
        if !SCHEMA_VERSION.is_compatible_with(&self.schema_version) {
            tracing::debug!(
                device_id = %self.device_id,
                schema = %self.schema_version,
                "Peer announces an incompatible schema"
            );
        }
        Some(format!("http://{}", SocketAddr::new(from, self.port)))
    }
}

/// Broadcasts our presence and listens for others on one UDP port.
pub struct LanDiscovery {
    identity: Identity,
    port: u16,
    listen_port: u16,
    interval: Duration,
    table: PeerTable,
}

impl LanDiscovery {
    pub fn new(
        identity: Identity,
        port: u16,
        listen_port: u16,
        interval: Duration,
        table: PeerTable,
    ) -> Self {
        Self {
            identity,
            port,
            listen_port,
            interval,
            table,
        }
    }

    /// Binds the discovery port and starts the announcer and listener tasks.
    pub async fn spawn(self) -> std::io::Result<Vec<JoinHandle<()>>> {
        let socket =
            UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.port)).await?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        tracing::info!(port = self.port, "LAN discovery started");

        let announcement = Announcement {
            network_id: self.identity.network_id,
            device_id: self.identity.device_id,
            port: self.listen_port,
            schema_version: SCHEMA_VERSION,
        };
        let message = serde_json::to_vec(&announcement).map_err(std::io::Error::other)?;
        let target = SocketAddr::new(Ipv4Addr::BROADCAST.into(), self.port);

        let sender = socket.clone();
        let interval = self.interval;
        let announcer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = sender.send_to(&message, target).await {
                    tracing::debug!(error = %e, "Announcement failed");
                }
            }
        });

        let identity = self.identity;
        let table = self.table;
        let listener = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!(error = %e, "Discovery receive failed");
                        continue;
                    }
                };
                let Ok(announcement) = serde_json::from_slice::<Announcement>(&buf[..len]) else {
                    continue;
                };
                if let Some(address) = announcement.accept(&identity, from.ip()) {
                    table.seen(announcement.device_id, &address, Utc::now()).await;
                }
            }
        });

        Ok(vec![announcer, listener])
    }
}

/// Probes configured and last-known addresses via the status endpoint.
pub struct StaticProber {
    pool: SqlitePool,
    identity: Identity,
    addresses: Vec<String>,
    interval: Duration,
    request_timeout: Duration,
    table: PeerTable,
}

impl StaticProber {
    pub fn new(
        pool: SqlitePool,
        identity: Identity,
        addresses: Vec<String>,
        interval: Duration,
        request_timeout: Duration,
        table: PeerTable,
    ) -> Self {
        Self {
            pool,
            identity,
            addresses,
            interval,
            request_timeout,
            table,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.probe_all().await;
            }
        })
    }

    /// One probing round. Returns the number of peers that answered.
    pub async fn probe_all(&self) -> usize {
        let mut addresses = self.addresses.clone();
        match TrustStore::new(self.pool.clone())
            .peers(self.identity.device_id)
            .await
        {
            Ok(peers) => addresses.extend(peers.into_iter().filter_map(|p| p.address)),
            Err(e) => tracing::warn!(error = %e, "Could not read trust list for probing"),
        }
        addresses.sort();
        addresses.dedup();

        join_all(addresses.iter().map(|a| self.probe(a)))
            .await
            .into_iter()
            .filter(|answered| *answered)
            .count()
    }

    async fn probe(&self, address: &str) -> bool {
        let client = match SyncClient::new(address, None, self.request_timeout) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(address, error = %e, "Invalid peer address");
                return false;
            }
        };
        match client.status().await {
            Ok(status) => {
                let same_network = match status.network_id {
                    Some(network) => network == self.identity.network_id,
                    None => true,
                };
                if status.device_id == self.identity.device_id || !same_network {
                    return false;
                }
                self.table
                    .seen(status.device_id, client.base_url(), Utc::now())
                    .await;
                true
            }
            Err(e) => {
                tracing::debug!(address, error = %e, "Probe failed");
                false
            }
        }
    }
}

/// Best-effort LAN address of this host, for the default advertise URL.
/// No packets are sent; connecting a UDP socket only selects a route.
pub fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}
