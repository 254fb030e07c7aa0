use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::model::{BanEntry, ProtectedServer};
use super::store::RegistrySource;
use super::RegistryError;

/// Immutable view of routes and bans for lock-free reads.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    /// Active servers indexed by proxy port.
    servers: HashMap<u16, ProtectedServer>,
    /// Effective bans, canonicalized.
    banned: HashSet<IpAddr>,
    /// When the snapshot was built. `None` before the first refresh.
    refreshed_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    /// Build a snapshot from raw store rows.
    ///
    /// Inactive servers and bans not in force at `now` are dropped. When two
    /// active servers claim the same proxy port the lowest id wins.
    pub fn build(
        mut servers: Vec<ProtectedServer>,
        bans: Vec<BanEntry>,
        now: DateTime<Utc>,
    ) -> Self {
        servers.sort_by_key(|s| s.id);

        let mut by_port: HashMap<u16, ProtectedServer> = HashMap::with_capacity(servers.len());
        for server in servers.into_iter().filter(ProtectedServer::is_active) {
            if let Some(existing) = by_port.get(&server.proxy_port) {
                warn!(
                    proxy_port = server.proxy_port,
                    kept_id = existing.id,
                    ignored_id = server.id,
                    "Duplicate active server for proxy port"
                );
                continue;
            }
            by_port.insert(server.proxy_port, server);
        }

        let mut banned = HashSet::with_capacity(bans.len());
        for ban in bans.iter().filter(|b| b.is_effective(now)) {
            match ban.address.trim().parse::<IpAddr>() {
                Ok(ip) => {
                    banned.insert(ip.to_canonical());
                }
                Err(_) => warn!(address = %ban.address, "Ignoring ban with unparseable address"),
            }
        }

        Self {
            servers: by_port,
            banned,
            refreshed_at: Some(now),
        }
    }

    /// Server protected behind `proxy_port`, if any.
    pub fn server(&self, proxy_port: u16) -> Option<&ProtectedServer> {
        self.servers.get(&proxy_port)
    }

    /// Returns true if `ip` is banned. IPv4-mapped IPv6 addresses match bans
    /// on the plain IPv4 address.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.contains(&ip.to_canonical())
    }

    /// Proxy ports in ascending order.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.servers.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn ban_count(&self) -> usize {
        self.banned.len()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }
}

/// What changed in a successful refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub server_count: usize,
    pub ban_count: usize,
    pub added_ports: Vec<u16>,
    pub removed_ports: Vec<u16>,
}

/// Registry of routes and bans.
///
/// Uses ArcSwap for lock-free atomic snapshot updates.
/// Readers get consistent snapshots without blocking.
/// The refresh task atomically swaps in new snapshots.
pub struct Registry {
    snapshot: ArcSwap<RegistrySnapshot>,
    source: Arc<dyn RegistrySource>,
}

impl Registry {
    /// Create an empty registry backed by `source`. Nothing is loaded until
    /// the first [`Registry::refresh`].
    pub fn new(source: Arc<dyn RegistrySource>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            source,
        }
    }

    /// Reload routes and bans from the source and publish a new snapshot.
    ///
    /// On error the current snapshot is left untouched.
    pub async fn refresh(&self) -> Result<RefreshSummary, RegistryError> {
        let servers = self
            .source
            .active_servers()
            .await
            .map_err(|source| RegistryError::Load {
                what: "protected servers",
                source,
            })?;

        let bans = self
            .source
            .bans()
            .await
            .map_err(|source| RegistryError::Load {
                what: "bans",
                source,
            })?;

        let next = RegistrySnapshot::build(servers, bans, Utc::now());

        let before: BTreeSet<u16> = self.snapshot.load().servers.keys().copied().collect();
        let after: BTreeSet<u16> = next.servers.keys().copied().collect();

        let summary = RefreshSummary {
            server_count: next.server_count(),
            ban_count: next.ban_count(),
            added_ports: after.difference(&before).copied().collect(),
            removed_ports: before.difference(&after).copied().collect(),
        };

        // Atomic swap - readers get consistent snapshots
        self.snapshot.store(Arc::new(next));

        if summary.added_ports.is_empty() && summary.removed_ports.is_empty() {
            debug!(
                server_count = summary.server_count,
                ban_count = summary.ban_count,
                "Registry refreshed"
            );
        } else {
            info!(
                server_count = summary.server_count,
                ban_count = summary.ban_count,
                added_ports = ?summary.added_ports,
                removed_ports = ?summary.removed_ports,
                "Registry refreshed"
            );
        }

        Ok(summary)
    }

    /// The current snapshot. Stays valid (and unchanged) however many
    /// refreshes happen while it is held.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Server protected behind `proxy_port` in the current snapshot.
    pub fn lookup_server(&self, proxy_port: u16) -> Option<ProtectedServer> {
        self.snapshot.load().server(proxy_port).cloned()
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.snapshot.load().is_banned(ip)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.snapshot.load().ports()
    }
}

/// Shared registry reference.
pub type SharedRegistry = Arc<Registry>;
