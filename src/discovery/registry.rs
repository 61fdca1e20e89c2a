//! Client-side cache of every server seen across probe rounds.
//!
//! Entries are keyed by (host, port). A sweep only ever flips `is_online`
//! to `false`; entries leave the map through [`ServerRegistry::clear`] alone,
//! so a server that stopped answering stays addressable for a reconnect.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::{debug, info};
use parking_lot::RwLock;

use super::descriptor::ServerDescriptor;

/// Counts reported by [`ServerRegistry::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: usize,
    pub updated: usize,
}

/// Thread-safe server map.
///
/// `merge` and `sweep_offline` are the only mutators and are expected to be
/// driven from one discovery owner; every read returns an owned copy.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<SocketAddr, ServerDescriptor>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry pre-populated with externally stored entries.
    pub fn with_seed(seed: impl IntoIterator<Item = ServerDescriptor>) -> Self {
        let registry = Self::new();
        registry.seed(seed);
        registry
    }

    /// Inserts stored entries as-is, replacing any entry with the same key.
    pub fn seed(&self, seed: impl IntoIterator<Item = ServerDescriptor>) {
        let mut writer = self.servers.write();
        for desc in seed {
            writer.insert(desc.address, desc);
        }
    }

    /// Folds one probe round into the map, stamping entries with the current
    /// time.
    pub fn merge(&self, incoming: impl IntoIterator<Item = ServerDescriptor>) -> MergeOutcome {
        self.merge_at(incoming, crate::now_unix_secs())
    }

    /// [`merge`](Self::merge) with an explicit clock.
    pub fn merge_at(
        &self,
        incoming: impl IntoIterator<Item = ServerDescriptor>,
        now: u64,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut writer = self.servers.write();

        for desc in incoming {
            match writer.get_mut(&desc.address) {
                Some(existing) => {
                    existing.name = desc.name;
                    existing.description = desc.description;
                    existing.version = desc.version;
                    existing.users_count = desc.users_count;
                    existing.max_users = desc.max_users;
                    existing.password_protected = desc.password_protected;
                    existing.is_online = true;
                    existing.last_seen = Some(now);
                    outcome.updated += 1;
                }
                None => {
                    info!("New server {} at {}", desc.name, desc.address);
                    let address = desc.address;
                    writer.insert(
                        address,
                        ServerDescriptor {
                            is_online: true,
                            last_seen: Some(now),
                            ..desc
                        },
                    );
                    outcome.added += 1;
                }
            }
        }

        outcome
    }

    /// Marks every entry not refreshed within `max_age` as offline and
    /// returns how many entries changed state.
    pub fn sweep_offline(&self, max_age: Duration) -> usize {
        self.sweep_offline_at(max_age, crate::now_unix_secs())
    }

    /// [`sweep_offline`](Self::sweep_offline) with an explicit clock.
    pub fn sweep_offline_at(&self, max_age: Duration, now: u64) -> usize {
        let max_age = max_age.as_secs();
        let mut writer = self.servers.write();
        let mut marked = 0;

        for desc in writer.values_mut() {
            // Entries never seen by a probe keep their stored state.
            if desc.last_seen.is_none() {
                continue;
            }
            if desc.is_online && !desc.is_fresh(now, max_age) {
                desc.is_online = false;
                marked += 1;
                debug!("Server {} ({}) marked offline", desc.name, desc.address);
            }
        }

        marked
    }

    /// Snapshot of every known entry, ordered by address.
    pub fn list_all(&self) -> Vec<ServerDescriptor> {
        let mut list: Vec<ServerDescriptor> = self.servers.read().values().cloned().collect();
        list.sort_by_key(|d| d.address);
        list
    }

    /// Snapshot of entries currently marked online, ordered by address.
    pub fn list_online(&self) -> Vec<ServerDescriptor> {
        let mut list: Vec<ServerDescriptor> = self
            .servers
            .read()
            .values()
            .filter(|d| d.is_online)
            .cloned()
            .collect();
        list.sort_by_key(|d| d.address);
        list
    }

    pub fn get(&self, address: &SocketAddr) -> Option<ServerDescriptor> {
        self.servers.read().get(address).cloned()
    }

    pub fn get_server_by_address(&self, host: IpAddr, port: u16) -> Option<ServerDescriptor> {
        self.get(&SocketAddr::new(host, port))
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    /// Drops every entry. Only meant for an explicit user request.
    pub fn clear(&self) {
        self.servers.write().clear();
        info!("Server cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, addr: &str, seen: u64) -> ServerDescriptor {
        ServerDescriptor {
            name: name.into(),
            address: addr.parse().unwrap(),
            description: String::new(),
            version: "1.0".into(),
            users_count: 0,
            max_users: 50,
            password_protected: false,
            is_online: true,
            last_seen: Some(seen),
        }
    }

    #[test]
    fn merge_inserts_distinct_servers_online() {
        let reg = ServerRegistry::new();
        let outcome = reg.merge_at(
            vec![
                desc("A", "10.0.0.1:8000", 0),
                desc("B", "10.0.0.2:8000", 0),
                desc("C", "10.0.0.1:8001", 0),
            ],
            50,
        );
        assert_eq!(outcome, MergeOutcome { added: 3, updated: 0 });

        let all = reg.list_all();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|d| d.is_online && d.last_seen == Some(50)));
    }

    #[test]
    fn merge_updates_existing_key_in_place() {
        let reg = ServerRegistry::new();
        reg.merge_at(vec![desc("Old", "10.0.0.1:8000", 0)], 10);

        let mut renamed = desc("New", "10.0.0.1:8000", 0);
        renamed.users_count = 7;
        renamed.description = "second floor".into();
        let outcome = reg.merge_at(vec![renamed], 20);

        assert_eq!(outcome, MergeOutcome { added: 0, updated: 1 });
        assert_eq!(reg.len(), 1);
        let got = reg
            .get_server_by_address("10.0.0.1".parse().unwrap(), 8000)
            .unwrap();
        assert_eq!(got.name, "New");
        assert_eq!(got.users_count, 7);
        assert_eq!(got.description, "second floor");
        assert_eq!(got.last_seen, Some(20));
    }

    #[test]
    fn merge_revives_offline_entry() {
        let reg = ServerRegistry::new();
        reg.merge_at(vec![desc("A", "10.0.0.1:8000", 0)], 0);
        assert_eq!(reg.sweep_offline_at(Duration::from_secs(300), 1_000), 1);
        assert!(reg.list_online().is_empty());

        reg.merge_at(vec![desc("A", "10.0.0.1:8000", 0)], 1_001);
        assert_eq!(reg.list_online().len(), 1);
    }

    #[test]
    fn sweep_marks_stale_but_keeps_entries() {
        let reg = ServerRegistry::new();
        let now = 10_000;
        reg.merge_at(vec![desc("Stale", "10.0.0.1:8000", 0)], now - 400);
        reg.merge_at(vec![desc("Fresh", "10.0.0.2:8000", 0)], now - 10);

        let marked = reg.sweep_offline_at(Duration::from_secs(300), now);
        assert_eq!(marked, 1);
        assert_eq!(reg.list_all().len(), 2);

        let online = reg.list_online();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].name, "Fresh");

        let stale = reg
            .get_server_by_address("10.0.0.1".parse().unwrap(), 8000)
            .unwrap();
        assert!(!stale.is_online);
        assert_eq!(stale.name, "Stale");
    }

    #[test]
    fn sweep_boundary_is_exclusive() {
        let reg = ServerRegistry::new();
        reg.merge_at(vec![desc("Edge", "10.0.0.1:8000", 0)], 700);
        assert_eq!(reg.sweep_offline_at(Duration::from_secs(300), 1_000), 0);
        assert_eq!(reg.sweep_offline_at(Duration::from_secs(300), 1_001), 1);
    }

    #[test]
    fn seeded_entries_without_last_seen_survive_sweep() {
        let mut seeded = desc("Remembered", "10.0.0.9:8000", 0);
        seeded.last_seen = None;
        let reg = ServerRegistry::with_seed(vec![seeded]);
        assert_eq!(reg.list_online().len(), 1);

        reg.merge_at(Vec::new(), 1_000);
        assert_eq!(reg.sweep_offline_at(Duration::from_secs(300), 1_000), 0);
        assert_eq!(reg.list_online().len(), 1);

        // Once a probe refreshes it, normal aging applies.
        reg.merge_at(vec![desc("Remembered", "10.0.0.9:8000", 0)], 1_000);
        assert_eq!(reg.sweep_offline_at(Duration::from_secs(300), 1_301), 1);
        assert!(reg.list_online().is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn clear_removes_everything() {
        let reg = ServerRegistry::new();
        reg.merge_at(vec![desc("A", "10.0.0.1:8000", 0)], 0);
        reg.clear();
        assert!(reg.is_empty());
        assert!(reg.list_all().is_empty());
    }

    #[test]
    fn snapshots_are_detached_copies() {
        let reg = ServerRegistry::new();
        reg.merge_at(vec![desc("A", "10.0.0.1:8000", 0)], 0);
        let mut snap = reg.list_all();
        snap[0].name = "mutated".into();
        assert_eq!(reg.list_all()[0].name, "A");
    }
}
