//! Durable username -> last-known (IP, protocol) record on disk.
//!
//! Rewrites follow the write-then-rename pattern: serialize to a temp file
//! in the same directory, then rename over the target so a crash never
//! leaves a half-written document.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

const FILE_NAME: &str = "playerIP.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IpEntry {
    ip: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(rename = "lastSeen", default)]
    last_seen: i64,
    /// Legacy shape carried multiple ports per IP; dropped on normalize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ports: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlayerRecord {
    username: String,
    ips: Vec<IpEntry>,
}

/// In-memory username -> single retained IP entry, mirrored to disk.
pub struct IdentityPersistence {
    path: PathBuf,
    enabled: bool,
    entries: DashMap<String, IpEntry>,
}

impl IdentityPersistence {
    /// Loads `dir/playerIP.json`. When `enabled` is false this is a no-op
    /// store: the loader is skipped and every mutator becomes a no-op.
    pub fn load(dir: &Path, enabled: bool) -> Self {
        let path = dir.join(FILE_NAME);
        let store = IdentityPersistence {
            path: path.clone(),
            enabled,
            entries: DashMap::new(),
        };

        if !enabled {
            return store;
        }

        if !path.exists() {
            return store;
        }

        match std::fs::read_to_string(&path).and_then(|raw| {
            serde_json::from_str::<Vec<PlayerRecord>>(&raw)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }) {
            Ok(records) => {
                for record in records {
                    if let Some(newest) = record.ips.into_iter().max_by_key(|e| e.last_seen) {
                        store.entries.insert(
                            record.username,
                            IpEntry {
                                ip: newest.ip,
                                protocol: newest.protocol,
                                last_seen: newest.last_seen,
                                ports: None,
                            },
                        );
                    }
                }
                if let Err(e) = store.persist() {
                    tracing::warn!(error = %e, "failed to rewrite normalized playerIP.json");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load playerIP.json, starting empty");
            }
        }

        store
    }

    /// Replaces the retained entry for `user` when the IP or protocol
    /// differs from what's stored, and always refreshes `last_seen`.
    pub fn register(&self, user: &str, ip: &str, _port: u16, protocol: &str, now_ms: i64) {
        if !self.enabled {
            return;
        }

        self.entries
            .entry(user.to_string())
            .and_modify(|entry| {
                if entry.ip != ip || entry.protocol.as_deref() != Some(protocol) {
                    entry.ip = ip.to_string();
                    entry.protocol = Some(protocol.to_string());
                }
                entry.last_seen = now_ms;
            })
            .or_insert_with(|| IpEntry {
                ip: ip.to_string(),
                protocol: Some(protocol.to_string()),
                last_seen: now_ms,
                ports: None,
            });

        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to persist playerIP.json");
        }
    }

    /// Returns the last-known `(ip, protocol)` for `user`, if any.
    pub fn lookup(&self, user: &str) -> Option<(String, Option<String>)> {
        self.entries
            .get(user)
            .map(|e| (e.ip.clone(), e.protocol.clone()))
    }

    /// Drops entries older than `older_than_days`; since each username
    /// retains exactly one entry, that means dropping the username.
    pub fn cleanup(&self, older_than_days: i64, now_ms: i64) {
        if !self.enabled {
            return;
        }
        let cutoff_ms = older_than_days * 24 * 60 * 60 * 1_000;
        self.entries.retain(|_, e| now_ms - e.last_seen <= cutoff_ms);
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to persist playerIP.json after cleanup");
        }
    }

    fn persist(&self) -> std::io::Result<()> {
        let records: Vec<PlayerRecord> = self
            .entries
            .iter()
            .map(|e| PlayerRecord {
                username: e.key().clone(),
                ips: vec![e.value().clone()],
            })
            .collect();

        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDir(PathBuf);
    impl TempDir {
        fn path(&self) -> &Path {
            &self.0
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
    fn tempdir() -> TempDir {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "flowrelay-persist-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).unwrap();
        TempDir(p)
    }

    #[test]
    fn test_register_then_lookup_round_trips() {
        let dir = tempdir();
        let store = IdentityPersistence::load(dir.path(), true);
        store.register("alice", "1.2.3.4", 25565, "tcp", 1_000_000);
        assert_eq!(
            store.lookup("alice"),
            Some(("1.2.3.4".into(), Some("tcp".into())))
        );
        assert!(dir.path().join(FILE_NAME).exists());
    }

    #[test]
    fn test_disabled_mode_mutators_are_noop() {
        let dir = tempdir();
        let store = IdentityPersistence::load(dir.path(), false);
        store.register("alice", "1.2.3.4", 25565, "tcp", 1_000_000);
        assert_eq!(store.lookup("alice"), None);
        assert!(!dir.path().join(FILE_NAME).exists());
    }

    #[test]
    fn test_legacy_ports_array_normalized_on_load() {
        let dir = tempdir();
        let legacy = r#"[
            {"username": "bob", "ips": [
                {"ip": "10.0.0.1", "protocol": "tcp", "lastSeen": 100, "ports": [80, 443]},
                {"ip": "10.0.0.2", "protocol": "udp", "lastSeen": 200}
            ]}
        ]"#;
        std::fs::write(dir.path().join(FILE_NAME), legacy).unwrap();

        let store = IdentityPersistence::load(dir.path(), true);
        assert_eq!(
            store.lookup("bob"),
            Some(("10.0.0.2".into(), Some("udp".into())))
        );

        let rewritten = std::fs::read_to_string(dir.path().join(FILE_NAME)).unwrap();
        assert!(!rewritten.contains("ports"));
    }

    #[test]
    fn test_cleanup_drops_stale_username() {
        let dir = tempdir();
        let store = IdentityPersistence::load(dir.path(), true);
        store.register("alice", "1.2.3.4", 0, "tcp", 1_000_000);
        store.cleanup(1, 1_000_000 + 2 * 24 * 60 * 60 * 1_000);
        assert_eq!(store.lookup("alice"), None);
    }
}
