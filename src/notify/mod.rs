//! Debounced aggregation of connect/disconnect bursts into one webhook per
//! `(webhook, protocol, target)` bucket per flush window.

pub mod embeds;
pub mod webhook;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::config::AGGREGATOR_FLUSH_WINDOW_MS;
use webhook::{Embed, EmbedField};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    webhook: String,
    protocol: String,
    target: String,
}

#[derive(Default)]
struct Bucket {
    ip_ports: HashMap<String, BTreeSet<u16>>,
    timer_active: bool,
}

/// Debounces connect/disconnect events into grouped webhook embeds.
pub struct Aggregator {
    client: reqwest::Client,
    connect: DashMap<BucketKey, Arc<Mutex<Bucket>>>,
    disconnect: DashMap<BucketKey, Arc<Mutex<Bucket>>>,
}

impl Aggregator {
    pub fn new(client: reqwest::Client) -> Arc<Self> {
        Arc::new(Aggregator {
            client,
            connect: DashMap::new(),
            disconnect: DashMap::new(),
        })
    }

    /// The shared HTTP client, for dispatching events outside the
    /// debounced aggregation path (e.g. identity-tagged leave events).
    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    pub fn add_connect(self: &Arc<Self>, webhook: &str, target: &str, ip: &str, port: u16, protocol: &str) {
        self.add(Family::Connect, webhook, target, ip, port, protocol);
    }

    pub fn add_disconnect(
        self: &Arc<Self>,
        webhook: &str,
        target: &str,
        ip: &str,
        port: u16,
        protocol: &str,
    ) {
        self.add(Family::Disconnect, webhook, target, ip, port, protocol);
    }

    fn buckets(&self, family: Family) -> &DashMap<BucketKey, Arc<Mutex<Bucket>>> {
        match family {
            Family::Connect => &self.connect,
            Family::Disconnect => &self.disconnect,
        }
    }

    fn add(
        self: &Arc<Self>,
        family: Family,
        webhook: &str,
        target: &str,
        ip: &str,
        port: u16,
        protocol: &str,
    ) {
        if webhook.trim().is_empty() {
            return;
        }

        let key = BucketKey {
            webhook: webhook.to_string(),
            protocol: protocol.to_string(),
            target: target.to_string(),
        };

        let bucket = self
            .buckets(family)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::default())))
            .clone();

        let should_start_timer = {
            let mut guard = bucket.lock().unwrap();
            guard.ip_ports.entry(ip.to_string()).or_default().insert(port);
            if guard.timer_active {
                false
            } else {
                guard.timer_active = true;
                true
            }
        };

        if should_start_timer {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(AGGREGATOR_FLUSH_WINDOW_MS)).await;
                this.flush(family, key).await;
            });
        }
    }

    async fn flush(&self, family: Family, key: BucketKey) {
        let bucket = match self.buckets(family).remove(&key) {
            Some((_, bucket)) => bucket,
            None => return,
        };
        let ip_ports = {
            let guard = bucket.lock().unwrap();
            guard.ip_ports.clone()
        };
        if ip_ports.is_empty() {
            return;
        }

        let embed = build_embed(family, &key, &ip_ports);
        webhook::post_embed(&self.client, &key.webhook, embed).await;
    }

    /// Test/diagnostic hook: current ip->ports contents of a bucket, if any,
    /// without removing it.
    #[cfg(test)]
    fn peek(&self, family_is_connect: bool, webhook: &str, protocol: &str, target: &str) -> Option<HashMap<String, BTreeSet<u16>>> {
        let family = if family_is_connect {
            Family::Connect
        } else {
            Family::Disconnect
        };
        let key = BucketKey {
            webhook: webhook.to_string(),
            protocol: protocol.to_string(),
            target: target.to_string(),
        };
        self.buckets(family)
            .get(&key)
            .map(|b| b.lock().unwrap().ip_ports.clone())
    }
}

fn build_embed(family: Family, key: &BucketKey, ip_ports: &HashMap<String, BTreeSet<u16>>) -> Embed {
    let (title, color) = match family {
        Family::Connect => ("Player(s) connected", 0x2ECC71),
        Family::Disconnect => ("Player(s) disconnected", 0xE74C3C),
    };

    let mut ips: Vec<&String> = ip_ports.keys().collect();
    ips.sort();

    let fields = ips
        .into_iter()
        .map(|ip| {
            let ports: Vec<String> = ip_ports[ip].iter().map(|p| p.to_string()).collect();
            EmbedField {
                name: ip.clone(),
                value: ports.join(", "),
                inline: true,
            }
        })
        .collect();

    Embed {
        title: Some(title.to_string()),
        description: Some(format!("{} ({})", key.target, key.protocol)),
        color: Some(color),
        timestamp: Some(chrono::Utc::now().to_rfc3339()),
        fields,
        footer: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_groups_ports_by_ip_before_flush() {
        let aggregator = Aggregator::new(reqwest::Client::new());
        aggregator.add_connect("https://example.com/hook", "survival", "1.1.1.1", 100, "udp");
        aggregator.add_connect("https://example.com/hook", "survival", "1.1.1.1", 101, "udp");
        aggregator.add_connect("https://example.com/hook", "survival", "2.2.2.2", 200, "udp");

        let snapshot = aggregator
            .peek(true, "https://example.com/hook", "udp", "survival")
            .unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot["1.1.1.1"].iter().copied().collect::<Vec<_>>(),
            vec![100, 101]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_removes_bucket_after_window() {
        let aggregator = Aggregator::new(reqwest::Client::new());
        aggregator.add_connect("", "survival", "1.1.1.1", 100, "udp");
        // blank webhook => never buckets anything
        assert!(aggregator
            .peek(true, "", "udp", "survival")
            .is_none());
    }

    #[test]
    fn test_build_embed_sorts_ips_and_ports() {
        let key = BucketKey {
            webhook: "w".into(),
            protocol: "udp".into(),
            target: "survival".into(),
        };
        let mut ip_ports = HashMap::new();
        ip_ports.insert("2.2.2.2".to_string(), BTreeSet::from([9]));
        ip_ports.insert("1.1.1.1".to_string(), BTreeSet::from([3, 1]));

        let embed = build_embed(Family::Connect, &key, &ip_ports);
        assert_eq!(embed.fields[0].name, "1.1.1.1");
        assert_eq!(embed.fields[0].value, "1, 3");
        assert_eq!(embed.fields[1].name, "2.2.2.2");
    }
}
