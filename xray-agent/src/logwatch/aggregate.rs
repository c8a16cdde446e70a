//! Per-user aggregation of access-log events into device estimates.

use std::collections::{BTreeMap, HashMap};

use chrono::DateTime;
use serde::Serialize;

use crate::logwatch::parser::LogEvent;

/// How many destination hosts to keep per client.
const TOP_HOSTS_CAP: usize = 8;

/// Windows the aggregation is judged against.
#[derive(Debug, Clone, Copy)]
pub struct AggregationWindows {
    pub online_window_sec: u64,
    /// An IP only counts as a device while its last event is fresher
    /// than this; a long-past roaming IP is not a current device.
    pub ip_active_ttl_sec: u64,
    pub devices_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostHits {
    pub host: String,
    pub hits: u64,
}

/// Derived, ephemeral per-client view.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub email: String,
    pub online: bool,
    pub last_seen_epoch: f64,
    pub last_seen_iso_utc: String,
    pub last_seen_ago_sec: f64,
    /// IPs seen within the activity TTL, sorted.
    pub active_ips: Vec<String>,
    pub devices_estimate: usize,
    pub events: u64,
    pub top_hosts: Vec<HostHits>,
    pub suspicious: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Aggregate {
    pub clients_total_seen: usize,
    pub clients_online: usize,
    pub suspicious_clients: usize,
    pub clients: Vec<ClientStatus>,
}

#[derive(Default)]
struct PerUser {
    ip_last_seen: HashMap<String, f64>,
    last_seen: f64,
    hosts: HashMap<String, u64>,
    events: u64,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn epoch_to_iso_utc(epoch: f64) -> String {
    #[allow(clippy::cast_possible_truncation)]
    let secs = epoch.trunc() as i64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let nanos = (epoch.fract() * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Fold events into per-client status rows, sorted online-first then by
/// recency.
#[must_use]
pub fn aggregate(events: &[LogEvent], now: f64, windows: &AggregationWindows) -> Aggregate {
    let mut per_user: BTreeMap<&str, PerUser> = BTreeMap::new();

    for event in events {
        let entry = per_user.entry(&event.email).or_default();
        let ip_seen = entry.ip_last_seen.entry(event.src_ip.clone()).or_insert(0.0);
        *ip_seen = ip_seen.max(event.t);
        entry.last_seen = entry.last_seen.max(event.t);
        *entry.hosts.entry(event.host.clone()).or_insert(0) += 1;
        entry.events += 1;
    }

    let mut clients = Vec::with_capacity(per_user.len());
    let mut clients_online = 0;
    let mut suspicious_clients = 0;

    for (email, user) in &per_user {
        let online = now - user.last_seen <= windows.online_window_sec as f64;
        if online {
            clients_online += 1;
        }

        let mut active_ips: Vec<String> = user
            .ip_last_seen
            .iter()
            .filter(|(_, seen)| now - **seen <= windows.ip_active_ttl_sec as f64)
            .map(|(ip, _)| ip.clone())
            .collect();
        active_ips.sort();

        let devices_estimate = active_ips.len();
        let suspicious = devices_estimate > windows.devices_limit;
        if suspicious {
            suspicious_clients += 1;
        }

        let mut top_hosts: Vec<HostHits> = user
            .hosts
            .iter()
            .map(|(host, hits)| HostHits {
                host: host.clone(),
                hits: *hits,
            })
            .collect();
        top_hosts.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.host.cmp(&b.host)));
        top_hosts.truncate(TOP_HOSTS_CAP);

        clients.push(ClientStatus {
            email: (*email).to_string(),
            online,
            last_seen_epoch: user.last_seen,
            last_seen_iso_utc: epoch_to_iso_utc(user.last_seen),
            last_seen_ago_sec: round3((now - user.last_seen).max(0.0)),
            active_ips,
            devices_estimate,
            events: user.events,
            top_hosts,
            suspicious,
        });
    }

    clients.sort_by(|a, b| {
        b.online
            .cmp(&a.online)
            .then(a.last_seen_ago_sec.total_cmp(&b.last_seen_ago_sec))
    });

    Aggregate {
        clients_total_seen: per_user.len(),
        clients_online,
        suspicious_clients,
        clients,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(t: f64, email: &str, ip: &str, host: &str) -> LogEvent {
        LogEvent {
            t,
            email: email.to_string(),
            src_ip: ip.to_string(),
            proto: "tcp".to_string(),
            dst: format!("{host}:443"),
            host: host.to_string(),
        }
    }

    fn windows() -> AggregationWindows {
        AggregationWindows {
            online_window_sec: 240,
            ip_active_ttl_sec: 120,
            devices_limit: 2,
        }
    }

    #[test]
    fn test_devices_counted_per_unique_active_ip() {
        let now = 10_000.0;
        let events = vec![
            event(now - 10.0, "1001", "1.1.1.1", "www.youtube.com"),
            event(now - 5.0, "1001", "2.2.2.2", "www.google.com"),
            event(now - 20.0, "2002", "3.3.3.3", "api.telegram.org"),
        ];
        let agg = aggregate(&events, now, &windows());

        assert_eq!(agg.clients_total_seen, 2);
        let c1001 = agg.clients.iter().find(|c| c.email == "1001").unwrap();
        assert_eq!(c1001.devices_estimate, 2);
        assert_eq!(c1001.active_ips, vec!["1.1.1.1", "2.2.2.2"]);
        assert!(!c1001.suspicious); // at the limit is not over it

        let c2002 = agg.clients.iter().find(|c| c.email == "2002").unwrap();
        assert_eq!(c2002.devices_estimate, 1);
    }

    #[test]
    fn test_stale_ip_not_a_current_device() {
        let now = 10_000.0;
        let events = vec![
            event(now - 300.0, "1001", "1.1.1.1", "a.com"), // roamed away
            event(now - 10.0, "1001", "2.2.2.2", "a.com"),
        ];
        let agg = aggregate(&events, now, &windows());
        let c = &agg.clients[0];
        assert_eq!(c.devices_estimate, 1);
        assert_eq!(c.active_ips, vec!["2.2.2.2"]);
        // last_seen still reflects the newest event
        assert!((c.last_seen_ago_sec - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_suspicious_over_limit_and_counters() {
        let now = 1_000.0;
        let events = vec![
            event(now - 1.0, "3003", "1.1.1.1", "a.com"),
            event(now - 1.0, "3003", "2.2.2.2", "b.com"),
            event(now - 1.0, "3003", "3.3.3.3", "c.com"),
        ];
        let agg = aggregate(&events, now, &windows());
        assert_eq!(agg.suspicious_clients, 1);
        assert_eq!(agg.clients_online, 1);
        assert!(agg.clients[0].suspicious);
        assert_eq!(agg.clients[0].devices_estimate, 3);
    }

    #[test]
    fn test_offline_sorts_after_online() {
        let now = 10_000.0;
        let events = vec![
            event(now - 500.0, "offline", "1.1.1.1", "a.com"),
            event(now - 5.0, "fresh", "2.2.2.2", "a.com"),
            event(now - 50.0, "older", "3.3.3.3", "a.com"),
        ];
        let agg = aggregate(&events, now, &windows());
        let order: Vec<&str> = agg.clients.iter().map(|c| c.email.as_str()).collect();
        assert_eq!(order, vec!["fresh", "older", "offline"]);
    }

    #[test]
    fn test_top_hosts_capped_and_ranked() {
        let now = 1_000.0;
        let mut events = Vec::new();
        for i in 0..12 {
            for _ in 0..=i {
                events.push(event(now - 1.0, "u", "1.1.1.1", &format!("host{i:02}.com")));
            }
        }
        let agg = aggregate(&events, now, &windows());
        let hosts = &agg.clients[0].top_hosts;
        assert_eq!(hosts.len(), 8);
        assert_eq!(hosts[0].host, "host11.com");
        assert_eq!(hosts[0].hits, 12);
        assert!(hosts.windows(2).all(|w| w[0].hits >= w[1].hits));
    }
}
