//! Access-log line extraction.
//!
//! One anchored regex over the proxy access log grammar:
//!
//! ```text
//! YYYY/MM/DD HH:MM:SS(.ffffff) from [(tcp|udp):]IP:PORT (accepted|rejected)
//!     (tcp|udp):HOST[:PORT] [TAG -> EGRESS] email: <id>
//! ```
//!
//! Only `accepted` lines with a non-empty email survive; everything else
//! is useless for anti-sharing.

use chrono::{Local, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;

static ACCESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        (?P<ts>\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2}(?:\.\d+)?)
        \s+from\s+(?:(?:tcp|udp):)?(?P<src_ip>\d{1,3}(?:\.\d{1,3}){3}):(?P<src_port>\d+)
        \s+(?P<result>accepted|rejected)\s+
        (?P<proto>tcp|udp):(?P<dst>\S+)
        \s+\[(?P<route>[^\]]+)\]
        (?:\s+email:\s*(?P<email>\S+))?
        ",
    )
    .expect("access log regex")
});

/// One accepted connection as extracted from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    /// Event time, Unix epoch seconds.
    pub t: f64,
    pub email: String,
    pub src_ip: String,
    pub proto: String,
    pub dst: String,
    pub host: String,
}

/// The log carries no zone; it is the proxy host's local time.
fn parse_ts_to_epoch(ts: &str) -> Option<f64> {
    let format = if ts.contains('.') {
        "%Y/%m/%d %H:%M:%S%.f"
    } else {
        "%Y/%m/%d %H:%M:%S"
    };
    let naive = NaiveDateTime::parse_from_str(ts, format).ok()?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    let micros = f64::from(local.timestamp_subsec_micros());
    Some(local.timestamp() as f64 + micros / 1_000_000.0)
}

/// Extract the events of one inbound from raw log lines.
#[must_use]
pub fn parse_access_lines(lines: &[String], inbound_tag: &str) -> Vec<LogEvent> {
    let needle = format!("[{inbound_tag} ->");
    let mut events = Vec::new();

    for line in lines {
        // Cheap prefilter before the regex: our inbound, accepted only.
        if !line.contains(&needle) || !line.contains(" accepted ") {
            continue;
        }

        let Some(captures) = ACCESS_RE.captures(line) else {
            continue;
        };
        if &captures["result"] != "accepted" {
            continue;
        }

        let email = captures
            .name("email")
            .map(|m| m.as_str().trim())
            .unwrap_or_default();
        if email.is_empty() {
            continue;
        }

        let Some(t) = parse_ts_to_epoch(&captures["ts"]) else {
            continue;
        };

        let dst = captures["dst"].to_string();
        let host = dst
            .rsplit_once(':')
            .map_or_else(|| dst.clone(), |(host, _)| host.to_string());

        events.push(LogEvent {
            t,
            email: email.to_string(),
            src_ip: captures["src_ip"].to_string(),
            proto: captures["proto"].to_string(),
            dst,
            host,
        });
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_parses_plain_and_prefixed_sources() {
        let input = lines(&[
            "2026/02/06 11:52:31.289090 from 109.252.151.127:1989 accepted \
             tcp:www.youtube.com:443 [vless-in -> direct] email: 796111",
            "2026/02/06 11:52:32 from tcp:109.252.151.128:1986 accepted \
             udp:8.8.8.8:53 [vless-in -> direct] email: 796111",
        ]);
        let events = parse_access_lines(&input, "vless-in");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].email, "796111");
        assert_eq!(events[0].src_ip, "109.252.151.127");
        assert_eq!(events[0].host, "www.youtube.com");
        assert_eq!(events[1].proto, "udp");
        assert_eq!(events[1].host, "8.8.8.8");
    }

    #[test]
    fn test_rejected_and_other_inbounds_dropped() {
        let input = lines(&[
            "2026/02/06 11:52:31 from 1.1.1.1:1000 rejected tcp:evil.com:443 \
             [vless-in -> direct] email: 1001",
            "2026/02/06 11:52:31 from 1.1.1.1:1000 accepted tcp:ok.com:443 \
             [other-in -> direct] email: 1001",
        ]);
        assert!(parse_access_lines(&input, "vless-in").is_empty());
    }

    #[test]
    fn test_accepted_without_email_dropped() {
        let input = lines(&[
            "2026/02/06 11:52:31 from 1.1.1.1:1000 accepted tcp:ok.com:443 \
             [vless-in -> direct]",
        ]);
        assert!(parse_access_lines(&input, "vless-in").is_empty());
    }

    #[test]
    fn test_garbage_lines_dropped() {
        let input = lines(&[
            "not a log line at all",
            "2026/02/06 [vless-in -> direct] accepted ", // needle present, shape wrong
        ]);
        assert!(parse_access_lines(&input, "vless-in").is_empty());
    }

    #[test]
    fn test_timestamp_fraction_is_kept() {
        let with = parse_ts_to_epoch("2026/02/06 11:52:31.500000").unwrap();
        let without = parse_ts_to_epoch("2026/02/06 11:52:31").unwrap();
        assert!((with - without - 0.5).abs() < 1e-6);
    }
}
