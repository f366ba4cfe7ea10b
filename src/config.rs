use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveTime, TimeDelta};
use tracing::warn;

use crate::limits::*;
use crate::model::CheckinWindow;

/// Service configuration, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub token_ttl: Duration,
    pub token_sweep_every: Duration,
    pub missed_sweep_at: NaiveTime,
    pub reminder_at: NaiveTime,
    pub checkin_window: CheckinWindow,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            token_ttl: Duration::from_secs(TOKEN_TTL_SECS),
            token_sweep_every: Duration::from_secs(3600),
            missed_sweep_at: hm(22, 0),
            reminder_at: hm(20, 0),
            checkin_window: CheckinWindow::default(),
        }
    }
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Malformed values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let early: i64 = parsed(&lookup, "SLOTBOOK_CHECKIN_EARLY_MINUTES", CHECKIN_EARLY_MINUTES);
        let late: i64 = parsed(&lookup, "SLOTBOOK_CHECKIN_LATE_MINUTES", CHECKIN_LATE_MINUTES);
        Self {
            data_dir: lookup("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: lookup("SLOTBOOK_METRICS_PORT").and_then(|s| match s.parse() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!("SLOTBOOK_METRICS_PORT={s:?} is not a port, metrics disabled");
                    None
                }
            }),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD", d.compact_threshold),
            token_ttl: Duration::from_secs(parsed(&lookup, "SLOTBOOK_TOKEN_TTL_SECS", d.token_ttl.as_secs())),
            token_sweep_every: Duration::from_secs(
                parsed(&lookup, "SLOTBOOK_TOKEN_SWEEP_SECS", d.token_sweep_every.as_secs()).max(1),
            ),
            missed_sweep_at: clock_time(&lookup, "SLOTBOOK_MISSED_SWEEP_AT", d.missed_sweep_at),
            reminder_at: clock_time(&lookup, "SLOTBOOK_REMINDER_AT", d.reminder_at),
            checkin_window: CheckinWindow {
                early: TimeDelta::minutes(early),
                late: TimeDelta::minutes(late),
            },
        }
    }
}

fn parsed<T: FromStr + Copy + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{key}={raw:?} is malformed, using {default}");
            default
        }),
    }
}

fn clock_time(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: NaiveTime) -> NaiveTime {
    match lookup(key) {
        None => default,
        Some(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M").unwrap_or_else(|_| {
            warn!("{key}={raw:?} is not HH:MM, using {}", default.format("%H:%M"));
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(Config::from_lookup(lookup(&[])), Config::default());
    }

    #[test]
    fn reads_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
            ("SLOTBOOK_TOKEN_TTL_SECS", "60"),
            ("SLOTBOOK_MISSED_SWEEP_AT", "23:30"),
            ("SLOTBOOK_CHECKIN_LATE_MINUTES", "20"),
        ]));
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/slotbook"));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.token_ttl, Duration::from_secs(60));
        assert_eq!(cfg.missed_sweep_at, hm(23, 30));
        assert_eq!(cfg.checkin_window.late, TimeDelta::minutes(20));
        assert_eq!(cfg.checkin_window.early, TimeDelta::minutes(30));
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = Config::from_lookup(lookup(&[
            ("SLOTBOOK_COMPACT_THRESHOLD", "lots"),
            ("SLOTBOOK_REMINDER_AT", "8pm"),
            ("SLOTBOOK_METRICS_PORT", "99999"),
        ]));
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.reminder_at, hm(20, 0));
        assert_eq!(cfg.metrics_port, None);
    }
}
