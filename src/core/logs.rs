//! In-memory aggregation of engine output with bounded retention.
//!
//! Each supervised process streams its stdout/stderr lines here. Entries are
//! bucketed per proxy and capped both per proxy and globally; the oldest
//! entries are evicted first.

use crate::core::events::{EventBus, ManagerEvent};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

pub const DEFAULT_PER_PROXY_CAP: usize = 1000;
pub const DEFAULT_GLOBAL_CAP: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source: LogSource,
    pub proxy_name: String,
    #[serde(skip)]
    seq: u64,
}

/// An explicit bracketed level tag wins; otherwise keyword heuristics on the
/// message text decide, defaulting to info.
pub fn infer_level(message: &str) -> LogLevel {
    let lower = message.to_lowercase();

    for (tag, level) in [
        ("[error]", LogLevel::Error),
        ("[warning]", LogLevel::Warn),
        ("[warn]", LogLevel::Warn),
        ("[debug]", LogLevel::Debug),
        ("[info]", LogLevel::Info),
    ] {
        if lower.contains(tag) {
            return level;
        }
    }

    if lower.contains("error") || lower.contains("fail") {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else if lower.contains("debug") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub proxy_name: Option<String>,
    pub level: Option<LogLevel>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogStatistics {
    pub total: usize,
    pub by_level: HashMap<String, usize>,
    pub by_proxy: HashMap<String, usize>,
    pub per_proxy_cap: usize,
    pub global_cap: usize,
}

#[derive(Default)]
struct LogBuckets {
    buckets: HashMap<String, VecDeque<LogEntry>>,
    total: usize,
    next_seq: u64,
}

pub struct LogAggregator {
    inner: Mutex<LogBuckets>,
    per_proxy_cap: usize,
    global_cap: usize,
    events: EventBus,
}

impl LogAggregator {
    pub fn new(per_proxy_cap: usize, global_cap: usize, events: EventBus) -> Self {
        Self {
            inner: Mutex::new(LogBuckets::default()),
            per_proxy_cap: per_proxy_cap.max(1),
            global_cap: global_cap.max(1),
            events,
        }
    }

    pub fn ingest(&self, proxy_name: &str, source: LogSource, message: String) {
        let entry = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;

            let seq = inner.next_seq;
            inner.next_seq += 1;

            let entry = LogEntry {
                timestamp: Utc::now(),
                level: infer_level(&message),
                message,
                source,
                proxy_name: proxy_name.to_string(),
                seq,
            };

            let bucket = inner.buckets.entry(proxy_name.to_string()).or_default();
            if bucket.len() >= self.per_proxy_cap {
                bucket.pop_front();
                inner.total -= 1;
            }
            bucket.push_back(entry.clone());
            inner.total += 1;

            while inner.total > self.global_cap {
                evict_globally_oldest(inner);
            }

            entry
        };

        self.events.emit(ManagerEvent::Log { entry });
    }

    /// Newest-first page of matching entries.
    pub fn get_logs(&self, filter: &LogFilter) -> LogPage {
        let inner = self.inner.lock().unwrap();

        let mut matching: Vec<&LogEntry> = inner
            .buckets
            .iter()
            .filter(|(name, _)| {
                filter
                    .proxy_name
                    .as_deref()
                    .is_none_or(|wanted| wanted == name.as_str())
            })
            .flat_map(|(_, bucket)| bucket.iter())
            .filter(|entry| filter.level.is_none_or(|level| entry.level == level))
            .collect();

        matching.sort_by(|a, b| b.seq.cmp(&a.seq));

        let total = matching.len();
        let limit = filter.limit.unwrap_or(total);
        let logs: Vec<LogEntry> = matching
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .cloned()
            .collect();
        let has_more = filter.offset + logs.len() < total;

        LogPage {
            logs,
            total,
            has_more,
        }
    }

    pub fn clear(&self, proxy_name: Option<&str>) {
        {
            let mut inner = self.inner.lock().unwrap();
            match proxy_name {
                Some(name) => {
                    if let Some(bucket) = inner.buckets.remove(name) {
                        inner.total -= bucket.len();
                    }
                }
                None => {
                    inner.buckets.clear();
                    inner.total = 0;
                }
            }
        }

        self.events.emit(ManagerEvent::LogsCleared {
            proxy_name: proxy_name.map(|s| s.to_string()),
        });
    }

    pub fn statistics(&self) -> LogStatistics {
        let inner = self.inner.lock().unwrap();

        let by_level = inner
            .buckets
            .values()
            .flat_map(|bucket| bucket.iter())
            .counts_by(|entry| entry.level.to_string());

        let by_proxy = inner
            .buckets
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.len()))
            .collect();

        LogStatistics {
            total: inner.total,
            by_level,
            by_proxy,
            per_proxy_cap: self.per_proxy_cap,
            global_cap: self.global_cap,
        }
    }
}

/// Drop the single oldest entry across all buckets.
fn evict_globally_oldest(inner: &mut LogBuckets) {
    let oldest = inner
        .buckets
        .iter()
        .filter_map(|(name, bucket)| bucket.front().map(|entry| (entry.seq, name.clone())))
        .min();

    if let Some((_, name)) = oldest {
        if let Some(bucket) = inner.buckets.get_mut(&name) {
            bucket.pop_front();
            inner.total -= 1;
            if bucket.is_empty() {
                inner.buckets.remove(&name);
            }
        }
    }
}
