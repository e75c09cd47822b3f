//! Runtime configuration read from `TRACKER_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Tag names recognised in addition to `Reviewed-by` and `Based-on`.
pub const DEFAULT_TAGS: &str = "Tested-by, Reported-by, Acked-by, Suggested-by";

fn lookup_bool(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn lookup_usize(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn lookup_duration_millis(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    lookup(key)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis)
}

fn lookup_string(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

/// Split a comma separated tag list, dropping blanks.
pub fn parse_tag_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub tag_names: Vec<String>,
    /// Backend advertises full-text subject search.
    pub full_text_search: bool,
    pub import_threads: usize,
    pub snapshot_dir: PathBuf,
    /// Upper bound for a single search; `None` runs to completion.
    pub query_timeout: Option<Duration>,
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        Self {
            tag_names: parse_tag_list(&lookup_string(lookup, "TRACKER_TAGS", DEFAULT_TAGS)),
            full_text_search: lookup_bool(lookup, "TRACKER_FULL_TEXT", false),
            import_threads: lookup_usize(lookup, "TRACKER_IMPORT_THREADS", num_cpus::get()),
            snapshot_dir: PathBuf::from(lookup_string(lookup, "TRACKER_SNAPSHOT_DIR", "./cache")),
            query_timeout: lookup_duration_millis(lookup, "TRACKER_QUERY_TIMEOUT_MS"),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
