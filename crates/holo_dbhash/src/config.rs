//! Checker configuration and environment overrides.

use std::time::Duration;

/// Failpoint that keeps snapshot history around for reads at an old cluster time.
pub const DEFAULT_RETENTION_FAILPOINT: &str = "WTPreserveSnapshotHistoryIndefinitely";
/// Nonexistent collection targeted by the majority read used to wait on secondaries.
pub const DEFAULT_WAIT_COLLECTION: &str = "run_check_repl_dbhash_background";

/// Runtime configuration for one background consistency check.
#[derive(Clone, Debug)]
pub struct CheckerConfig {
    /// Wait on secondaries with a majority read instead of polling applied optimes.
    pub majority_read_concern: bool,
    /// Deadline for one secondary to apply up to the selected timestamp.
    pub secondary_wait_timeout: Duration,
    /// Poll interval for the applied-optime fallback.
    pub secondary_poll_interval: Duration,
    /// Operation-log entries dumped per session when a mismatch is found.
    pub oplog_dump_limit: usize,
    /// Emit a cautionary log every this many attempts on one database. 0 disables.
    pub retry_warn_every: u64,
    /// Number of diagnostic events retained per replica-set check.
    pub debug_trail_capacity: usize,
    /// Databases never checked: snapshot reads at a cluster time are unsupported there.
    pub excluded_databases: Vec<String>,
    pub retention_failpoint: String,
    pub wait_collection: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            majority_read_concern: true,
            secondary_wait_timeout: Duration::from_secs(10 * 60),
            secondary_poll_interval: Duration::from_millis(200),
            oplog_dump_limit: 100,
            retry_warn_every: 1000,
            debug_trail_capacity: 1024,
            excluded_databases: vec![
                "admin".to_string(),
                "config".to_string(),
                "local".to_string(),
            ],
            retention_failpoint: DEFAULT_RETENTION_FAILPOINT.to_string(),
            wait_collection: DEFAULT_WAIT_COLLECTION.to_string(),
        }
    }
}

impl CheckerConfig {
    /// Defaults with `HOLO_DBHASH_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(value) = parse_bool(&lookup, "HOLO_DBHASH_MAJORITY_READ_CONCERN") {
            cfg.majority_read_concern = value;
        }
        if let Some(ms) = parse_positive::<u64>(&lookup, "HOLO_DBHASH_SECONDARY_WAIT_TIMEOUT_MS") {
            cfg.secondary_wait_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_positive::<u64>(&lookup, "HOLO_DBHASH_SECONDARY_POLL_INTERVAL_MS")
        {
            cfg.secondary_poll_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_positive::<usize>(&lookup, "HOLO_DBHASH_OPLOG_DUMP_LIMIT") {
            cfg.oplog_dump_limit = limit;
        }
        // Zero is meaningful here, so no positivity filter.
        if let Some(every) = lookup("HOLO_DBHASH_RETRY_WARN_EVERY")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
        {
            cfg.retry_warn_every = every;
        }
        if let Some(capacity) = parse_positive::<usize>(&lookup, "HOLO_DBHASH_DEBUG_TRAIL_CAPACITY")
        {
            cfg.debug_trail_capacity = capacity;
        }
        cfg
    }

    pub fn is_excluded_database(&self, name: &str) -> bool {
        self.excluded_databases.iter().any(|excluded| excluded == name)
    }
}

fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, var_name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let raw = lookup(var_name)?;
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        _ => {
            tracing::warn!(env = var_name, value = %raw, "ignoring invalid checker setting");
            None
        }
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, var_name: &str) -> Option<bool> {
    let raw = lookup(var_name)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(env = var_name, value = %raw, "ignoring invalid checker setting");
            None
        }
    }
}
