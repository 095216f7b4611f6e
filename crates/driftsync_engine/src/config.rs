//! Configuration for the sync engine.

use crate::backoff::BackoffPolicy;
use driftsync_protocol::ConflictStrategy;
use std::time::Duration;

/// Configuration for the sync engine and its lanes.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Namespace prefixed to every persistence key, identifying one
    /// logical queue. Two engines with the same namespace on the same
    /// store compete for the same lock.
    pub namespace: String,
    /// Maximum distinct wire items per push batch.
    pub max_push_items: usize,
    /// How many pending outbox items one drain pass scans.
    pub scan_limit: usize,
    /// Maximum changes requested per pull.
    pub pull_limit: usize,
    /// Outbox capacity; enqueueing beyond it evicts the oldest pending
    /// item.
    pub max_queue_size: usize,
    /// Base delay for subscribe reconnects.
    pub reconnect_delay: Duration,
    /// Interval between periodic pulls; `None` disables them.
    pub periodic_pull_interval: Option<Duration>,
    /// Attempt cutoff for push retries and periodic pull retries;
    /// `None` retries forever.
    pub retry_max_attempts: Option<u32>,
    /// Backoff policy for push retries and periodic pull retries.
    pub backoff: BackoffPolicy,
    /// Single-instance lock settings.
    pub lock: LockConfig,
    /// Conflict strategy forwarded with write rejections.
    pub conflict_strategy: ConflictStrategy,
    /// Change-stream resource filter; `None` subscribes to everything.
    pub resources: Option<Vec<String>>,
    /// Cursor to pull from when none is persisted yet.
    pub initial_cursor: Option<String>,
    /// Ask the server to echo written values in acks.
    pub returning: bool,
    /// Age after which an in-flight outbox marker is considered
    /// orphaned by a crash and released on startup.
    pub in_flight_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration for the given namespace with defaults
    /// elsewhere.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            max_push_items: 50,
            scan_limit: 200,
            pull_limit: 100,
            max_queue_size: 1_000,
            reconnect_delay: Duration::from_secs(1),
            periodic_pull_interval: Some(Duration::from_secs(30)),
            retry_max_attempts: Some(5),
            backoff: BackoffPolicy::default(),
            lock: LockConfig::default(),
            conflict_strategy: ConflictStrategy::default(),
            resources: None,
            initial_cursor: None,
            returning: false,
            in_flight_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the push batch cap.
    #[must_use]
    pub fn with_max_push_items(mut self, n: usize) -> Self {
        self.max_push_items = n;
        self
    }

    /// Sets the pull page size.
    #[must_use]
    pub fn with_pull_limit(mut self, n: usize) -> Self {
        self.pull_limit = n;
        self
    }

    /// Sets the outbox capacity.
    #[must_use]
    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    /// Sets the periodic pull interval; `None` disables periodic pulls.
    #[must_use]
    pub fn with_periodic_pull_interval(mut self, interval: Option<Duration>) -> Self {
        self.periodic_pull_interval = interval;
        self
    }

    /// Sets the retry attempt cutoff.
    #[must_use]
    pub fn with_retry_max_attempts(mut self, max: Option<u32>) -> Self {
        self.retry_max_attempts = max;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the lock settings.
    #[must_use]
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the conflict strategy.
    #[must_use]
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Restricts the change stream to the given resources.
    #[must_use]
    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Sets the cursor used before any cursor is persisted.
    #[must_use]
    pub fn with_initial_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.initial_cursor = Some(cursor.into());
        self
    }

    /// Requests server echo of written values.
    #[must_use]
    pub fn with_returning(mut self, returning: bool) -> Self {
        self.returning = returning;
        self
    }

    /// Key under which the outbox is persisted.
    pub(crate) fn outbox_key(&self) -> String {
        format!("{}:outbox", self.namespace)
    }

    /// Key under which the cursor is persisted.
    pub(crate) fn cursor_key(&self) -> String {
        format!("{}:cursor", self.namespace)
    }

    /// Key under which the lock record is persisted.
    pub(crate) fn lock_key(&self) -> String {
        format!("{}:lock", self.namespace)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("driftsync")
    }
}

/// Settings for the single-instance lease lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease duration; an unrenewed lock expires after this.
    pub ttl: Duration,
    /// Renewal cadence; must be strictly shorter than `ttl`.
    pub renew_interval: Duration,
    /// Acquisition attempts before giving up with a blocking error.
    pub max_acquire_attempts: u32,
    /// Delay between acquisition attempts.
    pub acquire_retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(3),
            max_acquire_attempts: 3,
            acquire_retry_delay: Duration::from_millis(150),
        }
    }
}
