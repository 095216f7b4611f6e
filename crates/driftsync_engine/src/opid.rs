//! Idempotency key and operation id generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Generates unique idempotency keys and operation ids.
///
/// The default mode draws random v4 UUIDs. The sequential mode is a
/// deterministic fallback (`"{prefix}-{n}"` from a monotonic counter)
/// for environments without a usable RNG and for tests that need
/// predictable keys.
#[derive(Debug)]
pub struct OpIdGenerator {
    mode: Mode,
}

#[derive(Debug)]
enum Mode {
    Random,
    Sequential { prefix: String, counter: AtomicU64 },
}

impl OpIdGenerator {
    /// Creates a generator backed by random v4 UUIDs.
    #[must_use]
    pub fn random() -> Self {
        Self { mode: Mode::Random }
    }

    /// Creates a deterministic generator yielding `"{prefix}-1"`,
    /// `"{prefix}-2"`, and so on.
    #[must_use]
    pub fn sequential(prefix: impl Into<String>) -> Self {
        Self {
            mode: Mode::Sequential {
                prefix: prefix.into(),
                counter: AtomicU64::new(0),
            },
        }
    }

    /// Produces the next unique id.
    pub fn next_id(&self) -> String {
        match &self.mode {
            Mode::Random => uuid::Uuid::new_v4().to_string(),
            Mode::Sequential { prefix, counter } => {
                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                format!("{prefix}-{n}")
            }
        }
    }
}

impl Default for OpIdGenerator {
    fn default() -> Self {
        Self::random()
    }
}
