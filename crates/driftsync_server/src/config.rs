//! Server configuration.

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Echo written values in successful outcomes.
    pub returning: bool,
    /// Include the server's current value in conflict refusals.
    pub conflict_values: bool,
    /// Maximum changes returned per pull.
    pub max_pull_batch: usize,
}

impl ServerConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            returning: false,
            conflict_values: true,
            max_pull_batch: 500,
        }
    }

    /// Sets whether written values are echoed in acks.
    #[must_use]
    pub fn with_returning(mut self, returning: bool) -> Self {
        self.returning = returning;
        self
    }

    /// Sets the maximum pull batch size.
    #[must_use]
    pub fn with_max_pull_batch(mut self, size: usize) -> Self {
        self.max_pull_batch = size;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let config = ServerConfig::new()
            .with_returning(true)
            .with_max_pull_batch(10);
        assert!(config.returning);
        assert_eq!(config.max_pull_batch, 10);
    }
}
