use crate::catalog::types::Collation;
use crate::error::AutopartError;
use std::time::Duration;

/// Runtime configuration for a partition engine instance.
#[derive(Debug, Clone)]
pub struct AutopartConfig {
    /// Global switch for on-demand range partition creation. Per-table
    /// `PartitionParams::auto_create` must also be set.
    pub auto_partition_enabled: bool,
    /// Default for `PartitionParams::spawn_using_worker` on newly partitioned tables.
    pub worker_delegation_enabled: bool,
    pub worker_threads: usize,
    pub worker_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub max_name_attempts: usize,
    pub max_spawn_steps: usize,
    pub default_collation: Collation,
}

impl Default for AutopartConfig {
    fn default() -> Self {
        Self {
            auto_partition_enabled: true,
            worker_delegation_enabled: false,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get().clamp(1, 4))
                .unwrap_or(2),
            worker_timeout_ms: 10_000,
            lock_timeout_ms: 5_000,
            max_name_attempts: 1_000,
            max_spawn_steps: 10_000,
            default_collation: Collation::Binary,
        }
    }
}

impl AutopartConfig {
    pub fn production() -> Self {
        Self {
            worker_delegation_enabled: true,
            worker_timeout_ms: 30_000,
            lock_timeout_ms: 10_000,
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            worker_delegation_enabled: false,
            worker_threads: 1,
            worker_timeout_ms: 2_000,
            lock_timeout_ms: 1_000,
            max_spawn_steps: 1_000,
            ..Self::default()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), AutopartError> {
        if self.worker_threads == 0 {
            return Err(invalid("worker_threads must be > 0"));
        }
        if self.worker_timeout_ms == 0 {
            return Err(invalid("worker_timeout_ms must be > 0"));
        }
        if self.lock_timeout_ms == 0 {
            return Err(invalid("lock_timeout_ms must be > 0"));
        }
        if self.max_name_attempts == 0 {
            return Err(invalid("max_name_attempts must be > 0"));
        }
        if self.max_spawn_steps == 0 {
            return Err(invalid("max_spawn_steps must be > 0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> AutopartError {
    AutopartError::InvalidConfig {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::AutopartConfig;
    use crate::error::AutopartErrorCode;

    #[test]
    fn profiles_validate() {
        AutopartConfig::default()
            .validate()
            .expect("default config");
        AutopartConfig::production()
            .validate()
            .expect("production config");
        AutopartConfig::development()
            .validate()
            .expect("development config");
        assert!(AutopartConfig::production().worker_delegation_enabled);
        assert!(!AutopartConfig::development().worker_delegation_enabled);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let cfg = AutopartConfig {
            max_name_attempts: 0,
            ..AutopartConfig::default()
        };
        let err = cfg.validate().expect_err("zero name attempts");
        assert_eq!(err.code(), AutopartErrorCode::InvalidConfig);

        let cfg = AutopartConfig {
            lock_timeout_ms: 0,
            ..AutopartConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = AutopartConfig {
            worker_threads: 0,
            ..AutopartConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
