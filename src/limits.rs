// limits.rs - Guard rails against runaway propagation

use crate::error::{NetError, Result};

/// Hard caps consulted while tuples flow. These exist to turn a defective
/// constraint definition (e.g. a self-amplifying flatten) into a clean error
/// instead of memory exhaustion.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum live tuples in the arena.
    pub max_tuples: usize,
    /// Maximum commands dispatched by a single `calculate_score` drain.
    pub max_commands_per_drain: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_tuples: 10_000_000,
            max_commands_per_drain: 100_000_000,
        }
    }
}

impl ResourceLimits {
    /// Tight limits for tests and small models.
    pub fn conservative() -> Self {
        Self {
            max_tuples: 100_000,
            max_commands_per_drain: 1_000_000,
        }
    }

    pub fn check_tuple_count(&self, current: usize) -> Result<()> {
        if current >= self.max_tuples {
            return Err(NetError::resource_limit(
                "max_tuples",
                format!("{} live tuples", current),
            ));
        }
        Ok(())
    }

    pub fn check_command_count(&self, dispatched: usize) -> Result<()> {
        if dispatched >= self.max_commands_per_drain {
            return Err(NetError::resource_limit(
                "max_commands_per_drain",
                format!("{} commands in one drain", dispatched),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_normal_counts() {
        let limits = ResourceLimits::default();
        assert!(limits.check_tuple_count(0).is_ok());
        assert!(limits.check_command_count(1_000).is_ok());
    }

    #[test]
    fn caps_reject_overflow() {
        let limits = ResourceLimits {
            max_tuples: 10,
            max_commands_per_drain: 10,
        };
        assert!(limits.check_tuple_count(10).is_err());
        assert!(limits.check_command_count(10).is_err());
    }
}
