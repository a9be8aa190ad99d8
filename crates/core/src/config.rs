use std::env;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Engine tunables, read from `SPINDLE_*` environment variables.
///
/// Every knob has a default that matches the documented dispatch policy,
/// so `DispatchConfig::default()` is what tests and most callers use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Worker budget used when the caller does not supply one.
    pub default_jobs: usize,
    /// Group size used when no cost prediction is available
    /// (the calibration pass for a cold performance model).
    pub default_group_size: usize,
    /// Cost unit for the grouping policy: predicted per-element cost is
    /// expressed as a multiple of this quantum, in microseconds.
    pub cost_quantum_us: u64,
    /// Upper clamp on the cost multiplier, so one slow observation cannot
    /// collapse a batch into a single unit.
    pub max_cost_multiplier: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_jobs: 1,
            default_group_size: 32,
            cost_quantum_us: 100,
            max_cost_multiplier: 64,
        }
    }
}

impl DispatchConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_jobs: env_usize("SPINDLE_DEFAULT_JOBS", defaults.default_jobs).max(1),
            default_group_size: env_usize(
                "SPINDLE_DEFAULT_GROUP_SIZE",
                defaults.default_group_size,
            )
            .max(1),
            cost_quantum_us: env_u64("SPINDLE_COST_QUANTUM_US", defaults.cost_quantum_us).max(1),
            max_cost_multiplier: env_u64(
                "SPINDLE_MAX_COST_MULTIPLIER",
                defaults.max_cost_multiplier,
            )
            .max(1),
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Dispatch config loaded:");
        tracing::info!("  default_jobs:        {}", self.default_jobs);
        tracing::info!("  default_group_size:  {}", self.default_group_size);
        tracing::info!("  cost_quantum_us:     {}", self.cost_quantum_us);
        tracing::info!("  max_cost_multiplier: {}", self.max_cost_multiplier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.default_group_size, 32);
        assert_eq!(cfg.cost_quantum_us, 100);
        assert!(cfg.default_jobs >= 1);
    }

    #[test]
    fn from_env_falls_back_to_defaults() {
        // No SPINDLE_* vars set in the test environment.
        let cfg = DispatchConfig::from_env();
        assert_eq!(cfg.default_group_size, DispatchConfig::default().default_group_size);
    }
}
