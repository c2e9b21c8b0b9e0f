//! Host load, checked before a session starts and shown by `status`

use std::fmt;
use sysinfo::{System, MINIMUM_CPU_UPDATE_INTERVAL};

/// Upper bounds on host load for starting a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadLimits {
    pub max_cpu_percent: f32,
    pub max_memory_percent: f32,
}

impl LoadLimits {
    /// Limits at or above 100% can never be exceeded
    pub fn is_enabled(&self) -> bool {
        self.max_cpu_percent < 100.0 || self.max_memory_percent < 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemLoad {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

impl SystemLoad {
    /// Sample global CPU use over one refresh interval, and memory use
    ///
    /// `None` when the platform reports no memory figures.
    pub async fn sample() -> Option<Self> {
        let mut system = System::new();
        system.refresh_cpu_usage();
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return None;
        }

        Some(Self {
            cpu_percent: system.global_cpu_usage(),
            memory_percent: system.used_memory() as f32 * 100.0 / total as f32,
        })
    }

    /// The first limit this load exceeds, described for the user
    pub fn exceeded(&self, limits: &LoadLimits) -> Option<String> {
        if self.cpu_percent > limits.max_cpu_percent {
            return Some(format!(
                "CPU usage too high ({:.1}% > {:.1}%)",
                self.cpu_percent, limits.max_cpu_percent
            ));
        }
        if self.memory_percent > limits.max_memory_percent {
            return Some(format!(
                "memory usage too high ({:.1}% > {:.1}%)",
                self.memory_percent, limits.max_memory_percent
            ));
        }
        None
    }
}

impl fmt::Display for SystemLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU {:.1}% | RAM {:.1}%", self.cpu_percent, self.memory_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(cpu: f32, memory: f32) -> LoadLimits {
        LoadLimits {
            max_cpu_percent: cpu,
            max_memory_percent: memory,
        }
    }

    #[test]
    fn test_exceeded_names_the_first_limit() {
        let load = SystemLoad {
            cpu_percent: 92.0,
            memory_percent: 90.0,
        };

        assert!(load.exceeded(&limits(80.0, 85.0)).unwrap().starts_with("CPU"));
        assert!(load.exceeded(&limits(95.0, 85.0)).unwrap().starts_with("memory"));
        assert!(load.exceeded(&limits(95.0, 95.0)).is_none());
    }

    #[test]
    fn test_full_limits_disable_the_check() {
        assert!(!limits(100.0, 100.0).is_enabled());
        assert!(limits(100.0, 85.0).is_enabled());
    }

    #[tokio::test]
    async fn test_sample_reports_percentages() {
        let Some(load) = SystemLoad::sample().await else {
            return;
        };
        assert!((0.0..=100.0).contains(&load.memory_percent));
        assert!(load.cpu_percent >= 0.0);
    }
}
