//! Resource limits applied to every execution

use std::time::Duration;

/// Limits shared by all backends
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Timeout for requests that don't set one
    pub default_timeout: Duration,
    /// Largest timeout a request may ask for
    pub max_timeout: Duration,
    /// Slack on top of the request timeout before the outer deadline fires
    pub deadline_grace: Duration,
    /// Combined stdout + stderr cap in bytes
    pub max_output_bytes: usize,
    /// Maximum code payload size in bytes
    pub max_code_bytes: usize,
    /// Memory ceiling in bytes (container / pooled backends)
    pub memory_bytes: u64,
    /// CPU quota in cores
    pub cpus: f64,
    /// Maximum number of processes inside a container
    pub pids_limit: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
            deadline_grace: Duration::from_millis(1500),
            max_output_bytes: 1024 * 1024, // 1MB
            max_code_bytes: 64 * 1024,     // 64KB
            memory_bytes: 512 * 1024 * 1024,
            cpus: 1.0,
            pids_limit: 128,
        }
    }
}

impl ResourceLimits {
    /// Hard deadline for a request, including backend teardown time
    pub fn deadline_for(&self, timeout: Duration) -> Duration {
        timeout + self.deadline_grace
    }

    /// Slack a remote call gets past the request timeout. Half the outer grace,
    /// so the client gives up (and kills) before the outer deadline drops it.
    pub fn client_grace(&self) -> Duration {
        self.deadline_grace / 2
    }

    /// Memory limit in the `--memory` flag format
    pub fn memory_flag(&self) -> String {
        format!("{}m", (self.memory_bytes / (1024 * 1024)).max(4))
    }
}
