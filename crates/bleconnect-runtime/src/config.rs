//! Driver task configuration

use tokio::time::Duration;

/// Channel sizing and timeouts shared by the consumer and producer tasks
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Capacity of the handle-to-task command channel
    pub command_buffer_size: usize,
    /// Capacity of the broadcast channel carrying application events
    pub app_event_buffer_size: usize,
    /// Upper bound on a single transport effect
    pub effect_timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 32,
            app_event_buffer_size: 64,
            effect_timeout: Duration::from_secs(10),
        }
    }
}

impl TaskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command channel capacity
    pub fn with_command_buffer_size(mut self, size: usize) -> Self {
        self.command_buffer_size = size.max(1);
        self
    }

    /// Set the application event channel capacity
    pub fn with_app_event_buffer_size(mut self, size: usize) -> Self {
        self.app_event_buffer_size = size.max(1);
        self
    }

    /// Set the per-effect timeout
    pub fn with_effect_timeout(mut self, timeout: Duration) -> Self {
        self.effect_timeout = timeout;
        self
    }
}
