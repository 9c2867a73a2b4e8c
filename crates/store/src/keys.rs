//! Key namespace for one logical queue.

/// The five store keys derived from a queue label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub queue: String,
    pub active_queue: String,
    pub backoff_time: String,
    pub error_count: String,
    pub queue_processing: String,
}

impl QueueKeys {
    pub fn for_label(label: &str) -> Self {
        Self {
            queue: format!("{label} - Queue"),
            active_queue: format!("{label} - Active Queue"),
            backoff_time: format!("{label} - Backoff Time"),
            error_count: format!("{label} - Error Count"),
            queue_processing: format!("{label} - Queue Processing"),
        }
    }

    pub fn all(&self) -> [&str; 5] {
        [
            &self.queue,
            &self.active_queue,
            &self.backoff_time,
            &self.error_count,
            &self.queue_processing,
        ]
    }
}
