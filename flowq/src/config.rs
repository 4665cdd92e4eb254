use serde::{Deserialize, Serialize};

use crate::opts::JobOptions;

/// Configuration shared by producers and workers of one queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Leading segment of every store key.
    pub prefix: String,
    /// Options merged under the options of every added job.
    pub default_job_options: JobOptions,
    /// Cap of the durable event stream.
    pub max_len_events: usize,
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_default_job_options(mut self, opts: JobOptions) -> Self {
        self.default_job_options = opts;
        self
    }

    pub fn with_max_len_events(mut self, max_len: usize) -> Self {
        self.max_len_events = max_len;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "flowq".to_string(),
            default_job_options: JobOptions::default(),
            max_len_events: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_partial_deserialize() {
        let config: QueueConfig = serde_json::from_str(r#"{"prefix":"app"}"#).unwrap();
        assert_eq!(config.prefix, "app");
        assert_eq!(config.max_len_events, 10_000);
        assert_eq!(QueueConfig::new().prefix, "flowq");
    }
}
