//! Queue configuration.
//!
//! Plain data only; wiring happens in [`crate::QueueManager`].

use std::path::PathBuf;
use std::time::Duration;

use runq_protocol::RunPriority;
use serde::Deserialize;
use serde::Serialize;

/// Overflow policy for a run's [`crate::StreamBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropStrategy {
    /// Discard the oldest buffered chunk to make room for the new one.
    #[default]
    DropOldest,
    /// Refuse the incoming chunk and keep the buffer as-is.
    RejectNewest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard cap on simultaneously running runs across the whole pool. Also
    /// the number of workers the pool spawns.
    pub max_concurrent_global: usize,
    /// Cap on running runs sharing one agent name.
    pub max_concurrent_per_agent: usize,
    /// Cap on running runs sharing one workspace key.
    pub max_concurrent_per_workspace: usize,

    /// Submissions beyond this many queued runs are rejected.
    pub max_queue_size: usize,

    pub default_priority: RunPriority,
    pub default_max_retries: u32,

    pub enable_persistence: bool,
    pub store_path: PathBuf,

    /// Interval between periodic flushes of all active runs to the store.
    /// Zero disables autosave.
    #[serde(with = "duration_secs")]
    pub autosave_interval: Duration,

    /// Max chunks buffered per running run before the drop policy applies.
    pub stream_buffer_size: usize,
    pub drop_strategy: DropStrategy,

    /// Upper bound on a single run's wall-clock time. `None` means no bound.
    #[serde(with = "option_duration_secs")]
    pub run_timeout: Option<Duration>,

    /// Idle sleep between empty scheduler polls.
    #[serde(with = "duration_secs")]
    pub worker_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_global: 4,
            max_concurrent_per_agent: 2,
            max_concurrent_per_workspace: 4,
            max_queue_size: 100,
            default_priority: RunPriority::Normal,
            default_max_retries: 3,
            enable_persistence: true,
            store_path: PathBuf::from(".runq/queue.sqlite"),
            autosave_interval: Duration::from_secs(30),
            stream_buffer_size: 1000,
            drop_strategy: DropStrategy::DropOldest,
            run_timeout: None,
            worker_poll_interval: Duration::from_millis(100),
        }
    }
}

mod duration_secs {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod option_duration_secs {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        secs.map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
