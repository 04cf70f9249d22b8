use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Run configuration for the [`Scheduler`](crate::Scheduler).
///
/// Can be built in code:
///
/// ```rust
/// use std::time::Duration;
/// use tsumiki::Config;
///
/// let config = Config::default()
///     .workers(4)
///     .fail_fast(true)
///     .timeout(Duration::from_secs(300));
/// ```
///
/// or deserialized, in which case the timeout is given in milliseconds:
///
/// ```json
/// { "worker_count": 4, "fail_fast": true, "cache_dir": ".cache/tsumiki", "timeout_per_task_ms": 300000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of tasks running at the same time.
    #[serde(alias = "workerCount")]
    pub worker_count: usize,
    /// Stop dispatching new tasks after the first failure.
    #[serde(alias = "failFast")]
    pub fail_fast: bool,
    /// Directory persisting the artifact cache across runs.
    #[serde(alias = "cacheDir")]
    pub cache_dir: Option<Utf8PathBuf>,
    /// Timeout applied to every task which doesn't set its own.
    #[serde(rename = "timeout_per_task_ms", alias = "timeoutPerTask", with = "millis")]
    pub timeout_per_task: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: default_workers(),
            fail_fast: false,
            cache_dir: None,
            timeout_per_task: None,
        }
    }
}

impl Config {
    pub fn workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_task = Some(timeout);
        self
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
