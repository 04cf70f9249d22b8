use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while assembling or validating the task graph. These are
/// fatal: a run never starts while any of them is present.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Cycle detected in task graph: {}", render_cycle(.0))]
    Cycle(Vec<String>),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConfigError {
    /// Process exit code reserved for configuration errors.
    pub const EXIT_CODE: i32 = 3;
}

fn render_cycle(nodes: &[String]) -> String {
    let mut path = nodes.join(" -> ");
    if let Some(first) = nodes.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

/// Per-task failure. Contained to the task that raised it, its dependents are
/// skipped but the rest of the run carries on.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("{0:#}")]
    Execution(Arc<anyhow::Error>),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    pub fn execution(err: impl Into<anyhow::Error>) -> Self {
        Self::Execution(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError::Execution(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache entry {path} is unreadable:\n{reason}")]
    Corruption { path: camino::Utf8PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode cache entry.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Couldn't read plan file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't parse plan file.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_closes_loop() {
        let err = ConfigError::Cycle(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(
            err.to_string(),
            "Cycle detected in task graph: a -> b -> c -> a"
        );
    }

    #[test]
    fn test_execution_error_keeps_context() {
        let err = anyhow::anyhow!("exit status 1").context("javac failed");
        let err = TaskError::from(err);
        assert_eq!(err.to_string(), "javac failed: exit status 1");
    }
}
