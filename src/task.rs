//! All the task-related abstractions.
//!
//! A task is a named unit of work with a list of dependencies. The work itself
//! is an [`Action`], an opaque, type-erased capability that receives a
//! [`TaskContext`] and produces an [`Artifact`]. The graph owns the tasks, the
//! scheduler owns their per-run status.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

use crate::core::Artifact;
use crate::fingerprint::{Fingerprint, Inputs};

/// The executable part of a task.
///
/// Implemented for every `Fn(&TaskContext) -> anyhow::Result<Artifact>`
/// closure, so most callers never implement it by hand. Actions must not share
/// mutable state with each other; the scheduler runs them concurrently and
/// makes no attempt to serialize them.
pub trait Action: Send + Sync {
    fn run(&self, ctx: &TaskContext) -> anyhow::Result<Artifact>;
}

impl<F> Action for F
where
    F: Fn(&TaskContext) -> anyhow::Result<Artifact> + Send + Sync,
{
    fn run(&self, ctx: &TaskContext) -> anyhow::Result<Artifact> {
        self(ctx)
    }
}

/// Pins the signature of a closure so it can be passed wherever an
/// [`Action`] is expected without annotating the argument type.
///
/// ```rust
/// use tsumiki::{Artifact, TaskGraph, action};
///
/// let mut graph = TaskGraph::new();
/// graph.add_task("hello", [] as [&str; 0], action(|_| Ok(Artifact::from_text("hi"))))?;
/// # Ok::<(), tsumiki::ConfigError>(())
/// ```
pub fn action<F>(f: F) -> F
where
    F: Fn(&TaskContext) -> anyhow::Result<Artifact> + Send + Sync,
{
    f
}

pub(crate) type ActionPtr = Arc<dyn Action>;

/// Lifecycle of a task within a single run.
///
/// Transitions only ever go forward:
/// `Pending -> Ready -> Running -> {Succeeded, Failed}`. A task that never
/// started, because an upstream task failed or dispatch stopped, ends up as
/// `Skipped` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub(crate) fn can_advance_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, next),
            (Pending, Ready)
                | (Ready, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Pending, Skipped)
                | (Ready, Skipped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A task as stored in the graph.
pub(crate) struct TaskNode {
    pub name: Arc<str>,
    /// Declared dependencies, deduplicated, in declaration order.
    pub dependencies: Vec<Arc<str>>,
    pub action: ActionPtr,
    pub inputs: Option<Inputs>,
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("inputs", &self.inputs)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// The context passed to every action.
///
/// It exposes the artifacts of the task's dependencies, the fingerprint the
/// task runs under (if it declared inputs), and the cancellation state. The
/// context is immutable during the execution.
pub struct TaskContext {
    pub(crate) name: Arc<str>,
    pub(crate) root: Utf8PathBuf,
    pub(crate) upstream: Vec<(Arc<str>, Artifact)>,
    pub(crate) fingerprint: Option<Fingerprint>,
    pub(crate) token: CancellationToken,
    /// Tracing span assigned to this task.
    pub(crate) span: tracing::Span,
}

impl TaskContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory the run is rooted at, input globs are resolved against it.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Artifact produced by the named dependency.
    pub fn dependency(&self, name: &str) -> Option<&Artifact> {
        self.upstream
            .iter()
            .find(|(dep, _)| dep.as_ref() == name)
            .map(|(_, artifact)| artifact)
    }

    /// Artifacts of all dependencies, in declaration order.
    pub fn dependencies(&self) -> impl Iterator<Item = (&str, &Artifact)> {
        self.upstream
            .iter()
            .map(|(name, artifact)| (name.as_ref(), artifact))
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    /// Returns `true` once the run was cancelled or this task timed out.
    /// Long-running actions should poll this and bail out early.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(upstream: Vec<(&str, Artifact)>) -> TaskContext {
        TaskContext {
            name: "shadowJar".into(),
            root: Utf8PathBuf::from("."),
            upstream: upstream
                .into_iter()
                .map(|(name, artifact)| (Arc::from(name), artifact))
                .collect(),
            fingerprint: None,
            token: CancellationToken::new(),
            span: tracing::Span::none(),
        }
    }

    #[test]
    fn test_forward_transitions() {
        use TaskStatus::*;

        assert!(Pending.can_advance_to(Ready));
        assert!(Ready.can_advance_to(Running));
        assert!(Running.can_advance_to(Succeeded));
        assert!(Running.can_advance_to(Failed));
        assert!(Ready.can_advance_to(Skipped));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        use TaskStatus::*;

        assert!(!Running.can_advance_to(Ready));
        assert!(!Succeeded.can_advance_to(Running));
        assert!(!Failed.can_advance_to(Skipped));
        assert!(!Running.can_advance_to(Skipped));
        assert!(!Pending.can_advance_to(Running));
    }

    #[test]
    fn test_closure_is_action() {
        let greet = action(|ctx| Ok(Artifact::from_text(format!("hello from {}", ctx.name()))));
        let out = greet.run(&context(vec![])).unwrap();
        assert_eq!(out.text(), Some("hello from shadowJar"));
    }

    #[test]
    fn test_dependency_lookup() {
        let ctx = context(vec![
            ("compileJava", Artifact::from_text("classes")),
            ("processResources", Artifact::from_text("plugin.yml")),
        ]);

        assert_eq!(ctx.dependency("processResources").and_then(Artifact::text), Some("plugin.yml"));
        assert!(ctx.dependency("javadoc").is_none());

        let names: Vec<_> = ctx.dependencies().map(|(name, _)| name).collect();
        assert_eq!(names, ["compileJava", "processResources"]);
    }

    #[test]
    fn test_cancellation_visible_to_action() {
        let ctx = context(vec![]);
        assert!(!ctx.is_cancelled());
        ctx.cancellation().cancel();
        assert!(ctx.is_cancelled());
    }
}
