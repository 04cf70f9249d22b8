use std::fmt::Write as _;
use std::time::{Duration, Instant};

use console::style;

use crate::TaskGraph;
use crate::core::Artifact;
use crate::error::TaskError;
use crate::fingerprint::Fingerprint;
use crate::manifest::{ManifestEmitter, Product};
use crate::task::TaskStatus;

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunOutcome {
    /// Process exit code for this outcome. Configuration errors, which abort
    /// before a run starts, use [`ConfigError::EXIT_CODE`](crate::ConfigError::EXIT_CODE).
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Cancelled => 2,
        }
    }
}

/// Why a task never started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The named upstream task failed.
    Dependency(String),
    /// Dispatch stopped after the first failure.
    FailFast,
    /// The run was cancelled before the task could start.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Dependency(name) => write!(f, "dependency '{name}' failed"),
            SkipReason::FailFast => f.write_str("stopped after first failure"),
            SkipReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal state of a single task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    pub status: TaskStatus,
    /// Present for failed tasks.
    pub error: Option<TaskError>,
    /// Present for skipped tasks.
    pub skipped: Option<SkipReason>,
    /// The artifact came from the cache, the action didn't run.
    pub cached: bool,
    pub fingerprint: Option<Fingerprint>,
    pub start: Option<Instant>,
    pub duration: Duration,
    pub artifact: Option<Artifact>,
}

/// Result of [`Scheduler::run`](crate::Scheduler::run). Tasks are listed in
/// topological order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub tasks: Vec<TaskReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|task| task.name == name)
    }

    pub fn status(&self, name: &str) -> Option<TaskStatus> {
        self.task(name).map(|task| task.status)
    }

    pub fn with_status(&self, status: TaskStatus) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(move |task| task.status == status)
    }

    /// Outputs of every succeeded task, in topological order.
    pub fn products(&self) -> Vec<Product<'_>> {
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Succeeded)
            .filter_map(|task| {
                task.artifact.as_ref().map(|artifact| Product {
                    name: &task.name,
                    artifact,
                })
            })
            .collect()
    }

    /// Hands the succeeded outputs to a manifest emitter together with the
    /// descriptor, which is passed through untouched.
    pub fn emit<D, M>(&self, emitter: &mut M, descriptor: &D) -> anyhow::Result<()>
    where
        M: ManifestEmitter<D> + ?Sized,
    {
        emitter.emit(descriptor, &self.products())
    }

    /// Renders the graph as a Mermaid flowchart, with every node colored by
    /// the status it ended up in.
    pub fn render_mermaid(&self, graph: &TaskGraph) -> String {
        let mut f = String::new();
        writeln!(f, "graph LR").ok();

        for index in graph.graph.node_indices() {
            let name = &graph.graph[index].name;

            let (label, color) = match self.task(name) {
                Some(task) => match task.status {
                    TaskStatus::Succeeded if task.cached => ("cached".to_string(), "#ADD8E6"),
                    TaskStatus::Succeeded => (format!("{:.2?}", task.duration), "#90EE90"),
                    TaskStatus::Failed => ("failed".to_string(), "#F08080"),
                    TaskStatus::Skipped => ("skipped".to_string(), "#D3D3D3"),
                    other => (other.to_string(), "#FFFFFF"),
                },
                None => ("unknown".to_string(), "#FFFFFF"),
            };

            let name = name.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, label).ok();
            writeln!(f, "    style {:?} fill:{}", index.index(), color).ok();
        }

        for edge in graph.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )
            .ok();
        }

        f
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for task in &self.tasks {
            let status = match task.status {
                TaskStatus::Succeeded => style(format!("{:>9}", task.status)).green(),
                TaskStatus::Failed => style(format!("{:>9}", task.status)).red(),
                TaskStatus::Skipped => style(format!("{:>9}", task.status)).yellow(),
                _ => style(format!("{:>9}", task.status)).dim(),
            };

            write!(f, "{status} {}", task.name)?;

            if task.cached {
                write!(f, " {}", style("(cached)").blue())?;
            } else if task.status == TaskStatus::Succeeded || task.status == TaskStatus::Failed {
                write!(f, " {}", style(format!("({:.2?})", task.duration)).dim())?;
            }

            writeln!(f)?;

            if let Some(error) = &task.error {
                for line in error.to_string().lines() {
                    writeln!(f, "          {line}")?;
                }
            }

            if let Some(reason) = &task.skipped {
                writeln!(f, "          {reason}")?;
            }
        }

        let count = |status: TaskStatus| self.tasks.iter().filter(|t| t.status == status).count();

        let headline = match self.outcome {
            RunOutcome::Succeeded => style("Build succeeded").green().bold(),
            RunOutcome::Failed => style("Build failed").red().bold(),
            RunOutcome::Cancelled => style("Build cancelled").yellow().bold(),
        };

        write!(
            f,
            "{headline}: {} succeeded, {} failed, {} skipped in {:.2?}",
            count(TaskStatus::Succeeded),
            count(TaskStatus::Failed),
            count(TaskStatus::Skipped),
            self.elapsed
        )
    }
}
