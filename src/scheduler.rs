//! Parallel execution of a [`TaskGraph`].
//!
//! The calling thread acts as the coordinator. It owns the state of every task
//! and a frontier of tasks whose dependencies all succeeded, and hands those
//! to a dedicated rayon pool, never keeping more than `worker_count` of them
//! in flight. Workers report back over a channel; the coordinator then
//! releases dependents, propagates failures, and enforces deadlines.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use petgraph::graph::NodeIndex;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::core::Artifact;
use crate::error::{CacheError, ConfigError, TaskError};
use crate::fingerprint::{Fingerprint, Inputs};
use crate::graph::TaskGraph;
use crate::report::{RunOutcome, RunReport, SkipReason, TaskReport};
use crate::task::{ActionPtr, TaskContext, TaskStatus};
use crate::utils::{STYLE_RUN, STYLE_TASK, as_overhead};

/// Runs task graphs under a [`Config`], sharing one [`ArtifactCache`] across
/// every run.
///
/// ```rust
/// use tsumiki::{Artifact, Config, RunOutcome, Scheduler, TaskGraph};
///
/// let mut graph = TaskGraph::new();
/// graph.task("compileJava").run(|_| Ok(Artifact::from_text("classes")))?;
/// graph
///     .task("jar")
///     .depends_on(["compileJava"])
///     .run(|ctx| Ok(ctx.dependency("compileJava").cloned().unwrap_or_default()))?;
///
/// let scheduler = Scheduler::new(Config::default().workers(2))?;
/// let report = scheduler.run(&graph)?;
///
/// assert_eq!(report.outcome, RunOutcome::Succeeded);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Scheduler {
    config: Config,
    cache: Arc<ArtifactCache>,
    root: Utf8PathBuf,
}

impl Scheduler {
    /// Creates a scheduler, opening the on-disk cache if the config names a
    /// cache directory.
    pub fn new(config: Config) -> Result<Self, CacheError> {
        let cache = match &config.cache_dir {
            Some(dir) => ArtifactCache::open(dir)?,
            None => ArtifactCache::in_memory(),
        };

        Ok(Self::with_cache(config, Arc::new(cache)))
    }

    /// Creates a scheduler around an existing cache, the config's cache
    /// directory is ignored.
    pub fn with_cache(config: Config, cache: Arc<ArtifactCache>) -> Self {
        Self {
            config,
            cache,
            root: Utf8PathBuf::from("."),
        }
    }

    /// Sets the directory input globs are resolved against.
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Runs every task in the graph.
    ///
    /// Fails only if the graph or the config is invalid, in which case no task
    /// is started. Task failures are reported in the returned [`RunReport`].
    pub fn run(&self, graph: &TaskGraph) -> Result<RunReport, ConfigError> {
        self.run_until(graph, &CancellationToken::new())
    }

    /// Runs every task in the graph until `cancel` fires.
    ///
    /// Once cancelled, no new task is started. Tasks already running can
    /// observe the cancellation through [`TaskContext::is_cancelled`], and
    /// are otherwise left to finish. Every task which never started is
    /// reported as skipped and the run outcome is [`RunOutcome::Cancelled`].
    pub fn run_until(&self, graph: &TaskGraph, cancel: &CancellationToken) -> Result<RunReport, ConfigError> {
        let order = graph.order()?;

        let workers = self.config.worker_count;
        if workers == 0 {
            return Err(ConfigError::InvalidConfig("worker_count must be at least 1".into()));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tsumiki-worker-{i}"))
            .build()
            .map_err(|e| ConfigError::InvalidConfig(format!("couldn't start worker pool: {e}")))?;

        let start = Instant::now();

        let root_span = tracing::span!(Level::INFO, "building_tasks");
        root_span.pb_set_length(order.len() as u64);
        root_span.pb_set_style(&STYLE_RUN);
        root_span.pb_set_message("Building tasks...");
        let _enter = root_span.enter();

        tracing::info!("running {} tasks on {} workers", order.len(), workers);

        let mut run = Run::new(self, graph, cancel, root_span.clone());
        let (sender, receiver) = channel::<Completion>();

        pool.in_place_scope(|scope| {
            loop {
                while run.in_flight < workers
                    && !run.halted()
                    && let Some(index) = run.frontier.pop_front()
                {
                    let job = run.dispatch(index);
                    let sender = sender.clone();

                    scope.spawn(move |_| job.execute(sender));
                    run.in_flight += 1;
                }

                if run.in_flight == 0 {
                    break;
                }

                let received = match run.next_deadline() {
                    Some(deadline) => receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())),
                    None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };

                match received {
                    Ok(completion) => {
                        run.in_flight -= 1;
                        run.complete(completion);
                    }
                    Err(RecvTimeoutError::Timeout) => run.expire(Instant::now()),
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        let report = run.finish(&order, start.elapsed());

        match report.outcome {
            RunOutcome::Succeeded => tracing::info!("build succeeded {}", as_overhead(start)),
            RunOutcome::Failed => tracing::error!("build failed {}", as_overhead(start)),
            RunOutcome::Cancelled => tracing::warn!("build cancelled {}", as_overhead(start)),
        }

        Ok(report)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Per-run state of a single task.
struct Slot {
    status: TaskStatus,
    /// Dependencies which haven't succeeded yet.
    remaining: usize,
    error: Option<TaskError>,
    skipped: Option<SkipReason>,
    cached: bool,
    fingerprint: Option<Fingerprint>,
    start: Option<Instant>,
    duration: Duration,
    artifact: Option<Artifact>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    token: Option<CancellationToken>,
    timed_out: Arc<AtomicBool>,
}

/// Message sent by a worker once a task is done.
struct Completion {
    index: NodeIndex,
    result: Result<(Artifact, bool), TaskError>,
    fingerprint: Option<Fingerprint>,
    duration: Duration,
}

/// Coordinator state, only ever touched from the calling thread.
struct Run<'a> {
    scheduler: &'a Scheduler,
    graph: &'a TaskGraph,
    cancel: &'a CancellationToken,
    span: tracing::Span,
    slots: Vec<Slot>,
    frontier: VecDeque<NodeIndex>,
    in_flight: usize,
    /// Set by the first failure when running with `fail_fast`.
    stopped: bool,
}

impl<'a> Run<'a> {
    fn new(
        scheduler: &'a Scheduler,
        graph: &'a TaskGraph,
        cancel: &'a CancellationToken,
        span: tracing::Span,
    ) -> Self {
        let slots: Vec<Slot> = graph
            .graph
            .node_indices()
            .map(|index| Slot {
                status: TaskStatus::Pending,
                remaining: graph.dependency_indices(index).count(),
                error: None,
                skipped: None,
                cached: false,
                fingerprint: None,
                start: None,
                duration: Duration::ZERO,
                artifact: None,
                timeout: graph.graph[index]
                    .timeout
                    .or(scheduler.config.timeout_per_task),
                deadline: None,
                token: None,
                timed_out: Arc::new(AtomicBool::new(false)),
            })
            .collect();

        let mut run = Self {
            scheduler,
            graph,
            cancel,
            span,
            slots,
            frontier: VecDeque::new(),
            in_flight: 0,
            stopped: false,
        };

        for index in graph.graph.node_indices() {
            if run.slots[index.index()].remaining == 0 {
                run.advance(index, TaskStatus::Ready);
                run.frontier.push_back(index);
            }
        }

        run
    }

    fn halted(&self) -> bool {
        self.stopped || self.cancel.is_cancelled()
    }

    fn name(&self, index: NodeIndex) -> &str {
        &self.graph.graph[index].name
    }

    fn advance(&mut self, index: NodeIndex, next: TaskStatus) {
        let slot = &mut self.slots[index.index()];
        debug_assert!(
            slot.status.can_advance_to(next),
            "illegal transition {} -> {} for task {}",
            slot.status,
            next,
            self.graph.graph[index].name
        );
        slot.status = next;
    }

    /// Marks a ready task as running and packs up everything its worker needs.
    fn dispatch(&mut self, index: NodeIndex) -> Job {
        let graph = self.graph;
        let node = &graph.graph[index];

        let upstream = graph
            .dependency_indices(index)
            .map(|dep| {
                let artifact = self.slots[dep.index()].artifact.clone().unwrap_or_default();
                (graph.graph[dep].name.clone(), artifact)
            })
            .collect();

        let span = tracing::span!(parent: &self.span, Level::INFO, "task", name = %node.name);
        span.pb_set_style(&STYLE_TASK);
        span.pb_set_message(&format!("Running {}", node.name));

        let token = self.cancel.child_token();
        let now = Instant::now();

        let slot = &mut self.slots[index.index()];
        slot.start = Some(now);
        slot.deadline = slot.timeout.map(|timeout| now + timeout);
        slot.token = Some(token.clone());

        let job = Job {
            index,
            action: node.action.clone(),
            inputs: node.inputs.clone(),
            cache: self.scheduler.cache.clone(),
            timeout: slot.timeout,
            timed_out: slot.timed_out.clone(),
            context: TaskContext {
                name: node.name.clone(),
                root: self.scheduler.root.clone(),
                upstream,
                fingerprint: None,
                token,
                span,
            },
        };

        tracing::debug!("starting {}", node.name);
        self.advance(index, TaskStatus::Running);

        job
    }

    fn complete(&mut self, completion: Completion) {
        let index = completion.index;
        let slot = &mut self.slots[index.index()];

        slot.duration = completion.duration;
        slot.fingerprint = completion.fingerprint;
        slot.deadline = None;
        slot.token = None;

        // Already failed on its deadline, whatever it produced is dropped.
        if slot.status != TaskStatus::Running {
            tracing::debug!("discarding late result of {}", self.name(index));
            return;
        }

        match completion.result {
            Ok((artifact, cached)) => {
                self.span.pb_inc(1);
                slot.artifact = Some(artifact);
                slot.cached = cached;
                self.advance(index, TaskStatus::Succeeded);

                if cached {
                    tracing::info!("{} is up to date", self.name(index));
                } else {
                    tracing::info!("finished {} in {:.2?}", self.name(index), completion.duration);
                }

                self.release(index);
            }
            Err(error) => self.fail(index, error),
        }
    }

    /// Moves every dependent whose dependencies have now all succeeded to the
    /// back of the frontier, in insertion order.
    fn release(&mut self, index: NodeIndex) {
        let mut ready: Vec<NodeIndex> = Vec::new();

        for dependent in self.graph.dependents(index) {
            let slot = &mut self.slots[dependent.index()];
            slot.remaining -= 1;
            if slot.remaining == 0 && slot.status == TaskStatus::Pending {
                ready.push(dependent);
            }
        }

        ready.sort();

        for dependent in ready {
            self.advance(dependent, TaskStatus::Ready);
            self.frontier.push_back(dependent);
        }
    }

    fn fail(&mut self, index: NodeIndex, error: TaskError) {
        tracing::error!("task {} failed: {}", self.name(index), error);

        self.slots[index.index()].error = Some(error);
        self.advance(index, TaskStatus::Failed);
        self.span.pb_inc(1);

        if self.scheduler.config.fail_fast && !self.stopped {
            tracing::warn!("stopping dispatch after the failure of {}", self.name(index));
            self.stopped = true;
        }

        self.skip_dependents(index);
    }

    /// Skips everything downstream of a failed task.
    fn skip_dependents(&mut self, failed: NodeIndex) {
        let reason = SkipReason::Dependency(self.name(failed).to_string());
        let mut queue: VecDeque<NodeIndex> = self.graph.dependents(failed).collect();

        while let Some(index) = queue.pop_front() {
            let status = self.slots[index.index()].status;
            if !matches!(status, TaskStatus::Pending | TaskStatus::Ready) {
                continue;
            }

            tracing::debug!("skipping {}, {}", self.name(index), reason);
            self.advance(index, TaskStatus::Skipped);
            self.slots[index.index()].skipped = Some(reason.clone());
            queue.extend(self.graph.dependents(index));
        }

        let slots = &self.slots;
        self.frontier
            .retain(|index| slots[index.index()].status == TaskStatus::Ready);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter(|slot| slot.status == TaskStatus::Running)
            .filter_map(|slot| slot.deadline)
            .min()
    }

    /// Fails every running task whose deadline has passed. The worker keeps
    /// its slot until the action actually returns.
    fn expire(&mut self, now: Instant) {
        let expired: Vec<NodeIndex> = self
            .graph
            .graph
            .node_indices()
            .filter(|index| {
                let slot = &self.slots[index.index()];
                slot.status == TaskStatus::Running && slot.deadline.is_some_and(|d| d <= now)
            })
            .collect();

        for index in expired {
            let slot = &mut self.slots[index.index()];
            let timeout = slot.timeout.unwrap_or_default();

            slot.timed_out.store(true, Ordering::SeqCst);
            slot.deadline = None;
            if let Some(token) = &slot.token {
                token.cancel();
            }

            self.fail(index, TaskError::Timeout(timeout));
        }
    }

    /// Skips whatever never got to run and assembles the report.
    fn finish(mut self, order: &[NodeIndex], elapsed: Duration) -> RunReport {
        let reason = if self.cancel.is_cancelled() {
            SkipReason::Cancelled
        } else {
            SkipReason::FailFast
        };

        for index in self.graph.graph.node_indices() {
            if !self.slots[index.index()].status.is_terminal() {
                self.advance(index, TaskStatus::Skipped);
                self.slots[index.index()].skipped = Some(reason.clone());
            }
        }

        let cancelled = self
            .slots
            .iter()
            .any(|slot| slot.skipped == Some(SkipReason::Cancelled));
        let failed = self
            .slots
            .iter()
            .any(|slot| slot.status == TaskStatus::Failed);

        let outcome = match (cancelled, failed) {
            (true, _) => RunOutcome::Cancelled,
            (false, true) => RunOutcome::Failed,
            (false, false) => RunOutcome::Succeeded,
        };

        let mut slots: Vec<Option<Slot>> = self.slots.into_iter().map(Some).collect();

        let tasks = order
            .iter()
            .filter_map(|&index| {
                let slot = slots[index.index()].take()?;
                Some(TaskReport {
                    name: self.graph.graph[index].name.to_string(),
                    status: slot.status,
                    error: slot.error,
                    skipped: slot.skipped,
                    cached: slot.cached,
                    fingerprint: slot.fingerprint,
                    start: slot.start,
                    duration: slot.duration,
                    artifact: slot.artifact,
                })
            })
            .collect();

        RunReport {
            outcome,
            tasks,
            elapsed,
        }
    }
}

/// Everything a worker needs to run a single task.
struct Job {
    index: NodeIndex,
    action: ActionPtr,
    inputs: Option<Inputs>,
    cache: Arc<ArtifactCache>,
    timeout: Option<Duration>,
    timed_out: Arc<AtomicBool>,
    context: TaskContext,
}

impl Job {
    fn execute(mut self, sender: Sender<Completion>) {
        let span = self.context.span.clone();
        let _enter = span.enter();

        let start = Instant::now();
        let fingerprint = self.fingerprint();

        let result = match fingerprint {
            Ok(Some(fingerprint)) => {
                self.context.fingerprint = Some(fingerprint);
                self.cache
                    .get_or_compute(fingerprint, || self.invoke())
                    .map(|(artifact, lookup)| (artifact, lookup.is_hit()))
            }
            Ok(None) => self.invoke().map(|artifact| (artifact, false)),
            Err(error) => Err(error),
        };

        let completion = Completion {
            index: self.index,
            result,
            fingerprint: self.context.fingerprint,
            duration: start.elapsed(),
        };

        // The coordinator only hangs up once nothing is in flight.
        if sender.send(completion).is_err() {
            tracing::error!("coordinator went away before {} finished", self.context.name);
        }
    }

    fn fingerprint(&self) -> Result<Option<Fingerprint>, TaskError> {
        let Some(inputs) = &self.inputs else {
            return Ok(None);
        };

        let upstream: Vec<&Artifact> = self.context.dependencies().map(|(_, a)| a).collect();

        inputs
            .fingerprint(&self.context.name, &self.context.root, &upstream)
            .map(Some)
            .map_err(|e| TaskError::execution(e.context("couldn't fingerprint inputs")))
    }

    fn invoke(&self) -> Result<Artifact, TaskError> {
        // The action only sees its own context and immutable upstream
        // artifacts, a panic can't leave shared state half-written.
        let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.action.run(&self.context)
        })) {
            Ok(result) => result.map_err(TaskError::from),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };

                Err(TaskError::execution(anyhow::anyhow!(msg)))
            }
        };

        // Past the deadline the result is never published, not even to the
        // cache.
        if self.timed_out.load(Ordering::SeqCst) {
            return Err(TaskError::Timeout(self.timeout.unwrap_or_default()));
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;

    use super::*;
    use crate::action;

    fn scheduler(workers: usize) -> Scheduler {
        Scheduler::with_cache(Config::default().workers(workers), Arc::new(ArtifactCache::in_memory()))
    }

    fn ok(text: &'static str) -> impl Fn(&TaskContext) -> anyhow::Result<Artifact> + Send + Sync + 'static {
        move |_| Ok(Artifact::from_text(text))
    }

    #[test]
    fn test_empty_graph_succeeds() {
        let report = scheduler(2).run(&TaskGraph::new()).unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert!(report.tasks.is_empty());
    }

    #[test]
    fn test_dependency_artifacts_visible() {
        let mut graph = TaskGraph::new();
        graph.task("compileJava").run(ok("classes")).unwrap();
        graph.task("processResources").run(ok("plugin.yml")).unwrap();
        graph
            .task("jar")
            .depends_on(["compileJava", "processResources"])
            .run(|ctx| {
                let parts: Vec<&str> = ctx
                    .dependencies()
                    .filter_map(|(_, artifact)| artifact.text())
                    .collect();
                Ok(Artifact::from_text(parts.join("+")))
            })
            .unwrap();

        let report = scheduler(2).run(&graph).unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.exit_code(), 0);
        let jar = report.task("jar").unwrap();
        assert_eq!(jar.artifact.as_ref().and_then(Artifact::text), Some("classes+plugin.yml"));

        let names: Vec<_> = report.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["compileJava", "processResources", "jar"]);
    }

    #[test]
    fn test_failure_propagates_to_dependents() {
        // A -> B -> C, B fails.
        let ran_c = Arc::new(AtomicBool::new(false));

        let mut graph = TaskGraph::new();
        graph.task("A").run(ok("a")).unwrap();
        graph
            .task("B")
            .depends_on(["A"])
            .run(|_| Err(anyhow::anyhow!("boom")))
            .unwrap();
        graph
            .task("C")
            .depends_on(["B"])
            .run({
                let ran_c = ran_c.clone();
                move |_| {
                    ran_c.store(true, Ordering::SeqCst);
                    Ok(Artifact::empty())
                }
            })
            .unwrap();

        let report = scheduler(2).run(&graph).unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.status("A"), Some(TaskStatus::Succeeded));
        assert_eq!(report.status("B"), Some(TaskStatus::Failed));
        assert_eq!(report.status("C"), Some(TaskStatus::Skipped));
        assert_eq!(report.task("C").unwrap().skipped, Some(SkipReason::Dependency("B".into())));
        assert!(report.task("B").unwrap().error.as_ref().unwrap().to_string().contains("boom"));
        assert!(!ran_c.load(Ordering::SeqCst));
    }

    #[test]
    fn test_transitive_skip_names_failed_ancestor() {
        // A fails -> B -> C.
        let mut graph = TaskGraph::new();
        graph.task("A").run(|_| Err(anyhow::anyhow!("boom"))).unwrap();
        graph.task("B").depends_on(["A"]).run(ok("b")).unwrap();
        graph.task("C").depends_on(["B"]).run(ok("c")).unwrap();

        let report = scheduler(2).run(&graph).unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.status("A"), Some(TaskStatus::Failed));
        assert_eq!(report.task("B").unwrap().skipped, Some(SkipReason::Dependency("A".into())));
        assert_eq!(report.task("C").unwrap().skipped, Some(SkipReason::Dependency("A".into())));
    }

    #[test]
    fn test_failure_leaves_independent_branches_running() {
        let mut graph = TaskGraph::new();
        graph.task("broken").run(|_| Err(anyhow::anyhow!("nope"))).unwrap();
        graph.task("downstream").depends_on(["broken"]).run(ok("x")).unwrap();
        graph.task("independent").run(ok("y")).unwrap();
        graph.task("after").depends_on(["independent"]).run(ok("z")).unwrap();

        let report = scheduler(1).run(&graph).unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.status("downstream"), Some(TaskStatus::Skipped));
        assert_eq!(report.status("independent"), Some(TaskStatus::Succeeded));
        assert_eq!(report.status("after"), Some(TaskStatus::Succeeded));
    }

    #[test]
    fn test_concurrency_bound() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut graph = TaskGraph::new();
        for i in 0..5 {
            let current = current.clone();
            let peak = peak.clone();
            graph
                .task(format!("t{i}"))
                .run(move |_| {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(50));
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(Artifact::empty())
                })
                .unwrap();
        }

        let report = scheduler(2).run(&graph).unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancellation_stops_dispatch() {
        let started = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let (done, first_done) = std::sync::mpsc::channel();

        let mut graph = TaskGraph::new();
        graph
            .task("t0")
            .run({
                let started = started.clone();
                let done = Mutex::new(done);
                move |_| {
                    started.fetch_add(1, Ordering::SeqCst);
                    done.lock().unwrap().send(()).ok();
                    Ok(Artifact::empty())
                }
            })
            .unwrap();

        for i in 1..5 {
            let started = started.clone();
            graph
                .task(format!("t{i}"))
                .run(move |_| {
                    started.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(200));
                    Ok(Artifact::empty())
                })
                .unwrap();
        }

        // Cancels from outside the run once the first task has finished.
        let canceller = std::thread::spawn({
            let cancel = cancel.clone();
            move || {
                first_done.recv().ok();
                sleep(Duration::from_millis(20));
                cancel.cancel();
            }
        });

        let report = scheduler(2).run_until(&graph, &cancel).unwrap();
        canceller.join().unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.status("t0"), Some(TaskStatus::Succeeded));
        assert!(started.load(Ordering::SeqCst) <= 1 + 2);

        let skipped: Vec<_> = report.with_status(TaskStatus::Skipped).collect();
        assert!(skipped.len() >= 2);
        assert!(skipped.iter().all(|t| t.skipped == Some(SkipReason::Cancelled)));
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut graph = TaskGraph::new();
        graph.task("a").run(|_| panic!("must not run")).unwrap();

        let report = scheduler(1).run_until(&graph, &cancel).unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.status("a"), Some(TaskStatus::Skipped));
    }

    #[test]
    fn test_timeout_fails_task() {
        let mut graph = TaskGraph::new();
        graph
            .task("slow")
            .timeout(Duration::from_millis(30))
            .run(|ctx| {
                while !ctx.is_cancelled() {
                    sleep(Duration::from_millis(5));
                }
                Ok(Artifact::from_text("too late"))
            })
            .unwrap();
        graph.task("after").depends_on(["slow"]).run(ok("x")).unwrap();

        let report = scheduler(2).run(&graph).unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        let slow = report.task("slow").unwrap();
        assert_eq!(slow.status, TaskStatus::Failed);
        assert!(matches!(slow.error, Some(TaskError::Timeout(_))));
        assert!(slow.artifact.is_none());
        assert_eq!(report.status("after"), Some(TaskStatus::Skipped));
    }

    #[test]
    fn test_run_wide_timeout_applies() {
        let mut graph = TaskGraph::new();
        graph
            .task("sleepy")
            .run(|_| {
                sleep(Duration::from_millis(100));
                Ok(Artifact::empty())
            })
            .unwrap();

        let config = Config::default().workers(1).timeout(Duration::from_millis(20));
        let report = Scheduler::with_cache(config, Arc::new(ArtifactCache::in_memory()))
            .run(&graph)
            .unwrap();

        assert!(matches!(report.task("sleepy").unwrap().error, Some(TaskError::Timeout(_))));
    }

    #[test]
    fn test_panic_is_contained() {
        let mut graph = TaskGraph::new();
        graph.task("explode").run(|_| panic!("kaboom")).unwrap();
        graph.task("fine").run(ok("ok")).unwrap();

        let report = scheduler(2).run(&graph).unwrap();

        assert_eq!(report.status("explode"), Some(TaskStatus::Failed));
        assert_eq!(report.status("fine"), Some(TaskStatus::Succeeded));
        let error = report.task("explode").unwrap().error.as_ref().unwrap().to_string();
        assert!(error.contains("kaboom"), "{error}");
    }

    #[test]
    fn test_fingerprint_computed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ArtifactCache::in_memory());

        let build = || {
            let mut graph = TaskGraph::new();
            let calls = calls.clone();
            graph
                .task("compileJava")
                .inputs(Inputs::new().value("release", "21"))
                .run(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Artifact::from_text("classes"))
                })
                .unwrap();
            graph
        };

        let scheduler = Scheduler::with_cache(Config::default().workers(2), cache.clone());

        let first = scheduler.run(&build()).unwrap();
        let second = scheduler.run(&build()).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!first.task("compileJava").unwrap().cached);
        assert!(second.task("compileJava").unwrap().cached);
        assert_eq!(
            first.task("compileJava").unwrap().fingerprint,
            second.task("compileJava").unwrap().fingerprint
        );
        assert_eq!(second.task("compileJava").unwrap().artifact, Some(Artifact::from_text("classes")));
    }

    #[test]
    fn test_same_inputs_different_tasks_both_run() {
        let calls = Arc::new(AtomicUsize::new(0));

        let mut graph = TaskGraph::new();
        for (name, output) in [("compileJava", "classes"), ("javadoc", "html docs")] {
            let calls = calls.clone();
            graph
                .task(name)
                .inputs(Inputs::new().value("release", "21"))
                .run(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Artifact::from_text(output))
                })
                .unwrap();
        }

        let report = scheduler(1).run(&graph).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let javadoc = report.task("javadoc").unwrap();
        assert!(!javadoc.cached);
        assert_eq!(javadoc.artifact.as_ref().and_then(Artifact::text), Some("html docs"));
        assert_eq!(
            report.task("compileJava").unwrap().artifact.as_ref().and_then(Artifact::text),
            Some("classes")
        );
        assert_ne!(report.task("compileJava").unwrap().fingerprint, javadoc.fingerprint);
    }

    #[test]
    fn test_failed_computation_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(1);

        for _ in 0..2 {
            let mut graph = TaskGraph::new();
            let calls = calls.clone();
            graph
                .task("flaky")
                .inputs(Inputs::new().value("k", "v"))
                .run(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("nope"))
                })
                .unwrap();
            scheduler.run(&graph).unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(scheduler.cache().is_empty());
    }

    #[test]
    fn test_fail_fast_stops_dispatch() {
        let mut graph = TaskGraph::new();
        graph.task("broken").run(|_| Err(anyhow::anyhow!("nope"))).unwrap();
        graph.task("a").run(ok("a")).unwrap();
        graph.task("b").run(ok("b")).unwrap();

        let config = Config::default().workers(1).fail_fast(true);
        let report = Scheduler::with_cache(config, Arc::new(ArtifactCache::in_memory()))
            .run(&graph)
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.task("a").unwrap().skipped, Some(SkipReason::FailFast));
        assert_eq!(report.task("b").unwrap().skipped, Some(SkipReason::FailFast));
    }

    #[test]
    fn test_invalid_graph_runs_nothing() {
        let ran = Arc::new(AtomicBool::new(false));

        let mut graph = TaskGraph::lazy();
        for (name, dep) in [("A", "B"), ("B", "C"), ("C", "A")] {
            let ran = ran.clone();
            graph
                .add_task(
                    name,
                    [dep],
                    action(move |_| {
                        ran.store(true, Ordering::SeqCst);
                        Ok(Artifact::empty())
                    }),
                )
                .unwrap();
        }
        graph.task("free").run(ok("free")).unwrap();

        let err = scheduler(2).run(&graph).unwrap_err();
        assert!(matches!(err, ConfigError::Cycle(_)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = scheduler(0).run(&TaskGraph::new()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(_)));
    }

    #[test]
    fn test_dispatch_order_follows_insertion() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut graph = TaskGraph::new();
        for name in ["c", "a", "b"] {
            let seen = seen.clone();
            graph
                .task(name)
                .run(move |ctx| {
                    seen.lock().unwrap().push(ctx.name().to_string());
                    Ok(Artifact::empty())
                })
                .unwrap();
        }

        scheduler(1).run(&graph).unwrap();
        assert_eq!(*seen.lock().unwrap(), ["c", "a", "b"]);
    }
}
