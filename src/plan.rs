//! Declarative build plans.
//!
//! A plan is a JSON file listing shell-command tasks, along with an optional
//! run config and package descriptor:
//!
//! ```json
//! {
//!   "config": { "worker_count": 4, "cache_dir": ".cache/tsumiki" },
//!   "package": { "name": "ExamplePlugin", "version": "1.2.0" },
//!   "tasks": [
//!     { "name": "compile", "command": "javac -d build src/*.java",
//!       "inputs": { "files": ["src/**/*.java"] } },
//!     { "name": "jar", "deps": ["compile"], "command": "jar cf - -C build .",
//!       "timeout_ms": 60000 }
//!   ]
//! }
//! ```
//!
//! Commands run through `sh -c` in the plan's root directory. The outputs of
//! the task's dependencies are written to the command's stdin, in declaration
//! order, and whatever the command prints to stdout becomes its artifact.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::Artifact;
use crate::error::{ConfigError, PlanError};
use crate::fingerprint::Inputs;
use crate::graph::TaskGraph;
use crate::manifest::PackageDescriptor;
use crate::task::{Action, TaskContext};

const SHELL: &str = "sh";
const POLL: Duration = Duration::from_millis(10);

/// Input value under which the command line itself enters the fingerprint.
const COMMAND_KEY: &str = "$command";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub config: Option<Config>,
    #[serde(default)]
    pub package: Option<PackageDescriptor>,
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub name: String,
    #[serde(default, alias = "dependsOn")]
    pub deps: Vec<String>,
    pub command: String,
    /// Declaring inputs makes the task cacheable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Inputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Plan {
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, PlanError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Parses a plan and checks that every input pattern compiles.
    pub fn from_json(text: &str) -> Result<Self, PlanError> {
        let plan: Plan = serde_json::from_str(text)?;

        for task in &plan.tasks {
            if let Some(inputs) = &task.inputs {
                for pattern in inputs.patterns() {
                    glob::Pattern::new(pattern)?;
                }
            }
        }

        Ok(plan)
    }

    pub fn config(&self) -> Config {
        self.config.clone().unwrap_or_default()
    }

    /// Builds and validates the task graph. Tasks may be listed in any order.
    pub fn graph(&self) -> Result<TaskGraph, ConfigError> {
        let mut graph = TaskGraph::lazy();

        for task in &self.tasks {
            let mut def = graph.task(&task.name).depends_on(&task.deps);

            if let Some(inputs) = &task.inputs {
                def = def.inputs(inputs.clone().value(COMMAND_KEY, &task.command));
            }

            if let Some(timeout) = task.timeout_ms {
                def = def.timeout(Duration::from_millis(timeout));
            }

            def.action(CommandAction::new(&task.command))?;
        }

        graph.validate()?;
        Ok(graph)
    }
}

/// Runs a shell command as a task action.
#[derive(Debug, Clone)]
pub struct CommandAction {
    command: String,
}

impl CommandAction {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Action for CommandAction {
    fn run(&self, ctx: &TaskContext) -> anyhow::Result<Artifact> {
        let mut command = Command::new(SHELL);
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(ctx.root())
            .env("TSUMIKI_TASK", ctx.name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(fingerprint) = ctx.fingerprint() {
            command.env("TSUMIKI_FINGERPRINT", fingerprint.to_hex());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.command))?;

        let input: Vec<u8> = ctx
            .dependencies()
            .flat_map(|(_, artifact)| artifact.bytes().iter().copied())
            .collect();

        let stdin = child.stdin.take();
        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // Commands are free to ignore their stdin.
                stdin.write_all(&input).ok();
            }
        });

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }

            if ctx.is_cancelled() {
                child.kill().ok();
                child.wait().ok();
                bail!("`{}` was interrupted", self.command);
            }

            thread::sleep(POLL);
        };

        writer
            .join()
            .map_err(|_| anyhow!("stdin writer panicked"))?;
        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?;

        if !status.success() {
            bail!(
                "`{}` exited with {}\n{}",
                self.command,
                status,
                String::from_utf8_lossy(&stderr).trim()
            );
        }

        Ok(Artifact::from_bytes(stdout).with_attribute("command", &self.command))
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buffer)?;
        }
        Ok(buffer)
    })
}

fn collect(handle: JoinHandle<std::io::Result<Vec<u8>>>) -> anyhow::Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| anyhow!("pipe reader panicked"))?
        .context("failed to read command output")
}
