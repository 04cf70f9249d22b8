//! tsumiki - runs JSON build plans.

use std::process::ExitCode;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use console::style;

use tsumiki::{ConfigError, JsonManifest, Plan, Scheduler};

/// Build orchestration for JSON task plans
#[derive(Parser)]
#[command(name = "tsumiki")]
#[command(about = "Runs task graphs in parallel with fingerprinted caching", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task in a plan
    Run {
        /// Path to the plan file
        plan: Utf8PathBuf,

        /// Maximum number of tasks running at once
        #[arg(short, long)]
        workers: Option<usize>,

        /// Stop dispatching after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Directory persisting the artifact cache
        #[arg(long)]
        cache_dir: Option<Utf8PathBuf>,

        /// Timeout applied to tasks without their own, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Write a JSON manifest of the build outputs
        #[arg(short, long)]
        manifest: Option<Utf8PathBuf>,
    },

    /// Print the order tasks would run in
    Order {
        /// Path to the plan file
        plan: Utf8PathBuf,
    },

    /// Print the task graph as a Mermaid diagram
    Graph {
        /// Path to the plan file
        plan: Utf8PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = tsumiki::init_logging() {
        eprintln!("{} couldn't set up logging: {e}", style("warning:").yellow().bold());
    }

    match cli.command {
        Commands::Run {
            plan,
            workers,
            fail_fast,
            cache_dir,
            timeout_ms,
            manifest,
        } => {
            let overrides = Overrides {
                workers,
                fail_fast,
                cache_dir,
                timeout_ms,
            };
            run(&plan, overrides, manifest.as_deref())
        }
        Commands::Order { plan } => {
            with_graph(&plan, |graph| {
                for name in graph.topological_order()? {
                    println!("{name}");
                }
                Ok(())
            })
        }
        Commands::Graph { plan } => {
            with_graph(&plan, |graph| {
                print!("{graph}");
                Ok(())
            })
        }
    }
}

struct Overrides {
    workers: Option<usize>,
    fail_fast: bool,
    cache_dir: Option<Utf8PathBuf>,
    timeout_ms: Option<u64>,
}

fn run(path: &Utf8Path, overrides: Overrides, manifest: Option<&Utf8Path>) -> ExitCode {
    let plan = match Plan::load(path) {
        Ok(plan) => plan,
        Err(e) => return config_error(e),
    };

    let mut config = plan.config();
    if let Some(workers) = overrides.workers {
        config = config.workers(workers);
    }
    if overrides.fail_fast {
        config = config.fail_fast(true);
    }
    if let Some(dir) = overrides.cache_dir {
        config = config.cache_dir(dir);
    }
    if let Some(timeout) = overrides.timeout_ms {
        config = config.timeout(Duration::from_millis(timeout));
    }

    let graph = match plan.graph() {
        Ok(graph) => graph,
        Err(e) => return config_error(e),
    };

    let scheduler = match Scheduler::new(config) {
        Ok(scheduler) => scheduler.root(root_of(path)),
        Err(e) => return config_error(e),
    };

    let report = match scheduler.run(&graph) {
        Ok(report) => report,
        Err(e) => return config_error(e),
    };

    println!("{report}");

    if let Some(out) = manifest {
        let descriptor = plan.package.clone().unwrap_or_default();
        if let Err(e) = report.emit(&mut JsonManifest::new(out.to_path_buf()), &descriptor) {
            eprintln!("{} couldn't write manifest: {e:#}", style("error:").red().bold());
            return ExitCode::FAILURE;
        }
    }

    exit(report.exit_code())
}

fn with_graph<F>(path: &Utf8Path, f: F) -> ExitCode
where
    F: FnOnce(&tsumiki::TaskGraph) -> Result<(), ConfigError>,
{
    let graph = match Plan::load(path).map_err(anyhow::Error::from).and_then(|plan| Ok(plan.graph()?)) {
        Ok(graph) => graph,
        Err(e) => return config_error(e),
    };

    match f(&graph) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => config_error(e),
    }
}

/// Relative input globs are resolved against the directory holding the plan.
fn root_of(plan: &Utf8Path) -> Utf8PathBuf {
    match plan.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    }
}

fn config_error(e: impl std::fmt::Display) -> ExitCode {
    eprintln!("{} {e:#}", style("error:").red().bold());
    exit(ConfigError::EXIT_CODE)
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
