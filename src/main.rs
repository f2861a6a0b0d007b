use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ralph_parallel_lib::config::merge_overrides;
use ralph_parallel_lib::parallel::summary::{EXIT_FATAL, EXIT_INTERRUPTED};
use ralph_parallel_lib::shutdown::{register_signal_handlers, ShutdownState};
use ralph_parallel_lib::{
    ConfigManager, ConfigOverrides, FileBacklog, Orchestrator, PendingWorkDisposition, RunContext,
};

/// Ralph Parallel - run a dependency-ordered backlog across isolated worktrees
#[derive(Parser, Debug)]
#[command(name = "ralph-parallel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backlog file (JSON or YAML list of work items)
    #[arg(long, env = "RALPH_BACKLOG")]
    backlog: PathBuf,

    /// Project repository (defaults to the current directory)
    #[arg(long, default_value = ".")]
    project: PathBuf,

    /// Config file (defaults to <project>/.ralph-ui/parallel.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the default config file if none exists, then exit
    #[arg(long)]
    init_config: bool,

    /// Branch completed work is merged into
    #[arg(long)]
    integration_branch: Option<String>,

    #[arg(long, env = "RALPH_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Per-item time limit in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Run critical items one at a time before the rest
    #[arg(long)]
    sequential_first: bool,

    #[arg(long)]
    max_merge_retries: Option<u32>,

    /// Continue from the saved run state
    #[arg(long)]
    resume: bool,

    /// What to do with workspaces left by an earlier run:
    /// attempt-merge, clean-and-discard or ignore-and-reuse
    #[arg(long, value_parser = parse_disposition)]
    pending_work: Option<PendingWorkDisposition>,

    /// Only run these item ids (repeatable)
    #[arg(long = "only")]
    only: Vec<String>,

    /// Never run these item ids (repeatable)
    #[arg(long = "skip")]
    skip: Vec<String>,

    /// Print the plan as JSON without touching any branch or workspace
    #[arg(long)]
    simulate: bool,

    /// Executor program (overrides the config file)
    #[arg(long, env = "RALPH_EXECUTOR")]
    executor: Option<String>,
}

fn parse_disposition(value: &str) -> Result<PendingWorkDisposition, String> {
    value.parse()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let project_path = match cli.project.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: project {:?} is not accessible: {}", cli.project, e);
            return EXIT_FATAL;
        }
    };

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(&project_path),
    };

    if cli.init_config {
        return match manager.initialize() {
            Ok(_) => {
                println!("Config written to {:?}", manager.path());
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                EXIT_FATAL
            }
        };
    }

    let file_config = match manager.read() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return EXIT_FATAL;
        }
    };

    let config = merge_overrides(
        &file_config,
        ConfigOverrides {
            integration_branch: cli.integration_branch,
            max_workers: cli.max_workers,
            timeout_per_item_secs: cli.timeout,
            sequential_first: cli.sequential_first,
            max_merge_retries: cli.max_merge_retries,
            resume: cli.resume,
            pending_work: cli.pending_work,
            include: cli.only,
            exclude: cli.skip,
            simulate: cli.simulate,
            executor_program: cli.executor,
        },
    );

    let shutdown = ShutdownState::new();
    let simulate = config.simulate;
    let ctx = RunContext::new(config, &project_path, shutdown.clone());

    let orchestrator = match Orchestrator::new(ctx, &FileBacklog::new(&cli.backlog)) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("Error: {}", e);
            return EXIT_FATAL;
        }
    };

    if simulate {
        return match orchestrator
            .simulate()
            .map_err(|e| e.to_string())
            .and_then(|plan| serde_json::to_string_pretty(&plan).map_err(|e| e.to_string()))
        {
            Ok(json) => {
                println!("{}", json);
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                EXIT_FATAL
            }
        };
    }

    if let Err(e) = register_signal_handlers(shutdown.clone()) {
        log::warn!("Failed to register signal handlers: {}", e);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            return EXIT_FATAL;
        }
    };

    let result = runtime.block_on(orchestrator.run());
    // A forced shutdown may leave a merge job running on the blocking pool
    runtime.shutdown_timeout(Duration::from_secs(5));

    match result {
        Ok(summary) => {
            println!("{}", summary);
            summary.exit_code()
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            if shutdown.is_shutdown_requested() {
                EXIT_INTERRUPTED
            } else {
                EXIT_FATAL
            }
        }
    }
}
