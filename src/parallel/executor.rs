//! Launching the external task executor
//!
//! The executor is a black box: it runs in the item's workspace, writes
//! free-form output, and exits. Output goes to a per-item log file that the
//! verification chain reads afterwards.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ExecutorConfig;
use crate::models::WorkItem;
use crate::parallel::workspace::Workspace;

pub trait TaskExecutor: Send + Sync {
    /// Start work on `item` inside `workspace`, with stdout and stderr
    /// appended to `log_path`
    fn spawn(&self, item: &WorkItem, workspace: &Workspace, log_path: &Path) -> Result<Child>;
}

/// Runs a configured program once per item
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Resolve the program through PATH unless it is already a path
    fn resolve_program(&self) -> Result<PathBuf> {
        let program = Path::new(&self.config.program);
        if program.components().count() > 1 {
            return Ok(program.to_path_buf());
        }
        which::which(&self.config.program)
            .map_err(|e| anyhow!("Executor '{}' not found in PATH: {}", self.config.program, e))
    }

    /// Expand `{prompt}`, `{id}` and `{workspace}` in the configured args.
    /// The prompt is appended as a final argument when no arg mentions it.
    pub fn build_args(&self, item: &WorkItem, workspace: &Workspace) -> Vec<String> {
        let prompt = build_prompt(item, &self.config.completion_marker);
        let workspace_path = workspace.path.to_string_lossy();

        let mut has_prompt = false;
        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| {
                if arg.contains("{prompt}") {
                    has_prompt = true;
                }
                arg.replace("{prompt}", &prompt)
                    .replace("{id}", &item.id)
                    .replace("{workspace}", &workspace_path)
            })
            .collect();

        if !has_prompt {
            args.push(prompt);
        }
        args
    }
}

impl TaskExecutor for CommandExecutor {
    fn spawn(&self, item: &WorkItem, workspace: &Workspace, log_path: &Path) -> Result<Child> {
        let program = self.resolve_program()?;

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {:?}", parent))?;
        }
        let stdout = File::create(log_path)
            .with_context(|| format!("Failed to create log file {:?}", log_path))?;
        let stderr = stdout.try_clone().context("Failed to clone log file handle")?;

        let mut cmd = Command::new(&program);
        cmd.args(self.build_args(item, workspace))
            .current_dir(&workspace.path)
            .envs(&self.config.env)
            .env("RALPH_ITEM_ID", &item.id)
            .env("RALPH_WORKSPACE", &workspace.path)
            .env("RALPH_BRANCH", &workspace.branch)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        // Own process group, so termination reaches everything the executor starts
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        log::debug!("[Executor] Spawning {:?} for {} in {:?}", program, item.id, workspace.path);

        cmd.spawn()
            .map_err(|e| anyhow!("Failed to spawn executor for {}: {}", item.id, e))
    }
}

/// Prompt handed to the executor for one item
pub fn build_prompt(item: &WorkItem, completion_marker: &str) -> String {
    let mut prompt = String::new();

    if item.title.is_empty() {
        prompt.push_str(&format!("# {}\n\n", item.id));
    } else {
        prompt.push_str(&format!("# {}: {}\n\n", item.id, item.title));
    }

    if let Some(description) = item.description.as_deref().filter(|d| !d.trim().is_empty()) {
        prompt.push_str(description.trim());
        prompt.push_str("\n\n");
    }

    if !item.file_hints.is_empty() {
        prompt.push_str("Files you are expected to change:\n");
        for file in &item.file_hints {
            prompt.push_str(&format!("- {}\n", file));
        }
        prompt.push('\n');
    }

    prompt.push_str("Work only on this item. Commit or leave your changes in the current directory.\n");
    prompt.push_str(&format!(
        "When the item is fully done, print {} on its own line.\n",
        completion_marker
    ));
    prompt
}

/// Ask an executor and its process group to stop, then kill whatever is
/// left after `grace`. With a zero grace everything is killed immediately.
pub fn terminate(child: &mut Child, grace: Duration) {
    let mut exited = matches!(child.try_wait(), Ok(Some(_)));

    if !exited && !grace.is_zero() {
        signal_group(child, Signal::Terminate);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => {
                    exited = true;
                    break;
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
    }

    // Descendants may outlive the executor itself
    signal_group(child, Signal::Kill);
    if !exited {
        if let Err(e) = child.kill() {
            log::debug!("[Executor] Kill of pid {} failed: {}", child.id(), e);
        }
    }
    let _ = child.wait();
}

#[derive(Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let pgid = child.id() as libc::pid_t;
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: the child leads its own group (spawned with process_group(0))
    let result = unsafe { libc::killpg(pgid, signo) };
    if result != 0 {
        log::debug!("[Executor] Signal {} to process group {} failed", signo, pgid);
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: Signal) {}
