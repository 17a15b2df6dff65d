//! Module execution: in-process handlers by name, or an external command.

use anyhow::{Context, Result};
use log::debug;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::TaskInput;
use crate::broker::TaskPayload;
use crate::catalog::{ModuleRule, ToolSpec};
use crate::naming::{RenderedOutput, render_command};
use crate::utils::config::WorkerConsts;

use super::manifest::ManifestHandler;

/// What a module sees of the task it runs.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub case_id: String,
    pub case_path: PathBuf,
    pub module: ModuleRule,
    pub input: TaskInput,
    pub output: RenderedOutput,
    pub agent: String,
}

impl TaskContext {
    pub fn from_payload(payload: TaskPayload, agent: &str) -> Self {
        Self {
            case_id: payload.case_id,
            case_path: payload.case_path,
            module: payload.module,
            input: payload.input,
            output: payload.output,
            agent: agent.to_string(),
        }
    }
}

/// An in-process module.
pub trait ModuleHandler: Send + Sync {
    fn run(&self, ctx: &TaskContext) -> Result<()>;
}

/// Internal handlers by module name. Populated explicitly at startup.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    handlers: HashMap<String, Arc<dyn ModuleHandler>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register(ManifestHandler::NAME, ManifestHandler);
        r
    }

    pub fn register<H: ModuleHandler + 'static>(&mut self, name: &str, handler: H) {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModuleHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        v.sort_unstable();
        v
    }
}

/// Result of one external tool run.
#[derive(Clone, Debug, Default)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs the `[tool]` of an external module.
pub trait CommandRunner: Send + Sync {
    fn run(&self, ctx: &TaskContext, tool: &ToolSpec) -> Result<CommandOutcome>;
}

/// Spawns `tool.path` directly with the rendered `cmd` arguments (no shell), with
/// `tool.env` added, and kills it when the timeout runs out.
pub struct ProcessCommandRunner {
    default_timeout: Duration,
    poll: Duration,
}

impl Default for ProcessCommandRunner {
    fn default() -> Self {
        Self {
            default_timeout: WorkerConsts::TASK_TIME_LIMIT,
            poll: Duration::from_millis(100),
        }
    }
}

impl ProcessCommandRunner {
    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            ..Self::default()
        }
    }
}

/// Own process group on unix, so a timeout can take down everything the tool spawned.
fn tool_command(program: &str) -> Command {
    let mut c = Command::new(program);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        c.process_group(0);
    }
    c
}

/// Kill the tool and everything it spawned (its own process group).
#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    if let Ok(pid) = i32::try_from(child.id()) {
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut s = String::new();
        if let Some(mut r) = reader {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            s = String::from_utf8_lossy(&buf).into_owned();
        }
        s
    })
}

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, ctx: &TaskContext, tool: &ToolSpec) -> Result<CommandOutcome> {
        let args = render_command(tool, &ctx.module, &ctx.case_path, &ctx.input, &ctx.output)
            .with_context(|| format!("{}: unbalanced quotes in tool.cmd", ctx.module.name))?;
        std::fs::create_dir_all(&ctx.output.output_dir)
            .with_context(|| format!("create {}", ctx.output.output_dir.display()))?;

        let mut cmd = tool_command(&tool.path);
        cmd.args(&args)
            .current_dir(&ctx.output.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for kv in &tool.env {
            if let Some((k, v)) = kv.split_once('=') {
                cmd.env(k, v);
            }
        }

        debug!("{}: {} {:?}", ctx.module.name, tool.path, args);
        let mut child = cmd.spawn().with_context(|| format!("spawn {}", tool.path))?;
        let out = drain(child.stdout.take());
        let err = drain(child.stderr.take());

        let timeout = tool
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait().context("wait for tool")? {
                break status;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                kill_tree(&mut child);
                break child.wait().context("reap killed tool")?;
            }
            thread::sleep(self.poll);
        };

        Ok(CommandOutcome {
            exit_code: status.code(),
            timed_out,
            stdout: out.join().unwrap_or_default(),
            stderr: err.join().unwrap_or_default(),
        })
    }
}
