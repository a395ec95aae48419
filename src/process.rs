//! Command execution boundary.
//!
//! Every mutating operation in the crate goes through an [`Executor`]. The
//! real executor spawns commands and applies filesystem changes. The
//! simulated executor reports what it would do and leaves the host untouched.
//! Commands marked [`Cmd::read_only`] run under both, so a dry run makes the
//! same decisions a real run would.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::process::Command;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::{Error, MissingTool, ResourceKind, Result};

/// A command line plus how its failure should be classified.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    kind: ResourceKind,
    read_only: bool,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: Vec::new(),
            kind: ResourceKind::Command,
            read_only: false,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Classify failures of this command as `kind` resource errors.
    pub fn kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Mark the command as a query that is safe to run in dry-run mode.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Return the output of a non-zero exit instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Turn a non-zero exit into a resource error unless failure is allowed.
    pub(crate) fn check(&self, output: CmdOutput) -> Result<CmdOutput> {
        if output.success() || self.allow_fail {
            return Ok(output);
        }
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim()
        } else {
            output.stderr.trim()
        };
        Err(Error::resource(
            self.kind,
            format!("`{}` failed (status {}): {}", self, output.code(), detail),
        ))
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    /// Output reported for a command that was not actually run.
    pub fn simulated() -> Self {
        Self {
            status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Exit status, with death-by-signal reported as -1.
    pub fn code(&self) -> i32 {
        self.status.unwrap_or(-1)
    }
}

/// Structural switch between doing and describing.
pub trait Executor: Send + Sync {
    /// Run a command. Non-read-only commands are only reported when simulated.
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput>;

    /// Apply a host mutation described by `description`.
    fn apply(&self, description: &str, action: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    fn is_simulated(&self) -> bool;
}

pub type SharedExecutor = Arc<dyn Executor>;

/// Pick the executor for the requested mode.
pub fn executor_for(dry_run: bool) -> SharedExecutor {
    if dry_run {
        Arc::new(SimulatedExecutor::new())
    } else {
        Arc::new(RealExecutor)
    }
}

/// Executes commands and mutations on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealExecutor;

impl Executor for RealExecutor {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        debug!("running: {}", cmd);
        let output = cmd
            .to_command()
            .output()
            .map_err(|err| spawn_error(cmd, err))?;

        let result = CmdOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        cmd.check(result)
    }

    fn apply(&self, description: &str, action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        debug!("{}", description);
        action()
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

fn spawn_error(cmd: &Cmd, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => Error::Dependency {
            missing: vec![MissingTool {
                tool: cmd.program.to_string_lossy().into_owned(),
                package: None,
            }],
        },
        io::ErrorKind::PermissionDenied => Error::Permission(format!("executing `{}`", cmd)),
        _ => Error::io(format!("spawning `{}`", cmd), err),
    }
}

/// Reports intended actions instead of performing them.
///
/// Read-only commands are delegated to [`RealExecutor`].
#[derive(Debug, Default)]
pub struct SimulatedExecutor {
    intents: Mutex<Vec<String>>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything this executor was asked to do, in order.
    pub fn intents(&self) -> Vec<String> {
        self.intents
            .lock()
            .map(|intents| intents.clone())
            .unwrap_or_default()
    }

    fn record(&self, intent: String) {
        info!("[dry-run] would {}", intent);
        if let Ok(mut intents) = self.intents.lock() {
            intents.push(intent);
        }
    }
}

impl Executor for SimulatedExecutor {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        if cmd.read_only {
            return RealExecutor.run(cmd);
        }
        self.record(format!("run: {}", cmd));
        Ok(CmdOutput::simulated())
    }

    fn apply(&self, description: &str, _action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.record(description.to_string());
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}
