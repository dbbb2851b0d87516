/// Re-entry half of the installer handoff.
///
/// After the driver spawns the setup child and (optionally) the caller
/// exits, the child re-enters through `run_setup`: wait for the caller's
/// PID to die, load the descriptor from the working directory, run the
/// statically registered setup plugin, then chain the post-setup command
/// when one was injected. A process-wide guard makes concurrent re-entry
/// fail instead of racing.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, SetupError};

use super::descriptor::SetupDescriptor;

static SETUP_ACTIVE: AtomicBool = AtomicBool::new(false);

/// RAII claim on the process-wide setup slot.
struct SetupGuard;

impl SetupGuard {
    fn acquire() -> Result<Self> {
        if SETUP_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SetupError::AlreadyRunning);
        }
        Ok(Self)
    }
}

impl Drop for SetupGuard {
    fn drop(&mut self) {
        SETUP_ACTIVE.store(false, Ordering::Release);
    }
}

/// Scoped state for one setup run, parsed from the injected arguments.
#[derive(Debug, Clone)]
pub struct SetupContext {
    /// PID of the exiting caller, -1 when the caller stays alive.
    pub caller_pid: i32,
    /// Application install directory the payload goes into.
    pub app_path: PathBuf,
    /// Post-setup command to chain after the plugin, when injected.
    pub command: Option<String>,
    pub command_args: Option<String>,
    /// Arguments the caller passed through untouched.
    pub pass_through: Vec<String>,
}

impl SetupContext {
    /// Parse `--pid`, `--path`, `--cmd`, `--args`; everything else passes
    /// through.
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut caller_pid: i32 = -1;
        let mut app_path: Option<PathBuf> = None;
        let mut command = None;
        let mut command_args = None;
        let mut pass_through = Vec::new();

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let mut value = |name: &str| {
                iter.next()
                    .cloned()
                    .ok_or_else(|| SetupError::Usage(format!("{name} requires a value")))
            };
            match arg.as_str() {
                "--pid" => {
                    let raw = value("--pid")?;
                    caller_pid = raw
                        .parse()
                        .map_err(|_| SetupError::Usage(format!("invalid --pid value: {raw}")))?;
                }
                "--path" => app_path = Some(PathBuf::from(value("--path")?)),
                "--cmd" => command = Some(value("--cmd")?),
                "--args" => command_args = Some(value("--args")?),
                _ => pass_through.push(arg.clone()),
            }
        }

        Ok(Self {
            caller_pid,
            app_path: app_path
                .ok_or_else(|| SetupError::Usage("--path is required".to_string()))?,
            command,
            command_args,
            pass_through,
        })
    }
}

/// The contract a setup binary registers with the handoff.
///
/// One implementor per binary, passed in explicitly; the driver does not
/// scan for candidates.
#[async_trait]
pub trait Setup: Send + Sync {
    /// Run the setup work; the returned code becomes the process exit code.
    async fn run(&self, ctx: &SetupContext, cancel: &CancellationToken) -> Result<i32>;
}

/// Re-entry point for setup binaries, working-directory based.
pub async fn run_setup(
    args: &[String],
    plugin: &dyn Setup,
    cancel: &CancellationToken,
) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    run_setup_in(&cwd, args, plugin, cancel).await
}

/// Re-entry with an explicit package directory.
pub async fn run_setup_in(
    package_dir: &Path,
    args: &[String],
    plugin: &dyn Setup,
    cancel: &CancellationToken,
) -> Result<i32> {
    let _guard = SetupGuard::acquire()?;
    let ctx = SetupContext::parse(args)?;

    if ctx.caller_pid >= 0 {
        wait_for_exit(ctx.caller_pid, cancel).await?;
    }

    let descriptor = SetupDescriptor::load_from(package_dir)?;
    info!(
        command = %descriptor.command,
        app_path = %ctx.app_path.display(),
        "Running setup plugin"
    );

    let exit_code = plugin.run(&ctx, cancel).await?;
    info!(exit_code, "Setup plugin finished");

    if descriptor.exit_required {
        if let Some(command) = &ctx.command {
            spawn_post_command(command, ctx.command_args.as_deref())?;
        }
    }
    Ok(exit_code)
}

/// Poll until the process with `pid` is gone.
pub async fn wait_for_exit(pid: i32, cancel: &CancellationToken) -> Result<()> {
    info!(pid, "Waiting for caller process to exit");
    while pid_alive(pid) {
        if cancel.is_cancelled() {
            return Err(SetupError::Cancelled);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    info!(pid, "Caller process has exited");
    Ok(())
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    // Signal 0: existence probe only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    false
}

/// Spawn the post-setup command detached; the setup process returns
/// without waiting for it.
fn spawn_post_command(command: &str, args: Option<&str>) -> Result<()> {
    let mut cmd = Command::new(command);
    cmd.args(args.unwrap_or("").split_whitespace())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match cmd.spawn() {
        Ok(_) => {
            info!(command, "Post-setup command spawned");
            Ok(())
        }
        Err(e) => {
            warn!(command, error = %e, "Post-setup command failed to spawn");
            Err(SetupError::Io(e))
        }
    }
}
