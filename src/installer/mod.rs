/// Installer driver: the extract → configure → spawn → handoff state
/// machine.
///
/// The driver verifies the package signature, extracts into a random-named
/// temp directory under the caller's temp root, loads the setup descriptor,
/// and spawns the setup child with the injected handoff arguments. When the
/// descriptor demands that the caller exit, the child is detached and the
/// driver returns immediately; otherwise it waits and captures the child's
/// output. A failed child preserves the temp directory for diagnosis.
pub mod copy;
pub mod descriptor;
pub mod handoff;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Result, SetupError};
use crate::keys::package_sig::{self, PackageSignature};
use crate::keys::pki::TrustStore;
use crate::package::{self, ExtractOptions, ExtractStats};
use descriptor::SetupDescriptor;

/// Everything one install run needs.
pub struct InstallOptions {
    /// Root under which the random temp extraction dir is created.
    pub temp_root: PathBuf,
    /// Application directory handed to the setup child via `--path`.
    pub app_path: PathBuf,
    /// Permit a package without a detached signature.
    pub allow_unsigned: bool,
    /// Spawn-and-wait even when the descriptor demands the caller exit.
    pub skip_exit: bool,
    /// Trust anchors for signature verification.
    pub trust_store: Option<TrustStore>,
    /// Arguments forwarded to the setup child untouched.
    pub pass_through: Vec<String>,
    /// Post-setup command chained after the plugin, via `--cmd`/`--args`.
    pub post_command: Option<String>,
    pub post_command_args: Option<String>,
}

/// What the driver hands back to the caller.
#[derive(Debug)]
pub struct InstallOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// The caller must exit now so the setup child can overwrite its files.
    pub require_exit: bool,
}

/// Run the full install flow for a package file.
pub async fn install(
    package_path: &Path,
    options: &InstallOptions,
    cancel: &CancellationToken,
) -> Result<InstallOutcome> {
    verify_signature(package_path, options)?;

    tokio::fs::create_dir_all(&options.temp_root).await?;
    let temp = tempfile::Builder::new()
        .prefix("setup-")
        .tempdir_in(&options.temp_root)?;
    info!(
        package = %package_path.display(),
        temp = %temp.path().display(),
        "Extracting package"
    );

    let stats = match extract_blocking(package_path, temp.path(), cancel).await {
        Ok(stats) => stats,
        Err(e) => {
            // Best-effort cleanup; never mask the extraction error.
            if let Err(cleanup) = temp.close() {
                error!(error = %cleanup, "Temp dir cleanup failed");
            }
            return Err(e);
        }
    };
    info!(files = stats.files, bytes = stats.bytes, "Package extracted");

    let descriptor = SetupDescriptor::load_from(temp.path())?;
    let detach = descriptor.exit_required && !options.skip_exit;
    let mut command = child_command(&descriptor, temp.path(), options, detach)?;

    if detach {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command.spawn()?;
        // The child owns the extracted tree from here on.
        let kept = temp.into_path();
        info!(
            temp = %kept.display(),
            "Setup child spawned; caller must exit so files can be replaced"
        );
        return Ok(InstallOutcome {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            require_exit: true,
        });
    }

    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    command.kill_on_drop(true);
    let child = command.spawn()?;
    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(SetupError::Cancelled),
        output = child.wait_with_output() => output?,
    };

    let exit_code = output.status.code().unwrap_or(-1);
    if exit_code != 0 {
        let kept = temp.into_path();
        warn!(
            exit_code,
            temp = %kept.display(),
            "Setup child failed; temp dir preserved for diagnosis"
        );
    } else if let Err(e) = temp.close() {
        error!(error = %e, "Temp dir cleanup failed");
    }

    Ok(InstallOutcome {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        require_exit: false,
    })
}

/// Verify the detached signature, honoring the unsigned policy.
fn verify_signature(package_path: &Path, options: &InstallOptions) -> Result<()> {
    let sig_file = package_sig::sig_path(package_path);
    if !sig_file.exists() {
        if options.allow_unsigned {
            warn!(package = %package_path.display(), "Installing unsigned package");
            return Ok(());
        }
        return Err(SetupError::Untrusted(
            "package has no detached signature".to_string(),
        ));
    }

    let store = options.trust_store.as_ref().ok_or_else(|| {
        SetupError::Untrusted("no PKI trust store loaded for verification".to_string())
    })?;
    let signature = PackageSignature::load(&sig_file)?;
    package_sig::verify_package(package_path, &signature, store)
}

/// Assemble the setup child invocation.
fn child_command(
    descriptor: &SetupDescriptor,
    temp: &Path,
    options: &InstallOptions,
    detach: bool,
) -> Result<Command> {
    let program = {
        let command = Path::new(&descriptor.command);
        if command.is_absolute() {
            command.to_path_buf()
        } else {
            temp.join(command)
        }
    };

    let mut cmd = Command::new(&program);
    cmd.current_dir(temp);
    cmd.args(descriptor.argument_list());

    let caller_pid: i32 = if detach { std::process::id() as i32 } else { -1 };
    cmd.arg("--pid").arg(caller_pid.to_string());
    cmd.arg("--path").arg(&options.app_path);
    cmd.args(&options.pass_through);
    if let Some(post) = &options.post_command {
        cmd.arg("--cmd").arg(post);
        if let Some(args) = &options.post_command_args {
            cmd.arg("--args").arg(args);
        }
    }

    if descriptor.require_admin {
        #[cfg(windows)]
        {
            // Elevation goes through the shell "runas" verb; the child's
            // manifest triggers the UAC prompt.
            warn!("RequireAdministratorPrivileges: expecting an elevating child manifest");
        }
        #[cfg(not(windows))]
        warn!("RequireAdministratorPrivileges has no effect on this platform");
    }
    if descriptor.hide_window || !descriptor.exit_required {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            // CREATE_NO_WINDOW
            cmd.creation_flags(0x0800_0000);
        }
    }

    Ok(cmd)
}

async fn extract_blocking(
    package_path: &Path,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<ExtractStats> {
    let package_path = package_path.to_path_buf();
    let target = target.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&package_path)?;
        package::extract(file, &target, &ExtractOptions::default(), &cancel)
    })
    .await
    .map_err(|e| SetupError::Io(std::io::Error::other(e)))?
}

/// Build a package on the blocking pool; returns the uncompressed length.
pub async fn create_package(
    base: &Path,
    out: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let base = base.to_path_buf();
    let out = out.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || package::create(&base, &out, &cancel))
        .await
        .map_err(|e| SetupError::Io(std::io::Error::other(e)))?
}

/// Unpack a package on the blocking pool (the `extract` verb).
pub async fn extract_package(
    package_path: &Path,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<ExtractStats> {
    extract_blocking(package_path, target, cancel).await
}

/// Stream an HTTPS package source to disk.
pub async fn fetch_package(url: &str, dest: &Path, cancel: &CancellationToken) -> Result<()> {
    info!(url, dest = %dest.display(), "Downloading package");
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| SetupError::Io(std::io::Error::other(e)))?;

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(SetupError::Cancelled);
        }
        let chunk = chunk.map_err(|e| SetupError::Io(std::io::Error::other(e)))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    /// A package whose setup child is a shell script.
    fn script_package(script: &str, exit_required: bool) -> (TempDir, PathBuf) {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("setup.sh"), script).unwrap();
        fs::write(
            source.path().join("payload.txt"),
            b"the files being installed",
        )
        .unwrap();
        fs::write(
            source.path().join(descriptor::DESCRIPTOR_FILE),
            format!(
                r#"{{"Command": "/bin/sh", "Arguments": "setup.sh", "ExitRequired": {exit_required}}}"#
            ),
        )
        .unwrap();

        let out = TempDir::new().unwrap();
        let pkg = out.path().join("app.pkg");
        crate::package::create(source.path(), &pkg, &token()).unwrap();
        (out, pkg)
    }

    fn options(temp_root: &Path, app: &Path) -> InstallOptions {
        InstallOptions {
            temp_root: temp_root.to_path_buf(),
            app_path: app.to_path_buf(),
            allow_unsigned: true,
            skip_exit: false,
            trust_store: None,
            pass_through: Vec::new(),
            post_command: None,
            post_command_args: None,
        }
    }

    #[tokio::test]
    async fn test_install_waits_and_propagates_exit_code() {
        let (_out, pkg) = script_package("exit 0\n", false);
        let temp_root = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();

        let outcome = install(&pkg, &options(temp_root.path(), app.path()), &token())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.require_exit);
        // Successful setup leaves no temp dirs behind.
        assert_eq!(fs::read_dir(temp_root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_setup_preserves_temp_dir() {
        let (_out, pkg) = script_package("echo broken >&2; exit 7\n", false);
        let temp_root = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();

        let outcome = install(&pkg, &options(temp_root.path(), app.path()), &token())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 7);
        assert!(outcome.stderr.contains("broken"));
        assert_eq!(fs::read_dir(temp_root.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_child_receives_injected_args() {
        let (_out, pkg) = script_package("echo \"$@\"\n", false);
        let temp_root = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();

        let outcome = install(&pkg, &options(temp_root.path(), app.path()), &token())
            .await
            .unwrap();
        assert!(outcome.stdout.contains("--pid -1"));
        assert!(outcome.stdout.contains("--path"));
    }

    #[tokio::test]
    async fn test_exit_required_detaches() {
        let (_out, pkg) = script_package("sleep 0.1\n", true);
        let temp_root = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();

        let outcome = install(&pkg, &options(temp_root.path(), app.path()), &token())
            .await
            .unwrap();
        assert!(outcome.require_exit);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.is_empty());
        // The detached child keeps the extracted tree.
        assert_eq!(fs::read_dir(temp_root.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_skip_exit_overrides_detach() {
        let (_out, pkg) = script_package("exit 0\n", true);
        let temp_root = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();

        let mut opts = options(temp_root.path(), app.path());
        opts.skip_exit = true;
        let outcome = install(&pkg, &opts, &token()).await.unwrap();
        assert!(!outcome.require_exit);
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn test_unsigned_package_rejected_without_flag() {
        let (_out, pkg) = script_package("exit 0\n", false);
        let temp_root = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();

        let mut opts = options(temp_root.path(), app.path());
        opts.allow_unsigned = false;
        let result = install(&pkg, &opts, &token()).await;
        assert!(matches!(result, Err(SetupError::Untrusted(_))));
    }

    #[tokio::test]
    async fn test_missing_descriptor_fails() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("file"), b"no descriptor here").unwrap();
        let out = TempDir::new().unwrap();
        let pkg = out.path().join("bare.pkg");
        crate::package::create(source.path(), &pkg, &token()).unwrap();

        let temp_root = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();
        let result = install(&pkg, &options(temp_root.path(), app.path()), &token()).await;
        assert!(matches!(result, Err(SetupError::Io(_))));
    }
}
