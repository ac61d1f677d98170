//! Launch trigger for verified installers.

use crate::error::{Result, UpdaterError};
use crate::trust::Fingerprint;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Arguments passed to the installer: run silently and force the install.
pub const INSTALLER_ARGS: [&str; 2] = ["/S", "--force-run"];

/// A staged installer that passed signature verification.
///
/// Only [`crate::VerificationVerdict::authorize`] can create one, so holding a
/// `VerifiedInstaller` proves the bytes at `path` were signed by an allowed key.
#[derive(Debug)]
pub struct VerifiedInstaller {
    path: PathBuf,
    signer: Fingerprint,
}

impl VerifiedInstaller {
    pub(crate) fn new(path: PathBuf, signer: Fingerprint) -> Self {
        Self { path, signer }
    }

    /// Staged installer that was verified.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key id of the allowed key that signed it.
    pub fn signer(&self) -> Fingerprint {
        self.signer
    }
}

/// Hands a verified installer over to the operating system.
pub trait Launcher: Send + Sync {
    /// Start the installer and return without waiting for it.
    fn launch(&self, installer: &VerifiedInstaller) -> Result<()>;
}

/// Spawns the installer as a detached child process.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, installer: &VerifiedInstaller) -> Result<()> {
        let path = installer.path();
        mark_executable(path).map_err(UpdaterError::Launch)?;

        let mut command = Command::new(path);
        command
            .args(INSTALLER_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        // Dropping `Child` leaves the process running.
        let child = command.spawn().map_err(UpdaterError::Launch)?;
        tracing::info!(
            pid = child.id(),
            installer = %path.display(),
            signer = %installer.signer(),
            "installer launched"
        );
        Ok(())
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
