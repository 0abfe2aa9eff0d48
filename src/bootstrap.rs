//! In-sandbox setup, executed by the relaunched controller binary.
//!
//! The launcher starts this binary again inside fresh namespaces with three
//! environment variables set. [`EntryMode::detect`] sees them and the process
//! takes the bootstrap path: privatize mounts, pivot into the sandbox root,
//! mount `/proc`, drop to `nobody`, then exec the payload. There is no way
//! back into controller code from here.

use crate::error::{Error, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{chdir, execve, pivot_root, sethostname, setgid, setuid, Gid, Uid};
use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::fs;
use std::io::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Switches the binary into bootstrap mode when set to `"1"`.
pub const ENV_MARKER: &str = "SANDBOX_INIT";
/// Directory that becomes `/` for the payload.
pub const ENV_ROOTFS: &str = "SANDBOX_ROOTFS";
/// Payload path, resolved inside the new root.
pub const ENV_TARGET: &str = "SANDBOX_TARGET";

/// Exit status of a bootstrap that failed before reaching the payload.
pub const BOOTSTRAP_FAILURE_EXIT: i32 = 125;

pub const NOBODY_UID: u32 = 65534;
pub const NOBODY_GID: u32 = 65534;

const SANDBOX_HOSTNAME: &str = "sandbox";
const OLD_ROOT: &str = "old_root";

/// What this process was started to do.
#[derive(Debug, PartialEq, Eq)]
pub enum EntryMode {
    Controller,
    Bootstrap(BootstrapParams),
}

impl EntryMode {
    /// Inspect the process environment.
    pub fn detect() -> Result<Self> {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Decide the mode from an environment lookup. With the marker set,
    /// both paths must be present and non-empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        if lookup(ENV_MARKER).as_deref() != Some(OsStr::new("1")) {
            return Ok(EntryMode::Controller);
        }
        let required = |key: &str| -> Result<PathBuf> {
            match lookup(key) {
                Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
                _ => Err(Error::Bootstrap(format!("{} missing", key))),
            }
        };
        Ok(EntryMode::Bootstrap(BootstrapParams {
            rootfs: required(ENV_ROOTFS)?,
            target: required(ENV_TARGET)?,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapParams {
    pub rootfs: PathBuf,
    pub target: PathBuf,
}

/// Run the bootstrap and exec the payload. Any failure ends the process
/// with [`BOOTSTRAP_FAILURE_EXIT`]; nothing unwinds past this point.
pub fn enter(params: BootstrapParams) -> ! {
    let err = match run(&params) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    error!(rootfs = %params.rootfs.display(), target = %params.target.display(),
           error = %err, "Sandbox bootstrap failed");
    let _ = std::io::stderr().flush();
    std::process::exit(BOOTSTRAP_FAILURE_EXIT);
}

/// Failure exit for a bootstrap that could not even read its parameters.
pub fn abort(err: &Error) -> ! {
    error!(error = %err, "Sandbox bootstrap aborted before any mount");
    let _ = std::io::stderr().flush();
    std::process::exit(BOOTSTRAP_FAILURE_EXIT);
}

fn run(params: &BootstrapParams) -> Result<Infallible> {
    info!(pid = std::process::id(), uid = Uid::current().as_raw(), gid = Gid::current().as_raw(),
          rootfs = %params.rootfs.display(), "Sandbox bootstrap started");

    isolate_filesystem(&params.rootfs)?;
    drop_privileges(NOBODY_UID, NOBODY_GID)?;
    exec_payload(&params.target)
}

fn isolate_filesystem(rootfs: &Path) -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::Mount(format!("make / private: {}", e)))?;

    if let Err(e) = sethostname(SANDBOX_HOSTNAME) {
        warn!(error = %e, "Failed to set sandbox hostname");
    }

    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::Mount(format!("bind mount {}: {}", rootfs.display(), e)))?;

    let proc_dir = rootfs.join("proc");
    let old_root = rootfs.join(OLD_ROOT);
    for dir in [&proc_dir, &old_root] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Mount(format!("mkdir {}: {}", dir.display(), e)))?;
    }

    // Mounted while the host's /proc is still visible: the kernel refuses a
    // new procfs in a namespace where none is mounted. It moves with the pivot.
    mount(
        Some("proc"),
        proc_dir.as_path(),
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| Error::Mount(format!("mount proc: {}", e)))?;

    pivot_root(rootfs, old_root.as_path()).map_err(|e| Error::Mount(format!("pivot_root: {}", e)))?;
    chdir("/").map_err(|e| Error::Mount(format!("chdir /: {}", e)))?;

    let old_root = Path::new("/").join(OLD_ROOT);
    umount2(old_root.as_path(), MntFlags::MNT_DETACH)
        .map_err(|e| Error::Mount(format!("umount {}: {}", old_root.display(), e)))?;
    if let Err(e) = fs::remove_dir(&old_root) {
        warn!(error = %e, "Failed to remove old root mount point");
    }

    info!("Root pivoted into sandbox");
    Ok(())
}

/// Group first: once the uid changes the process can no longer setgid.
fn drop_privileges(uid: u32, gid: u32) -> Result<()> {
    setgid(Gid::from_raw(gid)).map_err(|e| Error::Privilege(format!("setgid({}): {}", gid, e)))?;
    setuid(Uid::from_raw(uid)).map_err(|e| Error::Privilege(format!("setuid({}): {}", uid, e)))?;
    info!(uid = Uid::current().as_raw(), gid = Gid::current().as_raw(), "Dropped privileges");
    Ok(())
}

fn exec_payload(target: &Path) -> Result<Infallible> {
    let path = CString::new(target.as_os_str().as_bytes())
        .map_err(|e| Error::Exec(format!("target path: {}", e)))?;
    let env = payload_env(std::env::vars_os())?;
    restore_default_signals()?;

    info!(target = %target.display(), "Executing payload");
    let _ = std::io::stderr().flush();
    execve(&path, &[&path], &env).map_err(|e| Error::Exec(format!("{}: {}", target.display(), e)))
}

/// The Rust runtime starts with SIGPIPE ignored, and an ignored signal
/// survives exec. Payloads get the default disposition back.
fn restore_default_signals() -> Result<()> {
    // SAFETY: installs the default disposition, no handler code involved.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }
        .map_err(|e| Error::Exec(format!("restore SIGPIPE: {}", e)))?;
    Ok(())
}

/// The inherited environment minus the bootstrap variables.
fn payload_env<I>(vars: I) -> Result<Vec<CString>>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter(|(key, _)| ![ENV_MARKER, ENV_ROOTFS, ENV_TARGET].iter().any(|k| key == k))
        .map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).map_err(|e| Error::Exec(format!("environment entry: {}", e)))
        })
        .collect()
}
