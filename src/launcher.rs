//! Starts a sandboxed child by relaunching the controller binary in new
//! namespaces.
//!
//! The child is cloned with the namespace flags of an [`Isolation`] and then
//! parks on a sync pipe. While it waits, the parent writes its identity maps
//! and moves it into its cgroup. Releasing the pipe lets the child install its
//! stdio, exec the controller binary in bootstrap mode, and from there pivot
//! and exec into the payload. cgroup membership survives both execs.

use crate::bootstrap::{BOOTSTRAP_FAILURE_EXIT, ENV_MARKER, ENV_ROOTFS, ENV_TARGET, NOBODY_GID, NOBODY_UID};
use crate::cgroup::{CgroupHandle, CgroupManager};
use crate::error::{Error, Result};
use crate::pipes::{StreamEnds, REPORT_FD};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{getgid, getuid, pipe2, write, Pid};
use serde::Serialize;
use std::ffi::{CString, OsString};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::os::raw::c_char;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::ptr;
use tracing::{info, warn};

const STACK_SIZE: usize = 1024 * 1024;

/// A set of kernel isolation primitives a sandbox is started under.
pub trait Isolation {
    /// Namespaces the child is cloned into.
    fn clone_flags(&self) -> CloneFlags;

    /// Called while the child is parked, before it runs any code of its own.
    fn map_identities(&self, child: Pid) -> Result<()>;
}

/// Mount, PID, UTS, IPC and user namespaces. The caller's uid/gid appear as
/// root inside; `nobody` is mapped straight through so the bootstrap can
/// drop to it.
#[derive(Debug, Clone, Copy)]
pub struct UserNamespaceIsolation {
    outer_uid: u32,
    outer_gid: u32,
}

impl UserNamespaceIsolation {
    pub fn for_current_user() -> Self {
        Self {
            outer_uid: getuid().as_raw(),
            outer_gid: getgid().as_raw(),
        }
    }

    fn uid_map(&self) -> String {
        id_map(self.outer_uid, NOBODY_UID)
    }

    fn gid_map(&self) -> String {
        id_map(self.outer_gid, NOBODY_GID)
    }
}

impl Isolation for UserNamespaceIsolation {
    fn clone_flags(&self) -> CloneFlags {
        CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUSER
    }

    fn map_identities(&self, child: Pid) -> Result<()> {
        let proc_dir = Path::new("/proc").join(child.as_raw().to_string());

        // setgroups must be denied before gid_map is written.
        match fs::write(proc_dir.join("setgroups"), "deny") {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Namespace(format!("deny setgroups: {}", e))),
        }
        fs::write(proc_dir.join("uid_map"), self.uid_map())
            .map_err(|e| Error::Namespace(format!("write uid_map: {}", e)))?;
        fs::write(proc_dir.join("gid_map"), self.gid_map())
            .map_err(|e| Error::Namespace(format!("write gid_map: {}", e)))?;
        Ok(())
    }
}

fn id_map(outer: u32, nobody: u32) -> String {
    if outer == nobody {
        format!("0 {} 1\n", outer)
    } else {
        format!("0 {} 1\n{} {} 1\n", outer, nobody, nobody)
    }
}

/// How a sandboxed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitState {
    Exited(i32),
    Signaled(i32),
}

impl ExitState {
    /// Killed with SIGKILL, which is what a timeout does.
    pub fn was_force_killed(&self) -> bool {
        *self == ExitState::Signaled(Signal::SIGKILL as i32)
    }

    pub fn is_bootstrap_failure(&self) -> bool {
        *self == ExitState::Exited(BOOTSTRAP_FAILURE_EXIT)
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Exited(code) => write!(f, "exit {}", code),
            ExitState::Signaled(sig) => match Signal::try_from(*sig) {
                Ok(signal) => write!(f, "killed by {}", signal.as_str()),
                Err(_) => write!(f, "killed by signal {}", sig),
            },
        }
    }
}

/// A running sandbox. Cheap to clone: it only carries the pid.
#[derive(Debug, Clone)]
pub struct SandboxProcess {
    name: String,
    pid: Pid,
    confined: bool,
}

impl SandboxProcess {
    pub(crate) fn new(name: &str, pid: Pid, confined: bool) -> Self {
        Self {
            name: name.to_string(),
            pid,
            confined,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// `false` when the cgroup attach failed and the process runs unconfined.
    pub fn confined(&self) -> bool {
        self.confined
    }

    /// Send SIGKILL. A process that is already gone is not an error.
    pub fn kill(&self) -> Result<()> {
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::System(e)),
        }
    }

    /// Block until the process exits and reap it.
    pub fn wait(&self) -> Result<ExitState> {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ExitState::Exited(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ExitState::Signaled(sig as i32)),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::System(e)),
            }
        }
    }

    /// Kill and reap a child whose setup could not be completed.
    fn abandon(&self) {
        if let Err(e) = self.kill() {
            warn!(sandbox = %self.name, error = %e, "Failed to kill abandoned sandbox");
        }
        if let Err(e) = self.wait() {
            warn!(sandbox = %self.name, error = %e, "Failed to reap abandoned sandbox");
        }
    }
}

/// What to launch and with which streams.
#[derive(Debug)]
pub struct LaunchSpec<'a> {
    pub name: &'a str,
    /// Binary that performs the bootstrap; normally the controller itself.
    pub controller_exe: &'a Path,
    pub rootfs: &'a Path,
    pub target: &'a Path,
    pub stdio: StreamEnds,
}

/// Raw descriptors the child installs as 0, 1 and 3.. before exec.
struct ChildFds {
    sync: RawFd,
    stdin: RawFd,
    stdout: RawFd,
    extra: Vec<RawFd>,
}

/// Start `spec` in a new sandbox attached to `cgroup`.
///
/// The parent's copies of the child's stream ends are closed on return.
pub fn spawn(spec: LaunchSpec<'_>, isolation: &dyn Isolation, cgroup: &CgroupHandle) -> Result<SandboxProcess> {
    let exe = CString::new(spec.controller_exe.as_os_str().as_bytes())
        .map_err(|e| Error::Spawn(format!("controller path: {}", e)))?;
    let env = bootstrap_env(std::env::vars_os(), spec.rootfs, spec.target)?;

    // Everything the child touches is prepared here: between clone and exec
    // it must not allocate.
    let argv: [*const c_char; 2] = [exe.as_ptr(), ptr::null()];
    let envp: Vec<*const c_char> = env
        .iter()
        .map(|entry| entry.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect();

    let (sync_r, sync_w) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::Pipe(format!("sync: {}", e)))?;
    let fds = ChildFds {
        sync: sync_r.as_raw_fd(),
        stdin: spec.stdio.stdin.as_raw_fd(),
        stdout: spec.stdio.stdout.as_raw_fd(),
        extra: spec.stdio.extra.iter().map(|fd| fd.as_raw_fd()).collect(),
    };

    let mut stack = vec![0u8; STACK_SIZE];
    let child_fn = Box::new(|| {
        // SAFETY: runs in the freshly cloned child; only async-signal-safe
        // libc calls on descriptors and pointers prepared above.
        unsafe { child_main(&fds, argv.as_ptr(), envp.as_ptr()) }
    });

    info!(sandbox = spec.name, controller = %spec.controller_exe.display(),
          rootfs = %spec.rootfs.display(), target = %spec.target.display(), "Starting sandbox");
    // SAFETY: the child only runs `child_main`, which execs or _exits.
    let pid = unsafe {
        clone(
            child_fn,
            &mut stack,
            isolation.clone_flags(),
            Some(Signal::SIGCHLD as i32),
        )
    }
    .map_err(|e| Error::Spawn(format!("clone {}: {}", spec.name, e)))?;
    drop(sync_r);
    info!(sandbox = spec.name, pid = pid.as_raw(), "Sandbox process started");

    let parked = SandboxProcess::new(spec.name, pid, false);
    if let Err(e) = isolation.map_identities(pid) {
        parked.abandon();
        return Err(e);
    }

    let confined = CgroupManager::attach(cgroup, pid);

    if let Err(e) = write(&sync_w, &[1u8]) {
        parked.abandon();
        return Err(Error::Spawn(format!("release {}: {}", spec.name, e)));
    }
    drop(sync_w);
    drop(spec.stdio);

    Ok(SandboxProcess::new(spec.name, pid, confined))
}

/// Child side of [`spawn`]: wait for the parent, install stdio, exec.
unsafe fn child_main(fds: &ChildFds, argv: *const *const c_char, envp: *const *const c_char) -> isize {
    let mut go = 0u8;
    loop {
        let n = libc::read(fds.sync, &mut go as *mut u8 as *mut libc::c_void, 1);
        if n == 1 {
            break;
        }
        if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        // Parent went away without releasing us.
        libc::_exit(BOOTSTRAP_FAILURE_EXIT);
    }

    if install_fd(fds.stdin, 0) < 0 || install_fd(fds.stdout, 1) < 0 {
        libc::_exit(BOOTSTRAP_FAILURE_EXIT);
    }
    for (i, fd) in fds.extra.iter().enumerate() {
        if install_fd(*fd, REPORT_FD + i as RawFd) < 0 {
            libc::_exit(BOOTSTRAP_FAILURE_EXIT);
        }
    }

    libc::execve(*argv, argv, envp);
    libc::_exit(BOOTSTRAP_FAILURE_EXIT)
}

/// dup2 that also works when source and target coincide (dup2 would then
/// leave close-on-exec set).
unsafe fn install_fd(src: RawFd, dst: RawFd) -> libc::c_int {
    if src == dst {
        let flags = libc::fcntl(src, libc::F_GETFD);
        if flags < 0 {
            return flags;
        }
        libc::fcntl(src, libc::F_SETFD, flags & !libc::FD_CLOEXEC)
    } else {
        libc::dup2(src, dst)
    }
}

/// Inherited environment plus the three bootstrap variables.
fn bootstrap_env<I>(vars: I, rootfs: &Path, target: &Path) -> Result<Vec<CString>>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let bootstrap = [
        (OsString::from(ENV_MARKER), OsString::from("1")),
        (OsString::from(ENV_ROOTFS), rootfs.as_os_str().to_os_string()),
        (OsString::from(ENV_TARGET), target.as_os_str().to_os_string()),
    ];
    vars.into_iter()
        .filter(|(key, _)| ![ENV_MARKER, ENV_ROOTFS, ENV_TARGET].iter().any(|k| key == k))
        .chain(bootstrap)
        .map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).map_err(|e| Error::Spawn(format!("environment entry: {}", e)))
        })
        .collect()
}
