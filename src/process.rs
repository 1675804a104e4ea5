use std::{
    ffi::{OsStr, OsString},
    fmt, io,
    os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd},
    os::unix::process::CommandExt,
    process::{Child, Command, ExitStatus},
    sync::Mutex,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::{dup2, Pid},
};

use crate::utils;

/// A spawned successor process. Implemented by the real fork/exec wiring
/// and by the hermetic fake used in tests.
pub(crate) trait Process: fmt::Display + Send + Sync {
    fn signal(&self, signal: Signal) -> io::Result<()>;

    /// Wait for the process to finish. May be called once; a second call
    /// reports an error.
    fn wait(&self) -> io::Result<ExitStatus>;
}

pub(crate) struct OsProcess {
    pid: u32,
    child: Mutex<Option<Child>>,
}

/// Spawn `path` with `files` appearing in the child as fds 3, 4, 5, … in
/// order. Stdin, stdout and stderr are inherited verbatim, the environment
/// is replaced with `env`, and the working directory is the one captured
/// when the library was initialized.
pub(crate) fn spawn_os_process(
    path: &OsStr,
    args: &[OsString],
    files: &[BorrowedFd<'_>],
    env: &[(OsString, OsString)],
) -> io::Result<Box<dyn Process>> {
    let cwd = utils::initial_working_dir()
        .ok_or_else(|| io::Error::other("initial working directory is unknown"))?;

    // Lift every descriptor above the target range first, so the dup2
    // calls after fork can never clobber a source.
    let floor = 3 + files.len() as RawFd;
    let mut lifted = Vec::with_capacity(files.len());
    for fd in files {
        lifted.push(utils::dup_fd_min(fd.as_raw_fd(), floor)?);
    }
    let sources: Vec<RawFd> = lifted.iter().map(OwnedFd::as_raw_fd).collect();

    // Occupy every fd below the target ceiling. The runtime allocates an
    // internal pipe when spawning; this keeps it out of the range the
    // child is about to dup2 over.
    let devnull = std::fs::File::open("/dev/null")?;
    let mut guards = Vec::new();
    if !files.is_empty() {
        loop {
            let guard = utils::dup_fd_min(devnull.as_raw_fd(), 3)?;
            let raw = guard.as_raw_fd();
            guards.push(guard);
            if raw >= floor {
                break;
            }
        }
    }

    let mut cmd = Command::new(path);
    cmd.args(args)
        .env_clear()
        .envs(env.iter().cloned())
        .current_dir(cwd);

    // Runs after fork, before exec. dup2 clears close-on-exec on the
    // target fd, so the lifted copies vanish at exec while the targets
    // survive into the new program image.
    unsafe {
        cmd.pre_exec(move || {
            for (i, &src) in sources.iter().enumerate() {
                dup2(src, 3 + i as RawFd)?;
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    drop(guards);
    drop(devnull);
    drop(lifted);

    Ok(Box::new(OsProcess {
        pid: child.id(),
        child: Mutex::new(Some(child)),
    }))
}

impl Process for OsProcess {
    fn signal(&self, signal: Signal) -> io::Result<()> {
        kill(Pid::from_raw(self.pid as i32), signal)?;
        Ok(())
    }

    fn wait(&self) -> io::Result<ExitStatus> {
        let child = self.child.lock().expect("process lock poisoned").take();
        match child {
            Some(mut child) => child.wait(),
            None => Err(io::Error::other("process was already waited for")),
        }
    }
}

impl fmt::Display for OsProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={}", self.pid)
    }
}
