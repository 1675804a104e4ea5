use std::{
    env,
    ffi::OsString,
    fmt,
    io::{self, Read},
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    process::ExitStatus,
    sync::Arc,
    thread,
};

use crossbeam_channel as chan;
use nix::sys::signal::Signal;

use crate::env::Environment;
use crate::fds::FdName;
use crate::parent::{NOTIFY_READY, SENTINEL_ENV};
use crate::process::Process;

/// Handle on a spawned successor while the handshake is in flight.
///
/// Exactly one of `exited` and `ready` yields a value first; the loser
/// either never fires or fires after the handle has been retired.
pub(crate) struct Child {
    proc: Arc<dyn Process>,
    pub(crate) exited: chan::Receiver<io::Result<ExitStatus>>,
    pub(crate) ready: chan::Receiver<Arc<os_pipe::PipeWriter>>,
}

pub(crate) fn start_child(
    env: &Arc<dyn Environment>,
    files: Vec<(FdName, Arc<OwnedFd>)>,
) -> io::Result<Child> {
    // Two pipes: the child writes one readiness byte onto `ready`, the
    // parent writes the descriptor names onto `names`. The write end of
    // `names` outlives the handshake; see `Upgrader::exit_fd`.
    let (ready_r, ready_w) = os_pipe::pipe()?;
    let (names_r, names_w) = os_pipe::pipe()?;

    let names: Vec<FdName> = files.iter().map(|(name, _)| name.clone()).collect();

    // Names and descriptors must come from the same iteration: the child
    // matches them up positionally from fd 5 onward.
    let ready_w = OwnedFd::from(ready_w);
    let names_r = OwnedFd::from(names_r);
    let mut pass: Vec<BorrowedFd<'_>> = Vec::with_capacity(2 + files.len());
    pass.push(ready_w.as_fd());
    pass.push(names_r.as_fd());
    pass.extend(files.iter().map(|(_, fd)| fd.as_fd()));

    let mut child_env: Vec<(OsString, OsString)> = env
        .environ()
        .into_iter()
        .filter(|(key, _)| key != SENTINEL_ENV)
        .collect();
    child_env.push((SENTINEL_ENV.into(), "yes".into()));

    let argv: Vec<OsString> = env::args_os().collect();
    let (arg0, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::other("process has an empty argv"))?;

    let proc = env.spawn(arg0, args, &pass, &child_env)?;

    // Drop the parent's copies of the child-bound pipe ends right away.
    // From here on the only write end of `ready` and the only read end of
    // `names` live in the child, so EOF tracks the child's lifetime.
    drop(pass);
    drop(ready_w);
    drop(names_r);

    let proc: Arc<dyn Process> = Arc::from(proc);
    let names_w = Arc::new(names_w);

    let (exited_tx, exited) = chan::bounded(1);
    let (ready_tx, ready) = chan::bounded(1);

    write_names(names_w.clone(), names);
    wait_exit(proc.clone(), exited_tx);
    wait_ready(ready_r, names_w, ready_tx);

    Ok(Child { proc, exited, ready })
}

impl Child {
    pub(crate) fn kill(&self) {
        if let Err(err) = self.proc.signal(Signal::SIGKILL) {
            log::warn!("can't kill child {}: {err}", self.proc);
        }
    }
}

impl fmt::Display for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.proc.fmt(f)
    }
}

/// Encode the ordered name list onto the names pipe. An empty snapshot
/// still encodes an empty list so the child always has something to
/// decode.
fn write_names(names_w: Arc<os_pipe::PipeWriter>, names: Vec<FdName>) {
    thread::spawn(move || {
        if let Err(err) = bincode::serialize_into(&*names_w, &names) {
            // The child died before reading; the exit waiter reports it.
            log::debug!("can't send descriptor names to child: {err}");
        }
    });
}

fn wait_exit(proc: Arc<dyn Process>, exited_tx: chan::Sender<io::Result<ExitStatus>>) {
    thread::spawn(move || {
        let _ = exited_tx.send(proc.wait());
    });
}

/// Read one byte from the readiness pipe. The right byte hands the names
/// writer to the coordinator; EOF or garbage means the child never became
/// ready and the exit waiter is left to tell the story.
fn wait_ready(
    mut ready_r: os_pipe::PipeReader,
    names_w: Arc<os_pipe::PipeWriter>,
    ready_tx: chan::Sender<Arc<os_pipe::PipeWriter>>,
) {
    thread::spawn(move || {
        let mut buf = [0u8; 1];
        match ready_r.read(&mut buf) {
            Ok(1) if buf[0] == NOTIFY_READY => {
                let _ = ready_tx.send(names_w);
            }
            _ => {}
        }
    });
}
