#![doc = include_str!("../README.md")]

mod child;
mod env;
mod fds;
mod parent;
mod process;
mod utils;

use std::{
    collections::HashMap,
    io,
    os::fd::RawFd,
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crossbeam_channel as chan;

use crate::child::start_child;
use crate::env::{Environment, OsEnvironment};
use crate::parent::{new_parent, Parent};

pub use crate::fds::{Fds, FdsError};
pub use crate::parent::ParentError;

/// How long a child may take to become ready before it is killed and the
/// upgrade is abandoned.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

/// Behaviour knobs for [`Upgrader::new`].
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Time after which an upgrade is considered failed. Zero means
    /// [`DEFAULT_UPGRADE_TIMEOUT`].
    pub upgrade_timeout: Duration,
    /// The pid of the ready process is written here, atomically, on every
    /// call to [`Upgrader::ready`].
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum InitError {
    #[display("platform does not support graceful upgrades")]
    NotSupported,

    #[display("only one Upgrader is allowed per process")]
    AlreadyCreated,

    #[display("couldn't determine the initial working directory")]
    NoWorkingDir,

    #[display("can't decode descriptor names from parent process: {_0}")]
    DecodeNames(#[error(source)] bincode::Error),

    #[display("can't claim inherited descriptor {fd}: {source}")]
    ClaimFd { fd: RawFd, source: io::Error },
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum UpgradeError {
    #[display("platform does not support graceful upgrades")]
    NotSupported,

    /// [`Upgrader::stop`] was called; no further upgrades will run.
    #[display("terminating")]
    Stopping,

    /// An upgrade already succeeded; this process should exit.
    #[display("already upgraded")]
    AlreadyUpgraded,

    /// [`Upgrader::ready`] has not completed yet. Callers racing a
    /// concurrent `ready` can retry on this.
    #[display("process is not ready yet")]
    NotReady,

    #[display("parent hasn't exited")]
    ParentAlive,

    #[display("upgrade in progress")]
    InProgress,

    #[display("can't start child: {_0}")]
    Spawn(#[error(source)] io::Error),

    #[display("child {child} exited before becoming ready ({status})")]
    ChildExited { child: String, status: String },

    #[display("child {child} timed out before becoming ready")]
    TimedOut { child: String },
}

type UpgradeRequest = chan::Sender<Result<(), UpgradeError>>;

/// A single upgrader per process; the pinned reference also keeps
/// `exit_fd` alive until the process really exits.
static INSTANCE: Mutex<Option<Arc<Upgrader>>> = Mutex::new(None);

/// Coordinates zero-downtime upgrades: detects whether this process is a
/// cold start or the successor of a previous instance, tracks the
/// descriptors to hand over, and serializes upgrade attempts.
pub struct Upgrader {
    opts: Options,
    fds: Arc<Fds>,
    parent: Option<Parent>,
    ready_tx: Mutex<Option<chan::Sender<()>>>,
    stop_tx: Mutex<Option<chan::Sender<()>>>,
    stopped: chan::Receiver<()>,
    upgrade_tx: chan::Sender<UpgradeRequest>,
    exit_rx: chan::Receiver<()>,
    /// Write end of the names pipe after a successful upgrade. Its
    /// closure is how the child learns the parent is gone, so it must
    /// only ever be closed by the OS at process exit. The process-global
    /// upgrader registration keeps this from being dropped early.
    exit_fd: Arc<Mutex<Option<Arc<os_pipe::PipeWriter>>>>,
}

impl Upgrader {
    /// Create the process-wide upgrader. Only the first call in a process
    /// succeeds. Inherited descriptors, if any, become available through
    /// [`Upgrader::fds`].
    pub fn new(opts: Options) -> Result<Arc<Upgrader>, InitError> {
        let mut instance = INSTANCE.lock().expect("upgrader registry poisoned");
        if !utils::is_supported_os() {
            return Err(InitError::NotSupported);
        }
        if instance.is_some() {
            return Err(InitError::AlreadyCreated);
        }

        let upgrader = Arc::new(Upgrader::with_env(Arc::new(OsEnvironment), opts)?);
        *instance = Some(upgrader.clone());
        Ok(upgrader)
    }

    fn with_env(env: Arc<dyn Environment>, mut opts: Options) -> Result<Upgrader, InitError> {
        if utils::initial_working_dir().is_none() {
            // Without it the child can't be spawned reliably later on.
            return Err(InitError::NoWorkingDir);
        }
        if opts.upgrade_timeout.is_zero() {
            opts.upgrade_timeout = DEFAULT_UPGRADE_TIMEOUT;
        }

        let (parent, inherited) = match new_parent(&env)? {
            Some((parent, files)) => (Some(parent), files),
            None => (None, HashMap::new()),
        };
        let fds = Arc::new(Fds::new(inherited));

        let (ready_tx, ready_rx) = chan::bounded::<()>(0);
        let (stop_tx, stop_rx) = chan::bounded::<()>(0);
        let (upgrade_tx, upgrade_rx) = chan::bounded::<UpgradeRequest>(0);
        let (exit_tx, exit_rx) = chan::bounded::<()>(0);
        let exit_fd = Arc::new(Mutex::new(None));

        let run = EventLoop {
            env,
            fds: fds.clone(),
            upgrade_timeout: opts.upgrade_timeout,
            parent_exited: parent.as_ref().map(|parent| parent.exited.clone()),
            ready_rx,
            stop_rx: stop_rx.clone(),
            upgrade_rx,
            _exit_tx: exit_tx,
            exit_fd: exit_fd.clone(),
        };
        thread::spawn(move || run.run());

        Ok(Upgrader {
            opts,
            fds,
            parent,
            ready_tx: Mutex::new(Some(ready_tx)),
            stop_tx: Mutex::new(Some(stop_tx)),
            stopped: stop_rx,
            upgrade_tx,
            exit_rx,
            exit_fd,
        })
    }

    /// The descriptor table shared with the next process.
    pub fn fds(&self) -> &Fds {
        &self.fds
    }

    /// Whether this process is an upgrade rather than a first start.
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Signal that this process is ready to accept connections. Must be
    /// called to finish an upgrade.
    ///
    /// The first call closes every inherited descriptor the application
    /// did not claim and notifies the parent; later calls only re-attempt
    /// the pid file write.
    pub fn ready(&self) -> io::Result<()> {
        if self
            .ready_tx
            .lock()
            .expect("upgrader lock poisoned")
            .take()
            .is_some()
        {
            self.fds.close_inherited();
        }

        if let Some(path) = &self.opts.pid_file {
            utils::write_pid_file(path)?;
        }

        if let Some(parent) = &self.parent {
            parent.send_ready()?;
        }
        Ok(())
    }

    /// A channel that becomes disconnected when the process should exit:
    /// after [`Upgrader::stop`], or once an upgrade has succeeded.
    pub fn exit(&self) -> chan::Receiver<()> {
        self.exit_rx.clone()
    }

    /// Prevent any further upgrades and interrupt one in flight. If no
    /// upgrade ever succeeded, all tracked Unix socket paths are removed
    /// from the file system.
    pub fn stop(&self) {
        let _ = self.stop_tx.lock().expect("upgrader lock poisoned").take();
    }

    /// Block until the parent has exited, or `timeout` elapses. The
    /// result is kept once it is in: every later call sees the same
    /// value, and each caller's deadline runs independently of any other
    /// waiter. Returns immediately on a cold start.
    pub fn wait_for_parent(&self, timeout: Option<Duration>) -> Result<(), ParentError> {
        let Some(parent) = &self.parent else {
            return Ok(());
        };

        match timeout {
            None => parent.result.wait(),
            Some(timeout) => parent
                .result
                .wait_timeout(timeout)
                .ok_or(ParentError::TimedOut)?,
        }
    }

    /// Spawn a successor, hand it the used descriptors and wait for it to
    /// become ready. At most one upgrade runs at a time; everything that
    /// can go wrong comes back as a distinct [`UpgradeError`] and leaves
    /// this process serving.
    pub fn upgrade(&self) -> Result<(), UpgradeError> {
        if !utils::is_supported_os() {
            return Err(UpgradeError::NotSupported);
        }

        let (reply_tx, reply_rx) = chan::bounded(1);
        chan::select! {
            recv(self.stopped) -> _ => return Err(UpgradeError::Stopping),
            recv(self.exit_rx) -> _ => return Err(UpgradeError::AlreadyUpgraded),
            send(self.upgrade_tx, reply_tx) -> sent => {
                if sent.is_err() {
                    // The loop is gone; it either stopped or handed off.
                    let stopped = self.stop_tx.lock().expect("upgrader lock poisoned").is_none();
                    return Err(if stopped {
                        UpgradeError::Stopping
                    } else {
                        UpgradeError::AlreadyUpgraded
                    });
                }
            }
        }

        match reply_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(UpgradeError::Stopping),
        }
    }

    #[cfg(test)]
    fn take_exit_fd(&self) -> Option<Arc<os_pipe::PipeWriter>> {
        self.exit_fd.lock().unwrap().take()
    }
}

/// The single-threaded owner of all state transitions. Public entry
/// points only touch their latches and channels; everything else happens
/// here.
struct EventLoop {
    env: Arc<dyn Environment>,
    fds: Arc<Fds>,
    upgrade_timeout: Duration,
    parent_exited: Option<chan::Receiver<()>>,
    ready_rx: chan::Receiver<()>,
    stop_rx: chan::Receiver<()>,
    upgrade_rx: chan::Receiver<UpgradeRequest>,
    /// Dropped when the loop returns; that is what `Upgrader::exit`
    /// observes.
    _exit_tx: chan::Sender<()>,
    exit_fd: Arc<Mutex<Option<Arc<os_pipe::PipeWriter>>>>,
}

enum Event {
    ParentExited,
    Ready,
    Stop,
    Request(Result<UpgradeRequest, chan::RecvError>),
}

impl EventLoop {
    fn run(self) {
        let mut parent_alive = self.parent_exited.is_some();
        let mut parent_exited = self.parent_exited.clone().unwrap_or_else(chan::never);
        let mut ready = false;
        let mut ready_rx = self.ready_rx.clone();

        loop {
            let event = chan::select! {
                recv(parent_exited) -> _ => Event::ParentExited,
                recv(ready_rx) -> _ => Event::Ready,
                recv(self.stop_rx) -> _ => Event::Stop,
                recv(self.upgrade_rx) -> request => Event::Request(request),
            };

            match event {
                Event::ParentExited => {
                    parent_alive = false;
                    parent_exited = chan::never();
                }
                Event::Ready => {
                    ready = true;
                    ready_rx = chan::never();
                }
                // Dropping the upgrader without stopping it counts as a
                // shutdown too.
                Event::Stop | Event::Request(Err(_)) => {
                    self.fds.close_and_remove_used();
                    return;
                }
                Event::Request(Ok(request)) => {
                    // Stop wins over a request that raced it through the
                    // select.
                    if matches!(self.stop_rx.try_recv(), Err(chan::TryRecvError::Disconnected)) {
                        let _ = request.send(Err(UpgradeError::Stopping));
                        self.fds.close_and_remove_used();
                        return;
                    }
                    if !ready {
                        let _ = request.send(Err(UpgradeError::NotReady));
                        continue;
                    }
                    if parent_alive {
                        let _ = request.send(Err(UpgradeError::ParentAlive));
                        continue;
                    }

                    match self.upgrade() {
                        Ok(names_w) => {
                            // Park the pipe writer where only process exit
                            // can close it, then hand off.
                            *self.exit_fd.lock().expect("exit fd lock poisoned") = Some(names_w);
                            let _ = request.send(Ok(()));
                            self.fds.close_used();
                            return;
                        }
                        Err(err) => {
                            log::warn!("upgrade failed: {err}");
                            let _ = request.send(Err(err));
                        }
                    }
                }
            }
        }
    }

    fn upgrade(&self) -> Result<Arc<os_pipe::PipeWriter>, UpgradeError> {
        let child =
            start_child(&self.env, self.fds.copy_for_child()).map_err(UpgradeError::Spawn)?;
        log::warn!("starting upgrade, child {child}");

        let timeout = chan::after(self.upgrade_timeout);
        let mut upgrade_rx = self.upgrade_rx.clone();
        let mut ready_rx = child.ready.clone();

        enum Step {
            Request(Result<UpgradeRequest, chan::RecvError>),
            Exited(Result<io::Result<std::process::ExitStatus>, chan::RecvError>),
            Stop,
            Timeout,
            Ready(Result<Arc<os_pipe::PipeWriter>, chan::RecvError>),
        }

        loop {
            let step = chan::select! {
                recv(upgrade_rx) -> request => Step::Request(request),
                recv(child.exited) -> status => Step::Exited(status),
                recv(self.stop_rx) -> _ => Step::Stop,
                recv(timeout) -> _ => Step::Timeout,
                recv(ready_rx) -> names_w => Step::Ready(names_w),
            };

            match step {
                Step::Request(Ok(request)) => {
                    let _ = request.send(Err(UpgradeError::InProgress));
                }
                Step::Request(Err(_)) => upgrade_rx = chan::never(),
                Step::Exited(status) => {
                    let status = match status {
                        Ok(Ok(status)) => status.to_string(),
                        Ok(Err(err)) => err.to_string(),
                        Err(_) => "wait result lost".to_owned(),
                    };
                    return Err(UpgradeError::ChildExited {
                        child: child.to_string(),
                        status,
                    });
                }
                Step::Stop => {
                    child.kill();
                    return Err(UpgradeError::Stopping);
                }
                Step::Timeout => {
                    child.kill();
                    return Err(UpgradeError::TimedOut {
                        child: child.to_string(),
                    });
                }
                Step::Ready(Ok(names_w)) => return Ok(names_w),
                // The ready waiter saw EOF; the exit arm will report why.
                Step::Ready(Err(_)) => ready_rx = chan::never(),
            }
        }
    }
}
