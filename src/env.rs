use std::{
    env,
    ffi::{OsStr, OsString},
    fs::File,
    io,
    os::fd::{BorrowedFd, FromRawFd, RawFd},
};

use crate::process::{spawn_os_process, Process};
use crate::utils;

/// Indirection over everything the upgrader needs from the operating
/// system: spawning the successor, wrapping inherited descriptors, and the
/// process environment. Tests substitute a fake that records spawned
/// children instead of forking.
pub(crate) trait Environment: Send + Sync {
    /// Spawn a successor with `files` mapped to fds 3, 4, 5, … in order.
    fn spawn(
        &self,
        path: &OsStr,
        args: &[OsString],
        files: &[BorrowedFd<'_>],
        env: &[(OsString, OsString)],
    ) -> io::Result<Box<dyn Process>>;

    /// Take ownership of an already-open descriptor of this process.
    fn new_file(&self, fd: RawFd) -> io::Result<File>;

    fn environ(&self) -> Vec<(OsString, OsString)>;

    fn getenv(&self, key: &str) -> Option<OsString>;

    fn close_on_exec(&self, fd: RawFd) -> io::Result<()>;
}

pub(crate) struct OsEnvironment;

impl Environment for OsEnvironment {
    fn spawn(
        &self,
        path: &OsStr,
        args: &[OsString],
        files: &[BorrowedFd<'_>],
        env: &[(OsString, OsString)],
    ) -> io::Result<Box<dyn Process>> {
        spawn_os_process(path, args, files, env)
    }

    fn new_file(&self, fd: RawFd) -> io::Result<File> {
        // The caller owns `fd` by protocol; nothing else in this process
        // refers to it.
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn environ(&self) -> Vec<(OsString, OsString)> {
        env::vars_os().collect()
    }

    fn getenv(&self, key: &str) -> Option<OsString> {
        env::var_os(key)
    }

    fn close_on_exec(&self, fd: RawFd) -> io::Result<()> {
        utils::set_cloexec(fd)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::HashMap,
        fmt,
        os::fd::{AsFd, OwnedFd},
        process::ExitStatus,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use crossbeam_channel as chan;
    use nix::sys::signal::Signal;

    use super::*;
    use crate::fds::FdName;
    use crate::parent::{self, ParentResult};

    /// Records every "spawned" child on a channel instead of forking.
    pub(crate) struct FakeEnv {
        procs: chan::Sender<FakeProcess>,
    }

    pub(crate) fn fake_env() -> (Arc<dyn Environment>, chan::Receiver<FakeProcess>) {
        let (procs_tx, procs_rx) = chan::bounded(10);
        (Arc::new(FakeEnv { procs: procs_tx }), procs_rx)
    }

    impl Environment for FakeEnv {
        fn spawn(
            &self,
            _path: &OsStr,
            _args: &[OsString],
            files: &[BorrowedFd<'_>],
            env: &[(OsString, OsString)],
        ) -> io::Result<Box<dyn Process>> {
            let proc = FakeProcess::new(files, env)?;
            // The test may have stopped listening; the process still runs.
            let _ = self.procs.send(proc.clone());
            Ok(Box::new(proc))
        }

        fn new_file(&self, _fd: RawFd) -> io::Result<File> {
            Err(io::Error::other("fake environment has no inherited fds"))
        }

        fn environ(&self) -> Vec<(OsString, OsString)> {
            Vec::new()
        }

        fn getenv(&self, _key: &str) -> Option<OsString> {
            None
        }

        fn close_on_exec(&self, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }
    }

    static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

    /// A child that exists only as a bundle of channels. Tests drive it
    /// with [`FakeProcess::exit`], [`FakeProcess::recv_signal`] and
    /// [`FakeProcess::notify`].
    #[derive(Clone)]
    pub(crate) struct FakeProcess {
        id: usize,
        /// The descriptors the parent passed, indexed from child fd 3.
        files: Arc<Vec<File>>,
        env: Arc<HashMap<OsString, OsString>>,
        signals_tx: chan::Sender<Signal>,
        signals_rx: chan::Receiver<Signal>,
        signal_reply_tx: chan::Sender<io::Result<()>>,
        signal_reply_rx: chan::Receiver<io::Result<()>>,
        wait_tx: chan::Sender<io::Result<ExitStatus>>,
        wait_rx: chan::Receiver<io::Result<ExitStatus>>,
        quit_tx: Arc<Mutex<Option<chan::Sender<()>>>>,
        quit_rx: chan::Receiver<()>,
    }

    impl FakeProcess {
        fn new(files: &[BorrowedFd<'_>], env: &[(OsString, OsString)]) -> io::Result<Self> {
            let files = files
                .iter()
                .map(|fd| fd.try_clone_to_owned().map(File::from))
                .collect::<io::Result<Vec<_>>>()?;

            let (signals_tx, signals_rx) = chan::bounded(1);
            let (signal_reply_tx, signal_reply_rx) = chan::bounded(0);
            let (wait_tx, wait_rx) = chan::bounded(0);
            let (quit_tx, quit_rx) = chan::bounded::<()>(0);

            Ok(FakeProcess {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                files: Arc::new(files),
                env: Arc::new(env.iter().cloned().collect()),
                signals_tx,
                signals_rx,
                signal_reply_tx,
                signal_reply_rx,
                wait_tx,
                wait_rx,
                quit_tx: Arc::new(Mutex::new(Some(quit_tx))),
                quit_rx,
            })
        }

        /// Make `wait` return `result`, as if the process had exited.
        pub(crate) fn exit(&self, result: io::Result<ExitStatus>) {
            chan::select! {
                send(self.wait_tx, result) -> _ => {
                    self.quit_tx.lock().unwrap().take();
                }
                recv(self.quit_rx) -> _ => {}
            }
        }

        pub(crate) fn exit_clean(&self) {
            use std::os::unix::process::ExitStatusExt;
            self.exit(Ok(ExitStatus::from_raw(0)));
        }

        pub(crate) fn exit_with_code(&self) {
            use std::os::unix::process::ExitStatusExt;
            self.exit(Ok(ExitStatus::from_raw(1 << 8)));
        }

        /// A duplicate of the descriptor this process sees as `fd`.
        pub(crate) fn inherited_file(&self, fd: RawFd) -> File {
            self.files[fd as usize - 3]
                .try_clone()
                .expect("can't dup inherited file")
        }

        /// Receive the next signal sent to the process, answering the
        /// sender with `reply`.
        pub(crate) fn recv_signal(&self, reply: io::Result<()>) -> Signal {
            let signal = self.signals_rx.recv().expect("no signal delivered");
            self.signal_reply_tx.send(reply).expect("signaller went away");
            signal
        }

        /// Run the child half of the handshake: decode the inherited
        /// descriptors and send the readiness byte. Returns the inherited
        /// map and the shared parent-exit result.
        #[allow(clippy::type_complexity)]
        pub(crate) fn notify(
            &self,
        ) -> (
            HashMap<FdName, Arc<OwnedFd>>,
            Arc<ParentResult>,
            io::Result<()>,
        ) {
            let env: Arc<dyn Environment> = Arc::new(FakeChildEnv { proc: self.clone() });
            let (parent, files) = parent::new_parent(&env)
                .expect("inherit failed")
                .expect("process has no parent sentinel");
            let result = parent.result.clone();
            let sent = parent.send_ready();
            (files, result, sent)
        }
    }

    impl Process for FakeProcess {
        fn signal(&self, signal: Signal) -> io::Result<()> {
            chan::select! {
                send(self.signals_tx, signal) -> res => {
                    if res.is_err() {
                        return Ok(());
                    }
                    chan::select! {
                        recv(self.signal_reply_rx) -> reply => reply.unwrap_or(Ok(())),
                        recv(self.quit_rx) -> _ => Ok(()),
                    }
                }
                recv(self.quit_rx) -> _ => Ok(()),
            }
        }

        fn wait(&self) -> io::Result<ExitStatus> {
            use std::os::unix::process::ExitStatusExt;
            chan::select! {
                recv(self.wait_rx) -> res => res.unwrap_or(Ok(ExitStatus::from_raw(0))),
                recv(self.quit_rx) -> _ => Ok(ExitStatus::from_raw(0)),
            }
        }
    }

    impl fmt::Display for FakeProcess {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test-proc-{}", self.id)
        }
    }

    /// The environment as seen from inside a fake child: the sentinel is
    /// set and fds 3, 4, 5, … resolve to the files recorded at spawn time.
    pub(crate) struct FakeChildEnv {
        proc: FakeProcess,
    }

    impl FakeChildEnv {
        pub(crate) fn new(proc: FakeProcess) -> Self {
            FakeChildEnv { proc }
        }
    }

    impl Environment for FakeChildEnv {
        fn spawn(
            &self,
            _path: &OsStr,
            _args: &[OsString],
            _files: &[BorrowedFd<'_>],
            _env: &[(OsString, OsString)],
        ) -> io::Result<Box<dyn Process>> {
            Err(io::Error::other("fake child can't spawn"))
        }

        fn new_file(&self, fd: RawFd) -> io::Result<File> {
            self.proc
                .files
                .get(fd as usize - 3)
                .ok_or_else(|| io::Error::other(format!("no inherited fd {fd}")))?
                .try_clone()
        }

        fn environ(&self) -> Vec<(OsString, OsString)> {
            self.proc.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        }

        fn getenv(&self, key: &str) -> Option<OsString> {
            self.proc.env.get(OsStr::new(key)).cloned()
        }

        fn close_on_exec(&self, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }
    }
}
