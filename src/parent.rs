use std::{
    collections::HashMap,
    fs::File,
    io::{self, Write},
    os::fd::{OwnedFd, RawFd},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use crossbeam_channel as chan;

use crate::env::Environment;
use crate::fds::FdName;
use crate::InitError;

/// Set on the successor's environment; its presence (with this exact
/// value) is how a process knows it is an upgrade rather than a cold
/// start.
pub(crate) const SENTINEL_ENV: &str = "TABLEFLIP_HAS_PARENT_7DIU3";

/// The one byte a child writes to fd 3 once it is ready to take over.
pub(crate) const NOTIFY_READY: u8 = 42;

#[derive(Clone, Debug, derive_more::Display, derive_more::Error)]
pub enum ParentError {
    /// The parent wrote something after the descriptor names. EOF is the
    /// only thing allowed to follow them.
    #[display("unexpected data from parent process")]
    UnexpectedData,

    #[display("error while waiting for parent to exit: {_0}")]
    Io(#[error(not(source))] Arc<io::Error>),

    #[display("timed out waiting for parent to exit")]
    TimedOut,
}

/// Outcome of the names-pipe drain, shared between the drain thread and
/// everyone waiting on the parent. The result is stored once and kept, so
/// every waiter sees the same value and each waiter's deadline runs on
/// its own.
#[derive(Default)]
pub(crate) struct ParentResult {
    state: Mutex<Option<Result<(), ParentError>>>,
    cond: Condvar,
}

impl ParentResult {
    fn set(&self, result: Result<(), ParentError>) {
        *self.state.lock().expect("parent result lock poisoned") = Some(result);
        self.cond.notify_all();
    }

    /// Block until the drain result is in.
    pub(crate) fn wait(&self) -> Result<(), ParentError> {
        let state = self.state.lock().expect("parent result lock poisoned");
        let state = self
            .cond
            .wait_while(state, |state| state.is_none())
            .expect("parent result lock poisoned");
        state.clone().expect("woken without a result")
    }

    /// Like [`ParentResult::wait`], but gives up after `timeout`.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), ParentError>> {
        let state = self.state.lock().expect("parent result lock poisoned");
        let (state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |state| state.is_none())
            .expect("parent result lock poisoned");
        state.clone()
    }
}

/// The parent's half of the handshake, as seen from the child: the
/// readiness pipe to write to, and the names pipe being drained in the
/// background until the parent exits.
pub(crate) struct Parent {
    ready_w: Mutex<Option<File>>,
    pub(crate) result: Arc<ParentResult>,
    pub(crate) exited: chan::Receiver<()>,
}

/// Inspect the environment for the upgrade sentinel. On a cold start this
/// returns `None`. As a child it claims fd 3 (readiness write end) and
/// fd 4 (names read end), decodes the descriptor names, claims fds 5 and
/// up in that order, and leaves a thread draining fd 4: EOF there means
/// the parent is gone.
#[allow(clippy::type_complexity)]
pub(crate) fn new_parent(
    env: &Arc<dyn Environment>,
) -> Result<Option<(Parent, HashMap<FdName, Arc<OwnedFd>>)>, InitError> {
    match env.getenv(SENTINEL_ENV) {
        Some(value) if value == "yes" => {}
        _ => return Ok(None),
    }
    log::info!("inheriting descriptors from parent process");

    let ready_w = env
        .new_file(3)
        .map_err(|source| InitError::ClaimFd { fd: 3, source })?;
    let mut names_r = env
        .new_file(4)
        .map_err(|source| InitError::ClaimFd { fd: 4, source })?;

    let names: Vec<FdName> =
        bincode::deserialize_from(&mut names_r).map_err(InitError::DecodeNames)?;
    log::debug!("inherited {} descriptor(s)", names.len());

    let mut files = HashMap::with_capacity(names.len());
    for (i, name) in names.into_iter().enumerate() {
        let fd = 5 + i as RawFd;
        env.close_on_exec(fd)
            .map_err(|source| InitError::ClaimFd { fd, source })?;
        let file = env
            .new_file(fd)
            .map_err(|source| InitError::ClaimFd { fd, source })?;
        files.insert(name, Arc::new(OwnedFd::from(file)));
    }

    let result = Arc::new(ParentResult::default());
    let (exited_tx, exited) = chan::bounded::<()>(0);
    let drain_result = result.clone();
    thread::spawn(move || {
        drain_result.set(drain(names_r));
        drop(exited_tx);
    });

    Ok(Some((
        Parent {
            ready_w: Mutex::new(Some(ready_w)),
            result,
            exited,
        },
        files,
    )))
}

/// Consume the names pipe until the parent's copy closes. Anything read
/// here arrived after the name list and means the parent misbehaved.
fn drain(mut names_r: File) -> Result<(), ParentError> {
    match io::copy(&mut names_r, &mut io::sink()) {
        Ok(0) => Ok(()),
        Ok(_) => Err(ParentError::UnexpectedData),
        Err(err) => Err(ParentError::Io(Arc::new(err))),
    }
}

impl Parent {
    /// Write the readiness byte. Only the first call writes; the pipe end
    /// is closed immediately afterwards.
    pub(crate) fn send_ready(&self) -> io::Result<()> {
        if let Some(mut ready_w) = self.ready_w.lock().expect("parent lock poisoned").take() {
            ready_w.write_all(&[NOTIFY_READY])?;
        }
        Ok(())
    }
}
