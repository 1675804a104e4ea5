use std::{
    collections::HashMap,
    fmt,
    fs::File,
    io,
    net::{SocketAddr, TcpListener, UdpSocket},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    os::unix::net::{UnixDatagram, UnixListener},
    path::Path,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};

use crate::utils;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub(crate) enum FdKind {
    Listener,
    Packet,
    Conn,
    Fd,
}

impl FdKind {
    fn as_str(self) -> &'static str {
        match self {
            FdKind::Listener => "listener",
            FdKind::Packet => "packet",
            FdKind::Conn => "conn",
            FdKind::Fd => "fd",
        }
    }
}

/// Identity of a shared descriptor. This is what crosses the names pipe;
/// the child matches inherited fds back to their owners by it.
///
/// New fields must only ever be added at the end: the wire encoding is not
/// self-describing.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub(crate) struct FdName {
    kind: FdKind,
    network: String,
    addr: String,
}

impl FdName {
    pub(crate) fn new(kind: FdKind, network: &str, addr: &str) -> Self {
        FdName {
            kind,
            network: network.to_owned(),
            addr: addr.to_owned(),
        }
    }

    fn is_unix(&self) -> bool {
        match self.kind {
            FdKind::Listener => self.network == "unix" || self.network == "unixpacket",
            FdKind::Packet => self.network == "unixgram",
            _ => false,
        }
    }
}

impl fmt::Display for FdName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind.as_str(), self.network, self.addr)
    }
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum FdsError {
    #[display("can't inherit {name}: {source}")]
    Inherit { name: String, source: io::Error },

    #[display("can't create listener: {_0}")]
    Create(#[error(source)] io::Error),

    #[display("can't dup {name}: {source}")]
    Dup { name: String, source: io::Error },
}

#[derive(Default)]
struct Table {
    inherited: HashMap<FdName, Arc<OwnedFd>>,
    used: HashMap<FdName, Arc<OwnedFd>>,
}

/// Registry of the descriptors shared between the old and the new process.
///
/// `inherited` holds what this process received from its parent; entries
/// move to `used` as the application claims them, and anything still
/// inherited when [`crate::Upgrader::ready`] is called gets closed. `used`
/// is what the next upgrade hands to the child.
///
/// Every descriptor stored here is a `F_DUPFD_CLOEXEC` duplicate, so
/// closing an application's own handle never invalidates the registry and
/// registry teardown never invalidates the application.
pub struct Fds {
    table: Mutex<Table>,
}

impl Fds {
    pub(crate) fn new(inherited: HashMap<FdName, Arc<OwnedFd>>) -> Self {
        Fds {
            table: Mutex::new(Table {
                inherited,
                used: HashMap::new(),
            }),
        }
    }

    /// Returns a TCP listener inherited from the parent, or binds a new
    /// one on `addr`.
    pub fn listen_tcp(&self, addr: SocketAddr) -> Result<TcpListener, FdsError> {
        self.listen_tcp_with(addr, |socket, addr| {
            socket.bind(&addr.into())?;
            socket.listen(128)?;
            Ok(socket.into())
        })
    }

    /// Like [`Fds::listen_tcp`], but the listener is built by `bind`. The
    /// callback runs only when nothing was inherited, holds the registry
    /// lock, and must not call back into the registry.
    pub fn listen_tcp_with<F>(&self, addr: SocketAddr, bind: F) -> Result<TcpListener, FdsError>
    where
        F: FnOnce(Socket, SocketAddr) -> io::Result<TcpListener>,
    {
        let name = FdName::new(FdKind::Listener, "tcp", &addr.to_string());
        let mut table = self.table.lock().expect("fds lock poisoned");

        if let Some(ln) = take_locked(&mut table, &name)? {
            log::debug!("inherited tcp listener on {addr}");
            return Ok(ln);
        }

        log::debug!("creating tcp listener on {addr}");
        let socket =
            Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(FdsError::Create)?;
        let ln = bind(socket, addr).map_err(FdsError::Create)?;
        add_locked(&mut table, name, ln.as_fd())?;
        Ok(ln)
    }

    /// Returns a UDP socket inherited from the parent, or binds a new one
    /// on `addr`.
    pub fn listen_udp(&self, addr: SocketAddr) -> Result<UdpSocket, FdsError> {
        self.listen_udp_with(addr, |socket, addr| {
            socket.bind(&addr.into())?;
            Ok(socket.into())
        })
    }

    /// Like [`Fds::listen_udp`], but the socket is built by `bind`. Same
    /// callback contract as [`Fds::listen_tcp_with`].
    pub fn listen_udp_with<F>(&self, addr: SocketAddr, bind: F) -> Result<UdpSocket, FdsError>
    where
        F: FnOnce(Socket, SocketAddr) -> io::Result<UdpSocket>,
    {
        let name = FdName::new(FdKind::Packet, "udp", &addr.to_string());
        let mut table = self.table.lock().expect("fds lock poisoned");

        if let Some(socket) = take_locked(&mut table, &name)? {
            log::debug!("inherited udp socket on {addr}");
            return Ok(socket);
        }

        log::debug!("creating udp socket on {addr}");
        let socket =
            Socket::new(Domain::for_address(addr), Type::DGRAM, None).map_err(FdsError::Create)?;
        let socket = bind(socket, addr).map_err(FdsError::Create)?;
        add_locked(&mut table, name, socket.as_fd())?;
        Ok(socket)
    }

    /// Returns a Unix stream listener inherited from the parent, or binds
    /// a new one at `path`. The socket path stays on the file system when
    /// the returned listener is closed; the registry decides at teardown
    /// whether to unlink it.
    pub fn listen_unix<P: AsRef<Path>>(&self, path: P) -> Result<UnixListener, FdsError> {
        let path = path.as_ref();
        let name = FdName::new(FdKind::Listener, "unix", &path.to_string_lossy());
        let mut table = self.table.lock().expect("fds lock poisoned");

        if let Some(ln) = take_locked(&mut table, &name)? {
            log::debug!("inherited unix listener at {}", path.display());
            return Ok(ln);
        }

        log::debug!("creating unix listener at {}", path.display());
        let ln = UnixListener::bind(path).map_err(FdsError::Create)?;
        add_locked(&mut table, name, ln.as_fd())?;
        Ok(ln)
    }

    /// Returns a Unix datagram socket inherited from the parent, or binds
    /// a new one at `path`.
    pub fn listen_unix_datagram<P: AsRef<Path>>(&self, path: P) -> Result<UnixDatagram, FdsError> {
        let path = path.as_ref();
        let name = FdName::new(FdKind::Packet, "unixgram", &path.to_string_lossy());
        let mut table = self.table.lock().expect("fds lock poisoned");

        if let Some(socket) = take_locked(&mut table, &name)? {
            log::debug!("inherited unix datagram socket at {}", path.display());
            return Ok(socket);
        }

        log::debug!("creating unix datagram socket at {}", path.display());
        let socket = UnixDatagram::bind(path).map_err(FdsError::Create)?;
        add_locked(&mut table, name, socket.as_fd())?;
        Ok(socket)
    }

    /// Returns a `SOCK_SEQPACKET` Unix listener inherited from the parent,
    /// or binds a new one at `path`.
    #[cfg(target_os = "linux")]
    pub fn listen_unix_seqpacket<P: AsRef<Path>>(&self, path: P) -> Result<Socket, FdsError> {
        let path = path.as_ref();
        let name = FdName::new(FdKind::Listener, "unixpacket", &path.to_string_lossy());
        let mut table = self.table.lock().expect("fds lock poisoned");

        if let Some(socket) = take_locked(&mut table, &name)? {
            log::debug!("inherited unix seqpacket listener at {}", path.display());
            return Ok(socket);
        }

        log::debug!("creating unix seqpacket listener at {}", path.display());
        let socket =
            Socket::new(Domain::UNIX, Type::SEQPACKET, None).map_err(FdsError::Create)?;
        let addr = socket2::SockAddr::unix(path).map_err(FdsError::Create)?;
        socket.bind(&addr).map_err(FdsError::Create)?;
        socket.listen(128).map_err(FdsError::Create)?;
        add_locked(&mut table, name, socket.as_fd())?;
        Ok(socket)
    }

    /// Returns an inherited listener, or `None`. The entry stays reserved
    /// for the next upgrade.
    pub fn listener<T: From<OwnedFd>>(
        &self,
        network: &str,
        addr: &str,
    ) -> Result<Option<T>, FdsError> {
        self.take(FdName::new(FdKind::Listener, network, addr))
    }

    /// Returns an inherited packet connection, or `None`.
    pub fn packet_conn<T: From<OwnedFd>>(
        &self,
        network: &str,
        addr: &str,
    ) -> Result<Option<T>, FdsError> {
        self.take(FdName::new(FdKind::Packet, network, addr))
    }

    /// Returns an inherited connection, or `None`.
    pub fn conn<T: From<OwnedFd>>(
        &self,
        network: &str,
        addr: &str,
    ) -> Result<Option<T>, FdsError> {
        self.take(FdName::new(FdKind::Conn, network, addr))
    }

    /// Returns an inherited file, or `None`. The returned file is a
    /// duplicate: closing it does not invalidate the registry's copy.
    pub fn file(&self, name: &str) -> Result<Option<File>, FdsError> {
        self.take(FdName::new(FdKind::Fd, name, ""))
    }

    /// Register a listener under `network`/`addr`. The registry stores a
    /// duplicate, so it is safe to close `ln` afterwards; an existing
    /// entry with the same identity is replaced.
    pub fn add_listener<L: AsFd>(&self, network: &str, addr: &str, ln: &L) -> Result<(), FdsError> {
        let mut table = self.table.lock().expect("fds lock poisoned");
        add_locked(
            &mut table,
            FdName::new(FdKind::Listener, network, addr),
            ln.as_fd(),
        )
    }

    /// Register a packet connection under `network`/`addr`.
    pub fn add_packet_conn<C: AsFd>(
        &self,
        network: &str,
        addr: &str,
        conn: &C,
    ) -> Result<(), FdsError> {
        let mut table = self.table.lock().expect("fds lock poisoned");
        add_locked(
            &mut table,
            FdName::new(FdKind::Packet, network, addr),
            conn.as_fd(),
        )
    }

    /// Register a connection under `network`/`addr`.
    pub fn add_conn<C: AsFd>(&self, network: &str, addr: &str, conn: &C) -> Result<(), FdsError> {
        let mut table = self.table.lock().expect("fds lock poisoned");
        add_locked(
            &mut table,
            FdName::new(FdKind::Conn, network, addr),
            conn.as_fd(),
        )
    }

    /// Register an arbitrary file under `name`.
    pub fn add_file<F: AsFd>(&self, name: &str, file: &F) -> Result<(), FdsError> {
        let mut table = self.table.lock().expect("fds lock poisoned");
        add_locked(&mut table, FdName::new(FdKind::Fd, name, ""), file.as_fd())
    }

    fn take<T: From<OwnedFd>>(&self, name: FdName) -> Result<Option<T>, FdsError> {
        let mut table = self.table.lock().expect("fds lock poisoned");
        take_locked(&mut table, &name)
    }

    /// Snapshot of `used` for the handoff. Names and descriptors come from
    /// the same iteration: the child rebuilds the mapping positionally.
    pub(crate) fn copy_for_child(&self) -> Vec<(FdName, Arc<OwnedFd>)> {
        let table = self.table.lock().expect("fds lock poisoned");
        table
            .used
            .iter()
            .map(|(name, fd)| (name.clone(), fd.clone()))
            .collect()
    }

    /// Close everything still inherited. Unix socket paths the child chose
    /// not to claim are unlinked.
    pub(crate) fn close_inherited(&self) {
        let mut table = self.table.lock().expect("fds lock poisoned");
        for (name, _) in table.inherited.drain() {
            unlink_if_unix(&name);
        }
    }

    /// Close all used descriptors without touching the file system. Runs
    /// after a successful handoff: the paths now belong to the child.
    pub(crate) fn close_used(&self) {
        let mut table = self.table.lock().expect("fds lock poisoned");
        table.used.clear();
    }

    /// Close all used descriptors and unlink their Unix socket paths.
    /// Runs when the process shuts down without ever having upgraded.
    pub(crate) fn close_and_remove_used(&self) {
        let mut table = self.table.lock().expect("fds lock poisoned");
        for (name, _) in table.used.drain() {
            unlink_if_unix(&name);
        }
    }
}

fn take_locked<T: From<OwnedFd>>(table: &mut Table, name: &FdName) -> Result<Option<T>, FdsError> {
    let Some(fd) = table.inherited.remove(name) else {
        return Ok(None);
    };

    match utils::dup_fd(fd.as_raw_fd()) {
        Ok(dup) => {
            table.used.insert(name.clone(), fd);
            Ok(Some(T::from(dup)))
        }
        Err(source) => {
            table.inherited.insert(name.clone(), fd);
            Err(FdsError::Inherit {
                name: name.to_string(),
                source,
            })
        }
    }
}

fn add_locked(table: &mut Table, name: FdName, fd: BorrowedFd<'_>) -> Result<(), FdsError> {
    let dup = utils::dup_fd(fd.as_raw_fd()).map_err(|source| FdsError::Dup {
        name: name.to_string(),
        source,
    })?;

    table.inherited.remove(&name);
    table.used.insert(name, Arc::new(dup));
    Ok(())
}

fn unlink_if_unix(name: &FdName) {
    if !name.is_unix() {
        return;
    }
    if let Err(err) = utils::unlink_unix_socket(&name.addr) {
        log::debug!("can't unlink socket {name}: {err}");
    }
}
