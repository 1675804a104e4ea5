use std::{
    fs,
    io::{self, Write},
    os::fd::{FromRawFd, OwnedFd, RawFd},
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    unistd,
};

pub(crate) fn is_supported_os() -> bool {
    cfg!(unix)
}

/// The working directory at the time the first upgrader was created. The
/// successor is spawned from here, so a relative argv[0] keeps resolving to
/// the same binary across upgrades.
static INITIAL_WD: OnceLock<Option<PathBuf>> = OnceLock::new();

pub(crate) fn initial_working_dir() -> Option<&'static Path> {
    INITIAL_WD
        .get_or_init(|| std::env::current_dir().ok())
        .as_deref()
}

/// Duplicate `fd` with `F_DUPFD_CLOEXEC`. The copy shares the open file
/// description, so file status flags (including nonblocking mode) are
/// preserved, while the close-on-exec flag is set atomically.
pub(crate) fn dup_fd(fd: RawFd) -> io::Result<OwnedFd> {
    dup_fd_min(fd, 3)
}

pub(crate) fn dup_fd_min(fd: RawFd, min: RawFd) -> io::Result<OwnedFd> {
    let dup = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(min))?;
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD)?;
    let flags = FdFlag::from_bits_retain(flags) | FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

/// Write the current pid to `path` atomically: temp file in the target
/// directory, then rename. The temp file is removed if anything fails.
pub(crate) fn write_pid_file(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if dir != Path::new("") => dir,
        // A bare file name goes to the directory the process started in.
        _ => initial_working_dir()
            .ok_or_else(|| io::Error::other("can't determine directory for pid file"))?,
    };

    let tmp = tempfile::Builder::new().tempfile_in(dir)?;
    tmp.as_file()
        .write_all(unistd::getpid().to_string().as_bytes())?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Remove a Unix socket from the file system. Sockets in the Linux abstract
/// namespace have no file system presence and are skipped, as is anything
/// at `path` that isn't a socket.
pub(crate) fn unlink_unix_socket(path: &str) -> io::Result<()> {
    if cfg!(target_os = "linux") && path.starts_with('@') {
        return Ok(());
    }

    let metadata = fs::metadata(path)?;
    if !metadata.file_type().is_socket() {
        return Ok(());
    }

    fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn dup_fd_sets_cloexec() {
        let (r, _w) = os_pipe::pipe().unwrap();
        let dup = dup_fd(r.as_raw_fd()).unwrap();

        let flags = fcntl(dup.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_retain(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn pid_file_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");

        write_pid_file(&path).unwrap();

        let pid: i32 = fs::read_to_string(&path).unwrap().parse().unwrap();
        assert_eq!(pid, unistd::getpid().as_raw());

        // Rewriting replaces the file in place, leaving no temp files.
        write_pid_file(&path).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn unlink_skips_non_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        fs::write(&path, b"x").unwrap();

        unlink_unix_socket(path.to_str().unwrap()).unwrap();
        assert!(path.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unlink_skips_abstract_namespace() {
        unlink_unix_socket("@abstract-name").unwrap();
    }
}
