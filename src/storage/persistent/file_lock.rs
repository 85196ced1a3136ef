//! Single-owner guard for a database directory.
//!
//! [`FileLock::acquire`] takes an advisory lock on [`LOCK_FILE`] and records
//! the owning process ID in it. A second acquire, from this process or
//! another, fails at once with `WouldBlock` and names the current owner when
//! it can read one.

use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::process;

/// Name of the lock file inside a database directory.
pub const LOCK_FILE: &str = ".lock";

/// Held lock on a database directory; released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Lock `dir` for this handle.
    ///
    /// # Errors
    /// `WouldBlock` if the directory is already locked; any I/O error from
    /// creating or writing the lock file.
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = Self::try_lock(&file) {
            if e.kind() != ErrorKind::WouldBlock {
                return Err(e);
            }
            let owner = fs::read_to_string(&path)
                .ok()
                .map(|pid| pid.trim().to_string())
                .filter(|pid| !pid.is_empty());
            let msg = match owner {
                Some(pid) => format!("database is locked by another handle (pid {pid})"),
                None => "database is locked by another handle".to_string(),
            };
            return Err(IoError::new(ErrorKind::WouldBlock, msg));
        }

        file.set_len(0)?;
        writeln!(file, "{}", process::id())?;

        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: the descriptor stays owned by `file` for the whole call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(());
        }
        let err = IoError::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(IoError::new(ErrorKind::WouldBlock, err));
        }
        Err(err)
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };
        use windows_sys::Win32::System::IO::OVERLAPPED;

        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: `handle` is owned by `file`; a zeroed OVERLAPPED locks from offset 0.
        let ok = unsafe {
            let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(());
        }
        let err = IoError::last_os_error();
        #[allow(clippy::cast_possible_wrap)]
        let violation = ERROR_LOCK_VIOLATION as i32;
        if err.raw_os_error() == Some(violation) {
            return Err(IoError::new(ErrorKind::WouldBlock, err));
        }
        Err(err)
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> IoResult<()> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "directory locking is not supported on this platform",
        ))
    }
}
