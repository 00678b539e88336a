use std::env;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Name of the socket file under every default location.
pub const SOCKET_FILE_NAME: &str = "secret-storage.sock";

/// Mode required on the directory holding the socket.
const DIRECTORY_MODE: u32 = 0o700;

pub type AddrResult<T> = Result<T, AddrError>;

/// Errors raised while resolving and validating the server socket path.
#[derive(Debug, Eq, PartialEq)]
pub enum AddrError {
    /// The socket path already exists on the filesystem.
    Occupied,
    /// The parent directory belongs to someone else and could not be
    /// reclaimed.
    ForeignOwner,
    /// The parent directory permissions are too wide and could not be
    /// restricted.
    InsecureMode,
    /// No resolution rule produced a usable path.
    Unresolvable,
    Io(io::ErrorKind),
}

impl From<io::Error> for AddrError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        AddrError::Io(io_error.kind())
    }
}

/// Resolves the socket path: the explicit argument first, then
/// `$XDG_RUNTIME_DIR`, then `$HOME/.local/run`, then the current
/// directory. The parent directory is validated (and, with `create_dirs`,
/// created) before the path is handed out; the runtime directory is
/// managed by the system and is never created here regardless.
///
/// `create_dirs` is passed by the server; clients only validate.
pub fn resolve(explicit: Option<&Path>, create_dirs: bool) -> AddrResult<PathBuf> {
    if let Some(path) = explicit {
        return secure(path.to_path_buf(), create_dirs);
    }

    if let Some(runtime_dir) = env::var_os("XDG_RUNTIME_DIR") {
        return secure(PathBuf::from(runtime_dir).join(SOCKET_FILE_NAME), false);
    }

    if let Some(home) = env::var_os("HOME") {
        let path = PathBuf::from(home).join(".local/run").join(SOCKET_FILE_NAME);
        return secure(path, create_dirs);
    }

    let current = env::current_dir()?;
    secure(current.join(SOCKET_FILE_NAME), create_dirs)
}

/// Validates the parent directory of `path`: it must exist (or be created
/// mode 0700), belong to the effective uid/gid and carry mode 0700.
/// Ownership and mode violations are fixed up where possible and refused
/// otherwise.
fn secure(path: PathBuf, create_dirs: bool) -> AddrResult<PathBuf> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => return Err(AddrError::Unresolvable),
    };

    if create_dirs && !parent.exists() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIRECTORY_MODE)
            .create(&parent)?;
    }

    let metadata = fs::metadata(&parent)?;
    let uid = unsafe { libc::geteuid() };
    let gid = unsafe { libc::getegid() };

    if metadata.uid() != uid || metadata.gid() != gid {
        reclaim(&parent, uid, gid)?;
    }

    if metadata.mode() & 0o777 != DIRECTORY_MODE {
        fs::set_permissions(&parent, fs::Permissions::from_mode(DIRECTORY_MODE))
            .map_err(|_| AddrError::InsecureMode)?;
    }

    Ok(path)
}

fn reclaim(parent: &Path, uid: libc::uid_t, gid: libc::gid_t) -> AddrResult<()> {
    let parent = CString::new(parent.as_os_str().as_bytes()).map_err(|_| AddrError::Unresolvable)?;

    if unsafe { libc::chown(parent.as_ptr(), uid, gid) } == -1 {
        return Err(AddrError::ForeignOwner);
    }

    Ok(())
}
