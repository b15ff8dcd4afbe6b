//! Socket, configuration and log paths
//!
//! Unix/macOS: remote sessions listen on Unix domain sockets under
//! `$XDG_RUNTIME_DIR/rdbg` or `/tmp/rdbg-<uid>`.
//! Windows: named pipes `rdbg-<username>-<pid>`.

use std::io;
use std::path::{Path, PathBuf};

/// Name used for directories, sockets and pipes
const APP_NAME: &str = "rdbg";

/// Get the directory holding session sockets
#[cfg(unix)]
pub fn socket_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_NAME);
    }

    // Fallback to /tmp with uid for security
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
}

#[cfg(windows)]
pub fn socket_dir() -> PathBuf {
    PathBuf::new()
}

/// Default socket path for a debuggee process
///
/// Each debugged process gets its own socket so several sessions can be
/// open at the same time.
#[cfg(unix)]
pub fn socket_path_for(pid: u32) -> PathBuf {
    socket_dir().join(format!("{}-{}.sock", APP_NAME, pid))
}

#[cfg(windows)]
pub fn socket_path_for(pid: u32) -> PathBuf {
    let username = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    PathBuf::from(format!("{}-{}-{}", APP_NAME, username, pid))
}

/// Socket name for interprocess, derived from a socket path
pub fn socket_name(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Ensure the socket directory exists with proper permissions
///
/// On Unix, creates the directory with mode 0700 for security
#[cfg(unix)]
pub fn ensure_socket_dir(socket: &Path) -> io::Result<PathBuf> {
    let dir = socket.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "Invalid socket path")
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(dir.to_path_buf())
}

#[cfg(windows)]
pub fn ensure_socket_dir(_socket: &Path) -> io::Result<PathBuf> {
    // Named pipes don't need a directory on Windows
    Ok(PathBuf::new())
}

/// Remove the socket file if it exists (for cleanup)
#[cfg(unix)]
pub fn remove_socket(path: &Path) -> io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(windows)]
pub fn remove_socket(_path: &Path) -> io::Result<()> {
    // Named pipes are automatically cleaned up on Windows
    Ok(())
}

/// List the sockets of currently open sessions
#[cfg(unix)]
pub fn list_sockets() -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(socket_dir()) else {
        return Vec::new();
    };

    let mut sockets: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(APP_NAME) && name.ends_with(".sock"))
                .unwrap_or(false)
        })
        .collect();
    sockets.sort();
    sockets
}

#[cfg(windows)]
pub fn list_sockets() -> Vec<PathBuf> {
    // Named pipes cannot be enumerated portably
    Vec::new()
}

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/rdbg/`
/// - macOS: `~/Library/Application Support/rdbg/`
/// - Windows: `%APPDATA%\rdbg\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_is_per_process() {
        let a = socket_path_for(10);
        let b = socket_path_for(11);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().contains("rdbg"));
    }

    #[test]
    fn test_config_dir_is_valid() {
        let dir = config_dir();
        assert!(dir.is_some());
    }
}
