use std::path::{Path, PathBuf};

/// Environment variable overriding the side-channel socket directory.
pub const IPC_DIR_ENV: &str = "RUNLINK_IPC_DIR";

/// Returns the directory holding side-channel sockets.
pub fn default_ipc_dir() -> PathBuf {
    match std::env::var_os(IPC_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    }
}

/// Socket path for one side channel of one process group.
pub fn ipc_socket_path(dir: &Path, pgid: i32, channel: &str) -> PathBuf {
    dir.join(format!("{pgid}.{channel}.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_convention() {
        assert_eq!(
            ipc_socket_path(Path::new("/tmp"), 4242, "video"),
            PathBuf::from("/tmp/4242.video.sock")
        );
    }
}
