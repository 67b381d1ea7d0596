use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RunError;

/// A virtual display started for one process and the address its web viewer
/// is reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    /// Value for `DISPLAY`, e.g. `:1`.
    pub display: String,
    pub port: u16,
    pub path: String,
}

/// Fired when a program first draws to its display.
pub type ActivityFn = Arc<dyn Fn(&DisplayInfo) + Send + Sync>;

/// Seam to an external virtual-display/VNC manager.
#[async_trait]
pub trait DisplayProvider: Send + Sync {
    /// Start a display owned by process `id`, optionally for another user.
    async fn start(
        &self,
        id: u32,
        user: Option<&str>,
        on_activity: ActivityFn,
    ) -> Result<DisplayInfo, RunError>;

    async fn stop(&self, id: u32);

    /// `DISPLAY` value of a display that is already running on this machine,
    /// given to programs that did not ask for their own.
    fn first_running_display(&self) -> Option<String>;
}

/// Provider for machines without a display manager. It cannot start
/// displays but reports X servers found on the local socket directory.
#[derive(Debug, Clone)]
pub struct LocalDisplays {
    socket_dir: PathBuf,
}

impl LocalDisplays {
    pub fn new() -> Self {
        Self::with_socket_dir("/tmp/.X11-unix")
    }

    pub fn with_socket_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: dir.into(),
        }
    }
}

impl Default for LocalDisplays {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DisplayProvider for LocalDisplays {
    async fn start(
        &self,
        _id: u32,
        _user: Option<&str>,
        _on_activity: ActivityFn,
    ) -> Result<DisplayInfo, RunError> {
        Err(RunError::Unsupported("virtual displays"))
    }

    async fn stop(&self, _id: u32) {}

    fn first_running_display(&self) -> Option<String> {
        lowest_x_display(&self.socket_dir).map(|n| format!(":{n}"))
    }
}

/// X servers listen on `X<n>` sockets; pick the lowest display number.
fn lowest_x_display(dir: &Path) -> Option<u32> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            name.to_str()?.strip_prefix('X')?.parse::<u32>().ok()
        })
        .min()
}
