use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tracing::warn;

use crate::supervisor::SupervisorState;

/// Local web interface served by the managed application while it runs.
pub const WEB_INTERFACE_URL: &str = "http://127.0.0.1:3621";

/// Output lines kept for the snapshot; older lines are dropped first.
pub const OUTPUT_RETENTION: usize = 100;

/// Snapshot written to `status.toml` next to the config file, so a thin UI
/// can render launcher state without talking to the process.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LauncherStatus {
    /// Launcher binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: SupervisorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Release tag recorded in the config, if one is installed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
    /// Only present while the managed application is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub recent_output: VecDeque<String>,
}

impl LauncherStatus {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: SupervisorState::Idle,
            pid: None,
            installed_version: None,
            web_interface: None,
            last_message: None,
            error: None,
            recent_output: VecDeque::with_capacity(OUTPUT_RETENTION),
        }
    }

    /// Records the supervisor's state; the web interface URL follows it.
    pub fn set_state(&mut self, state: SupervisorState, pid: Option<u32>) {
        self.state = state;
        self.pid = pid;
        self.web_interface =
            (state == SupervisorState::Running).then(|| WEB_INTERFACE_URL.to_string());
    }

    pub fn push_output(&mut self, line: String) {
        if self.recent_output.len() == OUTPUT_RETENTION {
            self.recent_output.pop_front();
        }
        self.recent_output.push_back(line);
    }
}

impl Default for LauncherStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes `status` to TOML and writes it to `path`, creating the parent
/// directory if needed. Failures are logged and otherwise ignored.
pub fn write_status(path: &Path, status: &LauncherStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("Failed to write status file {}: {e}", path.display());
            }
        }
        Err(e) => warn!("Failed to serialize status: {e}"),
    }
}
