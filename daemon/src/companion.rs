use anyhow::{Context, Result};
use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

#[cfg(windows)]
const TF2_PROCESS_NAME: &str = "tf_win64";
#[cfg(not(windows))]
const TF2_PROCESS_NAME: &str = "tf_linux64";
const TF2_LAUNCH_URI: &str = "steam://rungameid/440";

/// Application started alongside the managed one, via a URI handed to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Companion {
    pub display_name: String,
    /// Matched case-insensitively as a substring of running process names.
    pub process_name: String,
    pub launch_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionLaunch {
    AlreadyRunning,
    Started,
}

impl Default for Companion {
    fn default() -> Self {
        Self {
            display_name: "TF2".to_string(),
            process_name: TF2_PROCESS_NAME.to_string(),
            launch_uri: TF2_LAUNCH_URI.to_string(),
        }
    }
}

impl Companion {
    /// Scans the OS process list for a name containing `process_name`.
    pub fn is_running(&self) -> bool {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, false);
        let target = self.process_name.to_lowercase();
        sys.processes()
            .values()
            .any(|p| p.name().to_string_lossy().to_lowercase().contains(&target))
    }

    /// Starts the companion unless it is already running.
    pub fn launch(&self) -> Result<CompanionLaunch> {
        if self.is_running() {
            return Ok(CompanionLaunch::AlreadyRunning);
        }
        debug!("Opening {}", self.launch_uri);
        open::that_detached(&self.launch_uri)
            .with_context(|| format!("Failed to open {}", self.launch_uri))?;
        Ok(CompanionLaunch::Started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_targets_tf2() {
        let companion = Companion::default();
        assert_eq!(companion.launch_uri, "steam://rungameid/440");
        assert!(companion.process_name.starts_with("tf_"));
    }

    #[test]
    fn detects_own_test_process() {
        let own = std::env::current_exe().unwrap();
        let stem = own.file_stem().unwrap().to_string_lossy();
        // Kernel process names can be truncated, so match on a short prefix.
        let prefix: String = stem.chars().take(8).collect();
        let companion = Companion {
            display_name: "self".to_string(),
            process_name: prefix.to_uppercase(),
            launch_uri: String::new(),
        };
        assert!(companion.is_running());
    }

    #[test]
    fn unknown_process_is_not_running() {
        let companion = Companion {
            display_name: "ghost".to_string(),
            process_name: "no-such-process-4a1f9c".to_string(),
            launch_uri: String::new(),
        };
        assert!(!companion.is_running());
    }

    #[test]
    fn running_companion_is_not_relaunched() {
        let own = std::env::current_exe().unwrap();
        let prefix: String = own
            .file_stem()
            .unwrap()
            .to_string_lossy()
            .chars()
            .take(8)
            .collect();
        let companion = Companion {
            display_name: "self".to_string(),
            process_name: prefix,
            launch_uri: "invalid://never-opened".to_string(),
        };
        assert_eq!(companion.launch().unwrap(), CompanionLaunch::AlreadyRunning);
    }
}
