/// Canonical file paths for the launcher and the managed application.
///
/// On Windows everything lives under %APPDATA%\megalauncher\:
///   - client_backend.exe      The managed application binary.
///   - client_backend.exe.bak  The binary replaced by the most recent update.
///   - config.ini              Installed version, last update check, UI preferences.
///   - status.toml             Written by the launcher for a thin UI.
///
/// Elsewhere the binary goes to ~/.local/bin/ and the config directory is
/// ~/.config/megalauncher/.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const APP_DIR_NAME: &str = "megalauncher";
pub const EXECUTABLE_STEM: &str = "client_backend";
pub const CONFIG_FILE_NAME: &str = "config.ini";
pub const STATUS_FILE_NAME: &str = "status.toml";
const BACKUP_SUFFIX: &str = "bak";

/// Symbolic keys accepted by [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Executable,
    Backup,
    Config,
    Status,
}

/// A complete set of resolved paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    pub executable: PathBuf,
    pub backup: PathBuf,
    pub config: PathBuf,
    pub status: PathBuf,
}

impl Locations {
    /// Platform default locations, computed once per process.
    pub fn platform() -> &'static Locations {
        static PLATFORM: OnceLock<Locations> = OnceLock::new();
        PLATFORM.get_or_init(platform_locations)
    }

    /// Flat layout with every file directly under `root`.
    pub fn in_dir(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self::from_parts(root.join(executable_file_name()), root.join(CONFIG_FILE_NAME))
    }

    fn from_parts(executable: PathBuf, config: PathBuf) -> Self {
        let status = config.with_file_name(STATUS_FILE_NAME);
        Self {
            backup: backup_path(&executable),
            executable,
            config,
            status,
        }
    }

    pub fn get(&self, location: Location) -> &Path {
        match location {
            Location::Executable => &self.executable,
            Location::Backup => &self.backup,
            Location::Config => &self.config,
            Location::Status => &self.status,
        }
    }
}

/// Resolves `location` against the memoized platform defaults.
pub fn resolve(location: Location) -> &'static Path {
    Locations::platform().get(location)
}

/// `client_backend` plus the platform executable suffix.
pub fn executable_file_name() -> String {
    format!("{EXECUTABLE_STEM}{}", std::env::consts::EXE_SUFFIX)
}

/// Sibling of `executable` with `.bak` appended to the full file name.
pub fn backup_path(executable: &Path) -> PathBuf {
    let mut name = executable
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    executable.with_file_name(name)
}

#[cfg(windows)]
fn platform_locations() -> Locations {
    // dirs::config_dir() is the roaming %APPDATA% folder on Windows.
    let root = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME);
    Locations::in_dir(root)
}

#[cfg(not(windows))]
fn platform_locations() -> Locations {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    Locations::from_parts(
        home.join(".local").join("bin").join(executable_file_name()),
        home.join(".config").join(APP_DIR_NAME).join(CONFIG_FILE_NAME),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_dir_places_every_file_under_root() {
        let locations = Locations::in_dir("/tmp/launcher");
        for path in [
            &locations.executable,
            &locations.backup,
            &locations.config,
            &locations.status,
        ] {
            assert_eq!(path.parent().unwrap(), Path::new("/tmp/launcher"));
        }
    }

    #[test]
    fn executable_name_has_platform_suffix() {
        let locations = Locations::in_dir("root");
        let name = locations.executable.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(EXECUTABLE_STEM));
        assert!(name.ends_with(std::env::consts::EXE_SUFFIX));
    }

    #[test]
    fn backup_appends_bak_to_full_file_name() {
        let backup = backup_path(Path::new("dir/client_backend.exe"));
        assert_eq!(backup, Path::new("dir/client_backend.exe.bak"));

        let backup = backup_path(Path::new("dir/client_backend"));
        assert_eq!(backup, Path::new("dir/client_backend.bak"));
    }

    #[test]
    fn config_and_status_share_same_parent_dir() {
        let locations = Locations::platform();
        assert_eq!(locations.config.parent(), locations.status.parent());
        assert_eq!(locations.config.file_name().unwrap(), CONFIG_FILE_NAME);
    }

    #[test]
    fn platform_locations_are_memoized() {
        let first = Locations::platform() as *const Locations;
        let second = Locations::platform() as *const Locations;
        assert_eq!(first, second);
        assert_eq!(resolve(Location::Config), Locations::platform().config.as_path());
    }

    #[test]
    fn get_maps_each_key() {
        let locations = Locations::in_dir("root");
        assert_eq!(locations.get(Location::Executable), locations.executable.as_path());
        assert_eq!(locations.get(Location::Backup), locations.backup.as_path());
        assert_eq!(locations.get(Location::Config), locations.config.as_path());
        assert_eq!(locations.get(Location::Status), locations.status.as_path());
    }

    #[cfg(not(windows))]
    #[test]
    fn unix_executable_lives_in_local_bin() {
        let exe = resolve(Location::Executable);
        assert!(exe.ends_with(".local/bin/client_backend"));
        assert!(resolve(Location::Config).ends_with(".config/megalauncher/config.ini"));
    }
}
