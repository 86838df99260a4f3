use chrono::NaiveDateTime;
use ini::Ini;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MANAGED_SECTION: &str = "mac";
pub const LAUNCHER_SECTION: &str = "launcher";
const VERSION_KEY: &str = "version";
const LAST_UPDATE_CHECK_KEY: &str = "last_update_check";
const COMPANION_KEY: &str = "tf2_checkbox";

/// Format of `last_update_check` on disk.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
/// Accepts any number of fractional digits when reading.
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: ini::ParseError,
    },
}

/// Root of the persisted record. Stored as INI at the config location.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LauncherConfig {
    pub managed: ManagedAppSection,
    pub launcher: PreferenceSection,
}

/// `[mac]`: what the release client last installed and when it last looked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagedAppSection {
    /// Raw tag of the installed release. Empty means not installed.
    pub version: String,
    pub last_update_check: Option<NaiveDateTime>,
}

impl ManagedAppSection {
    /// The installed tag, or `None` if the stored value has no digit in it.
    pub fn installed_version(&self) -> Option<&str> {
        let version = self.version.trim();
        version
            .chars()
            .any(|c| c.is_ascii_digit())
            .then_some(version)
    }
}

/// `[launcher]`: UI preferences.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferenceSection {
    /// Also start the companion game when launching.
    pub launch_companion: bool,
}

impl LauncherConfig {
    fn from_ini(ini: &Ini) -> Self {
        let managed = ini.section(Some(MANAGED_SECTION));
        let launcher = ini.section(Some(LAUNCHER_SECTION));

        let version = managed
            .and_then(|s| s.get(VERSION_KEY))
            .unwrap_or_default()
            .to_string();
        let last_update_check = managed
            .and_then(|s| s.get(LAST_UPDATE_CHECK_KEY))
            .and_then(parse_timestamp);
        let launch_companion = launcher
            .and_then(|s| s.get(COMPANION_KEY))
            .map(parse_bool)
            .unwrap_or(false);

        Self {
            managed: ManagedAppSection {
                version,
                last_update_check,
            },
            launcher: PreferenceSection { launch_companion },
        }
    }

    fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        let last_check = self
            .managed
            .last_update_check
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default();
        ini.with_section(Some(MANAGED_SECTION))
            .set(VERSION_KEY, self.managed.version.as_str())
            .set(LAST_UPDATE_CHECK_KEY, last_check);
        ini.with_section(Some(LAUNCHER_SECTION)).set(
            COMPANION_KEY,
            if self.launcher.launch_companion { "True" } else { "False" },
        );
        ini
    }

    pub fn parse(content: &str) -> Result<Self, ini::ParseError> {
        Ini::load_from_str(content).map(|ini| Self::from_ini(&ini))
    }

    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.to_ini().write_to(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if !raw.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    match NaiveDateTime::parse_from_str(raw, TIMESTAMP_PARSE_FORMAT) {
        Ok(t) => Some(t),
        Err(e) => {
            warn!("Ignoring unreadable last_update_check {raw:?}: {e}");
            None
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => true,
        "0" | "no" | "false" | "off" | "" => false,
        other => {
            warn!("Ignoring unrecognised boolean {other:?}");
            false
        }
    }
}

/// How a successful [`ConfigStore::load`] came by its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// The file was absent and a default record was written.
    Created,
    /// The file existed and parsed cleanly.
    Existing,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: LauncherConfig,
    pub origin: ConfigOrigin,
}

/// Single-writer access to the config file. Every read and write takes the
/// same lock so concurrent operations cannot lose each other's updates.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the record, creating a default file first if none exists.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let _guard = self.guard();
        self.load_locked()
    }

    /// Overwrites the whole file with `config`.
    pub fn save(&self, config: &LauncherConfig) -> Result<(), ConfigError> {
        let _guard = self.guard();
        self.write_locked(config)
    }

    /// Writes a record with no version, no last check and preferences off.
    pub fn create_default(&self) -> Result<LauncherConfig, ConfigError> {
        let _guard = self.guard();
        let config = LauncherConfig::default();
        self.write_locked(&config)?;
        Ok(config)
    }

    /// Read-modify-write under one lock acquisition.
    pub fn update<F>(&self, mutate: F) -> Result<LauncherConfig, ConfigError>
    where
        F: FnOnce(&mut LauncherConfig),
    {
        let _guard = self.guard();
        let mut config = self.load_locked()?.config;
        mutate(&mut config);
        self.write_locked(&config)?;
        Ok(config)
    }

    /// Deletes the file (absent is fine) and writes a fresh default.
    pub fn reset(&self) -> Result<LauncherConfig, ConfigError> {
        let _guard = self.guard();
        remove_if_exists(&self.path).map_err(|source| self.io_error(source))?;
        let config = LauncherConfig::default();
        self.write_locked(&config)?;
        info!("Config reset to defaults at {}", self.path.display());
        Ok(config)
    }

    pub fn set_companion_preference(&self, enabled: bool) -> Result<(), ConfigError> {
        self.update(|cfg| cfg.launcher.launch_companion = enabled)
            .map(|_| ())
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_locked(&self) -> Result<LoadedConfig, ConfigError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No config at {}, creating default", self.path.display());
                let config = LauncherConfig::default();
                self.write_locked(&config)?;
                return Ok(LoadedConfig {
                    config,
                    origin: ConfigOrigin::Created,
                });
            }
            Err(source) => return Err(self.io_error(source)),
        };

        let config = LauncherConfig::parse(&content).map_err(|source| ConfigError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(LoadedConfig {
            config,
            origin: ConfigOrigin::Existing,
        })
    }

    fn write_locked(&self, config: &LauncherConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        // Staged beside the target and renamed over it; the file on disk is
        // always a complete record.
        let staging = self.staging_path();
        let written = std::fs::File::create(&staging).and_then(|mut file| {
            file.write_all(config.render().as_bytes())?;
            file.sync_all()
        });
        if let Err(source) = written {
            let _ = remove_if_exists(&staging);
            return Err(self.io_error(source));
        }
        std::fs::rename(&staging, &self.path).map_err(|source| {
            let _ = remove_if_exists(&staging);
            self.io_error(source)
        })
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: io::Error) -> ConfigError {
        ConfigError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// `remove_file` that treats a missing file as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
