//! Update check and install workflow for the managed application.

use chrono::{Local, NaiveDateTime, TimeDelta};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{remove_if_exists, ConfigError, ConfigStore};
use crate::paths::Locations;
use crate::release::{select_asset, FeedError, Platform, ReleaseFeed};

/// Minimum time between automatic checks triggered by a launch.
pub const UPDATE_CHECK_INTERVAL: TimeDelta = TimeDelta::days(1);

const PARTIAL_SUFFIX: &str = "part";

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no tags published upstream")]
    NoTags,
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("download failed: {0}")]
    Download(#[source] FeedError),
    #[error("release {tag} has no asset for this platform")]
    NoMatchingAsset { tag: String },
    #[error("failed to install {}: {source}", path.display())]
    Install {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl UpdateError {
    /// Text shown to the user for failures that do not propagate.
    pub fn user_message(&self) -> String {
        match self {
            UpdateError::NoTags | UpdateError::Feed(_) => {
                format!("Failed to check for updates: {self}.")
            }
            UpdateError::NoMatchingAsset { .. } => "No proper release assets found.".to_string(),
            UpdateError::Download(_) | UpdateError::Install { .. } => {
                format!("Failed to install update: {self}.")
            }
            UpdateError::Config(e) => format!("Config error: {e}."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// No executable existed before.
    Installed { tag: String },
    /// An older executable was moved to the backup path.
    Updated { tag: String },
    UpToDate,
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOutcome::Installed { tag } => write!(f, "Installed MAC {tag}."),
            UpdateOutcome::Updated { tag } => write!(f, "Updated to MAC {tag}."),
            UpdateOutcome::UpToDate => f.write_str("Up to date."),
        }
    }
}

/// True when a launch should run an update check first.
pub fn needs_update_check(
    last_check: Option<NaiveDateTime>,
    now: NaiveDateTime,
    executable_exists: bool,
) -> bool {
    match last_check {
        None => true,
        Some(last) => now >= last + UPDATE_CHECK_INTERVAL || !executable_exists,
    }
}

/// Checks the feed and installs new releases. Runs are serialized so two
/// callers never download over each other.
pub struct Updater {
    feed: Arc<dyn ReleaseFeed>,
    store: Arc<ConfigStore>,
    locations: Locations,
    platform: Platform,
    running: Mutex<()>,
}

impl Updater {
    pub fn new(feed: Arc<dyn ReleaseFeed>, store: Arc<ConfigStore>, locations: Locations) -> Self {
        Self::with_platform(feed, store, locations, Platform::current())
    }

    pub fn with_platform(
        feed: Arc<dyn ReleaseFeed>,
        store: Arc<ConfigStore>,
        locations: Locations,
        platform: Platform,
    ) -> Self {
        Self {
            feed,
            store,
            locations,
            platform,
            running: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Whether a launch right now should check for updates first.
    pub fn due(&self) -> Result<bool, ConfigError> {
        let config = self.store.load()?.config;
        Ok(needs_update_check(
            config.managed.last_update_check,
            Local::now().naive_local(),
            self.locations.executable.exists(),
        ))
    }

    /// Runs one check and returns a message for the user. Remote and
    /// install failures are folded into the message; config failures are
    /// returned as errors.
    pub async fn check_for_updates(&self) -> Result<String, ConfigError> {
        let _running = self.running.lock().await;
        summarize(self.check_locked().await)
    }

    /// Deletes the executable, its backup and the config, recreates the
    /// default config, then checks for updates.
    pub async fn reinstall(&self) -> Result<String, ConfigError> {
        let _running = self.running.lock().await;
        for path in [&self.locations.executable, &self.locations.backup] {
            if let Err(e) = remove_if_exists(path) {
                warn!("Failed to remove {}: {e}", path.display());
                return Ok(format!("Failed to remove {}: {e}.", path.display()));
            }
        }
        self.store.reset()?;
        info!("Cleared managed application state, reinstalling");
        summarize(self.check_locked().await)
    }

    async fn check_locked(&self) -> Result<UpdateOutcome, UpdateError> {
        let tag = self.feed.latest_tag().await?.ok_or(UpdateError::NoTags)?;
        let installed = self
            .store
            .load()?
            .config
            .managed
            .installed_version()
            .map(str::to_string);

        let assets = self.feed.release_assets(&tag).await?;
        let asset = select_asset(&assets, self.platform)
            .ok_or_else(|| UpdateError::NoMatchingAsset { tag: tag.clone() })?;

        // Recorded before deciding whether to download so a launch within the
        // next day does not ask again.
        self.store
            .update(|cfg| cfg.managed.last_update_check = Some(Local::now().naive_local()))?;

        let executable = &self.locations.executable;
        let had_executable = executable.exists();
        if installed.as_deref() == Some(tag.as_str()) && had_executable {
            info!("MAC {tag} is up to date");
            return Ok(UpdateOutcome::UpToDate);
        }

        info!(
            "Installing MAC {tag} (installed: {})",
            installed.as_deref().unwrap_or("none")
        );
        self.install(&asset.browser_download_url).await?;
        self.store.update(|cfg| cfg.managed.version = tag.clone())?;

        Ok(if had_executable {
            UpdateOutcome::Updated { tag }
        } else {
            UpdateOutcome::Installed { tag }
        })
    }

    /// Downloads next to the executable, then swaps it in, keeping the old
    /// binary as the backup.
    async fn install(&self, url: &str) -> Result<(), UpdateError> {
        let executable = &self.locations.executable;
        let backup = &self.locations.backup;
        let install_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| UpdateError::Install { path, source }
        };

        if let Some(parent) = executable.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(install_err(parent))?;
        }

        let partial = partial_path(executable);
        if let Err(e) = self.feed.download(url, &partial).await {
            let _ = remove_if_exists(&partial);
            return Err(UpdateError::Download(e));
        }

        if executable.exists() {
            // rename() does not replace an existing target on Windows.
            remove_if_exists(backup).map_err(install_err(backup))?;
            tokio::fs::rename(executable, backup)
                .await
                .map_err(install_err(backup))?;
        }
        tokio::fs::rename(&partial, executable)
            .await
            .map_err(install_err(executable))?;
        make_executable(executable).map_err(install_err(executable))?;
        Ok(())
    }
}

fn summarize(result: Result<UpdateOutcome, UpdateError>) -> Result<String, ConfigError> {
    match result {
        Ok(outcome) => Ok(outcome.to_string()),
        Err(UpdateError::Config(e)) => Err(e),
        Err(e) => {
            warn!("Update check failed: {e}");
            Ok(e.user_message())
        }
    }
}

fn partial_path(executable: &Path) -> PathBuf {
    let mut name = executable
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    executable.with_file_name(name)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o100);
    std::fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::FakeFeed;
    use super::*;
    use crate::config::LauncherConfig;
    use crate::release::Asset;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn updater(dir: &tempfile::TempDir, feed: Arc<FakeFeed>) -> (Updater, Locations) {
        let locations = Locations::in_dir(dir.path());
        let store = Arc::new(ConfigStore::new(&locations.config));
        let updater =
            Updater::with_platform(feed, store, locations.clone(), Platform::Linux);
        (updater, locations)
    }

    fn seed(locations: &Locations, version: &str, binary: Option<&str>) {
        let store = ConfigStore::new(&locations.config);
        store
            .update(|cfg| cfg.managed.version = version.to_string())
            .unwrap();
        if let Some(binary) = binary {
            std::fs::write(&locations.executable, binary).unwrap();
        }
    }

    fn stored(locations: &Locations) -> LauncherConfig {
        ConfigStore::new(&locations.config).load().unwrap().config
    }

    // ── needs_update_check ────────────────────────────────────────────────────

    #[test]
    fn never_checked_needs_check() {
        assert!(needs_update_check(None, at(2, 0), true));
    }

    #[test]
    fn recent_check_with_executable_skips() {
        assert!(!needs_update_check(Some(at(1, 12)), at(2, 11), true));
    }

    #[test]
    fn check_is_due_after_a_day() {
        assert!(needs_update_check(Some(at(1, 12)), at(2, 12), true));
    }

    #[test]
    fn missing_executable_forces_check() {
        assert!(needs_update_check(Some(at(1, 12)), at(1, 13), false));
    }

    // ── check_for_updates ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn newer_tag_updates_and_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(FakeFeed::serving("v1.1"));
        let (updater, locations) = updater(&dir, Arc::clone(&feed));
        seed(&locations, "v1.0", Some("binary v1.0"));

        let message = updater.check_for_updates().await.unwrap();

        assert!(message.contains("Updated"), "{message}");
        assert_eq!(
            std::fs::read_to_string(&locations.executable).unwrap(),
            "binary v1.1"
        );
        assert_eq!(
            std::fs::read_to_string(&locations.backup).unwrap(),
            "binary v1.0"
        );
        let config = stored(&locations);
        assert_eq!(config.managed.version, "v1.1");
        assert!(config.managed.last_update_check.is_some());
    }

    #[tokio::test]
    async fn missing_executable_is_installed() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(FakeFeed::serving("v2"));
        let (updater, locations) = updater(&dir, feed);

        let message = updater.check_for_updates().await.unwrap();

        assert_eq!(message, "Installed MAC v2.");
        assert!(locations.executable.exists());
        assert!(!locations.backup.exists());
        assert_eq!(stored(&locations).managed.version, "v2");
    }

    #[tokio::test]
    async fn same_tag_is_up_to_date_but_records_check() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(FakeFeed::serving("v1.0"));
        let (updater, locations) = updater(&dir, Arc::clone(&feed));
        seed(&locations, "v1.0", Some("binary v1.0"));

        let message = updater.check_for_updates().await.unwrap();

        assert_eq!(message, "Up to date.");
        // tags + assets, no download
        assert_eq!(feed.calls(), 2);
        assert!(stored(&locations).managed.last_update_check.is_some());
        assert!(!locations.backup.exists());
    }

    #[tokio::test]
    async fn same_tag_but_missing_executable_reinstalls() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(FakeFeed::serving("v1.0"));
        let (updater, locations) = updater(&dir, feed);
        seed(&locations, "v1.0", None);

        let message = updater.check_for_updates().await.unwrap();
        assert_eq!(message, "Installed MAC v1.0.");
    }

    #[tokio::test]
    async fn rate_limit_leaves_config_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut feed = FakeFeed::serving("v1.1");
        feed.rate_limited = true;
        let (updater, locations) = updater(&dir, Arc::new(feed));
        seed(&locations, "v1.0", Some("binary v1.0"));
        let before = std::fs::read(&locations.config).unwrap();

        let message = updater.check_for_updates().await.unwrap();

        assert!(message.starts_with("Failed to check for updates"), "{message}");
        assert!(message.contains("rate limit"), "{message}");
        assert_eq!(std::fs::read(&locations.config).unwrap(), before);
    }

    #[tokio::test]
    async fn no_tags_fails_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut feed = FakeFeed::serving("unused");
        feed.tag = None;
        let (updater, locations) = updater(&dir, Arc::new(feed));
        seed(&locations, "v1.0", None);
        let before = std::fs::read(&locations.config).unwrap();

        let message = updater.check_for_updates().await.unwrap();

        assert!(message.starts_with("Failed to check for updates"), "{message}");
        assert_eq!(std::fs::read(&locations.config).unwrap(), before);
    }

    #[tokio::test]
    async fn no_matching_asset_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut feed = FakeFeed::serving("v1.1");
        feed.assets = vec![Asset {
            browser_download_url: "https://example.com/source.tar.gz".to_string(),
        }];
        let (updater, locations) = updater(&dir, Arc::new(feed));

        let message = updater.check_for_updates().await.unwrap();

        assert_eq!(message, "No proper release assets found.");
        assert!(!locations.executable.exists());
    }

    #[tokio::test]
    async fn failed_download_keeps_old_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut feed = FakeFeed::serving("v1.1");
        feed.fail_download = true;
        let (updater, locations) = updater(&dir, Arc::new(feed));
        seed(&locations, "v1.0", Some("binary v1.0"));

        let message = updater.check_for_updates().await.unwrap();

        assert!(message.starts_with("Failed to install update"), "{message}");
        assert!(message.contains("connection reset"), "{message}");
        assert_eq!(
            std::fs::read_to_string(&locations.executable).unwrap(),
            "binary v1.0"
        );
        assert!(!partial_path(&locations.executable).exists());
        assert_eq!(stored(&locations).managed.version, "v1.0");
    }

    #[tokio::test]
    async fn corrupt_config_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(FakeFeed::serving("v1.1"));
        let (updater, locations) = updater(&dir, feed);
        std::fs::write(&locations.config, "[mac\nversion = \"x\n").unwrap();

        let err = updater.check_for_updates().await.unwrap_err();
        assert!(matches!(err, ConfigError::Corrupt { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn installed_binary_is_user_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let (updater, locations) = updater(&dir, Arc::new(FakeFeed::serving("v1")));
        updater.check_for_updates().await.unwrap();

        let mode = std::fs::metadata(&locations.executable)
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(mode & 0o100, 0);
    }

    // ── due ───────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn due_after_fresh_check_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let (updater, _locations) = updater(&dir, Arc::new(FakeFeed::serving("v1")));
        assert!(updater.due().unwrap());
        updater.check_for_updates().await.unwrap();
        assert!(!updater.due().unwrap());
    }

    // ── reinstall ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reinstall_wipes_state_before_checking() {
        let dir = tempfile::tempdir().unwrap();
        let locations = Locations::in_dir(dir.path());
        let mut feed = FakeFeed::serving("v3");
        feed.watched = Some((
            locations.executable.clone(),
            locations.backup.clone(),
            locations.config.clone(),
        ));
        let feed = Arc::new(feed);
        let (updater, locations) = updater(&dir, Arc::clone(&feed));
        seed(&locations, "v2", Some("binary v2"));
        std::fs::write(&locations.backup, "binary v1").unwrap();

        let message = updater.reinstall().await.unwrap();

        let snapshot = feed.snapshot.lock().unwrap().clone().unwrap();
        assert!(!snapshot.executable);
        assert!(!snapshot.backup);
        let config = LauncherConfig::parse(&snapshot.config.unwrap()).unwrap();
        assert_eq!(config, LauncherConfig::default());

        assert_eq!(message, "Installed MAC v3.");
        assert_eq!(stored(&locations).managed.version, "v3");
    }

    #[tokio::test]
    async fn stalled_download_fails_the_check() {
        use crate::release::testing::{serve_with, Route};
        use crate::release::GithubFeed;
        use std::time::Duration;

        let base = serve_with(|base| {
            let mut asset = Route::ok("/download/client_backend", vec![0u8; 8192]);
            asset.stall = true;
            vec![
                Route::ok("/repos/owner/repo/tags", r#"[{"name":"v2"}]"#),
                Route::ok(
                    "/repos/owner/repo/releases/tags/v2",
                    format!(r#"{{"assets":[{{"browser_download_url":"{base}/download/client_backend"}}]}}"#),
                ),
                asset,
            ]
        })
        .await;
        let feed = GithubFeed::with_read_timeout(base, "owner", "repo", Duration::from_millis(300))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let locations = Locations::in_dir(dir.path());
        let store = Arc::new(ConfigStore::new(&locations.config));
        let updater = Updater::with_platform(Arc::new(feed), store, locations.clone(), Platform::Linux);
        seed(&locations, "v1", Some("binary v1"));

        let message = tokio::time::timeout(Duration::from_secs(10), updater.check_for_updates())
            .await
            .expect("a stalled download must not hang the check")
            .unwrap();

        assert!(message.starts_with("Failed to install update"), "{message}");
        assert_eq!(std::fs::read_to_string(&locations.executable).unwrap(), "binary v1");
        assert!(!partial_path(&locations.executable).exists());
    }
}
