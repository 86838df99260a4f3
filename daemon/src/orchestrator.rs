//! The `Launcher` context: config, updater and supervisor wired together.
//! Owned by `main` and shared with background tasks behind an `Arc`.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::companion::Companion;
use crate::config::{ConfigError, ConfigStore, LoadedConfig};
use crate::event::LauncherEvent;
use crate::paths::Locations;
use crate::release::ReleaseFeed;
use crate::supervisor::{LaunchOutcome, Supervisor};
use crate::updater::Updater;

pub const REINSTALL_WHILE_RUNNING: &str = "Stop MAC before reinstalling.";

pub struct Launcher {
    locations: Locations,
    store: Arc<ConfigStore>,
    updater: Arc<Updater>,
    supervisor: Supervisor,
}

impl Launcher {
    pub fn new(locations: Locations, feed: Arc<dyn ReleaseFeed>, companion: Companion) -> Self {
        let store = Arc::new(ConfigStore::new(&locations.config));
        let updater = Arc::new(Updater::new(feed, Arc::clone(&store), locations.clone()));
        let supervisor = Supervisor::new(&locations.executable, Arc::clone(&updater), companion);
        Self::from_parts(locations, updater, supervisor)
    }

    /// Assembles a launcher from an existing updater and supervisor.
    pub fn from_parts(locations: Locations, updater: Arc<Updater>, supervisor: Supervisor) -> Self {
        Self {
            locations,
            store: Arc::clone(updater.store()),
            updater,
            supervisor,
        }
    }

    pub fn locations(&self) -> &Locations {
        &self.locations
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn load_config(&self) -> Result<LoadedConfig, ConfigError> {
        self.store.load()
    }

    pub fn companion_preference(&self) -> Result<bool, ConfigError> {
        Ok(self.store.load()?.config.launcher.launch_companion)
    }

    pub fn set_companion_preference(&self, enabled: bool) -> Result<(), ConfigError> {
        self.store.set_companion_preference(enabled)
    }

    /// Installed tag for display, if a real version is recorded.
    pub fn installed_version(&self) -> Result<Option<String>, ConfigError> {
        Ok(self
            .store
            .load()?
            .config
            .managed
            .installed_version()
            .map(str::to_string))
    }

    pub async fn launch(
        &self,
        with_companion: bool,
        events: mpsc::Sender<LauncherEvent>,
    ) -> Result<LaunchOutcome, ConfigError> {
        self.supervisor.launch(with_companion, events).await
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await;
    }

    pub async fn check_for_updates(&self) -> Result<String, ConfigError> {
        self.updater.check_for_updates().await
    }

    /// Wipes the executable, backup and config, then installs the newest
    /// release. Holds the supervisor idle throughout so no launch or stop
    /// can interleave; refuses while the managed application is running.
    pub async fn reinstall(&self) -> Result<String, ConfigError> {
        let Some(_idle) = self.supervisor.lock_idle().await else {
            return Ok(REINSTALL_WHILE_RUNNING.to_string());
        };
        info!("Reinstalling MAC into {}", self.locations.executable.display());
        self.updater.reinstall().await
    }
}
