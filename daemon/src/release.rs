/// Remote release feed for the managed application.
///
/// The feed is the GitHub REST API:
///   - `GET /repos/{owner}/{repo}/tags`               newest tag first
///   - `GET /repos/{owner}/{repo}/releases/tags/{tag}` assets of one release
///
/// Every response is checked against the `x-ratelimit-remaining` header
/// before its status so that an exhausted quota is reported as such rather
/// than as a generic HTTP failure.
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const GITHUB_API_BASE: &str = "https://api.github.com";
pub const UPSTREAM_OWNER: &str = "MegaAntiCheat";
pub const UPSTREAM_REPO: &str = "client-backend";

const RATE_LIMIT_HEADER: &str = "x-ratelimit-remaining";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const API_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest silence tolerated on an open connection, downloads included.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("GitHub API rate limit exceeded")]
    RateLimitExceeded,
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Release {
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Asset {
    pub browser_download_url: String,
}

/// Source of releases. Implemented over HTTP by [`GithubFeed`]; tests
/// substitute an in-memory feed.
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Name of the newest tag, or `None` if the repository has none.
    async fn latest_tag(&self) -> Result<Option<String>, FeedError>;

    /// Assets attached to the release for `tag`.
    async fn release_assets(&self, tag: &str) -> Result<Vec<Asset>, FeedError>;

    /// Streams `url` into the file at `dest`, replacing it if present.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), FeedError>;
}

pub struct GithubFeed {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
}

impl GithubFeed {
    pub fn new(
        api_base: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Result<Self, FeedError> {
        Self::with_read_timeout(api_base, owner, repo, READ_TIMEOUT)
    }

    /// Like [`GithubFeed::new`], failing any request whose connection stays
    /// silent for `read_timeout`.
    pub fn with_read_timeout(
        api_base: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        read_timeout: Duration,
    ) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("megalauncher/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            repo: repo.into(),
        })
    }

    /// Feed for the upstream MegaAntiCheat client backend.
    pub fn upstream() -> Result<Self, FeedError> {
        Self::new(GITHUB_API_BASE, UPSTREAM_OWNER, UPSTREAM_REPO)
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!("{}/repos/{}/{}/{suffix}", self.api_base, self.owner, self.repo)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FeedError> {
        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .timeout(API_TIMEOUT)
            .send()
            .await?;
        check_quota(response.headers())?;
        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ReleaseFeed for GithubFeed {
    async fn latest_tag(&self) -> Result<Option<String>, FeedError> {
        let tags: Vec<Tag> = self.get_json(&self.repo_url("tags")).await?;
        Ok(tags.into_iter().next().map(|t| t.name))
    }

    async fn release_assets(&self, tag: &str) -> Result<Vec<Asset>, FeedError> {
        let release: Release = self
            .get_json(&self.repo_url(&format!("releases/tags/{tag}")))
            .await?;
        Ok(release.assets)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), FeedError> {
        debug!("Downloading {url} to {}", dest.display());
        let response = self.client.get(url).send().await?;
        check_quota(response.headers())?;
        let mut response = response.error_for_status()?;

        let io_err = |source| FeedError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        debug!("Downloaded {written} bytes");
        Ok(())
    }
}

/// Fails with [`FeedError::RateLimitExceeded`] when the remaining-quota
/// header reads zero. Returns the remaining count when present.
pub fn check_quota(headers: &HeaderMap) -> Result<Option<u64>, FeedError> {
    let Some(value) = headers.get(RATE_LIMIT_HEADER) else {
        return Ok(None);
    };
    let remaining = match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(remaining) => remaining,
        None => {
            warn!("Unparsable {RATE_LIMIT_HEADER} header: {value:?}");
            return Ok(None);
        }
    };
    debug!("Remaining API requests: {remaining}");
    if remaining == 0 {
        return Err(FeedError::RateLimitExceeded);
    }
    Ok(Some(remaining))
}

/// Host platform family for asset selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    Unsupported,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Unsupported
        }
    }

    fn accepts(self, url: &str) -> bool {
        match self {
            Platform::Windows => url.ends_with(".exe"),
            Platform::Linux => ![".tar.gz", ".zip", ".exe"]
                .iter()
                .any(|suffix| url.ends_with(suffix)),
            Platform::Unsupported => false,
        }
    }
}

/// First asset whose download URL fits `platform`.
pub fn select_asset(assets: &[Asset], platform: Platform) -> Option<&Asset> {
    assets
        .iter()
        .find(|asset| platform.accepts(&asset.browser_download_url))
}
