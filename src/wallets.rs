use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Canonical wallets list maintained by the TON Foundation. Served with a
/// `text/plain` content type, so the body is parsed rather than `json()`ed.
pub const WALLETS_LIST_URL: &str =
    "https://raw.githubusercontent.com/ton-blockchain/wallets-list/main/wallets-v2.json";

const CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// One entry of wallets-v2.json. Field names are snake_case in the published
/// list, unlike the protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletApp {
    pub app_name: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub about_url: Option<String>,
    #[serde(default)]
    pub universal_url: Option<String>,
    #[serde(default)]
    pub bridge: Vec<BridgeEntry>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub dns: Option<String>,
}

impl WalletApp {
    /// URL of the wallet's SSE bridge, if it runs one.
    pub fn bridge_url(&self) -> Option<&str> {
        self.bridge
            .iter()
            .find(|entry| entry.kind == "sse")
            .and_then(|entry| entry.url.as_deref())
    }

    /// Whether this SDK can talk to the wallet at all (HTTP bridge only;
    /// `js`-injected wallets live in browsers).
    pub fn is_supported(&self) -> bool {
        self.bridge_url().is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Filters for [`WalletsList::filtered`]. `Default` keeps only wallets this
/// SDK can actually connect to.
#[derive(Debug, Clone)]
pub struct WalletFilter {
    pub app_names: Option<Vec<String>>,
    pub names: Option<Vec<String>>,
    pub ton_dns: Option<Vec<String>>,
    pub platforms: Option<Vec<String>>,
    pub only_supported: bool,
}

impl Default for WalletFilter {
    fn default() -> Self {
        Self {
            app_names: None,
            names: None,
            ton_dns: None,
            platforms: None,
            only_supported: true,
        }
    }
}

impl WalletFilter {
    fn matches(&self, app: &WalletApp) -> bool {
        if self.only_supported && !app.is_supported() {
            return false;
        }
        if let Some(app_names) = &self.app_names {
            if !app_names.iter().any(|name| *name == app.app_name) {
                return false;
            }
        }
        if let Some(names) = &self.names {
            if !names.iter().any(|name| *name == app.name) {
                return false;
            }
        }
        if let Some(ton_dns) = &self.ton_dns {
            match &app.dns {
                Some(dns) if ton_dns.iter().any(|candidate| candidate == dns) => {}
                _ => return false,
            }
        }
        if let Some(platforms) = &self.platforms {
            if !platforms
                .iter()
                .any(|platform| app.platforms.contains(platform))
            {
                return false;
            }
        }
        true
    }
}

/// Fetches and caches the wallets list.
pub struct WalletsList {
    client: reqwest::Client,
    url: String,
    cache: Mutex<Option<(Instant, Vec<WalletApp>)>>,
}

impl WalletsList {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_url(client, WALLETS_LIST_URL)
    }

    pub fn with_url(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            cache: Mutex::new(None),
        }
    }

    /// All known wallet apps, served from cache inside the TTL.
    pub async fn all(&self) -> Result<Vec<WalletApp>> {
        let mut cache = self.cache.lock().await;
        if let Some((fetched_at, apps)) = cache.as_ref() {
            if fetched_at.elapsed() < CACHE_TTL {
                return Ok(apps.clone());
            }
        }

        log::debug!("fetching wallets list from {}", self.url);
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let apps: Vec<WalletApp> = serde_json::from_str(&body)?;
        *cache = Some((Instant::now(), apps.clone()));
        Ok(apps)
    }

    pub async fn filtered(&self, filter: &WalletFilter) -> Result<Vec<WalletApp>> {
        let apps = self.all().await?;
        Ok(apps.into_iter().filter(|app| filter.matches(app)).collect())
    }

    /// Look a single wallet up by its `app_name`.
    pub async fn find(&self, app_name: &str) -> Result<Option<WalletApp>> {
        let apps = self.all().await?;
        Ok(apps.into_iter().find(|app| app.app_name == app_name))
    }
}
