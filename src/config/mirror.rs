// src/config/mirror.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::fetcher::MAX_PAGE_SIZE;
use crate::ingest::types::ChannelId;

pub const ENV_CONFIG_PATH: &str = "MIRROR_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/mirror.toml";

const DEFAULT_STORE_PATH: &str = "data/tg/posts.json";
const DEFAULT_MEDIA_DIR: &str = "static/img/tg";
const DEFAULT_URL_PREFIX: &str = "/img/tg";
const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Optional file layer (`config/mirror.toml`). Every field may be overridden by env.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub bot_token: Option<String>,
    pub channel_id: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub media_dir: Option<PathBuf>,
    pub media_url_prefix: Option<String>,
    pub api_base: Option<String>,
    pub page_size: Option<u32>,
    pub max_pages: Option<usize>,
    pub download_concurrency: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub lock_stale_secs: Option<u64>,
    pub metrics_textfile: Option<PathBuf>,
}

/// Resolved run configuration, built once at process start.
#[derive(Clone)]
pub struct SyncConfig {
    pub bot_token: String,
    pub channel: ChannelId,
    pub store_path: PathBuf,
    pub media_dir: PathBuf,
    pub media_url_prefix: String,
    pub api_base: String,
    pub page_size: u32,
    pub max_pages: usize,
    pub download_concurrency: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub lock_stale_after: Duration,
    pub metrics_textfile: Option<PathBuf>,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("bot_token", &format_args!("<{} chars>", self.bot_token.len()))
            .field("channel", &self.channel)
            .field("store_path", &self.store_path)
            .field("media_dir", &self.media_dir)
            .field("media_url_prefix", &self.media_url_prefix)
            .field("api_base", &self.api_base)
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("download_concurrency", &self.download_concurrency)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("lock_stale_after", &self.lock_stale_after)
            .field("metrics_textfile", &self.metrics_textfile)
            .finish()
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, v: String) -> Result<T> {
    v.trim()
        .parse::<T>()
        .map_err(|_| anyhow!("{key} must be a number, got {v:?}"))
}

impl SyncConfig {
    /// Merge the file layer with an environment lookup. `env` is injected so tests
    /// need not touch the process environment.
    pub fn from_sources<F>(file: FileConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let bot_token = get("BOT_TOKEN")
            .or(file.bot_token)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("BOT_TOKEN is not set"))?;

        let channel_raw = get("CHANNEL_ID")
            .or(file.channel_id)
            .ok_or_else(|| anyhow!("CHANNEL_ID is not set"))?;
        let channel: ChannelId = channel_raw
            .parse()
            .map_err(|e: String| anyhow!("CHANNEL_ID: {e}"))?;

        let data_dir = get("MIRROR_DATA_DIR").map(PathBuf::from).or(file.data_dir);
        let store_path = get("MIRROR_STORE_PATH")
            .map(PathBuf::from)
            .or(file.store_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH));
        let media_dir = get("MIRROR_MEDIA_DIR")
            .map(PathBuf::from)
            .or(file.media_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_DIR));
        // Relative paths hang off the data dir when one is given.
        let (store_path, media_dir) = match &data_dir {
            Some(d) => (rebase(d, store_path), rebase(d, media_dir)),
            None => (store_path, media_dir),
        };

        let media_url_prefix = get("MIRROR_MEDIA_URL_PREFIX")
            .or(file.media_url_prefix)
            .unwrap_or_else(|| DEFAULT_URL_PREFIX.to_string());
        let api_base = get("MIRROR_API_BASE")
            .or(file.api_base)
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        let page_size = match get("MIRROR_PAGE_SIZE") {
            Some(v) => parse_num("MIRROR_PAGE_SIZE", v)?,
            None => file.page_size.unwrap_or(MAX_PAGE_SIZE),
        }
        .clamp(1, MAX_PAGE_SIZE);
        let max_pages = match get("MIRROR_MAX_PAGES") {
            Some(v) => parse_num("MIRROR_MAX_PAGES", v)?,
            None => file.max_pages.unwrap_or(1000),
        }
        .max(1);
        let download_concurrency = match get("MIRROR_DOWNLOAD_CONCURRENCY") {
            Some(v) => parse_num("MIRROR_DOWNLOAD_CONCURRENCY", v)?,
            None => file.download_concurrency.unwrap_or(4),
        }
        .max(1);
        let request_timeout_secs: u64 = match get("MIRROR_REQUEST_TIMEOUT_SECS") {
            Some(v) => parse_num("MIRROR_REQUEST_TIMEOUT_SECS", v)?,
            None => file.request_timeout_secs.unwrap_or(30),
        };
        let connect_timeout_secs: u64 = match get("MIRROR_CONNECT_TIMEOUT_SECS") {
            Some(v) => parse_num("MIRROR_CONNECT_TIMEOUT_SECS", v)?,
            None => file.connect_timeout_secs.unwrap_or(10),
        };
        if request_timeout_secs == 0 || connect_timeout_secs == 0 {
            bail!("timeouts must be at least one second");
        }
        let lock_stale_secs: u64 = match get("MIRROR_LOCK_STALE_SECS") {
            Some(v) => parse_num("MIRROR_LOCK_STALE_SECS", v)?,
            None => file.lock_stale_secs.unwrap_or(6 * 3600),
        };
        let metrics_textfile = get("MIRROR_METRICS_TEXTFILE")
            .map(PathBuf::from)
            .or(file.metrics_textfile);

        Ok(Self {
            bot_token,
            channel,
            store_path,
            media_dir,
            media_url_prefix,
            api_base,
            page_size,
            max_pages,
            download_concurrency,
            request_timeout: Duration::from_secs(request_timeout_secs),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            lock_stale_after: Duration::from_secs(lock_stale_secs),
            metrics_textfile,
        })
    }

    /// File layer from an explicit path.
    pub fn load_file(path: &Path) -> Result<FileConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading mirror config from {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Resolve using env var + fallbacks:
    /// 1) $MIRROR_CONFIG_PATH (must exist)
    /// 2) config/mirror.toml (if present)
    /// 3) environment only
    pub fn load_default() -> Result<Self> {
        let file = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                bail!("{ENV_CONFIG_PATH} points to non-existent path");
            }
            Self::load_file(&pb)?
        } else {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Self::load_file(&default)?
            } else {
                FileConfig::default()
            }
        };
        Self::from_sources(file, |k| std::env::var(k).ok())
    }
}

fn rebase(base: &Path, p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}
