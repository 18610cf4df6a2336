use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub login: Option<LoginConfig>,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_thumb_dir")]
    pub thumb_dir: PathBuf,
    #[serde(default = "default_debug_dir")]
    pub debug_dir: PathBuf,
    #[serde(default = "default_captcha_file")]
    pub captcha_file: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            thumb_dir: default_thumb_dir(),
            debug_dir: default_debug_dir(),
            captcha_file: default_captcha_file(),
        }
    }
}

fn default_thumb_dir() -> PathBuf {
    PathBuf::from("./data/thumb")
}
fn default_debug_dir() -> PathBuf {
    PathBuf::from("./data/debug")
}
fn default_captcha_file() -> PathBuf {
    PathBuf::from("./data/captcha.png")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoginConfig {
    pub user: String,
    pub password: String,
}

/// Retry budgets and politeness pauses for the crawl.
///
/// The delays are not scheduling artifacts: the remote site flags clients
/// that navigate faster than a person would.
#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    #[serde(default = "default_retry_fetch")]
    pub retry_fetch: u32,
    #[serde(default = "default_retry_login")]
    pub retry_login: u32,
    #[serde(default = "default_retry_captcha")]
    pub retry_captcha: u32,
    #[serde(default = "default_retry_sub_fetch")]
    pub retry_category: u32,
    #[serde(default = "default_retry_sub_fetch")]
    pub retry_thumbnail: u32,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_order_delay_ms")]
    pub order_delay_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_pass_delay_ms")]
    pub retry_pass_delay_ms: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            retry_fetch: default_retry_fetch(),
            retry_login: default_retry_login(),
            retry_captcha: default_retry_captcha(),
            retry_category: default_retry_sub_fetch(),
            retry_thumbnail: default_retry_sub_fetch(),
            page_delay_ms: default_page_delay_ms(),
            order_delay_ms: default_order_delay_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_pass_delay_ms: default_retry_pass_delay_ms(),
        }
    }
}

impl CrawlConfig {
    /// Budgets unchanged, every pause set to zero. Used by tests and the
    /// replay driver, where there is no remote server to be polite to.
    pub fn without_delays(&self) -> Self {
        Self {
            page_delay_ms: 0,
            order_delay_ms: 0,
            retry_delay_ms: 0,
            retry_pass_delay_ms: 0,
            ..self.clone()
        }
    }
}

fn default_retry_fetch() -> u32 {
    1
}
fn default_retry_login() -> u32 {
    2
}
fn default_retry_captcha() -> u32 {
    2
}
fn default_retry_sub_fetch() -> u32 {
    2
}
fn default_page_delay_ms() -> u64 {
    1000
}
fn default_order_delay_ms() -> u64 {
    1000
}
fn default_retry_delay_ms() -> u64 {
    5000
}
fn default_retry_pass_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BrowserConfig {
    /// Site snapshot replayed by [`crate::fixture::FixtureBrowser`].
    pub fixture: Option<PathBuf>,
}

const MAX_RETRY_BUDGET: u32 = 10;

impl Config {
    /// Configuration rooted at `base`, with every default applied.
    pub fn with_base_dir(base: &Path) -> Self {
        Self {
            db: DbConfig {
                path: base.join("orderhist.sqlite"),
            },
            data: DataConfig {
                thumb_dir: base.join("thumb"),
                debug_dir: base.join("debug"),
                captcha_file: base.join("captcha.png"),
            },
            login: None,
            crawl: CrawlConfig::default(),
            browser: BrowserConfig::default(),
        }
    }

    /// Resolve the cached thumbnail location for a product identifier.
    pub fn thumbnail_path(&self, product_id: Option<&str>) -> Option<PathBuf> {
        product_id.map(|id| self.data.thumb_dir.join(format!("{}.png", id)))
    }

    /// Create the data directories the crawl writes into.
    pub fn prepare_directories(&self) -> Result<()> {
        for dir in [&self.data.thumb_dir, &self.data.debug_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        if let Some(parent) = self.data.captcha_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.path.as_os_str().is_empty() {
        anyhow::bail!("db.path must not be empty");
    }

    let crawl = &config.crawl;
    if crawl.retry_login == 0 {
        anyhow::bail!("crawl.retry_login must be >= 1");
    }
    if crawl.retry_captcha == 0 {
        anyhow::bail!("crawl.retry_captcha must be >= 1");
    }

    for (name, value) in [
        ("retry_fetch", crawl.retry_fetch),
        ("retry_login", crawl.retry_login),
        ("retry_captcha", crawl.retry_captcha),
        ("retry_category", crawl.retry_category),
        ("retry_thumbnail", crawl.retry_thumbnail),
    ] {
        if value > MAX_RETRY_BUDGET {
            anyhow::bail!(
                "crawl.{} must be <= {} (got {})",
                name,
                MAX_RETRY_BUDGET,
                value
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse("[db]\npath = \"./data/orderhist.sqlite\"\n").unwrap();
        assert_eq!(config.crawl.retry_fetch, 1);
        assert_eq!(config.crawl.retry_login, 2);
        assert_eq!(config.crawl.retry_captcha, 2);
        assert_eq!(config.data.thumb_dir, PathBuf::from("./data/thumb"));
        assert!(config.login.is_none());
        assert!(config.browser.fixture.is_none());
    }

    #[test]
    fn zero_login_budget_is_rejected() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[crawl]\nretry_login = 0\n").unwrap_err();
        assert!(err.to_string().contains("retry_login"));
    }

    #[test]
    fn oversized_budget_is_rejected() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[crawl]\nretry_fetch = 50\n").unwrap_err();
        assert!(err.to_string().contains("retry_fetch"));
    }

    #[test]
    fn thumbnail_path_uses_product_id() {
        let config = Config::with_base_dir(Path::new("/tmp/oh"));
        assert_eq!(
            config.thumbnail_path(Some("B00TEST")),
            Some(PathBuf::from("/tmp/oh/thumb/B00TEST.png"))
        );
        assert_eq!(config.thumbnail_path(None), None);
    }
}
