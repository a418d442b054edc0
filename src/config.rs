use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CrawlConfig {
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub captcha: CaptchaConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl CrawlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.fetch.timeout_secs == 0 {
            bail!("fetch.timeout_secs must be positive");
        }
        if self.throttle.block_every_cases == 0 {
            bail!("throttle.block_every_cases must be positive");
        }
        if self.captcha.ocr_endpoint.trim().is_empty() {
            bail!("captcha.ocr_endpoint must not be empty");
        }
        if self.reference.court_directory_url.trim().is_empty() {
            bail!("reference.court_directory_url must not be empty");
        }
        Ok(())
    }

    /// Zero waits and delays; for fixtures and fake fetchers.
    pub fn without_delays() -> Self {
        let mut config = Self::default();
        config.retry.backoff_ms = 0;
        config.throttle = ThrottleConfig {
            page_delay_ms: 0,
            block_every_cases: default_block_every_cases(),
            block_delay_ms: 0,
            case_delay_ms: 0,
            landing_settle_ms: 0,
        };
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Chrome binary for the browser fetcher; looked up on PATH when unset.
    #[serde(default)]
    pub chrome_executable: Option<PathBuf>,
    #[serde(default = "default_headless")]
    pub headless: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: None,
            chrome_executable: None,
            headless: default_headless(),
        }
    }
}

/// Bounded waits for DOM markers, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct WaitConfig {
    #[serde(default = "default_short_wait")]
    pub landing_secs: u64,
    #[serde(default = "default_short_wait")]
    pub listing_secs: u64,
    #[serde(default = "default_short_wait")]
    pub case_secs: u64,
    #[serde(default = "default_short_wait")]
    pub captcha_secs: u64,
    #[serde(default = "default_portal_listing_wait")]
    pub portal_listing_secs: u64,
    #[serde(default = "default_portal_case_wait")]
    pub portal_case_secs: u64,
}

impl WaitConfig {
    pub fn landing(&self) -> Duration {
        Duration::from_secs(self.landing_secs)
    }

    pub fn listing(&self) -> Duration {
        Duration::from_secs(self.listing_secs)
    }

    pub fn case(&self) -> Duration {
        Duration::from_secs(self.case_secs)
    }

    pub fn captcha(&self) -> Duration {
        Duration::from_secs(self.captcha_secs)
    }

    pub fn portal_listing(&self) -> Duration {
        Duration::from_secs(self.portal_listing_secs)
    }

    pub fn portal_case(&self) -> Duration {
        Duration::from_secs(self.portal_case_secs)
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            landing_secs: default_short_wait(),
            listing_secs: default_short_wait(),
            case_secs: default_short_wait(),
            captcha_secs: default_short_wait(),
            portal_listing_secs: default_portal_listing_wait(),
            portal_case_secs: default_portal_case_wait(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Pause after every paginated portal page.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_block_every_cases")]
    pub block_every_cases: u32,
    #[serde(default = "default_block_delay_ms")]
    pub block_delay_ms: u64,
    /// Pause after a portal case page reports ready.
    #[serde(default = "default_page_delay_ms")]
    pub case_delay_ms: u64,
    #[serde(default = "default_page_delay_ms")]
    pub landing_settle_ms: u64,
}

impl ThrottleConfig {
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn block_delay(&self) -> Duration {
        Duration::from_millis(self.block_delay_ms)
    }

    pub fn case_delay(&self) -> Duration {
        Duration::from_millis(self.case_delay_ms)
    }

    pub fn landing_settle(&self) -> Duration {
        Duration::from_millis(self.landing_settle_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            page_delay_ms: default_page_delay_ms(),
            block_every_cases: default_block_every_cases(),
            block_delay_ms: default_block_delay_ms(),
            case_delay_ms: default_page_delay_ms(),
            landing_settle_ms: default_page_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaConfig {
    #[serde(default)]
    pub ocr_api_key: Option<String>,
    #[serde(default = "default_ocr_endpoint")]
    pub ocr_endpoint: String,
    #[serde(default = "default_ocr_engine")]
    pub ocr_engine: String,
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            ocr_api_key: None,
            ocr_endpoint: default_ocr_endpoint(),
            ocr_engine: default_ocr_engine(),
            image_dir: default_image_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceConfig {
    #[serde(default = "default_court_directory_url")]
    pub court_directory_url: String,
    #[serde(default = "default_region_codes_url")]
    pub region_codes_url: String,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            court_directory_url: default_court_directory_url(),
            region_codes_url: default_region_codes_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

/// Reads the TOML config at `path`, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<CrawlConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read crawl config: {}", path.display()))?;
            toml::from_str::<CrawlConfig>(&text)
                .with_context(|| format!("failed to parse toml in {}", path.display()))?
        }
        None => CrawlConfig::default(),
    };

    config.validate().with_context(|| match path {
        Some(path) => format!("invalid crawl config {}", path.display()),
        None => "invalid default crawl config".to_string(),
    })?;
    Ok(config)
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_headless() -> bool {
    true
}

fn default_short_wait() -> u64 {
    6
}

fn default_portal_listing_wait() -> u64 {
    30
}

fn default_portal_case_wait() -> u64 {
    20
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_page_delay_ms() -> u64 {
    3000
}

fn default_block_every_cases() -> u32 {
    200
}

fn default_block_delay_ms() -> u64 {
    5000
}

fn default_ocr_endpoint() -> String {
    "https://api.ocr.space/parse/image".to_string()
}

fn default_ocr_engine() -> String {
    "2".to_string()
}

fn default_image_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_court_directory_url() -> String {
    "https://raw.githubusercontent.com/dataout-org/sudrfparser/main/courts_info/sudrf_websites.json"
        .to_string()
}

fn default_region_codes_url() -> String {
    "https://raw.githubusercontent.com/dataout-org/sudrfparser/main/courts_info/rf_region_codes.json"
        .to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/cases")
}
