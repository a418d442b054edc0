use crate::config::{FetchConfig, RetryConfig};
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub(crate) const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("no document is loaded in the current tab")]
    NoDocument,
    #[error("{0} is not supported by this fetcher")]
    Unsupported(&'static str),
    #[error("tab error: {0}")]
    Tab(String),
    #[error("element {0} not found")]
    MissingElement(String),
    #[error("browser error: {0}")]
    Browser(String),
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } | FetchError::NoDocument | FetchError::Browser(_) => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Unsupported(_) | FetchError::Tab(_) | FetchError::MissingElement(_) => {
                false
            }
        }
    }
}

/// How a DOM marker is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator {
    Id(&'static str),
    Class(&'static str),
    Css(&'static str),
}

impl Locator {
    pub fn css(&self) -> String {
        match self {
            Locator::Id(id) => format!("[id=\"{id}\"]"),
            Locator::Class(class) => format!(".{class}"),
            Locator::Css(css) => (*css).to_string(),
        }
    }

    pub fn is_present(&self, document: &Html) -> bool {
        let Ok(selector) = Selector::parse(&self.css()) else {
            return false;
        };
        document.select(&selector).next().is_some()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Id(id) => write!(f, "id={id}"),
            Locator::Class(class) => write!(f, "class={class}"),
            Locator::Css(css) => write!(f, "css={css}"),
        }
    }
}

/// The browser-like session the crawler drives. One session per call path;
/// implementations keep at least one tab open at all times.
pub trait PageFetcher {
    fn navigate(&mut self, url: &str) -> Result<(), FetchError>;

    /// Waits up to `timeout` for `locator` to appear in the current document.
    fn wait_for(&mut self, locator: Locator, timeout: Duration) -> bool;

    /// HTML of the current tab.
    fn document(&self) -> Result<String, FetchError>;

    /// Opens a blank tab and switches to it.
    fn open_tab(&mut self) -> Result<(), FetchError>;

    /// Closes the current tab and switches back to the first one.
    fn close_tab(&mut self) -> Result<(), FetchError>;

    fn switch_tab(&mut self, index: usize) -> Result<(), FetchError>;

    fn tab_count(&self) -> usize;

    fn execute_script(&mut self, script: &str) -> Result<(), FetchError>;

    /// Types `value` into the field at `locator`. Dialog forms are sent by a
    /// following `click` on their button.
    fn fill_and_submit(&mut self, locator: Locator, value: &str) -> Result<(), FetchError>;

    fn click(&mut self, locator: Locator) -> Result<(), FetchError>;
}

#[derive(Debug, Clone, Default)]
struct Tab {
    url: Option<String>,
    body: Option<String>,
}

/// Plain HTTP session: documents are served as delivered, without scripts.
/// Cookies persist across navigations so court-site sessions survive pagination.
pub struct HttpPageFetcher {
    client: Client,
    tabs: Vec<Tab>,
    current: usize,
}

impl HttpPageFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config)?,
            tabs: vec![Tab::default()],
            current: 0,
        })
    }

    pub fn current_url(&self) -> Option<&str> {
        self.tabs.get(self.current)?.url.as_deref()
    }
}

impl PageFetcher for HttpPageFetcher {
    fn navigate(&mut self, url: &str) -> Result<(), FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;
        debug!(%url, bytes = body.len(), "page loaded");

        let tab = self
            .tabs
            .get_mut(self.current)
            .ok_or_else(|| FetchError::Tab(format!("no tab at index {}", self.current)))?;
        tab.url = Some(url.to_string());
        tab.body = Some(body);
        Ok(())
    }

    fn wait_for(&mut self, locator: Locator, timeout: Duration) -> bool {
        let Ok(html) = self.document() else {
            return false;
        };
        let found = locator.is_present(&Html::parse_document(&html));
        if !found {
            debug!(%locator, timeout_secs = timeout.as_secs(), "marker absent from static document");
        }
        found
    }

    fn document(&self) -> Result<String, FetchError> {
        self.tabs
            .get(self.current)
            .and_then(|tab| tab.body.clone())
            .ok_or(FetchError::NoDocument)
    }

    fn open_tab(&mut self) -> Result<(), FetchError> {
        self.tabs.push(Tab::default());
        self.current = self.tabs.len() - 1;
        Ok(())
    }

    fn close_tab(&mut self) -> Result<(), FetchError> {
        if self.tabs.len() <= 1 {
            return Err(FetchError::Tab("cannot close the last tab".to_string()));
        }
        self.tabs.remove(self.current);
        self.current = 0;
        Ok(())
    }

    fn switch_tab(&mut self, index: usize) -> Result<(), FetchError> {
        if index >= self.tabs.len() {
            return Err(FetchError::Tab(format!("no tab at index {index}")));
        }
        self.current = index;
        Ok(())
    }

    fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    fn execute_script(&mut self, _script: &str) -> Result<(), FetchError> {
        Err(FetchError::Unsupported("execute_script"))
    }

    fn fill_and_submit(&mut self, _locator: Locator, _value: &str) -> Result<(), FetchError> {
        Err(FetchError::Unsupported("fill_and_submit"))
    }

    fn click(&mut self, _locator: Locator) -> Result<(), FetchError> {
        Err(FetchError::Unsupported("click"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherKind {
    Http,
    Browser,
}

/// Opens a session of the given kind. The aggregator portal renders its
/// listings with scripts and only works with [`FetcherKind::Browser`].
pub fn open_fetcher(config: &FetchConfig, kind: FetcherKind) -> Result<Box<dyn PageFetcher>> {
    match kind {
        FetcherKind::Http => Ok(Box::new(HttpPageFetcher::new(config)?)),
        #[cfg(feature = "browser")]
        FetcherKind::Browser => Ok(Box::new(crate::browser::BrowserPageFetcher::launch(config)?)),
        #[cfg(not(feature = "browser"))]
        FetcherKind::Browser => {
            anyhow::bail!("browser fetcher is not built in; rebuild with `--features browser`")
        }
    }
}

pub fn build_http_client(config: &FetchConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    let user_agent = config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(user_agent).context("invalid user agent")?,
    );

    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .cookie_store(true)
        .default_headers(headers)
        .build()
        .context("failed to build reqwest client")
}

/// Fetches and decodes a JSON document, retrying transient failures.
pub fn fetch_json<T: DeserializeOwned>(client: &Client, url: &str, policy: &RetryPolicy) -> Result<T> {
    let body = policy
        .run(url, |_| {
            let response = client.get(url).send().map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            response.bytes().map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })
        })
        .with_context(|| format!("request to {url} failed"))?;

    serde_json::from_slice(&body).with_context(|| format!("failed to parse json from {url}"))
}

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Bounded attempts with linear backoff, shared by every crawl unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. `op` receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: Retryable + fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && err.is_retryable() => {
                    warn!(%label, attempt, error = %err, "attempt failed; retrying");
                    pause(self.backoff * attempt);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub fn pause(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}
