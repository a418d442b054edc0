use crate::config::FetchConfig;
use crate::fetch::{DEFAULT_USER_AGENT, FetchError, Locator, PageFetcher};
use anyhow::{Context, Result, anyhow};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use std::fmt::Display;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Headless Chrome session over the DevTools protocol. Scripts run, so the
/// aggregator portal renders its listings; each tab is a browser page.
///
/// The async browser is driven from a private runtime so callers stay blocking.
pub struct BrowserPageFetcher {
    runtime: Runtime,
    browser: Browser,
    tabs: Vec<Page>,
    current: usize,
    user_agent: String,
    timeout: Duration,
}

impl BrowserPageFetcher {
    pub fn launch(config: &FetchConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("failed to start the browser runtime")?;

        let mut builder = BrowserConfig::builder();
        if let Some(path) = &config.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        if !config.headless {
            builder = builder.with_head();
        }
        let browser_config = builder
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .build()
            .map_err(|err| anyhow!("failed to build browser config: {err}"))?;

        info!(headless = config.headless, "launching browser");
        let (browser, mut handler) = runtime
            .block_on(Browser::launch(browser_config))
            .context("failed to launch browser")?;
        runtime.spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let mut fetcher = Self {
            runtime,
            browser,
            tabs: Vec::new(),
            current: 0,
            user_agent,
            timeout: Duration::from_secs(config.timeout_secs),
        };
        fetcher.open_tab().context("failed to open the first tab")?;
        Ok(fetcher)
    }

    fn page(&self) -> Result<&Page, FetchError> {
        self.tabs
            .get(self.current)
            .ok_or_else(|| FetchError::Tab(format!("no tab at index {}", self.current)))
    }
}

fn browser_error(err: impl Display) -> FetchError {
    FetchError::Browser(err.to_string())
}

impl PageFetcher for BrowserPageFetcher {
    fn navigate(&mut self, url: &str) -> Result<(), FetchError> {
        let page = self.page()?;
        let timeout = self.timeout;
        self.runtime.block_on(async {
            match tokio::time::timeout(timeout, page.goto(url)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(err)) => Err(browser_error(format!("navigation to {url} failed: {err}"))),
                Err(_) => Err(browser_error(format!(
                    "navigation to {url} timed out after {}s",
                    timeout.as_secs()
                ))),
            }
        })?;
        debug!(%url, "page loaded in browser");
        Ok(())
    }

    fn wait_for(&mut self, locator: Locator, timeout: Duration) -> bool {
        let Ok(page) = self.page() else {
            return false;
        };
        let css = locator.css();
        let found = self.runtime.block_on(async {
            let poll = async {
                while page.find_element(css.as_str()).await.is_err() {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            };
            tokio::time::timeout(timeout, poll).await.is_ok()
        });
        if !found {
            debug!(%locator, timeout_secs = timeout.as_secs(), "marker never appeared");
        }
        found
    }

    fn document(&self) -> Result<String, FetchError> {
        let page = self.page()?;
        self.runtime.block_on(page.content()).map_err(browser_error)
    }

    fn open_tab(&mut self) -> Result<(), FetchError> {
        let page = self.runtime.block_on(async {
            let page = self.browser.new_page("about:blank").await.map_err(browser_error)?;
            page.execute(SetUserAgentOverrideParams::new(self.user_agent.clone()))
                .await
                .map_err(browser_error)?;
            Ok::<_, FetchError>(page)
        })?;
        self.tabs.push(page);
        self.current = self.tabs.len() - 1;
        Ok(())
    }

    fn close_tab(&mut self) -> Result<(), FetchError> {
        if self.tabs.len() <= 1 {
            return Err(FetchError::Tab("cannot close the last tab".to_string()));
        }
        let page = self.tabs.remove(self.current);
        self.current = 0;
        self.runtime.block_on(page.close()).map_err(browser_error)
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

    fn execute_script(&mut self, script: &str) -> Result<(), FetchError> {
        let page = self.page()?;
        self.runtime
            .block_on(page.evaluate(script.to_string()))
            .map(|_| ())
            .map_err(browser_error)
    }

    fn fill_and_submit(&mut self, locator: Locator, value: &str) -> Result<(), FetchError> {
        let page = self.page()?;
        self.runtime.block_on(async {
            let field = page
                .find_element(locator.css())
                .await
                .map_err(|_| FetchError::MissingElement(locator.to_string()))?;
            field.click().await.map_err(browser_error)?;
            field.type_str(value).await.map_err(browser_error)?;
            Ok(())
        })
    }

    fn click(&mut self, locator: Locator) -> Result<(), FetchError> {
        let page = self.page()?;
        self.runtime.block_on(async {
            let element = page
                .find_element(locator.css())
                .await
                .map_err(|_| FetchError::MissingElement(locator.to_string()))?;
            element.click().await.map_err(browser_error)?;
            Ok(())
        })
    }
}

impl Drop for BrowserPageFetcher {
    fn drop(&mut self) {
        let browser = &mut self.browser;
        self.runtime.block_on(async {
            if let Err(err) = browser.close().await {
                warn!(error = %err, "browser did not close cleanly");
                return;
            }
            let _ = browser.wait().await;
        });
    }
}
