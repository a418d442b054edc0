use crate::config::CrawlConfig;
use crate::fetch::{FetchError, Locator, PageFetcher, RetryPolicy, Retryable, pause};
use crate::model::FormVariant;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, info};

const FORM_CONTAINER: Locator = Locator::Id("modSdpContent");
const CAPTCHA_MARKER: &str = "Проверочный код";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub variant: FormVariant,
    pub captcha: bool,
}

/// Decides the form variant and captcha requirement from a search-form page.
pub fn classify_form(html: &str) -> Classification {
    let document = Html::parse_document(html);
    let container = Selector::parse("div#modSdpContent").expect("static selector");
    let link = Selector::parse("link").expect("static selector");
    let panel = Selector::parse("div.box.box_common.m-all_m").expect("static selector");

    let Some(content) = document.select(&container).next() else {
        return Classification {
            variant: FormVariant::Other,
            captcha: false,
        };
    };

    // form2 pulls its scripted form in through a <link> inside the container.
    let variant = if content.select(&link).next().is_some() {
        FormVariant::Form2
    } else {
        FormVariant::Form1
    };

    let captcha = document
        .select(&panel)
        .next()
        .map(|panel| panel.text().collect::<String>().contains(CAPTCHA_MARKER))
        .unwrap_or(false);

    Classification { variant, captcha }
}

pub fn landing_url(website: &str, server: &str) -> String {
    format!(
        "{}/modules.php?name=sud_delo&srv_num={server}&name_op=sf&delo_id=1540005",
        website.trim_end_matches('/')
    )
}

#[derive(Debug, Error)]
pub enum LandingError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("search form did not load")]
    NotLoaded,
}

impl Retryable for LandingError {
    fn is_retryable(&self) -> bool {
        match self {
            LandingError::Fetch(err) => err.is_retryable(),
            LandingError::NotLoaded => true,
        }
    }
}

/// Loads the landing page of `website` and classifies it. Loads are retried
/// while the fetcher fails or hands back an empty document; a page that
/// loaded without the form container is classified at once.
pub fn fetch_classification(
    fetcher: &mut dyn PageFetcher,
    website: &str,
    config: &CrawlConfig,
) -> Result<Classification, LandingError> {
    let url = landing_url(website, "1");
    let policy = RetryPolicy::from_config(&config.retry);

    let html = policy.run(&url, |attempt| {
        debug!(site = %website, attempt, "loading search form");
        fetcher.navigate(&url)?;
        if !fetcher.wait_for(FORM_CONTAINER, config.wait.landing()) {
            let html = fetcher.document()?;
            if html.trim().is_empty() {
                return Err(LandingError::NotLoaded);
            }
            return Ok(html);
        }
        pause(config.throttle.landing_settle());
        Ok(fetcher.document()?)
    })?;

    let classification = classify_form(&html);
    info!(
        site = %website,
        form = %classification.variant,
        captcha = classification.captcha,
        "site classified"
    );
    Ok(classification)
}
