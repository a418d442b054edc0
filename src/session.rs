use crate::captcha::{ChallengeResolver, acquire_token};
use crate::config::CrawlConfig;
use crate::extract::{ListingPage, PageExtractor};
use crate::fetch::{FetchError, Locator, PageFetcher, Retryable};
use crate::model::{CaseRecord, CaseStub, SearchQuery, SiteProfile};
use anyhow::Result;
use scraper::Html;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Shown in place of results when a paginated request outlived its captcha.
const SESSION_EXPIRED: Locator = Locator::Id("error");

const NO_RESULTS_MARKERS: [&str; 2] = ["Данных по запросу не обнаружено", "Ничего не найдено"];

#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Driver(#[from] FetchError),
    #[error("results did not appear on page {0}")]
    Missing(u32),
    #[error("results page {page} could not be parsed: {reason}")]
    Parse { page: u32, reason: String },
    #[error("captcha could not be renewed: {0}")]
    Captcha(String),
}

impl PageError {
    pub fn is_driver_error(&self) -> bool {
        matches!(self, PageError::Driver(_))
    }
}

impl Retryable for PageError {
    fn is_retryable(&self) -> bool {
        match self {
            PageError::Driver(err) => err.is_retryable(),
            PageError::Missing(_) | PageError::Parse { .. } => true,
            PageError::Captcha(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstPage {
    Listing(ListingPage),
    NoResults,
}

/// One search against one server of a court site. Holds the captcha token
/// that every request of the search must carry.
pub struct SearchSession<'a> {
    fetcher: &'a mut dyn PageFetcher,
    site: &'a SiteProfile,
    server: &'a str,
    extractor: &'a dyn PageExtractor,
    resolver: &'a dyn ChallengeResolver,
    config: &'a CrawlConfig,
    query: SearchQuery,
    token: String,
}

impl<'a> SearchSession<'a> {
    /// Acquires a captcha token first when the site demands one.
    pub fn open(
        fetcher: &'a mut dyn PageFetcher,
        site: &'a SiteProfile,
        server: &'a str,
        extractor: &'a dyn PageExtractor,
        resolver: &'a dyn ChallengeResolver,
        config: &'a CrawlConfig,
        query: SearchQuery,
    ) -> Result<Self> {
        let mut session = Self {
            fetcher,
            site,
            server,
            extractor,
            resolver,
            config,
            query,
            token: String::new(),
        };
        if site.captcha {
            session.renew_token()?;
        }
        Ok(session)
    }

    pub fn server(&self) -> &str {
        self.server
    }

    fn renew_token(&mut self) -> Result<()> {
        self.token = acquire_token(
            &mut *self.fetcher,
            self.site,
            self.extractor,
            self.resolver,
            self.config,
        )?;
        Ok(())
    }

    fn base_url(&self) -> String {
        let mut url = self
            .extractor
            .search_url(self.site, self.server, &self.query);
        url.push_str(&self.token);
        url
    }

    fn load(&mut self, url: &str) -> Result<bool, FetchError> {
        self.fetcher.navigate(url)?;
        Ok(self
            .fetcher
            .wait_for(self.extractor.listing_marker(), self.config.wait.listing()))
    }

    /// Loads and parses the first results page.
    pub fn first_page(&mut self) -> Result<FirstPage, PageError> {
        let url = self.base_url();
        debug!(site = %self.site.website, server = self.server, %url, "requesting first page");

        if !self.load(&url)? {
            let html = self.fetcher.document()?;
            if NO_RESULTS_MARKERS.iter().any(|marker| html.contains(marker)) {
                return Ok(FirstPage::NoResults);
            }
            return Err(PageError::Missing(1));
        }

        let html = self.fetcher.document()?;
        let listing = self
            .extractor
            .parse_listing(&html)
            .map_err(|err| PageError::Parse {
                page: 1,
                reason: format!("{err:#}"),
            })?;

        if listing.total == 0 {
            return Ok(FirstPage::NoResults);
        }

        info!(
            site = %self.site.website,
            server = self.server,
            cases = listing.total,
            pages = listing.page_count(),
            "search listing ready"
        );
        Ok(FirstPage::Listing(listing))
    }

    /// Loads a later results page. An expired captcha is renewed in place and
    /// the page requested once more.
    pub fn page(&mut self, page: u32) -> Result<Vec<CaseStub>, PageError> {
        let url = self.extractor.page_url(&self.base_url(), page);
        let mut ready = self.load(&url)?;

        if !ready && self.site.captcha && self.session_expired() {
            warn!(site = %self.site.website, server = self.server, page, "captcha expired; renewing");
            self.renew_token()
                .map_err(|err| PageError::Captcha(format!("{err:#}")))?;
            let url = self.extractor.page_url(&self.base_url(), page);
            ready = self.load(&url)?;
        }

        if !ready {
            return Err(PageError::Missing(page));
        }

        let html = self.fetcher.document()?;
        self.extractor
            .parse_stubs(&html)
            .ok_or(PageError::Missing(page))
    }

    fn session_expired(&self) -> bool {
        self.fetcher
            .document()
            .map(|html| SESSION_EXPIRED.is_present(&Html::parse_document(&html)))
            .unwrap_or(false)
    }

    /// Fetches one case page. Pages that fail to load or never show their
    /// content marker come back as not found.
    pub fn fetch_case(&mut self, stub: &CaseStub) -> CaseRecord {
        let url = self
            .extractor
            .case_url(self.site, self.server, &stub.case_id);

        if let Err(err) = self.fetcher.navigate(&url) {
            warn!(site = %self.site.website, case = %stub.case_id, error = %err, "case page failed to load");
            return self.tag(CaseRecord::not_found(&stub.case_id));
        }

        if let Some(marker) = self.extractor.case_marker()
            && !self.fetcher.wait_for(marker, self.config.wait.case())
        {
            warn!(site = %self.site.website, case = %stub.case_id, "case page content did not appear");
            return self.tag(CaseRecord::not_found(&stub.case_id));
        }

        let record = match self.fetcher.document() {
            Ok(html) => self.extractor.extract_case(&html, &stub.case_id),
            Err(err) => {
                warn!(site = %self.site.website, case = %stub.case_id, error = %err, "case page unreadable");
                CaseRecord::not_found(&stub.case_id)
            }
        };
        if !record.found {
            debug!(site = %self.site.website, case = %stub.case_id, "case content missing");
        }
        self.tag(record)
    }

    fn tag(&self, mut record: CaseRecord) -> CaseRecord {
        record.server = Some(self.server.to_string());
        record
    }
}
