//! Keyword search on the bsr.sudrf.ru aggregator portal.
//!
//! The portal is a single-page application addressed by a JSON request in
//! the URL fragment. Listing pages are opened in throwaway tabs so the first
//! tab keeps the search session alive.

use crate::config::CrawlConfig;
use crate::extract::{ARTICLE_MARKER, element_text, normalize_decision_text, selector, split_articles};
use crate::fetch::{FetchError, Locator, PageFetcher, pause};
use crate::model::{
    Accused, CaseMetadata, CaseRecord, CaseStub, CrawlLog, KeywordResults, SearchPeriod,
    SearchStatus,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;
use scraper::{ElementRef, Html};
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const PORTAL_URL: &str = "https://bsr.sudrf.ru/bigs/portal.html";

/// Results per portal listing page.
pub const PAGE_SIZE: u32 = 20;

const NO_RESULTS: &str = "Ничего не найдено";
const CASE_TITLE_PREFIX: &str = "Уголовное дело ";

const RESULTS_LIST: Locator = Locator::Class("resultsList");
const DOCUMENT_BODY: Locator = Locator::Class("documentInner");
const CAPTCHA_DIALOG: Locator = Locator::Id("modalWindow_capchaDialog");
const CAPTCHA_INPUT: Locator = Locator::Css("#capchaDialog input");
const CAPTCHA_SUBMIT: Locator = Locator::Class("ui-button-text");
const CASE_TAB: Locator = Locator::Css("#cardContainer ul li:first-child label");

/// Characters left as-is when the request is put in the URL.
const FRAGMENT_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b':')
    .remove(b'#')
    .remove(b',')
    .remove(b'=')
    .remove(b'&')
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');

static UID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-zA-Z]{8}-(?:[0-9a-zA-Z]{4}-){3}[0-9a-zA-Z]{12}")
        .expect("session uid regex must be valid")
});

static CASE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[?&#])id=([^&]+)&shard=").expect("portal case id regex must be valid")
});

pub fn encode_portal_url(raw: &str) -> String {
    utf8_percent_encode(raw, FRAGMENT_SAFE).to_string()
}

fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// The keyword plus a registration-date range on criminal cases.
fn multiquery(keyword: &str, period: &SearchPeriod) -> String {
    let simple = format!(
        r#"{{"query":{},"type":"NEAR","mode":"SIMPLE"}}"#,
        json_string(keyword)
    );
    let dates = format!(
        r#"{{"mode":"EXTENDED","typeRequests":[{{"fieldRequests":[{{"name":"case_user_doc_entry_date","operator":"B","query":"{start}T00:00:00","sQuery":"{end}T00:00:00","fieldName":"case_user_doc_entry_date"}}],"mode":"AND","name":"common","typesMode":"AND"}}]}}"#,
        start = period.portal_start(),
        end = period.portal_end(),
    );
    format!(
        r#""multiqueryRequest":{{"queryRequests":[{{"type":"Q","queryRequestRole":"SIMPLE","request":{},"operator":"AND"}},{{"type":"Q","request":{},"operator":"AND","queryRequestRole":"CATEGORIES"}}]}}"#,
        json_string(&simple),
        json_string(&dates),
    )
}

/// Unencoded URL of the first results page.
pub fn search_request(keyword: &str, period: &SearchPeriod) -> String {
    format!(
        r#"{PORTAL_URL}#{{"type":"MULTIQUERY",{},"sorts":[{{"field":"score","order":"desc"}}],"simpleSearchFieldsBundle":"ug","noOrpho":false,"rows":{PAGE_SIZE}}}"#,
        multiquery(keyword, period)
    )
}

/// Unencoded URL of the results page starting at offset `start`, bound to
/// the session `uid` of the first page.
pub fn page_request(keyword: &str, period: &SearchPeriod, start: u32, uid: &str) -> String {
    format!(
        r#"{PORTAL_URL}#{{"start":{start},"rows":{PAGE_SIZE},"uid":"{uid}","type":"MULTIQUERY",{},"sorts":[{{"field":"score","order":"desc"}}],"simpleSearchFieldsBundle":"ug","noOrpho":false,"facet":{{"field":["type"]}},"facetLimit":21,"additionalFields":["court_document_documentype1","court_case_entry_date","court_case_result_date","court_subject_rf","court_name_court","court_document_law_article","court_case_result","case_user_document_type","case_user_doc_entry_date","case_user_doc_result_date","case_doc_subject_rf","case_user_doc_court","case_doc_instance","case_document_category_article","case_user_doc_result","case_user_entry_date","m_case_user_type","m_case_user_sub_type","ora_main_law_article"],"hlFragSize":1000,"groupLimit":3,"woBoost":false}}"#,
        multiquery(keyword, period)
    )
}

/// Session uid carried by a case link of the current search.
pub fn session_uid(link: &str) -> Option<String> {
    UID_RE.find(link).map(|found| found.as_str().to_string())
}

/// One parsed portal listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalListing {
    pub total: u32,
    pub stubs: Vec<CaseStub>,
}

/// `None` when the results list is absent. The literal "nothing found" item
/// reads as an empty listing.
pub fn parse_portal_listing(html: &str) -> Option<PortalListing> {
    let document = Html::parse_document(html);
    let list = document.select(&selector("ul#resultsList")).next()?;
    let items: Vec<ElementRef<'_>> = list.select(&selector("li")).collect();

    if items
        .first()
        .is_some_and(|first| element_text(*first).trim() == NO_RESULTS)
    {
        return Some(PortalListing {
            total: 0,
            stubs: Vec::new(),
        });
    }

    let total = match document
        .select(&selector("div#resultCount"))
        .next()
        .and_then(|count| count.value().attr("data-total"))
        .and_then(|total| total.trim().parse().ok())
    {
        Some(total) => total,
        None => {
            warn!(
                items = items.len(),
                "portal result count missing; total taken from the listed items"
            );
            items.len() as u32
        }
    };

    let stubs = items.into_iter().filter_map(parse_result_item).collect();
    Some(PortalListing { total, stubs })
}

fn parse_result_item(item: ElementRef<'_>) -> Option<CaseStub> {
    let href = item
        .select(&selector("a.resultHeader"))
        .next()?
        .value()
        .attr("href")?;
    let case_id = CASE_ID_RE.captures(href)?[1].to_string();

    let mut preview = CaseMetadata::default();
    if let Some(title) = item.select(&selector("div.bgs-result a")).next() {
        preview.id_text = element_text(title).replace(CASE_TITLE_PREFIX, "").trim().to_string();
    }

    for field in item.select(&selector("span.resultHeaderAttributes span.additional-field-value")) {
        let Some(comment) = field.value().attr("data-comment") else {
            continue;
        };
        let value = field
            .select(&selector("span"))
            .next()
            .map(element_text)
            .unwrap_or_else(|| element_text(field));
        let value = value.trim().to_string();

        if comment.contains("Наименование суда") {
            preview.court_name = Some(value);
        } else if comment.contains("Дата поступления") {
            preview.adm_date = Some(value);
        } else if comment.contains("Результат") {
            preview.decision_result = Some(value);
        }
    }

    Some(CaseStub {
        case_id,
        link: absolute_link(href),
        preview,
    })
}

/// Relative links are resolved against the portal; absolute ones are kept
/// verbatim since they are percent-encoded again before navigation.
fn absolute_link(href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    Url::parse(PORTAL_URL)
        .and_then(|base| base.join(href))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Runs one keyword search over `period`, paging through every result. A
/// first page that never renders fails the keyword; later pages that fail
/// are recorded as gaps and skipped.
pub fn search_keyword(
    fetcher: &mut dyn PageFetcher,
    config: &CrawlConfig,
    keyword: &str,
    period: &SearchPeriod,
) -> KeywordResults {
    let url = encode_portal_url(&search_request(keyword, period));
    debug!(%keyword, %url, "portal search");

    if let Err(err) = fetcher.navigate(&url) {
        warn!(%keyword, error = %err, "portal search failed to load");
        return KeywordResults::request_failed();
    }
    if !fetcher.wait_for(RESULTS_LIST, config.wait.portal_listing()) {
        warn!(%keyword, "portal results never appeared");
        return KeywordResults::request_failed();
    }
    let Some(first) = fetcher.document().ok().as_deref().and_then(parse_portal_listing) else {
        return KeywordResults::request_failed();
    };

    if first.total == 0 {
        info!(%keyword, "portal search found nothing");
        return KeywordResults {
            status: SearchStatus::NoResults,
            ..KeywordResults::default()
        };
    }

    let mut results = KeywordResults {
        status: SearchStatus::Ok,
        n_cases: first.total,
        cases: Vec::new(),
        logs: CrawlLog {
            cases_found: true,
            ..CrawlLog::default()
        },
    };
    let mut seen = HashSet::new();
    collect_unique(&mut results.cases, &mut seen, first.stubs);

    let uid = results.cases.first().and_then(|stub| session_uid(&stub.link));
    for start in (PAGE_SIZE..results.n_cases).step_by(PAGE_SIZE as usize) {
        let page = start / PAGE_SIZE + 1;
        let Some(uid) = uid.as_deref() else {
            warn!(%keyword, page, "no session uid in case links; page skipped");
            results.logs.record_page_gap(page);
            continue;
        };

        match fetch_listing_page(fetcher, config, &page_request(keyword, period, start, uid)) {
            Ok(stubs) => collect_unique(&mut results.cases, &mut seen, stubs),
            Err(err) => {
                warn!(%keyword, page, error = %err, "portal page skipped");
                if matches!(err, PortalPageError::Driver(_)) {
                    results.logs.driver_error = true;
                }
                results.logs.record_page_gap(page);
            }
        }

        pause(config.throttle.page_delay());
        if start % config.throttle.block_every_cases == 0 {
            pause(config.throttle.block_delay());
        }
    }

    info!(
        %keyword,
        listed = results.n_cases,
        collected = results.cases.len(),
        gaps = ?results.logs.pagination_error,
        "portal search finished"
    );
    results
}

/// Searches each keyword in turn.
pub fn search_keywords(
    fetcher: &mut dyn PageFetcher,
    config: &CrawlConfig,
    keywords: &[String],
    period: &SearchPeriod,
) -> BTreeMap<String, KeywordResults> {
    keywords
        .iter()
        .map(|keyword| {
            let results = search_keyword(&mut *fetcher, config, keyword, period);
            (keyword.clone(), results)
        })
        .collect()
}

fn collect_unique(into: &mut Vec<CaseStub>, seen: &mut HashSet<String>, stubs: Vec<CaseStub>) {
    for stub in stubs {
        if seen.insert(stub.case_id.clone()) {
            into.push(stub);
        } else {
            debug!(case = %stub.case_id, "case listed twice");
        }
    }
}

#[derive(Debug, Error)]
enum PortalPageError {
    #[error(transparent)]
    Driver(#[from] FetchError),
    #[error("results list did not appear")]
    Missing,
}

/// Opens `raw_url` in a fresh tab and closes it again whatever happens.
fn fetch_listing_page(
    fetcher: &mut dyn PageFetcher,
    config: &CrawlConfig,
    raw_url: &str,
) -> Result<Vec<CaseStub>, PortalPageError> {
    fetcher.open_tab()?;
    let loaded = load_listing(fetcher, config, raw_url);
    if let Err(err) = fetcher.close_tab() {
        warn!(error = %err, "listing tab not closed");
    }
    loaded
}

fn load_listing(
    fetcher: &mut dyn PageFetcher,
    config: &CrawlConfig,
    raw_url: &str,
) -> Result<Vec<CaseStub>, PortalPageError> {
    fetcher.navigate(&encode_portal_url(raw_url))?;
    if !fetcher.wait_for(RESULTS_LIST, config.wait.portal_listing()) {
        return Err(PortalPageError::Missing);
    }
    let html = fetcher.document()?;
    parse_portal_listing(&html)
        .map(|listing| listing.stubs)
        .ok_or(PortalPageError::Missing)
}

/// Accused rows, judge link, and the decision frame source of a portal case page.
pub fn parse_portal_case(html: &str, stub: &CaseStub) -> (CaseRecord, Option<String>) {
    let document = Html::parse_document(html);
    let mut record = CaseRecord::not_found(&stub.case_id);
    record.found = true;
    record.metadata = stub.preview.clone();

    if let Some(table) = document.select(&selector("div.sudrf-dt")).next() {
        let cell = selector("td");
        record.metadata.accused = table
            .select(&selector("tr"))
            .skip(1)
            .filter_map(|row| {
                let cells: Vec<String> = row.select(&cell).map(element_text).collect();
                let name = cells.first()?.trim().to_string();
                let article = cells
                    .iter()
                    .filter(|text| text.contains(ARTICLE_MARKER))
                    .flat_map(|text| split_articles(text))
                    .collect();
                Some(Accused { name, article })
            })
            .collect();
    }

    record.metadata.judge = document
        .select(&selector("#bookmark0 table tr:first-child td:nth-child(2) a"))
        .next()
        .map(|link| element_text(link).trim().to_string())
        .filter(|judge| !judge.is_empty());

    let frame = document
        .select(&selector("iframe[src]"))
        .next()
        .and_then(|frame| frame.value().attr("src"))
        .map(absolute_link);

    (record, frame)
}

/// Body text of a decision document.
pub fn parse_decision_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .select(&selector("body"))
        .next()
        .map(|body| normalize_decision_text(element_text(body).trim()))
        .unwrap_or_default()
}

/// Loads one portal case in a fresh tab. `None` when the page never renders.
pub fn fetch_portal_case(
    fetcher: &mut dyn PageFetcher,
    config: &CrawlConfig,
    stub: &CaseStub,
) -> Option<CaseRecord> {
    if let Err(err) = fetcher.open_tab() {
        warn!(case = %stub.case_id, error = %err, "case tab not opened");
        return None;
    }
    let record = load_portal_case(fetcher, config, stub);
    if let Err(err) = fetcher.close_tab() {
        warn!(error = %err, "case tab not closed");
    }
    record
}

fn load_portal_case(
    fetcher: &mut dyn PageFetcher,
    config: &CrawlConfig,
    stub: &CaseStub,
) -> Option<CaseRecord> {
    if let Err(err) = fetcher.navigate(&encode_portal_url(&stub.link)) {
        warn!(case = %stub.case_id, error = %err, "case page failed to load");
        return None;
    }
    if !fetcher.wait_for(DOCUMENT_BODY, config.wait.portal_case()) {
        return None;
    }
    pause(config.throttle.case_delay());

    let html = fetcher.document().ok()?;
    if CAPTCHA_DIALOG.is_present(&Html::parse_document(&html)) {
        // The portal's dialog accepts any answer.
        debug!(case = %stub.case_id, "dismissing portal captcha dialog");
        if let Err(err) = fetcher
            .fill_and_submit(CAPTCHA_INPUT, "1")
            .and_then(|()| fetcher.click(CAPTCHA_SUBMIT))
        {
            warn!(case = %stub.case_id, error = %err, "portal captcha dialog not dismissed");
        }
        pause(config.throttle.block_delay());
        if !fetcher.wait_for(DOCUMENT_BODY, config.wait.portal_case()) {
            return None;
        }
    }

    if let Err(err) = fetcher.click(CASE_TAB) {
        debug!(case = %stub.case_id, error = %err, "case tab not clicked");
    }

    let html = fetcher.document().ok()?;
    let (mut record, frame) = parse_portal_case(&html, stub);

    if let Some(frame) = frame {
        match fetcher.navigate(&frame) {
            Ok(()) => {
                if let Ok(body) = fetcher.document() {
                    record.case_text = parse_decision_text(&body);
                }
            }
            Err(err) => warn!(case = %stub.case_id, error = %err, "decision text failed to load"),
        }
    }

    Some(record)
}

