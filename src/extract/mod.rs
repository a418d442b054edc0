//! Per-variant parsing of court-site listing and case pages.
//!
//! Both court layouts are served through [`PageExtractor`]; the crawler picks
//! the implementation from the classifier's verdict and never branches on the
//! variant itself.

pub mod form1;
pub mod form2;

use crate::captcha::CaptchaChallenge;
use crate::fetch::Locator;
use crate::model::{Accused, CaseMetadata, CaseRecord, CaseStub, FormVariant, SearchQuery, SiteProfile};
use anyhow::Result;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use tracing::warn;

pub use form1::Form1;
pub use form2::Form2;

/// Statute reference marker ("Criminal Code of the RF").
pub const ARTICLE_MARKER: &str = "УК РФ";

const LABEL_UID: &str = "идентификатор";
const LABEL_ADMITTED: &str = "Дата поступления";
const LABEL_JUDGE: &str = "Судья";
const LABEL_RESULT: &str = "Результат";

/// Case-link patterns, id+uid pair first, then uid alone.
static FORM1_KEY_RE: LazyLock<(Regex, Regex)> =
    LazyLock::new(|| case_key_patterns("case_id", "case_uid"));
static FORM2_KEY_RE: LazyLock<(Regex, Regex)> =
    LazyLock::new(|| case_key_patterns("_id", "_uid"));

fn case_key_patterns(id_param: &str, uid_param: &str) -> (Regex, Regex) {
    let paired = Regex::new(&format!(r"(?:^|[?&]){id_param}=(\d+)&{uid_param}=([^&#]+)"))
        .expect("case key regex must be valid");
    let uid_only = Regex::new(&format!(r"(?:^|[?&]){uid_param}=([^&#]+)"))
        .expect("case uid regex must be valid");
    (paired, uid_only)
}

/// One parsed search-results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub total: u32,
    pub page_size: u32,
    pub stubs: Vec<CaseStub>,
}

impl ListingPage {
    pub fn page_count(&self) -> u32 {
        page_count(self.total, self.page_size)
    }
}

pub trait PageExtractor {
    fn variant(&self) -> FormVariant;

    fn search_url(&self, site: &SiteProfile, server: &str, query: &SearchQuery) -> String;

    /// `base` already carries any captcha token.
    fn page_url(&self, base: &str, page: u32) -> String;

    fn listing_marker(&self) -> Locator;

    /// Parses the first results page: total count, page size, and stubs.
    fn parse_listing(&self, html: &str) -> Result<ListingPage>;

    /// Stubs of any results page; `None` when the results table is absent.
    fn parse_stubs(&self, html: &str) -> Option<Vec<CaseStub>>;

    fn case_url(&self, site: &SiteProfile, server: &str, case_id: &str) -> String;

    /// Marker that must appear before a case page is read, if the layout needs one.
    fn case_marker(&self) -> Option<Locator>;

    fn extract_case(&self, html: &str, case_id: &str) -> CaseRecord;

    fn captcha_url(&self, site: &SiteProfile) -> String;

    fn captcha_marker(&self) -> Locator;

    fn parse_captcha(&self, html: &str) -> Option<CaptchaChallenge>;
}

pub fn extractor_for(variant: FormVariant) -> Option<Box<dyn PageExtractor>> {
    match variant {
        FormVariant::Form1 => Some(Box::new(Form1)),
        FormVariant::Form2 => Some(Box::new(Form2)),
        FormVariant::Other => None,
    }
}

pub fn page_count(num_cases: u32, page_size: u32) -> u32 {
    if page_size == 0 {
        return 0;
    }
    num_cases.div_ceil(page_size)
}

/// Cases a given 1-based page should hold when `total` cases are split into
/// pages of `page_size`.
pub fn expected_on_page(total: u32, page_size: u32, page: u32) -> u32 {
    let pages = page_count(total, page_size);
    if page == 0 || page > pages {
        return 0;
    }
    if page < pages {
        page_size
    } else {
        total - page_size * (pages - 1)
    }
}

/// Logs when a page holds a different number of cases than the total implies.
pub fn check_page_shape(site: &str, page: u32, total: u32, page_size: u32, found: usize) -> bool {
    let expected = expected_on_page(total, page_size, page);
    let ok = expected as usize == found;
    if !ok {
        warn!(
            %site,
            page,
            total,
            page_size,
            expected,
            found,
            "listing page size does not match total; parsed counts not trusted"
        );
    }
    ok
}

/// Quotes become single quotes, non-breaking spaces are dropped.
pub fn normalize_decision_text(text: &str) -> String {
    text.replace('"', "'").replace('\u{a0}', "")
}

/// `"ст.111 УК РФ;ст.112 УК РФ"` -> `["ст.111 ", "ст.112 "]`
pub fn split_articles(cell: &str) -> Vec<String> {
    cell.split(';')
        .filter(|piece| !piece.trim().is_empty())
        .map(|piece| match piece.trim_end().strip_suffix(ARTICLE_MARKER) {
            Some(stripped) => stripped.to_string(),
            None => piece.to_string(),
        })
        .collect()
}

/// Pulls the composite identifier out of a case link. Prefers the id+uid
/// pair and falls back to the uid alone.
pub fn extract_case_key(link: &str, variant: FormVariant) -> Option<String> {
    let ((id_param, uid_param), (paired, uid_only)) = match variant {
        FormVariant::Form1 => (("case_id", "case_uid"), &*FORM1_KEY_RE),
        FormVariant::Form2 | FormVariant::Other => (("_id", "_uid"), &*FORM2_KEY_RE),
    };

    if let Some(caps) = paired.captures(link) {
        return Some(format!("{id_param}={}&{uid_param}={}", &caps[1], &caps[2]));
    }
    uid_only
        .captures(link)
        .map(|caps| format!("{uid_param}={}", &caps[1]))
}

pub(crate) fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector must be valid")
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

pub(crate) fn first_text(document: &Html, css: &str) -> Option<String> {
    document.select(&selector(css)).next().map(element_text)
}

pub(crate) fn find_by_id<'a>(scope: ElementRef<'a>, id: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(&format!("[id=\"{id}\"]")).ok()?;
    scope.select(&selector).next()
}

pub(crate) fn clean_id_text(text: &str) -> String {
    text.replace(['\n', '\t'], "")
}

/// Reads accused rows after `header_rows` leading rows. The first cell is the
/// name; every cell carrying the statute marker contributes articles.
pub(crate) fn parse_accused<'a>(
    rows: impl Iterator<Item = ElementRef<'a>>,
    header_rows: usize,
) -> Vec<Accused> {
    let cell = selector("td");
    rows.skip(header_rows)
        .filter_map(|row| {
            let cells: Vec<ElementRef<'_>> = row.select(&cell).collect();
            let name = element_text(*cells.first()?);
            let article = cells
                .iter()
                .map(|cell| element_text(*cell))
                .filter(|text| text.contains(ARTICLE_MARKER))
                .flat_map(|text| split_articles(&text))
                .collect();
            Some(Accused { name, article })
        })
        .collect()
}

/// Fills judge, admission date, result, and secondary uid from labelled rows;
/// the value is the row's last cell.
pub(crate) fn fill_scalar_metadata<'a>(
    rows: impl Iterator<Item = ElementRef<'a>>,
    metadata: &mut CaseMetadata,
) {
    let cell = selector("td");
    for row in rows {
        let label = element_text(row);
        let Some(value) = row.select(&cell).last().map(element_text) else {
            continue;
        };

        if label.contains(LABEL_UID) {
            metadata.uid_2 = Some(value.clone());
        }
        if label.contains(LABEL_ADMITTED) {
            metadata.adm_date = Some(value.clone());
        }
        if label.contains(LABEL_JUDGE) {
            metadata.judge = Some(value.clone());
        }
        if label.contains(LABEL_RESULT) {
            metadata.decision_result = Some(value);
        }
    }
}

/// Stubs from result-table links, skipping rows without a recognisable id.
pub(crate) fn stubs_from_links<'a>(
    links: impl Iterator<Item = &'a str>,
    variant: FormVariant,
) -> Vec<CaseStub> {
    let mut stubs = Vec::new();
    for href in links {
        match extract_case_key(href, variant) {
            Some(case_id) => stubs.push(CaseStub {
                case_id,
                link: href.to_string(),
                preview: CaseMetadata::default(),
            }),
            None => warn!(%href, form = %variant, "case link without identifier skipped"),
        }
    }
    stubs
}

/// Base64 payload of a `data:` image URI.
pub(crate) fn data_uri_payload(src: &str) -> Option<String> {
    if !src.starts_with("data:") {
        return None;
    }
    src.split_once(',').map(|(_, payload)| payload.to_string())
}

pub(crate) fn encode_param(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
