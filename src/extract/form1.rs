//! Classic server-rendered court layout (`u1_case` search, `tablcont` results).

use super::{
    ListingPage, PageExtractor, clean_id_text, data_uri_payload, element_text, encode_param,
    fill_scalar_metadata, find_by_id, first_text, normalize_decision_text, parse_accused,
    selector, stubs_from_links,
};
use crate::captcha::CaptchaChallenge;
use crate::fetch::Locator;
use crate::model::{CaseRecord, CaseStub, FormVariant, SearchQuery, SiteProfile};
use anyhow::{Context, Result, bail};
use regex::Regex;
use scraper::Html;
use std::sync::LazyLock;

/// Fixed number of rows per results page.
pub const PAGE_SIZE: u32 = 25;

const ACTS_TAB: &str = " АКТЫ";
const PERSONS_TAB: &str = "ЛИЦА";
const PERSONS_HEADER_ROWS: usize = 2;

static COUNTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.").expect("form1 counter regex must be valid"));

pub struct Form1;

impl PageExtractor for Form1 {
    fn variant(&self) -> FormVariant {
        FormVariant::Form1
    }

    fn search_url(&self, site: &SiteProfile, server: &str, query: &SearchQuery) -> String {
        let mut url = format!(
            "{}/modules.php?name=sud_delo&srv_num={server}&name_op=r&delo_id=1540006&case_type=0&new=0&u1_case__ENTRY_DATE1D={}&u1_case__ENTRY_DATE2D={}&delo_table=u1_case&U1_PARTS__PARTS_TYPE=",
            site.base_url(),
            query.period.court_start(),
            query.period.court_end(),
        );
        if let Some(number) = &query.case_number {
            url.push_str("&u1_case__CASE_NUMBERSS=");
            url.push_str(&encode_param(number));
        }
        url
    }

    fn page_url(&self, base: &str, page: u32) -> String {
        format!("{base}&page={page}")
    }

    fn listing_marker(&self) -> Locator {
        Locator::Id("tablcont")
    }

    fn parse_listing(&self, html: &str) -> Result<ListingPage> {
        let stubs = self
            .parse_stubs(html)
            .context("results table tablcont is missing")?;

        let document = Html::parse_document(html);
        let counter = first_text(&document, "div#content table td[align=\"right\"]")
            .context("case counter cell is missing")?;
        let Some(caps) = COUNTER_RE.captures(&counter) else {
            bail!("case counter {counter:?} has no number");
        };
        let total = caps[1]
            .parse::<u32>()
            .with_context(|| format!("case counter {counter:?} is not a number"))?;

        Ok(ListingPage {
            total,
            page_size: PAGE_SIZE,
            stubs,
        })
    }

    fn parse_stubs(&self, html: &str) -> Option<Vec<CaseStub>> {
        let document = Html::parse_document(html);
        let table = document.select(&selector("table#tablcont")).next()?;
        let row = selector("tr");
        let cell = selector("td");
        let link = selector("a[href]");

        let hrefs: Vec<&str> = table
            .select(&row)
            .filter_map(|row| row.select(&cell).next())
            .filter_map(|first_cell| first_cell.select(&link).next())
            .filter_map(|a| a.value().attr("href"))
            .collect();

        Some(stubs_from_links(hrefs.into_iter(), FormVariant::Form1))
    }

    fn case_url(&self, site: &SiteProfile, server: &str, case_id: &str) -> String {
        format!(
            "{}/modules.php?name=sud_delo&srv_num={server}&name_op=case&{case_id}&delo_id=1540006",
            site.base_url()
        )
    }

    fn case_marker(&self) -> Option<Locator> {
        None
    }

    fn extract_case(&self, html: &str, case_id: &str) -> CaseRecord {
        let document = Html::parse_document(html);
        let mut record = CaseRecord::not_found(case_id);
        record.metadata.id_text = first_text(&document, "div.casenumber")
            .map(|text| clean_id_text(&text))
            .unwrap_or_default();

        let Some(content) = document.select(&selector("div.contentt")).next() else {
            return record;
        };
        record.found = true;

        for tab in document.select(&selector("ul.tabs li")) {
            let label = element_text(tab);
            let Some(tab_id) = tab.value().attr("id") else {
                continue;
            };
            let Some(body) = find_by_id(content, &tab_id.replace("tab", "cont")) else {
                continue;
            };

            if label.contains(ACTS_TAB) {
                record.case_text = normalize_decision_text(&element_text(body));
            }
            if label.contains(PERSONS_TAB) {
                record.metadata.accused =
                    parse_accused(body.select(&selector("tr")), PERSONS_HEADER_ROWS);
            }
        }

        if let Some(table) =
            find_by_id(content, "cont1").and_then(|tab| tab.select(&selector("table")).next())
        {
            fill_scalar_metadata(table.select(&selector("tr")), &mut record.metadata);
        }

        record
    }

    fn captcha_url(&self, site: &SiteProfile) -> String {
        format!(
            "{}/modules.php?name=sud_delo&srv_num=1&name_op=sf&delo_id=1540005",
            site.base_url()
        )
    }

    fn captcha_marker(&self) -> Locator {
        Locator::Id("content")
    }

    fn parse_captcha(&self, html: &str) -> Option<CaptchaChallenge> {
        let document = Html::parse_document(html);
        let form = document.select(&selector("div#content table")).next()?;
        let captcha_id = form
            .select(&selector("input[name=\"captchaid\"]"))
            .next()?
            .value()
            .attr("value")?
            .to_string();
        let image = form
            .select(&selector("img[src]"))
            .next()?
            .value()
            .attr("src")
            .and_then(data_uri_payload)?;

        Some(CaptchaChallenge {
            captcha_id,
            image_base64: image,
        })
    }
}
