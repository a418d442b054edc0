//! Scripted court layout (`resultTable` results, bookmark tabs). Page size
//! varies by site and is read from the listing itself.

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

const ACTS_TAB: &str = "Судебны";
const PERSONS_TAB: &str = "Лица";
const PERSONS_HEADER_ROWS: usize = 1;

static TOTAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"найдено\s*[-–—]\s*(\d+)").expect("form2 total regex must be valid")
});
static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"с\s+(\d+)\s+по\s+(\d+)").expect("form2 range regex must be valid")
});

pub struct Form2;

impl PageExtractor for Form2 {
    fn variant(&self) -> FormVariant {
        FormVariant::Form2
    }

    fn search_url(&self, site: &SiteProfile, server: &str, query: &SearchQuery) -> String {
        let court_code = site.court_id.as_deref().unwrap_or_default();
        let case_number = query
            .case_number
            .as_deref()
            .map(encode_param)
            .unwrap_or_default();
        // case__num_build coincides with the server number
        format!(
            "{}/modules.php?name_op=r&name=sud_delo&srv_num={server}&_deloId=1540006&case__case_type=0&_new=0&case__vnkod={court_code}&case__num_build={server}&case__case_numberss={case_number}&case__judicial_uidss=&parts__namess=&case__entry_date1d={}&case__entry_date2d={}",
            site.base_url(),
            query.period.court_start(),
            query.period.court_end(),
        )
    }

    fn page_url(&self, base: &str, page: u32) -> String {
        format!("{base}&_page={page}")
    }

    fn listing_marker(&self) -> Locator {
        Locator::Id("resultTable")
    }

    fn parse_listing(&self, html: &str) -> Result<ListingPage> {
        let stubs = self
            .parse_stubs(html)
            .context("results table resultTable is missing")?;

        let document = Html::parse_document(html);
        let counter =
            first_text(&document, "div.lawcase-count").context("case counter is missing")?;

        let Some(total) = TOTAL_RE.captures(&counter) else {
            bail!("case counter {counter:?} has no total");
        };
        let total = total[1].parse::<u32>()?;

        let page_size = match RANGE_RE.captures(&counter) {
            Some(caps) => {
                let from = caps[1].parse::<u32>()?;
                let to = caps[2].parse::<u32>()?;
                to.saturating_sub(from) + 1
            }
            None if total == 0 => 0,
            None => bail!("case counter {counter:?} has no page range"),
        };

        Ok(ListingPage {
            total,
            page_size,
            stubs,
        })
    }

    fn parse_stubs(&self, html: &str) -> Option<Vec<CaseStub>> {
        let document = Html::parse_document(html);
        document.select(&selector("#resultTable")).next()?;

        let hrefs: Vec<&str> = document
            .select(&selector("td.lawcase-number-td a[href]"))
            .filter_map(|a| a.value().attr("href"))
            .collect();

        Some(stubs_from_links(hrefs.into_iter(), FormVariant::Form2))
    }

    fn case_url(&self, site: &SiteProfile, server: &str, case_id: &str) -> String {
        format!(
            "{}/modules.php?name=sud_delo&name_op=case&{case_id}&_deloId=1540006&_caseType=0&_new=0&srv_num={server}",
            site.base_url()
        )
    }

    fn case_marker(&self) -> Option<Locator> {
        Some(Locator::Id("case_bookmarks"))
    }

    fn extract_case(&self, html: &str, case_id: &str) -> CaseRecord {
        let document = Html::parse_document(html);
        let mut record = CaseRecord::not_found(case_id);
        record.metadata.id_text = first_text(&document, "div.case-num")
            .map(|text| clean_id_text(&text))
            .unwrap_or_default();

        let Some(content) = document.select(&selector("div#search_results")).next() else {
            return record;
        };
        record.found = true;

        for tab in document.select(&selector("ul#case_bookmarks li")) {
            let label = element_text(tab);
            let Some(tab_id) = tab.value().attr("id") else {
                continue;
            };
            let Some(body) = find_by_id(content, &tab_id.replace("id", "content")) else {
                continue;
            };

            if label.contains(ACTS_TAB) {
                record.case_text = normalize_decision_text(&element_text(body));
            }
            if label.contains(PERSONS_TAB)
                && let Some(table) = body.select(&selector("table")).next()
            {
                record.metadata.accused =
                    parse_accused(table.select(&selector("tr")), PERSONS_HEADER_ROWS);
            }
        }

        if let Some(table) = content.select(&selector("table.law-case-table")).next() {
            fill_scalar_metadata(table.select(&selector("tr")), &mut record.metadata);
        }

        record
    }

    fn captcha_url(&self, site: &SiteProfile) -> String {
        format!(
            "{}/modules.php?name=sud_delo&name_op=sf&srv_num=1",
            site.base_url()
        )
    }

    fn captcha_marker(&self) -> Locator {
        Locator::Id("search-form")
    }

    fn parse_captcha(&self, html: &str) -> Option<CaptchaChallenge> {
        let document = Html::parse_document(html);
        let form = document.select(&selector("form.form-container")).next()?;
        let captcha_id = form
            .select(&selector("input[name=\"captchaid\"]"))
            .next()?
            .value()
            .attr("value")?
            .to_string();
        let image = form
            .select(&selector("img[src]"))
            .filter_map(|img| img.value().attr("src"))
            .find_map(data_uri_payload)?;

        Some(CaptchaChallenge {
            captcha_id,
            image_base64: image,
        })
    }
}
