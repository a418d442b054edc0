use anyhow::{Result, bail};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Search-form layout served by a court website.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FormVariant {
    Form1,
    Form2,
    Other,
}

impl FormVariant {
    pub fn is_supported(&self) -> bool {
        !matches!(self, FormVariant::Other)
    }
}

impl fmt::Display for FormVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FormVariant::Form1 => "form1",
            FormVariant::Form2 => "form2",
            FormVariant::Other => "other",
        };
        f.write_str(name)
    }
}

/// A court website as named by the caller or the court directory, before
/// its search form has been inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteTarget {
    pub website: String,
    pub region: String,
    pub court_code: Option<String>,
    pub servers: Vec<String>,
}

impl SiteTarget {
    pub fn profile(&self, variant: FormVariant, captcha: bool) -> SiteProfile {
        let servers = if self.servers.is_empty() {
            vec!["1".to_string()]
        } else {
            self.servers.clone()
        };
        SiteProfile {
            website: self.website.clone(),
            region: self.region.clone(),
            court_id: self.court_code.clone(),
            variant,
            captcha,
            servers,
        }
    }
}

/// Everything the crawler knows about one court website for the duration of a crawl.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteProfile {
    pub website: String,
    pub region: String,
    pub court_id: Option<String>,
    pub variant: FormVariant,
    pub captcha: bool,
    pub servers: Vec<String>,
}

impl SiteProfile {
    pub fn slug(&self) -> String {
        site_slug(&self.website)
    }

    pub fn result_key(&self, server: &str, year: i32) -> ResultKey {
        ResultKey {
            region: self.region.clone(),
            slug: self.slug(),
            server: server.to_string(),
            year,
        }
    }

    pub fn base_url(&self) -> &str {
        self.website.trim_end_matches('/')
    }
}

/// `http://chehov.mo.sudrf.ru/` -> `chehov_mo`
pub fn site_slug(website: &str) -> String {
    website
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .replace(".sudrf.ru", "")
        .replace('.', "_")
        .replace('/', "")
}

/// Inclusive registration-date range of a search.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SearchPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            bail!("search period ends ({end}) before it starts ({start})");
        }
        Ok(Self { start, end })
    }

    pub fn calendar_year(year: i32) -> Option<Self> {
        Some(Self {
            start: NaiveDate::from_ymd_opt(year, 1, 1)?,
            end: NaiveDate::from_ymd_opt(year, 12, 31)?,
        })
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn year(&self) -> i32 {
        self.start.year()
    }

    /// Court sites expect `DD.MM.YYYY`.
    pub fn court_start(&self) -> String {
        court_date(self.start)
    }

    pub fn court_end(&self) -> String {
        court_date(self.end)
    }

    /// The aggregator portal expects ISO dates.
    pub fn portal_start(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn portal_end(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }
}

pub fn court_date(date: NaiveDate) -> String {
    date.format("%d.%m.%Y").to_string()
}

/// Parses either `DD.MM.YYYY` or `YYYY-MM-DD`.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d.%m.%Y"))
        .map_err(|_| anyhow::anyhow!("unrecognised date {value:?}; expected YYYY-MM-DD or DD.MM.YYYY"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub keyword: Option<String>,
    pub period: SearchPeriod,
    pub case_number: Option<String>,
}

impl SearchQuery {
    pub fn by_period(period: SearchPeriod) -> Self {
        Self {
            keyword: None,
            period,
            case_number: None,
        }
    }

    pub fn by_keyword(keyword: &str, period: SearchPeriod) -> Self {
        Self {
            keyword: Some(keyword.to_string()),
            period,
            case_number: None,
        }
    }

    pub fn by_case_number(case_number: &str, admitted: NaiveDate) -> Self {
        Self {
            keyword: None,
            period: SearchPeriod::single_day(admitted),
            case_number: Some(case_number.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Accused {
    pub name: String,
    #[serde(default)]
    pub article: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaseMetadata {
    #[serde(default)]
    pub id_text: String,
    #[serde(default)]
    pub accused: Vec<Accused>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adm_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid_2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub court_name: Option<String>,
}

/// A case reference found on a listing page, before its detail page is fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaseStub {
    #[serde(rename = "case_id_uid")]
    pub case_id: String,
    #[serde(rename = "case_url")]
    pub link: String,
    #[serde(rename = "metadata", default)]
    pub preview: CaseMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaseRecord {
    #[serde(rename = "case_id_uid")]
    pub case_id: String,
    #[serde(rename = "case_found")]
    pub found: bool,
    #[serde(default)]
    pub case_text: String,
    #[serde(default)]
    pub metadata: CaseMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

impl CaseRecord {
    pub fn not_found(case_id: &str) -> Self {
        Self {
            case_id: case_id.to_string(),
            found: false,
            case_text: String::new(),
            metadata: CaseMetadata::default(),
            server: None,
            keyword: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrawlLog {
    pub cases_found: bool,
    pub driver_error: bool,
    #[serde(default)]
    pub pagination_error: Vec<u32>,
}

impl CrawlLog {
    pub fn record_page_gap(&mut self, page: u32) {
        if !self.pagination_error.contains(&page) {
            self.pagination_error.push(page);
        }
    }

    pub fn has_gaps(&self) -> bool {
        !self.pagination_error.is_empty()
    }
}

/// Query a result file was produced with; lets a later run re-issue it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrawlQuery {
    #[serde(flatten)]
    pub period: SearchPeriod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub court_code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteResult {
    #[serde(default)]
    pub num_cases: u32,
    #[serde(default)]
    pub cases: Vec<CaseRecord>,
    #[serde(default)]
    pub logs: CrawlLog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<CrawlQuery>,
}

impl SiteResult {
    pub fn with_query(query: CrawlQuery) -> Self {
        Self {
            query: Some(query),
            ..Self::default()
        }
    }

    pub fn contains(&self, case_id: &str) -> bool {
        self.cases.iter().any(|case| case.case_id == case_id)
    }

    /// Replaces a record with the same identifier in place; appends otherwise.
    /// Returns `true` when the record was new.
    pub fn upsert_case(&mut self, record: CaseRecord) -> bool {
        match self
            .cases
            .iter_mut()
            .find(|case| case.case_id == record.case_id)
        {
            Some(existing) => {
                *existing = record;
                false
            }
            None => {
                self.cases.push(record);
                true
            }
        }
    }

    pub fn case_ids(&self) -> BTreeSet<&str> {
        self.cases.iter().map(|case| case.case_id.as_str()).collect()
    }
}

/// On-disk shape of one per-server result file: `{website: SiteResult}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ResultFile {
    pub sites: BTreeMap<String, SiteResult>,
}

impl ResultFile {
    pub fn single(website: &str, result: SiteResult) -> Self {
        let mut sites = BTreeMap::new();
        sites.insert(website.to_string(), result);
        Self { sites }
    }

    pub fn first(&self) -> Option<(&String, &SiteResult)> {
        self.sites.iter().next()
    }

    pub fn first_mut(&mut self) -> Option<(&String, &mut SiteResult)> {
        self.sites.iter_mut().next()
    }
}

/// `{region}_{slug}_{server}_{year}.json`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResultKey {
    pub region: String,
    pub slug: String,
    pub server: String,
    pub year: i32,
}

impl ResultKey {
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}.json",
            self.region, self.slug, self.server, self.year
        )
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".json")?;
        let (region, rest) = stem.split_once('_')?;
        let (rest, year) = rest.rsplit_once('_')?;
        let (slug, server) = rest.rsplit_once('_')?;

        if region.is_empty() || slug.is_empty() {
            return None;
        }
        if server.is_empty() || !server.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        Some(Self {
            region: region.to_string(),
            slug: slug.to_string(),
            server: server.to_string(),
            year: year.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    #[default]
    Ok,
    NoResults,
    RequestFailed,
}

/// Portal search results for one keyword.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeywordResults {
    #[serde(default)]
    pub status: SearchStatus,
    #[serde(default)]
    pub n_cases: u32,
    #[serde(default)]
    pub cases: Vec<CaseStub>,
    #[serde(default)]
    pub logs: CrawlLog,
}

impl KeywordResults {
    pub fn request_failed() -> Self {
        Self {
            status: SearchStatus::RequestFailed,
            ..Self::default()
        }
    }
}

/// Per-site summary returned by a date-range crawl.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrawlSummary {
    pub website: String,
    pub year: i32,
    pub n_cases_by_server: BTreeMap<String, u32>,
}
