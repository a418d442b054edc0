use crate::config::CrawlConfig;
use crate::extract::{element_text, selector};
use crate::fetch::{Locator, PageFetcher, RetryPolicy, fetch_json};
use crate::model::{SiteTarget, site_slug};
use crate::store::load_json;
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use scraper::Html;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

const SEARCH_RESULTS: Locator = Locator::Class("search-results");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CourtEntry {
    pub court_id: String,
    pub court_name: String,
    pub court_website: String,
    #[serde(default = "default_servers", deserialize_with = "deserialize_servers")]
    pub srv: Vec<String>,
}

fn default_servers() -> Vec<String> {
    vec!["1".to_string()]
}

/// Server numbers appear both as strings and as bare numbers.
fn deserialize_servers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Server {
        Text(String),
        Number(u64),
    }

    let servers = Vec::<Server>::deserialize(deserializer)?;
    Ok(servers
        .into_iter()
        .map(|server| match server {
            Server::Text(text) => text,
            Server::Number(number) => number.to_string(),
        })
        .collect())
}

impl CourtEntry {
    pub fn target(&self, region: &str) -> SiteTarget {
        SiteTarget {
            website: self.court_website.clone(),
            region: region.to_string(),
            court_code: Some(self.court_id.clone()).filter(|id| !id.is_empty()),
            servers: self.srv.clone(),
        }
    }
}

/// Courts by region code.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CourtDirectory {
    pub regions: BTreeMap<String, Vec<CourtEntry>>,
}

impl CourtDirectory {
    /// Reads the directory from an `http(s)` URL or a local file.
    pub fn load(source: &str, client: &Client, policy: &RetryPolicy) -> Result<Self> {
        if source.starts_with("http://") || source.starts_with("https://") {
            return fetch_json(client, source, policy)
                .with_context(|| format!("failed to load court directory from {source}"));
        }
        load_json(Path::new(source))
    }

    /// Websites compare by host slug, so scheme and trailing slash do not matter.
    pub fn find_by_website(&self, website: &str) -> Option<(&str, &CourtEntry)> {
        let wanted = site_slug(website);
        self.courts()
            .find(|(_, court)| site_slug(&court.court_website) == wanted)
    }

    /// Last court whose name contains `partial`.
    pub fn find_by_name(&self, partial: &str) -> Option<(&str, &CourtEntry)> {
        self.courts()
            .filter(|(_, court)| court.court_name.contains(partial))
            .last()
    }

    pub fn courts(&self) -> impl Iterator<Item = (&str, &CourtEntry)> {
        self.regions
            .iter()
            .flat_map(|(region, courts)| courts.iter().map(move |court| (region.as_str(), court)))
    }

    pub fn region(&self, code: &str) -> &[CourtEntry] {
        self.regions.get(code).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Region codes from the reference mapping `{code: name}`.
pub fn load_region_codes(client: &Client, url: &str, policy: &RetryPolicy) -> Result<Vec<String>> {
    let codes: BTreeMap<String, serde_json::Value> = fetch_json(client, url, policy)
        .with_context(|| format!("failed to load region codes from {url}"))?;
    Ok(codes.into_keys().collect())
}

pub fn court_search_url(region_code: &str) -> String {
    format!("https://sudrf.ru/index.php?id=300&act=go_search&searchtype=fs&court_subj={region_code}")
}

/// Courts listed on one region's search page. Items without a website link
/// are skipped.
pub fn parse_court_listing(html: &str) -> Vec<CourtEntry> {
    let document = Html::parse_document(html);
    let Some(list) = document.select(&selector("ul.search-results")).next() else {
        return Vec::new();
    };
    let link = selector("a");
    let inner_link = selector("div a");

    let mut courts = Vec::new();
    for item in list.select(&selector("li")) {
        let Some(first) = item.select(&link).next() else {
            continue;
        };
        let court_id = first
            .value()
            .attr("onclick")
            .and_then(|onclick| onclick.split(',').next_back())
            .map(|last| last.replace([')', '\'', ';'], "").trim().to_string())
            .unwrap_or_default();

        let Some(website) = item
            .select(&inner_link)
            .map(element_text)
            .find(|text| text.contains("http"))
        else {
            debug!(%court_id, "court without website skipped");
            continue;
        };

        courts.push(CourtEntry {
            court_id,
            court_name: element_text(first).trim().to_string(),
            court_website: website.trim().to_string(),
            srv: default_servers(),
        });
    }
    courts
}

/// Walks the sudrf.ru court search for every region code.
pub fn discover_courts(
    fetcher: &mut dyn PageFetcher,
    config: &CrawlConfig,
    region_codes: &[String],
) -> CourtDirectory {
    let mut directory = CourtDirectory::default();
    for code in region_codes {
        let url = court_search_url(code);
        if let Err(err) = fetcher.navigate(&url) {
            warn!(region = %code, error = %err, "court list failed to load");
            directory.regions.insert(code.clone(), Vec::new());
            continue;
        }
        if !fetcher.wait_for(SEARCH_RESULTS, config.wait.landing()) {
            warn!(region = %code, "court list did not appear");
        }
        let courts = fetcher
            .document()
            .map(|html| parse_court_listing(&html))
            .unwrap_or_default();
        info!(region = %code, courts = courts.len(), "region courts listed");
        directory.regions.insert(code.clone(), courts);
    }
    directory
}
