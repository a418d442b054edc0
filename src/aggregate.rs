use crate::config::CrawlConfig;
use crate::fetch::PageFetcher;
use crate::model::{CaseRecord, KeywordResults, SiteResult};
use crate::portal::fetch_portal_case;
use crate::store::{list_region_year, load_json, load_result_file, read_lines, save_json, write_gzip_json, write_lines};
use anyhow::{Result, bail};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Case ids already collected. Grows only; insertion order is kept for the
/// persisted list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreSet {
    ids: Vec<String>,
    index: HashSet<String>,
}

impl IgnoreSet {
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for id in ids {
            set.insert(id);
        }
        set
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_ids(read_lines(path)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_lines(path, &self.ids)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Returns `true` when the id was not yet present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if !self.index.insert(id.clone()) {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Local-time tag shared by every file of one run.
pub fn request_id(at: DateTime<Local>) -> String {
    at.format("%H-%M-%S-%d-%m-%Y").to_string()
}

pub fn links_path(dir: &Path, request_id: &str) -> PathBuf {
    dir.join(format!("cases_links_{request_id}.json"))
}

pub fn save_links(
    dir: &Path,
    request_id: &str,
    links: &BTreeMap<String, KeywordResults>,
) -> Result<PathBuf> {
    let path = links_path(dir, request_id);
    save_json(&path, links)?;
    Ok(path)
}

pub fn load_links(path: &Path) -> Result<BTreeMap<String, KeywordResults>> {
    load_json(path)
}

#[derive(Debug, Clone, Default)]
pub struct CaseFetchRun {
    pub results: BTreeMap<String, CaseRecord>,
    pub ignore: IgnoreSet,
    pub log: Vec<String>,
    pub skipped: usize,
    pub failed: usize,
}

/// Loads every listed case not in `ignore`. Each loaded case is tagged with
/// the keyword that found it and added to the ignore set.
pub fn fetch_keyword_cases(
    fetcher: &mut dyn PageFetcher,
    config: &CrawlConfig,
    links: &BTreeMap<String, KeywordResults>,
    ignore: IgnoreSet,
) -> CaseFetchRun {
    let mut run = CaseFetchRun {
        ignore,
        ..CaseFetchRun::default()
    };

    for (keyword, found) in links {
        for stub in &found.cases {
            if run.ignore.contains(&stub.case_id) {
                debug!(case = %stub.case_id, "case already saved");
                run.log.push(format!("Case {} was already saved", stub.case_id));
                run.skipped += 1;
                continue;
            }

            match fetch_portal_case(&mut *fetcher, config, stub) {
                Some(mut record) => {
                    record.keyword = Some(keyword.clone());
                    run.ignore.insert(stub.case_id.clone());
                    run.results.insert(stub.case_id.clone(), record);
                }
                None => {
                    warn!(case = %stub.case_id, %keyword, "case failed to load");
                    run.log.push(format!("Case {} failed to load", stub.case_id));
                    run.failed += 1;
                }
            }
        }
    }

    info!(
        fetched = run.results.len(),
        skipped = run.skipped,
        failed = run.failed,
        "keyword cases fetched"
    );
    run
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    pub results: PathBuf,
    pub ignore: Option<PathBuf>,
    pub log: Option<PathBuf>,
}

/// Writes the results mapping, and the ignore list and log when non-empty.
pub fn persist_run(dir: &Path, request_id: &str, run: &CaseFetchRun) -> Result<RunFiles> {
    let results = dir.join(format!("results_{request_id}.json"));
    save_json(&results, &run.results)?;

    let ignore = if run.ignore.is_empty() {
        None
    } else {
        let path = dir.join(format!("cases_ids_to_ignore_{request_id}.txt"));
        run.ignore.save(&path)?;
        Some(path)
    };

    let log = if run.log.is_empty() {
        None
    } else {
        let path = dir.join(format!("logs_{request_id}.txt"));
        write_lines(&path, &run.log)?;
        Some(path)
    };

    info!(results = %results.display(), "run files written");
    Ok(RunFiles {
        results,
        ignore,
        log,
    })
}

/// A court in the merged region file: keyed by `srv_N` when several servers
/// produced files, the bare result otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MergedSite {
    ByServer(BTreeMap<String, SiteResult>),
    Single(SiteResult),
}

/// Combines all result files of `region` and `year` keyed by website.
pub fn merge_region_year(dir: &Path, region: &str, year: i32) -> Result<BTreeMap<String, MergedSite>> {
    let files = list_region_year(dir, region, year)?;

    let mut by_slug: BTreeMap<String, Vec<(String, PathBuf)>> = BTreeMap::new();
    for (key, path) in files {
        by_slug.entry(key.slug).or_default().push((key.server, path));
    }

    let mut merged = BTreeMap::new();
    for (slug, servers) in by_slug {
        if servers.len() == 1 {
            let (_, path) = &servers[0];
            for (website, result) in load_result_file(path)?.sites {
                merged.insert(website, MergedSite::Single(result));
            }
            continue;
        }

        let mut website = None;
        let mut combined = BTreeMap::new();
        for (server, path) in &servers {
            let file = load_result_file(path)?;
            let Some((site, result)) = file.sites.into_iter().next() else {
                warn!(path = %path.display(), "empty result file skipped");
                continue;
            };
            website.get_or_insert(site);
            combined.insert(format!("srv_{server}"), result);
        }
        match website {
            Some(website) => {
                debug!(%slug, servers = combined.len(), "servers combined");
                merged.insert(website, MergedSite::ByServer(combined));
            }
            None => warn!(%slug, "no usable result files"),
        }
    }
    Ok(merged)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressReport {
    pub path: PathBuf,
    pub sites: usize,
}

/// Writes `{region}_{year}.json.gz` into `dest` with every court of the
/// region and year.
pub fn compress_region_year(dir: &Path, region: &str, year: i32, dest: &Path) -> Result<CompressReport> {
    let merged = merge_region_year(dir, region, year)?;
    if merged.is_empty() {
        bail!("no result files for region {region} and year {year} in {}", dir.display());
    }

    let path = dest.join(format!("{region}_{year}.json.gz"));
    write_gzip_json(&path, &merged)?;
    info!(path = %path.display(), sites = merged.len(), "region compressed");
    Ok(CompressReport {
        path,
        sites: merged.len(),
    })
}
