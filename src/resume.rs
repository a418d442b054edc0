use crate::courts::CourtDirectory;
use crate::crawl::{CrawlContext, CrawlFailure, fetch_listed_cases, inspect_site};
use crate::extract::extractor_for;
use crate::model::{CrawlQuery, ResultKey, SearchPeriod, SearchQuery, SiteTarget};
use crate::session::SearchSession;
use crate::store::{list_region_year, load_result_file, save_result_file};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Result files of `region` and `year` that still record failed pages,
/// with the total number of such pages.
pub fn find_missing_pages(dir: &Path, region: &str, year: i32) -> Result<(usize, Vec<(ResultKey, PathBuf)>)> {
    let mut total = 0;
    let mut pending = Vec::new();
    for (key, path) in list_region_year(dir, region, year)? {
        let file = load_result_file(&path)?;
        let missing: usize = file
            .sites
            .values()
            .map(|site| site.logs.pagination_error.len())
            .sum();
        if missing > 0 {
            total += missing;
            pending.push((key, path));
        }
    }
    Ok((total, pending))
}

/// Re-requests the failed pages of every pending file of `region` and
/// `year`. Returns one status line per file.
pub fn resume_missing_pages(
    ctx: &mut CrawlContext<'_>,
    dir: &Path,
    region: &str,
    year: i32,
    directory: Option<&CourtDirectory>,
) -> Result<Vec<String>> {
    let (missing, pending) = find_missing_pages(dir, region, year)?;
    info!(region, year, files = pending.len(), pages = missing, "resuming failed pages");

    let mut statuses = Vec::with_capacity(pending.len());
    for (key, path) in pending {
        statuses.push(resume_file(ctx, &path, &key, directory)?);
    }
    Ok(statuses)
}

/// Re-requests the failed pages recorded in one result file and rewrites it.
/// Pages that fail again stay recorded; recovered cases are upserted.
pub fn resume_file(
    ctx: &mut CrawlContext<'_>,
    path: &Path,
    key: &ResultKey,
    directory: Option<&CourtDirectory>,
) -> Result<String> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| key.file_name());

    let mut file = load_result_file(path)?;
    let Some((website, stored)) = file.first_mut() else {
        return Ok(format!("No cases were added to {file_name}"));
    };
    let website = website.clone();
    let pages = stored.logs.pagination_error.clone();
    if pages.is_empty() {
        return Ok(format!("No cases were added to {file_name}"));
    }

    let period = match &stored.query {
        Some(query) => query.period,
        None => SearchPeriod::calendar_year(key.year)
            .with_context(|| format!("year {} of {file_name} is out of range", key.year))?,
    };
    let court_code = stored
        .query
        .as_ref()
        .and_then(|query| query.court_code.clone())
        .or_else(|| {
            directory
                .and_then(|directory| directory.find_by_website(&website))
                .map(|(_, court)| court.court_id.clone())
        });

    let target = SiteTarget {
        website: website.clone(),
        region: key.region.clone(),
        court_code: court_code.clone(),
        servers: vec![key.server.clone()],
    };
    let profile = match inspect_site(ctx, &target) {
        Ok(profile) => profile,
        Err(failure) => {
            warn!(file = %file_name, status = %failure, "resume skipped");
            return Ok(failure.to_string());
        }
    };
    let Some(extractor) = extractor_for(profile.variant) else {
        return Ok(CrawlFailure::Unsupported { website }.to_string());
    };

    let mut session = match SearchSession::open(
        &mut *ctx.fetcher,
        &profile,
        &key.server,
        extractor.as_ref(),
        ctx.resolver,
        ctx.config,
        SearchQuery::by_period(period),
    ) {
        Ok(session) => session,
        Err(err) => {
            let failure = CrawlFailure::CaptchaUnresolved {
                website,
                reason: format!("{err:#}"),
            };
            warn!(file = %file_name, status = %failure, "resume skipped");
            return Ok(failure.to_string());
        }
    };

    let mut still_failing = Vec::new();
    let mut added = 0;
    for page in &pages {
        match session.page(*page) {
            Ok(stubs) => {
                added += fetch_listed_cases(&mut session, &stubs, stored);
            }
            Err(err) => {
                warn!(file = %file_name, page, error = %err, "page failed again");
                if err.is_driver_error() {
                    stored.logs.driver_error = true;
                }
                still_failing.push(*page);
            }
        }
    }

    let changed = added > 0 || still_failing != pages;
    stored.logs.pagination_error = still_failing;
    if stored.query.is_none() {
        stored.query = Some(CrawlQuery { period, court_code });
    }
    if changed {
        save_result_file(path, &file)?;
    }

    info!(file = %file_name, added, "resume finished");
    Ok(if added > 0 {
        format!("{added} cases were added to {file_name}")
    } else {
        format!("No cases were added to {file_name}")
    })
}
