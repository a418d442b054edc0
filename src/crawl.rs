use crate::captcha::ChallengeResolver;
use crate::classify::{LandingError, fetch_classification};
use crate::config::CrawlConfig;
use crate::extract::{PageExtractor, check_page_shape, extractor_for};
use crate::fetch::{PageFetcher, RetryPolicy};
use crate::model::{
    CaseRecord, CaseStub, CrawlLog, CrawlQuery, CrawlSummary, ResultFile, SearchPeriod,
    SearchQuery, SiteProfile, SiteResult, SiteTarget,
};
use crate::session::{FirstPage, SearchSession};
use crate::store::{load_result_file, result_path, save_result_file};
use anyhow::Result;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Everything a crawl unit borrows: the browser-like session, the captcha
/// resolver, and the tuning knobs.
pub struct CrawlContext<'a> {
    pub fetcher: &'a mut dyn PageFetcher,
    pub resolver: &'a dyn ChallengeResolver,
    pub config: &'a CrawlConfig,
}

/// Why a whole site was given up on. The display form is the status line
/// reported to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrawlFailure {
    #[error("{website} cannot be parsed")]
    Unsupported { website: String },
    #[error("Failed to load content of {website}")]
    LoadFailed { website: String },
    #[error("Captcha for {website} could not be obtained: {reason}")]
    CaptchaUnresolved { website: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    Crawled(CrawlSummary),
    Failed(CrawlFailure),
}

/// Classifies `target` and builds its profile.
pub fn inspect_site(
    ctx: &mut CrawlContext<'_>,
    target: &SiteTarget,
) -> Result<SiteProfile, CrawlFailure> {
    match fetch_classification(&mut *ctx.fetcher, &target.website, ctx.config) {
        Ok(classification) if classification.variant.is_supported() => {
            Ok(target.profile(classification.variant, classification.captcha))
        }
        Ok(_) => Err(CrawlFailure::Unsupported {
            website: target.website.clone(),
        }),
        Err(LandingError::Fetch(err)) => {
            warn!(site = %target.website, error = %err, "landing page failed");
            Err(CrawlFailure::LoadFailed {
                website: target.website.clone(),
            })
        }
        Err(LandingError::NotLoaded) => Err(CrawlFailure::LoadFailed {
            website: target.website.clone(),
        }),
    }
}

/// Crawls every server of `target` for `period` and writes one result file
/// per server into `out_dir`. Cases already stored for the same key are kept
/// and not fetched again. I/O failures are returned as errors; everything
/// else is reported through the outcome.
pub fn crawl_site(
    ctx: &mut CrawlContext<'_>,
    target: &SiteTarget,
    period: SearchPeriod,
    out_dir: &Path,
) -> Result<CrawlOutcome> {
    let profile = match inspect_site(ctx, target) {
        Ok(profile) => profile,
        Err(failure) => {
            warn!(site = %target.website, status = %failure, "site skipped");
            return Ok(CrawlOutcome::Failed(failure));
        }
    };
    let Some(extractor) = extractor_for(profile.variant) else {
        return Ok(CrawlOutcome::Failed(CrawlFailure::Unsupported {
            website: target.website.clone(),
        }));
    };

    let year = period.year();
    let mut summary = CrawlSummary {
        website: profile.website.clone(),
        year,
        n_cases_by_server: BTreeMap::new(),
    };

    for server in &profile.servers {
        let path = result_path(out_dir, &profile.result_key(server, year));
        let mut stored = load_result_file(&path)?;
        let seed = stored.sites.remove(&profile.website).unwrap_or_default();

        let (result, failure) = crawl_server(ctx, &profile, extractor.as_ref(), server, period, seed);
        summary
            .n_cases_by_server
            .insert(server.clone(), result.num_cases);

        save_result_file(&path, &ResultFile::single(&profile.website, result))?;
        debug!(path = %path.display(), "result file written");

        if let Some(failure) = failure {
            warn!(site = %profile.website, server = %server, status = %failure, "crawl aborted");
            return Ok(CrawlOutcome::Failed(failure));
        }
    }

    info!(
        site = %summary.website,
        year,
        servers = ?summary.n_cases_by_server,
        "site crawl complete"
    );
    Ok(CrawlOutcome::Crawled(summary))
}

/// One server of one site. `seed` holds cases from earlier runs; they are
/// carried over and skipped when listed again. Its log, including recorded
/// page gaps, is kept until the listing has been walked again. Always
/// returns a result, even a partial one; the failure is set only when the
/// captcha could not be obtained.
pub fn crawl_server(
    ctx: &mut CrawlContext<'_>,
    site: &SiteProfile,
    extractor: &dyn PageExtractor,
    server: &str,
    period: SearchPeriod,
    seed: SiteResult,
) -> (SiteResult, Option<CrawlFailure>) {
    let mut result = SiteResult {
        num_cases: seed.num_cases,
        cases: seed.cases,
        logs: seed.logs,
        query: Some(CrawlQuery {
            period,
            court_code: site.court_id.clone(),
        }),
    };

    let policy = RetryPolicy::from_config(&ctx.config.retry);
    let mut session = match SearchSession::open(
        &mut *ctx.fetcher,
        site,
        server,
        extractor,
        ctx.resolver,
        ctx.config,
        SearchQuery::by_period(period),
    ) {
        Ok(session) => session,
        Err(err) => {
            let failure = CrawlFailure::CaptchaUnresolved {
                website: site.website.clone(),
                reason: format!("{err:#}"),
            };
            return (result, Some(failure));
        }
    };

    let first = policy.run("results page 1", |attempt| {
        debug!(site = %site.website, server, attempt, "loading results page 1");
        session.first_page()
    });

    let listing = match first {
        Ok(FirstPage::Listing(listing)) => listing,
        Ok(FirstPage::NoResults) => {
            info!(site = %site.website, server, "no cases in period");
            result.num_cases = 0;
            result.logs = CrawlLog::default();
            return (result, None);
        }
        Err(err) => {
            warn!(site = %site.website, server, error = %err, "results page 1 never loaded");
            // Gaps of earlier runs stay recorded for resumption.
            result.logs.cases_found = !result.cases.is_empty();
            result.logs.driver_error |= err.is_driver_error();
            return (result, None);
        }
    };

    result.num_cases = listing.total;
    result.logs = CrawlLog {
        cases_found: true,
        ..CrawlLog::default()
    };
    check_page_shape(&site.website, 1, listing.total, listing.page_size, listing.stubs.len());
    fetch_listed_cases(&mut session, &listing.stubs, &mut result);

    for page in 2..=listing.page_count() {
        match session.page(page) {
            Ok(stubs) => {
                check_page_shape(&site.website, page, listing.total, listing.page_size, stubs.len());
                fetch_listed_cases(&mut session, &stubs, &mut result);
            }
            Err(err) => {
                warn!(site = %site.website, server, page, error = %err, "results page skipped");
                if err.is_driver_error() {
                    result.logs.driver_error = true;
                }
                result.logs.record_page_gap(page);
            }
        }
    }

    info!(
        site = %site.website,
        server,
        listed = result.num_cases,
        stored = result.cases.len(),
        gaps = ?result.logs.pagination_error,
        "server crawl finished"
    );
    (result, None)
}

/// Fetches every listed case not already stored. Returns how many new
/// records were added.
pub fn fetch_listed_cases(
    session: &mut SearchSession<'_>,
    stubs: &[CaseStub],
    result: &mut SiteResult,
) -> usize {
    let mut added = 0;
    for stub in stubs {
        if result.cases.iter().any(|case| case.case_id == stub.case_id && case.found) {
            debug!(case = %stub.case_id, "case already stored");
            continue;
        }
        let record = session.fetch_case(stub);
        if result.upsert_case(record) {
            added += 1;
        }
    }
    added
}

/// Outcome of a lookup by case number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseLookup {
    pub matches: Vec<CaseRecord>,
    pub ambiguous: bool,
}

/// Searches each server of `target` for `case_number` registered on
/// `admitted`. The first server listing the number wins. Several listed
/// cases are all returned and flagged as ambiguous; none yields a single
/// not-found record carrying the number.
pub fn find_case(
    ctx: &mut CrawlContext<'_>,
    target: &SiteTarget,
    case_number: &str,
    admitted: NaiveDate,
) -> Result<CaseLookup, CrawlFailure> {
    let profile = inspect_site(ctx, target)?;
    let Some(extractor) = extractor_for(profile.variant) else {
        return Err(CrawlFailure::Unsupported {
            website: target.website.clone(),
        });
    };
    let policy = RetryPolicy::from_config(&ctx.config.retry);

    for server in &profile.servers {
        let query = SearchQuery::by_case_number(case_number, admitted);
        let mut session = SearchSession::open(
            &mut *ctx.fetcher,
            &profile,
            server,
            extractor.as_ref(),
            ctx.resolver,
            ctx.config,
            query,
        )
        .map_err(|err| CrawlFailure::CaptchaUnresolved {
            website: profile.website.clone(),
            reason: format!("{err:#}"),
        })?;

        let listing = match policy.run("case number search", |_| session.first_page()) {
            Ok(FirstPage::Listing(listing)) if !listing.stubs.is_empty() => listing,
            Ok(_) => {
                debug!(site = %profile.website, server = %server, case_number, "number not listed");
                continue;
            }
            Err(err) => {
                warn!(site = %profile.website, server = %server, case_number, error = %err, "case number search failed");
                continue;
            }
        };

        let ambiguous = listing.stubs.len() > 1;
        if ambiguous {
            warn!(
                site = %profile.website,
                case_number,
                matches = listing.stubs.len(),
                "case number matches several cases; returning all"
            );
        }
        let matches = listing
            .stubs
            .iter()
            .map(|stub| session.fetch_case(stub))
            .collect();
        return Ok(CaseLookup { matches, ambiguous });
    }

    let mut missing = CaseRecord::not_found(case_number);
    missing.metadata.id_text = case_number.to_string();
    Ok(CaseLookup {
        matches: vec![missing],
        ambiguous: false,
    })
}
