use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use sudrf::aggregate::{
    IgnoreSet, compress_region_year, fetch_keyword_cases, load_links, persist_run, request_id,
    save_links,
};
use sudrf::captcha::ResolverChain;
use sudrf::config::{CrawlConfig, load_config};
use sudrf::courts::{CourtDirectory, discover_courts, load_region_codes};
use sudrf::crawl::{CrawlContext, CrawlOutcome, crawl_site, find_case};
use sudrf::fetch::{FetcherKind, RetryPolicy, build_http_client, open_fetcher};
use sudrf::model::{SearchPeriod, SiteTarget, parse_date};
use sudrf::portal::search_keywords;
use sudrf::resume::resume_missing_pages;
use sudrf::store::save_json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sudrf", about = "Criminal case crawler for sudrf.ru court sites")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `[output].dir`.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Overrides `[captcha].ocr_api_key`.
    #[arg(long)]
    ocr_api_key: Option<String>,

    /// Drive court sites through headless Chrome instead of plain HTTP.
    /// Portal commands always use the browser.
    #[arg(long, default_value_t = false)]
    browser: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every court website per region from sudrf.ru.
    DiscoverCourts {
        #[arg(long, default_value = "courts.json")]
        output: PathBuf,
        /// Region codes; all known regions when omitted.
        #[arg(long = "region")]
        regions: Vec<String>,
    },
    /// Collect case links from the aggregator portal by keyword.
    Search {
        #[arg(long = "keyword", required = true)]
        keywords: Vec<String>,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Fetch the found cases right away.
        #[arg(long, default_value_t = false)]
        fetch: bool,
        #[arg(long)]
        ignore: Option<PathBuf>,
    },
    /// Fetch portal cases from a saved links file.
    FetchCases {
        #[arg(long)]
        links: PathBuf,
        #[arg(long)]
        ignore: Option<PathBuf>,
    },
    /// Crawl court sites for cases registered in a period.
    Crawl {
        /// Crawls every court of the region in the directory when omitted.
        #[arg(long)]
        website: Option<String>,
        #[arg(long)]
        region: String,
        #[arg(long)]
        court_code: Option<String>,
        #[arg(long = "server")]
        servers: Vec<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// Court directory URL or file; `[reference]` default otherwise.
        #[arg(long)]
        directory: Option<String>,
    },
    /// Look a case up on a court site by its number and admission date.
    FindCase {
        #[arg(long)]
        website: String,
        #[arg(long)]
        number: String,
        #[arg(long)]
        admitted: String,
        #[arg(long = "server")]
        servers: Vec<String>,
        #[arg(long)]
        court_code: Option<String>,
    },
    /// Re-request pages that failed in earlier crawls.
    Resume {
        #[arg(long)]
        region: String,
        #[arg(long)]
        year: i32,
        #[arg(long)]
        directory: Option<String>,
    },
    /// Merge a region's yearly result files into one gzip file.
    Compress {
        #[arg(long)]
        region: String,
        #[arg(long)]
        year: i32,
        #[arg(long)]
        dest: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(dir) = cli.out_dir {
        config.output.dir = dir;
    }
    if let Some(key) = cli.ocr_api_key {
        config.captcha.ocr_api_key = Some(key);
    }
    let out_dir = config.output.dir.clone();
    let policy = RetryPolicy::from_config(&config.retry);
    let site_fetcher = if cli.browser {
        FetcherKind::Browser
    } else {
        FetcherKind::Http
    };

    match cli.command {
        Commands::DiscoverCourts { output, regions } => {
            let regions = if regions.is_empty() {
                let client = build_http_client(&config.fetch)?;
                load_region_codes(&client, &config.reference.region_codes_url, &policy)?
            } else {
                regions
            };
            let mut fetcher = open_fetcher(&config.fetch, site_fetcher)?;
            let directory = discover_courts(fetcher.as_mut(), &config, &regions);
            save_json(&output, &directory)?;
            info!(path = %output.display(), regions = directory.regions.len(), "court directory written");
        }
        Commands::Search {
            keywords,
            start,
            end,
            fetch,
            ignore,
        } => {
            let period = SearchPeriod::new(parse_date(&start)?, parse_date(&end)?)?;
            let mut fetcher = open_fetcher(&config.fetch, FetcherKind::Browser)?;
            let links = search_keywords(fetcher.as_mut(), &config, &keywords, &period);
            let run_id = request_id(Local::now());
            let path = save_links(&out_dir, &run_id, &links)?;
            println!("Links are saved in {}", path.display());

            if fetch {
                let ignore = load_ignore(ignore.as_deref())?;
                let run = fetch_keyword_cases(fetcher.as_mut(), &config, &links, ignore);
                persist_run(&out_dir, &run_id, &run)?;
                println!("Job is finished. Results are saved in {}", out_dir.display());
            }
        }
        Commands::FetchCases { links, ignore } => {
            let links = load_links(&links)?;
            let ignore = load_ignore(ignore.as_deref())?;
            let mut fetcher = open_fetcher(&config.fetch, FetcherKind::Browser)?;
            let run = fetch_keyword_cases(fetcher.as_mut(), &config, &links, ignore);
            persist_run(&out_dir, &request_id(Local::now()), &run)?;
            println!("Job is finished. Results are saved in {}", out_dir.display());
        }
        Commands::Crawl {
            website,
            region,
            court_code,
            servers,
            year,
            start,
            end,
            directory,
        } => {
            let period = crawl_period(year, start.as_deref(), end.as_deref())?;
            let targets = match website {
                Some(website) => vec![SiteTarget {
                    website,
                    region: region.clone(),
                    court_code,
                    servers,
                }],
                None => {
                    let directory = load_directory(&config, directory.as_deref(), &policy)?;
                    let courts = directory.region(&region);
                    if courts.is_empty() {
                        bail!("court directory has no courts for region {region}");
                    }
                    courts.iter().map(|court| court.target(&region)).collect()
                }
            };

            let mut fetcher = open_fetcher(&config.fetch, site_fetcher)?;
            let resolver = ResolverChain::from_config(&config)?;
            let mut ctx = CrawlContext {
                fetcher: fetcher.as_mut(),
                resolver: &resolver,
                config: &config,
            };
            for target in &targets {
                match crawl_site(&mut ctx, target, period, &out_dir)? {
                    CrawlOutcome::Crawled(summary) => {
                        println!("{}", serde_json::to_string(&summary)?);
                    }
                    CrawlOutcome::Failed(failure) => println!("{failure}"),
                }
            }
        }
        Commands::FindCase {
            website,
            number,
            admitted,
            servers,
            court_code,
        } => {
            let admitted: NaiveDate = parse_date(&admitted)?;
            let target = SiteTarget {
                website,
                region: String::new(),
                court_code,
                servers,
            };
            let mut fetcher = open_fetcher(&config.fetch, site_fetcher)?;
            let resolver = ResolverChain::from_config(&config)?;
            let mut ctx = CrawlContext {
                fetcher: fetcher.as_mut(),
                resolver: &resolver,
                config: &config,
            };
            match find_case(&mut ctx, &target, &number, admitted) {
                Ok(lookup) => {
                    let path = out_dir.join(format!("{}.json", number.replace('/', "-")));
                    save_json(&path, &lookup.matches)?;
                    println!("Results are saved in {}", path.display());
                }
                Err(failure) => println!("{failure}"),
            }
        }
        Commands::Resume {
            region,
            year,
            directory,
        } => {
            let directory = match directory {
                Some(source) => Some(load_directory(&config, Some(&source), &policy)?),
                None => None,
            };
            let mut fetcher = open_fetcher(&config.fetch, site_fetcher)?;
            let resolver = ResolverChain::from_config(&config)?;
            let mut ctx = CrawlContext {
                fetcher: fetcher.as_mut(),
                resolver: &resolver,
                config: &config,
            };
            let statuses =
                resume_missing_pages(&mut ctx, &out_dir, &region, year, directory.as_ref())?;
            for line in statuses {
                println!("{line}");
            }
        }
        Commands::Compress { region, year, dest } => {
            let dest = dest.unwrap_or_else(|| out_dir.clone());
            let report = compress_region_year(&out_dir, &region, year, &dest)?;
            println!(
                "Results for the region {region} and year {year} are compressed and saved in {}",
                report.path.display()
            );
        }
    }

    Ok(())
}

fn crawl_period(year: Option<i32>, start: Option<&str>, end: Option<&str>) -> Result<SearchPeriod> {
    match (year, start, end) {
        (_, Some(start), Some(end)) => SearchPeriod::new(parse_date(start)?, parse_date(end)?),
        (Some(year), None, None) => {
            SearchPeriod::calendar_year(year).with_context(|| format!("year {year} is out of range"))
        }
        _ => bail!("pass either --year or both --start and --end"),
    }
}

fn load_ignore(path: Option<&Path>) -> Result<IgnoreSet> {
    match path {
        Some(path) => IgnoreSet::load(path),
        None => Ok(IgnoreSet::default()),
    }
}

fn load_directory(
    config: &CrawlConfig,
    source: Option<&str>,
    policy: &RetryPolicy,
) -> Result<CourtDirectory> {
    let source = source.unwrap_or(&config.reference.court_directory_url);
    let client = build_http_client(&config.fetch)?;
    CourtDirectory::load(source, &client, policy)
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}
