mod common;

use anyhow::Result;
use common::{FakeFetcher, fixture};
use std::path::PathBuf;
use sudrf::config::{CrawlConfig, load_config};
use sudrf::courts::{CourtDirectory, court_search_url, discover_courts, parse_court_listing};
use sudrf::fetch::{FetcherKind, RetryPolicy, build_http_client, open_fetcher};
use tempfile::tempdir;

#[test]
fn partial_config_keeps_defaults_for_missing_sections() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("crawl.toml");
    std::fs::write(
        &path,
        r#"
[retry]
max_attempts = 5

[throttle]
page_delay_ms = 100

[output]
dir = "out/cases"

[fetch]
chrome_executable = "/opt/chrome/chrome"
headless = false
"#,
    )?;

    let config = load_config(Some(&path))?;
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.backoff_ms, 1000);
    assert_eq!(config.throttle.page_delay_ms, 100);
    assert_eq!(config.throttle.block_every_cases, 200);
    assert_eq!(config.wait.portal_listing_secs, 30);
    assert_eq!(config.output.dir, PathBuf::from("out/cases"));
    assert!(config.captcha.ocr_api_key.is_none());
    assert_eq!(config.fetch.timeout_secs, 60);
    assert_eq!(config.fetch.chrome_executable, Some(PathBuf::from("/opt/chrome/chrome")));
    assert!(!config.fetch.headless);
    assert!(CrawlConfig::default().fetch.headless);
    Ok(())
}

#[test]
fn invalid_config_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("crawl.toml");
    std::fs::write(&path, "[retry]\nmax_attempts = 0\n")?;

    let err = load_config(Some(&path)).expect_err("zero attempts rejected");
    assert!(format!("{err:#}").contains("max_attempts"));

    assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    assert!(load_config(None).is_ok());
    Ok(())
}

#[test]
fn court_directory_reads_mixed_server_lists() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("sudrf_websites.json");
    std::fs::write(
        &path,
        r#"{
  "50": [
    {"court_id": "50RS0049", "court_name": "Чеховский городской суд", "court_website": "http://chehov.mo.sudrf.ru", "srv": [1, "2"]},
    {"court_id": "50RS0031", "court_name": "Одинцовский городской суд", "court_website": "https://odintsovo.mo.sudrf.ru/"}
  ],
  "77": [
    {"court_id": "77RS0001", "court_name": "Московский городской суд", "court_website": "http://city.msk.sudrf.ru", "srv": ["1"]}
  ]
}"#,
    )?;

    let client = build_http_client(&CrawlConfig::default().fetch)?;
    let policy = RetryPolicy::from_config(&CrawlConfig::without_delays().retry);
    let directory = CourtDirectory::load(&path.to_string_lossy(), &client, &policy)?;

    assert_eq!(directory.region("50").len(), 2);
    assert!(directory.region("99").is_empty());

    let (region, chehov) = directory
        .find_by_website("https://chehov.mo.sudrf.ru/")
        .expect("court known");
    assert_eq!(region, "50");
    assert_eq!(chehov.srv, vec!["1".to_string(), "2".to_string()]);

    let (_, odintsovo) = directory
        .find_by_website("http://odintsovo.mo.sudrf.ru")
        .expect("court known");
    assert_eq!(odintsovo.srv, vec!["1".to_string()]);

    let target = odintsovo.target("50");
    assert_eq!(target.court_code.as_deref(), Some("50RS0031"));

    // several names match; the last one wins
    let (region, court) = directory.find_by_name("городской суд").expect("court known");
    assert_eq!(region, "77");
    assert_eq!(court.court_id, "77RS0001");
    assert!(directory.find_by_name("Арбитражный").is_none());
    Ok(())
}

#[test]
fn court_listing_skips_courts_without_websites() {
    let courts = parse_court_listing(&fixture("court_search.html"));
    assert_eq!(courts.len(), 2);

    assert_eq!(courts[0].court_id, "50RS0049");
    assert_eq!(courts[0].court_name, "Чеховский городской суд");
    assert_eq!(courts[0].court_website, "http://chehov.mo.sudrf.ru");

    assert_eq!(courts[1].court_id, "50RS0031");
    assert_eq!(courts[1].court_website, "https://odintsovo.mo.sudrf.ru/");
    assert_eq!(courts[1].srv, vec!["1".to_string()]);

    assert!(parse_court_listing("<html><body></body></html>").is_empty());
}

#[test]
fn discovery_keeps_regions_that_failed_to_load() {
    let config = CrawlConfig::without_delays();
    let mut fetcher = FakeFetcher::new();
    fetcher
        .page(court_search_url("50"), fixture("court_search.html"))
        .fail(court_search_url("77"));

    let codes = vec!["50".to_string(), "77".to_string()];
    let directory = discover_courts(&mut fetcher, &config, &codes);

    assert_eq!(directory.region("50").len(), 2);
    assert!(directory.regions.contains_key("77"));
    assert!(directory.region("77").is_empty());
}

#[cfg(not(feature = "browser"))]
#[test]
fn browser_fetcher_needs_the_browser_feature() -> Result<()> {
    let config = CrawlConfig::default();
    let err = open_fetcher(&config.fetch, FetcherKind::Browser)
        .err()
        .expect("browser is not built in");
    assert!(err.to_string().contains("--features browser"));

    let fetcher = open_fetcher(&config.fetch, FetcherKind::Http)?;
    assert_eq!(sudrf::fetch::PageFetcher::tab_count(fetcher.as_ref()), 1);
    Ok(())
}
