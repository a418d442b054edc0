mod common;

use anyhow::Result;
use chrono::{Local, TimeZone};
use common::{FakeFetcher, fixture, portal_listing};
use std::collections::BTreeMap;
use sudrf::aggregate::{
    IgnoreSet, MergedSite, compress_region_year, fetch_keyword_cases, load_links, persist_run,
    request_id, save_links,
};
use sudrf::config::CrawlConfig;
use sudrf::model::{
    CaseRecord, CaseStub, KeywordResults, ResultFile, SearchStatus, SiteResult,
};
use sudrf::portal::{encode_portal_url, parse_portal_listing};
use sudrf::store::{read_gzip_json, read_lines, save_result_file};
use tempfile::tempdir;

const UID: &str = "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9";

fn stubs(ids: &[&str]) -> Vec<CaseStub> {
    let listing =
        parse_portal_listing(&portal_listing(1, [0], UID)).expect("results list present");
    ids.iter()
        .map(|id| {
            let mut stub = listing.stubs[0].clone();
            stub.case_id = id.to_string();
            stub.link = format!("https://bsr.sudrf.ru/bigs/showDocument.html#id={id}&shard=ug");
            stub
        })
        .collect()
}

fn links(ids: &[&str]) -> BTreeMap<String, KeywordResults> {
    let cases = stubs(ids);
    BTreeMap::from([(
        "взятка".to_string(),
        KeywordResults {
            status: SearchStatus::Ok,
            n_cases: cases.len() as u32,
            cases,
            ..KeywordResults::default()
        },
    )])
}

#[test]
fn request_id_is_local_time_tag() {
    let at = Local
        .with_ymd_and_hms(2024, 3, 5, 14, 7, 9)
        .single()
        .expect("unambiguous local time");
    assert_eq!(request_id(at), "14-07-09-05-03-2024");
}

#[test]
fn ignore_set_keeps_first_insertion_order() {
    let mut set = IgnoreSet::from_ids(["b", "a", "b"]);
    assert_eq!(set.len(), 2);
    assert!(!set.insert("a"));
    assert!(set.insert("c"));
    assert_eq!(set.ids(), ["b", "a", "c"]);
    assert!(set.contains("c"));
    assert!(!set.contains("d"));
}

#[test]
fn keyword_cases_skip_ignored_and_log_failures() -> Result<()> {
    let config = CrawlConfig::without_delays();
    let links = links(&["a0", "a1", "a2"]);
    let stubs = &links["взятка"].cases;

    let mut fetcher = FakeFetcher::new();
    fetcher
        .page(encode_portal_url(&stubs[1].link), fixture("portal_case.html"))
        .page(
            "https://bsr.sudrf.ru/bigs/doc/decision-a1.html",
            fixture("portal_decision.html"),
        )
        .fail(encode_portal_url(&stubs[2].link));

    let run = fetch_keyword_cases(&mut fetcher, &config, &links, IgnoreSet::from_ids(["a0"]));
    assert_eq!(run.skipped, 1);
    assert_eq!(run.failed, 1);
    assert_eq!(run.results.len(), 1);

    let record = &run.results["a1"];
    assert_eq!(record.keyword.as_deref(), Some("взятка"));
    assert_eq!(record.metadata.judge.as_deref(), Some("Орлова Мария Викторовна"));

    assert_eq!(run.ignore.ids(), ["a0", "a1"]);
    assert_eq!(
        run.log,
        vec![
            "Case a0 was already saved".to_string(),
            "Case a2 failed to load".to_string(),
        ]
    );
    assert_eq!(fetcher.visits_containing("id=a0"), 0);
    Ok(())
}

#[test]
fn run_files_are_named_after_the_request() -> Result<()> {
    let dir = tempdir()?;
    let config = CrawlConfig::without_delays();
    let id = "10-00-00-01-01-2024";

    let path = save_links(dir.path(), id, &links(&["a1"]))?;
    assert_eq!(path, dir.path().join("cases_links_10-00-00-01-01-2024.json"));
    let loaded = load_links(&path)?;
    assert_eq!(loaded["взятка"].cases[0].case_id, "a1");

    let mut fetcher = FakeFetcher::new();
    let run = fetch_keyword_cases(&mut fetcher, &config, &loaded, IgnoreSet::default());
    let files = persist_run(dir.path(), id, &run)?;
    assert!(files.results.ends_with("results_10-00-00-01-01-2024.json"));
    assert!(files.ignore.is_none());
    let log = files.log.expect("failure logged");
    assert!(log.ends_with("logs_10-00-00-01-01-2024.txt"));
    assert_eq!(read_lines(&log)?, vec!["Case a1 failed to load".to_string()]);

    let mut run = run;
    run.ignore.insert("a9");
    run.log.clear();
    let files = persist_run(dir.path(), id, &run)?;
    let ignore = files.ignore.expect("ignore list written");
    assert!(ignore.ends_with("cases_ids_to_ignore_10-00-00-01-01-2024.txt"));
    assert_eq!(IgnoreSet::load(&ignore)?.ids(), ["a9"]);
    assert!(files.log.is_none());
    Ok(())
}

fn site_result(num_cases: u32) -> SiteResult {
    let mut record = CaseRecord::not_found("case_id=1&case_uid=x");
    record.found = true;
    SiteResult {
        num_cases,
        cases: vec![record],
        ..SiteResult::default()
    }
}

#[test]
fn compression_groups_servers_per_court() -> Result<()> {
    let dir = tempdir()?;
    let out = dir.path().join("compressed");

    let alpha = "http://alpha.sudrf.ru";
    let beta = "http://beta.sudrf.ru";
    save_result_file(
        &dir.path().join("50_alpha_1_2023.json"),
        &ResultFile::single(alpha, site_result(10)),
    )?;
    save_result_file(
        &dir.path().join("50_alpha_2_2023.json"),
        &ResultFile::single(alpha, site_result(20)),
    )?;
    save_result_file(
        &dir.path().join("50_beta_1_2023.json"),
        &ResultFile::single(beta, site_result(30)),
    )?;
    // neither of these belongs to region 50 in 2023
    save_result_file(
        &dir.path().join("50_beta_1_2022.json"),
        &ResultFile::single(beta, site_result(1)),
    )?;
    save_result_file(
        &dir.path().join("77_gamma_1_2023.json"),
        &ResultFile::single("http://gamma.sudrf.ru", site_result(1)),
    )?;

    let report = compress_region_year(dir.path(), "50", 2023, &out)?;
    assert_eq!(report.path, out.join("50_2023.json.gz"));
    assert_eq!(report.sites, 2);

    let merged: BTreeMap<String, MergedSite> = read_gzip_json(&report.path)?;
    assert_eq!(merged.len(), 2);

    let MergedSite::ByServer(servers) = &merged[alpha] else {
        panic!("alpha should be split by server");
    };
    assert_eq!(servers.len(), 2);
    assert_eq!(servers["srv_1"].num_cases, 10);
    assert_eq!(servers["srv_2"].num_cases, 20);

    assert_eq!(merged[beta], MergedSite::Single(site_result(30)));
    Ok(())
}

#[test]
fn compression_without_files_fails() -> Result<()> {
    let dir = tempdir()?;
    assert!(compress_region_year(dir.path(), "50", 2023, dir.path()).is_err());
    Ok(())
}
