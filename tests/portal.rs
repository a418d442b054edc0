mod common;

use common::{FakeFetcher, fixture, portal_listing, portal_nothing_found};
use std::collections::HashSet;
use sudrf::config::CrawlConfig;
use sudrf::fetch::PageFetcher;
use sudrf::model::{CaseStub, SearchPeriod, SearchStatus};
use sudrf::portal::{
    encode_portal_url, fetch_portal_case, page_request, parse_portal_listing, search_keyword,
    search_request, session_uid,
};

const UID: &str = "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9";

fn period() -> SearchPeriod {
    SearchPeriod::calendar_year(2023).expect("valid year")
}

#[test]
fn portal_requests_are_encoded_json_fragments() {
    let raw = search_request("взятка", &period());
    assert!(raw.starts_with("https://bsr.sudrf.ru/bigs/portal.html#{\"type\":\"MULTIQUERY\""));
    assert!(raw.contains(r#"\"query\":\"взятка\""#));
    assert!(raw.contains("2023-01-01T00:00:00"));
    assert!(raw.contains("2023-12-31T00:00:00"));

    let encoded = encode_portal_url(&raw);
    assert!(encoded.starts_with("https://bsr.sudrf.ru/bigs/portal.html#%7B%22type%22"));
    assert!(!encoded.contains('"'));
    assert!(!encoded.contains("взятка"));
    assert!(encoded.contains("%D0%B2%D0%B7%D1%8F%D1%82%D0%BA%D0%B0"));

    let page = page_request("взятка", &period(), 40, UID);
    assert!(page.contains(&format!("\"start\":40,\"rows\":20,\"uid\":\"{UID}\"")));
}

#[test]
fn portal_listing_parses_stubs_with_preview() {
    let listing = parse_portal_listing(&portal_listing(45, 0..2, UID)).expect("results list present");
    assert_eq!(listing.total, 45);
    assert_eq!(listing.stubs.len(), 2);

    let stub = &listing.stubs[0];
    assert_eq!(stub.case_id, "case0");
    assert_eq!(stub.preview.id_text, "№ 1-0/2023");
    assert_eq!(stub.preview.court_name.as_deref(), Some("Тестовый районный суд"));
    assert_eq!(stub.preview.adm_date.as_deref(), Some("01.02.2023"));
    assert_eq!(stub.preview.decision_result.as_deref(), Some("Вынесен приговор"));
    assert_eq!(session_uid(&stub.link).as_deref(), Some(UID));

    let empty = parse_portal_listing(&portal_nothing_found()).expect("results list present");
    assert_eq!(empty.total, 0);
    assert!(parse_portal_listing("<html><body></body></html>").is_none());
}

#[test]
fn keyword_search_pages_through_all_results() {
    let config = CrawlConfig::without_delays();
    let keyword = "взятка";

    let mut fetcher = FakeFetcher::new();
    fetcher
        .page(
            encode_portal_url(&search_request(keyword, &period())),
            portal_listing(45, 0..20, UID),
        )
        .page(
            encode_portal_url(&page_request(keyword, &period(), 20, UID)),
            portal_listing(45, 20..40, UID),
        )
        .page(
            encode_portal_url(&page_request(keyword, &period(), 40, UID)),
            portal_listing(45, 40..45, UID),
        );

    let results = search_keyword(&mut fetcher, &config, keyword, &period());
    assert_eq!(results.status, SearchStatus::Ok);
    assert_eq!(results.n_cases, 45);
    assert_eq!(fetcher.visited.len(), 3);

    let ids: HashSet<&str> = results.cases.iter().map(|stub| stub.case_id.as_str()).collect();
    assert_eq!(results.cases.len(), 45);
    assert_eq!(ids.len(), 45);
    assert!(results.logs.pagination_error.is_empty());

    assert_eq!(fetcher.peak_tabs, 2);
    assert_eq!(fetcher.tab_count(), 1);
}

#[test]
fn failed_portal_page_is_recorded_as_a_gap() {
    let config = CrawlConfig::without_delays();
    let keyword = "взятка";

    let mut fetcher = FakeFetcher::new();
    fetcher
        .page(
            encode_portal_url(&search_request(keyword, &period())),
            portal_listing(45, 0..20, UID),
        )
        .fail(encode_portal_url(&page_request(keyword, &period(), 20, UID)))
        .page(
            encode_portal_url(&page_request(keyword, &period(), 40, UID)),
            portal_listing(45, 40..45, UID),
        );

    let results = search_keyword(&mut fetcher, &config, keyword, &period());
    assert_eq!(results.status, SearchStatus::Ok);
    assert_eq!(results.cases.len(), 25);
    assert_eq!(results.logs.pagination_error, vec![2]);
    assert!(results.logs.driver_error);
    assert_eq!(fetcher.tab_count(), 1);
}

#[test]
fn keyword_search_distinguishes_empty_and_failed() {
    let config = CrawlConfig::without_delays();

    let mut empty = FakeFetcher::new();
    empty.page(
        encode_portal_url(&search_request("фальшивомонетчик", &period())),
        portal_nothing_found(),
    );
    let results = search_keyword(&mut empty, &config, "фальшивомонетчик", &period());
    assert_eq!(results.status, SearchStatus::NoResults);
    assert_eq!(results.n_cases, 0);
    assert!(results.cases.is_empty());

    let mut broken = FakeFetcher::new();
    broken.page(
        encode_portal_url(&search_request("взятка", &period())),
        "<html><body><div class=\"loading\"></div></body></html>",
    );
    let results = search_keyword(&mut broken, &config, "взятка", &period());
    assert_eq!(results.status, SearchStatus::RequestFailed);
}

fn stub(id: &str) -> CaseStub {
    let listing = parse_portal_listing(&portal_listing(1, [0], UID)).expect("results list present");
    let mut stub = listing.stubs[0].clone();
    stub.case_id = id.to_string();
    stub.link = format!("https://bsr.sudrf.ru/bigs/showDocument.html#id={id}&shard=ug");
    stub
}

#[test]
fn portal_case_page_merges_preview_accused_and_decision() {
    let config = CrawlConfig::without_delays();
    let stub = stub("a1");

    let mut fetcher = FakeFetcher::new();
    fetcher
        .page(encode_portal_url(&stub.link), fixture("portal_case.html"))
        .page(
            "https://bsr.sudrf.ru/bigs/doc/decision-a1.html",
            fixture("portal_decision.html"),
        );

    let record = fetch_portal_case(&mut fetcher, &config, &stub).expect("case loaded");
    assert!(record.found);
    assert_eq!(record.case_id, "a1");
    assert_eq!(record.metadata.court_name.as_deref(), Some("Тестовый районный суд"));
    assert_eq!(record.metadata.judge.as_deref(), Some("Орлова Мария Викторовна"));
    assert_eq!(record.metadata.accused.len(), 1);
    assert_eq!(record.metadata.accused[0].name, "Волков Андрей");
    assert_eq!(
        record.metadata.accused[0].article,
        vec!["ст.290 ч.5 ".to_string(), "ст.291 ".to_string()]
    );
    assert_eq!(
        record.case_text,
        "ПРИГОВОР Именем Российской Федерации 'подсудимый' признан виновным."
    );
    assert_eq!(fetcher.tab_count(), 1);
}

#[test]
fn portal_captcha_dialog_is_dismissed() {
    let config = CrawlConfig::without_delays();
    let stub = stub("b2");

    let mut fetcher = FakeFetcher::new();
    fetcher.page(encode_portal_url(&stub.link), fixture("portal_case_captcha.html"));

    let record = fetch_portal_case(&mut fetcher, &config, &stub).expect("case loaded");
    assert_eq!(record.metadata.accused[0].name, "Лебедев Игорь");
    assert!(record.case_text.is_empty());
    assert_eq!(
        &fetcher.actions[..2],
        &[
            "fill css=#capchaDialog input 1".to_string(),
            "click class=ui-button-text".to_string(),
        ]
    );
}

#[test]
fn portal_case_that_never_renders_is_skipped() {
    let config = CrawlConfig::without_delays();
    let stub = stub("c3");

    let mut fetcher = FakeFetcher::new();
    fetcher.page(encode_portal_url(&stub.link), "<html><body>Загрузка</body></html>");

    assert!(fetch_portal_case(&mut fetcher, &config, &stub).is_none());
    assert_eq!(fetcher.tab_count(), 1);
}

#[test]
fn listing_without_result_count_takes_total_from_items() {
    let html = portal_listing(40, [1, 2, 3], UID).replace(
        r#"<div id="resultCount" data-total="40">Найдено: 40</div>"#,
        "",
    );
    let listing = parse_portal_listing(&html).expect("results list present");
    assert_eq!(listing.total, 3);
    assert_eq!(listing.stubs.len(), 3);
}
