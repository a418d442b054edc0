#![allow(dead_code)]

use anyhow::Result;
use scraper::Html;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use sudrf::captcha::{CaptchaChallenge, ChallengeResolver};
use sudrf::fetch::{FetchError, Locator, PageFetcher};

/// What a scripted URL answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    Page(String),
    Fail,
}

/// Scripted browser session. Each URL replays its replies in order and
/// repeats the last one; unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    routes: HashMap<String, VecDeque<Reply>>,
    tabs: Vec<Option<String>>,
    current: usize,
    pub visited: Vec<String>,
    pub actions: Vec<String>,
    pub peak_tabs: usize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            tabs: vec![None],
            peak_tabs: 1,
            ..Self::default()
        }
    }

    pub fn page(&mut self, url: impl Into<String>, html: impl Into<String>) -> &mut Self {
        self.script(url, vec![Reply::Page(html.into())])
    }

    pub fn fail(&mut self, url: impl Into<String>) -> &mut Self {
        self.script(url, vec![Reply::Fail])
    }

    pub fn script(&mut self, url: impl Into<String>, replies: Vec<Reply>) -> &mut Self {
        self.routes.insert(url.into(), replies.into());
        self
    }

    pub fn visits(&self, url: &str) -> usize {
        self.visited.iter().filter(|visited| *visited == url).count()
    }

    pub fn visits_containing(&self, needle: &str) -> usize {
        self.visited
            .iter()
            .filter(|visited| visited.contains(needle))
            .count()
    }
}

impl PageFetcher for FakeFetcher {
    fn navigate(&mut self, url: &str) -> Result<(), FetchError> {
        self.visited.push(url.to_string());
        let reply = match self.routes.get_mut(url) {
            Some(replies) if replies.len() > 1 => replies.pop_front(),
            Some(replies) => replies.front().cloned(),
            None => None,
        };

        match reply {
            Some(Reply::Page(html)) => {
                self.tabs[self.current] = Some(html);
                Ok(())
            }
            Some(Reply::Fail) => {
                self.tabs[self.current] = None;
                Err(FetchError::Status {
                    url: url.to_string(),
                    status: 503,
                })
            }
            None => {
                self.tabs[self.current] = None;
                Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                })
            }
        }
    }

    fn wait_for(&mut self, locator: Locator, _timeout: Duration) -> bool {
        self.document()
            .map(|html| locator.is_present(&Html::parse_document(&html)))
            .unwrap_or(false)
    }

    fn document(&self) -> Result<String, FetchError> {
        self.tabs
            .get(self.current)
            .cloned()
            .flatten()
            .ok_or(FetchError::NoDocument)
    }

    fn open_tab(&mut self) -> Result<(), FetchError> {
        self.tabs.push(None);
        self.current = self.tabs.len() - 1;
        self.peak_tabs = self.peak_tabs.max(self.tabs.len());
        Ok(())
    }

    fn close_tab(&mut self) -> Result<(), FetchError> {
        if self.tabs.len() <= 1 {
            return Err(FetchError::Tab("cannot close the last tab".to_string()));
        }
        self.tabs.remove(self.current);
        self.current = 0;
        Ok(())
    }

    fn switch_tab(&mut self, index: usize) -> Result<(), FetchError> {
        if index >= self.tabs.len() {
            return Err(FetchError::Tab(format!("no tab at index {index}")));
        }
        self.current = index;
        Ok(())
    }

    fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    fn execute_script(&mut self, script: &str) -> Result<(), FetchError> {
        self.actions.push(format!("script {script}"));
        Ok(())
    }

    fn fill_and_submit(&mut self, locator: Locator, value: &str) -> Result<(), FetchError> {
        self.actions.push(format!("fill {locator} {value}"));
        Ok(())
    }

    fn click(&mut self, locator: Locator) -> Result<(), FetchError> {
        self.actions.push(format!("click {locator}"));
        Ok(())
    }
}

/// Always answers with the same text, or never when `None`.
pub struct StaticResolver(pub Option<&'static str>);

impl ChallengeResolver for StaticResolver {
    fn name(&self) -> &'static str {
        "static"
    }

    fn solve(&self, _challenge: &CaptchaChallenge) -> Result<Option<String>> {
        Ok(self.0.map(str::to_string))
    }
}

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name))
        .unwrap_or_else(|err| panic!("fixture {name} unreadable: {err}"))
}

/// A classic-layout results page listing `ids` out of `total` cases.
pub fn form1_listing(total: u32, ids: impl IntoIterator<Item = u32>) -> String {
    let rows: String = ids
        .into_iter()
        .map(|id| {
            format!(
                r#"<tr><td><a href="/modules.php?name=sud_delo&amp;srv_num=1&amp;name_op=case&amp;case_id={id}&amp;case_uid=uid-{id}&amp;delo_id=1540006">1-{id}/2023</a></td><td>10.01.2023</td></tr>"#
            )
        })
        .collect();
    format!(
        r#"<!DOCTYPE html><html><head><meta charset="utf-8"></head><body>
<div id="content">
<table><tr><td align="right">Всего по запросу найдено — {total}. Показаны записи</td></tr></table>
<table id="tablcont"><tr><th>№ дела</th><th>Поступило</th></tr>{rows}</table>
</div></body></html>"#
    )
}

pub fn form1_case_key(id: u32) -> String {
    format!("case_id={id}&case_uid=uid-{id}")
}

/// A scripted-layout results page showing rows `from..=to` of `total`,
/// one link per id.
pub fn form2_listing(total: u32, from: u32, to: u32, ids: impl IntoIterator<Item = u32>) -> String {
    let rows: String = ids
        .into_iter()
        .map(|id| {
            format!(
                r#"<tr><td class="lawcase-number-td"><a href="/modules.php?name=sud_delo&amp;name_op=case&amp;_id={id}&amp;_uid=uid-{id}&amp;_deloId=1540006">1-{id}/2023</a></td><td>01.02.2023</td></tr>"#
            )
        })
        .collect();
    format!(
        r#"<!DOCTYPE html><html><head><meta charset="utf-8"></head><body>
<div class="lawcase-count">Всего по запросу найдено - {total}. Показаны записи с {from} по {to}</div>
<table id="resultTable"><tr><th>Номер дела</th><th>Дата</th></tr>{rows}</table>
</body></html>"#
    )
}

pub fn form2_case_key(id: u32) -> String {
    format!("_id={id}&_uid=uid-{id}")
}

/// A portal results page for `ids`, with case links bound to `uid`.
pub fn portal_listing(total: u32, ids: impl IntoIterator<Item = u32>, uid: &str) -> String {
    let items: String = ids
        .into_iter()
        .map(|id| {
            format!(
                r#"<li>
<a class="resultHeader" href="https://bsr.sudrf.ru/bigs/showDocument.html#id=case{id}&amp;shard=ug&amp;from=p&amp;r={uid}">Документ</a>
<div class="bgs-result"><a>Уголовное дело № 1-{id}/2023</a></div>
<span class="resultHeaderAttributes">
<span class="additional-field-value" data-comment="Наименование суда:"><span>Тестовый районный суд</span></span>
<span class="additional-field-value" data-comment="Дата поступления:"><span>01.02.2023</span></span>
<span class="additional-field-value" data-comment="Результат рассмотрения:"><span>Вынесен приговор</span></span>
</span>
</li>"#
            )
        })
        .collect();
    format!(
        r#"<!DOCTYPE html><html><head><meta charset="utf-8"></head><body>
<div id="resultCount" data-total="{total}">Найдено: {total}</div>
<ul id="resultsList" class="resultsList">{items}</ul>
</body></html>"#
    )
}

pub fn portal_nothing_found() -> String {
    r#"<!DOCTYPE html><html><body><ul id="resultsList" class="resultsList"><li>Ничего не найдено</li></ul></body></html>"#
        .to_string()
}
