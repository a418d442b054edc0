use crate::config::{CaptchaConfig, CrawlConfig, FetchConfig};
use crate::extract::PageExtractor;
use crate::fetch::{PageFetcher, build_http_client};
use crate::model::SiteProfile;
use anyhow::{Context, Result, bail};
use base64::Engine;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A captcha as served inside a court search form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaChallenge {
    pub captcha_id: String,
    pub image_base64: String,
}

impl CaptchaChallenge {
    pub fn image_bytes(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(self.image_base64.trim())
            .context("captcha image is not valid base64")
    }

    /// Query fragment appended to search requests.
    pub fn token(&self, answer: &str) -> String {
        format!("&captcha={}&captchaid={}", answer.trim(), self.captcha_id)
    }
}

/// Produces the text shown in a captcha image. `Ok(None)` means this
/// resolver could not come up with an answer and the next one may try.
pub trait ChallengeResolver {
    fn name(&self) -> &'static str;
    fn solve(&self, challenge: &CaptchaChallenge) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(rename = "IsErroredOnProcessing", default)]
    errored: bool,
    #[serde(rename = "ParsedResults", default)]
    parsed_results: Option<Vec<OcrParsedResult>>,
}

#[derive(Debug, Deserialize)]
struct OcrParsedResult {
    #[serde(rename = "ParsedText", default)]
    parsed_text: String,
}

/// OCR.space-compatible recognition service.
pub struct OcrSpaceResolver {
    client: Client,
    api_key: String,
    endpoint: String,
    engine: String,
}

impl OcrSpaceResolver {
    pub fn new(api_key: &str, captcha: &CaptchaConfig, fetch: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(fetch)?,
            api_key: api_key.to_string(),
            endpoint: captcha.ocr_endpoint.clone(),
            engine: captcha.ocr_engine.clone(),
        })
    }
}

impl ChallengeResolver for OcrSpaceResolver {
    fn name(&self) -> &'static str {
        "ocr"
    }

    fn solve(&self, challenge: &CaptchaChallenge) -> Result<Option<String>> {
        let image = format!("data:image/jpeg;base64,{}", challenge.image_base64);
        let params = [
            ("apikey", self.api_key.as_str()),
            ("OCREngine", self.engine.as_str()),
            ("base64Image", image.as_str()),
        ];

        let response: OcrResponse = self
            .client
            .post(&self.endpoint)
            .form(&params)
            .send()
            .with_context(|| format!("ocr request to {} failed", self.endpoint))?
            .json()
            .context("failed to parse ocr response")?;

        Ok(parse_ocr_answer(response))
    }
}

fn parse_ocr_answer(response: OcrResponse) -> Option<String> {
    if response.errored {
        return None;
    }
    let text = response.parsed_results?.into_iter().next()?.parsed_text;
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Human in the loop: writes the image next to other captchas and blocks on
/// a line from stdin.
pub struct PromptResolver {
    image_dir: PathBuf,
}

impl PromptResolver {
    pub fn new(image_dir: PathBuf) -> Self {
        Self { image_dir }
    }
}

impl ChallengeResolver for PromptResolver {
    fn name(&self) -> &'static str {
        "prompt"
    }

    fn solve(&self, challenge: &CaptchaChallenge) -> Result<Option<String>> {
        std::fs::create_dir_all(&self.image_dir).with_context(|| {
            format!("failed to create captcha dir {}", self.image_dir.display())
        })?;
        let path = self
            .image_dir
            .join(format!("captcha_{}.jpg", challenge.captcha_id));
        std::fs::write(&path, challenge.image_bytes()?)
            .with_context(|| format!("failed to write captcha image {}", path.display()))?;

        let mut stdout = std::io::stdout().lock();
        write!(stdout, "Captcha image saved to {}. Enter captcha: ", path.display())?;
        stdout.flush()?;

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        let answer = line.trim().to_string();
        Ok((!answer.is_empty()).then_some(answer))
    }
}

/// Tries resolvers in order; the first answer wins.
pub struct ResolverChain {
    resolvers: Vec<Box<dyn ChallengeResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Box<dyn ChallengeResolver>>) -> Self {
        Self { resolvers }
    }

    /// OCR first when a key is configured, then the terminal prompt.
    pub fn from_config(config: &CrawlConfig) -> Result<Self> {
        let mut resolvers: Vec<Box<dyn ChallengeResolver>> = Vec::new();
        if let Some(key) = config.captcha.ocr_api_key.as_deref().filter(|k| !k.is_empty()) {
            resolvers.push(Box::new(OcrSpaceResolver::new(
                key,
                &config.captcha,
                &config.fetch,
            )?));
        }
        resolvers.push(Box::new(PromptResolver::new(config.captcha.image_dir.clone())));
        Ok(Self::new(resolvers))
    }
}

impl ChallengeResolver for ResolverChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn solve(&self, challenge: &CaptchaChallenge) -> Result<Option<String>> {
        for resolver in &self.resolvers {
            match resolver.solve(challenge) {
                Ok(Some(answer)) => {
                    debug!(resolver = resolver.name(), "captcha answered");
                    return Ok(Some(answer));
                }
                Ok(None) => {
                    warn!(resolver = resolver.name(), "captcha not recognised; trying next resolver");
                }
                Err(err) => {
                    warn!(resolver = resolver.name(), error = %err, "captcha resolver failed; trying next resolver");
                }
            }
        }
        Ok(None)
    }
}

/// Loads the challenge page, solves it, and returns the request token.
/// The page load is attempted `max_attempts` times; a page that loads but
/// cannot be answered fails immediately.
pub fn acquire_token(
    fetcher: &mut dyn PageFetcher,
    site: &SiteProfile,
    extractor: &dyn PageExtractor,
    resolver: &dyn ChallengeResolver,
    config: &CrawlConfig,
) -> Result<String> {
    let url = extractor.captcha_url(site);
    let attempts = config.retry.max_attempts.max(1);

    for attempt in 1..=attempts {
        if let Err(err) = fetcher.navigate(&url) {
            warn!(site = %site.website, attempt, error = %err, "captcha page failed to load");
            continue;
        }
        if !fetcher.wait_for(extractor.captcha_marker(), config.wait.captcha()) {
            warn!(site = %site.website, attempt, "captcha form did not appear");
            continue;
        }

        let html = fetcher.document()?;
        let Some(challenge) = extractor.parse_captcha(&html) else {
            warn!(site = %site.website, attempt, "captcha form has no challenge");
            continue;
        };

        let Some(answer) = resolver.solve(&challenge)? else {
            bail!("captcha for {} was not answered", site.website);
        };
        info!(site = %site.website, captcha_id = %challenge.captcha_id, "captcha obtained");
        return Ok(challenge.token(&answer));
    }

    bail!("captcha not obtained for {} after {attempts} attempts", site.website)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_answer_requires_clean_processing_and_a_result() {
        let ok: OcrResponse = serde_json::from_str(
            r#"{"IsErroredOnProcessing":false,"ParsedResults":[{"ParsedText":"4821\r\n"}]}"#,
        )
        .unwrap();
        assert_eq!(parse_ocr_answer(ok), Some("4821".to_string()));

        let errored: OcrResponse = serde_json::from_str(
            r#"{"IsErroredOnProcessing":true,"ParsedResults":[{"ParsedText":"4821"}]}"#,
        )
        .unwrap();
        assert_eq!(parse_ocr_answer(errored), None);

        let empty: OcrResponse =
            serde_json::from_str(r#"{"IsErroredOnProcessing":false}"#).unwrap();
        assert_eq!(parse_ocr_answer(empty), None);
    }
}
