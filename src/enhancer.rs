//! Cleaning up OCR text with an LLM.
//!
//! The enhancer fixes OCR mistakes and pulls out the entry's date and location
//! in a single call. It never fails a page: if the LLM can't help, we keep the
//! raw OCR text and say so in the entry.

use std::{sync::Arc, time::Duration};

use keen_retry::RetryResult;
use schemars::JsonSchema;
use serde_json::Map;

use crate::{
    config::DigitizeConfig,
    dates::find_date,
    drivers::{CompletionRequest, Driver, LlmRetryResult, TokenUsage, structured_completion},
    prelude::*,
    prompt::ChatPrompt,
    retry::{retry_result_ok, run_with_retries},
    schema::ResponseSchema,
};

/// The built-in enhancement prompt.
const DEFAULT_ENHANCE_PROMPT: &str = include_str!("enhancer/default_enhance_prompt.toml");

/// How many times we retry a transient failure.
const RE_ATTEMPTS: u8 = 1;

/// Upper bound on the retry delay, in milliseconds.
const MAX_BACKOFF_MILLIS: u32 = 2_000;

/// What the LLM tells us about a page. Models sometimes add keys of their
/// own, so unknown fields are ignored.
#[derive(Debug, Deserialize, JsonSchema)]
struct EnhancedPage {
    /// The corrected text of the page.
    enhanced_text: String,

    /// The date of the entry, if the page shows one.
    #[serde(default)]
    date_entry: Option<String>,

    /// Where the entry was written, if the page says.
    #[serde(default)]
    location: Option<String>,

    /// Weather or sea conditions, if recorded.
    #[serde(default)]
    weather: Option<String>,

    /// A short summary of what happened.
    #[serde(default)]
    activities: Option<String>,

    /// People named on the page.
    #[serde(default)]
    people_mentioned: Option<Vec<String>>,
}

/// What happened when we tried to enhance a page.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementStatus {
    /// The LLM cleaned up the text.
    Enhanced,
    /// We asked, but the LLM failed. Content is the raw OCR text.
    Failed,
    /// We didn't ask. Content is the raw OCR text.
    Skipped,
}

/// Information about the page being enhanced, used in the prompt.
#[derive(Clone, Debug)]
pub struct EnhancementContext<'a> {
    pub source: &'a str,
    pub filename: &'a str,
    pub page_number: Option<u64>,
}

/// The enhanced content of a page.
#[derive(Clone, Debug, PartialEq)]
pub struct Enhancement {
    pub content: String,
    pub date_entry: Option<String>,
    pub location: Option<String>,
    pub weather: Option<String>,
    pub activities: Option<String>,
    pub people_mentioned: Option<Vec<String>>,
    pub status: EnhancementStatus,
    pub token_usage: Option<TokenUsage>,
}

impl Enhancement {
    /// An enhancement we never attempted.
    pub fn skipped(raw_text: &str) -> Self {
        Self::unchanged(raw_text, EnhancementStatus::Skipped)
    }

    /// Keep the raw text as-is.
    fn unchanged(raw_text: &str, status: EnhancementStatus) -> Self {
        Self {
            content: raw_text.to_owned(),
            date_entry: None,
            location: None,
            weather: None,
            activities: None,
            people_mentioned: None,
            status,
            token_usage: None,
        }
    }
}

/// Cleans up OCR text.
pub struct ContentEnhancer {
    /// Our LLM, or `None` if enhancement is disabled.
    driver: Option<Arc<dyn Driver>>,
    model: String,
    prompt: ChatPrompt,
    schema: ResponseSchema,
    max_completion_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout: Duration,
    /// Look for dates with regexes when the LLM doesn't give us one?
    date_fallback: bool,
}

impl ContentEnhancer {
    /// Create a new enhancer. If `driver` is `None`, every page is skipped.
    pub fn new(driver: Option<Arc<dyn Driver>>, config: &DigitizeConfig) -> Result<Self> {
        Ok(Self {
            driver,
            model: config.enhance_model.clone(),
            prompt: ChatPrompt::from_toml(
                "default_enhance_prompt.toml",
                DEFAULT_ENHANCE_PROMPT,
            )?,
            schema: ResponseSchema::for_type::<EnhancedPage>()?,
            max_completion_tokens: config.max_completion_tokens,
            temperature: config.temperature,
            timeout: config.request_timeout,
            date_fallback: config.date_fallback,
        })
    }

    /// Enhance `raw_text`.
    #[instrument(level = "debug", skip_all, fields(page = %context.filename))]
    pub async fn enhance(&self, raw_text: &str, context: &EnhancementContext<'_>) -> Enhancement {
        let mut enhancement = match &self.driver {
            Some(driver) => self.enhance_with_llm(driver.as_ref(), raw_text, context).await,
            None => Enhancement::skipped(raw_text),
        };

        // Fill in a missing date, unless the LLM failed outright.
        if self.date_fallback
            && enhancement.date_entry.is_none()
            && enhancement.status != EnhancementStatus::Failed
        {
            enhancement.date_entry =
                find_date(&enhancement.content).or_else(|| find_date(raw_text));
            if let Some(date) = &enhancement.date_entry {
                debug!(%date, "Found date with fallback parser");
            }
        }
        enhancement
    }

    /// Ask the LLM, with a bounded number of retries.
    async fn enhance_with_llm(
        &self,
        driver: &dyn Driver,
        raw_text: &str,
        context: &EnhancementContext<'_>,
    ) -> Enhancement {
        let mut bindings = Map::new();
        bindings.insert("source".to_owned(), json!(context.source));
        bindings.insert("filename".to_owned(), json!(context.filename));
        bindings.insert(
            "page_label".to_owned(),
            json!(
                context
                    .page_number
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unknown".to_owned())
            ),
        );
        bindings.insert("raw_text".to_owned(), json!(raw_text));
        let prompt = match self.prompt.render(&bindings) {
            Ok(prompt) => prompt,
            Err(err) => {
                error!("Could not render enhancement prompt: {:?}", err);
                return Enhancement::unchanged(raw_text, EnhancementStatus::Failed);
            }
        };

        let request = CompletionRequest {
            model: &self.model,
            prompt: &prompt,
            schema: self.schema.json(),
            max_completion_tokens: self.max_completion_tokens,
            temperature: self.temperature,
            timeout: self.timeout,
        };
        let (output, errors) = run_with_retries(RE_ATTEMPTS, MAX_BACKOFF_MILLIS, || {
            self.attempt_enhancement(driver, &request)
        })
        .await;

        match output {
            Some((page, token_usage)) => Enhancement {
                content: page.enhanced_text.trim().to_owned(),
                date_entry: non_blank(page.date_entry).map(normalize_date),
                location: non_blank(page.location),
                weather: non_blank(page.weather),
                activities: non_blank(page.activities),
                people_mentioned: page
                    .people_mentioned
                    .map(|names| {
                        names
                            .into_iter()
                            .filter_map(|name| non_blank(Some(name)))
                            .collect::<Vec<_>>()
                    })
                    .filter(|names| !names.is_empty()),
                status: EnhancementStatus::Enhanced,
                token_usage,
            },
            None => {
                warn!(
                    "Enhancement failed for {}, keeping raw text: {}",
                    context.filename,
                    errors.join("; ")
                );
                Enhancement::unchanged(raw_text, EnhancementStatus::Failed)
            }
        }
    }

    /// A single LLM call.
    async fn attempt_enhancement(
        &self,
        driver: &dyn Driver,
        request: &CompletionRequest<'_>,
    ) -> LlmRetryResult<(EnhancedPage, Option<TokenUsage>)> {
        let (page, token_usage) = match structured_completion::<EnhancedPage>(
            driver,
            request,
            &self.schema,
        )
        .await
        {
            RetryResult::Ok { output, .. } => output,
            RetryResult::Transient { input, error } => {
                return RetryResult::Transient { input, error };
            }
            RetryResult::Fatal { input, error } => {
                return RetryResult::Fatal { input, error };
            }
        };
        if page.enhanced_text.trim().is_empty() {
            return RetryResult::Transient {
                input: (),
                error: anyhow!("LLM returned empty enhanced_text"),
            };
        }
        retry_result_ok((page, token_usage))
    }
}

/// Write a date as `YYYY-MM-DD` if we can parse it, or leave it as the LLM
/// wrote it.
fn normalize_date(date: String) -> String {
    find_date(&date).unwrap_or(date)
}

/// Treat blank strings (and the string "null") as missing.
fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
}

#[cfg(test)]
mod tests {
    use crate::{
        config::testing::config,
        drivers::testing::{Script, ScriptedDriver},
    };

    use super::*;

    const RAW: &str = "Lcft Shanghai 14 Jan 1933, fog.";

    fn context() -> EnhancementContext<'static> {
        EnhancementContext {
            source: "a 1933 world tour logbook",
            filename: "IMG_4270.png",
            page_number: Some(4270),
        }
    }

    fn enhancer(driver: Option<Arc<ScriptedDriver>>, date_fallback: bool) -> ContentEnhancer {
        let dir = Path::new(".");
        let mut config = config(dir, dir);
        config.date_fallback = date_fallback;
        ContentEnhancer::new(driver.map(|d| d as Arc<dyn Driver>), &config).unwrap()
    }

    #[tokio::test]
    async fn enhances_text_and_extracts_metadata() {
        let driver = Arc::new(ScriptedDriver::new(Script::Respond(json!({
            "enhanced_text": "Left Shanghai 14 Jan 1933, fog.",
            "date_entry": "14 January 1933",
            "location": "Shanghai",
        }))));
        let enhancement = enhancer(Some(driver.clone()), true)
            .enhance(RAW, &context())
            .await;
        assert_eq!(enhancement.status, EnhancementStatus::Enhanced);
        assert_eq!(enhancement.content, "Left Shanghai 14 Jan 1933, fog.");
        assert_eq!(enhancement.date_entry.as_deref(), Some("1933-01-14"));
        assert_eq!(enhancement.location.as_deref(), Some("Shanghai"));
        assert_eq!(enhancement.token_usage.unwrap().completion_tokens, 5);

        // The prompt includes the raw text and page context.
        let prompts = driver.prompts.lock().unwrap();
        let user_text = prompts[0].last_user_text().unwrap();
        assert!(user_text.contains(RAW));
        assert!(user_text.contains("4270"));
    }

    #[tokio::test]
    async fn extra_keys_and_metadata_are_accepted() {
        let driver = Arc::new(ScriptedDriver::new(Script::Respond(json!({
            "enhanced_text": "Left Shanghai.",
            "date_entry": "14 Jan 1933",
            "weather": "fog",
            "activities": "  ",
            "people_mentioned": ["Captain Ross", ""],
            "mood": "cheerful",
        }))));
        let enhancement = enhancer(Some(driver.clone()), true)
            .enhance(RAW, &context())
            .await;
        assert_eq!(enhancement.status, EnhancementStatus::Enhanced);
        assert_eq!(enhancement.content, "Left Shanghai.");
        assert_eq!(enhancement.date_entry.as_deref(), Some("1933-01-14"));
        assert_eq!(enhancement.weather.as_deref(), Some("fog"));
        assert_eq!(enhancement.activities, None);
        assert_eq!(
            enhancement.people_mentioned,
            Some(vec!["Captain Ross".to_owned()])
        );
        assert_eq!(driver.call_count(), 1);
    }

    #[tokio::test]
    async fn unparseable_llm_dates_are_kept_as_written() {
        let driver = Arc::new(ScriptedDriver::new(Script::Respond(json!({
            "enhanced_text": "Left Shanghai.",
            "date_entry": "the Tuesday after Easter",
        }))));
        let enhancement = enhancer(Some(driver), true).enhance(RAW, &context()).await;
        assert_eq!(
            enhancement.date_entry.as_deref(),
            Some("the Tuesday after Easter")
        );
    }

    #[tokio::test]
    async fn missing_dates_fall_back_to_regexes() {
        let driver = Arc::new(ScriptedDriver::new(Script::Respond(json!({
            "enhanced_text": "Left Shanghai 14 Jan 1933, fog.",
            "date_entry": null,
        }))));
        let enhancement = enhancer(Some(driver.clone()), true)
            .enhance(RAW, &context())
            .await;
        assert_eq!(enhancement.date_entry.as_deref(), Some("1933-01-14"));
        assert_eq!(enhancement.location, None);

        let enhancement = enhancer(Some(driver), false).enhance(RAW, &context()).await;
        assert_eq!(enhancement.date_entry, None);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_once() {
        let driver = Arc::new(ScriptedDriver::new(Script::FlakyThenRespond(
            1,
            json!({ "enhanced_text": "Left Shanghai." }),
        )));
        let enhancement = enhancer(Some(driver.clone()), true)
            .enhance(RAW, &context())
            .await;
        assert_eq!(enhancement.status, EnhancementStatus::Enhanced);
        assert_eq!(driver.call_count(), 2);

        let driver = Arc::new(ScriptedDriver::new(Script::FlakyThenRespond(
            5,
            json!({ "enhanced_text": "Left Shanghai." }),
        )));
        let enhancement = enhancer(Some(driver.clone()), true)
            .enhance(RAW, &context())
            .await;
        assert_eq!(enhancement.status, EnhancementStatus::Failed);
        assert_eq!(driver.call_count(), 2);
    }

    #[tokio::test]
    async fn failures_keep_the_raw_text() {
        let driver = Arc::new(ScriptedDriver::new(Script::Fail));
        let enhancement = enhancer(Some(driver.clone()), true)
            .enhance(RAW, &context())
            .await;
        assert_eq!(enhancement.status, EnhancementStatus::Failed);
        assert_eq!(enhancement.content, RAW);
        assert_eq!(enhancement.date_entry, None);
        assert_eq!(enhancement.location, None);
        assert_eq!(driver.call_count(), 1);
    }

    #[tokio::test]
    async fn invalid_responses_count_as_failures() {
        let driver = Arc::new(ScriptedDriver::new(Script::Respond(json!({
            "text": "wrong field",
        }))));
        let enhancement = enhancer(Some(driver.clone()), true)
            .enhance(RAW, &context())
            .await;
        assert_eq!(enhancement.status, EnhancementStatus::Failed);
        assert_eq!(driver.call_count(), 2);
    }

    #[tokio::test]
    async fn no_driver_means_skipped() {
        let enhancement = enhancer(None, true).enhance(RAW, &context()).await;
        assert_eq!(enhancement.status, EnhancementStatus::Skipped);
        assert_eq!(enhancement.content, RAW);
        assert_eq!(enhancement.date_entry.as_deref(), Some("1933-01-14"));
    }
}
