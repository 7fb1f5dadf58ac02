//! Vision-language model OCR backend.

use std::{sync::Arc, time::Duration};

use schemars::JsonSchema;
use serde_json::Map;

use crate::{
    data_url::image_data_url,
    drivers::{CompletionRequest, Driver, structured_completion},
    images::PageImage,
    prelude::*,
    prompt::ChatPrompt,
    retry::retry_result_into_result,
    schema::ResponseSchema,
};

use super::{BackendId, OcrBackend, Recognition};

/// The built-in OCR prompt.
const DEFAULT_OCR_PROMPT: &str = include_str!("llm_vision/default_ocr_prompt.toml");

/// Vision models read clear pages well, so long transcriptions get a high
/// score. Short ones are often the model giving up.
const LONG_TEXT_CONFIDENCE: f64 = 0.85;
const SHORT_TEXT_CONFIDENCE: f64 = 0.6;
const LONG_TEXT_CHARS: usize = 50;

/// A transcription of one logbook page. Extra keys from the model are
/// ignored.
#[derive(Debug, Deserialize, JsonSchema)]
struct PageTranscription {
    /// The complete text of the page, preserving line breaks.
    text: String,
}

/// An OCR backend that asks a vision-language model to transcribe pages.
pub struct LlmVisionBackend {
    driver: Arc<dyn Driver>,
    model: String,
    prompt: ChatPrompt,
    schema: ResponseSchema,
    max_completion_tokens: Option<u32>,
    timeout: Duration,
}

impl LlmVisionBackend {
    /// Create a new vision backend.
    pub fn new(
        driver: Arc<dyn Driver>,
        model: String,
        max_completion_tokens: Option<u32>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            driver,
            model,
            prompt: ChatPrompt::from_toml("default_ocr_prompt.toml", DEFAULT_OCR_PROMPT)?,
            schema: ResponseSchema::for_type::<PageTranscription>()?,
            max_completion_tokens,
            timeout,
        })
    }
}

#[async_trait]
impl OcrBackend for LlmVisionBackend {
    fn id(&self) -> BackendId {
        BackendId::OpenaiVision
    }

    #[instrument(level = "debug", skip_all, fields(page = %page.filename, model = %self.model))]
    async fn recognize(&self, page: &PageImage) -> Result<Recognition> {
        let data = page.read_bytes().await?;
        let mut bindings = Map::new();
        bindings.insert(
            "page_data_url".to_owned(),
            Value::String(image_data_url(&data, &page.mime_type)),
        );
        drop(data); // Release memory, because it adds up.
        let prompt = self.prompt.render(&bindings)?;

        let request = CompletionRequest {
            model: &self.model,
            prompt: &prompt,
            schema: self.schema.json(),
            max_completion_tokens: self.max_completion_tokens,
            temperature: None,
            timeout: self.timeout,
        };
        // No retries here. If this fails, the selector moves on.
        let (transcription, token_usage) = retry_result_into_result(
            structured_completion::<PageTranscription>(
                self.driver.as_ref(),
                &request,
                &self.schema,
            )
            .await,
        )?;

        let text = transcription.text.trim().to_owned();
        Ok(Recognition {
            confidence: length_confidence(&text),
            text,
            token_usage,
        })
    }
}

/// Score a transcription by its length.
fn length_confidence(text: &str) -> f64 {
    if text.chars().count() > LONG_TEXT_CHARS {
        LONG_TEXT_CONFIDENCE
    } else {
        SHORT_TEXT_CONFIDENCE
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        backends::testing::page,
        drivers::testing::{Script, ScriptedDriver},
        prompt::RenderedMessage,
    };

    use super::*;

    fn backend(driver: Arc<ScriptedDriver>) -> LlmVisionBackend {
        LlmVisionBackend::new(driver, "gpt-4o".to_owned(), None, Duration::from_secs(5))
            .unwrap()
    }

    async fn page_on_disk(dir: &Path) -> PageImage {
        let mut image = page(0, "IMG_4270.png");
        image.path = dir.join("IMG_4270.png");
        tokio::fs::write(&image.path, b"\x89PNG\r\n\x1a\n0000").await.unwrap();
        image
    }

    #[tokio::test]
    async fn long_transcriptions_score_higher() {
        let dir = tempfile::tempdir().unwrap();
        let image = page_on_disk(dir.path()).await;
        let long_text = "Sailed from Yokohama at dawn, heavy swell, all hands well.";
        let driver = Arc::new(ScriptedDriver::new(Script::Respond(
            json!({ "text": long_text }),
        )));
        let attempt = backend(driver.clone()).attempt(&image).await;
        assert!(attempt.ok);
        assert_eq!(attempt.confidence, 0.85);
        assert_eq!(attempt.text, long_text);
        assert_eq!(attempt.token_usage.unwrap().prompt_tokens, 10);

        // The page was sent as a data URL.
        let prompts = driver.prompts.lock().unwrap();
        let RenderedMessage::User { images, .. } = &prompts[0].messages[1] else {
            panic!("expected a user message");
        };
        assert!(images[0].starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn short_and_empty_transcriptions() {
        let dir = tempfile::tempdir().unwrap();
        let image = page_on_disk(dir.path()).await;

        let driver = Arc::new(ScriptedDriver::new(Script::Respond(json!({ "text": "Jan 3" }))));
        let attempt = backend(driver).attempt(&image).await;
        assert!(attempt.ok);
        assert_eq!(attempt.confidence, 0.6);

        let driver = Arc::new(ScriptedDriver::new(Script::Respond(json!({ "text": "" }))));
        let attempt = backend(driver).attempt(&image).await;
        assert!(!attempt.ok);
    }

    #[tokio::test]
    async fn extra_keys_in_the_reply_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let image = page_on_disk(dir.path()).await;
        let driver = Arc::new(ScriptedDriver::new(Script::Respond(json!({
            "text": "Jan 3",
            "language": "en",
        }))));
        let attempt = backend(driver).attempt(&image).await;
        assert!(attempt.ok, "{:?}", attempt.error);
        assert_eq!(attempt.text, "Jan 3");
    }

    #[tokio::test]
    async fn failures_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let image = page_on_disk(dir.path()).await;
        let driver = Arc::new(ScriptedDriver::new(Script::FlakyThenRespond(
            1,
            json!({ "text": "too late" }),
        )));
        let attempt = backend(driver.clone()).attempt(&image).await;
        assert!(!attempt.ok);
        assert_eq!(driver.call_count(), 1);
    }
}
