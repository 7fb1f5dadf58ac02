//! OCR backends.
//!
//! Each backend turns a page image into text plus a confidence score. The
//! [`selector`](crate::selector) decides which ones to call and which result
//! to keep.

use std::{fmt, sync::Arc};

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{
    config::DigitizeConfig,
    drivers::{Driver, TokenUsage, openai::OpenAiDriver},
    images::PageImage,
    prelude::*,
};

use self::{
    google_vision::GoogleVisionBackend, llm_vision::LlmVisionBackend,
    tesseract::TesseractBackend,
};

pub mod google_vision;
pub mod llm_vision;
pub mod tesseract;

/// The OCR backends we know about.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum BackendId {
    /// Google Cloud Vision `DOCUMENT_TEXT_DETECTION`.
    GoogleVision,
    /// The local `tesseract` CLI.
    Tesseract,
    /// A vision-language model, via the OpenAI API.
    OpenaiVision,
}

impl BackendId {
    /// Our default priority order.
    pub fn default_order() -> Vec<BackendId> {
        vec![
            BackendId::GoogleVision,
            BackendId::Tesseract,
            BackendId::OpenaiVision,
        ]
    }

    /// The name we use in output files.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendId::GoogleVision => "google_vision",
            BackendId::Tesseract => "tesseract",
            BackendId::OpenaiVision => "openai_vision",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text recognised by a backend.
#[derive(Clone, Debug)]
pub struct Recognition {
    /// The text, which may be empty.
    pub text: String,

    /// The backend's own estimate of its accuracy. Not necessarily in [0,1].
    pub confidence: f64,

    /// LLM tokens used, if any.
    pub token_usage: Option<TokenUsage>,
}

/// The result of running one backend on one page.
#[derive(Clone, Debug)]
pub struct OcrAttempt {
    /// Which backend produced this.
    pub backend: BackendId,

    /// Extracted text. Empty unless `ok`.
    pub text: String,

    /// Confidence in [0,1]. Zero unless `ok`.
    pub confidence: f64,

    /// Did the backend produce usable text?
    pub ok: bool,

    /// What went wrong, if not `ok`.
    pub error: Option<String>,

    /// LLM tokens used, if any. Counted even for failed attempts.
    pub token_usage: Option<TokenUsage>,
}

impl OcrAttempt {
    /// Build an attempt from a recognition result. Blank text is a failure.
    pub fn from_recognition(backend: BackendId, recognition: Recognition) -> Self {
        if recognition.text.trim().is_empty() {
            return Self {
                token_usage: recognition.token_usage,
                ..Self::failure(backend, "no text recognised")
            };
        }
        Self {
            backend,
            text: recognition.text,
            confidence: clamp_confidence(recognition.confidence),
            ok: true,
            error: None,
            token_usage: recognition.token_usage,
        }
    }

    /// Build a failed attempt.
    pub fn failure(backend: BackendId, error: impl fmt::Display) -> Self {
        Self {
            backend,
            text: String::new(),
            confidence: 0.0,
            ok: false,
            error: Some(error.to_string()),
            token_usage: None,
        }
    }

    /// A short summary of this attempt, for the output entry.
    pub fn summary(&self) -> AttemptSummary {
        AttemptSummary {
            backend: self.backend,
            ok: self.ok,
            confidence: self.confidence,
            error: self.error.clone(),
        }
    }
}

/// A record of one OCR attempt, kept in the output for auditing.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct AttemptSummary {
    /// The backend we tried.
    pub backend: BackendId,

    /// Did it produce usable text?
    pub ok: bool,

    /// Its reported confidence.
    pub confidence: f64,

    /// What went wrong, if anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Force a confidence into [0,1]. NaN becomes 0.
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// Interface for OCR backends.
#[async_trait]
pub trait OcrBackend: Send + Sync + 'static {
    /// Which backend is this?
    fn id(&self) -> BackendId;

    /// Recognise the text on a page.
    async fn recognize(&self, page: &PageImage) -> Result<Recognition>;

    /// Run this backend on a page. This never fails. Errors become an
    /// attempt with `ok` set to false.
    #[instrument(level = "debug", skip_all, fields(backend = %self.id(), page = %page.filename))]
    async fn attempt(&self, page: &PageImage) -> OcrAttempt {
        match self.recognize(page).await {
            Ok(recognition) => OcrAttempt::from_recognition(self.id(), recognition),
            Err(err) => {
                debug!("OCR backend failed: {:?}", err);
                OcrAttempt::failure(self.id(), format!("{err:#}"))
            }
        }
    }
}

/// Build the backends in `config.backend_order`, skipping any we can't use.
///
/// Returns an error if none of them are usable.
pub async fn backends_for_config(
    config: &DigitizeConfig,
    llm_driver: Option<Arc<dyn Driver>>,
) -> Result<Vec<Arc<dyn OcrBackend>>> {
    let mut backends: Vec<Arc<dyn OcrBackend>> = vec![];
    for &id in &config.backend_order {
        if backends.iter().any(|b| b.id() == id) {
            warn!("Backend {} listed more than once, ignoring duplicate", id);
            continue;
        }
        match id {
            BackendId::GoogleVision => match &config.credentials.google_vision {
                Some(credentials) => backends.push(Arc::new(GoogleVisionBackend::new(
                    credentials,
                    config.vision_rate_limit.as_ref(),
                )?)),
                None => warn!(
                    "Google Vision is not configured (set GOOGLE_VISION_API_KEY or GOOGLE_VISION_ACCESS_TOKEN), skipping"
                ),
            },
            BackendId::Tesseract => {
                let backend = TesseractBackend::new(&config.tesseract_cmd);
                match backend.check_installed().await {
                    Ok(()) => backends.push(Arc::new(backend)),
                    Err(err) => warn!("tesseract is not available, skipping: {:#}", err),
                }
            }
            BackendId::OpenaiVision => match &llm_driver {
                Some(driver) => backends.push(Arc::new(LlmVisionBackend::new(
                    driver.clone(),
                    config.ocr_model.clone(),
                    config.max_completion_tokens,
                    config.request_timeout,
                )?)),
                None => warn!("OpenAI is not configured (set OPENAI_API_KEY), skipping openai_vision"),
            },
        }
    }
    if backends.is_empty() {
        return Err(anyhow!(
            "no usable OCR backend: tried {}",
            config
                .backend_order
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    info!(
        "Using OCR backends: {}",
        backends
            .iter()
            .map(|b| b.id().as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(backends)
}

/// Build our LLM driver, if we have credentials for one.
pub fn llm_driver_for_config(config: &DigitizeConfig) -> Option<Arc<dyn Driver>> {
    config.credentials.openai.as_ref().map(|credentials| {
        Arc::new(OpenAiDriver::new(credentials, config.llm_rate_limit.as_ref()))
            as Arc<dyn Driver>
    })
}
