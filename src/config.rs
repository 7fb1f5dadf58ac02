//! Run configuration and API credentials.
//!
//! A [`DigitizeConfig`] is built once from the command line and passed into
//! every constructor that needs it. Nothing in the pipeline reads environment
//! variables directly, except credential loading here.

use std::{env, time::Duration};

use crate::{
    async_utils::io::read_text, backends::BackendId, prelude::*, rate_limit::RateLimit,
    toml_utils::from_toml_str,
};

/// The default model for both vision OCR and enhancement.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Everything we need to know to digitize a directory of pages.
#[derive(Clone, Debug)]
pub struct DigitizeConfig {
    /// Directory containing page images.
    pub input_dir: PathBuf,

    /// Directory where we write our output.
    pub output_dir: PathBuf,

    /// Only process the first N images (by file name).
    pub max_files: Option<usize>,

    /// Stop trying backends once one reports a confidence above this.
    pub confidence_threshold: f64,

    /// How many pages to process at once.
    pub jobs: usize,

    /// Backends to try, highest priority first.
    pub backend_order: Vec<BackendId>,

    /// A description of the collection, passed to the LLM as context.
    pub source: String,

    /// Should we clean up OCR text with an LLM?
    pub enhance: bool,

    /// Should we look for dates with regexes when the LLM finds none?
    pub date_fallback: bool,

    /// Should we write `<stem>.json` and `<stem>.txt` for each page?
    pub page_files: bool,

    /// Write a partial corpus every N pages. 0 disables checkpoints.
    pub checkpoint_every: usize,

    /// Vision-language model used for OCR.
    pub ocr_model: String,

    /// Model used for enhancement.
    pub enhance_model: String,

    /// Upper bound on generated tokens per LLM call.
    pub max_completion_tokens: Option<u32>,

    /// Sampling temperature for enhancement.
    pub temperature: Option<f32>,

    /// Timeout for each backend or LLM call.
    pub request_timeout: Duration,

    /// Rate limit for cloud vision requests.
    pub vision_rate_limit: Option<RateLimit>,

    /// Rate limit for LLM requests.
    pub llm_rate_limit: Option<RateLimit>,

    /// The `tesseract` command to run.
    pub tesseract_cmd: String,

    /// API credentials.
    pub credentials: Credentials,
}

impl DigitizeConfig {
    /// Check for configuration errors that should stop us before we start.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence threshold must be between 0.0 and 1.0, got {}",
                self.confidence_threshold
            ));
        }
        if self.jobs == 0 {
            return Err(anyhow!("--jobs must be at least 1"));
        }
        if self.backend_order.is_empty() {
            return Err(anyhow!("no OCR backends were requested"));
        }
        if !self.input_dir.is_dir() {
            return Err(anyhow!(
                "input directory {:?} does not exist or is not a directory",
                self.input_dir
            ));
        }
        Ok(())
    }

    /// Should we enhance pages? This is false if the user disabled it or if we
    /// have no LLM credentials.
    pub fn enhancement_enabled(&self) -> bool {
        self.enhance && self.credentials.openai.is_some()
    }
}

/// Credentials for the services we call. Missing credentials disable the
/// corresponding backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Credentials {
    /// OpenAI (or a compatible gateway).
    pub openai: Option<OpenAiCredentials>,

    /// Google Cloud Vision.
    pub google_vision: Option<GoogleVisionCredentials>,
}

/// OpenAI credentials.
#[derive(Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OpenAiCredentials {
    pub api_key: String,
    /// Override the server URL.
    #[serde(default)]
    pub api_base: Option<String>,
}

/// Google Cloud Vision credentials. We accept either an API key or an OAuth
/// access token (as printed by `gcloud auth print-access-token`).
#[derive(Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GoogleVisionCredentials {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Redact secrets, so that they never end up in our logs.
fn redacted(value: &Option<String>) -> &'static str {
    if value.is_some() { "Some(<redacted>)" } else { "None" }
}

impl std::fmt::Debug for OpenAiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCredentials")
            .field("api_key", &"<redacted>")
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl std::fmt::Debug for GoogleVisionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleVisionCredentials")
            .field("api_key", &redacted(&self.api_key))
            .field("access_token", &redacted(&self.access_token))
            .finish()
    }
}

/// The credentials file format. Every key is optional, so that a file can
/// override just one value from the environment.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CredentialsFile {
    #[serde(default)]
    openai: Option<PartialOpenAi>,
    #[serde(default)]
    google_vision: Option<GoogleVisionCredentials>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialOpenAi {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_base: Option<String>,
}

impl Credentials {
    /// Load credentials from the environment, then apply overrides from the
    /// TOML file at `path`, if any. A bad credentials file is an error.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let toml_str = match path {
            Some(path) => Some(read_text(path).await?),
            None => None,
        };
        let description = path
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self::from_sources(|name| env::var(name).ok(), toml_str.as_deref(), &description)
    }

    /// Build credentials from an environment lookup function and an optional
    /// TOML document.
    fn from_sources(
        env_var: impl Fn(&str) -> Option<String>,
        toml_str: Option<&str>,
        description: &str,
    ) -> Result<Self> {
        let lookup = |name: &str| env_var(name).filter(|v| !v.trim().is_empty());
        let file = match toml_str {
            Some(toml_str) => from_toml_str::<CredentialsFile>(description, toml_str)?,
            None => CredentialsFile::default(),
        };

        let file_openai = file.openai.unwrap_or_default();
        let openai_key = file_openai.api_key.or_else(|| lookup("OPENAI_API_KEY"));
        let openai_base = file_openai.api_base.or_else(|| lookup("OPENAI_API_BASE"));
        let openai = openai_key.map(|api_key| OpenAiCredentials {
            api_key,
            api_base: openai_base,
        });

        let file_google = file.google_vision.unwrap_or_default();
        let google_key = file_google
            .api_key
            .or_else(|| lookup("GOOGLE_VISION_API_KEY"));
        let google_token = file_google
            .access_token
            .or_else(|| lookup("GOOGLE_VISION_ACCESS_TOKEN"));
        let google_vision = if google_key.is_some() || google_token.is_some() {
            Some(GoogleVisionCredentials {
                api_key: google_key,
                access_token: google_token,
            })
        } else {
            None
        };

        Ok(Self {
            openai,
            google_vision,
        })
    }
}
