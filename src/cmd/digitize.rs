//! The `digitize` subcommand.

use std::time::Duration;

use clap::Args;

use crate::{
    async_utils::cancel::Cancellation,
    backends::BackendId,
    config::{Credentials, DEFAULT_MODEL, DigitizeConfig},
    corpus::{CORPUS_FILE, summary_text},
    images::list_page_images,
    pipeline::Pipeline,
    prelude::*,
    rate_limit::RateLimit,
    ui::Ui,
};

/// Options for the `digitize` subcommand.
#[derive(Debug, Args)]
pub struct DigitizeOpts {
    /// A directory of page images (PNG, JPEG, TIFF, ...).
    pub input_dir: PathBuf,

    /// Where to write the corpus, the summary and per-page files.
    #[clap(short = 'o', long = "output-dir", default_value = "digitized_output")]
    pub output_dir: PathBuf,

    /// Only process the first N images, in name order.
    #[clap(long)]
    pub max_files: Option<usize>,

    /// Accept an OCR result once its confidence is strictly above this.
    #[clap(
        long,
        env = "LOGBOOK_CONFIDENCE_THRESHOLD",
        default_value = "0.8"
    )]
    pub confidence_threshold: f64,

    /// Max number of pages to process at a time.
    #[clap(short = 'j', long = "jobs", env = "LOGBOOK_JOBS", default_value = "3")]
    pub job_count: usize,

    /// OCR backends to try, in order.
    #[clap(
        long,
        value_enum,
        value_delimiter = ',',
        default_value = "google_vision,tesseract,openai_vision"
    )]
    pub backends: Vec<BackendId>,

    /// A TOML file with API credentials. Values here override the
    /// environment.
    #[clap(long, env = "LOGBOOK_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// A short description of the collection, used in prompts and metadata.
    #[clap(long, default_value = "a historical logbook")]
    pub source: String,

    /// Keep the raw OCR text instead of asking an LLM to clean it up.
    #[clap(long)]
    pub skip_enhancement: bool,

    /// Don't look for dates in the text when the LLM doesn't report one.
    #[clap(long)]
    pub no_date_fallback: bool,

    /// Don't write a `.json` and `.txt` file for each page.
    #[clap(long)]
    pub no_page_files: bool,

    /// Write a partial corpus every N pages. 0 disables checkpoints.
    #[clap(long, default_value = "10")]
    pub checkpoint_every: usize,

    /// The model to use for OCR with the `openai_vision` backend.
    #[clap(long, default_value = DEFAULT_MODEL)]
    pub ocr_model: String,

    /// The model to use for enhancement.
    #[clap(long, default_value = DEFAULT_MODEL)]
    pub enhance_model: String,

    /// Timeout, in seconds, for each OCR or LLM request.
    #[clap(long = "timeout", default_value = "120")]
    pub timeout_secs: u64,

    /// Maximum number of tokens for each LLM completion.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// Sampling temperature for enhancement.
    #[clap(long, default_value = "0.3")]
    pub temperature: f32,

    /// Rate limit for Google Vision requests, e.g. "10/s" or "600/m".
    #[clap(long, default_value = "10/s")]
    pub vision_rate_limit: RateLimit,

    /// Rate limit for LLM requests, e.g. "120/m".
    #[clap(long, default_value = "120/m")]
    pub llm_rate_limit: RateLimit,

    /// The Tesseract executable.
    #[clap(long, env = "TESSERACT_CMD", default_value = "tesseract")]
    pub tesseract_cmd: String,
}

impl DigitizeOpts {
    /// Build our configuration. This reads the credentials file, if any.
    async fn to_config(&self) -> Result<DigitizeConfig> {
        let credentials = Credentials::load(self.credentials.as_deref()).await?;
        Ok(DigitizeConfig {
            input_dir: self.input_dir.clone(),
            output_dir: self.output_dir.clone(),
            max_files: self.max_files,
            confidence_threshold: self.confidence_threshold,
            jobs: self.job_count,
            backend_order: self.backends.clone(),
            source: self.source.clone(),
            enhance: !self.skip_enhancement,
            date_fallback: !self.no_date_fallback,
            page_files: !self.no_page_files,
            checkpoint_every: self.checkpoint_every,
            ocr_model: self.ocr_model.clone(),
            enhance_model: self.enhance_model.clone(),
            max_completion_tokens: self.max_completion_tokens,
            temperature: Some(self.temperature),
            request_timeout: Duration::from_secs(self.timeout_secs),
            vision_rate_limit: Some(self.vision_rate_limit.clone()),
            llm_rate_limit: Some(self.llm_rate_limit.clone()),
            tesseract_cmd: self.tesseract_cmd.clone(),
            credentials,
        })
    }
}

/// The `digitize` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_digitize(ui: Ui, opts: &DigitizeOpts) -> Result<()> {
    let config = opts.to_config().await?;
    config.validate()?;

    let pages = list_page_images(&config.input_dir, config.max_files).await?;
    if pages.is_empty() {
        warn!("No images found in {}", config.input_dir.display());
    } else {
        info!(
            "Found {} pages in {}",
            pages.len(),
            config.input_dir.display()
        );
    }

    let pipeline = Pipeline::from_config(&config).await?;
    let cancel = Cancellation::new();
    let ctrl_c = cancel.cancel_on_ctrl_c();
    let result = pipeline.run(&ui, &pages, &cancel).await;
    ctrl_c.abort();
    let corpus = result?;
    if cancel.is_cancelled() {
        ui.display_message(
            "🛑",
            &format!(
                "Interrupted: {} of {} pages were processed",
                corpus.entries.len(),
                pages.len()
            ),
        );
    }

    ui.display_message("📊", &summary_text(&corpus));
    ui.display_message(
        "💾",
        &format!(
            "Wrote {}",
            config.output_dir.join(CORPUS_FILE).display()
        ),
    );
    Ok(())
}
