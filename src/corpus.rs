//! Collecting entries into a corpus and writing it out.

use std::{fmt::Write as _, sync::Mutex};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;

use crate::{
    async_utils::io::{write_json_atomic, write_text_atomic},
    drivers::TokenUsage,
    entry::{LogbookEntry, ProcessingMethod},
    images::PageImage,
    prelude::*,
};

/// The final corpus file.
pub const CORPUS_FILE: &str = "complete_logbook.json";

/// Checkpoints written during a run.
pub const CHECKPOINT_FILE: &str = "complete_logbook.partial.json";

/// A human-readable report.
pub const SUMMARY_FILE: &str = "processing_summary.txt";

/// Confidence at or above this is "high".
const HIGH_CONFIDENCE: f64 = 0.9;

/// Confidence below this is "low".
const LOW_CONFIDENCE: f64 = 0.7;

/// Every page of a logbook, in page order.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct LogbookCorpus {
    pub metadata: CorpusMetadata,
    pub entries: Vec<LogbookEntry>,
}

/// Aggregate information about a corpus.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct CorpusMetadata {
    /// Number of entries.
    pub total_entries: usize,

    /// When the corpus was written.
    pub processing_date: DateTime<Utc>,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// Wall-clock time from the start of the run to `processing_date`.
    pub processing_seconds: f64,

    /// A description of the collection.
    pub source: String,

    /// How many entries each method produced.
    pub processing_stats: ProcessingStats,

    /// Fraction of entries that some backend could read.
    pub success_rate: f64,

    /// Mean confidence over all entries, including failures.
    pub average_confidence: f64,

    /// How confidence is spread across entries.
    pub confidence_distribution: ConfidenceDistribution,

    /// LLM tokens used for OCR and enhancement.
    pub token_usage: TokenUsage,

    /// Was the run interrupted before every page was processed?
    pub cancelled: bool,
}

/// Entry counts per processing method. Every method is always present.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub google_vision: usize,
    pub tesseract: usize,
    pub openai_vision: usize,
    pub failed: usize,
}

impl ProcessingStats {
    /// The count for `method`.
    pub fn get(&self, method: ProcessingMethod) -> usize {
        match method {
            ProcessingMethod::GoogleVision => self.google_vision,
            ProcessingMethod::Tesseract => self.tesseract,
            ProcessingMethod::OpenaiVision => self.openai_vision,
            ProcessingMethod::Failed => self.failed,
        }
    }

    fn increment(&mut self, method: ProcessingMethod) {
        let count = match method {
            ProcessingMethod::GoogleVision => &mut self.google_vision,
            ProcessingMethod::Tesseract => &mut self.tesseract,
            ProcessingMethod::OpenaiVision => &mut self.openai_vision,
            ProcessingMethod::Failed => &mut self.failed,
        };
        *count += 1;
    }
}

/// Confidence statistics. `min` and `max` are 0 for an empty corpus.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ConfidenceDistribution {
    pub min: f64,
    pub max: f64,
    /// Entries with confidence of at least 0.9.
    pub high: usize,
    /// Entries with confidence from 0.7 up to 0.9.
    pub medium: usize,
    /// Entries with confidence below 0.7.
    pub low: usize,
}

impl CorpusMetadata {
    /// Compute metadata for `entries`, for a run that started at `started_at`
    /// and is being written at `processing_date`.
    pub fn compute(
        entries: &[LogbookEntry],
        source: &str,
        token_usage: TokenUsage,
        cancelled: bool,
        started_at: DateTime<Utc>,
        processing_date: DateTime<Utc>,
    ) -> Self {
        let mut processing_stats = ProcessingStats::default();
        let mut distribution = ConfidenceDistribution::default();
        let mut confidence_sum = 0.0;
        for (i, entry) in entries.iter().enumerate() {
            processing_stats.increment(entry.processing_method);
            let confidence = entry.confidence_score;
            confidence_sum += confidence;
            if i == 0 {
                distribution.min = confidence;
                distribution.max = confidence;
            } else {
                distribution.min = distribution.min.min(confidence);
                distribution.max = distribution.max.max(confidence);
            }
            if confidence >= HIGH_CONFIDENCE {
                distribution.high += 1;
            } else if confidence >= LOW_CONFIDENCE {
                distribution.medium += 1;
            } else {
                distribution.low += 1;
            }
        }

        let total = entries.len();
        let (success_rate, average_confidence) = if total == 0 {
            (0.0, 0.0)
        } else {
            let succeeded = total - processing_stats.failed;
            (
                succeeded as f64 / total as f64,
                confidence_sum / total as f64,
            )
        };
        let elapsed = (processing_date - started_at).to_std().unwrap_or_default();
        Self {
            total_entries: total,
            processing_date,
            started_at,
            processing_seconds: elapsed.as_secs_f64(),
            source: source.to_owned(),
            processing_stats,
            success_rate,
            average_confidence,
            confidence_distribution: distribution,
            token_usage,
            cancelled,
        }
    }
}

/// Collects entries as pages finish, in any order.
#[derive(Debug)]
pub struct CorpusBuilder {
    started_at: DateTime<Utc>,
    state: Mutex<BuilderState>,
}

impl Default for CorpusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct BuilderState {
    /// Entries, tagged with their page index.
    entries: Vec<(usize, LogbookEntry)>,
    token_usage: TokenUsage,
}

impl CorpusBuilder {
    /// Create an empty builder. The run's start time is now.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            state: Mutex::default(),
        }
    }

    /// Add the entry for page `index`.
    pub fn push(&self, index: usize, entry: LogbookEntry, token_usage: TokenUsage) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.entries.push((index, entry));
        state.token_usage += token_usage;
    }

    /// How many entries do we have?
    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").entries.len()
    }

    /// Build a corpus from the entries collected so far, in page order.
    pub fn snapshot(&self, source: &str, cancelled: bool) -> LogbookCorpus {
        let (mut indexed, token_usage) = {
            let state = self.state.lock().expect("lock poisoned");
            (state.entries.clone(), state.token_usage.clone())
        };
        indexed.sort_by_key(|(index, _)| *index);
        let entries = indexed
            .into_iter()
            .map(|(_, entry)| entry)
            .collect::<Vec<_>>();
        let metadata = CorpusMetadata::compute(
            &entries,
            source,
            token_usage,
            cancelled,
            self.started_at,
            Utc::now(),
        );
        LogbookCorpus { metadata, entries }
    }
}

/// Writes corpus files into our output directory.
#[derive(Clone, Debug)]
pub struct CorpusWriter {
    output_dir: PathBuf,
    page_files: bool,
}

impl CorpusWriter {
    /// Create a writer, creating `output_dir` if needed.
    pub async fn create(output_dir: &Path, page_files: bool) -> Result<Self> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("could not create output directory {:?}", output_dir))?;
        Ok(Self {
            output_dir: output_dir.to_owned(),
            page_files,
        })
    }

    /// Path of a file in our output directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    /// Write `<stem>.json` and `<stem>.txt` for one page.
    pub async fn write_page(&self, page: &PageImage, entry: &LogbookEntry) -> Result<()> {
        if !self.page_files {
            return Ok(());
        }
        let stem = page.stem();
        write_json_atomic(&self.path(&format!("{stem}.json")), entry).await?;
        write_text_atomic(&self.path(&format!("{stem}.txt")), &entry.content).await
    }

    /// Write a checkpoint of the corpus so far.
    pub async fn write_checkpoint(&self, corpus: &LogbookCorpus) -> Result<()> {
        write_json_atomic(&self.path(CHECKPOINT_FILE), corpus).await
    }

    /// Write the final corpus and summary, and remove any checkpoint.
    pub async fn write_final(&self, corpus: &LogbookCorpus) -> Result<()> {
        write_json_atomic(&self.path(CORPUS_FILE), corpus).await?;
        write_text_atomic(&self.path(SUMMARY_FILE), &summary_text(corpus)).await?;
        match tokio::fs::remove_file(self.path(CHECKPOINT_FILE)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("could not remove checkpoint file"),
        }
    }
}

/// Build our human-readable report.
pub fn summary_text(corpus: &LogbookCorpus) -> String {
    let mut out = String::new();
    write_summary(&mut out, corpus).expect("writing to a String should never fail");
    out
}

fn write_summary(out: &mut String, corpus: &LogbookCorpus) -> std::fmt::Result {
    let meta = &corpus.metadata;
    let dist = &meta.confidence_distribution;
    writeln!(out, "Logbook digitization summary")?;
    writeln!(out, "============================")?;
    writeln!(out)?;
    if !meta.source.is_empty() {
        writeln!(out, "Source: {}", meta.source)?;
    }
    writeln!(out, "Started: {}", meta.started_at.to_rfc3339())?;
    writeln!(out, "Finished: {}", meta.processing_date.to_rfc3339())?;
    writeln!(out, "Processing time: {:.1}s", meta.processing_seconds)?;
    if meta.cancelled {
        writeln!(out, "Run was cancelled before all pages were processed.")?;
    }
    writeln!(out, "Total pages: {}", meta.total_entries)?;
    writeln!(out, "Success rate: {:.1}%", meta.success_rate * 100.0)?;
    writeln!(out, "Average confidence: {:.3}", meta.average_confidence)?;

    writeln!(out)?;
    writeln!(out, "Pages by method:")?;
    for method in ProcessingMethod::ALL {
        writeln!(
            out,
            "  {:<14} {}",
            method.as_str(),
            meta.processing_stats.get(method)
        )?;
    }

    writeln!(out)?;
    writeln!(out, "Confidence distribution:")?;
    writeln!(out, "  min {:.3}, max {:.3}", dist.min, dist.max)?;
    writeln!(out, "  high (>= 0.9):      {}", dist.high)?;
    writeln!(out, "  medium (0.7-0.9):   {}", dist.medium)?;
    writeln!(out, "  low (< 0.7):        {}", dist.low)?;

    if !meta.token_usage.is_zero() {
        writeln!(out)?;
        writeln!(
            out,
            "LLM tokens: {} prompt, {} completion",
            meta.token_usage.prompt_tokens, meta.token_usage.completion_tokens
        )?;
    }

    let mut failed = corpus
        .entries
        .iter()
        .filter(|e| e.processing_method == ProcessingMethod::Failed)
        .peekable();
    if failed.peek().is_some() {
        writeln!(out)?;
        writeln!(out, "Failed pages:")?;
        for entry in failed {
            let error = entry
                .ocr_attempts
                .last()
                .and_then(|attempt| attempt.error.as_deref())
                .unwrap_or("no OCR backend was tried");
            writeln!(out, "  {}: {}", entry.filename, error)?;
        }
    }
    Ok(())
}
