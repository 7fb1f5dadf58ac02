//! Running the whole digitization pipeline over a directory of pages.
//!
//! Pages are processed concurrently, up to `jobs` at a time. Each page goes
//! through the [`FallbackSelector`], then the [`ContentEnhancer`], and the
//! resulting entry is handed to a single consumer loop that owns all output.
//! Pages finish out of order, so the corpus is sorted by page when written.

use std::{pin::pin, sync::Mutex};

use chrono::Utc;
use futures::{StreamExt as _, stream};

use crate::{
    async_utils::cancel::Cancellation,
    backends::{backends_for_config, llm_driver_for_config},
    config::DigitizeConfig,
    corpus::{CorpusBuilder, CorpusWriter, LogbookCorpus},
    drivers::TokenUsage,
    enhancer::{ContentEnhancer, Enhancement, EnhancementContext},
    entry::{LogbookEntry, assemble_entry, page_number_from_filename},
    images::PageImage,
    prelude::*,
    selector::FallbackSelector,
    ui::Ui,
};

/// Where a run is. There is no failed state: page failures are recorded as
/// entries, and anything worse is an error from [`Pipeline::run`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunState {
    Idle,
    Processing,
    Finalizing,
    Done,
}

/// Settings that control the run loop itself.
#[derive(Clone, Debug)]
pub struct RunSettings {
    /// Collection description, copied into the corpus metadata.
    pub source: String,
    /// Pages in flight at once.
    pub jobs: usize,
    /// Write a checkpoint every N pages. 0 disables checkpoints.
    pub checkpoint_every: usize,
}

/// The digitization pipeline.
pub struct Pipeline {
    selector: FallbackSelector,
    enhancer: ContentEnhancer,
    writer: CorpusWriter,
    settings: RunSettings,
    state: Mutex<RunState>,
}

impl Pipeline {
    /// Assemble a pipeline from its parts.
    pub fn new(
        selector: FallbackSelector,
        enhancer: ContentEnhancer,
        writer: CorpusWriter,
        settings: RunSettings,
    ) -> Self {
        Self {
            selector,
            enhancer,
            writer,
            settings,
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Build a pipeline from our configuration.
    ///
    /// Fails if no OCR backend is usable. Nothing is written until this
    /// succeeds, except the output directory itself.
    pub async fn from_config(config: &DigitizeConfig) -> Result<Self> {
        let llm_driver = llm_driver_for_config(config);
        let backends = backends_for_config(config, llm_driver.clone()).await?;

        let enhancer_driver = if !config.enhance {
            info!("Enhancement disabled, keeping raw OCR text");
            None
        } else if !config.enhancement_enabled() {
            warn!("No OpenAI credentials (set OPENAI_API_KEY), skipping enhancement");
            None
        } else {
            llm_driver
        };
        let enhancer = ContentEnhancer::new(enhancer_driver, config)?;
        let selector = FallbackSelector::new(
            backends,
            config.confidence_threshold,
            config.request_timeout,
        );
        let writer = CorpusWriter::create(&config.output_dir, config.page_files).await?;
        Ok(Self::new(
            selector,
            enhancer,
            writer,
            RunSettings {
                source: config.source.clone(),
                jobs: config.jobs,
                checkpoint_every: config.checkpoint_every,
            },
        ))
    }

    /// Where is this pipeline in its run?
    pub fn state(&self) -> RunState {
        *self.state.lock().expect("lock poisoned")
    }

    fn set_state(&self, state: RunState) {
        debug!(?state, "Run state");
        *self.state.lock().expect("lock poisoned") = state;
    }

    /// Process `pages` and write the corpus.
    ///
    /// Once `cancel` fires, no new pages are started. Pages already in flight
    /// are finished and recorded, and the corpus is marked as cancelled.
    #[instrument(level = "debug", skip_all, fields(pages = pages.len()))]
    pub async fn run(
        &self,
        ui: &Ui,
        pages: &[PageImage],
        cancel: &Cancellation,
    ) -> Result<LogbookCorpus> {
        self.set_state(RunState::Processing);
        let progress = ui.new_page_progress(pages.len() as u64);

        let builder = CorpusBuilder::new();
        let mut results = pin!(
            stream::iter(pages)
                .take_until(cancel.cancelled())
                .map(|page| async move {
                    let (entry, token_usage) = self.process_page(page).await;
                    (page, entry, token_usage)
                })
                .buffer_unordered(self.settings.jobs.max(1))
        );
        while let Some((page, entry, token_usage)) = results.next().await {
            if let Err(err) = self.writer.write_page(page, &entry).await {
                warn!("Could not write output for {}: {:?}", page.filename, err);
            }
            progress.record(entry.processing_method);
            builder.push(page.index, entry, token_usage);

            let done = builder.len();
            if self.settings.checkpoint_every > 0
                && done % self.settings.checkpoint_every == 0
                && done < pages.len()
            {
                let checkpoint = builder.snapshot(&self.settings.source, false);
                match self.writer.write_checkpoint(&checkpoint).await {
                    Ok(()) => info!("Checkpoint: {}/{} pages", done, pages.len()),
                    Err(err) => warn!("Could not write checkpoint: {:?}", err),
                }
            }
        }
        drop(progress);

        self.set_state(RunState::Finalizing);
        let cancelled = builder.len() < pages.len();
        if cancelled {
            warn!(
                "Run cancelled after {} of {} pages",
                builder.len(),
                pages.len()
            );
        }
        let corpus = builder.snapshot(&self.settings.source, cancelled);
        self.writer
            .write_final(&corpus)
            .await
            .context("could not write corpus")?;
        self.set_state(RunState::Done);
        Ok(corpus)
    }

    /// Turn one page into an entry. This never fails.
    #[instrument(level = "debug", skip_all, fields(page = %page.filename))]
    async fn process_page(&self, page: &PageImage) -> (LogbookEntry, TokenUsage) {
        let selection = self.selector.select(page).await;
        let mut token_usage = selection.token_usage();

        // There's nothing to enhance if no backend could read the page.
        let enhancement = if selection.backend.is_some() {
            let context = EnhancementContext {
                source: &self.settings.source,
                filename: &page.filename,
                page_number: page_number_from_filename(&page.filename),
            };
            self.enhancer.enhance(&selection.text, &context).await
        } else {
            Enhancement::skipped("")
        };
        if let Some(usage) = &enhancement.token_usage {
            token_usage += usage.clone();
        }

        let entry = assemble_entry(page, &selection, enhancement, Utc::now());
        info!(
            method = %entry.processing_method,
            confidence = entry.confidence_score,
            "Processed {}",
            page.filename
        );
        (entry, token_usage)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use crate::{
        backends::{BackendId, OcrBackend, testing::StubBackend},
        config::testing::config,
        corpus::{CHECKPOINT_FILE, CORPUS_FILE, SUMMARY_FILE},
        drivers::{
            Driver,
            testing::{Script, ScriptedDriver},
        },
        entry::ProcessingMethod,
        enhancer::EnhancementStatus,
        images::list_page_images,
    };

    use super::*;

    const NAMES: [&str; 5] = ["p1.png", "p2.png", "p3.png", "p4.png", "p5.png"];

    /// Backend A reads pages 1-3 well and fails on 4-5. Backend B reads 4-5
    /// badly.
    fn stub_backends() -> (Arc<StubBackend>, Arc<StubBackend>) {
        let a = StubBackend::new(
            BackendId::GoogleVision,
            &[("p1.png", 0.95), ("p2.png", 0.95), ("p3.png", 0.95)],
        );
        let b = StubBackend::new(BackendId::Tesseract, &[("p4.png", 0.5), ("p5.png", 0.5)]);
        (Arc::new(a), Arc::new(b))
    }

    fn backends(stubs: &[&Arc<StubBackend>]) -> Vec<Arc<dyn OcrBackend>> {
        stubs
            .iter()
            .map(|&stub| stub.clone() as Arc<dyn OcrBackend>)
            .collect()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        input: PathBuf,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("png");
        let output = dir.path().join("out");
        std::fs::create_dir(&input).unwrap();
        // Written out of order, to make sure we sort.
        for name in NAMES.iter().rev() {
            std::fs::write(input.join(name), b"page").unwrap();
        }
        Fixture {
            _dir: dir,
            input,
            output,
        }
    }

    async fn pipeline(
        fixture: &Fixture,
        backends: Vec<Arc<dyn OcrBackend>>,
        driver: Option<Arc<dyn Driver>>,
    ) -> Pipeline {
        let config = config(&fixture.input, &fixture.output);
        Pipeline::new(
            FallbackSelector::new(backends, 0.8, Duration::from_secs(5)),
            ContentEnhancer::new(driver, &config).unwrap(),
            CorpusWriter::create(&fixture.output, true).await.unwrap(),
            RunSettings {
                source: config.source.clone(),
                jobs: 3,
                checkpoint_every: 2,
            },
        )
    }

    async fn run(pipeline: &Pipeline, fixture: &Fixture, max_files: Option<usize>) -> LogbookCorpus {
        let pages = list_page_images(&fixture.input, max_files).await.unwrap();
        pipeline
            .run(&Ui::init_for_tests(), &pages, &Cancellation::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn five_page_scenario() {
        let fixture = fixture();
        let (a, b) = stub_backends();
        let pipeline = pipeline(&fixture, backends(&[&a, &b]), None).await;
        assert_eq!(pipeline.state(), RunState::Idle);
        let corpus = run(&pipeline, &fixture, None).await;
        assert_eq!(pipeline.state(), RunState::Done);

        let meta = &corpus.metadata;
        assert_eq!(meta.total_entries, 5);
        assert_eq!(meta.success_rate, 1.0);
        assert!((meta.average_confidence - 0.77).abs() < 1e-9);
        assert_eq!(meta.processing_stats.google_vision, 3);
        assert_eq!(meta.processing_stats.tesseract, 2);
        assert_eq!(meta.processing_stats.failed, 0);
        assert!(!meta.cancelled);

        // B is only called for the pages A couldn't read.
        assert_eq!(a.call_count(), 5);
        assert_eq!(b.call_count(), 2);

        let names = corpus
            .entries
            .iter()
            .map(|e| e.filename.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, NAMES);
        assert_eq!(corpus.entries[3].processing_method, ProcessingMethod::Tesseract);
        assert_eq!(corpus.entries[3].ocr_attempts.len(), 2);

        // Output files.
        assert!(fixture.output.join(CORPUS_FILE).exists());
        assert!(fixture.output.join(SUMMARY_FILE).exists());
        assert!(fixture.output.join("p3.json").exists());
        assert!(fixture.output.join("p3.txt").exists());
        assert!(!fixture.output.join(CHECKPOINT_FILE).exists());
    }

    #[tokio::test]
    async fn max_files_limits_entries() {
        let fixture = fixture();
        let (a, b) = stub_backends();
        let pipeline = pipeline(&fixture, backends(&[&a, &b]), None).await;
        let corpus = run(&pipeline, &fixture, Some(2)).await;
        let names = corpus
            .entries
            .iter()
            .map(|e| e.filename.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["p1.png", "p2.png"]);
        assert!(!corpus.metadata.cancelled);
    }

    #[tokio::test]
    async fn failing_backends_still_produce_entries() {
        let fixture = fixture();
        let a = Arc::new(StubBackend::new(BackendId::GoogleVision, &[]));
        let b = Arc::new(StubBackend::new(BackendId::Tesseract, &[]));
        let driver = Arc::new(ScriptedDriver::new(Script::Respond(json!({
            "enhanced_text": "never used",
        }))));
        let pipeline = pipeline(
            &fixture,
            backends(&[&a, &b]),
            Some(driver.clone() as Arc<dyn Driver>),
        )
        .await;
        let corpus = run(&pipeline, &fixture, None).await;

        assert_eq!(corpus.entries.len(), 5);
        assert_eq!(corpus.metadata.success_rate, 0.0);
        assert_eq!(corpus.metadata.average_confidence, 0.0);
        assert_eq!(corpus.metadata.processing_stats.failed, 5);
        for entry in &corpus.entries {
            assert_eq!(entry.processing_method, ProcessingMethod::Failed);
            assert_eq!(entry.confidence_score, 0.0);
            assert!(entry.content.is_empty());
        }
        // Failed pages aren't enhanced.
        assert_eq!(driver.call_count(), 0);
    }

    #[tokio::test]
    async fn successful_pages_are_enhanced() {
        let fixture = fixture();
        let (a, b) = stub_backends();
        let driver = Arc::new(ScriptedDriver::new(Script::Respond(json!({
            "enhanced_text": "Clean text",
            "location": "Cairo",
        }))));
        let pipeline = pipeline(
            &fixture,
            backends(&[&a, &b]),
            Some(driver.clone() as Arc<dyn Driver>),
        )
        .await;
        let corpus = run(&pipeline, &fixture, None).await;

        assert_eq!(driver.call_count(), 5);
        for entry in &corpus.entries {
            assert_eq!(entry.enhancement_status, EnhancementStatus::Enhanced);
            assert_eq!(entry.content, "Clean text");
            assert_eq!(entry.location.as_deref(), Some("Cairo"));
            assert!(entry.raw_ocr_text.contains(&entry.filename));
        }
        assert_eq!(corpus.metadata.token_usage.prompt_tokens, 50);
    }

    #[tokio::test]
    async fn invariants_hold_for_every_entry() {
        let fixture = fixture();
        let a = Arc::new(StubBackend::new(
            BackendId::GoogleVision,
            &[("p1.png", 1.5), ("p2.png", f64::NAN), ("p3.png", -0.3)],
        ));
        let pipeline = pipeline(&fixture, backends(&[&a]), None).await;
        let corpus = run(&pipeline, &fixture, None).await;

        assert_eq!(corpus.entries.len(), NAMES.len());
        for entry in &corpus.entries {
            assert!((0.0..=1.0).contains(&entry.confidence_score));
            assert!(ProcessingMethod::ALL.contains(&entry.processing_method));
        }
        let stats = &corpus.metadata.processing_stats;
        assert_eq!(
            stats.google_vision + stats.tesseract + stats.openai_vision + stats.failed,
            corpus.metadata.total_entries
        );
    }

    #[tokio::test]
    async fn reruns_are_identical_except_for_timestamps() {
        let mut corpora = vec![];
        for _ in 0..2 {
            let fixture = fixture();
            let (a, b) = stub_backends();
            let pipeline = pipeline(&fixture, backends(&[&a, &b]), None).await;
            let mut corpus = run(&pipeline, &fixture, None).await;
            let epoch = chrono::DateTime::<Utc>::UNIX_EPOCH;
            corpus.metadata.processing_date = epoch;
            corpus.metadata.started_at = epoch;
            corpus.metadata.processing_seconds = 0.0;
            for entry in &mut corpus.entries {
                entry.timestamp = epoch;
            }
            corpora.push(corpus);
        }
        assert_eq!(corpora[0], corpora[1]);
    }

    #[tokio::test]
    async fn cancelled_runs_still_write_a_corpus() {
        let fixture = fixture();
        let (a, b) = stub_backends();
        let pipeline = pipeline(&fixture, backends(&[&a, &b]), None).await;
        let pages = list_page_images(&fixture.input, None).await.unwrap();
        let cancel = Cancellation::new();
        cancel.cancel();
        let corpus = pipeline
            .run(&Ui::init_for_tests(), &pages, &cancel)
            .await
            .unwrap();
        assert!(corpus.metadata.cancelled);
        assert!(corpus.entries.is_empty());
        assert_eq!(a.call_count(), 0);
        assert!(fixture.output.join(CORPUS_FILE).exists());
    }

    #[tokio::test]
    async fn cancelling_mid_run_finishes_pages_in_flight() {
        let fixture = fixture();
        let scores = NAMES.map(|name| (name, 0.95));
        let slow = Arc::new(
            StubBackend::new(BackendId::GoogleVision, &scores)
                .with_delay(Duration::from_millis(300)),
        );
        let mut pipeline = pipeline(&fixture, backends(&[&slow]), None).await;
        pipeline.settings.jobs = 2;
        let pages = list_page_images(&fixture.input, None).await.unwrap();

        let cancel = Cancellation::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let corpus = pipeline
            .run(&Ui::init_for_tests(), &pages, &cancel)
            .await
            .unwrap();

        // The two pages that had started were finished and recorded.
        assert!(corpus.metadata.cancelled);
        assert_eq!(corpus.entries.len(), 2);
        assert_eq!(slow.call_count(), 2);
        let names = corpus
            .entries
            .iter()
            .map(|e| e.filename.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["p1.png", "p2.png"]);
        for entry in &corpus.entries {
            assert_eq!(entry.processing_method, ProcessingMethod::GoogleVision);
        }
        assert_eq!(pipeline.state(), RunState::Done);

        let written: LogbookCorpus = serde_json::from_str(
            &std::fs::read_to_string(fixture.output.join(CORPUS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(written.entries.len(), 2);
        assert!(written.metadata.cancelled);
        assert!(!fixture.output.join("p3.json").exists());
    }
}
