//! Choosing the best OCR result for a page.
//!
//! Backends are tried in priority order. The first one that is confident
//! enough wins outright, and lower-priority backends are never called. If none
//! clears the threshold, we keep the most confident successful attempt, with
//! ties going to the higher-priority backend.

use std::{sync::Arc, time::Duration};

use crate::{
    async_utils::with_timeout,
    backends::{BackendId, OcrAttempt, OcrBackend, clamp_confidence},
    drivers::TokenUsage,
    images::PageImage,
    prelude::*,
};

/// The outcome of running the selector on one page.
#[derive(Clone, Debug)]
pub struct Selection {
    /// The winning backend, or `None` if every attempt failed.
    pub backend: Option<BackendId>,

    /// The winning text. Empty if every attempt failed.
    pub text: String,

    /// The winning confidence. Zero if every attempt failed.
    pub confidence: f64,

    /// Every attempt we made, in the order we made them.
    pub attempts: Vec<OcrAttempt>,
}

impl Selection {
    /// Total LLM tokens used by all attempts.
    pub fn token_usage(&self) -> TokenUsage {
        let mut total = TokenUsage::default();
        for usage in self.attempts.iter().filter_map(|a| a.token_usage.clone()) {
            total += usage;
        }
        total
    }
}

/// Tries backends in order, with early exit.
pub struct FallbackSelector {
    /// Backends, highest priority first.
    backends: Vec<Arc<dyn OcrBackend>>,

    /// A result must be strictly above this to stop early.
    threshold: f64,

    /// Per-attempt timeout.
    timeout: Duration,
}

impl FallbackSelector {
    /// Create a new selector.
    pub fn new(backends: Vec<Arc<dyn OcrBackend>>, threshold: f64, timeout: Duration) -> Self {
        Self {
            backends,
            threshold,
            timeout,
        }
    }

    /// Run backends on `page` until one is confident enough.
    #[instrument(level = "debug", skip_all, fields(page = %page.filename))]
    pub async fn select(&self, page: &PageImage) -> Selection {
        let mut attempts: Vec<OcrAttempt> = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let mut attempt = match with_timeout(self.timeout, backend.attempt(page)).await
            {
                Ok(attempt) => attempt,
                Err(timed_out) => OcrAttempt::failure(backend.id(), timed_out),
            };
            attempt.confidence = clamp_confidence(attempt.confidence);
            debug!(
                backend = %attempt.backend,
                ok = attempt.ok,
                confidence = attempt.confidence,
                "OCR attempt finished"
            );
            let done = attempt.ok && attempt.confidence > self.threshold;
            attempts.push(attempt);
            if done {
                break;
            }
        }

        // `max_by` keeps the last maximum, so we search in reverse to make
        // ties go to the earlier backend.
        let best = attempts
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, a)| a.ok)
            .max_by(|(_, a), (_, b)| a.confidence.total_cmp(&b.confidence))
            .map(|(idx, _)| idx);
        match best {
            Some(idx) => {
                let backend = attempts[idx].backend;
                let text = attempts[idx].text.clone();
                let confidence = attempts[idx].confidence;
                Selection {
                    backend: Some(backend),
                    text,
                    confidence,
                    attempts,
                }
            }
            None => {
                warn!("All OCR backends failed for {}", page.filename);
                Selection {
                    backend: None,
                    text: String::new(),
                    confidence: 0.0,
                    attempts,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backends::testing::{StubBackend, page};

    use super::*;

    fn selector(backends: &[Arc<StubBackend>], threshold: f64) -> FallbackSelector {
        FallbackSelector::new(
            backends
                .iter()
                .map(|b| b.clone() as Arc<dyn OcrBackend>)
                .collect(),
            threshold,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn confident_backend_stops_the_search() {
        let google = Arc::new(StubBackend::new(BackendId::GoogleVision, &[("p.png", 0.95)]));
        let tesseract = Arc::new(StubBackend::new(BackendId::Tesseract, &[("p.png", 0.99)]));
        let selection = selector(&[google.clone(), tesseract.clone()], 0.8)
            .select(&page(0, "p.png"))
            .await;
        assert_eq!(selection.backend, Some(BackendId::GoogleVision));
        assert_eq!(selection.confidence, 0.95);
        assert_eq!(selection.attempts.len(), 1);
        assert_eq!(google.call_count(), 1);
        assert_eq!(tesseract.call_count(), 0);
    }

    #[tokio::test]
    async fn threshold_is_strict() {
        let google = Arc::new(StubBackend::new(BackendId::GoogleVision, &[("p.png", 0.8)]));
        let tesseract = Arc::new(StubBackend::new(BackendId::Tesseract, &[("p.png", 0.7)]));
        let selection = selector(&[google, tesseract.clone()], 0.8)
            .select(&page(0, "p.png"))
            .await;
        assert_eq!(tesseract.call_count(), 1);
        assert_eq!(selection.backend, Some(BackendId::GoogleVision));
    }

    #[tokio::test]
    async fn best_result_wins_and_ties_go_to_priority() {
        let a = Arc::new(StubBackend::new(BackendId::GoogleVision, &[("p.png", 0.5)]));
        let b = Arc::new(StubBackend::new(BackendId::Tesseract, &[("p.png", 0.7)]));
        let c = Arc::new(StubBackend::new(BackendId::OpenaiVision, &[("p.png", 0.7)]));
        let selection = selector(&[a, b, c], 0.8).select(&page(0, "p.png")).await;
        assert_eq!(selection.backend, Some(BackendId::Tesseract));
        assert_eq!(selection.attempts.len(), 3);
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_clamped() {
        let a = Arc::new(StubBackend::new(BackendId::Tesseract, &[("p.png", 1.3)]));
        let b = Arc::new(StubBackend::new(BackendId::OpenaiVision, &[("p.png", 0.6)]));
        let selection = selector(&[a, b.clone()], 0.8).select(&page(0, "p.png")).await;
        assert_eq!(selection.confidence, 1.0);
        assert_eq!(b.call_count(), 0);
    }

    #[tokio::test]
    async fn all_failures_produce_an_empty_selection() {
        let a = Arc::new(StubBackend::new(BackendId::GoogleVision, &[]));
        let b = Arc::new(StubBackend::new(BackendId::Tesseract, &[]));
        let selection = selector(&[a, b], 0.8).select(&page(0, "p.png")).await;
        assert_eq!(selection.backend, None);
        assert_eq!(selection.confidence, 0.0);
        assert!(selection.text.is_empty());
        assert_eq!(selection.attempts.len(), 2);
        assert!(selection.attempts.iter().all(|a| !a.ok));
    }

    #[tokio::test]
    async fn slow_backends_time_out() {
        let slow = Arc::new(
            StubBackend::new(BackendId::GoogleVision, &[("p.png", 0.99)])
                .with_delay(Duration::from_secs(30)),
        );
        let fast = Arc::new(StubBackend::new(BackendId::Tesseract, &[("p.png", 0.6)]));
        let selector = FallbackSelector::new(
            vec![slow as Arc<dyn OcrBackend>, fast as Arc<dyn OcrBackend>],
            0.8,
            Duration::from_millis(20),
        );
        let selection = selector.select(&page(0, "p.png")).await;
        assert_eq!(selection.backend, Some(BackendId::Tesseract));
        assert!(selection.attempts[0].error.as_deref().unwrap().contains("timed out"));
    }
}
