//! Google Cloud Vision OCR backend.
//!
//! We call the REST API directly, using `DOCUMENT_TEXT_DETECTION`, which is
//! the mode Google recommends for dense and handwritten text.

use base64::{Engine as _, prelude::BASE64_STANDARD};
use leaky_bucket::RateLimiter;
use reqwest::Client;

use crate::{
    config::GoogleVisionCredentials, images::PageImage, prelude::*, rate_limit::RateLimit,
};

use super::{BackendId, OcrBackend, Recognition};

/// The `images:annotate` endpoint.
const ANNOTATE_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Google Cloud Vision backend.
pub struct GoogleVisionBackend {
    /// Our HTTP client. This handles connection pooling internally.
    client: Client,

    /// How we authenticate.
    auth: Auth,

    /// Spaces out our requests, if the user asked for that.
    rate_limiter: Option<RateLimiter>,
}

/// Authentication methods supported by the REST API.
enum Auth {
    /// Passed as `?key=...`.
    ApiKey(String),
    /// Passed as `Authorization: Bearer ...`.
    AccessToken(String),
}

impl GoogleVisionBackend {
    /// Create a new Google Vision backend.
    pub fn new(
        credentials: &GoogleVisionCredentials,
        rate_limit: Option<&RateLimit>,
    ) -> Result<Self> {
        // Prefer the API key, since access tokens expire after an hour.
        let auth = match (&credentials.api_key, &credentials.access_token) {
            (Some(key), _) => Auth::ApiKey(key.clone()),
            (None, Some(token)) => Auth::AccessToken(token.clone()),
            (None, None) => {
                return Err(anyhow!("Google Vision needs an API key or access token"));
            }
        };
        Ok(Self {
            client: Client::new(),
            auth,
            rate_limiter: rate_limit.map(RateLimit::to_rate_limiter),
        })
    }
}

#[async_trait]
impl OcrBackend for GoogleVisionBackend {
    fn id(&self) -> BackendId {
        BackendId::GoogleVision
    }

    #[instrument(level = "debug", skip_all, fields(page = %page.filename))]
    async fn recognize(&self, page: &PageImage) -> Result<Recognition> {
        let data = page.read_bytes().await?;
        let body = json!({
            "requests": [{
                "image": { "content": BASE64_STANDARD.encode(&data) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
            }],
        });

        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let request = self.client.post(ANNOTATE_URL).json(&body);
        let request = match &self.auth {
            Auth::ApiKey(key) => request.query(&[("key", key)]),
            Auth::AccessToken(token) => request.bearer_auth(token),
        };
        let response = request
            .send()
            .await
            .context("Google Vision request failed")?;
        let status = response.status();
        let response_json = response
            .json::<Value>()
            .await
            .context("cannot read Google Vision response")?;
        trace!(%response_json, "Google Vision response");
        if !status.is_success() {
            let message = response_json
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            return Err(anyhow!("Google Vision returned {status}: {message}"));
        }
        parse_annotate_response(response_json)
    }
}

/// A response from `images:annotate`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    full_text_annotation: Option<TextAnnotation>,
    /// Per-image errors are reported here, with an HTTP 200.
    #[serde(default)]
    error: Option<Status>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<AnnotatedPage>,
}

#[derive(Debug, Deserialize)]
struct AnnotatedPage {
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

/// Extract text and confidence from a response.
///
/// Confidence is the mean of the page confidences Google reports. If there
/// are none, we fall back to `min(1, chars / 100)`, so that longer
/// transcriptions count for more.
fn parse_annotate_response(response_json: Value) -> Result<Recognition> {
    let response = serde_json::from_value::<AnnotateResponse>(response_json)
        .context("unexpected Google Vision response")?;
    let Some(image_response) = response.responses.into_iter().next() else {
        return Err(anyhow!("Google Vision returned no responses"));
    };
    if let Some(status) = image_response.error {
        return Err(anyhow!("Google Vision error: {}", status.message));
    }
    let Some(annotation) = image_response.full_text_annotation else {
        return Ok(Recognition {
            text: String::new(),
            confidence: 0.0,
            token_usage: None,
        });
    };

    let text = annotation.text.trim().to_owned();
    let page_confidences = annotation
        .pages
        .iter()
        .filter_map(|p| p.confidence)
        .collect::<Vec<_>>();
    let confidence = if page_confidences.is_empty() {
        (text.chars().count() as f64 / 100.0).min(1.0)
    } else {
        page_confidences.iter().sum::<f64>() / page_confidences.len() as f64
    };
    Ok(Recognition {
        text,
        confidence,
        token_usage: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_page_confidence() {
        let recognition = parse_annotate_response(json!({
            "responses": [{
                "fullTextAnnotation": {
                    "text": "Jan 14 1933\nLeft Cairo\n",
                    "pages": [{ "confidence": 0.9 }, { "confidence": 0.7 }],
                },
            }],
        }))
        .unwrap();
        assert_eq!(recognition.text, "Jan 14 1933\nLeft Cairo");
        assert!((recognition.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_length_heuristic() {
        let recognition = parse_annotate_response(json!({
            "responses": [{
                "fullTextAnnotation": { "text": "x".repeat(40), "pages": [{}] },
            }],
        }))
        .unwrap();
        assert!((recognition.confidence - 0.4).abs() < 1e-9);

        let recognition = parse_annotate_response(json!({
            "responses": [{ "fullTextAnnotation": { "text": "x".repeat(400) } }],
        }))
        .unwrap();
        assert_eq!(recognition.confidence, 1.0);
    }

    #[test]
    fn empty_and_error_responses() {
        let recognition = parse_annotate_response(json!({ "responses": [{}] })).unwrap();
        assert!(recognition.text.is_empty());

        let err = parse_annotate_response(json!({
            "responses": [{ "error": { "code": 3, "message": "Bad image data." } }],
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Bad image data"));
        assert!(parse_annotate_response(json!({ "responses": [] })).is_err());
    }

    #[test]
    fn needs_some_credentials() {
        assert!(
            GoogleVisionBackend::new(&GoogleVisionCredentials::default(), None).is_err()
        );
    }
}
