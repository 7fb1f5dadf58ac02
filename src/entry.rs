//! Logbook entries, one per page.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;

use crate::{
    backends::{AttemptSummary, BackendId},
    enhancer::{Enhancement, EnhancementStatus},
    images::PageImage,
    prelude::*,
    selector::Selection,
};

/// How a page's text was produced.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMethod {
    GoogleVision,
    Tesseract,
    OpenaiVision,
    /// Every backend failed.
    Failed,
}

impl ProcessingMethod {
    /// All methods, in report order.
    pub const ALL: [ProcessingMethod; 4] = [
        ProcessingMethod::GoogleVision,
        ProcessingMethod::Tesseract,
        ProcessingMethod::OpenaiVision,
        ProcessingMethod::Failed,
    ];

    /// The name used in output files.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingMethod::GoogleVision => "google_vision",
            ProcessingMethod::Tesseract => "tesseract",
            ProcessingMethod::OpenaiVision => "openai_vision",
            ProcessingMethod::Failed => "failed",
        }
    }
}

impl From<Option<BackendId>> for ProcessingMethod {
    fn from(backend: Option<BackendId>) -> Self {
        match backend {
            Some(BackendId::GoogleVision) => ProcessingMethod::GoogleVision,
            Some(BackendId::Tesseract) => ProcessingMethod::Tesseract,
            Some(BackendId::OpenaiVision) => ProcessingMethod::OpenaiVision,
            None => ProcessingMethod::Failed,
        }
    }
}

impl fmt::Display for ProcessingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The digitized content of one logbook page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct LogbookEntry {
    /// The image file name.
    pub filename: String,

    /// The page number, taken from the first run of digits in the file name.
    pub page_number: Option<u64>,

    /// The date of the entry, if known.
    pub date_entry: Option<String>,

    /// Where the entry was written, if known.
    pub location: Option<String>,

    /// Weather or sea conditions, if recorded.
    pub weather: Option<String>,

    /// A short summary of the day's activities.
    pub activities: Option<String>,

    /// People named on the page.
    pub people_mentioned: Option<Vec<String>>,

    /// The cleaned-up text. This is the raw OCR text if enhancement was
    /// skipped or failed.
    pub content: String,

    /// The text from the winning OCR backend.
    pub raw_ocr_text: String,

    /// Confidence of the winning OCR backend, between 0 and 1.
    pub confidence_score: f64,

    /// Which backend produced the text.
    pub processing_method: ProcessingMethod,

    /// When this page was processed.
    pub timestamp: DateTime<Utc>,

    /// What happened during enhancement.
    pub enhancement_status: EnhancementStatus,

    /// Every OCR backend we tried, in order.
    pub ocr_attempts: Vec<AttemptSummary>,
}

/// Extract a page number from a file name: the first run of ASCII digits.
///
/// `IMG_4270.png` is page 4270. Names with no digits, or with absurdly long
/// digit runs, have no page number.
pub fn page_number_from_filename(filename: &str) -> Option<u64> {
    let start = filename.find(|c: char| c.is_ascii_digit())?;
    let digits = &filename[start..];
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}

/// Combine our results for a page into an entry.
pub fn assemble_entry(
    page: &PageImage,
    selection: &Selection,
    enhancement: Enhancement,
    timestamp: DateTime<Utc>,
) -> LogbookEntry {
    let processing_method = ProcessingMethod::from(selection.backend);
    let (content, raw_ocr_text, confidence_score) =
        if processing_method == ProcessingMethod::Failed {
            (String::new(), String::new(), 0.0)
        } else {
            (
                enhancement.content,
                selection.text.clone(),
                selection.confidence,
            )
        };
    LogbookEntry {
        filename: page.filename.clone(),
        page_number: page_number_from_filename(&page.filename),
        date_entry: enhancement.date_entry,
        location: enhancement.location,
        weather: enhancement.weather,
        activities: enhancement.activities,
        people_mentioned: enhancement.people_mentioned,
        content,
        raw_ocr_text,
        confidence_score,
        processing_method,
        timestamp,
        enhancement_status: enhancement.status,
        ocr_attempts: selection.attempts.iter().map(|a| a.summary()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use crate::backends::{OcrAttempt, testing::page};

    use super::*;

    #[test]
    fn page_numbers_come_from_the_first_digits() {
        assert_eq!(page_number_from_filename("IMG_4270.png"), Some(4270));
        assert_eq!(page_number_from_filename("page-07-scan2.jpg"), Some(7));
        assert_eq!(page_number_from_filename("cover.png"), None);
        assert_eq!(
            page_number_from_filename("x99999999999999999999999.png"),
            None
        );
    }

    #[test]
    fn failed_pages_have_empty_content() {
        let selection = Selection {
            backend: None,
            text: String::new(),
            confidence: 0.0,
            attempts: vec![OcrAttempt::failure(BackendId::Tesseract, "no tesseract")],
        };
        let enhancement = Enhancement::skipped("");
        let entry = assemble_entry(&page(0, "IMG_1.png"), &selection, enhancement, Utc::now());
        assert_eq!(entry.processing_method, ProcessingMethod::Failed);
        assert_eq!(entry.confidence_score, 0.0);
        assert!(entry.content.is_empty());
        assert_eq!(entry.page_number, Some(1));
        assert_eq!(entry.ocr_attempts.len(), 1);
        assert!(!entry.ocr_attempts[0].ok);
    }

    #[test]
    fn enhancement_metadata_is_copied_to_the_entry() {
        let selection = Selection {
            backend: Some(BackendId::Tesseract),
            text: "Lcft Shanghai".to_owned(),
            confidence: 0.7,
            attempts: vec![],
        };
        let enhancement = Enhancement {
            content: "Left Shanghai".to_owned(),
            date_entry: Some("1933-01-14".to_owned()),
            location: Some("Shanghai".to_owned()),
            weather: Some("fog".to_owned()),
            activities: None,
            people_mentioned: Some(vec!["Captain Ross".to_owned()]),
            status: EnhancementStatus::Enhanced,
            token_usage: None,
        };
        let entry = assemble_entry(&page(0, "IMG_7.png"), &selection, enhancement, Utc::now());
        assert_eq!(entry.content, "Left Shanghai");
        assert_eq!(entry.raw_ocr_text, "Lcft Shanghai");
        assert_eq!(entry.weather.as_deref(), Some("fog"));
        assert_eq!(entry.activities, None);
        assert_eq!(entry.people_mentioned.as_deref(), Some(&["Captain Ross".to_owned()][..]));

        // Missing metadata is written as null, not left out.
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["activities"], Value::Null);
    }

    #[test]
    fn methods_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_value(ProcessingMethod::GoogleVision).unwrap(),
            json!("google_vision")
        );
        for method in ProcessingMethod::ALL {
            assert_eq!(serde_json::to_value(method).unwrap(), json!(method.as_str()));
        }
    }
}
