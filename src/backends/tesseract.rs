//! Tesseract OCR backend.

use std::{io::Cursor, process::Stdio};

use image::ImageFormat;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore,
    images::PageImage, prelude::*,
};

use super::{BackendId, OcrBackend, Recognition};

/// OCR backend wrapping the `tesseract` CLI tool.
pub struct TesseractBackend {
    /// The command to run.
    command: String,
}

impl TesseractBackend {
    /// Create a new `tesseract` backend.
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_owned(),
        }
    }

    /// Make sure we can actually run `tesseract`.
    pub async fn check_installed(&self) -> Result<()> {
        let output = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("cannot run {:?}", self.command))?;
        check_for_command_failure(&self.command, &output)
    }
}

#[async_trait]
impl OcrBackend for TesseractBackend {
    fn id(&self) -> BackendId {
        BackendId::Tesseract
    }

    #[instrument(level = "debug", skip_all, fields(page = %page.filename))]
    async fn recognize(&self, page: &PageImage) -> Result<Recognition> {
        let data = page.read_bytes().await?;
        let png = tokio::task::spawn_blocking(move || grayscale_png(&data))
            .await
            .context("could not join image conversion task")??;

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")
            .context("cannot create tesseract temporary directory")?;
        let input_path = tmpdir.path().join("input.png");
        tokio::fs::write(&input_path, &png)
            .await
            .context("cannot write tesseract input file")?;

        // Run tesseract, with page segmentation mode 6 ("a single uniform
        // block of text"), which suits handwritten pages best.
        let output = with_cpu_semaphore(|| async {
            Command::new(&self.command)
                .arg(&input_path)
                .arg("stdout")
                .args(["--psm", "6", "tsv"])
                .stdin(Stdio::null())
                .output()
                .await
                .with_context(|| format!("cannot run {:?}", self.command))
        })
        .await?;
        check_for_command_failure("tesseract", &output)?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        let (text, confidence) = parse_tsv(&tsv)?;
        Ok(Recognition {
            text,
            confidence,
            token_usage: None,
        })
    }
}

/// Decode an image and re-encode it as a grayscale PNG.
fn grayscale_png(data: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(data).context("cannot decode image")?;
    let mut png = Vec::new();
    img.grayscale()
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("cannot encode grayscale image")?;
    Ok(png)
}

/// Rebuild text from `tesseract`'s TSV output, and compute the mean word
/// confidence scaled to [0,1].
///
/// Columns are `level page_num block_num par_num line_num word_num left top
/// width height conf text`. Only level 5 rows are words. Rows with a
/// confidence of -1 are layout markers.
fn parse_tsv(tsv: &str) -> Result<(String, f64)> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .has_headers(true)
        // Tesseract doesn't quote fields, and handwriting OCR produces plenty
        // of stray quote characters.
        .quoting(false)
        .from_reader(tsv.as_bytes());

    let mut lines: Vec<((u32, u32, u32), Vec<String>)> = vec![];
    let mut confidence_sum = 0.0;
    let mut word_count = 0usize;
    for record in rdr.records() {
        let record = record.context("cannot parse tesseract TSV output")?;
        let field = |idx: usize| record.get(idx).unwrap_or_default();
        if field(0) != "5" {
            continue;
        }
        let word = field(11).trim();
        let conf = field(10).trim().parse::<f64>().unwrap_or(-1.0);
        if word.is_empty() || conf < 0.0 {
            continue;
        }
        let num = |idx: usize| field(idx).trim().parse::<u32>().unwrap_or_default();
        let key = (num(2), num(3), num(4));

        confidence_sum += conf;
        word_count += 1;
        match lines.last_mut() {
            Some((last_key, words)) if *last_key == key => words.push(word.to_owned()),
            _ => lines.push((key, vec![word.to_owned()])),
        }
    }

    if word_count == 0 {
        return Ok((String::new(), 0.0));
    }
    let text = lines
        .into_iter()
        .map(|(_, words)| words.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    Ok((text, confidence_sum / word_count as f64 / 100.0))
}
