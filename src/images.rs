//! Finding page images on disk.

use std::ffi::OsStr;

use crate::prelude::*;

/// A single scanned page.
#[derive(Clone, Debug, PartialEq)]
pub struct PageImage {
    /// Position of this page in file name order, starting at 0.
    pub index: usize,

    /// Full path to the image.
    pub path: PathBuf,

    /// File name, including extension.
    pub filename: String,

    /// MIME type, guessed from the extension.
    pub mime_type: String,
}

impl PageImage {
    /// The file name without its extension. Used to name per-page outputs.
    pub fn stem(&self) -> &str {
        Path::new(&self.filename)
            .file_stem()
            .and_then(OsStr::to_str)
            .unwrap_or(&self.filename)
    }

    /// Read the image data.
    pub async fn read_bytes(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("could not read image {:?}", self.path))
    }
}

/// List the images in `dir`, sorted by file name, keeping at most `max_files`.
///
/// Files whose extension doesn't look like an image are skipped, as are
/// subdirectories. A missing directory is an error, but an empty one is not.
#[instrument(level = "debug")]
pub async fn list_page_images(dir: &Path, max_files: Option<usize>) -> Result<Vec<PageImage>> {
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("could not read input directory {:?}", dir))?;

    let mut found = vec![];
    while let Some(dir_entry) = read_dir
        .next_entry()
        .await
        .with_context(|| format!("could not list input directory {:?}", dir))?
    {
        let file_type = dir_entry
            .file_type()
            .await
            .with_context(|| format!("could not stat {:?}", dir_entry.path()))?;
        if !file_type.is_file() {
            continue;
        }
        let path = dir_entry.path();
        let Some(mime_type) = mime_guess::from_path(&path)
            .first()
            .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
        else {
            trace!(?path, "Skipping non-image file");
            continue;
        };
        let Some(filename) = path.file_name().and_then(OsStr::to_str).map(str::to_owned)
        else {
            warn!(?path, "Skipping file with non-UTF-8 name");
            continue;
        };
        found.push((filename, path, mime_type.essence_str().to_owned()));
    }

    // Byte-wise order, so that the result doesn't depend on locale.
    found.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    if let Some(max_files) = max_files {
        found.truncate(max_files);
    }

    let pages = found
        .into_iter()
        .enumerate()
        .map(|(index, (filename, path, mime_type))| PageImage {
            index,
            path,
            filename,
            mime_type,
        })
        .collect::<Vec<_>>();
    debug!(count = pages.len(), "Found page images");
    Ok(pages)
}
