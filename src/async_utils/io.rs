//! Output file utilities.
//!
//! Every artifact we produce is written atomically: we write a temporary file
//! in the destination directory and rename it into place. A crash or an
//! interrupted run never leaves a half-written JSON file behind.

use std::io::Write as _;

use tempfile::NamedTempFile;

use crate::prelude::*;

/// Atomically replace `path` with `data`.
pub async fn write_atomic(path: &Path, data: Vec<u8>) -> Result<()> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || write_atomic_sync(&path, &data))
        .await
        .context("could not join file writer task")?
}

/// Synchronous version of [`write_atomic`].
fn write_atomic_sync(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temporary file in {:?}", dir))?;
    tmp.write_all(data)
        .with_context(|| format!("failed to write temporary file for {:?}", path))?;
    tmp.flush()
        .with_context(|| format!("failed to flush temporary file for {:?}", path))?;
    tmp.persist(path)
        .with_context(|| format!("failed to move output into place at {:?}", path))?;
    Ok(())
}

/// Atomically write a value as pretty-printed JSON.
pub async fn write_json_atomic<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let mut data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {:?}", path))?;
    data.push(b'\n');
    write_atomic(path, data).await
}

/// Atomically write a text file.
pub async fn write_text_atomic(path: &Path, text: &str) -> Result<()> {
    write_atomic(path, text.as_bytes().to_vec()).await
}

/// Read a UTF-8 text file.
pub async fn read_text(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_json_atomic_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_text_atomic(&path, "old").await.unwrap();
        write_json_atomic(&path, &json!({ "pages": 3 })).await.unwrap();

        let text = read_text(&path).await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({ "pages": 3 }));

        // No temporary files are left behind.
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
