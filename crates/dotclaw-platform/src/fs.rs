//! Atomic JSON file I/O.
//!
//! IPC files and small state files (cooldowns, registered groups, session
//! indexes) are exchanged between processes via the filesystem. Writers
//! always go through [`write_json_atomic`] (temp file in the same
//! directory, then rename); readers use [`read_json_retry`], which
//! tolerates a concurrent writer by re-reading on parse failure until the
//! document converges.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Write `value` as pretty JSON atomically: temp file, fsync-free rename.
///
/// The temp file lives in the target's directory so the rename stays on
/// one filesystem. Parent directories are created when missing.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_bytes_atomic(path, &body).await
}

/// Atomic raw write used by [`write_json_atomic`] and stream chunks.
pub async fn write_bytes_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&parent).await?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into()),
        std::process::id()
    ));
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Read and parse a JSON file, retrying on partial content.
///
/// A concurrent writer that does not rename atomically (the in-container
/// agent, for instance) can leave the file momentarily truncated. A parse
/// failure or a missing file (ENOENT) is retried every `interval` until
/// `attempts` are exhausted; the last error is then returned.
pub async fn read_json_retry<T: DeserializeOwned>(
    path: &Path,
    attempts: u32,
    interval: Duration,
) -> std::io::Result<T> {
    let mut last_err: Option<std::io::Error> = None;
    for attempt in 0..attempts.max(1) {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(path = %path.display(), attempt, error = %e, "partial json, retrying");
                    last_err = Some(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(interval).await;
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "read_json_retry")))
}

/// Read a JSON file if it exists; `None` when missing.
pub async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Append one line to a file, creating parent directories when missing.
pub async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        status: String,
        result: String,
    }

    #[tokio::test]
    async fn atomic_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("doc.json");
        let doc = Doc {
            status: "success".into(),
            result: "final".into(),
        };
        write_json_atomic(&path, &doc).await.unwrap();
        let back: Doc = read_json_retry(&path, 1, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(back, doc);
        // No temp file left behind.
        let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["doc.json"]);
    }

    #[tokio::test]
    async fn read_retry_converges_after_writer_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resp.json");

        // Partial write first, then the full document shortly after.
        tokio::fs::write(&path, r#"{"status":"success","result":"partial"#)
            .await
            .unwrap();
        let fix = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tokio::fs::write(&fix, r#"{"status":"success","result":"final"}"#)
                .await
                .unwrap();
        });

        let doc: Doc = read_json_retry(&path, 20, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(doc.result, "final");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn read_retry_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.json");

        let fix = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            write_json_atomic(
                &fix,
                &Doc {
                    status: "success".into(),
                    result: "here".into(),
                },
            )
            .await
            .unwrap();
        });

        let doc: Doc = read_json_retry(&path, 20, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(doc.result, "here");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn read_retry_gives_up_eventually() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.json");
        tokio::fs::write(&path, "{truncated").await.unwrap();
        let err = read_json_retry::<Doc>(&path, 3, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_json_opt_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing: Option<Doc> = read_json_opt(&dir.path().join("nope.json")).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn append_line_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        append_line(&path, "{\"a\":1}").await.unwrap();
        append_line(&path, "{\"a\":2}").await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
