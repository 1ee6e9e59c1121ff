//! JSON-lines staging under a directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::{check_key, StagingArea};
use crate::core::Record;
use crate::error::Result;

/// Stores each key as `<dir>/<key>.jsonl`, one record per line.
pub struct FileStaging {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStaging {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.dir.join(format!("{}.jsonl", key)))
    }
}

async fn remove_tree_files(path: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let p = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(p);
            } else if p.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                removed += 1;
            }
        }
    }
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(removed),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(removed),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StagingArea for FileStaging {
    async fn append(&self, key: &str, records: &[Record]) -> Result<()> {
        let path = self.path_for(key)?;
        let mut buf = Vec::with_capacity(records.len() * 64);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<Record>> {
        let path = self.path_for(key)?;
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        let mut index = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if index >= offset {
                if records.len() >= limit {
                    break;
                }
                records.push(serde_json::from_str(&line)?);
            }
            index += 1;
        }
        Ok(records)
    }

    async fn count(&self, key: &str) -> Result<usize> {
        let path = self.path_for(key)?;
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut lines = BufReader::new(file).lines();
        let mut n = 0;
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Only whole directory prefixes (`<migration>/`) are supported.
    async fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let trimmed = prefix.trim_end_matches('/');
        check_key(trimmed)?;
        let _guard = self.write_lock.lock().await;
        remove_tree_files(&self.dir.join(trimmed)).await
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
