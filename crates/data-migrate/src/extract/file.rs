//! Flat-file sources: one JSON or JSON-lines file per entity.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use super::pipeline::RowSink;
use super::{Connector, ExtractRequest, ExtractionSummary};
use crate::config::{DataSourceConfig, FileFormat, SourceKind};
use crate::core::{record_from_json, ControlSignal};
use crate::error::{MigrateError, Result};
use crate::staging::StagingArea;

pub struct FileConnector {
    source: DataSourceConfig,
}

impl FileConnector {
    pub fn new(source: DataSourceConfig) -> Self {
        Self { source }
    }

    fn dir(&self) -> Result<&PathBuf> {
        self.source.path.as_ref().ok_or_else(|| {
            MigrateError::Config(format!("File source '{}' has no path", self.source.id))
        })
    }

    fn file_for(&self, table: &str) -> Result<PathBuf> {
        let ext = match self.source.format {
            FileFormat::JsonLines => "jsonl",
            FileFormat::Json => "json",
        };
        Ok(self.dir()?.join(format!("{}.{}", table, ext)))
    }

    async fn read(&self, request: &ExtractRequest, sink: &mut RowSink) -> Result<()> {
        let path = self.file_for(&request.table)?;
        match self.source.format {
            FileFormat::JsonLines => {
                let file = fs::File::open(&path).await?;
                let mut lines = BufReader::new(file).lines();
                let mut line_no = 0usize;
                while let Some(line) = lines.next_line().await? {
                    line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<serde_json::Value>(&line) {
                        Ok(serde_json::Value::Object(obj)) => {
                            sink.push(record_from_json(&obj, &request.columns)).await?
                        }
                        Ok(_) => sink.reject(format!("line {}: not a JSON object", line_no)),
                        Err(e) => sink.reject(format!("line {}: {}", line_no, e)),
                    }
                }
            }
            FileFormat::Json => {
                let content = fs::read_to_string(&path).await?;
                let items = match serde_json::from_str::<serde_json::Value>(&content)? {
                    serde_json::Value::Array(items) => items,
                    _ => {
                        return Err(MigrateError::extraction(
                            &request.entity,
                            format!("{} does not contain a JSON array", path.display()),
                        ))
                    }
                };
                for (idx, item) in items.into_iter().enumerate() {
                    match item {
                        serde_json::Value::Object(obj) => {
                            sink.push(record_from_json(&obj, &request.columns)).await?
                        }
                        _ => sink.reject(format!("element {}: not a JSON object", idx)),
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for FileConnector {
    async fn test_connection(&self) -> Result<()> {
        let dir = self.dir()?;
        let meta = fs::metadata(dir).await?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(MigrateError::Config(format!(
                "File source '{}': {} is not a directory",
                self.source.id,
                dir.display()
            )))
        }
    }

    async fn extract(
        &self,
        request: &ExtractRequest,
        staging: Arc<dyn StagingArea>,
        control: &ControlSignal,
    ) -> Result<ExtractionSummary> {
        request.validate()?;
        let mut sink = RowSink::new(request, staging, control.clone());
        let outcome = self.read(request, &mut sink).await;
        let summary = sink.complete(outcome).await?;
        info!(
            "Read {} records of {} from file source '{}'",
            summary.records_extracted, request.entity, self.source.id
        );
        Ok(summary)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::File
    }
}
