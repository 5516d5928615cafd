//! Per-worker classification logs, one file per processing day:
//! `{log_dir}/{date}/log-{pid}.{worker}`.

use crate::archive::ensure_dir;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

/// Number of trailing metadata fields kept after the inserted fields
pub const TRAILING_FIELDS: usize = 3;

#[derive(Error, Debug)]
pub enum LogWriteError {
    #[error("Failed to prepare log directory: {0}")]
    Directory(#[from] crate::archive::ArchiveError),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Insert `inserted` into `metadata` three positions from its end.
///
/// `[a, b, c, d, e]` with `[n, t]` becomes `[a, b, n, t, c, d, e]`. Shorter
/// metadata gets the inserted fields in front.
pub fn splice_fields(
    mut metadata: Vec<String>,
    inserted: impl IntoIterator<Item = String>,
) -> Vec<String> {
    let at = metadata.len().saturating_sub(TRAILING_FIELDS);
    let suffix = metadata.split_off(at);
    metadata.extend(inserted);
    metadata.extend(suffix);
    metadata
}

struct OpenLog {
    date: String,
    path: PathBuf,
    writer: BufWriter<File>,
    lines: usize,
}

/// Appends comma-joined lines to the file of the record's day, switching
/// files when the day changes. Buffered output reaches the file every
/// `flush_every` lines, on a day switch and on close.
pub struct DailyLogWriter {
    root: PathBuf,
    file_name: String,
    flush_every: usize,
    current: Option<OpenLog>,
}

impl DailyLogWriter {
    pub fn new(root: impl Into<PathBuf>, process_id: u32, worker: usize, flush_every: usize) -> Self {
        Self {
            root: root.into(),
            file_name: format!("log-{process_id}.{worker}"),
            flush_every: flush_every.max(1),
            current: None,
        }
    }

    pub fn path_for(&self, date: &str) -> PathBuf {
        self.root.join(date).join(&self.file_name)
    }

    pub fn current_date(&self) -> Option<&str> {
        self.current.as_ref().map(|log| log.date.as_str())
    }

    pub async fn write_line(&mut self, date: &str, fields: &[String]) -> Result<(), LogWriteError> {
        let log = match self.current.take() {
            Some(log) if log.date == date => log,
            previous => {
                if let Some(previous) = previous {
                    Self::finish(previous).await?;
                }
                self.open(date).await?
            }
        };
        let log = self.current.insert(log);

        let line = format!("{}\n", fields.join(","));
        log.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|source| LogWriteError::Io {
                path: log.path.clone(),
                source,
            })?;
        log.lines += 1;

        if log.lines % self.flush_every == 0 {
            log.writer.flush().await.map_err(|source| LogWriteError::Io {
                path: log.path.clone(),
                source,
            })?;
        }

        Ok(())
    }

    /// Flush and sync the open file, if any
    pub async fn close(&mut self) -> Result<(), LogWriteError> {
        match self.current.take() {
            Some(log) => Self::finish(log).await,
            None => Ok(()),
        }
    }

    async fn finish(mut log: OpenLog) -> Result<(), LogWriteError> {
        let io_err = |source| LogWriteError::Io {
            path: log.path.clone(),
            source,
        };
        log.writer.flush().await.map_err(io_err)?;
        log.writer.get_ref().sync_data().await.map_err(io_err)?;

        debug!(path = %log.path.display(), lines = log.lines, "Closed classification log");
        Ok(())
    }

    async fn open(&self, date: &str) -> Result<OpenLog, LogWriteError> {
        ensure_dir(&self.root.join(date)).await?;
        let path = self.path_for(date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| LogWriteError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "Opened classification log");
        Ok(OpenLog {
            date: date.to_string(),
            path,
            writer: BufWriter::new(file),
            lines: 0,
        })
    }
}
