//! On-disk image archive.
//!
//! Layout: `{archive_dir}/{site_id}/{date}/{gzid}_900000_{device_id}_{date}/`
//! holding the image files of one device for one day plus a device list
//! file with one tab-separated metadata line per image.

use crate::config::{ArchiveConfig, MAX_DAY_OFFSET_HOURS};
use crate::message::ImageMessage;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Unusable path component {0:?}")]
    InvalidComponent(String),

    #[error("Device time {0} has no archive day")]
    DateOutOfRange(NaiveDateTime),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of archiving one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedImage {
    /// Archive day, `YYYY-MM-DD`
    pub date: String,
    pub image_path: PathBuf,
}

/// Writes images and device list lines under the archive root
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    root: PathBuf,
    site_id: String,
    dev_list: String,
    day_offset: Duration,
}

impl ArchiveWriter {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            root: config.archive_dir.clone(),
            site_id: config.site_id.clone(),
            dev_list: config.dev_list.clone(),
            day_offset: Duration::hours(
                config
                    .day_offset_hours
                    .clamp(-MAX_DAY_OFFSET_HOURS, MAX_DAY_OFFSET_HOURS),
            ),
        }
    }

    /// Archive day of a device timestamp. Shifted back so that the site's
    /// day starts at the offset hour instead of midnight.
    pub fn archive_date(&self, device_time: NaiveDateTime) -> Result<NaiveDate, ArchiveError> {
        device_time
            .checked_sub_signed(self.day_offset)
            .map(|shifted| shifted.date())
            .ok_or(ArchiveError::DateOutOfRange(device_time))
    }

    /// Directory holding one device's images for one day
    pub fn device_dir(&self, gzid: &str, device_id: &str, date: &str) -> Result<PathBuf, ArchiveError> {
        let device_dir = format!(
            "{}_900000_{}_{}",
            sanitize_path_component(gzid)?,
            sanitize_path_component(device_id)?,
            date
        );
        Ok(self
            .root
            .join(sanitize_path_component(&self.site_id)?)
            .join(date)
            .join(device_dir))
    }

    /// Write the image and append its metadata line to the device list
    #[instrument(skip(self, message, metadata), fields(device_id = %message.device_id, img_name = %message.img_name))]
    pub async fn store(
        &self,
        message: &ImageMessage,
        metadata: &[String],
    ) -> Result<ArchivedImage, ArchiveError> {
        let date = self
            .archive_date(message.create_time)?
            .format(DATE_FORMAT)
            .to_string();
        let dir = self.device_dir(&message.gzid, &message.device_id, &date)?;
        ensure_dir(&dir).await?;

        let image_path = dir.join(sanitize_path_component(&message.img_name)?);
        tokio::fs::write(&image_path, &message.image)
            .await
            .map_err(|source| ArchiveError::Io {
                path: image_path.clone(),
                source,
            })?;

        let list_path = dir.join(&self.dev_list);
        append_line(&list_path, &metadata.join("\t")).await?;

        debug!(
            path = %image_path.display(),
            size_bytes = message.image.len(),
            "Image archived"
        );

        Ok(ArchivedImage { date, image_path })
    }
}

/// Create `dir` and its parents. Succeeds when another writer got there first.
pub async fn ensure_dir(dir: &Path) -> Result<(), ArchiveError> {
    match tokio::fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(_) if dir.is_dir() => Ok(()),
        Err(source) => Err(ArchiveError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

async fn append_line(path: &Path, line: &str) -> Result<(), ArchiveError> {
    let io_err = |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err)?;

    // Single write so concurrent appenders never interleave within a line
    file.write_all(format!("{line}\n").as_bytes())
        .await
        .map_err(io_err)?;
    file.flush().await.map_err(io_err)
}

/// Keep a message-supplied name inside its directory
fn sanitize_path_component(component: &str) -> Result<String, ArchiveError> {
    let sanitized: String = component
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            _ => c,
        })
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        return Err(ArchiveError::InvalidComponent(component.to_string()));
    }
    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_metadata_fields;
    use base64::{engine::general_purpose::STANDARD, Engine};

    fn writer(root: &Path) -> ArchiveWriter {
        ArchiveWriter::new(&ArchiveConfig {
            site_id: "A1B2C3D4E5F6".to_string(),
            archive_dir: root.to_path_buf(),
            dev_list: "dev_list.csv".to_string(),
            day_offset_hours: 2,
            metadata_fields: default_metadata_fields(),
        })
    }

    fn message(create_time: &str, img_name: &str) -> ImageMessage {
        let payload = serde_json::json!({
            "gzid": "GZ01",
            "img_name": img_name,
            "device_id": "STB-77",
            "create_time": create_time,
            "img_code": STANDARD.encode(b"\xff\xd8jpeg"),
        });
        ImageMessage::parse(payload.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_archive_date_uses_day_offset() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let early = message("2024-03-02 01:59:59", "a.jpg").create_time;
        let late = message("2024-03-02 02:00:00", "a.jpg").create_time;
        assert_eq!(writer.archive_date(early).unwrap().to_string(), "2024-03-01");
        assert_eq!(writer.archive_date(late).unwrap().to_string(), "2024-03-02");
    }

    #[tokio::test]
    async fn test_device_time_at_range_edge_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let ancient = message("-262143-01-01 01:00:00", "a.jpg");

        assert!(matches!(
            writer.archive_date(ancient.create_time),
            Err(ArchiveError::DateOutOfRange(_))
        ));
        assert!(matches!(
            writer.store(&ancient, &ancient.metadata(&default_metadata_fields())).await,
            Err(ArchiveError::DateOutOfRange(_))
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_device_dir_layout() {
        let writer = writer(Path::new("/archive"));
        assert_eq!(
            writer.device_dir("GZ01", "STB-77", "2024-03-02").unwrap(),
            PathBuf::from("/archive/A1B2C3D4E5F6/2024-03-02/GZ01_900000_STB-77_2024-03-02")
        );
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("frame.jpg").unwrap(), "frame.jpg");
        assert_eq!(sanitize_path_component("../etc/passwd").unwrap(), ".._etc_passwd");
        assert!(sanitize_path_component("..").is_err());
        assert!(sanitize_path_component("").is_err());
    }

    #[tokio::test]
    async fn test_store_writes_image_and_list_line() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        let first = message("2024-03-02 08:00:00", "frame_1.jpg");
        let second = message("2024-03-02 08:00:05", "frame_2.jpg");
        let archived = writer
            .store(&first, &first.metadata(&default_metadata_fields()))
            .await
            .unwrap();
        writer
            .store(&second, &second.metadata(&default_metadata_fields()))
            .await
            .unwrap();

        assert_eq!(archived.date, "2024-03-02");
        assert_eq!(std::fs::read(&archived.image_path).unwrap(), b"\xff\xd8jpeg");

        let device_dir = archived.image_path.parent().unwrap();
        let list = std::fs::read_to_string(device_dir.join("dev_list.csv")).unwrap();
        let lines: Vec<&str> = list.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "frame_1\tGZ01\tSTB-77\t2024-03-02 08:00:00\t\t\t"
        );
    }

    #[tokio::test]
    async fn test_ensure_dir_is_idempotent_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let target = target.clone();
                tokio::spawn(async move { ensure_dir(&target).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        ensure_dir(&target).await.unwrap();
        assert!(target.is_dir());
    }
}
