//! Client for the external image classification service.
//!
//! `POST {url}` with the image as multipart field `imagefile`. A 200 answer
//! carries `{name: base64, type, std_channel_id, caffe_scores}`; anything
//! else yields [`ClassificationResult::unknown`].

use crate::config::ClassifierConfig;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Placeholder for every field that could not be determined
pub const UNKNOWN: &str = "UNKNOWN";
const UNKNOWN_CONFIDENCE: &str = "0.";

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Failed to read image {path}: {source}")]
    ReadImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Classifier request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Classifier answered {0}")]
    Status(StatusCode),

    #[error("Malformed classifier response: {0}")]
    Body(#[from] serde_json::Error),

    #[error("Undecodable channel name: {0}")]
    Name(String),
}

/// Channel recognized in an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub display_name: String,
    pub content_type: String,
    pub std_channel_id: String,
    pub confidence: String,
}

impl ClassificationResult {
    pub fn unknown() -> Self {
        Self {
            display_name: UNKNOWN.to_string(),
            content_type: UNKNOWN.to_string(),
            std_channel_id: UNKNOWN.to_string(),
            confidence: UNKNOWN_CONFIDENCE.to_string(),
        }
    }

    /// True when there is no channel id to enrich
    pub fn is_unknown_channel(&self) -> bool {
        self.std_channel_id == UNKNOWN
    }

    pub fn into_fields(self) -> [String; 4] {
        [
            self.display_name,
            self.content_type,
            self.std_channel_id,
            self.confidence,
        ]
    }
}

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    name: String,
    #[serde(rename = "type")]
    content_type: String,
    std_channel_id: String,
    caffe_scores: Value,
}

impl ClassifierResponse {
    fn into_result(self) -> Result<ClassificationResult, ClassifyError> {
        let name = STANDARD
            .decode(&self.name)
            .map_err(|e| ClassifyError::Name(e.to_string()))?;
        let display_name = String::from_utf8(name).map_err(|e| ClassifyError::Name(e.to_string()))?;

        let confidence = match self.caffe_scores {
            Value::String(s) => s,
            other => other.to_string(),
        };

        Ok(ClassificationResult {
            display_name,
            content_type: self.content_type,
            std_channel_id: self.std_channel_id,
            confidence,
        })
    }
}

/// Decode a classifier answer. Only status 200 counts as success.
pub fn parse_response(status: StatusCode, body: &[u8]) -> Result<ClassificationResult, ClassifyError> {
    if status != StatusCode::OK {
        return Err(ClassifyError::Status(status));
    }
    serde_json::from_slice::<ClassifierResponse>(body)?.into_result()
}

/// Shared HTTP client for all workers of a pool
#[derive(Debug, Clone)]
pub struct Classifier {
    client: reqwest::Client,
    url: String,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifyError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            url: config.url.clone(),
        })
    }

    /// Classify an archived image. Failures are logged and become the
    /// unknown result; they are never retried here.
    pub async fn classify(&self, image_path: &Path) -> ClassificationResult {
        match self.try_classify(image_path).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, path = %image_path.display(), "Classification failed");
                ClassificationResult::unknown()
            }
        }
    }

    pub async fn try_classify(&self, image_path: &Path) -> Result<ClassificationResult, ClassifyError> {
        let image = tokio::fs::read(image_path)
            .await
            .map_err(|source| ClassifyError::ReadImage {
                path: image_path.to_path_buf(),
                source,
            })?;

        let file_name = image_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let form = Form::new().part("imagefile", Part::bytes(image).file_name(file_name));

        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        let result = parse_response(status, &body)?;
        debug!(
            path = %image_path.display(),
            channel = %result.std_channel_id,
            confidence = %result.confidence,
            "Image classified"
        );
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::extract::Multipart;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};

    pub(crate) async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Answers like the real service when the upload uses the `imagefile` field
    pub(crate) fn recognizing_router() -> Router {
        Router::new().route(
            "/classify",
            post(|mut multipart: Multipart| async move {
                while let Ok(Some(field)) = multipart.next_field().await {
                    if field.name() == Some("imagefile") {
                        return Ok(Json(serde_json::json!({
                            "name": STANDARD.encode("Channel-X"),
                            "type": "sport",
                            "std_channel_id": "C1",
                            "caffe_scores": "0.98"
                        })));
                    }
                }
                Err(AxumStatus::BAD_REQUEST)
            }),
        )
    }

    fn classifier(url: String) -> Classifier {
        let mut config = crate::config::tests::sample_config().classifier;
        config.url = url;
        config.request_timeout_secs = Some(5);
        Classifier::new(&config).unwrap()
    }

    fn image_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"\xff\xd8jpeg").unwrap();
        file
    }

    fn fields(result: ClassificationResult) -> Vec<String> {
        result.into_fields().to_vec()
    }

    #[test]
    fn test_parse_success() {
        let body = serde_json::json!({
            "name": STANDARD.encode("Channel-X"),
            "type": "sport",
            "std_channel_id": "C1",
            "caffe_scores": "0.98"
        })
        .to_string();
        let result = parse_response(StatusCode::OK, body.as_bytes()).unwrap();
        assert_eq!(fields(result), vec!["Channel-X", "sport", "C1", "0.98"]);
    }

    #[test]
    fn test_parse_numeric_score() {
        let body = serde_json::json!({
            "name": STANDARD.encode("Channel-Y"),
            "type": "news",
            "std_channel_id": "C2",
            "caffe_scores": 0.75
        })
        .to_string();
        let result = parse_response(StatusCode::OK, body.as_bytes()).unwrap();
        assert_eq!(result.confidence, "0.75");
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(
            parse_response(StatusCode::INTERNAL_SERVER_ERROR, b"{}"),
            Err(ClassifyError::Status(_))
        ));
        assert!(matches!(
            parse_response(StatusCode::OK, b"<html>"),
            Err(ClassifyError::Body(_))
        ));
        let body = r#"{"name":"!!","type":"t","std_channel_id":"C","caffe_scores":"1"}"#;
        assert!(matches!(
            parse_response(StatusCode::OK, body.as_bytes()),
            Err(ClassifyError::Name(_))
        ));
    }

    #[test]
    fn test_unknown_sentinel() {
        let unknown = ClassificationResult::unknown();
        assert!(unknown.is_unknown_channel());
        assert_eq!(fields(unknown), vec!["UNKNOWN", "UNKNOWN", "UNKNOWN", "0."]);
    }

    #[tokio::test]
    async fn test_classify_over_http() {
        let base = serve(recognizing_router()).await;
        let image = image_file();
        let result = classifier(format!("{base}/classify")).classify(image.path()).await;
        assert_eq!(fields(result), vec!["Channel-X", "sport", "C1", "0.98"]);
    }

    #[tokio::test]
    async fn test_server_error_yields_unknown() {
        let router = Router::new().route(
            "/classify",
            post(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = serve(router).await;
        let image = image_file();
        let result = classifier(format!("{base}/classify")).classify(image.path()).await;
        assert_eq!(result, ClassificationResult::unknown());
    }

    #[tokio::test]
    async fn test_network_failure_yields_unknown() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let image = image_file();
        let result = classifier(format!("http://{addr}/classify")).classify(image.path()).await;
        assert_eq!(result, ClassificationResult::unknown());
    }

    #[tokio::test]
    async fn test_missing_image_yields_unknown() {
        let result = classifier("http://127.0.0.1:9/classify".to_string())
            .classify(Path::new("/nonexistent/image.jpg"))
            .await;
        assert_eq!(result, ClassificationResult::unknown());
    }
}
