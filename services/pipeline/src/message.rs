//! Decoding of image messages carried on the stream.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use thiserror::Error;

/// Device clock format of `create_time`
pub const DEVICE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Missing field {0}")]
    MissingField(&'static str),

    #[error("Invalid create_time {value:?}: {source}")]
    InvalidTime {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Invalid image encoding: {0}")]
    InvalidImage(#[from] base64::DecodeError),
}

/// A decoded stream message.
///
/// ```json
/// {"gzid": "...", "img_name": "...", "device_id": "...",
///  "create_time": "YYYY-MM-DD HH:MM:SS", "img_code": "<base64>"}
/// ```
#[derive(Debug, Clone)]
pub struct ImageMessage {
    /// Group id
    pub gzid: String,
    pub img_name: String,
    pub device_id: String,
    /// Device clock, no timezone
    pub create_time: NaiveDateTime,
    pub image: Vec<u8>,
    fields: Map<String, Value>,
}

impl ImageMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let fields = match serde_json::from_slice::<Value>(payload)? {
            Value::Object(fields) => fields,
            _ => return Err(MessageError::NotAnObject),
        };

        let gzid = required(&fields, "gzid")?;
        let img_name = required(&fields, "img_name")?;
        let device_id = required(&fields, "device_id")?;

        let create_time = required(&fields, "create_time")?;
        let create_time = NaiveDateTime::parse_from_str(&create_time, DEVICE_TIME_FORMAT)
            .map_err(|source| MessageError::InvalidTime {
                value: create_time.clone(),
                source,
            })?;

        let image = STANDARD.decode(required(&fields, "img_code")?)?;

        Ok(Self {
            gzid,
            img_name,
            device_id,
            create_time,
            image,
            fields,
        })
    }

    /// Values of `names` in order, empty for absent fields. The first value
    /// loses its file extension.
    pub fn metadata(&self, names: &[String]) -> Vec<String> {
        let mut values: Vec<String> = names
            .iter()
            .map(|name| self.fields.get(name).map(field_text).unwrap_or_default())
            .collect();

        if let Some(first) = values.first_mut() {
            if let Some((stem, _)) = first.rsplit_once('.') {
                *first = stem.to_string();
            }
        }

        values
    }
}

fn required(fields: &Map<String, Value>, name: &'static str) -> Result<String, MessageError> {
    fields
        .get(name)
        .filter(|value| !value.is_null())
        .map(field_text)
        .ok_or(MessageError::MissingField(name))
}

fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
