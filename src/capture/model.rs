//! Capture data model
//!
//! Shared types for the capture pipeline: request summaries broadcast to
//! list observers and the framed detail chunks streamed to per-request
//! observers. `DataChunk.data` is base64 on the wire so binary bodies
//! survive JSON transport.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lifecycle status of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Started,
    Receiving,
    Completed,
    Error,
}

/// Frame type of a detail chunk. Serialized as its wire code (0..5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataType {
    RequestHeader = 0,
    RequestBody = 1,
    ResponseHeader = 2,
    ResponseBody = 3,
    Metadata = 4,
    Error = 5,
}

impl DataType {
    /// Wire code used in the JSON chunk format.
    pub fn code(self) -> u8 {
        self as u8
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::RequestHeader),
            1 => Some(Self::RequestBody),
            2 => Some(Self::ResponseHeader),
            3 => Some(Self::ResponseBody),
            4 => Some(Self::Metadata),
            5 => Some(Self::Error),
            _ => None,
        }
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid data type code {code}")))
    }
}

/// Header map in the observer wire shape: name -> list of values.
pub type HeaderMapJson = BTreeMap<String, Vec<String>>;

/// Converts a hyper header map into the serializable name -> values shape.
pub fn headers_to_json(headers: &HeaderMap) -> HeaderMapJson {
    let mut map = HeaderMapJson::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// Lightweight summary of a request, broadcast on every lifecycle change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RequestStatus,
    pub method: String,
    pub host: String,
    pub url: String,
    pub content_type: String,
    pub status_code: u16,
}

impl RequestSummary {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            start_time: Utc::now(),
            end_time: None,
            status: RequestStatus::Started,
            method: String::new(),
            host: String::new(),
            url: String::new(),
            content_type: String::new(),
            status_code: 0,
        }
    }
}

/// One frame of a per-request detail stream.
///
/// Exactly one chunk per data type carries `finished: true` (the last one
/// for that type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChunk {
    pub data_type: DataType,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub finished: bool,
    pub timestamp: DateTime<Utc>,
}

impl DataChunk {
    pub fn new(data_type: DataType, data: Vec<u8>, finished: bool) -> Self {
        Self {
            data_type,
            data,
            finished,
            timestamp: Utc::now(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
