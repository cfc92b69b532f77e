use std::fmt;
use std::str::FromStr;

use mongodb::bson::oid::ObjectId;
use mongodb::bson::{self, Bson, Document};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::error::QueueError;

/// Lifecycle status of a queue item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum QueueItemStatus {
    Queued,
    Spooled,
    Headers,
    Downloaded,
    Redirected,
    NotFound,
    Failed,
    #[default]
    Created,
    Timeout,
    DownloadPrevented,
    /// Claimed by a worker and not yet resolved
    Pulled,
    /// Any status name written by a client this crate does not know about
    Other(String),
}

impl QueueItemStatus {
    pub const ALL: [QueueItemStatus; 11] = [
        Self::Queued,
        Self::Spooled,
        Self::Headers,
        Self::Downloaded,
        Self::Redirected,
        Self::NotFound,
        Self::Failed,
        Self::Created,
        Self::Timeout,
        Self::DownloadPrevented,
        Self::Pulled,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Spooled => "spooled",
            Self::Headers => "headers",
            Self::Downloaded => "downloaded",
            Self::Redirected => "redirected",
            Self::NotFound => "notfound",
            Self::Failed => "failed",
            Self::Created => "created",
            Self::Timeout => "timeout",
            Self::DownloadPrevented => "downloadprevented",
            Self::Pulled => "pulled",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for QueueItemStatus {
    fn from(name: String) -> Self {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == name)
            .unwrap_or(Self::Other(name))
    }
}

impl From<QueueItemStatus> for String {
    fn from(status: QueueItemStatus) -> Self {
        match status {
            QueueItemStatus::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric stateData fields that aggregate queries may target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllowedStatistic {
    ActualDataSize,
    ContentLength,
    DownloadTime,
    RequestLatency,
    RequestTime,
}

impl AllowedStatistic {
    pub const ALL: [AllowedStatistic; 5] = [
        Self::ActualDataSize,
        Self::ContentLength,
        Self::DownloadTime,
        Self::RequestLatency,
        Self::RequestTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActualDataSize => "actualDataSize",
            Self::ContentLength => "contentLength",
            Self::DownloadTime => "downloadTime",
            Self::RequestLatency => "requestLatency",
            Self::RequestTime => "requestTime",
        }
    }

    /// Dotted path of the field inside a stored item
    pub fn field_path(&self) -> String {
        format!("stateData.{}", self.as_str())
    }
}

impl FromStr for AllowedStatistic {
    type Err = QueueError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stat| stat.as_str() == name)
            .ok_or_else(|| QueueError::InvalidStatistic(name.to_string()))
    }
}

impl fmt::Display for AllowedStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation applied by statistic queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregator {
    Max,
    Min,
    Avg,
}

impl Aggregator {
    pub const ALL: [Aggregator; 3] = [Self::Max, Self::Min, Self::Avg];

    /// Group accumulator operator
    pub fn operator(&self) -> &'static str {
        match self {
            Self::Max => "$max",
            Self::Min => "$min",
            Self::Avg => "$avg",
        }
    }

    /// Suffix used for snapshot field names, e.g. `downloadTimeMax`
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Max => "Max",
            Self::Min => "Min",
            Self::Avg => "Avg",
        }
    }
}

/// Request/response metrics, populated as the crawler processes an item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateData {
    /// Time (ms) until headers were received
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub request_latency: Option<f64>,

    /// Total request time (ms), download included
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub request_time: Option<f64>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub download_time: Option<f64>,

    /// Length announced by the content-length header
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub content_length: Option<i64>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// HTTP status code, 600 when the fetch itself failed
    #[serde(rename = "code", default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub response_code: Option<i32>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub headers: Option<Document>,

    /// Bytes actually received
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub actual_data_size: Option<i64>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub sent_incorrect_size: Option<bool>,
}

/// A unit of crawl work as stored in the queue collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Assigned by the store on insert
    #[serde(rename = "_id", default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    /// Canonical URL, the natural deduplication key
    pub url: String,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Path including the query string
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Path without the query string
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub uri_path: Option<String>,

    /// Steps from the crawl root, which has depth 1
    #[serde(default = "default_depth", deserialize_with = "lenient_depth")]
    pub depth: u32,

    /// URL of the page this one was discovered on
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub fetched: bool,

    #[serde(default, deserialize_with = "lenient")]
    pub status: QueueItemStatus,

    #[serde(default, deserialize_with = "lenient")]
    pub state_data: StateData,

    /// Epoch millis of the last write
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub modification_timestamp: Option<i64>,

    /// Name of the last writer
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
}

fn default_depth() -> u32 {
    1
}

// Stored items may have been written by other clients, and a write that went
// through must always read back. A field that does not fit its type falls back
// to its default instead of failing the whole item.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(convert(Bson::deserialize(deserializer)?).unwrap_or_default())
}

fn lenient_depth<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(convert(Bson::deserialize(deserializer)?).unwrap_or_else(default_depth))
}

/// Read `raw` as `T`, accepting whole doubles where integers are expected
fn convert<T: DeserializeOwned>(raw: Bson) -> Option<T> {
    match bson::from_bson(raw.clone()) {
        Ok(value) => Some(value),
        Err(_) => match raw {
            Bson::Double(v) if v.is_finite() && v.fract() == 0.0 => bson::from_bson(Bson::Int64(v as i64)).ok(),
            _ => None,
        },
    }
}

impl QueueItem {
    /// Build an unqueued item for `url`, splitting it into its addressing fields
    pub fn from_url(url: &str, depth: u32, referrer: Option<&str>) -> Result<Self, url::ParseError> {
        let parsed = Url::parse(url)?;

        let path = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };

        Ok(Self {
            url: parsed.to_string(),
            protocol: Some(parsed.scheme().to_string()),
            host: parsed.host_str().map(str::to_string),
            port: parsed.port_or_known_default(),
            path: Some(path),
            uri_path: Some(parsed.path().to_string()),
            depth,
            referrer: referrer.map(str::to_string),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson;

    #[test]
    fn test_from_url_splits_components() {
        let item = QueueItem::from_url("https://example.com/a/b?x=1#frag", 2, Some("https://example.com/")).unwrap();

        assert_eq!(item.protocol.as_deref(), Some("https"));
        assert_eq!(item.host.as_deref(), Some("example.com"));
        assert_eq!(item.port, Some(443));
        assert_eq!(item.path.as_deref(), Some("/a/b?x=1"));
        assert_eq!(item.uri_path.as_deref(), Some("/a/b"));
        assert_eq!(item.depth, 2);
        assert_eq!(item.status, QueueItemStatus::Created);
        assert!(item.id.is_none());
    }

    #[test]
    fn test_stored_field_names() {
        let mut item = QueueItem::from_url("http://127.0.0.1:3000/stage", 1, None).unwrap();
        item.state_data.response_code = Some(200);
        item.state_data.download_time = Some(12.0);
        item.status = QueueItemStatus::NotFound;

        let doc = bson::to_document(&item).unwrap();
        assert!(doc.get("_id").is_none());
        assert_eq!(doc.get_str("uriPath").unwrap(), "/stage");
        assert_eq!(doc.get_str("status").unwrap(), "notfound");

        let state = doc.get_document("stateData").unwrap();
        assert_eq!(state.get_i32("code").unwrap(), 200);
        assert_eq!(state.get_f64("downloadTime").unwrap(), 12.0);
        assert!(state.get("contentType").is_none());

        let back: QueueItem = bson::from_document(doc).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_foreign_records_still_decode() {
        let doc = bson::doc! {
            "_id": ObjectId::new(),
            "url": "http://example.com/",
            "status": "blablba",
            "depth": 2.0,
            "port": 8080.0,
            "fetched": "yes",
            "stateData": { "code": 404.0, "downloadTime": 3, "contentLength": "n/a" },
        };

        let item: QueueItem = bson::from_document(doc).unwrap();

        assert_eq!(item.status, QueueItemStatus::Other("blablba".into()));
        assert_eq!(item.depth, 2);
        assert_eq!(item.port, Some(8080));
        assert!(!item.fetched);
        assert_eq!(item.state_data.response_code, Some(404));
        assert_eq!(item.state_data.download_time, Some(3.0));
        assert_eq!(item.state_data.content_length, None);

        let half: QueueItem = bson::from_document(bson::doc! { "url": "http://example.com/", "depth": 1.5 }).unwrap();
        assert_eq!(half.depth, 1);
        assert_eq!(half.status, QueueItemStatus::Created);
    }

    #[test]
    fn test_unknown_status_is_stored_verbatim() {
        assert_eq!(QueueItemStatus::from("notfound".to_string()), QueueItemStatus::NotFound);

        let mut item = QueueItem::from_url("http://example.com/", 1, None).unwrap();
        item.status = QueueItemStatus::Other("archived".into());
        let doc = bson::to_document(&item).unwrap();
        assert_eq!(doc.get_str("status").unwrap(), "archived");
    }

    #[test]
    fn test_statistic_names() {
        assert_eq!("downloadTime".parse::<AllowedStatistic>().unwrap(), AllowedStatistic::DownloadTime);
        let err = "humdidum".parse::<AllowedStatistic>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidStatistic);
        assert_eq!(AllowedStatistic::RequestTime.field_path(), "stateData.requestTime");
    }
}
