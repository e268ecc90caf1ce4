//! Wire types of the REST API

use bridge_traits::RemoteRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A record as the API returns it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEnvelope {
    pub version: u64,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl From<RecordEnvelope> for RemoteRecord {
    fn from(envelope: RecordEnvelope) -> Self {
        RemoteRecord {
            version: envelope.version,
            payload: envelope.payload,
            updated_at: envelope.updated_at,
        }
    }
}

/// `PUT` request body
#[derive(Debug, Serialize)]
pub struct WriteBody<'a> {
    pub payload: &'a Value,
}

/// Body of a successful write or delete
#[derive(Debug, Deserialize)]
pub struct VersionBody {
    pub version: u64,
}

/// Version carried by an `ETag` header: `"7"` or `W/"7"`
pub fn parse_etag(etag: &str) -> Option<u64> {
    etag.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .parse()
        .ok()
}

/// `If-Match` value for `version`
pub fn etag_for(version: u64) -> String {
    format!("\"{}\"", version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_parsing() {
        let envelope: RecordEnvelope = serde_json::from_value(json!({
            "version": 4,
            "payload": { "name": "Car" },
            "updatedAt": "2024-06-01T12:00:00Z"
        }))
        .unwrap();

        let record = RemoteRecord::from(envelope);
        assert_eq!(record.version, 4);
        assert_eq!(record.payload, json!({ "name": "Car" }));
    }

    #[test]
    fn test_etag_round_trip() {
        assert_eq!(parse_etag(&etag_for(7)), Some(7));
        assert_eq!(parse_etag("W/\"12\""), Some(12));
        assert_eq!(parse_etag("abc"), None);
    }
}
