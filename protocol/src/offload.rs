//! On-disk shapes for an offloaded vector index (spec §3 "Offloaded index").
//!
//! Three files share a `<namespace>:<id>` prefix:
//! - `*.metadata.json`  → [`OffloadMetadata`]
//! - `*.documents.json` → `Vec<`[`DocumentRecord`]`>` (no vectors)
//! - `*.vectors.bin`    → binary, laid out by `engine_core::vector::offload`

use crate::permission::Permission;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub const OFFLOAD_FORMAT: &str = "binary_v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OffloadMetadata {
    pub format: String,
    pub document_count: usize,
    pub embedding_dimension: usize,
    pub created_at: DateTime<Utc>,
    pub offloaded_at: DateTime<Utc>,
    pub namespace: String,
    pub permission: Permission,
}

impl OffloadMetadata {
    pub fn new(
        document_count: usize,
        embedding_dimension: usize,
        created_at: DateTime<Utc>,
        offloaded_at: DateTime<Utc>,
        namespace: impl Into<String>,
        permission: Permission,
    ) -> Self {
        Self {
            format: OFFLOAD_FORMAT.to_string(),
            document_count,
            embedding_dimension,
            created_at,
            offloaded_at,
            namespace: namespace.into(),
            permission,
        }
    }
}

/// One document's non-vector payload, in the order it appears in
/// `*.documents.json` and `*.vectors.bin`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips_through_json() {
        let now = DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_else(|| Utc::now());
        let meta = OffloadMetadata::new(2, 32, now, now, "t", Permission::PublicRead);
        let json = serde_json::to_string(&meta).unwrap_or_else(|e| panic!("{e}"));
        let back: OffloadMetadata = serde_json::from_str(&json).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(meta, back);
        assert_eq!(meta.format, OFFLOAD_FORMAT);
    }

    #[test]
    fn metadata_json_keys_are_camel_case() {
        let now = DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_else(|| Utc::now());
        let meta = OffloadMetadata::new(2, 32, now, now, "t", Permission::PublicRead);
        let json = serde_json::to_value(&meta).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(json["documentCount"], 2);
        assert_eq!(json["embeddingDimension"], 32);
        assert!(json.get("createdAt").is_some());
        assert!(json.get("offloadedAt").is_some());
    }
}
