// SPDX-License-Identifier: GPL-3.0-only

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File name of the per-snapshot metadata document
pub const SNAPSHOT_INFO_FILE: &str = ".SNAPSHOTINFO";

/// Sidecar metadata recorded with every snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Raw label, including the tenant prefix
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "TenantID")]
    pub tenant_id: String,

    /// Label without the tenant prefix
    #[serde(rename = "Label")]
    pub label: String,

    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,

    #[serde(rename = "Message", default)]
    pub message: String,

    #[serde(rename = "Created")]
    pub created: DateTime<Utc>,
}

impl SnapshotInfo {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|candidate| candidate == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_documents_with_go_style_keys() {
        let raw = r#"{"Name":"app_v1","TenantID":"app","Label":"v1","Tags":["live"],"Message":"nightly","Created":"2024-03-01T10:00:00Z"}"#;
        let info: SnapshotInfo = serde_json::from_str(raw).expect("decode");

        assert_eq!(info.name, "app_v1");
        assert_eq!(info.tenant_id, "app");
        assert!(info.has_tag("live"));

        let encoded = serde_json::to_string(&info).expect("encode");
        assert!(encoded.contains("\"TenantID\":\"app\""));
    }

    #[test]
    fn missing_tags_default_to_empty() {
        let raw = r#"{"Name":"app_v1","TenantID":"app","Label":"v1","Created":"2024-03-01T10:00:00Z"}"#;
        let info: SnapshotInfo = serde_json::from_str(raw).expect("decode");
        assert!(info.tags.is_empty());
        assert!(info.message.is_empty());
    }
}
