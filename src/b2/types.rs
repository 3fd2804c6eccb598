//! B2 API response types

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};

/// Deserialize a number that might be encoded as a string or null.
/// B2 API sometimes returns numeric fields as strings (e.g. "1536964279000")
/// and may return null for folder/hide entries.
fn deserialize_flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct FlexibleU64Visitor;

    impl<'de> de::Visitor<'de> for FlexibleU64Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a u64, a string containing a u64, or null")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u64, E> {
            u64::try_from(value).map_err(|_| de::Error::custom("negative value for u64"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<u64, E> {
            value.parse::<u64>().map_err(de::Error::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }

        fn visit_unit<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }
    }

    deserializer.deserialize_any(FlexibleU64Visitor)
}

/// A stored blob as reported by list and upload calls
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Full file path within the bucket (our storage path)
    pub file_name: String,
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub content_length: u64,
    /// Upload timestamp in milliseconds since epoch
    #[serde(default, deserialize_with = "deserialize_flexible_u64")]
    pub upload_timestamp: u64,
    /// Null for folder entries
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Custom `X-Bz-Info-*` headers stored with the file
    #[serde(default)]
    pub file_info: HashMap<String, String>,
}

impl FileInfo {
    /// Owner tag recorded at upload time
    pub fn owner_tag(&self) -> Option<&str> {
        self.file_info.get("owner").map(String::as_str)
    }
}

/// Response from b2_list_file_names API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesResponse {
    pub files: Vec<FileInfo>,
    /// Next file name for pagination (None if no more files)
    pub next_file_name: Option<String>,
}

/// Upload URL from B2 (for uploading files)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadUrl {
    pub upload_url: String,
    pub authorization_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_response_with_owner_tag() {
        let json = r#"{
            "accountId": "12345",
            "bucketId": "bucket123",
            "fileName": "U1/6f1c/report.pdf",
            "contentLength": 2048,
            "uploadTimestamp": 1536964279000,
            "action": "upload",
            "fileId": "4_abc123",
            "contentType": "application/pdf",
            "contentSha1": "abc123",
            "fileInfo": {"owner": "U1"}
        }"#;
        let info: FileInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.file_name, "U1/6f1c/report.pdf");
        assert_eq!(info.content_length, 2048);
        assert_eq!(info.file_id.as_deref(), Some("4_abc123"));
        assert_eq!(info.owner_tag(), Some("U1"));
    }

    #[test]
    fn test_list_response_with_string_numbers_and_folders() {
        let json = r#"{
            "files": [
                {
                    "fileName": "U1/6f1c/notes.txt",
                    "contentLength": "7",
                    "uploadTimestamp": "1536964279000",
                    "action": "upload",
                    "fileId": "4_abc",
                    "contentType": "text/plain"
                },
                {
                    "fileName": "U1/",
                    "contentLength": 0,
                    "uploadTimestamp": null,
                    "action": "folder",
                    "fileId": null,
                    "contentType": null
                }
            ],
            "nextFileName": "U1/zzz"
        }"#;
        let resp: ListFilesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.files.len(), 2);
        assert_eq!(resp.files[0].content_length, 7);
        assert_eq!(resp.files[0].upload_timestamp, 1536964279000);
        assert_eq!(resp.files[1].file_id, None);
        assert!(resp.files[1].owner_tag().is_none());
        assert_eq!(resp.next_file_name.as_deref(), Some("U1/zzz"));
    }
}
