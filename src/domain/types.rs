use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One extracted post. Items missing `title`, `link` or a usable `created`
/// timestamp are dropped before they ever reach a result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_link: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub enclosure: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub title: String,
    #[serde(default)]
    pub icon: String,
    pub items: Vec<FeedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotResult {
    #[serde(with = "base64_bytes")]
    pub image: Vec<u8>,
}

/// PNG payloads travel through the JSON cache as base64 text rather than
/// integer arrays.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screenshot_image_round_trips_as_base64() {
        let result = ScreenshotResult {
            image: vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a],
        };
        let encoded = serde_json::to_string(&result).unwrap();
        assert!(encoded.contains("iVBORw0K"));
        let decoded: ScreenshotResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.image, result.image);
    }
}
