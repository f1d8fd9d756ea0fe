use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Request headers forwarded from the client into a task. Only these two are
/// ever copied; everything else the client sent stays at the API edge.
pub const FORWARDED_HEADERS: [&str; 2] = ["Accept-Language", "Cookie"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Extract,
    Screenshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractFrom {
    InnerText,
    Attribute,
}

impl Default for ExtractFrom {
    fn default() -> Self {
        ExtractFrom::InnerText
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub selector_post: String,
    #[serde(default)]
    pub selector_title: String,
    #[serde(default)]
    pub selector_link: String,
    #[serde(default)]
    pub selector_created: String,
    #[serde(default)]
    pub created_extract_from: ExtractFrom,
    #[serde(default)]
    pub created_attribute_name: String,
    #[serde(default)]
    pub selector_description: String,
    #[serde(default)]
    pub selector_author: String,
    #[serde(default)]
    pub selector_content: String,
    #[serde(default)]
    pub selector_enclosure: String,
    /// Random for screenshot tasks so they never coalesce; empty otherwise.
    /// Stored in the task so producer and worker derive the same key.
    #[serde(default)]
    pub salt: String,
}

impl Task {
    pub fn screenshot(url: String, headers: BTreeMap<String, String>) -> Self {
        Task {
            kind: TaskKind::Screenshot,
            url,
            headers,
            selector_post: String::new(),
            selector_title: String::new(),
            selector_link: String::new(),
            selector_created: String::new(),
            created_extract_from: ExtractFrom::InnerText,
            created_attribute_name: String::new(),
            selector_description: String::new(),
            selector_author: String::new(),
            selector_content: String::new(),
            selector_enclosure: String::new(),
            salt: format!("{:032x}", rand::random::<u128>()),
        }
    }

    /// Stable hash over every field that influences the task's output.
    /// Two tasks that would produce byte-identical results share a key.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        let kind = match self.kind {
            TaskKind::Extract => "extract",
            TaskKind::Screenshot => "screenshot",
        };
        hash_field(&mut hasher, kind);
        hash_field(&mut hasher, &self.url);
        for name in FORWARDED_HEADERS {
            hash_field(&mut hasher, self.headers.get(name).map(String::as_str).unwrap_or(""));
        }
        hash_field(&mut hasher, &self.selector_post);
        hash_field(&mut hasher, &self.selector_title);
        hash_field(&mut hasher, &self.selector_link);
        hash_field(&mut hasher, &self.selector_created);
        let extract_from = match self.created_extract_from {
            ExtractFrom::InnerText => "inner_text",
            ExtractFrom::Attribute => "attribute",
        };
        hash_field(&mut hasher, extract_from);
        hash_field(&mut hasher, &self.created_attribute_name);
        hash_field(&mut hasher, &self.selector_description);
        hash_field(&mut hasher, &self.selector_author);
        hash_field(&mut hasher, &self.selector_content);
        hash_field(&mut hasher, &self.selector_enclosure);
        hash_field(&mut hasher, &self.salt);
        format!("{:x}", hasher.finalize())
    }
}

fn hash_field(hasher: &mut Sha256, value: &str) {
    // Length prefix keeps adjacent fields from colliding ("ab","c" vs "a","bc").
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            kind: TaskKind::Extract,
            url: "https://example.com/blog".to_string(),
            headers: BTreeMap::from([("Accept-Language".to_string(), "en".to_string())]),
            selector_post: "article".to_string(),
            selector_title: "h1".to_string(),
            selector_link: "a".to_string(),
            selector_created: "time".to_string(),
            created_extract_from: ExtractFrom::Attribute,
            created_attribute_name: "datetime".to_string(),
            selector_description: String::new(),
            selector_author: String::new(),
            selector_content: String::new(),
            selector_enclosure: String::new(),
            salt: String::new(),
        }
    }

    #[test]
    fn cache_key_is_deterministic() {
        let task = sample_task();
        assert_eq!(task.cache_key(), task.clone().cache_key());
    }

    #[test]
    fn cache_key_changes_with_every_output_field() {
        let base = sample_task().cache_key();

        let mut task = sample_task();
        task.url = "https://example.com/news".to_string();
        assert_ne!(task.cache_key(), base);

        let mut task = sample_task();
        task.selector_post = "div.post".to_string();
        assert_ne!(task.cache_key(), base);

        let mut task = sample_task();
        task.created_extract_from = ExtractFrom::InnerText;
        assert_ne!(task.cache_key(), base);

        let mut task = sample_task();
        task.headers.insert("Cookie".to_string(), "session=1".to_string());
        assert_ne!(task.cache_key(), base);
    }

    #[test]
    fn adjacent_fields_do_not_collide() {
        let mut left = sample_task();
        left.selector_title = "h1.a".to_string();
        left.selector_link = "b".to_string();
        let mut right = sample_task();
        right.selector_title = "h1.ab".to_string();
        right.selector_link = String::new();
        assert_ne!(left.cache_key(), right.cache_key());
    }

    #[test]
    fn screenshot_tasks_never_share_a_key() {
        let first = Task::screenshot("https://example.com".to_string(), BTreeMap::new());
        let second = Task::screenshot("https://example.com".to_string(), BTreeMap::new());
        assert_ne!(first.cache_key(), second.cache_key());
    }

    #[test]
    fn task_round_trips_through_json() {
        let task = sample_task();
        let encoded = serde_json::to_vec(&task).unwrap();
        let decoded: Task = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.cache_key(), task.cache_key());
    }
}
