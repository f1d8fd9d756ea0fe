use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use prost::Message;
use scraper::Selector;
use serde::Deserialize;
use url::Url;

use crate::domain::{ExtractFrom, Task, TaskError, TaskKind};

const MAX_CACHE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Decoded and validated render request. Carries everything needed to build
/// an extraction task plus the caller's cache policy.
#[derive(Debug, Clone)]
pub struct Specs {
    pub url: String,
    pub selector_post: String,
    pub selector_title: String,
    pub selector_link: String,
    pub selector_created: String,
    pub created_extract_from: ExtractFrom,
    pub created_attribute_name: String,
    pub selector_description: String,
    pub selector_author: String,
    pub selector_content: String,
    pub selector_enclosure: String,
    pub cache_lifetime: Duration,
}

impl Specs {
    pub fn into_task(self, headers: BTreeMap<String, String>) -> Task {
        Task {
            kind: TaskKind::Extract,
            url: self.url,
            headers,
            selector_post: self.selector_post,
            selector_title: self.selector_title,
            selector_link: self.selector_link,
            selector_created: self.selector_created,
            created_extract_from: self.created_extract_from,
            created_attribute_name: self.created_attribute_name,
            selector_description: self.selector_description,
            selector_author: self.selector_author,
            selector_content: self.selector_content,
            selector_enclosure: self.selector_enclosure,
            salt: String::new(),
        }
    }
}

/// Version 0 wire payload: JSON. Field names accept both snake_case and the
/// camelCase the protobuf JSON mapping produces.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SpecsJson {
    url: String,
    #[serde(alias = "selectorPost")]
    selector_post: String,
    #[serde(alias = "selectorTitle")]
    selector_title: String,
    #[serde(alias = "selectorLink")]
    selector_link: String,
    #[serde(alias = "selectorCreated")]
    selector_created: String,
    #[serde(alias = "createdExtractFrom")]
    created_extract_from: ExtractFromJson,
    #[serde(alias = "createdAttributeName")]
    created_attribute_name: String,
    #[serde(alias = "selectorDescription")]
    selector_description: String,
    #[serde(alias = "selectorAuthor")]
    selector_author: String,
    #[serde(alias = "selectorContent")]
    selector_content: String,
    #[serde(alias = "selectorEnclosure")]
    selector_enclosure: String,
    #[serde(alias = "cacheLifetime")]
    cache_lifetime: String,
}

/// Accepts the enum as its protobuf number or its name.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum ExtractFromJson {
    #[default]
    Unset,
    Number(i32),
    Name(String),
}

impl ExtractFromJson {
    fn resolve(&self) -> Result<ExtractFrom, TaskError> {
        match self {
            ExtractFromJson::Unset => Ok(ExtractFrom::InnerText),
            ExtractFromJson::Number(0) => Ok(ExtractFrom::InnerText),
            ExtractFromJson::Number(1) => Ok(ExtractFrom::Attribute),
            ExtractFromJson::Number(other) => Err(TaskError::BadRequest(format!(
                "invalid extract from: {other}"
            ))),
            ExtractFromJson::Name(name) => match name.as_str() {
                "inner_text" | "InnerText" => Ok(ExtractFrom::InnerText),
                "attribute" | "Attribute" => Ok(ExtractFrom::Attribute),
                other => Err(TaskError::BadRequest(format!(
                    "invalid extract from: {other:?}"
                ))),
            },
        }
    }
}

/// Version 1 wire payload: protobuf.
#[derive(Clone, PartialEq, Message)]
struct SpecsProto {
    #[prost(string, tag = "1")]
    url: String,
    #[prost(string, tag = "2")]
    selector_post: String,
    #[prost(string, tag = "3")]
    selector_title: String,
    #[prost(string, tag = "4")]
    selector_link: String,
    #[prost(string, tag = "5")]
    selector_description: String,
    #[prost(string, tag = "6")]
    selector_author: String,
    #[prost(string, tag = "7")]
    selector_created: String,
    #[prost(enumeration = "ExtractFromProto", tag = "8")]
    created_extract_from: i32,
    #[prost(string, tag = "9")]
    created_attribute_name: String,
    #[prost(string, tag = "10")]
    selector_content: String,
    #[prost(string, tag = "11")]
    selector_enclosure: String,
    #[prost(string, tag = "12")]
    cache_lifetime: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum ExtractFromProto {
    InnerText = 0,
    Attribute = 1,
}

/// Decodes the `{specs}` path segment: `[version:]base64url(no-padding)` of
/// a deflate-compressed payload, JSON for version 0 and protobuf for 1.
pub fn decode_specs(param: &str) -> Result<Specs, TaskError> {
    let bad = |message: String| TaskError::BadRequest(message);

    let (version, encoded) = match param.split_once(':') {
        Some((version, rest)) => {
            let version: u32 = version
                .parse()
                .map_err(|_| bad(format!("invalid version: {version:?}")))?;
            (version, rest)
        }
        None => (0, param),
    };

    let compressed = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|err| bad(format!("decode specs: {err}")))?;
    let mut payload = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .read_to_end(&mut payload)
        .map_err(|err| bad(format!("inflate specs: {err}")))?;

    let specs = match version {
        0 => {
            let json: SpecsJson = serde_json::from_slice(&payload)
                .map_err(|err| bad(format!("specs json: {err}")))?;
            Specs {
                url: json.url,
                selector_post: json.selector_post,
                selector_title: json.selector_title,
                selector_link: json.selector_link,
                selector_created: json.selector_created,
                created_extract_from: json.created_extract_from.resolve()?,
                created_attribute_name: json.created_attribute_name,
                selector_description: json.selector_description,
                selector_author: json.selector_author,
                selector_content: json.selector_content,
                selector_enclosure: json.selector_enclosure,
                cache_lifetime: parse_lifetime(&json.cache_lifetime)?,
            }
        }
        1 => {
            let proto = SpecsProto::decode(payload.as_slice())
                .map_err(|err| bad(format!("specs proto: {err}")))?;
            let created_extract_from = match proto.created_extract_from() {
                ExtractFromProto::InnerText => ExtractFrom::InnerText,
                ExtractFromProto::Attribute => ExtractFrom::Attribute,
            };
            Specs {
                url: proto.url,
                selector_post: proto.selector_post,
                selector_title: proto.selector_title,
                selector_link: proto.selector_link,
                selector_created: proto.selector_created,
                created_extract_from,
                created_attribute_name: proto.created_attribute_name,
                selector_description: proto.selector_description,
                selector_author: proto.selector_author,
                selector_content: proto.selector_content,
                selector_enclosure: proto.selector_enclosure,
                cache_lifetime: parse_lifetime(&proto.cache_lifetime)?,
            }
        }
        other => return Err(bad(format!("unknown version: {other}"))),
    };

    validate(&specs)?;
    Ok(specs)
}

fn validate(specs: &Specs) -> Result<(), TaskError> {
    let parsed = Url::parse(&specs.url)
        .map_err(|err| TaskError::BadRequest(format!("specs url: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(TaskError::BadRequest(format!(
            "specs url: unsupported scheme {:?}",
            parsed.scheme()
        )));
    }

    for (name, selector, required) in [
        ("selector_post", &specs.selector_post, true),
        ("selector_title", &specs.selector_title, true),
        ("selector_link", &specs.selector_link, true),
        ("selector_created", &specs.selector_created, true),
        ("selector_description", &specs.selector_description, false),
        ("selector_author", &specs.selector_author, false),
        ("selector_content", &specs.selector_content, false),
        ("selector_enclosure", &specs.selector_enclosure, false),
    ] {
        if selector.trim().is_empty() {
            if required {
                return Err(TaskError::BadRequest(format!("{name} is required")));
            }
            continue;
        }
        if Selector::parse(selector).is_err() {
            return Err(TaskError::BadRequest(format!(
                "{name}: invalid selector {selector:?}"
            )));
        }
    }

    if specs.created_extract_from == ExtractFrom::Attribute
        && specs.created_attribute_name.trim().is_empty()
    {
        return Err(TaskError::BadRequest(
            "created_attribute_name is required when extracting from an attribute".to_string(),
        ));
    }
    Ok(())
}

/// Parses a cache-lifetime duration string and clamps it to `[0, 24h]`.
fn parse_lifetime(raw: &str) -> Result<Duration, TaskError> {
    let trimmed = raw.trim();
    let lifetime = if trimmed == "0" {
        Duration::ZERO
    } else {
        humantime::parse_duration(trimmed)
            .map_err(|_| TaskError::BadRequest(format!("invalid cache lifetime: {raw:?}")))?
    };
    Ok(lifetime.min(MAX_CACHE_LIFETIME))
}

#[cfg(test)]
mod tests {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    use crate::domain::task::FORWARDED_HEADERS;

    use super::*;

    fn pack(version: Option<u32>, payload: &[u8]) -> String {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();
        let encoded = URL_SAFE_NO_PAD.encode(compressed);
        match version {
            Some(version) => format!("{version}:{encoded}"),
            None => encoded,
        }
    }

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "url": "https://example.com/blog",
            "selector_post": "article",
            "selector_title": "h1",
            "selector_link": "a",
            "selector_created": "time",
            "created_extract_from": 1,
            "created_attribute_name": "datetime",
            "cache_lifetime": "1h"
        })
    }

    #[test]
    fn decodes_version_zero_json() {
        let param = pack(None, sample_json().to_string().as_bytes());
        let specs = decode_specs(&param).unwrap();
        assert_eq!(specs.url, "https://example.com/blog");
        assert_eq!(specs.created_extract_from, ExtractFrom::Attribute);
        assert_eq!(specs.cache_lifetime, Duration::from_secs(3600));
    }

    #[test]
    fn decodes_camel_case_field_names() {
        let payload = serde_json::json!({
            "url": "https://example.com/",
            "selectorPost": "article",
            "selectorTitle": "h1",
            "selectorLink": "a",
            "selectorCreated": "time",
            "createdExtractFrom": "inner_text",
            "cacheLifetime": "30m"
        });
        let param = pack(Some(0), payload.to_string().as_bytes());
        let specs = decode_specs(&param).unwrap();
        assert_eq!(specs.selector_post, "article");
        assert_eq!(specs.created_extract_from, ExtractFrom::InnerText);
    }

    #[test]
    fn decodes_version_one_protobuf() {
        let proto = SpecsProto {
            url: "https://example.com/".to_string(),
            selector_post: "article".to_string(),
            selector_title: "h1".to_string(),
            selector_link: "a".to_string(),
            selector_created: "time".to_string(),
            created_extract_from: ExtractFromProto::Attribute as i32,
            created_attribute_name: "datetime".to_string(),
            cache_lifetime: "12h".to_string(),
            ..Default::default()
        };
        let param = pack(Some(1), &proto.encode_to_vec());
        let specs = decode_specs(&param).unwrap();
        assert_eq!(specs.created_extract_from, ExtractFrom::Attribute);
        assert_eq!(specs.cache_lifetime, Duration::from_secs(12 * 3600));
    }

    #[test]
    fn lifetime_is_clamped_to_a_day() {
        let mut payload = sample_json();
        payload["cache_lifetime"] = "72h".into();
        let param = pack(None, payload.to_string().as_bytes());
        let specs = decode_specs(&param).unwrap();
        assert_eq!(specs.cache_lifetime, MAX_CACHE_LIFETIME);
    }

    #[test]
    fn zero_lifetime_is_accepted() {
        let mut payload = sample_json();
        payload["cache_lifetime"] = "0".into();
        let param = pack(None, payload.to_string().as_bytes());
        assert_eq!(decode_specs(&param).unwrap().cache_lifetime, Duration::ZERO);
    }

    #[test]
    fn rejects_bad_lifetimes_selectors_and_versions() {
        let mut payload = sample_json();
        payload["cache_lifetime"] = "soon".into();
        assert!(decode_specs(&pack(None, payload.to_string().as_bytes())).is_err());

        let mut payload = sample_json();
        payload["selector_post"] = "div[".into();
        assert!(decode_specs(&pack(None, payload.to_string().as_bytes())).is_err());

        let payload = sample_json();
        assert!(decode_specs(&pack(Some(7), payload.to_string().as_bytes())).is_err());
    }

    #[test]
    fn rejects_attribute_mode_without_an_attribute_name() {
        let mut payload = sample_json();
        payload["created_attribute_name"] = "".into();
        assert!(decode_specs(&pack(None, payload.to_string().as_bytes())).is_err());
    }

    #[test]
    fn rejects_garbage_encodings() {
        assert!(decode_specs("!!!not-base64!!!").is_err());
        assert!(decode_specs("x:abc").is_err());
        let raw = URL_SAFE_NO_PAD.encode(b"not deflate data");
        assert!(decode_specs(&raw).is_err());
    }

    #[test]
    fn built_task_carries_the_forwarded_headers() {
        let param = pack(None, sample_json().to_string().as_bytes());
        let specs = decode_specs(&param).unwrap();
        let headers = BTreeMap::from([("Cookie".to_string(), "s=1".to_string())]);
        let task = specs.into_task(headers);
        assert_eq!(task.kind, TaskKind::Extract);
        assert_eq!(task.headers.get("Cookie").unwrap(), "s=1");
        assert!(FORWARDED_HEADERS.contains(&"Cookie"));
    }
}
