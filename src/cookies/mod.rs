mod dummy;
mod redis;

use async_trait::async_trait;

use crate::domain::TaskError;

pub use dummy::DummyCookieStore;
pub use self::redis::RedisCookieStore;

/// Shared cookie jars, keyed by target URL plus a fingerprint of the
/// client's own Cookie header, so two authenticated users of the same site
/// keep independent jars. Failures here must never fail an extraction.
#[async_trait]
pub trait CookieStore: Send + Sync {
    /// Returns the stored cookies for this key, seeding the jar from the
    /// incoming Cookie header when the key is unknown.
    async fn get(
        &self,
        key: &str,
        cookie_header: &str,
    ) -> Result<Vec<(String, String)>, TaskError>;

    /// Replaces the stored cookie set.
    async fn update(
        &self,
        key: &str,
        cookie_header: &str,
        cookies: &[(String, String)],
    ) -> Result<(), TaskError>;
}

/// Splits a raw `Cookie` request header into name/value pairs.
/// Malformed fragments are skipped.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}
