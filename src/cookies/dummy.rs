use async_trait::async_trait;

use crate::domain::TaskError;

use super::{parse_cookie_header, CookieStore};

/// No-op store for local tool runs: serves the incoming header back,
/// persists nothing.
#[derive(Default)]
pub struct DummyCookieStore;

impl DummyCookieStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CookieStore for DummyCookieStore {
    async fn get(
        &self,
        _key: &str,
        cookie_header: &str,
    ) -> Result<Vec<(String, String)>, TaskError> {
        Ok(parse_cookie_header(cookie_header))
    }

    async fn update(
        &self,
        _key: &str,
        _cookie_header: &str,
        _cookies: &[(String, String)],
    ) -> Result<(), TaskError> {
        Ok(())
    }
}
