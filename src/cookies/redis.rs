use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};

use crate::domain::TaskError;
use crate::extract::base_domain;

use super::{parse_cookie_header, CookieStore};

/// Jars live for a month of inactivity before Redis reclaims them.
const JAR_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub struct RedisCookieStore {
    conn: MultiplexedConnection,
}

impl RedisCookieStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    fn jar_key(key: &str, cookie_header: &str) -> String {
        // Jars are per origin: callers pass one, and a full page URL is
        // reduced here so every page of an authenticated site shares its
        // session. The client's raw Cookie header fingerprints the jar, so
        // different users of one site never share cookies.
        let origin = match base_domain(key) {
            Ok((domain, scheme)) => format!("{scheme}://{domain}"),
            Err(_) => key.to_string(),
        };
        let mut hasher = Sha256::new();
        hasher.update(origin.as_bytes());
        hasher.update([0]);
        hasher.update(cookie_header.as_bytes());
        format!("cookies:{:x}", hasher.finalize())
    }
}

#[async_trait]
impl CookieStore for RedisCookieStore {
    async fn get(
        &self,
        key: &str,
        cookie_header: &str,
    ) -> Result<Vec<(String, String)>, TaskError> {
        let jar_key = Self::jar_key(key, cookie_header);
        let mut conn = self.conn.clone();
        let stored: HashMap<String, String> = conn
            .hgetall(&jar_key)
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;

        if !stored.is_empty() {
            return Ok(stored.into_iter().collect());
        }

        // Unknown jar: seed it from the client's own header.
        let seeded = parse_cookie_header(cookie_header);
        if !seeded.is_empty() {
            self.update(key, cookie_header, &seeded).await?;
        }
        Ok(seeded)
    }

    async fn update(
        &self,
        key: &str,
        cookie_header: &str,
        cookies: &[(String, String)],
    ) -> Result<(), TaskError> {
        let jar_key = Self::jar_key(key, cookie_header);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(&jar_key);
        if !cookies.is_empty() {
            pipe.hset_multiple(&jar_key, cookies);
            pipe.expire(&jar_key, JAR_TTL.as_secs() as i64);
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|err| TaskError::CacheUnavailable(err.to_string()))?;
        Ok(())
    }
}
