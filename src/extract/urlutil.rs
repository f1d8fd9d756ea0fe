use std::net::IpAddr;

use url::Url;

use crate::domain::TaskError;

/// Resolves `link` against `base`, returning absolute URLs untouched and
/// empty/unparseable input as-is. Never fails; extraction treats URL quality
/// as best-effort.
pub fn abs_url(link: &str, base: Option<&Url>) -> String {
    let link = link.trim();
    if link.is_empty() {
        return String::new();
    }
    if let Ok(parsed) = Url::parse(link) {
        return parsed.to_string();
    }
    match base {
        Some(base) => base
            .join(link)
            .map(|joined| joined.to_string())
            .unwrap_or_else(|_| link.to_string()),
        None => link.to_string(),
    }
}

/// Extracts the rate-limiter key from a page URL: the last two host labels
/// (an eTLD+1 approximation), or the literal when the host is an IP.
/// Only http and https URLs are accepted.
pub fn base_domain(raw_url: &str) -> Result<(String, String), TaskError> {
    let parsed = Url::parse(raw_url)
        .map_err(|err| TaskError::BadRequest(format!("task url: {err}")))?;
    let scheme = parsed.scheme().to_string();
    if scheme != "http" && scheme != "https" {
        return Err(TaskError::BadRequest(format!("bad scheme: {scheme}")));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| TaskError::BadRequest("url has no host".to_string()))?
        .to_lowercase();
    let host = host.trim_matches(|c| c == '[' || c == ']').to_string();
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok((ip.to_string(), scheme));
    }
    let mut labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return Ok((host, scheme));
    }
    let tail = labels.split_off(labels.len() - 2);
    Ok((tail.join("."), scheme))
}
