//! Request checks shared by the handlers.

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::ApiError;

/// `|now - timestamp| <= window`, in seconds.
pub fn check_timestamp(timestamp: i64, now: DateTime<Utc>, window_secs: i64) -> Result<(), ApiError> {
    let skew = now.timestamp().saturating_sub(timestamp).saturating_abs();
    if skew > window_secs {
        return Err(ApiError::TimestampInvalid);
    }
    Ok(())
}

pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::TokenInvalid)?;
    let token = value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::TokenInvalid)?;
    Ok(token)
}

pub fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing header {name}")))
}

/// Remembers values (nonces, signatures) for as long as a request carrying
/// them could still pass the timestamp check.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: Mutex<HashMap<String, i64>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `key` is new. The key is then held until `now + window`.
    pub fn check_and_store(&self, key: &str, now: DateTime<Utc>, window_secs: i64) -> bool {
        let now = now.timestamp();
        let mut seen = self.seen.lock();
        if let Some(until) = seen.get(key) {
            if *until >= now {
                return false;
            }
        }
        seen.insert(key.to_string(), now.saturating_add(window_secs));
        true
    }

    pub fn prune(&self, now: DateTime<Utc>) {
        let now = now.timestamp();
        self.seen.lock().retain(|_, until| *until >= now);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Duration;

    #[test]
    fn timestamp_window_is_inclusive() {
        let now = Utc::now();
        let ts = now.timestamp();
        assert!(check_timestamp(ts - 300, now, 300).is_ok());
        assert!(check_timestamp(ts + 300, now, 300).is_ok());
        assert!(matches!(check_timestamp(ts - 301, now, 300), Err(ApiError::TimestampInvalid)));
        assert!(matches!(check_timestamp(ts + 301, now, 300), Err(ApiError::TimestampInvalid)));
        assert!(check_timestamp(i64::MIN, now, 300).is_err());
    }

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_err());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def");
    }

    #[test]
    fn replay_guard_expires_entries() {
        let guard = ReplayGuard::new();
        let now = Utc::now();
        assert!(guard.check_and_store("n1", now, 300));
        assert!(!guard.check_and_store("n1", now + Duration::seconds(10), 300));
        assert_eq!(guard.len(), 1);
        guard.prune(now + Duration::seconds(301));
        assert!(guard.is_empty());
        assert!(guard.check_and_store("n1", now + Duration::seconds(301), 300));
    }
}
