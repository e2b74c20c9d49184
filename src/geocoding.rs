//! Provider plumbing for forward/reverse geocoding and suggestions.
//!
//! Everything here is pure: URL construction, response parsing, failure
//! classification, the retry policy, and the bounded geocode cache. The
//! actual HTTP traffic goes through the Http capability; `app::update`
//! stitches the two together.

use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{AppError, ErrorKind, ValidatedCoordinate};

/// Durable cache key. The whole cache travels as one serialized blob under
/// this single namespaced key; there is no partial-key API on the store.
pub const GEOCODE_CACHE_KEY: &str = "localeGeocodingCache";
pub const GEOCODE_CACHE_CAPACITY: usize = 256;

pub const GEOCODER_BASE_URL: &str = "https://nominatim.openstreetmap.org";
/// Descriptive client identifier; the provider's usage policy requires one.
pub const GEOCODER_CLIENT_IDENT: &str = "mercato/0.1 (hello@mercato.example)";

pub const SUGGESTION_LIMIT: usize = 5;
pub const REVERSE_ZOOM: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub client_ident: String,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: GEOCODER_BASE_URL.into(),
            client_ident: GEOCODER_CLIENT_IDENT.into(),
        }
    }
}

impl GeocoderConfig {
    pub fn forward_url(&self, query: &str) -> Result<String, GeocodeFailure> {
        self.search_url(query, 1)
    }

    pub fn suggest_url(&self, query: &str) -> Result<String, GeocodeFailure> {
        self.search_url(query, SUGGESTION_LIMIT as u32)
    }

    pub fn reverse_url(&self, point: ValidatedCoordinate) -> Result<String, GeocodeFailure> {
        let mut url = self.endpoint("reverse")?;
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("lat", &point.lat().to_string())
            .append_pair("lon", &point.lon().to_string())
            .append_pair("zoom", &REVERSE_ZOOM.to_string())
            .append_pair("addressdetails", "1");
        Ok(url.into())
    }

    fn search_url(&self, query: &str, limit: u32) -> Result<String, GeocodeFailure> {
        let mut url = self.endpoint("search")?;
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("q", query)
            .append_pair("limit", &limit.to_string());
        Ok(url.into())
    }

    fn endpoint(&self, path: &str) -> Result<Url, GeocodeFailure> {
        let base = self.base_url.trim_end_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(|e| GeocodeFailure::MalformedResponse {
            message: format!("invalid geocoder base URL: {e}"),
        })
    }
}

/// Why a geocoding call failed, classified for retry decisions and for the
/// user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GeocodeFailure {
    #[error("provider rate limited the request")]
    RateLimited,
    #[error("provider unavailable (status {status})")]
    ServiceUnavailable { status: u16 },
    #[error("network failure: {message}")]
    Network { message: String },
    #[error("request rejected (status {status})")]
    Rejected { status: u16 },
    #[error("malformed provider response: {message}")]
    MalformedResponse { message: String },
}

impl GeocodeFailure {
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            500..=599 => Self::ServiceUnavailable { status },
            400..=499 => Self::Rejected { status },
            _ => Self::MalformedResponse {
                message: format!("unexpected status {status}"),
            },
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServiceUnavailable { .. } | Self::Network { .. }
        )
    }
}

impl From<GeocodeFailure> for AppError {
    fn from(failure: GeocodeFailure) -> Self {
        let kind = match &failure {
            GeocodeFailure::RateLimited => ErrorKind::RateLimited,
            GeocodeFailure::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            GeocodeFailure::Network { .. } => ErrorKind::Network,
            GeocodeFailure::Rejected { .. } => ErrorKind::MalformedRequest,
            GeocodeFailure::MalformedResponse { .. } => ErrorKind::Geocoding,
        };
        AppError::new(kind, failure.to_string())
    }
}

/// Exponential backoff shared by all three provider operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows `attempt` (1-based).
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay_ms
            .saturating_mul(u64::from(self.multiplier).saturating_pow(exponent))
    }

    #[must_use]
    pub fn should_retry(&self, failure: &GeocodeFailure, attempt: u32) -> bool {
        failure.is_retryable() && attempt < self.max_attempts
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    pub lat: String,
    pub lon: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ReversePayload {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Best match for a forward search; `Ok(None)` means the provider answered
/// and found nothing.
pub fn parse_forward(body: &str) -> Result<Option<ValidatedCoordinate>, GeocodeFailure> {
    let hits: Vec<SearchHit> = serde_json::from_str(body).map_err(|e| malformed(&e))?;
    let Some(hit) = hits.into_iter().next() else {
        return Ok(None);
    };
    let lat: f64 = hit.lat.trim().parse().map_err(|e| malformed(&e))?;
    let lon: f64 = hit.lon.trim().parse().map_err(|e| malformed(&e))?;
    ValidatedCoordinate::new(lat, lon)
        .map(Some)
        .map_err(|e| malformed(&e))
}

pub fn parse_suggestions(body: &str) -> Result<Vec<String>, GeocodeFailure> {
    let hits: Vec<SearchHit> = serde_json::from_str(body).map_err(|e| malformed(&e))?;
    Ok(hits
        .into_iter()
        .map(|hit| hit.display_name)
        .filter(|name| !name.trim().is_empty())
        .take(SUGGESTION_LIMIT)
        .collect())
}

/// Human-readable address for a point. A successful response without an
/// address (the provider answers `{"error": ...}` for open water and the
/// like) degrades to a synthesized label rather than failing.
pub fn parse_reverse(body: &str, point: ValidatedCoordinate) -> Result<String, GeocodeFailure> {
    let payload: ReversePayload = serde_json::from_str(body).map_err(|e| malformed(&e))?;
    if payload.error.is_some() {
        return Ok(fallback_display_name(point));
    }
    match payload.display_name {
        Some(name) if !name.trim().is_empty() => Ok(name),
        _ => Ok(fallback_display_name(point)),
    }
}

#[must_use]
pub fn fallback_display_name(point: ValidatedCoordinate) -> String {
    format!("Location near {:.4}, {:.4}", point.lat(), point.lon())
}

/// Label used when a device fix resolves but no address can be fetched.
#[must_use]
pub fn coordinate_label(point: ValidatedCoordinate) -> String {
    format!("Lat: {:.4}, Lng: {:.4}", point.lat(), point.lon())
}

fn malformed(error: &impl std::fmt::Display) -> GeocodeFailure {
    GeocodeFailure::MalformedResponse {
        message: error.to_string(),
    }
}

#[must_use]
pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

/// Bounded LRU over normalized query text. `None` values are negative
/// entries: the provider confirmed there is no match, and we will not ask
/// again.
pub struct GeocodeCache {
    entries: LruCache<String, Option<ValidatedCoordinate>>,
}

impl GeocodeCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn lookup(&mut self, query: &str) -> Option<Option<ValidatedCoordinate>> {
        self.entries.get(&normalize_query(query)).copied()
    }

    pub fn store(&mut self, query: &str, value: Option<ValidatedCoordinate>) {
        self.entries.put(normalize_query(query), value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries oldest-first, so replaying them through `store` rebuilds the
    /// same recency order.
    #[must_use]
    pub fn to_entries(&self) -> Vec<(String, Option<ValidatedCoordinate>)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.clone(), *value))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_entries())
    }

    pub fn from_blob(capacity: usize, blob: &[u8]) -> Result<Self, serde_json::Error> {
        let entries: Vec<(String, Option<ValidatedCoordinate>)> = serde_json::from_slice(blob)?;
        let mut cache = Self::new(capacity);
        for (key, value) in entries {
            cache.entries.put(key, value);
        }
        Ok(cache)
    }
}

impl Default for GeocodeCache {
    fn default() -> Self {
        Self::new(GEOCODE_CACHE_CAPACITY)
    }
}
